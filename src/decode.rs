//! ==============================================================================
//! decode.rs - base64 uplink payload -> raw sensor value
//! ==============================================================================
//!
//! purpose:
//!     lorawan network servers forward the sensor frame as base64. the bytes
//!     are one big-endian unsigned number of whatever width the probe sends.
//!
//! relationships:
//!     - used by: telemetry.rs (fallback when no numeric raw_value is present)
//!
//! ==============================================================================

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;

use crate::error::DecodeError;

// standard alphabet; some gateways strip the trailing '=' or leave junk in
// the unused low bits of the last symbol
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// decode a base64 payload into its big-endian unsigned value
pub fn decode(b64: &str) -> Result<u64, DecodeError> {
    let b64 = b64.trim();
    if b64.is_empty() {
        return Err(DecodeError::Empty);
    }

    let bytes = PAYLOAD_ENGINE
        .decode(b64)
        .map_err(|e| DecodeError::InvalidBase64(e.to_string()))?;

    // leading zero bytes don't count against the width
    let significant = match bytes.iter().position(|b| *b != 0) {
        Some(first) => &bytes[first..],
        None => return Ok(0),
    };
    if significant.len() > std::mem::size_of::<u64>() {
        return Err(DecodeError::TooWide(significant.len()));
    }

    Ok(significant
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}
