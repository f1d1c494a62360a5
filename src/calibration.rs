//! ==============================================================================
//! calibration.rs - raw probe value -> moisture percentage
//! ==============================================================================
//!
//! purpose:
//!     two reference points define the mapping: `dry` is 0%, `wet` is 100%.
//!     capacitive probes usually read LOWER when wetter, so dry > wet is the
//!     common setup, but the direction is deployment config. the formula
//!     normalises either way and clamps into [0, 100].
//!
//! relationships:
//!     - used by: telemetry.rs (every parsed reading)
//!     - built by: config.rs (validated once at startup)
//!
//! ==============================================================================

use serde::{Deserialize, Serialize};

use crate::error::CalibrationConfigError;

/// validated pair of reference points. `dry != wet` is guaranteed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCalibration")]
pub struct Calibration {
    dry: f64,
    wet: f64,
}

#[derive(Deserialize)]
struct RawCalibration {
    dry: f64,
    wet: f64,
}

impl TryFrom<RawCalibration> for Calibration {
    type Error = CalibrationConfigError;

    fn try_from(raw: RawCalibration) -> Result<Self, Self::Error> {
        Calibration::new(raw.dry, raw.wet)
    }
}

impl Default for Calibration {
    /// field-calibrated capacitive probe, reads lower when wetter
    fn default() -> Self {
        Self {
            dry: 12364.0,
            wet: 10656.0,
        }
    }
}

impl Calibration {
    pub fn new(dry: f64, wet: f64) -> Result<Self, CalibrationConfigError> {
        if dry == wet || !(dry - wet).is_finite() {
            return Err(CalibrationConfigError { dry, wet });
        }
        Ok(Self { dry, wet })
    }

    pub fn dry(&self) -> f64 {
        self.dry
    }

    pub fn wet(&self) -> f64 {
        self.wet
    }

    pub fn to_percentage(&self, raw: u64) -> f64 {
        to_percentage(raw as f64, self.dry, self.wet)
    }
}

/// map `raw` onto [0, 100] where `dry` -> 0 and `wet` -> 100.
///
/// callers must have rejected `dry == wet` up front (see [`Calibration::new`]).
pub fn to_percentage(raw: f64, dry: f64, wet: f64) -> f64 {
    debug_assert!(dry != wet, "degenerate calibration reached the hot path");
    let fraction = (dry - raw) / (dry - wet);
    fraction.clamp(0.0, 1.0) * 100.0
}
