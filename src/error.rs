//! ==============================================================================
//! error.rs - error taxonomy for the ingestion / fan-out pipeline
//! ==============================================================================
//!
//! purpose:
//!     one typed error per failure class. everything except
//!     CalibrationConfigError and ConfigError is per-message or per-connection:
//!     it gets logged and the pipeline moves on.
//!
//! relationships:
//!     - used by: decode.rs, calibration.rs, telemetry.rs, store.rs, push.rs, config.rs
//!
//! ==============================================================================

use thiserror::Error;

/// base64 payload could not be turned into a raw reading
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("base64 payload is empty")]
    Empty,
    #[error("invalid base64: {0}")]
    InvalidBase64(String),
    #[error("decoded payload has {0} significant bytes, more than fits in a u64")]
    TooWide(usize),
}

/// inbound broker message is malformed or incomplete
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("not structured: {0}")]
    NotStructured(String),
    #[error("missing device id")]
    MissingDeviceId,
    #[error("no usable raw value")]
    NoUsableRawValue(#[source] Option<DecodeError>),
}

/// degenerate calibration references, fatal at startup
#[derive(Debug, Clone, PartialEq, Error)]
#[error("calibration references must differ (dry = {dry}, wet = {wet})")]
pub struct CalibrationConfigError {
    pub dry: f64,
    pub wet: f64,
}

/// failure reported by the storage collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("storage error: {0}")]
pub struct StorageError(pub String);

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError(e.to_string())
    }
}

/// push-channel handshake did not pass the credential check
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeRejected {
    #[error("no credential offered")]
    MissingCredential,
    #[error("credential does not match")]
    BadCredential,
    #[error("identity token rejected: {0}")]
    InvalidIdentity(String),
}

/// a single connection could not take a broadcast frame
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("delivery to connection {connection_id} failed: {reason}")]
pub struct DeliveryFailure {
    pub connection_id: u64,
    pub reason: DeliveryFailureReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailureReason {
    Closed,
    TimedOut,
}

impl std::fmt::Display for DeliveryFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryFailureReason::Closed => f.write_str("connection closed"),
            DeliveryFailureReason::TimedOut => f.write_str("send timed out"),
        }
    }
}

/// configuration file or environment override is unusable
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value:?}")]
    BadOverride { key: &'static str, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error(transparent)]
    Calibration(#[from] CalibrationConfigError),
}
