//! ==============================================================================
//! moisture_host - soil-moisture telemetry host
//! ==============================================================================
//!
//! pipeline:
//!
//!     broker ──> ingest (listener thread) ──> handoff ──> push registry ──> viewers
//!                  │  parse (telemetry, decode, calibration)
//!                  └─ store (device + reading)
//!
//! ==============================================================================

pub mod calibration;
pub mod config;
pub mod decode;
pub mod error;
pub mod handoff;
pub mod ingest;
pub mod push;
pub mod server;
pub mod store;
pub mod telemetry;

pub use calibration::Calibration;
pub use telemetry::{Reading, TelemetryParser};
