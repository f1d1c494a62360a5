//! ==============================================================================
//! telemetry.rs - inbound uplink payload -> canonical Reading
//! ==============================================================================
//!
//! purpose:
//!     validates one broker message and normalises it. pure transformation,
//!     no i/o: storage and fan-out happen in ingest.rs.
//!
//! payload shape (json):
//!
//!     {
//!       "devEUI": "f0a1b2c3d4e5f678",        required (aliases: dev_eui, device_id)
//!       "raw_value": 11656,                  integer, preferred when present
//!       "data": "LYg=",                      base64 bytes, used otherwise
//!       "timestamp": 1764288000,             optional, epoch seconds (utc)
//!       "location": { "latitude": 47.6, "longitude": -122.3 }   optional
//!     }
//!
//! relationships:
//!     - uses: decode.rs, calibration.rs
//!     - used by: ingest.rs
//!
//! ==============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::calibration::Calibration;
use crate::decode;
use crate::error::ParseError;

const DEVICE_ID_FIELDS: [&str; 3] = ["devEUI", "dev_eui", "device_id"];

/// one telemetry observation. immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub device_id: String,
    pub observed_at: DateTime<Utc>,
    pub raw_value: u64,
    /// always `calibration.to_percentage(raw_value)`, never set independently
    pub moisture_pct: f64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// turns broker payloads into readings using the process-wide calibration
#[derive(Debug, Clone, Copy)]
pub struct TelemetryParser {
    calibration: Calibration,
}

impl TelemetryParser {
    pub fn new(calibration: Calibration) -> Self {
        Self { calibration }
    }

    pub fn calibration(&self) -> Calibration {
        self.calibration
    }

    pub fn parse(&self, payload: &[u8]) -> Result<Reading, ParseError> {
        self.parse_at(payload, Utc::now())
    }

    /// same as [`parse`](Self::parse) with an explicit "now" for the timestamp default
    pub fn parse_at(&self, payload: &[u8], now: DateTime<Utc>) -> Result<Reading, ParseError> {
        let fields = match serde_json::from_slice::<Value>(payload) {
            Ok(Value::Object(fields)) => fields,
            Ok(other) => {
                return Err(ParseError::NotStructured(format!(
                    "expected an object, got {}",
                    json_kind(&other)
                )))
            }
            Err(e) => return Err(ParseError::NotStructured(e.to_string())),
        };

        let device_id = DEVICE_ID_FIELDS
            .iter()
            .find_map(|key| fields.get(*key).and_then(Value::as_str))
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(ParseError::MissingDeviceId)?
            .to_string();

        let raw_value = resolve_raw_value(&fields)?;
        let observed_at = resolve_timestamp(&fields).unwrap_or(now);
        let (latitude, longitude) = resolve_location(&fields);

        Ok(Reading {
            device_id,
            observed_at,
            raw_value,
            moisture_pct: self.calibration.to_percentage(raw_value),
            latitude,
            longitude,
        })
    }
}

// integer raw_value wins; otherwise fall back to the base64 `data` field
fn resolve_raw_value(fields: &Map<String, Value>) -> Result<u64, ParseError> {
    if let Some(raw) = fields.get("raw_value").and_then(Value::as_u64) {
        return Ok(raw);
    }

    match fields.get("data").and_then(Value::as_str) {
        Some(b64) => decode::decode(b64).map_err(|e| ParseError::NoUsableRawValue(Some(e))),
        None => Err(ParseError::NoUsableRawValue(None)),
    }
}

fn resolve_timestamp(fields: &Map<String, Value>) -> Option<DateTime<Utc>> {
    let ts = fields.get("timestamp")?;
    if let Some(secs) = ts.as_i64() {
        return DateTime::from_timestamp(secs, 0);
    }
    let secs = ts.as_f64()?;
    if !secs.is_finite() {
        return None;
    }
    DateTime::from_timestamp_millis((secs * 1000.0) as i64)
}

fn resolve_location(fields: &Map<String, Value>) -> (Option<f64>, Option<f64>) {
    match fields.get("location").and_then(Value::as_object) {
        Some(loc) => (
            loc.get("latitude").and_then(Value::as_f64),
            loc.get("longitude").and_then(Value::as_f64),
        ),
        None => (None, None),
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
