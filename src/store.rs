//! ==============================================================================
//! store.rs - storage collaborator (device registry + reading history)
//! ==============================================================================
//!
//! purpose:
//!     the ingestion pipeline only needs two things from storage: "make sure
//!     this device exists" and "persist this reading". the read side is for
//!     the http api and the health probe.
//!
//!     readings are append-only: nothing here updates or deletes a stored row.
//!
//! schema:
//!
//!     CREATE TABLE devices (
//!         dev_eui          TEXT PRIMARY KEY,
//!         nickname         TEXT NOT NULL,
//!         status           TEXT NOT NULL,
//!         registered_at_ms INTEGER NOT NULL
//!     );
//!     CREATE TABLE sensor_readings (
//!         id           INTEGER PRIMARY KEY AUTOINCREMENT,
//!         dev_eui      TEXT NOT NULL,
//!         timestamp_ms INTEGER NOT NULL,
//!         raw_value    INTEGER NOT NULL,
//!         moisture_pct REAL NOT NULL,
//!         latitude     REAL,
//!         longitude    REAL
//!     );
//!
//! relationships:
//!     - used by: ingest.rs (write path), server.rs (read path, health)
//!
//! ==============================================================================

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::info;

use crate::error::StorageError;
use crate::telemetry::Reading;

pub trait ReadingStore: Send + Sync {
    /// idempotent upsert. Ok(true) when the device was unseen and got registered.
    fn ensure_device(&self, device_id: &str) -> Result<bool, StorageError>;

    fn store_reading(&self, reading: &Reading) -> Result<(), StorageError>;

    /// cheap liveness probe for /system/status
    fn check(&self) -> Result<(), StorageError>;

    fn devices(&self) -> Result<Vec<Device>, StorageError>;

    fn latest(&self, device_id: &str) -> Result<Option<Reading>, StorageError>;

    /// newest first
    fn recent(&self, device_id: &str, limit: usize) -> Result<Vec<Reading>, StorageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Active,
}

impl DeviceStatus {
    fn as_str(self) -> &'static str {
        match self {
            DeviceStatus::Active => "active",
        }
    }
}

impl FromSql for DeviceStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "active" => Ok(DeviceStatus::Active),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub dev_eui: String,
    pub nickname: String,
    pub status: DeviceStatus,
    pub registered_at: DateTime<Utc>,
}

/// accepts `sqlite:///relative.db`, `sqlite:////abs/path.db`, `sqlite://path.db`
/// or a bare path. `:memory:` opens a private in-memory database.
pub fn database_path(url: &str) -> &str {
    url.strip_prefix("sqlite:///")
        .or_else(|| url.strip_prefix("sqlite://"))
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url)
}

/// SQLite-backed store. rusqlite's Connection is not Sync, hence the mutex.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(database_url: &str) -> Result<Self, StorageError> {
        let path = database_path(database_url);
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)
                .map_err(|e| StorageError(format!("failed to open {}: {}", path, e)))?
        };
        let store = Self::with_connection(conn)?;
        info!(path, "reading store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS devices (
                dev_eui TEXT PRIMARY KEY,
                nickname TEXT NOT NULL,
                status TEXT NOT NULL,
                registered_at_ms INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sensor_readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                dev_eui TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                raw_value INTEGER NOT NULL,
                moisture_pct REAL NOT NULL,
                latitude REAL,
                longitude REAL
            );
            CREATE INDEX IF NOT EXISTS idx_readings_device_time
                ON sensor_readings(dev_eui, timestamp_ms);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_reading(row: &rusqlite::Row) -> rusqlite::Result<Reading> {
        let raw: i64 = row.get(2)?;
        Ok(Reading {
            device_id: row.get(0)?,
            observed_at: millis_to_utc(1, row.get(1)?)?,
            raw_value: u64::try_from(raw).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(2, raw))?,
            moisture_pct: row.get(3)?,
            latitude: row.get(4)?,
            longitude: row.get(5)?,
        })
    }
}

fn millis_to_utc(column: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(column, ms))
}

const READING_COLUMNS: &str = "dev_eui, timestamp_ms, raw_value, moisture_pct, latitude, longitude";

impl ReadingStore for SqliteStore {
    fn ensure_device(&self, device_id: &str) -> Result<bool, StorageError> {
        let inserted = self.conn.lock().execute(
            "INSERT OR IGNORE INTO devices (dev_eui, nickname, status, registered_at_ms)
             VALUES (?1, ?1, ?2, ?3)",
            params![device_id, DeviceStatus::Active.as_str(), Utc::now().timestamp_millis()],
        )?;
        Ok(inserted == 1)
    }

    fn store_reading(&self, reading: &Reading) -> Result<(), StorageError> {
        let raw = i64::try_from(reading.raw_value)
            .map_err(|_| StorageError(format!("raw value {} exceeds column range", reading.raw_value)))?;
        self.conn.lock().execute(
            "INSERT INTO sensor_readings (dev_eui, timestamp_ms, raw_value, moisture_pct, latitude, longitude)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                reading.device_id,
                reading.observed_at.timestamp_millis(),
                raw,
                reading.moisture_pct,
                reading.latitude,
                reading.longitude,
            ],
        )?;
        Ok(())
    }

    fn check(&self) -> Result<(), StorageError> {
        self.conn
            .lock()
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    fn devices(&self) -> Result<Vec<Device>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT dev_eui, nickname, status, registered_at_ms FROM devices ORDER BY dev_eui",
        )?;
        let devices = stmt
            .query_map([], |row| {
                Ok(Device {
                    dev_eui: row.get(0)?,
                    nickname: row.get(1)?,
                    status: row.get(2)?,
                    registered_at: millis_to_utc(3, row.get(3)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(devices)
    }

    fn latest(&self, device_id: &str) -> Result<Option<Reading>, StorageError> {
        let reading = self
            .conn
            .lock()
            .query_row(
                &format!(
                    "SELECT {} FROM sensor_readings WHERE dev_eui = ?1
                     ORDER BY timestamp_ms DESC, id DESC LIMIT 1",
                    READING_COLUMNS
                ),
                [device_id],
                Self::row_to_reading,
            )
            .optional()?;
        Ok(reading)
    }

    fn recent(&self, device_id: &str, limit: usize) -> Result<Vec<Reading>, StorageError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sensor_readings WHERE dev_eui = ?1
             ORDER BY timestamp_ms DESC, id DESC LIMIT ?2",
            READING_COLUMNS
        ))?;
        let readings = stmt
            .query_map(params![device_id, limit], Self::row_to_reading)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(readings)
    }
}
