//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `moisture.toml`.
//!     loads configuration from file or falls back to defaults, then applies
//!     environment overrides (same names the deployment .env files use).
//!
//! structure:
//!     - MqttConfig: broker address, uplink topic filter, reconnect pacing.
//!     - Calibration: dry / wet reference points (validated on load).
//!     - ServerConfig: http bind address and CORS origins.
//!     - PushConfig: websocket auth mode and per-connection send limits.
//!     - StorageConfig: sqlite database location.
//!     - LoggingConfig: log level and per-reading verbosity.
//!
//! ==============================================================================

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::calibration::Calibration;
use crate::error::ConfigError;
use crate::push::{Authenticator, JwtVerifier};

/// Root configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct HostConfig {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub calibration: Calibration,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
    pub keep_alive_seconds: u64,
    pub reconnect_delay_seconds: u64,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// empty = permissive
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PushAuthMode {
    SharedSecret,
    IdentityToken,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PushConfig {
    pub auth: PushAuthMode,
    pub api_key: String,
    pub token_secret: Option<String>,
    pub send_timeout_ms: u64,
    pub outbox_capacity: usize,
    pub handoff_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// `sqlite:///relative.db`, `sqlite:////abs.db` or a bare path
    pub database_url: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_readings: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "127.0.0.1".to_string(),
            port: 1883,
            topic: "application/soilmoisture/device/+/rx".to_string(),
            client_id: "moisture-host".to_string(),
            keep_alive_seconds: 60,
            reconnect_delay_seconds: 2,
            username: None,
            password: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8000,
            allowed_origins: Vec::new(),
        }
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            auth: PushAuthMode::SharedSecret,
            api_key: "unauthorized".to_string(),
            token_secret: None,
            send_timeout_ms: 2000,
            outbox_capacity: 64,
            handoff_capacity: 256,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:///./moisture.db".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            show_readings: true,
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig::default(),
            calibration: Calibration::default(),
            server: ServerConfig::default(),
            push: PushConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl PushConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn authenticator(&self) -> Result<Authenticator, ConfigError> {
        match self.auth {
            PushAuthMode::SharedSecret => Ok(Authenticator::SharedSecret(self.api_key.clone())),
            PushAuthMode::IdentityToken => {
                let secret = self.token_secret.as_deref().ok_or_else(|| {
                    ConfigError::Invalid("push.token_secret is required for identity-token auth".into())
                })?;
                Ok(Authenticator::IdentityToken(Arc::new(JwtVerifier::new(
                    secret.as_bytes(),
                ))))
            }
        }
    }
}

impl HostConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load with default fallback, then env overrides, then validate.
    /// runs before logging is up, hence println
    pub fn load_or_default() -> Result<Self, ConfigError> {
        let paths = [
            std::path::PathBuf::from("config").join("moisture.toml"),
            std::path::PathBuf::from("..").join("config").join("moisture.toml"),
        ];

        let mut config = None;
        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(loaded) => {
                        println!("[CONFIG] Loaded from {}", path.display());
                        config = Some(loaded);
                        break;
                    }
                    Err(e) => {
                        println!("[CONFIG] Warning: Failed to load {}: {}", path.display(), e);
                    }
                }
            }
        }

        let mut config = config.unwrap_or_else(|| {
            println!("[CONFIG] Warning: No config file found - using defaults");
            Self::default()
        });
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// `lookup` is std::env::var in production, a map in tests
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MQTT_BROKER") {
            self.mqtt.broker = v;
        }
        if let Some(v) = lookup("MQTT_PORT") {
            self.mqtt.port = parse_override("MQTT_PORT", v)?;
        }
        if let Some(v) = lookup("MQTT_TOPIC") {
            self.mqtt.topic = v;
        }
        if let Some(v) = lookup("DATABASE_URL") {
            self.storage.database_url = v;
        }
        if let Some(v) = lookup("WS_API_KEY") {
            self.push.api_key = v;
        }
        if let Some(v) = lookup("BIND_PORT") {
            self.server.port = parse_override("BIND_PORT", v)?;
        }

        let dry = lookup("DRY_VALUE")
            .map(|v| parse_override("DRY_VALUE", v))
            .transpose()?;
        let wet = lookup("WET_VALUE")
            .map(|v| parse_override("WET_VALUE", v))
            .transpose()?;
        if dry.is_some() || wet.is_some() {
            self.calibration = Calibration::new(
                dry.unwrap_or(self.calibration.dry()),
                wet.unwrap_or(self.calibration.wet()),
            )?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.topic.trim().is_empty() {
            return Err(ConfigError::Invalid("mqtt.topic is empty".into()));
        }
        if self.push.send_timeout_ms == 0 {
            return Err(ConfigError::Invalid("push.send_timeout_ms must be > 0".into()));
        }
        if self.push.outbox_capacity == 0 || self.push.handoff_capacity == 0 {
            return Err(ConfigError::Invalid("push capacities must be > 0".into()));
        }
        if self.storage.database_url.trim().is_empty() {
            return Err(ConfigError::Invalid("storage.database_url is empty".into()));
        }
        self.push.authenticator().map(|_| ())
    }

    /// Log configuration summary
    pub fn print_summary(&self) {
        info!("┌─────────────────────────────────────────┐");
        info!("│           HOST CONFIGURATION            │");
        info!("├─────────────────────────────────────────┤");
        info!("│ Broker: {}:{}", self.mqtt.broker, self.mqtt.port);
        info!("│ Topic: {}", self.mqtt.topic);
        info!("│ Calibration: dry={} wet={}", self.calibration.dry(), self.calibration.wet());
        info!("│ Listen: {}:{}", self.server.bind, self.server.port);
        info!("│ Database: {}", self.storage.database_url);
        info!("│ Push auth: {:?}", self.push.auth);
        info!("│ Log Level: {}", self.logging.level);
        info!("└─────────────────────────────────────────┘");
    }
}

fn parse_override<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::BadOverride { key, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = HostConfig::default();
        config.validate().unwrap();
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.calibration.dry(), 12364.0);
    }

    #[test]
    fn shipped_config_file_is_valid() {
        let config = HostConfig::from_toml(include_str!("../config/moisture.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.allowed_origins.len(), 2);
        assert_eq!(config.push.api_key, "super_secret_api_key");
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let config = HostConfig::from_toml(
            r#"
            [mqtt]
            broker = "mqtt.example.org"
            topic = "sensor/moisture"

            [calibration]
            dry = 4000
            wet = 8000

            [push]
            api_key = "super_secret_api_key"
            "#,
        )
        .unwrap();
        assert_eq!(config.mqtt.broker, "mqtt.example.org");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.calibration.wet(), 8000.0);
        assert_eq!(config.push.api_key, "super_secret_api_key");
        assert_eq!(config.push.auth, PushAuthMode::SharedSecret);
        assert_eq!(config.storage.database_url, "sqlite:///./moisture.db");
    }

    #[test]
    fn equal_calibration_in_file_is_fatal() {
        let err = HostConfig::from_toml("[calibration]\ndry = 5000\nwet = 5000\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn env_overrides_win() {
        let mut config = HostConfig::default();
        config
            .apply_overrides(env(&[
                ("MQTT_BROKER", "10.0.0.5"),
                ("MQTT_PORT", "8883"),
                ("WS_API_KEY", "k"),
                ("DATABASE_URL", "sqlite:////var/lib/moisture/readings.db"),
                ("DRY_VALUE", "4000"),
                ("WET_VALUE", "8000"),
            ]))
            .unwrap();
        assert_eq!(config.mqtt.broker, "10.0.0.5");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.push.api_key, "k");
        assert_eq!(config.storage.database_url, "sqlite:////var/lib/moisture/readings.db");
        assert_eq!((config.calibration.dry(), config.calibration.wet()), (4000.0, 8000.0));
    }

    #[test]
    fn bad_overrides_are_rejected() {
        let mut config = HostConfig::default();
        let err = config.apply_overrides(env(&[("MQTT_PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ConfigError::BadOverride { key: "MQTT_PORT", .. }));

        // one override making the pair degenerate
        let err = config.apply_overrides(env(&[("WET_VALUE", "12364")])).unwrap_err();
        assert!(matches!(err, ConfigError::Calibration(_)));
    }

    #[test]
    fn identity_mode_needs_a_secret() {
        let mut config = HostConfig::from_toml("[push]\nauth = \"identity-token\"\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.push.token_secret = Some("signing-key".into());
        config.validate().unwrap();
        assert!(matches!(
            config.push.authenticator().unwrap(),
            Authenticator::IdentityToken(_)
        ));
    }

    #[test]
    fn zero_limits_are_rejected() {
        let mut config = HostConfig::default();
        config.push.send_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = HostConfig::default();
        config.mqtt.topic = " ".into();
        assert!(config.validate().is_err());
    }
}
