//! Configuration management with validation and defaults
//!
//! Values come from built-in defaults, an optional TOML file, then `CLAW_*`
//! environment variables, in that order. The result is validated before any
//! engine is started.

use crate::errors::{ArcadeResult, ConfigurationError};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Complete service configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArcadeConfig {
    pub game: GameConfig,
    pub api: ApiConfig,
    pub hardware: HardwareConfig,
    pub storage: StorageConfig,
    pub settlement: SettlementConfig,
    pub monitoring: MonitoringConfig,
}

/// Turn timing and round schedule
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    pub turn_duration_secs: u64,
    pub inter_turn_delay_secs: u64,
    pub sync_period_secs: u64,
    /// How often the scheduler re-checks the slot
    pub scheduler_poll_ms: u64,
    /// Pause after a failed loop iteration
    pub error_backoff_ms: u64,
    /// Daily rollover hour, UTC
    pub round_boundary_hour_utc: u32,
    pub default_max_fee: u64,
    pub default_fee_growth: u64,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            turn_duration_secs: 30,
            inter_turn_delay_secs: 3,
            sync_period_secs: 15,
            scheduler_poll_ms: 1_000,
            error_backoff_ms: 1_000,
            round_boundary_hour_utc: 0,
            default_max_fee: 20,
            default_fee_growth: 50,
        }
    }
}

impl GameConfig {
    pub fn turn_duration(&self) -> Duration {
        Duration::from_secs(self.turn_duration_secs)
    }

    pub fn inter_turn_delay(&self) -> Duration {
        Duration::from_secs(self.inter_turn_delay_secs)
    }

    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.sync_period_secs)
    }

    pub fn scheduler_poll(&self) -> Duration {
        Duration::from_millis(self.scheduler_poll_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    /// Time a slot stays reserved after a turn starts
    pub fn turn_window(&self) -> Duration {
        self.turn_duration() + self.inter_turn_delay()
    }

    /// Grace given to an in-flight turn before a round closes
    pub fn rollover_grace(&self) -> Duration {
        self.turn_duration().mul_f64(1.5)
    }
}

/// HTTP / WebSocket listener
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            allowed_origins: vec!["*".to_string()],
            request_timeout_secs: 30,
        }
    }
}

/// Link to the physical machine controller
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub url: String,
    pub reconnect_delay_secs: u64,
    pub command_buffer: usize,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:5001/".to_string(),
            reconnect_delay_secs: 5,
            command_buffer: 64,
        }
    }
}

impl HardwareConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// Queue store location
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_directory: String,
    /// Whether to clear database on startup (testing only!)
    pub clear_on_start: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_directory: "./DB/claw_queue".to_string(),
            clear_on_start: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SettlementMode {
    /// In-process ledger, no chain access
    Simulated,
    /// Signing gateway over HTTP
    Gateway,
}

/// Settlement client and retry policy
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    pub mode: SettlementMode,
    pub gateway_url: Option<String>,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_factor: f64,
    pub request_timeout_secs: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            mode: SettlementMode::Simulated,
            gateway_url: None,
            max_attempts: 3,
            backoff_base_ms: 1_500,
            backoff_factor: 1.5,
            request_timeout_secs: 60,
        }
    }
}

impl SettlementConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: LogLevel,
    pub enable_metrics: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            enable_metrics: true,
        }
    }
}

/// Configuration loader with environment variable support
#[derive(Default)]
pub struct ConfigLoader {
    config_path: Option<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Set the configuration file path
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Load configuration from file and environment variables
    pub fn load(&self) -> ArcadeResult<ArcadeConfig> {
        let mut config = if let Some(ref path) = self.config_path {
            self.load_from_file(path)?
        } else {
            ArcadeConfig::default()
        };

        self.apply_env_overrides(&mut config)?;
        config.validate()?;

        Ok(config)
    }

    fn load_from_file(&self, path: &str) -> ArcadeResult<ArcadeConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to read {}: {}", path, e)))?;

        toml::from_str(&content)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to parse TOML: {}", e)).into())
    }

    fn apply_env_overrides(&self, config: &mut ArcadeConfig) -> ArcadeResult<()> {
        if let Ok(value) = env::var("CLAW_TURN_DURATION") {
            config.game.turn_duration_secs = parse_env("CLAW_TURN_DURATION", value)?;
        }
        if let Ok(value) = env::var("CLAW_INTER_TURN_DELAY") {
            config.game.inter_turn_delay_secs = parse_env("CLAW_INTER_TURN_DELAY", value)?;
        }
        if let Ok(value) = env::var("CLAW_SYNC_PERIOD") {
            config.game.sync_period_secs = parse_env("CLAW_SYNC_PERIOD", value)?;
        }
        if let Ok(value) = env::var("CLAW_DEFAULT_MAX_FEE") {
            config.game.default_max_fee = parse_env("CLAW_DEFAULT_MAX_FEE", value)?;
        }
        if let Ok(value) = env::var("CLAW_DEFAULT_FEE_GROWTH") {
            config.game.default_fee_growth = parse_env("CLAW_DEFAULT_FEE_GROWTH", value)?;
        }
        if let Ok(value) = env::var("CLAW_API_PORT") {
            config.api.port = parse_env("CLAW_API_PORT", value)?;
        }
        if let Ok(url) = env::var("CLAW_HARDWARE_URL") {
            config.hardware.url = url;
        }
        if let Ok(dir) = env::var("CLAW_DATA_DIR") {
            config.storage.data_directory = dir;
        }
        if let Ok(url) = env::var("CLAW_SETTLEMENT_URL") {
            config.settlement.gateway_url = Some(url);
            config.settlement.mode = SettlementMode::Gateway;
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self, config: &ArcadeConfig, path: &str) -> ArcadeResult<()> {
        let toml_string = toml::to_string_pretty(config)
            .map_err(|e| ConfigurationError::SaveFailed(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, toml_string)
            .map_err(|e| ConfigurationError::SaveFailed(format!("Failed to write to {}: {}", path, e)).into())
    }
}

fn parse_env<T: std::str::FromStr>(field: &str, value: String) -> ArcadeResult<T> {
    value.parse().map_err(|_| {
        ConfigurationError::InvalidValue {
            field: field.to_string(),
            value,
            reason: "Not a valid number".to_string(),
        }
        .into()
    })
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

impl ArcadeConfig {
    /// Validate configuration for logical consistency
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.game.turn_duration_secs == 0 {
            return Err(invalid("game.turn_duration_secs", 0, "Turn duration must be > 0"));
        }
        if self.game.sync_period_secs == 0 {
            return Err(invalid("game.sync_period_secs", 0, "Sync period must be > 0"));
        }
        if self.game.scheduler_poll_ms == 0 {
            return Err(invalid("game.scheduler_poll_ms", 0, "Poll interval must be > 0"));
        }
        if self.game.round_boundary_hour_utc > 23 {
            return Err(invalid(
                "game.round_boundary_hour_utc",
                self.game.round_boundary_hour_utc,
                "Hour must be within 0..=23",
            ));
        }
        if self.api.port == 0 {
            return Err(invalid("api.port", 0, "Port cannot be zero"));
        }
        if self.hardware.url.is_empty() {
            return Err(ConfigurationError::MissingRequired("hardware.url".to_string()));
        }
        if self.hardware.command_buffer == 0 {
            return Err(invalid("hardware.command_buffer", 0, "Buffer cannot be zero"));
        }
        if self.storage.data_directory.is_empty() {
            return Err(ConfigurationError::MissingRequired("storage.data_directory".to_string()));
        }
        if self.settlement.max_attempts == 0 {
            return Err(invalid("settlement.max_attempts", 0, "At least one attempt is required"));
        }
        if self.settlement.backoff_factor < 1.0 {
            return Err(invalid(
                "settlement.backoff_factor",
                self.settlement.backoff_factor,
                "Backoff must not shrink",
            ));
        }
        if self.settlement.mode == SettlementMode::Gateway
            && self.settlement.gateway_url.as_deref().map_or(true, str::is_empty)
        {
            return Err(ConfigurationError::MissingRequired("settlement.gateway_url".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = ArcadeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.game.turn_window(), Duration::from_secs(33));
    }

    #[test]
    fn test_rollover_grace_is_one_and_a_half_turns() {
        let config = ArcadeConfig::default();
        assert_eq!(config.game.rollover_grace(), Duration::from_secs(45));
    }

    #[test]
    fn test_gateway_mode_requires_url() {
        let mut config = ArcadeConfig::default();
        config.settlement.mode = SettlementMode::Gateway;
        assert!(config.validate().is_err());

        config.settlement.gateway_url = Some("http://127.0.0.1:9000".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_boundary_hour() {
        let mut config = ArcadeConfig::default();
        config.game.round_boundary_hour_utc = 24;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ArcadeConfig = toml::from_str(
            r#"
            [game]
            turn_duration_secs = 60

            [hardware]
            url = "ws://10.0.0.2:5001/"
            "#,
        )
        .unwrap();

        assert_eq!(config.game.turn_duration_secs, 60);
        assert_eq!(config.game.inter_turn_delay_secs, 3);
        assert_eq!(config.hardware.url, "ws://10.0.0.2:5001/");
        assert_eq!(config.api.port, 8000);
    }

    #[test]
    fn test_save_and_load_config() -> ArcadeResult<()> {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        let mut original = ArcadeConfig::default();
        original.game.sync_period_secs = 7;

        let loader = ConfigLoader::new();
        loader.save(&original, path)?;

        let loaded = ConfigLoader::new().with_path(path).load_from_file(path)?;
        assert_eq!(loaded.game.sync_period_secs, 7);
        assert_eq!(loaded.settlement.mode, SettlementMode::Simulated);

        Ok(())
    }
}
