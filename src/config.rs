//! Application settings using Figment
//!
//! Settings are loaded from:
//! 1. Built-in defaults
//! 2. `<config_dir>/gpib_daq/settings.toml` (missing file is fine)
//! 3. Environment variables prefixed with `GPIB_DAQ_`
//!
//! Nested keys use a double underscore, e.g. `GPIB_DAQ_POLICY__READ_TIMEOUT=2000`.
//!
//! # Example
//! ```no_run
//! use gpib_daq::config::Settings;
//!
//! let settings = Settings::load()?;
//! println!("Instrument: {}", settings.resource_name);
//! # Ok::<(), gpib_daq::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use crate::hardware::resource::ResourceAddress;
use crate::policy::SessionPolicy;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Resource used when none is configured.
pub const DEFAULT_RESOURCE: &str = "GPIB0::1::INSTR";

const ENV_PREFIX: &str = "GPIB_DAQ_";
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// User settings for one instrument station.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// VISA resource string of the instrument
    pub resource_name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Serial port of the GPIB-USB controller
    pub serial_port: String,
    /// Baud rate of the serial port
    pub baud_rate: u32,
    /// Default per-call I/O timeout of opened handles in milliseconds
    pub io_timeout_ms: u64,
    /// Retry and timeout overrides
    pub policy: SessionPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            resource_name: DEFAULT_RESOURCE.to_string(),
            log_level: "info".to_string(),
            serial_port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            io_timeout_ms: 5000,
            policy: SessionPolicy::default(),
        }
    }
}

impl Settings {
    /// Default location of the settings file.
    pub fn default_path() -> AppResult<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("gpib_daq").join("settings.toml"))
            .ok_or_else(|| DaqError::Configuration("no user configuration directory".into()))
    }

    /// Load settings from the default location and the environment
    pub fn load() -> AppResult<Self> {
        Self::load_from(Self::default_path()?)
    }

    /// Load settings from a specific file path and the environment
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Settings = Self::figment(path.as_ref()).extract()?;
        tracing::debug!(path = %path.as_ref().display(), resource = %settings.resource_name, "Loaded settings");
        Ok(settings)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Write settings to the default location
    pub fn save(&self) -> AppResult<()> {
        self.save_to(Self::default_path()?)
    }

    /// Write settings as TOML, creating the parent directory if needed
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self)
            .map_err(|e| DaqError::Configuration(format!("failed to serialize settings: {e}")))?;
        std::fs::write(path, text)?;
        tracing::info!(path = %path.display(), "Saved settings");
        Ok(())
    }

    /// Validate settings after loading
    pub fn validate(&self) -> AppResult<()> {
        self.resource_name.parse::<ResourceAddress>()?;

        if !VALID_LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        if self.io_timeout_ms == 0 {
            return Err(DaqError::Configuration("io_timeout_ms must be non-zero".into()));
        }

        self.policy.validate().map_err(DaqError::Configuration)
    }

    /// Default handle timeout.
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert_eq!(settings.resource_name, "GPIB0::1::INSTR");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        Jail::expect_with(|jail| {
            let settings = Settings::load_from(jail.directory().join("absent.toml"))
                .map_err(|e| e.to_string())?;
            assert_eq!(settings, Settings::default());
            Ok(())
        });
    }

    #[test]
    fn test_file_and_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "settings.toml",
                r#"
                resource_name = "GPIB0::22::INSTR"
                log_level = "debug"

                [policy]
                max_connect_attempts = 3
                read_timeout = 250
                "#,
            )?;
            jail.set_env("GPIB_DAQ_SERIAL_PORT", "/dev/ttyACM0");
            jail.set_env("GPIB_DAQ_POLICY__MAX_RECONNECTS", "1");

            let settings = Settings::load_from("settings.toml").map_err(|e| e.to_string())?;
            assert_eq!(settings.resource_name, "GPIB0::22::INSTR");
            assert_eq!(settings.log_level, "debug");
            assert_eq!(settings.serial_port, "/dev/ttyACM0");
            assert_eq!(settings.policy.max_connect_attempts, 3);
            assert_eq!(settings.policy.read_timeout, Duration::from_millis(250));
            assert_eq!(settings.policy.max_reconnects, 1);
            assert_eq!(settings.policy.settle_delay, Duration::from_millis(250));
            Ok(())
        });
    }

    #[test]
    fn test_malformed_file_is_error() {
        Jail::expect_with(|jail| {
            jail.create_file("settings.toml", "resource_name = [1, 2")?;
            assert!(matches!(
                Settings::load_from("settings.toml"),
                Err(DaqError::Config(_))
            ));
            Ok(())
        });
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.toml");
        let settings = Settings {
            resource_name: "TCPIP0::10.0.0.5::5025::SOCKET".into(),
            ..Default::default()
        };

        settings.save_to(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("TCPIP0::10.0.0.5::5025::SOCKET"));

        let loaded: Settings = toml::from_str(&text).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let bad_resource = Settings {
            resource_name: "not a resource".into(),
            ..Default::default()
        };
        assert!(matches!(
            bad_resource.validate(),
            Err(DaqError::InvalidResource(_))
        ));

        let bad_level = Settings {
            log_level: "verbose".into(),
            ..Default::default()
        };
        assert!(matches!(bad_level.validate(), Err(DaqError::Configuration(_))));

        let mut zero_budget = Settings::default();
        zero_budget.policy.max_consecutive_errors = 0;
        assert!(matches!(zero_budget.validate(), Err(DaqError::Configuration(_))));
    }
}
