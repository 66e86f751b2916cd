//! Run configuration loaded with Figment.
//!
//! Sources, later ones winning:
//! 1. a TOML file (default `config/tracker.toml`)
//! 2. environment variables prefixed with `LABDRIVE_`, sections split on `__`
//!
//! ```no_run
//! use labdrive::config::AppConfig;
//!
//! let config = AppConfig::load_from("config/tracker.example.toml")?;
//! config.validate()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use labdrive_motion::{HandleConfig, KinematicParams, TrackerConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_PATH: &str = "config/tracker.toml";
pub const ENV_PREFIX: &str = "LABDRIVE_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Everything a tracking run needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub trajectory: TrajectoryConfig,
    #[serde(default)]
    pub drives: Vec<DriveDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    pub name: String,
    /// trace, debug, info, warn or error
    pub log_level: String,
    /// pretty, compact or json
    pub log_format: String,
    /// Directory of the CSV trajectory logs.
    pub log_dir: PathBuf,
    pub log_prefix: String,
    /// Optional traverse calibration file overriding every drive's
    /// `meter_per_rot`.
    pub calibration: Option<PathBuf>,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "labdrive".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            log_dir: PathBuf::from("logs"),
            log_prefix: "trajectory".to_string(),
            calibration: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrajectoryConfig {
    #[serde(flatten)]
    pub params: KinematicParams,
    /// Number of periods to run back to back.
    pub cycles: usize,
}

impl Default for TrajectoryConfig {
    fn default() -> Self {
        Self {
            params: KinematicParams::default(),
            cycles: 1,
        }
    }
}

/// One Modbus TCP motor drive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveDefinition {
    pub name: String,
    /// `host` or `host:port`
    pub address: String,
    #[serde(default = "default_unit")]
    pub unit: u8,
    /// Drives the camera-gate pin.
    #[serde(default)]
    pub master: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub handle: HandleConfig,
}

fn default_unit() -> u8 {
    1
}

fn default_enabled() -> bool {
    true
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_PATH)
    }

    /// Loads `path` and applies `LABDRIVE_` environment overrides, e.g.
    /// `LABDRIVE_TRACKER__SMOOTHING=4`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::figment(path.as_ref())
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))
    }

    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Checks everything a tracking run needs, drives included.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_settings()?;
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        let mut names = HashSet::new();
        for drive in &self.drives {
            if !names.insert(drive.name.as_str()) {
                return invalid(format!("duplicate drive name '{}'", drive.name));
            }
            if drive.address.trim().is_empty() {
                return invalid(format!("drive '{}' has no address", drive.name));
            }
        }
        let masters = self.enabled_drives().filter(|d| d.master).count();
        if masters != 1 {
            return invalid(format!(
                "exactly one enabled drive must be master, found {}",
                masters
            ));
        }
        Ok(())
    }

    /// Checks the logging, trajectory and tracker sections only; enough for
    /// planning without any drives.
    pub fn validate_settings(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        let level = self.application.log_level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return invalid(format!(
                "log_level '{}' must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            ));
        }
        if !LOG_FORMATS.contains(&self.application.log_format.as_str()) {
            return invalid(format!(
                "log_format '{}' must be one of: {}",
                self.application.log_format,
                LOG_FORMATS.join(", ")
            ));
        }

        let dt = self.trajectory.params.dt;
        if !(dt.is_finite() && dt > 0.0) {
            return invalid(format!("trajectory dt must be > 0, got {}", dt));
        }
        if self.trajectory.cycles == 0 {
            return invalid("trajectory cycles must be at least 1".to_string());
        }
        if let Err(e) = self.tracker.validate() {
            return invalid(e.to_string());
        }
        Ok(())
    }

    pub fn enabled_drives(&self) -> impl Iterator<Item = &DriveDefinition> {
        self.drives.iter().filter(|d| d.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    const SAMPLE: &str = r#"
        [application]
        log_level = "debug"

        [tracker]
        smoothing = 3.0

        [trajectory]
        v_down = 0.08
        cycles = 2

        [[drives]]
        name = "left"
        address = "10.0.0.11"
        master = true

        [[drives]]
        name = "right"
        address = "10.0.0.12:1502"
        unit = 2
        handle = { heartbeat_ms = 20 }
    "#;

    #[test]
    fn loads_file_with_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file("run.toml", SAMPLE)?;
            let config = AppConfig::load_from("run.toml").map_err(|e| e.to_string())?;

            assert_eq!(config.application.log_level, "debug");
            assert_eq!(config.application.log_format, "pretty");
            assert_eq!(config.tracker.smoothing, 3.0);
            assert_eq!(config.tracker.tolerance, TrackerConfig::default().tolerance);
            assert_eq!(config.trajectory.params.v_down, 0.08);
            assert_eq!(config.trajectory.params.dt, KinematicParams::default().dt);
            assert_eq!(config.trajectory.cycles, 2);
            assert_eq!(config.drives.len(), 2);
            assert_eq!(config.drives[0].unit, 1);
            assert_eq!(config.drives[1].unit, 2);
            assert_eq!(config.drives[1].handle.heartbeat_ms, 20);
            assert!(config.validate().is_ok());
            Ok(())
        });
    }

    #[test]
    fn environment_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("run.toml", SAMPLE)?;
            jail.set_env("LABDRIVE_TRACKER__SMOOTHING", "5.0");
            jail.set_env("LABDRIVE_APPLICATION__LOG_LEVEL", "warn");
            let config = AppConfig::load_from("run.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.tracker.smoothing, 5.0);
            assert_eq!(config.application.log_level, "warn");
            Ok(())
        });
    }

    fn valid() -> AppConfig {
        AppConfig {
            application: ApplicationConfig::default(),
            tracker: TrackerConfig::default(),
            trajectory: TrajectoryConfig::default(),
            drives: vec![
                DriveDefinition {
                    name: "a".to_string(),
                    address: "10.0.0.1".to_string(),
                    unit: 1,
                    master: true,
                    enabled: true,
                    handle: HandleConfig::default(),
                },
                DriveDefinition {
                    name: "b".to_string(),
                    address: "10.0.0.2".to_string(),
                    unit: 1,
                    master: false,
                    enabled: true,
                    handle: HandleConfig::default(),
                },
            ],
        }
    }

    #[test]
    fn validation_rejects_bad_settings() {
        assert!(valid().validate().is_ok());

        let mut config = valid();
        config.application.log_level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.drives[1].name = "a".to_string();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("duplicate"), "{}", err);

        let mut config = valid();
        config.drives[1].master = true;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.drives[0].enabled = false;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.trajectory.params.dt = 0.0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.tracker.smoothing = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn planning_settings_need_no_drives() {
        let mut config = valid();
        config.drives.clear();
        assert!(config.validate_settings().is_ok());
        assert!(config.validate().is_err());

        config.trajectory.cycles = 0;
        let err = config.validate_settings().unwrap_err().to_string();
        assert!(err.contains("cycles"), "{}", err);

        let mut config = valid();
        config.trajectory.params.dt = -0.25;
        assert!(config.validate_settings().is_err());

        let mut config = valid();
        config.tracker.envelope = 0.0;
        assert!(config.validate_settings().is_err());
    }
}
