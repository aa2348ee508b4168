//! Configuration for the control runtime.
//!
//! Loaded via `figment`: a TOML file merged with `ALD_`-prefixed environment
//! variable overrides (`ALD_MACHINE_ID`, `ALD_PLC_HOST`, ...), in the style
//! of the source project's V4 configuration layer. `Settings::validate`
//! rejects nonsensical values before the process starts serving, so
//! misconfiguration fails fast at startup rather than mid-run.

use crate::error::{CoreError, CoreResult};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// This runtime instance controls exactly one machine.
    pub machine_id: Uuid,
    pub log_level: String,
    pub datastore: DatastoreSettings,
    pub plc: PlcSettings,
    #[serde(default)]
    pub logger: LoggerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatastoreSettings {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

/// Connection mode for the PLC collaborator: `real` drives Modbus TCP
/// hardware, `simulation` runs an in-memory `SimulatedPlc` for development
/// and tests (the simulator's numeric fluctuation model is out of scope —
/// see spec.md §1 Non-goals).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlcMode {
    Real,
    Simulation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlcSettings {
    pub mode: PlcMode,
    #[serde(default = "default_plc_host")]
    pub host: String,
    #[serde(default = "default_plc_port")]
    pub port: u16,
    #[serde(default = "default_slave_id")]
    pub slave_id: u8,
    #[serde(default)]
    pub byte_order: ByteOrder,
}

fn default_plc_host() -> String {
    "127.0.0.1".to_string()
}

fn default_plc_port() -> u16 {
    502
}

fn default_slave_id() -> u8 {
    1
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    BigEndian,
    LittleEndian,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerSettings {
    /// Continuous Parameter Logger tick period, T in spec §4.F. Default 1s.
    pub period_ms: u64,
    /// Hard alert threshold for jitter, spec §4.F/§5.
    pub jitter_alert_ms: u64,
    /// Soft tolerance before a cycle is considered late, spec §4.F/§5.
    pub jitter_tolerance_ms: u64,
    /// Consecutive tick failures before the logger backs off.
    pub consecutive_error_limit: u32,
    /// Sleep duration after tripping `consecutive_error_limit`.
    pub backoff_secs: u64,
    /// Batch size for telemetry inserts.
    pub write_batch_size: usize,
    /// Bound on concurrent individual-parameter reads when a bulk-read
    /// group falls back to per-parameter reads (spec §4.F step 2, §5).
    pub max_workers: usize,
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            period_ms: 1_000,
            jitter_alert_ms: 50,
            jitter_tolerance_ms: 25,
            consecutive_error_limit: 3,
            backoff_secs: 10,
            write_batch_size: 100,
            max_workers: 4,
        }
    }
}

impl Settings {
    /// Load configuration from `config/ald_control.toml` and `ALD_`-prefixed
    /// environment overrides.
    pub fn load() -> CoreResult<Self> {
        Self::load_from("config/ald_control.toml")
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let settings: Settings = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("ALD_").split("_"))
            .extract()?;
        settings
            .validate()
            .map_err(CoreError::ValidationError)?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "invalid log_level '{}'. must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.datastore.url.is_empty() {
            return Err("datastore.url must not be empty".to_string());
        }
        if self.datastore.max_connections == 0 {
            return Err("datastore.max_connections must be at least 1".to_string());
        }

        if self.plc.mode == PlcMode::Real && self.plc.host.is_empty() {
            return Err("plc.host must not be empty when plc.mode = real".to_string());
        }

        if self.logger.period_ms == 0 {
            return Err("logger.period_ms must be positive".to_string());
        }
        if self.logger.jitter_tolerance_ms > self.logger.jitter_alert_ms {
            return Err(
                "logger.jitter_tolerance_ms must not exceed logger.jitter_alert_ms".to_string(),
            );
        }
        if self.logger.consecutive_error_limit == 0 {
            return Err("logger.consecutive_error_limit must be at least 1".to_string());
        }
        if self.logger.max_workers == 0 {
            return Err("logger.max_workers must be at least 1".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_settings() -> Settings {
        Settings {
            machine_id: Uuid::new_v4(),
            log_level: "info".to_string(),
            datastore: DatastoreSettings {
                url: "postgres://localhost/ald".to_string(),
                max_connections: 5,
            },
            plc: PlcSettings {
                mode: PlcMode::Simulation,
                host: "127.0.0.1".to_string(),
                port: 502,
                slave_id: 1,
                byte_order: ByteOrder::BigEndian,
            },
            logger: LoggerSettings::default(),
        }
    }

    #[test]
    fn default_settings_validate() {
        assert!(valid_settings().validate().is_ok());
    }

    #[test]
    fn rejects_invalid_log_level() {
        let mut settings = valid_settings();
        settings.log_level = "verbose".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_empty_datastore_url() {
        let mut settings = valid_settings();
        settings.datastore.url = String::new();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_real_plc_with_empty_host() {
        let mut settings = valid_settings();
        settings.plc.mode = PlcMode::Real;
        settings.plc.host = String::new();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_zero_period() {
        let mut settings = valid_settings();
        settings.logger.period_ms = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_tolerance_above_alert() {
        let mut settings = valid_settings();
        settings.logger.jitter_tolerance_ms = 100;
        settings.logger.jitter_alert_ms = 50;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_zero_max_workers() {
        let mut settings = valid_settings();
        settings.logger.max_workers = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn load_from_toml_with_env_override() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            machine_id = "00000000-0000-0000-0000-000000000001"
            log_level = "info"

            [datastore]
            url = "postgres://localhost/ald"

            [plc]
            mode = "simulation"
            "#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.plc.mode, PlcMode::Simulation);
        assert_eq!(settings.logger.period_ms, 1_000);
    }
}
