//! Application configuration.
//!
//! Layered from built-in defaults, an optional TOML file and
//! `FORCETRACE_*` environment variables (`FORCETRACE_SERIAL__PORT`,
//! `FORCETRACE_NOISE__THRESHOLD`, ...). Command-line flags are applied on
//! top by the binary.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use forcetrace_acq::{
    CalibrationDegree, NoiseFilterConfig, ParserConfig, PipelineConfig, SerialConfig,
    MAX_READ_TIMEOUT,
};
use forcetrace_core::{Error, Result, DEFAULT_CHANNEL_COUNT};

/// Complete application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub serial: SerialSettings,
    pub acquisition: AcquisitionSettings,
    pub noise: NoiseFilterConfig,
    pub calibration: CalibrationSettings,
    pub output: OutputSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Device path of the sensor board
    pub port: String,

    pub baud_rate: u32,

    /// Port read timeout (milliseconds)
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionSettings {
    /// Channels per frame
    pub channels: usize,

    /// Bound on one transport read (milliseconds, at most 200)
    pub read_timeout_ms: u64,

    /// Live subscriber queue length
    pub broadcast_capacity: usize,

    /// Spacing of dropped-frame diagnostics (milliseconds)
    pub drop_log_interval_ms: u64,

    /// Status line period (milliseconds)
    pub status_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    /// Directory of `*_V<n>_calibration.csv` datasets
    pub dir: PathBuf,

    /// Polynomial degree, 1 or 2
    pub degree: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Directory receiving exported sessions
    pub dir: PathBuf,

    /// File name prefix; a timestamp is appended
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 9600,
            poll_interval_ms: 50,
        }
    }
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            channels: DEFAULT_CHANNEL_COUNT,
            read_timeout_ms: 100,
            broadcast_capacity: 1024,
            drop_log_interval_ms: 1000,
            status_interval_ms: 1000,
        }
    }
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("calibration"),
            degree: 2,
        }
    }
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            prefix: "force_readings".to_string(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load from an optional file plus `FORCETRACE_*` variables.
    ///
    /// Without an explicit path, `forcetrace.toml` in the working directory
    /// is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, "FORCETRACE")
    }

    fn load_with_prefix(path: Option<&Path>, prefix: &str) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("forcetrace").required(false),
        };

        let settings = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let config: Self = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.acquisition.channels == 0 {
            return Err(Error::Config("acquisition.channels must be at least 1".into()));
        }
        let max_ms = MAX_READ_TIMEOUT.as_millis() as u64;
        if !(1..=max_ms).contains(&self.acquisition.read_timeout_ms) {
            return Err(Error::Config(format!(
                "acquisition.read_timeout_ms must be within 1..={}",
                max_ms
            )));
        }
        if self.acquisition.status_interval_ms == 0 {
            return Err(Error::Config("acquisition.status_interval_ms must be > 0".into()));
        }
        if self.serial.poll_interval_ms == 0 {
            return Err(Error::Config("serial.poll_interval_ms must be > 0".into()));
        }
        if !(self.noise.threshold > 0.0) {
            return Err(Error::Config("noise.threshold must be > 0".into()));
        }
        if self.noise.median_window == 0 || self.noise.median_window % 2 == 0 {
            return Err(Error::Config("noise.median_window must be odd and >= 1".into()));
        }
        self.calibration_degree()?;
        Ok(())
    }

    pub fn calibration_degree(&self) -> Result<CalibrationDegree> {
        CalibrationDegree::from_degree(self.calibration.degree).ok_or_else(|| {
            Error::Config(format!(
                "calibration.degree must be 1 or 2, got {}",
                self.calibration.degree
            ))
        })
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            parser: ParserConfig::with_channels(self.acquisition.channels),
            noise: self.noise.clone(),
            read_timeout: Duration::from_millis(self.acquisition.read_timeout_ms),
            broadcast_capacity: self.acquisition.broadcast_capacity,
            drop_log_interval: Duration::from_millis(self.acquisition.drop_log_interval_ms),
        }
    }

    pub fn serial_config(&self) -> SerialConfig {
        SerialConfig {
            port: self.serial.port.clone(),
            baud_rate: self.serial.baud_rate,
            poll_interval: Duration::from_millis(self.serial.poll_interval_ms),
            ..SerialConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forcetrace_acq::HistoryPolicy;
    use std::fs;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.acquisition.channels, 4);
        assert_eq!(config.calibration_degree().unwrap(), CalibrationDegree::Quadratic);

        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.channel_count(), 4);
        assert!(pipeline.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forcetrace.toml");
        fs::write(
            &path,
            r#"
[serial]
port = "/dev/ttyACM0"

[acquisition]
channels = 2

[noise]
threshold = 1.8
history_policy = "every_frame"

[calibration]
degree = 1
"#,
        )
        .unwrap();

        let config = AppConfig::load_with_prefix(Some(&path), "FORCETRACE_TEST_FILE").unwrap();
        assert_eq!(config.serial.port, "/dev/ttyACM0");
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.acquisition.channels, 2);
        assert_eq!(config.noise.threshold, 1.8);
        assert_eq!(config.noise.history_policy, HistoryPolicy::EveryFrame);
        assert_eq!(config.noise.median_window, 3);
        assert_eq!(config.calibration_degree().unwrap(), CalibrationDegree::Linear);
    }

    #[test]
    fn test_environment_override() {
        std::env::set_var("FORCETRACE_ENVTEST_SERIAL__BAUD_RATE", "115200");
        std::env::set_var("FORCETRACE_ENVTEST_ACQUISITION__READ_TIMEOUT_MS", "150");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.toml");
        fs::write(&path, "").unwrap();

        let config = AppConfig::load_with_prefix(Some(&path), "FORCETRACE_ENVTEST").unwrap();
        assert_eq!(config.serial.baud_rate, 115200);
        assert_eq!(config.acquisition.read_timeout_ms, 150);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = AppConfig::default();
        config.acquisition.read_timeout_ms = 1000;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.calibration.degree = 3;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.noise.median_window = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(matches!(
            AppConfig::load_with_prefix(Some(&missing), "FORCETRACE_TEST_MISSING"),
            Err(Error::Config(_))
        ));
    }
}
