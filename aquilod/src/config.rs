//! Daemon configuration
//!
//! All control parameters (tick cadence, timeouts, dead-band, fail-safe
//! policy) are configuration with engineering defaults rather than
//! hard-coded values. Loaded from a single JSON file; every field has a
//! default so a missing or partial file still yields a working daemon.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use aquilo_core::constants::{control, limits, paths, timing};
use aquilo_core::sim::SimDeviceSpec;
use aquilo_error::{AquiloError, Result};

/// What duty to command when control of a channel is lost
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum FailSafePolicy {
    /// The channel's capability maximum (maximum cooling)
    Max,
    /// A fixed duty percentage, clamped to the channel's range
    Fixed { duty: f64 },
}

impl FailSafePolicy {
    /// Resolve the fail-safe duty for a channel
    pub fn duty_for(&self, channel: &aquilo_core::Channel) -> f64 {
        match self {
            FailSafePolicy::Max => channel
                .duty_range
                .unwrap_or_else(aquilo_core::DutyRange::full)
                .max,
            FailSafePolicy::Fixed { duty } => channel.clamp_duty(*duty),
        }
    }
}

/// One simulated device entry in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimDeviceConfig {
    pub id: String,
    #[serde(default = "default_sim_model")]
    pub model: String,
    #[serde(default = "default_fan_count")]
    pub fans: u8,
    #[serde(default = "default_true")]
    pub pump: bool,
    #[serde(default = "default_base_temp")]
    pub base_temp: f64,
}

fn default_sim_model() -> String {
    "Aquilo Simulated AIO".to_string()
}

fn default_fan_count() -> u8 {
    2
}

fn default_true() -> bool {
    true
}

fn default_base_temp() -> f64 {
    34.0
}

impl From<&SimDeviceConfig> for SimDeviceSpec {
    fn from(config: &SimDeviceConfig) -> Self {
        SimDeviceSpec {
            id: config.id.clone(),
            model: config.model.clone(),
            fan_count: config.fans,
            with_pump: config.pump,
            base_temp: config.base_temp,
            fail_init: false,
        }
    }
}

/// Daemon configuration, deserialized from config.json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Scheduler tick interval in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Per-device I/O timeout in milliseconds
    #[serde(default = "default_io_timeout_ms")]
    pub device_io_timeout_ms: u64,

    /// Hysteresis dead-band in duty percentage points
    #[serde(default = "default_deadband")]
    pub deadband_percent: f64,

    /// Grace period before fail-safe actuation, in milliseconds
    #[serde(default = "default_failsafe_grace_ms")]
    pub failsafe_grace_ms: u64,

    /// Fail-safe duty policy
    #[serde(default = "default_failsafe_policy")]
    pub failsafe: FailSafePolicy,

    /// Consecutive I/O failures before a device goes Offline
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Ticks between rediscovery sweeps (0 disables periodic rediscovery)
    #[serde(default = "default_rediscover_ticks")]
    pub rediscover_every_ticks: u64,

    /// Unix socket path; auto-detected per OS when unset
    #[serde(default)]
    pub socket_path: Option<String>,

    /// Simulated devices to expose (empty = none)
    #[serde(default = "default_sim_devices")]
    pub sim_devices: Vec<SimDeviceConfig>,
}

fn default_tick_interval_ms() -> u64 {
    timing::TICK_INTERVAL.as_millis() as u64
}

fn default_io_timeout_ms() -> u64 {
    timing::DEVICE_IO_TIMEOUT.as_millis() as u64
}

fn default_deadband() -> f64 {
    control::DEFAULT_DEADBAND_PERCENT
}

fn default_failsafe_grace_ms() -> u64 {
    timing::FAILSAFE_GRACE.as_millis() as u64
}

fn default_failsafe_policy() -> FailSafePolicy {
    FailSafePolicy::Max
}

fn default_failure_threshold() -> u32 {
    control::DEFAULT_FAILURE_THRESHOLD
}

fn default_rediscover_ticks() -> u64 {
    timing::REDISCOVER_EVERY_TICKS
}

fn default_sim_devices() -> Vec<SimDeviceConfig> {
    vec![SimDeviceConfig {
        id: "sim0".to_string(),
        model: default_sim_model(),
        fans: default_fan_count(),
        pump: true,
        base_temp: default_base_temp(),
    }]
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            device_io_timeout_ms: default_io_timeout_ms(),
            deadband_percent: default_deadband(),
            failsafe_grace_ms: default_failsafe_grace_ms(),
            failsafe: default_failsafe_policy(),
            failure_threshold: default_failure_threshold(),
            rediscover_every_ticks: default_rediscover_ticks(),
            socket_path: None,
            sim_devices: default_sim_devices(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a file, falling back to defaults if absent
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let metadata = std::fs::metadata(path)?;
        if metadata.len() > limits::MAX_STORE_FILE_SIZE {
            return Err(AquiloError::FileTooLarge {
                path: path.to_path_buf(),
                size: metadata.len(),
                max_size: limits::MAX_STORE_FILE_SIZE,
            });
        }

        let contents = std::fs::read_to_string(path).map_err(|e| AquiloError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Default config file location
    pub fn default_path() -> PathBuf {
        paths::user_config_dir()
            .unwrap_or_else(|| PathBuf::from(".").join(paths::CONFIG_DIR_NAME))
            .join(paths::CONFIG_FILE)
    }

    fn validate(&self) -> Result<()> {
        if self.tick_interval_ms < timing::MIN_TICK_INTERVAL_MS {
            return Err(AquiloError::config(format!(
                "tick_interval_ms must be at least {}",
                timing::MIN_TICK_INTERVAL_MS
            )));
        }
        if self.deadband_percent < 0.0 || self.deadband_percent > control::MAX_DEADBAND_PERCENT {
            return Err(AquiloError::config(format!(
                "deadband_percent must be 0-{}",
                control::MAX_DEADBAND_PERCENT
            )));
        }
        if self.failure_threshold == 0 {
            return Err(AquiloError::config("failure_threshold must be at least 1"));
        }
        if let FailSafePolicy::Fixed { duty } = self.failsafe {
            aquilo_core::validate_duty(duty)
                .map_err(|_| AquiloError::config("failsafe fixed duty must be 0-100"))?;
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn device_io_timeout(&self) -> Duration {
        Duration::from_millis(self.device_io_timeout_ms)
    }

    pub fn failsafe_grace(&self) -> Duration {
        Duration::from_millis(self.failsafe_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.tick_interval_ms, 1000);
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.failsafe, FailSafePolicy::Max);
        assert_eq!(config.sim_devices.len(), 1);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"tick_interval_ms": 250}"#).unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.tick_interval_ms, 250);
        assert_eq!(config.deadband_percent, 2.5);
    }

    #[test]
    fn test_invalid_tick_interval_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"tick_interval_ms": 10}"#).unwrap();
        assert!(DaemonConfig::load(&path).is_err());
    }

    #[test]
    fn test_failsafe_policy_resolution() {
        use aquilo_core::{Channel, ChannelId, ChannelKind, DutyRange};
        let channel = Channel {
            id: ChannelId::new("dev0/fan1"),
            name: "fan1".to_string(),
            label: None,
            kind: ChannelKind::FanOrPumpActuator,
            duty_range: Some(DutyRange::new(20.0, 90.0)),
            sensor_range: None,
        };
        assert_eq!(FailSafePolicy::Max.duty_for(&channel), 90.0);
        assert_eq!(FailSafePolicy::Fixed { duty: 50.0 }.duty_for(&channel), 50.0);
        assert_eq!(FailSafePolicy::Fixed { duty: 5.0 }.duty_for(&channel), 20.0);
    }
}
