//! Constants and configuration defaults for Aquilo
//!
//! Centralizes all magic numbers, paths, and configuration defaults.
//! This is the SINGLE SOURCE OF TRUTH for all configuration values.
//! Never use magic numbers in other files - add them here first.

use std::time::Duration;

/// Scheduling and timeout defaults
pub mod timing {
    use super::*;

    /// Interval between scheduler ticks (poll -> evaluate -> apply)
    pub const TICK_INTERVAL: Duration = Duration::from_millis(1000);

    /// Minimum configurable tick interval
    pub const MIN_TICK_INTERVAL_MS: u64 = 100;

    /// Per-device I/O timeout; a device worker exceeding this is abandoned
    pub const DEVICE_IO_TIMEOUT: Duration = Duration::from_millis(500);

    /// How long a channel may go without a decision before fail-safe actuation
    pub const FAILSAFE_GRACE: Duration = Duration::from_secs(10);

    /// Bounded grace for draining in-flight device I/O at shutdown
    pub const SHUTDOWN_DRAIN: Duration = Duration::from_secs(3);

    /// Ticks between rediscovery sweeps for offline devices
    pub const REDISCOVER_EVERY_TICKS: u64 = 30;
}

/// Control algorithm parameters
pub mod control {
    /// Minimum duty change (percentage points) before a new decision is applied.
    /// Sub-threshold deltas are treated as no-ops to prevent actuator chatter.
    pub const DEFAULT_DEADBAND_PERCENT: f64 = 2.5;

    /// Maximum configurable dead-band
    pub const MAX_DEADBAND_PERCENT: f64 = 20.0;

    /// Consecutive device failures before Online/Degraded -> Offline
    pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

    /// Duty bounds (percent) used where a channel declares no tighter range
    pub const DUTY_MIN: f64 = 0.0;
    pub const DUTY_MAX: f64 = 100.0;

    /// Epsilon for floating-point duty/temperature comparisons
    pub const FLOAT_EPSILON: f64 = 0.001;
}

/// File size and shape limits
pub mod limits {
    /// Maximum profile store file size (1MB)
    pub const MAX_STORE_FILE_SIZE: u64 = 1024 * 1024;

    /// Maximum number of curve control points per profile
    pub const MAX_CURVE_POINTS: usize = 32;

    /// Maximum profile name length
    pub const MAX_NAME_LEN: usize = 128;

    /// Maximum valid temperature for curve points (°C)
    pub const MAX_CURVE_TEMPERATURE: f64 = 150.0;

    /// Minimum valid temperature for curve points (°C)
    pub const MIN_CURVE_TEMPERATURE: f64 = -50.0;

    /// Maximum manual override TTL in milliseconds (10 minutes)
    pub const MAX_OVERRIDE_TTL_MS: u64 = 10 * 60 * 1000;
}

/// Configuration file locations
pub mod paths {
    use std::path::PathBuf;

    /// Directory name under the user config dir
    pub const CONFIG_DIR_NAME: &str = "aquilo";

    /// Profile store file name
    pub const PROFILES_FILE: &str = "profiles.json";

    /// Daemon configuration file name
    pub const CONFIG_FILE: &str = "config.json";

    /// Resolve the user configuration directory.
    ///
    /// Prefers XDG_CONFIG_HOME, then HOME/.config, then the platform default.
    pub fn user_config_dir() -> Option<PathBuf> {
        let base = if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            Some(PathBuf::from(xdg))
        } else if let Ok(home) = std::env::var("HOME") {
            Some(PathBuf::from(home).join(".config"))
        } else {
            dirs::config_dir()
        };
        base.map(|p| p.join(CONFIG_DIR_NAME))
    }

    /// Path to the profile store file
    pub fn profiles_path() -> PathBuf {
        user_config_dir()
            .unwrap_or_else(|| PathBuf::from(".").join(CONFIG_DIR_NAME))
            .join(PROFILES_FILE)
    }
}
