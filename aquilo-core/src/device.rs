//! Core device model for Aquilo
//!
//! Devices, channels, lifecycle states, readings and snapshots. Devices and
//! channels are constructed at discovery time and are immutable afterwards
//! except for lifecycle state, which only the registry updates.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Stable device identifier (unique per attached device, survives restarts)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable channel identifier, formatted as `<device_id>/<channel_name>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build a channel id from its owning device and channel name
    pub fn for_device(device: &DeviceId, channel_name: &str) -> Self {
        Self(format!("{}/{}", device.0, channel_name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The owning device's id, if the id is well-formed
    pub fn device_id(&self) -> Option<DeviceId> {
        self.0.split_once('/').map(|(dev, _)| DeviceId::new(dev))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a channel can do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Read-only temperature input
    TemperatureSensor,
    /// Write-only fan or pump duty output
    FanOrPumpActuator,
    /// Channel that reports a value and accepts a duty (e.g. AIO pump)
    HybridSensorActuator,
}

/// Unit of a sensor channel's reported value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorUnit {
    Celsius,
    Rpm,
    Percent,
}

/// Supported duty range for an actuator channel (percent)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DutyRange {
    pub min: f64,
    pub max: f64,
}

impl DutyRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Full 0-100% range
    pub fn full() -> Self {
        Self { min: crate::constants::control::DUTY_MIN, max: crate::constants::control::DUTY_MAX }
    }

    /// Clamp a duty value into this range
    pub fn clamp(&self, duty: f64) -> f64 {
        duty.clamp(self.min, self.max)
    }

    pub fn contains(&self, duty: f64) -> bool {
        duty >= self.min && duty <= self.max
    }
}

/// Plausible value range and unit for a sensor channel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorRange {
    pub unit: SensorUnit,
    pub min: f64,
    pub max: f64,
}

impl SensorRange {
    pub fn celsius(min: f64, max: f64) -> Self {
        Self { unit: SensorUnit::Celsius, min, max }
    }

    pub fn plausible(&self, value: f64) -> bool {
        value.is_finite() && value >= self.min && value <= self.max
    }
}

/// One sensor or actuator endpoint exposed by a device.
///
/// Immutable once discovered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub label: Option<String>,
    pub kind: ChannelKind,
    /// Actuator capability; None for pure sensors
    pub duty_range: Option<DutyRange>,
    /// Sensor capability; None for pure actuators
    pub sensor_range: Option<SensorRange>,
}

impl Channel {
    pub fn is_sensor(&self) -> bool {
        matches!(
            self.kind,
            ChannelKind::TemperatureSensor | ChannelKind::HybridSensorActuator
        )
    }

    pub fn is_actuator(&self) -> bool {
        matches!(
            self.kind,
            ChannelKind::FanOrPumpActuator | ChannelKind::HybridSensorActuator
        )
    }

    /// Clamp a duty to this channel's supported range (full range if undeclared)
    pub fn clamp_duty(&self, duty: f64) -> f64 {
        self.duty_range.unwrap_or_else(DutyRange::full).clamp(duty)
    }
}

/// Device lifecycle state, owned by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LifecycleState {
    Online,
    /// One or more recent I/O failures, still below the offline threshold
    Degraded { failures: u32 },
    Offline,
}

impl LifecycleState {
    pub fn is_offline(&self) -> bool {
        matches!(self, LifecycleState::Offline)
    }

    /// Online or Degraded devices are still polled
    pub fn is_pollable(&self) -> bool {
        !self.is_offline()
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Online => f.write_str("online"),
            LifecycleState::Degraded { failures } => write!(f, "degraded({})", failures),
            LifecycleState::Offline => f.write_str("offline"),
        }
    }
}

/// A physical cooling device and its channels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    /// Vendor/model string as reported by the driver
    pub model: String,
    /// Driver family that owns this device (e.g. "sim")
    pub family: String,
    pub channels: Vec<Channel>,
    pub state: LifecycleState,
}

impl Device {
    pub fn channel(&self, id: &ChannelId) -> Option<&Channel> {
        self.channels.iter().find(|c| &c.id == id)
    }

    pub fn sensor_channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter().filter(|c| c.is_sensor())
    }

    pub fn actuator_channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter().filter(|c| c.is_actuator())
    }
}

/// The immutable set of all readings collected in one scheduling tick.
///
/// Published as a single value and swapped atomically; a partially built
/// snapshot is never observable. Channels whose device failed this tick are
/// simply absent (omission, not stale duplication).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// Strictly increasing tick sequence number
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub readings: HashMap<ChannelId, SensorReading>,
}

/// Value + capture time for one channel within a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub value: f64,
    pub timestamp_ms: u64,
}

impl Snapshot {
    pub fn reading(&self, channel: &ChannelId) -> Option<SensorReading> {
        self.readings.get(channel).copied()
    }

    pub fn value(&self, channel: &ChannelId) -> Option<f64> {
        self.readings.get(channel).map(|r| r.value)
    }
}

/// The last duty actually written to hardware for a channel.
///
/// Used for write deduplication and hysteresis; overwritten every successful
/// write, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub duty: f64,
    pub timestamp_ms: u64,
}

/// Milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fan_channel() -> Channel {
        Channel {
            id: ChannelId::new("dev0/fan1"),
            name: "fan1".to_string(),
            label: Some("Case Fan".to_string()),
            kind: ChannelKind::FanOrPumpActuator,
            duty_range: Some(DutyRange::new(20.0, 100.0)),
            sensor_range: None,
        }
    }

    #[test]
    fn test_channel_id_device_part() {
        let id = ChannelId::for_device(&DeviceId::new("pump0"), "flow");
        assert_eq!(id.as_str(), "pump0/flow");
        assert_eq!(id.device_id(), Some(DeviceId::new("pump0")));
    }

    #[test]
    fn test_clamp_duty_respects_channel_range() {
        let ch = fan_channel();
        assert_eq!(ch.clamp_duty(10.0), 20.0);
        assert_eq!(ch.clamp_duty(150.0), 100.0);
        assert_eq!(ch.clamp_duty(55.0), 55.0);
    }

    #[test]
    fn test_clamp_is_idempotent() {
        let ch = fan_channel();
        for duty in [-10.0, 0.0, 19.9, 20.0, 63.0, 100.0, 240.0] {
            let once = ch.clamp_duty(duty);
            assert_eq!(ch.clamp_duty(once), once);
        }
    }

    #[test]
    fn test_lifecycle_pollable() {
        assert!(LifecycleState::Online.is_pollable());
        assert!(LifecycleState::Degraded { failures: 2 }.is_pollable());
        assert!(!LifecycleState::Offline.is_pollable());
    }
}
