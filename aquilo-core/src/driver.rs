//! Capability-polymorphic device driver abstraction
//!
//! One driver instance talks to one physical device over whatever transport
//! its family uses (USB/HID, SMBus, sysfs, ...). Drivers are **blocking** and
//! **not** assumed thread-safe: the registry owns each instance exclusively
//! and serializes all access to it. Hardware families plug in by implementing
//! [`DeviceDriver`] plus a [`DriverFactory`] and registering the factory - no
//! inheritance, selection is keyed by detected device identity.

use crate::device::{Channel, ChannelId, Device, DeviceId, LifecycleState};
use aquilo_error::{AquiloError, Result};

/// Raw access to one physical device.
///
/// Channel arguments are the device-local channel names (e.g. `fan1`); the
/// registry maps them to global [`ChannelId`]s. Methods block - callers run
/// them on a blocking-capable thread and enforce their own timeouts.
pub trait DeviceDriver: Send {
    /// Read the current value of a sensor-capable channel
    fn read(&mut self, channel: &str) -> Result<f64>;

    /// Write a duty percentage to an actuator channel
    fn write(&mut self, channel: &str, duty: f64) -> Result<()>;

    /// The channels this device exposes, with their capability ranges.
    ///
    /// Captured once at discovery; channels are immutable afterwards.
    fn capabilities(&self) -> Vec<ChannelSpec>;
}

/// Driver-reported description of one channel, before registry naming
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    pub name: String,
    pub label: Option<String>,
    pub kind: crate::device::ChannelKind,
    pub duty_range: Option<crate::device::DutyRange>,
    pub sensor_range: Option<crate::device::SensorRange>,
}

/// A device enumerated by a factory, paired with its driver handle
pub struct DiscoveredDevice {
    pub id: DeviceId,
    pub model: String,
    pub driver: Box<dyn DeviceDriver>,
}

/// Outcome of initializing one enumerated device.
///
/// Discovery fails partially: a device that enumerates but fails to
/// initialize is reported as `Failed` so the registry can record it Offline
/// without aborting discovery of its siblings.
pub enum ProbeOutcome {
    Ready(DiscoveredDevice),
    Failed { id: DeviceId, model: String, error: AquiloError },
}

/// One hardware family's entry point: enumerate attached devices and
/// construct a driver per device.
pub trait DriverFactory: Send + Sync {
    /// Family key (e.g. "sim", "hid-aio")
    fn family(&self) -> &'static str;

    /// Enumerate currently attached devices of this family
    fn probe(&self) -> Vec<ProbeOutcome>;
}

/// Registry of driver factories, keyed by family name
#[derive(Default)]
pub struct DriverRegistry {
    factories: Vec<Box<dyn DriverFactory>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Box<dyn DriverFactory>) {
        self.factories.push(factory);
    }

    pub fn families(&self) -> Vec<&'static str> {
        self.factories.iter().map(|f| f.family()).collect()
    }

    /// Probe every registered family.
    ///
    /// Returns per-device outcomes tagged with the owning family.
    pub fn probe_all(&self) -> Vec<(&'static str, ProbeOutcome)> {
        let mut outcomes = Vec::new();
        for factory in &self.factories {
            for outcome in factory.probe() {
                outcomes.push((factory.family(), outcome));
            }
        }
        outcomes
    }
}

/// Build the registry-facing [`Device`] for a discovered device
pub fn build_device(family: &str, discovered: &DiscoveredDevice) -> Device {
    let channels: Vec<Channel> = discovered
        .driver
        .capabilities()
        .into_iter()
        .map(|spec| Channel {
            id: ChannelId::for_device(&discovered.id, &spec.name),
            name: spec.name,
            label: spec.label,
            kind: spec.kind,
            duty_range: spec.duty_range,
            sensor_range: spec.sensor_range,
        })
        .collect();

    Device {
        id: discovered.id.clone(),
        model: discovered.model.clone(),
        family: family.to_string(),
        channels,
        state: LifecycleState::Online,
    }
}
