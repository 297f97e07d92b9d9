//! Device registry
//!
//! Owns one driver handle per attached device and tracks device lifecycle.
//! Drivers are not thread-safe: each lives behind its own async mutex and a
//! worker holds that lock for the duration of a read or write, so access to
//! one device is always serialized while different devices proceed in
//! parallel.
//!
//! Lifecycle: consecutive I/O failures walk a device Online -> Degraded ->
//! Offline at the configured threshold. Offline devices stop being polled
//! and their profiles go inert until a rediscovery sweep brings them back.
//! Every transition is broadcast so connected clients can alert the user.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use aquilo_core::{
    build_device, Channel, ChannelId, Device, DeviceDriver, DeviceId, DriverRegistry,
    LifecycleState, ProbeOutcome,
};
use aquilo_protocol::EngineEvent;

/// A device plus its exclusively-owned driver handle.
///
/// `driver` is None for devices that enumerated but failed to initialize;
/// they sit Offline until rediscovery replaces the handle.
pub struct ManagedDevice {
    pub device: RwLock<Device>,
    pub driver: Mutex<Option<Box<dyn DeviceDriver>>>,
}

impl ManagedDevice {
    fn new(device: Device, driver: Option<Box<dyn DeviceDriver>>) -> Arc<Self> {
        Arc::new(Self {
            device: RwLock::new(device),
            driver: Mutex::new(driver),
        })
    }
}

pub struct DeviceRegistry {
    drivers: DriverRegistry,
    devices: RwLock<HashMap<DeviceId, Arc<ManagedDevice>>>,
    failure_threshold: u32,
    events: broadcast::Sender<EngineEvent>,
}

impl DeviceRegistry {
    pub fn new(
        drivers: DriverRegistry,
        failure_threshold: u32,
        events: broadcast::Sender<EngineEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            drivers,
            devices: RwLock::new(HashMap::new()),
            failure_threshold,
            events,
        })
    }

    /// Enumerate attached devices across all registered driver families.
    ///
    /// Discovery fails partially: a device that fails to initialize is
    /// recorded Offline instead of aborting discovery of the others.
    /// Returns the number of devices now online.
    pub async fn discover(self: &Arc<Self>) -> usize {
        let registry = self.clone();
        let outcomes = tokio::task::spawn_blocking(move || registry.drivers.probe_all()).await;
        let outcomes = match outcomes {
            Ok(o) => o,
            Err(e) => {
                warn!("Discovery task failed: {}", e);
                return self.online_count().await;
            }
        };

        let mut devices = self.devices.write().await;
        for (family, outcome) in outcomes {
            match outcome {
                ProbeOutcome::Ready(discovered) => {
                    let device = build_device(family, &discovered);
                    info!(
                        device = %device.id,
                        model = %device.model,
                        family = family,
                        channels = device.channels.len(),
                        "Discovered device"
                    );
                    if let Some(existing) = devices.get(&device.id) {
                        // Re-attach: replace the driver, reset lifecycle
                        *existing.driver.lock().await = Some(discovered.driver);
                        let mut dev = existing.device.write().await;
                        if dev.state != LifecycleState::Online {
                            dev.state = LifecycleState::Online;
                            self.emit_lifecycle(&dev.id, dev.state);
                        }
                    } else {
                        devices.insert(
                            device.id.clone(),
                            ManagedDevice::new(device, Some(discovered.driver)),
                        );
                    }
                }
                ProbeOutcome::Failed { id, model, error } => {
                    warn!(device = %id, "Device failed to initialize: {}", error);
                    let device = Device {
                        id: id.clone(),
                        model,
                        family: family.to_string(),
                        channels: Vec::new(),
                        state: LifecycleState::Offline,
                    };
                    devices
                        .entry(id.clone())
                        .or_insert_with(|| ManagedDevice::new(device, None));
                    self.emit_lifecycle(&id, LifecycleState::Offline);
                }
            }
        }
        drop(devices);

        self.online_count().await
    }

    /// Re-probe driver families to bring Offline devices back Online.
    ///
    /// Failure counters reset when a device returns. New devices attached
    /// since the last sweep are picked up too.
    pub async fn rediscover(self: &Arc<Self>) {
        debug!("Rediscovery sweep");
        self.discover().await;
    }

    /// True if any known device is currently Offline
    pub async fn any_offline(&self) -> bool {
        let devices = self.devices.read().await;
        for managed in devices.values() {
            if managed.device.read().await.state.is_offline() {
                return true;
            }
        }
        false
    }

    async fn online_count(&self) -> usize {
        let devices = self.devices.read().await;
        let mut count = 0;
        for managed in devices.values() {
            if !managed.device.read().await.state.is_offline() {
                count += 1;
            }
        }
        count
    }

    /// Snapshot of all attached device descriptions
    pub async fn attached(&self) -> Vec<Device> {
        let devices = self.devices.read().await;
        let mut out = Vec::with_capacity(devices.len());
        for managed in devices.values() {
            out.push(managed.device.read().await.clone());
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Handle for one device, if known
    pub async fn device(&self, id: &DeviceId) -> Option<Arc<ManagedDevice>> {
        self.devices.read().await.get(id).cloned()
    }

    /// Look up a channel description across all devices
    pub async fn channel(&self, id: &ChannelId) -> Option<Channel> {
        self.channel_with_state(id).await.map(|(channel, _)| channel)
    }

    /// Channel description plus the owning device's lifecycle state
    pub async fn channel_with_state(&self, id: &ChannelId) -> Option<(Channel, LifecycleState)> {
        let device_id = id.device_id()?;
        let managed = self.device(&device_id).await?;
        let device = managed.device.read().await;
        device.channel(id).cloned().map(|c| (c, device.state))
    }

    /// Record an I/O failure against a device.
    ///
    /// Walks Online -> Degraded(n) -> Offline once the consecutive-failure
    /// threshold is reached. Returns the resulting state.
    pub async fn mark_failure(&self, id: &DeviceId) -> LifecycleState {
        let Some(managed) = self.device(id).await else {
            return LifecycleState::Offline;
        };
        let mut device = managed.device.write().await;
        let failures = match device.state {
            LifecycleState::Online => 1,
            LifecycleState::Degraded { failures } => failures + 1,
            LifecycleState::Offline => return LifecycleState::Offline,
        };
        let next = if failures >= self.failure_threshold {
            LifecycleState::Offline
        } else {
            LifecycleState::Degraded { failures }
        };
        if next != device.state {
            info!(device = %id, from = %device.state, to = %next, "Device state transition");
            device.state = next;
            self.emit_lifecycle(id, next);
        }
        next
    }

    /// Record a successful I/O round against a device, clearing the
    /// consecutive-failure count
    pub async fn mark_success(&self, id: &DeviceId) {
        let Some(managed) = self.device(id).await else {
            return;
        };
        let mut device = managed.device.write().await;
        if let LifecycleState::Degraded { .. } = device.state {
            info!(device = %id, "Device recovered");
            device.state = LifecycleState::Online;
            self.emit_lifecycle(id, LifecycleState::Online);
        }
    }

    fn emit_lifecycle(&self, id: &DeviceId, state: LifecycleState) {
        // Nobody subscribed yet is fine
        let _ = self.events.send(EngineEvent::Lifecycle {
            device_id: id.clone(),
            state,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aquilo_core::sim::{SimDeviceSpec, SimFactory};

    fn sim_registry(specs: Vec<SimDeviceSpec>) -> Arc<DeviceRegistry> {
        let mut drivers = DriverRegistry::new();
        drivers.register(Box::new(SimFactory::new(specs)));
        let (events, _) = broadcast::channel(16);
        DeviceRegistry::new(drivers, 3, events)
    }

    #[tokio::test]
    async fn test_discover_builds_devices() {
        let registry = sim_registry(vec![SimDeviceSpec::default()]);
        let online = registry.discover().await;
        assert_eq!(online, 1);

        let devices = registry.attached().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].state, LifecycleState::Online);
        // coolant + fan1 + fan2 + pump
        assert_eq!(devices[0].channels.len(), 4);
    }

    #[tokio::test]
    async fn test_partial_discovery_failure() {
        let registry = sim_registry(vec![
            SimDeviceSpec { id: "sim0".into(), ..Default::default() },
            SimDeviceSpec { id: "sim1".into(), fail_init: true, ..Default::default() },
        ]);
        let online = registry.discover().await;
        assert_eq!(online, 1);

        let devices = registry.attached().await;
        assert_eq!(devices.len(), 2);
        let failed = devices.iter().find(|d| d.id.as_str() == "sim1").unwrap();
        assert_eq!(failed.state, LifecycleState::Offline);
    }

    #[tokio::test]
    async fn test_failure_threshold_transitions() {
        let registry = sim_registry(vec![SimDeviceSpec::default()]);
        registry.discover().await;
        let id = DeviceId::new("sim0");

        assert_eq!(
            registry.mark_failure(&id).await,
            LifecycleState::Degraded { failures: 1 }
        );
        assert_eq!(
            registry.mark_failure(&id).await,
            LifecycleState::Degraded { failures: 2 }
        );
        assert_eq!(registry.mark_failure(&id).await, LifecycleState::Offline);
        // Further failures stay Offline
        assert_eq!(registry.mark_failure(&id).await, LifecycleState::Offline);
        assert!(registry.any_offline().await);
    }

    #[tokio::test]
    async fn test_success_clears_degraded() {
        let registry = sim_registry(vec![SimDeviceSpec::default()]);
        registry.discover().await;
        let id = DeviceId::new("sim0");

        registry.mark_failure(&id).await;
        registry.mark_success(&id).await;

        let devices = registry.attached().await;
        assert_eq!(devices[0].state, LifecycleState::Online);
        // Counter reset: two more failures stay below the threshold
        registry.mark_failure(&id).await;
        assert_eq!(
            registry.mark_failure(&id).await,
            LifecycleState::Degraded { failures: 2 }
        );
    }

    #[tokio::test]
    async fn test_rediscover_brings_device_back() {
        let registry = sim_registry(vec![SimDeviceSpec::default()]);
        registry.discover().await;
        let id = DeviceId::new("sim0");

        for _ in 0..3 {
            registry.mark_failure(&id).await;
        }
        assert!(registry.any_offline().await);

        registry.rediscover().await;
        let devices = registry.attached().await;
        assert_eq!(devices[0].state, LifecycleState::Online);
    }

    #[tokio::test]
    async fn test_lifecycle_events_emitted() {
        let mut drivers = DriverRegistry::new();
        drivers.register(Box::new(SimFactory::new(vec![SimDeviceSpec::default()])));
        let (events, mut rx) = broadcast::channel(16);
        let registry = DeviceRegistry::new(drivers, 1, events);
        registry.discover().await;

        registry.mark_failure(&DeviceId::new("sim0")).await;
        let event = rx.try_recv().unwrap();
        assert!(matches!(
            event,
            EngineEvent::Lifecycle { state: LifecycleState::Offline, .. }
        ));
    }
}
