//! Telemetry poller
//!
//! Once per tick, reads every sensor-capable channel of every pollable
//! device. Devices are polled concurrently; channels within one device are
//! read back-to-back under the device's driver lock because the underlying
//! transport is not safe for concurrent access.
//!
//! Each per-device read is bounded by a timeout. A worker that exceeds it is
//! abandoned (its result discarded, a failure recorded) and the tick
//! proceeds with the other devices. Failed devices' channels are simply
//! omitted from the snapshot - last-known values are never carried forward.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::registry::DeviceRegistry;
use aquilo_core::{now_ms, ChannelId, Snapshot, SensorReading};
use aquilo_error::{AquiloError, Result};

pub struct TelemetryPoller {
    registry: Arc<DeviceRegistry>,
    publisher: watch::Sender<Arc<Snapshot>>,
    io_timeout: Duration,
    sequence: AtomicU64,
}

impl TelemetryPoller {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        publisher: watch::Sender<Arc<Snapshot>>,
        io_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            publisher,
            io_timeout,
            sequence: AtomicU64::new(0),
        }
    }

    /// Collect one snapshot and publish it atomically.
    ///
    /// Nothing can observe a partially built snapshot: readers hold the
    /// previous one until the swap.
    pub async fn poll_once(&self) -> Arc<Snapshot> {
        let devices = self.registry.attached().await;
        let mut workers = Vec::new();

        for device in &devices {
            if !device.state.is_pollable() {
                trace!(device = %device.id, "Skipping offline device");
                continue;
            }
            let sensors: Vec<(ChannelId, String, Option<aquilo_core::SensorRange>)> = device
                .sensor_channels()
                .map(|c| (c.id.clone(), c.name.clone(), c.sensor_range))
                .collect();
            if sensors.is_empty() {
                continue;
            }

            let registry = self.registry.clone();
            let device_id = device.id.clone();
            let io_timeout = self.io_timeout;
            workers.push(tokio::spawn(async move {
                let result = timeout(
                    io_timeout,
                    read_device_sensors(registry.clone(), device_id.clone(), sensors),
                )
                .await;
                match result {
                    Ok(Ok(readings)) => {
                        registry.mark_success(&device_id).await;
                        readings
                    }
                    Ok(Err(e)) => {
                        warn!(device = %device_id, "Sensor read failed: {}", e);
                        registry.mark_failure(&device_id).await;
                        Vec::new()
                    }
                    Err(_) => {
                        // Worker abandoned; whatever it returns later is discarded
                        warn!(
                            device = %device_id,
                            timeout_ms = io_timeout.as_millis() as u64,
                            "Sensor read timed out"
                        );
                        registry.mark_failure(&device_id).await;
                        Vec::new()
                    }
                }
            }));
        }

        let timestamp_ms = now_ms();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let mut snapshot = Snapshot {
            sequence,
            timestamp_ms,
            ..Default::default()
        };

        for worker in workers {
            if let Ok(readings) = worker.await {
                for (channel_id, value) in readings {
                    snapshot
                        .readings
                        .insert(channel_id, SensorReading { value, timestamp_ms });
                }
            }
        }

        debug!(
            sequence,
            readings = snapshot.readings.len(),
            "Snapshot collected"
        );

        let snapshot = Arc::new(snapshot);
        self.publisher.send_replace(snapshot.clone());
        snapshot
    }
}

/// Read all sensor channels of one device, serialized under its driver lock
async fn read_device_sensors(
    registry: Arc<DeviceRegistry>,
    device_id: aquilo_core::DeviceId,
    sensors: Vec<(ChannelId, String, Option<aquilo_core::SensorRange>)>,
) -> Result<Vec<(ChannelId, f64)>> {
    let managed = registry
        .device(&device_id)
        .await
        .ok_or_else(|| AquiloError::UnknownDevice(device_id.to_string()))?;

    let device_id_for_task = device_id.clone();
    tokio::task::spawn_blocking(move || {
        let mut guard = managed.driver.blocking_lock();
        let driver = guard
            .as_mut()
            .ok_or_else(|| AquiloError::device_io(device_id_for_task.as_str(), "no driver attached"))?;

        let mut readings = Vec::with_capacity(sensors.len());
        for (channel_id, name, range) in sensors {
            let value = driver.read(&name)?;
            // Implausible values are dropped, not propagated
            if let Some(range) = range {
                if !range.plausible(value) {
                    warn!(channel = %channel_id, value, "Discarding implausible reading");
                    continue;
                }
            }
            readings.push((channel_id, value));
        }
        Ok(readings)
    })
    .await
    .map_err(|e| AquiloError::device_io(device_id.as_str(), format!("read task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use aquilo_core::sim::{SimDeviceSpec, SimFactory};
    use aquilo_core::{DeviceId, DriverRegistry, LifecycleState};
    use tokio::sync::broadcast;

    fn build(
        specs: Vec<SimDeviceSpec>,
    ) -> (Arc<DeviceRegistry>, TelemetryPoller, Arc<aquilo_core::sim::SimFaults>) {
        let factory = SimFactory::new(specs);
        let faults = factory.faults(0).unwrap();
        let mut drivers = DriverRegistry::new();
        drivers.register(Box::new(factory));
        let (events, _) = broadcast::channel(16);
        let registry = DeviceRegistry::new(drivers, 3, events);
        let (publisher, _) = watch::channel(Arc::new(Snapshot::default()));
        let poller = TelemetryPoller::new(registry.clone(), publisher, Duration::from_millis(500));
        (registry, poller, faults)
    }

    #[tokio::test]
    async fn test_snapshot_contains_sensor_readings() {
        let (registry, poller, _) = build(vec![SimDeviceSpec::default()]);
        registry.discover().await;

        let snapshot = poller.poll_once().await;
        assert_eq!(snapshot.sequence, 1);
        // coolant + pump report values
        assert!(snapshot.value(&ChannelId::new("sim0/coolant")).is_some());
        assert!(snapshot.value(&ChannelId::new("sim0/pump")).is_some());
    }

    #[tokio::test]
    async fn test_sequence_strictly_increases() {
        let (registry, poller, _) = build(vec![SimDeviceSpec::default()]);
        registry.discover().await;

        let first = poller.poll_once().await.sequence;
        let second = poller.poll_once().await.sequence;
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_failed_device_omitted_from_snapshot() {
        let (registry, poller, faults) = build(vec![SimDeviceSpec::default()]);
        registry.discover().await;

        faults.set_fail_reads(true);
        let snapshot = poller.poll_once().await;
        assert!(snapshot.readings.is_empty());

        let devices = registry.attached().await;
        assert_eq!(devices[0].state, LifecycleState::Degraded { failures: 1 });
    }

    #[tokio::test]
    async fn test_device_goes_offline_after_threshold() {
        let (registry, poller, faults) = build(vec![SimDeviceSpec::default()]);
        registry.discover().await;

        faults.set_fail_reads(true);
        for _ in 0..3 {
            poller.poll_once().await;
        }

        let devices = registry.attached().await;
        assert_eq!(devices[0].state, LifecycleState::Offline);

        // Offline devices are no longer polled; snapshot stays empty and
        // no further failures accumulate
        let snapshot = poller.poll_once().await;
        assert!(snapshot.readings.is_empty());
        assert_eq!(
            registry.device(&DeviceId::new("sim0")).await.unwrap().device.read().await.state,
            LifecycleState::Offline
        );
    }

    #[tokio::test]
    async fn test_recovery_marks_online() {
        let (registry, poller, faults) = build(vec![SimDeviceSpec::default()]);
        registry.discover().await;

        faults.set_fail_reads(true);
        poller.poll_once().await;
        faults.set_fail_reads(false);
        poller.poll_once().await;

        let devices = registry.attached().await;
        assert_eq!(devices[0].state, LifecycleState::Online);
    }
}
