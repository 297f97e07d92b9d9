//! Control applier
//!
//! Turns the evaluator's per-channel decisions into hardware writes.
//! Responsibilities:
//!
//! - clamp every duty to the owning channel's capability range
//! - deduplicate: a change within the hysteresis dead-band is a no-op
//! - serialize writes with any concurrent read of the same device (the
//!   registry's per-device driver lock), parallel across devices
//! - update the per-channel `Command` record only on write success
//! - on write failure, count it against the device and retry next tick
//!   instead of hammering a faulty transport
//! - channels with an active profile but no decision are driven to the
//!   fail-safe duty once the grace window expires; a formerly managed
//!   actuator is never left at an arbitrary duty beyond that window
//!
//! Manual overrides supersede profile decisions for their channel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::FailSafePolicy;
use crate::registry::DeviceRegistry;
use aquilo_core::{
    evaluate, now_ms, within_deadband, ChannelId, Command, Decision, DeviceId, Profile, Snapshot,
};
use aquilo_protocol::EngineEvent;

/// Control parameters the applier operates under
#[derive(Debug, Clone)]
pub struct ControlSettings {
    pub deadband_percent: f64,
    pub failsafe_grace: Duration,
    pub failsafe: FailSafePolicy,
    pub io_timeout: Duration,
}

/// A manual override superseding a channel's profile
#[derive(Debug, Clone, Copy)]
pub struct ManualOverride {
    pub duty: f64,
    pub expires_at: Instant,
    /// Connection that set it; cleared when that client disconnects
    pub owner: u64,
}

/// One write queued for this tick
struct PendingWrite {
    channel_id: ChannelId,
    channel_name: String,
    duty: f64,
    failsafe: bool,
}

pub struct ControlApplier {
    registry: Arc<DeviceRegistry>,
    settings: ControlSettings,
    /// Last duty actually written per channel
    commands: RwLock<HashMap<ChannelId, Command>>,
    /// Last instant each profiled channel had usable control data
    health: Mutex<HashMap<ChannelId, Instant>>,
    /// Channels currently held at fail-safe duty
    failsafed: Mutex<HashSet<ChannelId>>,
    events: broadcast::Sender<EngineEvent>,
}

impl ControlApplier {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        settings: ControlSettings,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            registry,
            settings,
            commands: RwLock::new(HashMap::new()),
            health: Mutex::new(HashMap::new()),
            failsafed: Mutex::new(HashSet::new()),
            events,
        }
    }

    /// Current command map (for snapshot views and FollowSensor evaluation)
    pub async fn commands(&self) -> HashMap<ChannelId, Command> {
        self.commands.read().await.clone()
    }

    /// Apply one tick's worth of control decisions
    pub async fn apply(
        &self,
        snapshot: &Snapshot,
        profiles: &[Profile],
        overrides: &HashMap<ChannelId, ManualOverride>,
    ) {
        let commands = self.commands().await;
        let mut writes: Vec<PendingWrite> = Vec::new();

        // Overrides first: exact application, deduped against the last command
        for (channel_id, ov) in overrides {
            let Some(channel) = self.registry.channel(channel_id).await else {
                continue;
            };
            let duty = channel.clamp_duty(ov.duty);
            let unchanged = commands
                .get(channel_id)
                .map(|c| (c.duty - duty).abs() < aquilo_core::constants::control::FLOAT_EPSILON)
                .unwrap_or(false);
            if !unchanged {
                writes.push(PendingWrite {
                    channel_id: channel_id.clone(),
                    channel_name: channel.name.clone(),
                    duty,
                    failsafe: false,
                });
            }
        }

        // Drop health/fail-safe bookkeeping for channels no longer profiled
        let profiled: HashSet<&ChannelId> = profiles.iter().map(|p| &p.target_channel_id).collect();
        {
            let mut health = self.health.lock().await;
            health.retain(|ch, _| profiled.contains(ch));
            let mut failsafed = self.failsafed.lock().await;
            failsafed.retain(|ch| profiled.contains(ch));
        }

        let now = Instant::now();
        for profile in profiles {
            let channel_id = &profile.target_channel_id;
            if overrides.contains_key(channel_id) {
                continue;
            }
            // A profile whose target channel is not currently attached is inert
            let Some((channel, state)) = self.registry.channel_with_state(channel_id).await else {
                continue;
            };

            // An offline device yields no decision even for Fixed profiles;
            // its actuators go to fail-safe once the grace window runs out
            let decision = if state.is_offline() {
                Decision::NoData
            } else {
                evaluate(profile, &channel, snapshot, &commands)
            };

            match decision {
                Decision::Duty(duty) => {
                    self.health.lock().await.insert(channel_id.clone(), now);
                    self.failsafed.lock().await.remove(channel_id);

                    let last = commands.get(channel_id).map(|c| c.duty);
                    if within_deadband(duty, last, self.settings.deadband_percent) {
                        continue;
                    }
                    writes.push(PendingWrite {
                        channel_id: channel_id.clone(),
                        channel_name: channel.name.clone(),
                        duty,
                        failsafe: false,
                    });
                }
                Decision::NoData => {
                    let mut health = self.health.lock().await;
                    let last_good = *health.entry(channel_id.clone()).or_insert(now);
                    drop(health);

                    if now.duration_since(last_good) < self.settings.failsafe_grace {
                        continue;
                    }
                    if self.failsafed.lock().await.contains(channel_id) {
                        continue;
                    }
                    let duty = self.settings.failsafe.duty_for(&channel);
                    warn!(
                        channel = %channel_id,
                        duty,
                        "No control data beyond grace window - applying fail-safe duty"
                    );
                    writes.push(PendingWrite {
                        channel_id: channel_id.clone(),
                        channel_name: channel.name.clone(),
                        duty,
                        failsafe: true,
                    });
                }
            }
        }

        if writes.is_empty() {
            return;
        }
        self.execute(writes).await;
    }

    /// Execute queued writes, batched per device, concurrent across devices
    async fn execute(&self, writes: Vec<PendingWrite>) {
        let mut by_device: HashMap<DeviceId, Vec<PendingWrite>> = HashMap::new();
        for write in writes {
            let Some(device_id) = write.channel_id.device_id() else {
                continue;
            };
            by_device.entry(device_id).or_default().push(write);
        }

        let mut workers = Vec::new();
        for (device_id, batch) in by_device {
            let registry = self.registry.clone();
            let io_timeout = self.settings.io_timeout;
            workers.push(tokio::spawn(async move {
                let outcome = timeout(
                    io_timeout,
                    write_device_batch(registry.clone(), device_id.clone(), batch),
                )
                .await;
                match outcome {
                    Ok((applied, had_failure)) => {
                        if had_failure {
                            registry.mark_failure(&device_id).await;
                        }
                        applied
                    }
                    Err(_) => {
                        warn!(device = %device_id, "Duty write timed out");
                        registry.mark_failure(&device_id).await;
                        Vec::new()
                    }
                }
            }));
        }

        let timestamp_ms = now_ms();
        for worker in workers {
            let Ok(applied) = worker.await else { continue };
            for write in applied {
                debug!(channel = %write.channel_id, duty = write.duty, "Applied duty");
                self.commands.write().await.insert(
                    write.channel_id.clone(),
                    Command { duty: write.duty, timestamp_ms },
                );
                if write.failsafe {
                    self.failsafed.lock().await.insert(write.channel_id.clone());
                    info!(channel = %write.channel_id, duty = write.duty, "Fail-safe engaged");
                    let _ = self.events.send(EngineEvent::FailSafe {
                        channel_id: write.channel_id,
                        duty: write.duty,
                    });
                }
            }
        }
    }
}

/// Write one device's batch under its driver lock.
///
/// Returns the successfully applied writes and whether any write failed.
async fn write_device_batch(
    registry: Arc<DeviceRegistry>,
    device_id: DeviceId,
    batch: Vec<PendingWrite>,
) -> (Vec<PendingWrite>, bool) {
    let Some(managed) = registry.device(&device_id).await else {
        return (Vec::new(), false);
    };

    let result = tokio::task::spawn_blocking(move || {
        let mut guard = managed.driver.blocking_lock();
        let Some(driver) = guard.as_mut() else {
            return (Vec::new(), true);
        };

        let mut applied = Vec::with_capacity(batch.len());
        let mut had_failure = false;
        for write in batch {
            match driver.write(&write.channel_name, write.duty) {
                Ok(()) => applied.push(write),
                Err(e) => {
                    error!(channel = %write.channel_id, "Duty write failed: {}", e);
                    had_failure = true;
                }
            }
        }
        (applied, had_failure)
    })
    .await;

    match result {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(device = %device_id, "Write task failed: {}", e);
            (Vec::new(), true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aquilo_core::sim::{SimDeviceSpec, SimFactory, SimFaults};
    use aquilo_core::{CurvePoint, DriverRegistry, ProfileKind, SensorReading};

    fn settings(grace: Duration) -> ControlSettings {
        ControlSettings {
            deadband_percent: 2.5,
            failsafe_grace: grace,
            failsafe: FailSafePolicy::Max,
            io_timeout: Duration::from_millis(500),
        }
    }

    async fn build(
        grace: Duration,
    ) -> (Arc<DeviceRegistry>, ControlApplier, Arc<SimFaults>, broadcast::Receiver<EngineEvent>) {
        let factory = SimFactory::new(vec![SimDeviceSpec::default()]);
        let faults = factory.faults(0).unwrap();
        let mut drivers = DriverRegistry::new();
        drivers.register(Box::new(factory));
        let (events, rx) = broadcast::channel(64);
        let registry = DeviceRegistry::new(drivers, 3, events.clone());
        registry.discover().await;
        let applier = ControlApplier::new(registry.clone(), settings(grace), events);
        (registry, applier, faults, rx)
    }

    fn fixed_profile(duty: f64) -> Profile {
        Profile {
            id: "p1".to_string(),
            name: "fixed".to_string(),
            target_channel_id: ChannelId::new("sim0/fan1"),
            kind: ProfileKind::Fixed { duty },
        }
    }

    fn curve_profile() -> Profile {
        Profile {
            id: "p2".to_string(),
            name: "curve".to_string(),
            target_channel_id: ChannelId::new("sim0/fan1"),
            kind: ProfileKind::Curve {
                source_channel_id: ChannelId::new("sim0/coolant"),
                points: vec![
                    CurvePoint { temperature: 30.0, duty: 20.0 },
                    CurvePoint { temperature: 50.0, duty: 60.0 },
                    CurvePoint { temperature: 70.0, duty: 100.0 },
                ],
            },
        }
    }

    fn snapshot_with(channel: &str, value: f64) -> Snapshot {
        let mut snapshot = Snapshot { sequence: 1, timestamp_ms: 1, ..Default::default() };
        snapshot
            .readings
            .insert(ChannelId::new(channel), SensorReading { value, timestamp_ms: 1 });
        snapshot
    }

    #[tokio::test]
    async fn test_fixed_profile_written_once() {
        let (_registry, applier, _faults, _rx) = build(Duration::from_secs(10)).await;
        let profiles = vec![fixed_profile(40.0)];
        let snapshot = Snapshot::default();

        applier.apply(&snapshot, &profiles, &HashMap::new()).await;
        let commands = applier.commands().await;
        assert_eq!(commands[&ChannelId::new("sim0/fan1")].duty, 40.0);
    }

    #[tokio::test]
    async fn test_curve_interpolation_applied() {
        let (_registry, applier, _faults, _rx) = build(Duration::from_secs(10)).await;
        let profiles = vec![curve_profile()];
        let snapshot = snapshot_with("sim0/coolant", 45.0);

        applier.apply(&snapshot, &profiles, &HashMap::new()).await;
        let commands = applier.commands().await;
        assert_eq!(commands[&ChannelId::new("sim0/fan1")].duty, 50.0);
    }

    #[tokio::test]
    async fn test_deadband_suppresses_write() {
        let (_registry, applier, _faults, _rx) = build(Duration::from_secs(10)).await;
        let profiles = vec![curve_profile()];

        applier
            .apply(&snapshot_with("sim0/coolant", 45.0), &profiles, &HashMap::new())
            .await;
        let before = applier.commands().await[&ChannelId::new("sim0/fan1")];

        // 45.5°C -> 51% target, within the 2.5% dead-band of the applied 50%
        applier
            .apply(&snapshot_with("sim0/coolant", 45.5), &profiles, &HashMap::new())
            .await;
        let after = applier.commands().await[&ChannelId::new("sim0/fan1")];
        assert_eq!(before, after, "sub-dead-band change must not produce a write");

        // A larger swing does get applied
        applier
            .apply(&snapshot_with("sim0/coolant", 60.0), &profiles, &HashMap::new())
            .await;
        let moved = applier.commands().await[&ChannelId::new("sim0/fan1")];
        assert_eq!(moved.duty, 80.0);
    }

    #[tokio::test]
    async fn test_failsafe_after_grace_window() {
        let (_registry, applier, _faults, mut rx) = build(Duration::from_millis(10)).await;
        let profiles = vec![curve_profile()];

        // Establish control with good data first
        applier
            .apply(&snapshot_with("sim0/coolant", 45.0), &profiles, &HashMap::new())
            .await;

        // Lose the sensor: ticks without data run the grace clock down
        applier.apply(&Snapshot::default(), &profiles, &HashMap::new()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        applier.apply(&Snapshot::default(), &profiles, &HashMap::new()).await;

        let commands = applier.commands().await;
        assert_eq!(
            commands[&ChannelId::new("sim0/fan1")].duty,
            100.0,
            "fail-safe duty is the capability maximum, not the stale value"
        );

        // FailSafe event observed
        let mut saw_failsafe = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, EngineEvent::FailSafe { .. }) {
                saw_failsafe = true;
            }
        }
        assert!(saw_failsafe);
    }

    #[tokio::test]
    async fn test_failsafe_not_rewritten_every_tick() {
        let (_registry, applier, _faults, _rx) = build(Duration::from_millis(1)).await;
        let profiles = vec![curve_profile()];

        applier.apply(&Snapshot::default(), &profiles, &HashMap::new()).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        applier.apply(&Snapshot::default(), &profiles, &HashMap::new()).await;
        let first = applier.commands().await[&ChannelId::new("sim0/fan1")];

        applier.apply(&Snapshot::default(), &profiles, &HashMap::new()).await;
        let second = applier.commands().await[&ChannelId::new("sim0/fan1")];
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_data_return_releases_failsafe() {
        let (_registry, applier, _faults, _rx) = build(Duration::from_millis(1)).await;
        let profiles = vec![curve_profile()];

        applier.apply(&Snapshot::default(), &profiles, &HashMap::new()).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        applier.apply(&Snapshot::default(), &profiles, &HashMap::new()).await;
        assert_eq!(applier.commands().await[&ChannelId::new("sim0/fan1")].duty, 100.0);

        applier
            .apply(&snapshot_with("sim0/coolant", 30.0), &profiles, &HashMap::new())
            .await;
        assert_eq!(applier.commands().await[&ChannelId::new("sim0/fan1")].duty, 20.0);
    }

    #[tokio::test]
    async fn test_override_supersedes_profile() {
        let (_registry, applier, _faults, _rx) = build(Duration::from_secs(10)).await;
        let profiles = vec![fixed_profile(40.0)];
        let mut overrides = HashMap::new();
        overrides.insert(
            ChannelId::new("sim0/fan1"),
            ManualOverride {
                duty: 95.0,
                expires_at: Instant::now() + Duration::from_secs(60),
                owner: 1,
            },
        );

        applier.apply(&Snapshot::default(), &profiles, &overrides).await;
        assert_eq!(applier.commands().await[&ChannelId::new("sim0/fan1")].duty, 95.0);
    }

    #[tokio::test]
    async fn test_write_failure_counts_against_device() {
        let (registry, applier, faults, _rx) = build(Duration::from_secs(10)).await;
        faults.set_fail_writes(true);

        let profiles = vec![fixed_profile(40.0)];
        applier.apply(&Snapshot::default(), &profiles, &HashMap::new()).await;

        // Command not updated on failure; device degraded
        assert!(applier.commands().await.is_empty());
        let devices = registry.attached().await;
        assert_eq!(devices[0].state, aquilo_core::LifecycleState::Degraded { failures: 1 });

        // Transport recovers; retry on the next tick succeeds
        faults.set_fail_writes(false);
        applier.apply(&Snapshot::default(), &profiles, &HashMap::new()).await;
        assert_eq!(applier.commands().await[&ChannelId::new("sim0/fan1")].duty, 40.0);
    }

    #[tokio::test]
    async fn test_unknown_target_profile_is_inert() {
        let (_registry, applier, _faults, _rx) = build(Duration::from_millis(1)).await;
        let mut profile = fixed_profile(40.0);
        profile.target_channel_id = ChannelId::new("ghost/fan1");

        applier.apply(&Snapshot::default(), &[profile], &HashMap::new()).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        applier.apply(&Snapshot::default(), &[], &HashMap::new()).await;
        assert!(applier.commands().await.is_empty());
    }
}
