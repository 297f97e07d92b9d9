//! Tick engine
//!
//! Owns the whole control pipeline: registry, poller, applier, the active
//! profile set and manual overrides. One timer drives the tick cycle
//! (poll -> publish snapshot -> evaluate -> apply); a tick still running
//! when the next is due causes the next to be skipped, never overlapped,
//! so device ownership can't conflict across ticks.
//!
//! Client commands mutate the profile set under a write lock while the tick
//! reads it at the tick boundary, so an accepted change takes effect no
//! later than the next tick and never mid-tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::applier::{ControlApplier, ControlSettings, ManualOverride};
use crate::config::DaemonConfig;
use crate::poller::TelemetryPoller;
use crate::registry::DeviceRegistry;
use aquilo_core::{
    generate_profile_id, validate_duty_in_channel_range, validate_override_ttl, validate_profile,
    ChannelId, DriverRegistry, Profile, ProfileStore, Snapshot,
};
use aquilo_error::{AquiloError, Result};
use aquilo_protocol::{EngineEvent, OverrideView, SnapshotView};

/// Broadcast capacity for engine events; slow subscribers lag and drop
/// frames rather than blocking the control loop
const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct Engine {
    config: DaemonConfig,
    registry: Arc<DeviceRegistry>,
    poller: TelemetryPoller,
    applier: ControlApplier,
    /// Active profiles, at most one per target channel
    profiles: RwLock<HashMap<ChannelId, Profile>>,
    overrides: Mutex<HashMap<ChannelId, ManualOverride>>,
    store: Box<dyn ProfileStore>,
    snapshots: watch::Receiver<Arc<Snapshot>>,
    events: broadcast::Sender<EngineEvent>,
    shutdown: watch::Sender<bool>,
}

impl Engine {
    pub fn new(
        config: DaemonConfig,
        drivers: DriverRegistry,
        store: Box<dyn ProfileStore>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let registry = DeviceRegistry::new(drivers, config.failure_threshold, events.clone());
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(Snapshot::default()));
        let poller =
            TelemetryPoller::new(registry.clone(), snapshot_tx, config.device_io_timeout());
        let applier = ControlApplier::new(
            registry.clone(),
            ControlSettings {
                deadband_percent: config.deadband_percent,
                failsafe_grace: config.failsafe_grace(),
                failsafe: config.failsafe,
                io_timeout: config.device_io_timeout(),
            },
            events.clone(),
        );
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            config,
            registry,
            poller,
            applier,
            profiles: RwLock::new(HashMap::new()),
            overrides: Mutex::new(HashMap::new()),
            store,
            snapshots: snapshot_rx,
            events,
            shutdown,
        })
    }

    /// Initial discovery plus profile store load.
    ///
    /// Returns the number of online devices; the daemon signals readiness
    /// only after this completes.
    pub async fn init(self: &Arc<Self>) -> Result<usize> {
        let stored = self.store.load()?;
        let mut profiles = self.profiles.write().await;
        for profile in stored {
            if let Some(previous) =
                profiles.insert(profile.target_channel_id.clone(), profile.clone())
            {
                warn!(
                    channel = %profile.target_channel_id,
                    kept = %profile.id,
                    dropped = %previous.id,
                    "Multiple stored profiles target the same channel"
                );
            }
        }
        info!("Activated {} stored profiles", profiles.len());
        drop(profiles);

        let online = self.registry.discover().await;
        info!("Initial discovery complete: {} devices online", online);
        Ok(online)
    }

    /// Run the tick loop until shutdown is requested.
    ///
    /// Only a failure of the scheduling driver itself is fatal; every
    /// per-device fault stays local to its device.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown = self.shutdown.subscribe();
        let mut tick_count: u64 = 0;

        info!(
            interval_ms = self.config.tick_interval_ms,
            "Control loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tick_count += 1;
                    self.tick().await;

                    let every = self.config.rediscover_every_ticks;
                    if every > 0 && tick_count % every == 0 {
                        self.registry.rediscover().await;
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Control loop stopped");
    }

    /// Request shutdown; the loop finishes its current tick and exits,
    /// leaving actuators at their last-applied duty.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// One poll -> evaluate -> apply cycle
    async fn tick(&self) {
        let snapshot = self.poller.poll_once().await;
        let profiles: Vec<Profile> = self.profiles.read().await.values().cloned().collect();
        let overrides = self.prune_overrides().await;
        self.applier.apply(&snapshot, &profiles, &overrides).await;
        debug!(sequence = snapshot.sequence, "Tick complete");
    }

    /// Drop expired overrides, returning the ones still in force
    async fn prune_overrides(&self) -> HashMap<ChannelId, ManualOverride> {
        let now = Instant::now();
        let mut overrides = self.overrides.lock().await;
        let expired: Vec<ChannelId> = overrides
            .iter()
            .filter(|(_, ov)| ov.expires_at <= now)
            .map(|(ch, _)| ch.clone())
            .collect();
        for channel_id in expired {
            overrides.remove(&channel_id);
            info!(channel = %channel_id, "Manual override expired");
            let _ = self.events.send(EngineEvent::OverrideCleared { channel_id });
        }
        overrides.clone()
    }

    // ========================================================================
    // Command surface (serialized against the tick via the profile lock)
    // ========================================================================

    /// Validate, persist and activate a profile.
    ///
    /// Replaces any profile previously active on the target channel. On
    /// validation failure nothing changes, including the previous profile.
    pub async fn set_profile(&self, mut profile: Profile) -> Result<Profile> {
        if profile.id.trim().is_empty() {
            profile.id = generate_profile_id();
        }
        let devices = self.registry.attached().await;
        validate_profile(&profile, &devices)?;

        // Persist first; an unwritable store must not leave a live profile
        // that vanishes on restart
        self.store.save(&profile)?;

        let mut profiles = self.profiles.write().await;
        if let Some(previous) = profiles.insert(profile.target_channel_id.clone(), profile.clone())
        {
            if previous.id != profile.id {
                if let Err(e) = self.store.delete(&previous.id) {
                    warn!(profile = %previous.id, "Failed to delete replaced profile: {}", e);
                }
            }
        }
        info!(
            profile = %profile.id,
            channel = %profile.target_channel_id,
            kind = profile.kind.kind_name(),
            "Profile activated"
        );
        Ok(profile)
    }

    /// Delete a profile by id from both the active set and the store
    pub async fn delete_profile(&self, id: &str) -> Result<()> {
        let mut profiles = self.profiles.write().await;
        let channel = profiles
            .iter()
            .find(|(_, p)| p.id == id)
            .map(|(ch, _)| ch.clone());
        let was_active = if let Some(channel) = channel {
            profiles.remove(&channel);
            true
        } else {
            false
        };
        drop(profiles);

        let was_stored = self.store.delete(id)?;
        if !was_active && !was_stored {
            return Err(AquiloError::ProfileNotFound(id.to_string()));
        }
        info!(profile = %id, "Profile deleted");
        Ok(())
    }

    /// Install a manual override superseding the channel's profile
    pub async fn set_override(
        &self,
        channel_id: ChannelId,
        duty: f64,
        ttl_ms: u64,
        owner: u64,
    ) -> Result<()> {
        validate_override_ttl(ttl_ms)?;
        let channel = self
            .registry
            .channel(&channel_id)
            .await
            .ok_or_else(|| AquiloError::UnknownChannel(channel_id.to_string()))?;
        if !channel.is_actuator() {
            return Err(AquiloError::validation(format!(
                "channel {} is not an actuator",
                channel_id
            )));
        }
        validate_duty_in_channel_range(&channel, duty)?;

        let expires_at = Instant::now() + std::time::Duration::from_millis(ttl_ms);
        self.overrides
            .lock()
            .await
            .insert(channel_id.clone(), ManualOverride { duty, expires_at, owner });
        info!(channel = %channel_id, duty, ttl_ms, "Manual override set");
        Ok(())
    }

    /// Clear an override; true if one was in force
    pub async fn clear_override(&self, channel_id: &ChannelId) -> Result<bool> {
        let removed = self.overrides.lock().await.remove(channel_id).is_some();
        if removed {
            info!(channel = %channel_id, "Manual override cleared");
            let _ = self.events.send(EngineEvent::OverrideCleared {
                channel_id: channel_id.clone(),
            });
        }
        Ok(removed)
    }

    /// Clear all overrides owned by a disconnected client connection
    pub async fn clear_overrides_owned(&self, owner: u64) {
        let mut overrides = self.overrides.lock().await;
        let owned: Vec<ChannelId> = overrides
            .iter()
            .filter(|(_, ov)| ov.owner == owner)
            .map(|(ch, _)| ch.clone())
            .collect();
        for channel_id in owned {
            overrides.remove(&channel_id);
            info!(channel = %channel_id, owner, "Override cleared on disconnect");
            let _ = self.events.send(EngineEvent::OverrideCleared { channel_id });
        }
    }

    /// Trigger an immediate rediscovery sweep
    pub async fn rediscover(&self) {
        self.registry.rediscover().await;
    }

    /// Build the client-facing state view
    pub async fn view(&self) -> SnapshotView {
        let snapshot = self.snapshots.borrow().clone();
        let devices = self.registry.attached().await;
        let commands = self.applier.commands().await;
        let profiles: Vec<Profile> = self.profiles.read().await.values().cloned().collect();
        let now = Instant::now();
        let overrides: Vec<OverrideView> = self
            .overrides
            .lock()
            .await
            .iter()
            .map(|(channel_id, ov)| OverrideView {
                channel_id: channel_id.clone(),
                duty: ov.duty,
                expires_in_ms: ov.expires_at.saturating_duration_since(now).as_millis() as u64,
            })
            .collect();

        SnapshotView {
            sequence: snapshot.sequence,
            timestamp_ms: snapshot.timestamp_ms,
            devices,
            readings: snapshot.readings.clone(),
            commands,
            profiles,
            overrides,
        }
    }

    /// Subscribe to engine events (lifecycle, fail-safe, override changes)
    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Subscribe to published snapshots
    pub fn subscribe_snapshots(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshots.clone()
    }

    /// Observe the shutdown flag (used by the server to stop accepting)
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Run one tick immediately (test hook; the daemon uses `run`)
    #[doc(hidden)]
    pub async fn tick_once(&self) {
        self.tick().await;
    }
}
