//! Aquilo Core Library
//!
//! The device telemetry-and-control model for the Aquilo cooling engine.
//!
//! # Features
//!
//! - **Device model**: devices, channels, capability ranges, lifecycle states
//! - **Driver abstraction**: capability-polymorphic blocking drivers per
//!   hardware family, selected via a factory registry
//! - **Profiles**: fixed, curve and follow-sensor control profiles with a
//!   pure evaluator (interpolation, edge clamping, hysteresis dead-band)
//! - **Persistence**: JSON profile store with atomic writes
//!
//! # Module Structure
//!
//! - `device` - devices, channels, readings, snapshots
//! - `driver` - the `DeviceDriver`/`DriverFactory` abstraction
//! - `sim` - deterministic simulated device family
//! - `profile` - profile types and the pure evaluator
//! - `validation` - invariant checks for client-submitted payloads
//! - `store` - the profile store interface and JSON implementation

pub mod constants;
pub mod device;
pub mod driver;
pub mod profile;
pub mod sim;
pub mod store;
pub mod validation;

// Re-export primary model types
pub use device::{
    Channel, ChannelId, ChannelKind, Command, Device, DeviceId, DutyRange, LifecycleState,
    SensorRange, SensorReading, SensorUnit, Snapshot, now_ms,
};

// Re-export driver abstraction
pub use driver::{
    build_device, ChannelSpec, DeviceDriver, DiscoveredDevice, DriverFactory, DriverRegistry,
    ProbeOutcome,
};

// Re-export profile types and evaluator
pub use profile::{
    evaluate, generate_profile_id, interpolate, within_deadband, CurvePoint, Decision, Profile,
    ProfileKind,
};

// Re-export validation functions
pub use validation::{
    validate_curve_points, validate_duty, validate_duty_in_channel_range, validate_name,
    validate_override_ttl, validate_profile,
};

// Re-export persistence
pub use store::{JsonProfileStore, ProfileStore};

// Re-export error types
pub use aquilo_error::{AquiloError, Result};
