//! Control profiles and the pure profile evaluator
//!
//! A profile maps sensor state to a target duty for exactly one actuator
//! channel. Evaluation is pure computation over the latest snapshot: no I/O,
//! no clocks. The applier decides what to do with the result.
//!
//! # Profile kinds
//!
//! 1. **Fixed**: constant duty, clamped to the channel's range.
//!
//! 2. **Curve**: linear interpolation between `(temperature, duty)` control
//!    points against a source sensor. Below the first point or above the last
//!    the boundary duty is used (clamp at edges, no extrapolation).
//!
//! 3. **FollowSensor**: mirrors another channel plus an offset - the source's
//!    commanded duty if it is an actuator, otherwise the raw sensor value
//!    treated as a duty percentage.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::constants::control;
use crate::device::{Channel, ChannelId, Command, Snapshot};

/// A single control point on a duty curve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub temperature: f64,
    pub duty: f64,
}

/// How a profile computes its target duty
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProfileKind {
    /// Constant duty
    Fixed { duty: f64 },
    /// Temperature curve against a source sensor channel
    Curve {
        source_channel_id: ChannelId,
        points: Vec<CurvePoint>,
    },
    /// Mirror another channel's duty (or sensor value) plus an offset
    FollowSensor {
        source_channel_id: ChannelId,
        offset: f64,
    },
}

impl ProfileKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ProfileKind::Fixed { .. } => "fixed",
            ProfileKind::Curve { .. } => "curve",
            ProfileKind::FollowSensor { .. } => "follow_sensor",
        }
    }

    /// The sensor/actuator channel this profile reads from, if any
    pub fn source_channel(&self) -> Option<&ChannelId> {
        match self {
            ProfileKind::Fixed { .. } => None,
            ProfileKind::Curve { source_channel_id, .. } => Some(source_channel_id),
            ProfileKind::FollowSensor { source_channel_id, .. } => Some(source_channel_id),
        }
    }
}

/// A user-authored control profile targeting one actuator channel.
///
/// A channel has at most one active profile; assigning a new one replaces the
/// old atomically. Profiles whose target device has vanished are retained but
/// inert until the device returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default = "generate_profile_id")]
    pub id: String,
    pub name: String,
    pub target_channel_id: ChannelId,
    #[serde(flatten)]
    pub kind: ProfileKind,
}

/// Result of evaluating one profile for one tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// Apply this duty (already clamped to the target channel's range)
    Duty(f64),
    /// Required sensor data missing from this tick's snapshot; the applier
    /// falls back to the fail-safe policy after the grace window
    NoData,
}

/// Evaluate a profile against the latest snapshot.
///
/// `commands` holds the last duty actually written per channel, which is what
/// a FollowSensor profile mirrors when its source is an actuator.
pub fn evaluate(
    profile: &Profile,
    target: &Channel,
    snapshot: &Snapshot,
    commands: &HashMap<ChannelId, Command>,
) -> Decision {
    match &profile.kind {
        ProfileKind::Fixed { duty } => Decision::Duty(target.clamp_duty(*duty)),
        ProfileKind::Curve { source_channel_id, points } => {
            match snapshot.value(source_channel_id) {
                Some(temp) if temp.is_finite() => {
                    Decision::Duty(target.clamp_duty(interpolate(points, temp)))
                }
                _ => Decision::NoData,
            }
        }
        ProfileKind::FollowSensor { source_channel_id, offset } => {
            // Prefer the source's commanded duty; fall back to its raw reading
            let source_value = commands
                .get(source_channel_id)
                .map(|c| c.duty)
                .or_else(|| snapshot.value(source_channel_id));
            match source_value {
                Some(v) if v.is_finite() => Decision::Duty(target.clamp_duty(v + offset)),
                _ => Decision::NoData,
            }
        }
    }
}

/// Linearly interpolate a duty between curve points.
///
/// - Below the first point: the first point's duty
/// - Above the last point: the last point's duty
/// - At a control point: that point's duty exactly
/// - Between points: linear interpolation
///
/// Points are expected sorted by strictly increasing temperature (validation
/// enforces this on accepted profiles); non-monotonic duty values are taken
/// as-is. An empty points list returns full duty.
pub fn interpolate(points: &[CurvePoint], temp: f64) -> f64 {
    let first = match points.first() {
        Some(p) => p,
        None => return control::DUTY_MAX,
    };
    let last = match points.last() {
        Some(p) => p,
        None => return control::DUTY_MAX,
    };

    if temp <= first.temperature {
        return first.duty;
    }
    if temp >= last.temperature {
        return last.duty;
    }

    for window in points.windows(2) {
        let lower = &window[0];
        let upper = &window[1];

        if temp < lower.temperature || temp > upper.temperature {
            continue;
        }

        // Exact hits return the control point's duty without arithmetic
        if (temp - lower.temperature).abs() < control::FLOAT_EPSILON {
            return lower.duty;
        }
        if (temp - upper.temperature).abs() < control::FLOAT_EPSILON {
            return upper.duty;
        }

        let temp_range = upper.temperature - lower.temperature;
        if temp_range.abs() < control::FLOAT_EPSILON {
            return lower.duty;
        }

        let ratio = (temp - lower.temperature) / temp_range;
        return lower.duty + ratio * (upper.duty - lower.duty);
    }

    // Unreachable with sorted points; be safe anyway
    last.duty
}

/// True when a newly computed duty is within the dead-band of the last
/// applied duty and should be treated as a no-op (anti-oscillation).
pub fn within_deadband(new_duty: f64, last_duty: Option<f64>, deadband: f64) -> bool {
    match last_duty {
        Some(last) => (new_duty - last).abs() <= deadband,
        None => false,
    }
}

/// Generate a new profile id.
///
/// Format: xxxxxxxx-xxxx-4xxx-yxxx-xxxxxxxxxxxx, derived from the current
/// time. Dependency-free; collision resistance is adequate for a local
/// profile store.
pub fn generate_profile_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let rand_part = timestamp ^ (timestamp >> 32);
    let rand2 = timestamp.wrapping_mul(0x5851F42D4C957F2D);
    format!(
        "{:08x}-{:04x}-4{:03x}-{:04x}-{:012x}",
        (rand_part & 0xFFFFFFFF) as u32,
        ((rand_part >> 32) & 0xFFFF) as u16,
        ((rand2 >> 48) & 0x0FFF) as u16,
        (0x8000 | ((rand2 >> 32) & 0x3FFF)) as u16,
        (rand2 & 0xFFFFFFFFFFFF) as u64
    )
}
