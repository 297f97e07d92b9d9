//! Validation for client-submitted profiles and overrides
//!
//! Everything arriving over the command surface is validated against the
//! engine's invariants before it can touch the active profile set or the
//! profile store. Internally computed duties are clamped silently; values a
//! client submitted explicitly are rejected instead.

use crate::constants::{control, limits};
use crate::device::{Channel, Device};
use crate::profile::{CurvePoint, Profile, ProfileKind};
use aquilo_error::{AquiloError, Result};

/// Validates that a duty percentage is within the global 0-100 range
pub fn validate_duty(duty: f64) -> Result<f64> {
    if !duty.is_finite() || !(control::DUTY_MIN..=control::DUTY_MAX).contains(&duty) {
        return Err(AquiloError::validation(format!(
            "duty {:.1}% outside valid range {:.0}-{:.0}%",
            duty,
            control::DUTY_MIN,
            control::DUTY_MAX
        )));
    }
    Ok(duty)
}

/// Validates a profile name for storage
pub fn validate_name(name: &str) -> Result<String> {
    let trimmed = name.trim();

    if trimmed.is_empty() {
        return Err(AquiloError::validation("profile name cannot be empty"));
    }

    if trimmed.len() > limits::MAX_NAME_LEN {
        return Err(AquiloError::validation(format!(
            "profile name exceeds maximum length of {} characters",
            limits::MAX_NAME_LEN
        )));
    }

    Ok(trimmed.to_string())
}

/// Validates curve points for consistency
pub fn validate_curve_points(points: &[CurvePoint]) -> Result<()> {
    if points.is_empty() {
        return Err(AquiloError::validation("curve must have at least one point"));
    }

    if points.len() > limits::MAX_CURVE_POINTS {
        return Err(AquiloError::validation(format!(
            "curve exceeds maximum of {} points",
            limits::MAX_CURVE_POINTS
        )));
    }

    for (point_index, point) in points.iter().enumerate() {
        if !point.temperature.is_finite()
            || !(limits::MIN_CURVE_TEMPERATURE..=limits::MAX_CURVE_TEMPERATURE)
                .contains(&point.temperature)
        {
            return Err(AquiloError::validation(format!(
                "curve point {} has invalid temperature: {:.1}°C (must be {}-{}°C)",
                point_index,
                point.temperature,
                limits::MIN_CURVE_TEMPERATURE,
                limits::MAX_CURVE_TEMPERATURE
            )));
        }

        validate_duty(point.duty).map_err(|_| {
            AquiloError::validation(format!(
                "curve point {} has invalid duty: {:.1}%",
                point_index, point.duty
            ))
        })?;
    }

    for window in points.windows(2) {
        if window[0].temperature >= window[1].temperature {
            return Err(AquiloError::validation(
                "curve points must be sorted by strictly increasing temperature",
            ));
        }
    }

    Ok(())
}

/// Validates a profile against the currently attached devices.
///
/// The target must be a known actuator channel; a Curve/FollowSensor source
/// must be a known channel. A client-submitted Fixed duty outside the target
/// channel's supported range is rejected rather than clamped.
pub fn validate_profile(profile: &Profile, devices: &[Device]) -> Result<()> {
    validate_name(&profile.name)?;

    let target = find_channel(devices, &profile.target_channel_id).ok_or_else(|| {
        AquiloError::validation(format!(
            "target channel {} does not exist",
            profile.target_channel_id
        ))
    })?;

    if !target.is_actuator() {
        return Err(AquiloError::validation(format!(
            "target channel {} is not an actuator",
            profile.target_channel_id
        )));
    }

    if let Some(source) = profile.kind.source_channel() {
        if find_channel(devices, source).is_none() {
            return Err(AquiloError::validation(format!(
                "source channel {} does not exist",
                source
            )));
        }
    }

    match &profile.kind {
        ProfileKind::Fixed { duty } => {
            validate_duty(*duty)?;
            validate_duty_in_channel_range(target, *duty)?;
        }
        ProfileKind::Curve { points, .. } => validate_curve_points(points)?,
        ProfileKind::FollowSensor { offset, .. } => {
            if !offset.is_finite() || offset.abs() > control::DUTY_MAX {
                return Err(AquiloError::validation(format!(
                    "follow offset {:.1} out of range",
                    offset
                )));
            }
        }
    }

    Ok(())
}

/// Validates a client-submitted override duty against a channel's range
pub fn validate_duty_in_channel_range(channel: &Channel, duty: f64) -> Result<()> {
    validate_duty(duty)?;
    let range = channel.duty_range.unwrap_or_else(crate::device::DutyRange::full);
    if !range.contains(duty) {
        return Err(AquiloError::OutOfRange {
            channel: channel.id.to_string(),
            duty,
            min: range.min,
            max: range.max,
        });
    }
    Ok(())
}

/// Validates a manual override TTL
pub fn validate_override_ttl(ttl_ms: u64) -> Result<()> {
    if ttl_ms == 0 || ttl_ms > limits::MAX_OVERRIDE_TTL_MS {
        return Err(AquiloError::validation(format!(
            "override TTL must be 1-{}ms",
            limits::MAX_OVERRIDE_TTL_MS
        )));
    }
    Ok(())
}

fn find_channel<'a>(
    devices: &'a [Device],
    id: &crate::device::ChannelId,
) -> Option<&'a Channel> {
    devices.iter().find_map(|d| d.channel(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{
        ChannelId, ChannelKind, DeviceId, DutyRange, LifecycleState, SensorRange,
    };

    fn test_device() -> Device {
        let id = DeviceId::new("dev0");
        Device {
            id: id.clone(),
            model: "Test AIO".to_string(),
            family: "sim".to_string(),
            channels: vec![
                Channel {
                    id: ChannelId::for_device(&id, "temp1"),
                    name: "temp1".to_string(),
                    label: Some("Coolant".to_string()),
                    kind: ChannelKind::TemperatureSensor,
                    duty_range: None,
                    sensor_range: Some(SensorRange::celsius(0.0, 110.0)),
                },
                Channel {
                    id: ChannelId::for_device(&id, "fan1"),
                    name: "fan1".to_string(),
                    label: None,
                    kind: ChannelKind::FanOrPumpActuator,
                    duty_range: Some(DutyRange::new(20.0, 100.0)),
                    sensor_range: None,
                },
            ],
            state: LifecycleState::Online,
        }
    }

    fn curve_profile(points: Vec<CurvePoint>) -> Profile {
        Profile {
            id: "p1".to_string(),
            name: "test".to_string(),
            target_channel_id: ChannelId::new("dev0/fan1"),
            kind: ProfileKind::Curve {
                source_channel_id: ChannelId::new("dev0/temp1"),
                points,
            },
        }
    }

    #[test]
    fn test_empty_curve_rejected() {
        let devices = vec![test_device()];
        let profile = curve_profile(vec![]);
        assert!(validate_profile(&profile, &devices).is_err());
    }

    #[test]
    fn test_unsorted_curve_rejected() {
        let devices = vec![test_device()];
        let profile = curve_profile(vec![
            CurvePoint { temperature: 50.0, duty: 50.0 },
            CurvePoint { temperature: 30.0, duty: 20.0 },
        ]);
        assert!(validate_profile(&profile, &devices).is_err());
    }

    #[test]
    fn test_valid_curve_accepted() {
        let devices = vec![test_device()];
        let profile = curve_profile(vec![
            CurvePoint { temperature: 30.0, duty: 20.0 },
            CurvePoint { temperature: 70.0, duty: 100.0 },
        ]);
        assert!(validate_profile(&profile, &devices).is_ok());
    }

    #[test]
    fn test_unknown_target_rejected() {
        let devices = vec![test_device()];
        let mut profile = curve_profile(vec![CurvePoint { temperature: 30.0, duty: 20.0 }]);
        profile.target_channel_id = ChannelId::new("ghost/fan9");
        assert!(validate_profile(&profile, &devices).is_err());
    }

    #[test]
    fn test_sensor_target_rejected() {
        let devices = vec![test_device()];
        let mut profile = curve_profile(vec![CurvePoint { temperature: 30.0, duty: 20.0 }]);
        profile.target_channel_id = ChannelId::new("dev0/temp1");
        assert!(validate_profile(&profile, &devices).is_err());
    }

    #[test]
    fn test_fixed_out_of_channel_range_rejected() {
        let devices = vec![test_device()];
        let profile = Profile {
            id: "p2".to_string(),
            name: "low fixed".to_string(),
            target_channel_id: ChannelId::new("dev0/fan1"),
            kind: ProfileKind::Fixed { duty: 10.0 },
        };
        // 10% is a valid duty globally but below this fan's 20% floor
        let err = validate_profile(&profile, &devices).unwrap_err();
        assert!(matches!(err, AquiloError::OutOfRange { .. }));
    }

    #[test]
    fn test_validate_duty_bounds() {
        assert!(validate_duty(0.0).is_ok());
        assert!(validate_duty(100.0).is_ok());
        assert!(validate_duty(-0.1).is_err());
        assert!(validate_duty(100.1).is_err());
        assert!(validate_duty(f64::NAN).is_err());
    }

    #[test]
    fn test_override_ttl_bounds() {
        assert!(validate_override_ttl(0).is_err());
        assert!(validate_override_ttl(5_000).is_ok());
        assert!(validate_override_ttl(limits::MAX_OVERRIDE_TTL_MS + 1).is_err());
    }
}
