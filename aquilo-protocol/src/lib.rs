//! Wire protocol between the Aquilo daemon and its clients
//!
//! Line-delimited JSON over a Unix domain socket. Every request carries a
//! correlation id; responses echo it. After a `StreamSnapshots` request the
//! connection switches to push mode and the daemon writes [`StreamMessage`]
//! frames until the client disconnects.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use aquilo_core::{
    Command, ChannelId, Device, DeviceId, LifecycleState, Profile, SensorReading,
};

/// Global request ID counter for correlation
static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Maximum inbound message size for IPC (16KB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// Generate a unique request ID for correlation
pub fn generate_request_id() -> u64 {
    REQUEST_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Unique request ID for correlation and debugging
    pub id: u64,
    /// The actual request
    #[serde(flatten)]
    pub request: Request,
}

impl RequestEnvelope {
    pub fn new(request: Request) -> Self {
        Self {
            id: generate_request_id(),
            request,
        }
    }

    pub fn with_id(request: Request, id: u64) -> Self {
        Self { id, request }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "data")]
pub enum Request {
    Ping,
    Version,
    /// Current snapshot plus device/channel/profile/override metadata
    GetSnapshot,
    /// Switch this connection to push mode; every new snapshot and engine
    /// event is streamed until disconnect
    StreamSnapshots,
    /// Create or replace a profile (validated before acceptance)
    SetProfile { profile: Profile },
    DeleteProfile { id: String },
    /// Manual override superseding the channel's profile until cleared,
    /// expired, or this client disconnects
    SetOverride { channel_id: ChannelId, duty: f64, ttl_ms: u64 },
    ClearOverride { channel_id: ChannelId },
    /// Re-probe driver families to bring back offline devices
    Rediscover,
}

impl Request {
    /// Structural validation before the daemon touches engine state.
    ///
    /// Channel existence and capability-range checks need the device set and
    /// happen in the daemon; this catches malformed payloads early.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Request::Ping
            | Request::Version
            | Request::GetSnapshot
            | Request::StreamSnapshots
            | Request::Rediscover => Ok(()),

            Request::SetProfile { profile } => {
                if profile.name.trim().is_empty() {
                    return Err("profile name cannot be empty".into());
                }
                if let aquilo_core::ProfileKind::Curve { points, .. } = &profile.kind {
                    aquilo_core::validate_curve_points(points).map_err(|e| e.to_string())?;
                }
                Ok(())
            }

            Request::DeleteProfile { id } => {
                if id.trim().is_empty() {
                    return Err("profile id cannot be empty".into());
                }
                Ok(())
            }

            Request::SetOverride { duty, ttl_ms, .. } => {
                aquilo_core::validate_duty(*duty).map_err(|e| e.to_string())?;
                aquilo_core::validate_override_ttl(*ttl_ms).map_err(|e| e.to_string())?;
                Ok(())
            }

            Request::ClearOverride { .. } => Ok(()),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Request::Ping => "Ping",
            Request::Version => "Version",
            Request::GetSnapshot => "GetSnapshot",
            Request::StreamSnapshots => "StreamSnapshots",
            Request::SetProfile { .. } => "SetProfile",
            Request::DeleteProfile { .. } => "DeleteProfile",
            Request::SetOverride { .. } => "SetOverride",
            Request::ClearOverride { .. } => "ClearOverride",
            Request::Rediscover => "Rediscover",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Request ID this response corresponds to
    pub id: u64,
    /// The actual response
    #[serde(flatten)]
    pub response: Response,
}

impl ResponseEnvelope {
    pub fn new(id: u64, response: Response) -> Self {
        Self { id, response }
    }
}

/// Why a request was rejected, so clients can branch without string matching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    OutOfRange,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum Response {
    #[serde(rename = "ok")]
    Ok(ResponseData),
    #[serde(rename = "error")]
    Error { kind: ErrorKind, message: String },
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok(ResponseData::none())
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Response::Error { kind, message: message.into() }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::error(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::error(ErrorKind::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::error(ErrorKind::Internal, message)
    }
}

/// Response data - sparse by design, only the relevant field is populated
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SnapshotView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<Profile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streaming: Option<bool>,
}

impl ResponseData {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn string(v: impl Into<String>) -> Self {
        Self { value: Some(v.into()), ..Self::default() }
    }

    pub fn snapshot(view: SnapshotView) -> Self {
        Self { snapshot: Some(view), ..Self::default() }
    }

    pub fn profile(profile: Profile) -> Self {
        Self { profile: Some(profile), ..Self::default() }
    }

    pub fn streaming() -> Self {
        Self { streaming: Some(true), ..Self::default() }
    }
}

/// Full engine state view returned by `GetSnapshot` and pushed to stream
/// subscribers on every tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotView {
    /// Strictly increasing tick sequence number
    pub sequence: u64,
    pub timestamp_ms: u64,
    /// Devices with channels and lifecycle states
    pub devices: Vec<Device>,
    /// Readings collected this tick (absent channel = omitted this tick)
    pub readings: HashMap<ChannelId, SensorReading>,
    /// Last duty actually written per channel
    pub commands: HashMap<ChannelId, Command>,
    /// Active profile set
    pub profiles: Vec<Profile>,
    /// Manual overrides currently in force
    pub overrides: Vec<OverrideView>,
}

/// Client-visible override state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideView {
    pub channel_id: ChannelId,
    pub duty: f64,
    pub expires_in_ms: u64,
}

/// Engine-side event pushed to stream subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A device changed lifecycle state
    Lifecycle {
        device_id: DeviceId,
        state: LifecycleState,
    },
    /// A channel was driven to its fail-safe duty after losing control data
    FailSafe {
        channel_id: ChannelId,
        duty: f64,
    },
    /// A manual override expired or was cleared
    OverrideCleared {
        channel_id: ChannelId,
    },
}

/// Frame written to a streaming subscriber
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum StreamMessage {
    Snapshot(SnapshotView),
    Event(EngineEvent),
}

#[cfg(test)]
mod tests {
    use super::*;
    use aquilo_core::{CurvePoint, ProfileKind};

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
    fn test_request_round_trip() {
        let envelope = RequestEnvelope::new(Request::SetOverride {
            channel_id: ChannelId::new("dev0/fan1"),
            duty: 80.0,
            ttl_ms: 5000,
        });
        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: RequestEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, envelope.id);
        assert_eq!(parsed.request.type_name(), "SetOverride");
    }

    #[test]
    fn test_validate_rejects_empty_curve() {
        let request = Request::SetProfile { profile: curve_profile(vec![]) };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_sorted_curve() {
        let request = Request::SetProfile {
            profile: curve_profile(vec![
                CurvePoint { temperature: 30.0, duty: 20.0 },
                CurvePoint { temperature: 60.0, duty: 70.0 },
            ]),
        };
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_override() {
        let request = Request::SetOverride {
            channel_id: ChannelId::new("dev0/fan1"),
            duty: 140.0,
            ttl_ms: 5000,
        };
        assert!(request.validate().is_err());

        let request = Request::SetOverride {
            channel_id: ChannelId::new("dev0/fan1"),
            duty: 50.0,
            ttl_ms: 0,
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_error_response_serialization() {
        let response = Response::validation("curve must have at least one point");
        let json = serde_json::to_string(&ResponseEnvelope::new(7, response)).unwrap();
        assert!(json.contains("\"status\":\"error\""));
        assert!(json.contains("\"kind\":\"validation\""));
    }

    #[test]
    fn test_stream_message_tagging() {
        let message = StreamMessage::Event(EngineEvent::FailSafe {
            channel_id: ChannelId::new("dev0/fan1"),
            duty: 100.0,
        });
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"frame\":\"event\""));
        assert!(json.contains("\"event\":\"fail_safe\""));
    }
}
