//! Bridge status event types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status event enumeration
///
/// Serialized as
/// ```json
/// {
///   "event": "session.state_changed",
///   "data": { "device": 0, "session": 3, "stream_id": 0, "state": "streaming", ... }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum BridgeStatus {
    /// Session moved between idle, requested, streaming and closing
    #[serde(rename = "session.state_changed")]
    SessionStateChanged {
        device: u32,
        session: u64,
        stream_id: Option<i32>,
        state: String,
        timestamp: DateTime<Utc>,
    },

    /// Outstanding buffers failed back to the consumer on stream stop
    #[serde(rename = "session.buffers_flushed")]
    BuffersFlushed {
        device: u32,
        session: u64,
        count: usize,
    },

    /// Frame-rate window closed
    #[serde(rename = "telemetry.frame_rate")]
    FrameRate {
        device: u32,
        stream_id: Option<i32>,
        frames: u64,
        elapsed_ms: u64,
        fps: f64,
    },

    /// Pipeline listener attached to a device
    #[serde(rename = "pipeline.connected")]
    PipelineConnected { device: u32, listener: u64 },

    /// Pipeline listener detached (orderly or crashed)
    #[serde(rename = "pipeline.disconnected")]
    PipelineDisconnected { device: u32, listener: u64 },

    /// Synchronous event not acknowledged in time
    #[serde(rename = "event.timed_out")]
    EventTimedOut {
        device: u32,
        event_id: u64,
        kind: String,
        timeout_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

impl BridgeStatus {
    /// Get the event name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::SessionStateChanged { .. } => "session.state_changed",
            Self::BuffersFlushed { .. } => "session.buffers_flushed",
            Self::FrameRate { .. } => "telemetry.frame_rate",
            Self::PipelineConnected { .. } => "pipeline.connected",
            Self::PipelineDisconnected { .. } => "pipeline.disconnected",
            Self::EventTimedOut { .. } => "event.timed_out",
        }
    }

    /// Device the event refers to
    pub fn device(&self) -> u32 {
        match self {
            Self::SessionStateChanged { device, .. }
            | Self::BuffersFlushed { device, .. }
            | Self::FrameRate { device, .. }
            | Self::PipelineConnected { device, .. }
            | Self::PipelineDisconnected { device, .. }
            | Self::EventTimedOut { device, .. } => *device,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_shape() {
        let status = BridgeStatus::PipelineConnected {
            device: 1,
            listener: 7,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["event"], "pipeline.connected");
        assert_eq!(json["data"]["listener"], 7);
        assert_eq!(status.event_name(), "pipeline.connected");
        assert_eq!(status.device(), 1);
    }
}
