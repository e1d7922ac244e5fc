//! Events exchanged between capture sessions and the pipeline

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::session::SessionId;
use crate::error::{BridgeError, Result};
use crate::video::format::Rect;

/// Stream id carried by events that are not bound to a stream
pub const UNBOUND_STREAM: i32 = -1;

/// Identity of one posted event, used to match its completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Event kinds understood by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NewStream,
    DelStream,
    StartStream,
    StopStream,
    SetFormat,
    SetCrop,
    SetCompose,
    /// Extended control, JSON string in a scratch region
    SetControl,
    /// Session control request, JSON response read back from scratch
    PassJson,
    BufferQueued,
    CreatePipeline,
    SetCapsMode,
    GetCapsSupports,
    Custom(u32),
}

impl EventKind {
    /// Every predefined kind
    pub const ALL: [EventKind; 13] = [
        EventKind::NewStream,
        EventKind::DelStream,
        EventKind::StartStream,
        EventKind::StopStream,
        EventKind::SetFormat,
        EventKind::SetCrop,
        EventKind::SetCompose,
        EventKind::SetControl,
        EventKind::PassJson,
        EventKind::BufferQueued,
        EventKind::CreatePipeline,
        EventKind::SetCapsMode,
        EventKind::GetCapsSupports,
    ];
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::NewStream => write!(f, "new_stream"),
            EventKind::DelStream => write!(f, "del_stream"),
            EventKind::StartStream => write!(f, "start_stream"),
            EventKind::StopStream => write!(f, "stop_stream"),
            EventKind::SetFormat => write!(f, "set_format"),
            EventKind::SetCrop => write!(f, "set_crop"),
            EventKind::SetCompose => write!(f, "set_compose"),
            EventKind::SetControl => write!(f, "set_control"),
            EventKind::PassJson => write!(f, "pass_json"),
            EventKind::BufferQueued => write!(f, "buffer_queued"),
            EventKind::CreatePipeline => write!(f, "create_pipeline"),
            EventKind::SetCapsMode => write!(f, "set_caps_mode"),
            EventKind::GetCapsSupports => write!(f, "get_caps_supports"),
            EventKind::Custom(id) => write!(f, "custom({})", id),
        }
    }
}

/// Event payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    #[default]
    None,
    /// Inline format for `SetFormat`
    Format { width: u32, height: u32, fourcc: u32 },
    /// Buffer handed to the pipeline
    Buffer { index: u32, addr: Option<u64> },
    /// Data placed in a registered scratch region
    Scratch { addr: u64, len: usize },
    /// Session control request in the scratch region at `addr`
    Control { id: u32, addr: u64 },
    /// Device-level request
    Device(u32),
}

/// A structured event posted to the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub kind: EventKind,
    pub stream_id: i32,
    /// Originating session; device-level control events have none
    pub session: Option<SessionId>,
    pub sync: bool,
    pub payload: Payload,
}

impl Event {
    /// New event; id and sync flag are assigned when posted
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: EventId(0),
            kind,
            stream_id: UNBOUND_STREAM,
            session: None,
            sync: false,
            payload: Payload::None,
        }
    }

    pub fn stream(mut self, stream_id: Option<i32>) -> Self {
        self.stream_id = stream_id.unwrap_or(UNBOUND_STREAM);
        self
    }

    pub fn session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }
}

/// Size of a session scratch region
pub const SESSION_SCRATCH_SIZE: usize = 4096;

/// Size of the device control scratch region
pub const CONTROL_SCRATCH_SIZE: usize = 64 * 1024;

const RECT_LEN: usize = 16;

/// Pre-registered region shared with the pipeline for out-of-band payloads
///
/// The poster fills it before posting and reads it back after completion;
/// the pipeline may rewrite it in between.
#[derive(Debug)]
pub struct ScratchBuffer {
    addr: u64,
    capacity: usize,
    data: Mutex<BytesMut>,
}

impl ScratchBuffer {
    pub fn new(addr: u64, capacity: usize) -> Self {
        Self {
            addr,
            capacity,
            data: Mutex::new(BytesMut::with_capacity(capacity)),
        }
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently held
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn write_rect(&self, rect: &Rect) {
        let mut data = self.data.lock();
        data.clear();
        data.put_i32_le(rect.left);
        data.put_i32_le(rect.top);
        data.put_u32_le(rect.width);
        data.put_u32_le(rect.height);
    }

    pub fn read_rect(&self) -> Option<Rect> {
        let data = self.data.lock();
        if data.len() < RECT_LEN {
            return None;
        }
        let mut buf = &data[..RECT_LEN];
        Some(Rect::new(
            buf.get_i32_le(),
            buf.get_i32_le(),
            buf.get_u32_le(),
            buf.get_u32_le(),
        ))
    }

    /// Store a string; the region must keep room for a terminator
    pub fn write_str(&self, s: &str) -> Result<()> {
        if s.len() >= self.capacity {
            return Err(BridgeError::InvalidArgument(format!(
                "{} bytes do not fit a {} byte scratch region",
                s.len(),
                self.capacity
            )));
        }
        let mut data = self.data.lock();
        data.clear();
        data.put_slice(s.as_bytes());
        Ok(())
    }

    /// Read the stored string up to the first NUL
    pub fn read_str(&self) -> String {
        let data = self.data.lock();
        let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
        String::from_utf8_lossy(&data[..end]).into_owned()
    }

    /// Payload referencing this region's current contents
    pub fn payload(&self) -> Payload {
        Payload::Scratch {
            addr: self.addr,
            len: self.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder() {
        let event = Event::new(EventKind::SetFormat)
            .stream(Some(2))
            .session(SessionId(5))
            .payload(Payload::Format {
                width: 1920,
                height: 1080,
                fourcc: 0x5659_5559,
            });
        assert_eq!(event.stream_id, 2);
        assert_eq!(event.session, Some(SessionId(5)));
        assert!(!event.sync);

        let unbound = Event::new(EventKind::CreatePipeline).stream(None);
        assert_eq!(unbound.stream_id, UNBOUND_STREAM);
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::new(EventKind::Custom(9)).payload(Payload::Device(1));
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert_eq!(EventKind::Custom(9).to_string(), "custom(9)");
    }

    #[test]
    fn test_scratch_rect() {
        let scratch = ScratchBuffer::new(0x1000, SESSION_SCRATCH_SIZE);
        assert_eq!(scratch.read_rect(), None);
        scratch.write_rect(&Rect::new(16, 8, 1280, 720));
        assert_eq!(scratch.read_rect(), Some(Rect::new(16, 8, 1280, 720)));
        assert_eq!(scratch.len(), 16);
    }

    #[test]
    fn test_scratch_str() {
        let scratch = ScratchBuffer::new(0x2000, 16);
        scratch.write_str(r#"{"id":1}"#).unwrap();
        assert_eq!(scratch.read_str(), r#"{"id":1}"#);
        assert!(scratch.write_str("0123456789abcdef").is_err());
    }
}
