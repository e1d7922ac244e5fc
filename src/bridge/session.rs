//! Capture sessions
//!
//! A [`Session`] is one consumer's handle on a video node. It moves through
//! `Idle -> Requested -> Streaming -> Requested ... -> Closing` and turns each
//! consumer operation into events for the pipeline. Operations of one
//! session are serialized by its operation lock, so its events reach the
//! pipeline in the order they were issued. Blocking dequeue does not take
//! that lock.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::device::{DeviceCoordinator, DeviceState, StreamDefaults};
use super::event::{Event, EventKind, Payload, ScratchBuffer};
use crate::error::{BridgeError, Result};
use crate::status::BridgeStatus;
use crate::video::buffer::{
    Backing, BufferCount, BufferId, BufferState, BufferStatus, ExternalHandle, StateCounts,
};
use crate::video::format::{
    try_format, FrameInterval, NegotiatedFormat, PixelFormat, Rect, Resolution, FRAME_MAX_HEIGHT,
    FRAME_MAX_WIDTH,
};
use crate::video::sensor::{CapsMode, CapsSupports};

/// Session identity, unique per device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No buffers
    Idle,
    /// Buffers allocated, not streaming
    Requested,
    /// Buffers flow between consumer and pipeline
    Streaming,
    /// Terminal
    Closing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Requested => write!(f, "requested"),
            SessionState::Streaming => write!(f, "streaming"),
            SessionState::Closing => write!(f, "closing"),
        }
    }
}

/// Selection rectangle to report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionTarget {
    Crop,
    CropDefault,
    CropBounds,
    Compose,
    ComposeDefault,
    ComposeBounds,
}

/// A completed buffer handed back to the consumer
#[derive(Debug, Clone)]
pub struct DequeuedBuffer {
    pub index: BufferId,
    pub sequence: u64,
    pub bytes_used: usize,
    pub backing: Backing,
    pub completed_at: Option<Instant>,
}

/// Per-session state kept by the device coordinator
#[derive(Debug, Clone)]
pub(crate) struct SessionRecord {
    pub(crate) state: SessionState,
    pub(crate) stream_id: Option<i32>,
    /// `NewStream` was posted and `DelStream` is owed on close
    pub(crate) announced: bool,
    pub(crate) format: NegotiatedFormat,
    pub(crate) crop: Rect,
    pub(crate) compose: Rect,
    pub(crate) interval: FrameInterval,
    /// Sequence number of the next completed buffer
    pub(crate) sequence: u64,
    /// Smallest buffer held, 0 without buffers
    pub(crate) buffer_size: usize,
}

impl SessionRecord {
    pub(crate) fn new(defaults: &StreamDefaults) -> Self {
        let mut record = Self {
            state: SessionState::Idle,
            stream_id: None,
            announced: false,
            format: defaults.format,
            crop: Rect::default(),
            compose: Rect::default(),
            interval: defaults.interval,
            sequence: 0,
            buffer_size: 0,
        };
        record.reset(defaults);
        record
    }

    pub(crate) fn reset(&mut self, defaults: &StreamDefaults) {
        self.format = defaults.format;
        self.interval = defaults.interval;
        self.crop = Rect::full(defaults.sensor_bounds);
        self.compose = Rect::full(defaults.format.resolution);
    }
}

fn record_mut(
    sessions: &mut HashMap<SessionId, SessionRecord>,
    id: SessionId,
) -> Result<&mut SessionRecord> {
    sessions
        .get_mut(&id)
        .ok_or_else(|| BridgeError::InvalidState(format!("{} is closed", id)))
}

fn invalid_state(id: SessionId, op: &str, state: SessionState) -> BridgeError {
    BridgeError::InvalidState(format!("{}: cannot {} while {}", id, op, state))
}

const MAX_FRAME: Resolution = Resolution {
    width: FRAME_MAX_WIDTH,
    height: FRAME_MAX_HEIGHT,
};

/// Consumer handle on a video node
///
/// Dropping the handle without calling [`Session::close`] closes it
/// implicitly (abrupt close).
pub struct Session {
    id: SessionId,
    device: Arc<DeviceCoordinator>,
    scratch: Arc<ScratchBuffer>,
    op_lock: Mutex<()>,
    closed: AtomicBool,
}

impl Session {
    pub(crate) fn new(id: SessionId, device: Arc<DeviceCoordinator>, scratch: Arc<ScratchBuffer>) -> Self {
        Self {
            id,
            device,
            scratch,
            op_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn device(&self) -> &Arc<DeviceCoordinator> {
        &self.device
    }

    /// Scratch region used for this session's out-of-band payloads
    pub fn scratch_addr(&self) -> u64 {
        self.scratch.addr()
    }

    pub fn state(&self) -> Result<SessionState> {
        let mut state = self.device.state.lock();
        Ok(record_mut(&mut state.sessions, self.id)?.state)
    }

    pub fn stream_id(&self) -> Result<Option<i32>> {
        let mut state = self.device.state.lock();
        Ok(record_mut(&mut state.sessions, self.id)?.stream_id)
    }

    /// Buffer counts per ownership state
    pub fn buffer_counts(&self) -> StateCounts {
        self.device.state.lock().pool.counts(self.id)
    }

    fn event(&self, kind: EventKind, stream_id: Option<i32>) -> Event {
        Event::new(kind).stream(stream_id).session(self.id)
    }

    fn post_sync(&self, event: Event) -> Result<()> {
        self.device.channel.send(event, true)
    }

    /// Post in-flight buffer `index` to the pipeline
    ///
    /// A buffer no listener accepted completes with an error right away.
    fn hand_over(&self, stream_id: Option<i32>, index: BufferId, addr: Option<u64>) -> Result<()> {
        let event = self
            .event(EventKind::BufferQueued, stream_id)
            .payload(Payload::Buffer { index, addr });
        if self.device.channel.post_async(event) == 0 {
            self.device.fail_in_flight(self.id, index)?;
        }
        Ok(())
    }

    fn publish(&self, stream_id: Option<i32>, state: SessionState) {
        self.device.publish_state(self.id, stream_id, state);
    }

    /// Bind the session to a pipeline stream; negative ids unbind
    pub fn set_stream_id(&self, stream_id: i32) -> Result<()> {
        let _op = self.op_lock.lock();
        let mut state = self.device.state.lock();
        let record = record_mut(&mut state.sessions, self.id)?;
        if record.announced || record.state == SessionState::Streaming {
            return Err(BridgeError::InvalidState(format!(
                "{} already announced stream {:?}",
                self.id, record.stream_id
            )));
        }
        record.stream_id = (stream_id >= 0).then_some(stream_id);
        debug!("{} bound to stream {:?}", self.id, record.stream_id);
        Ok(())
    }

    /// Allocate `count` buffers from the reserved memory
    ///
    /// The grant may be smaller than the request (clamp-to-fit). A count of
    /// zero releases every buffer and returns the session to idle.
    pub fn request_buffers(&self, count: u32) -> Result<BufferCount> {
        let _op = self.op_lock.lock();
        let (granted, stream_id, announce, format) = {
            let mut state = self.device.state.lock();
            let DeviceState { pool, sessions, .. } = &mut *state;
            let (current, stream_id) = {
                let record = record_mut(sessions, self.id)?;
                (record.state, record.stream_id)
            };
            if matches!(current, SessionState::Streaming | SessionState::Closing) {
                return Err(invalid_state(self.id, "request buffers", current));
            }
            if let Some(sid) = stream_id {
                let busy = sessions.iter().any(|(other, r)| {
                    *other != self.id && r.stream_id == Some(sid) && !pool.is_empty(*other)
                });
                if busy {
                    return Err(BridgeError::Busy(format!("stream {} is in use", sid)));
                }
            }

            let record = record_mut(sessions, self.id)?;
            if count == 0 {
                pool.release_all(self.id)?;
                record.state = SessionState::Idle;
                record.buffer_size = 0;
                drop(state);
                self.publish(stream_id, SessionState::Idle);
                return Ok(BufferCount {
                    requested: 0,
                    granted: 0,
                });
            }

            let size = record.format.size_image as usize;
            let granted = pool.allocate(self.id, count, size)?;
            record.state = SessionState::Requested;
            record.buffer_size = size;
            let announce = stream_id.is_some() && !record.announced;
            record.announced |= announce;
            (granted, stream_id, announce, record.format)
        };

        info!(
            "{} got {}/{} buffers of {} bytes",
            self.id, granted.granted, granted.requested, format.size_image
        );
        self.publish(stream_id, SessionState::Requested);
        self.announce(stream_id, announce, &format)?;
        Ok(granted)
    }

    /// Use externally allocated buffers instead of reserved memory
    pub fn import_buffers(&self, handles: &[(ExternalHandle, usize)]) -> Result<BufferCount> {
        let _op = self.op_lock.lock();
        let (granted, stream_id, announce, format) = {
            let mut state = self.device.state.lock();
            let DeviceState { pool, sessions, .. } = &mut *state;
            let record = record_mut(sessions, self.id)?;
            if matches!(record.state, SessionState::Streaming | SessionState::Closing) {
                return Err(invalid_state(self.id, "import buffers", record.state));
            }
            let granted = pool.import(self.id, handles)?;
            record.state = SessionState::Requested;
            record.buffer_size = handles.iter().map(|(_, len)| *len).min().unwrap_or(0);
            let announce = record.stream_id.is_some() && !record.announced;
            record.announced |= announce;
            (granted, record.stream_id, announce, record.format)
        };

        self.publish(stream_id, SessionState::Requested);
        self.announce(stream_id, announce, &format)?;
        Ok(granted)
    }

    /// Tell the pipeline about the stream and its format
    fn announce(&self, stream_id: Option<i32>, announce: bool, format: &NegotiatedFormat) -> Result<()> {
        if stream_id.is_none() {
            return Ok(());
        }
        if announce {
            self.post_sync(self.event(EventKind::NewStream, stream_id))?;
        }
        self.post_sync(self.event(EventKind::SetFormat, stream_id).payload(Payload::Format {
            width: format.resolution.width,
            height: format.resolution.height,
            fourcc: format.format.fourcc_u32(),
        }))
    }

    /// Hand buffer `index` to the device
    ///
    /// While streaming the buffer goes straight to the pipeline.
    pub fn queue_buffer(&self, index: BufferId) -> Result<()> {
        let _op = self.op_lock.lock();
        let post = {
            let mut state = self.device.state.lock();
            let DeviceState { pool, sessions, .. } = &mut *state;
            let record = record_mut(sessions, self.id)?;
            if !matches!(record.state, SessionState::Requested | SessionState::Streaming) {
                return Err(invalid_state(self.id, "queue buffers", record.state));
            }
            let len = pool.buffer(self.id, index)?.backing.len();
            if len < record.format.size_image as usize {
                return Err(BridgeError::InvalidArgument(format!(
                    "buffer {} holds {} bytes, frame needs {}",
                    index, len, record.format.size_image
                )));
            }
            pool.mark_queued(self.id, index)?;
            if record.state == SessionState::Streaming {
                pool.mark_in_flight(self.id, index)?;
                Some((record.stream_id, pool.buffer(self.id, index)?.backing.addr()))
            } else {
                None
            }
        };

        if let Some((stream_id, addr)) = post {
            self.hand_over(stream_id, index, addr)?;
        }
        Ok(())
    }

    /// Take the oldest completed buffer
    ///
    /// Flushed buffers surface as [`BridgeError::BufferError`]. A blocking
    /// call waits until a buffer completes or the stream stops.
    pub fn dequeue_buffer(&self, blocking: bool) -> Result<DequeuedBuffer> {
        let mut state = self.device.state.lock();
        loop {
            if state.shut_down {
                return Err(BridgeError::InvalidState(format!(
                    "device {} is shut down",
                    self.device.id()
                )));
            }
            let current = record_mut(&mut state.sessions, self.id)?.state;
            if let Some(buffer) = state.pool.take_done(self.id) {
                return match buffer.status {
                    BufferStatus::Ok => Ok(DequeuedBuffer {
                        index: buffer.index,
                        sequence: buffer.sequence.unwrap_or(0),
                        bytes_used: buffer.bytes_used,
                        backing: buffer.backing,
                        completed_at: buffer.completed_at,
                    }),
                    BufferStatus::Error => Err(BridgeError::BufferError {
                        index: buffer.index,
                    }),
                };
            }
            if current != SessionState::Streaming {
                return Err(invalid_state(self.id, "dequeue", current));
            }
            if !blocking {
                return Err(BridgeError::WouldBlock);
            }
            self.device.buffers_ready.wait(&mut state);
        }
    }

    /// Start streaming queued buffers to the pipeline
    ///
    /// If the pipeline fails `StartStream` the session stays streaming and
    /// its queued buffers stay queued; `stop_stream` returns them as errors.
    pub fn start_stream(&self) -> Result<()> {
        let _op = self.op_lock.lock();
        let stream_id = {
            let mut state = self.device.state.lock();
            let DeviceState { pool, sessions, .. } = &mut *state;
            let record = record_mut(sessions, self.id)?;
            if record.state != SessionState::Requested {
                return Err(invalid_state(self.id, "start", record.state));
            }
            let Some(stream_id) = record.stream_id else {
                return Err(BridgeError::InvalidState(format!(
                    "{} has no stream id",
                    self.id
                )));
            };
            if pool.counts(self.id).queued == 0 {
                return Err(BridgeError::InvalidState(format!(
                    "{} has no queued buffers",
                    self.id
                )));
            }
            stream_id
        };

        self.device.try_activate(self.id)?;
        if let Some(record) = self.device.state.lock().sessions.get_mut(&self.id) {
            record.state = SessionState::Streaming;
        }
        info!("{} streaming on device {} stream {}", self.id, self.device.id(), stream_id);
        self.publish(Some(stream_id), SessionState::Streaming);

        self.device.sensor_stream(true);
        if let Err(e) = self.post_sync(self.event(EventKind::StartStream, Some(stream_id))) {
            warn!(
                "{} start on device {} failed ({}), queued buffers held until stop",
                self.id,
                self.device.id(),
                e
            );
            return Err(e);
        }

        let handed = {
            let mut state = self.device.state.lock();
            let pool = &mut state.pool;
            let mut handed = Vec::new();
            for index in pool.indices_in(self.id, BufferState::Queued) {
                pool.mark_in_flight(self.id, index)?;
                handed.push((index, pool.buffer(self.id, index)?.backing.addr()));
            }
            handed
        };
        for (index, addr) in handed {
            self.hand_over(Some(stream_id), index, addr)?;
        }
        Ok(())
    }

    /// Stop streaming; outstanding buffers complete with an error
    pub fn stop_stream(&self) -> Result<()> {
        let _op = self.op_lock.lock();
        self.stop_locked()
    }

    fn stop_locked(&self) -> Result<()> {
        let stream_id = {
            let mut state = self.device.state.lock();
            let record = record_mut(&mut state.sessions, self.id)?;
            if record.state != SessionState::Streaming {
                return Ok(());
            }
            record.state = SessionState::Requested;
            record.stream_id
        };

        self.device.sensor_stream(false);
        let result = self.post_sync(self.event(EventKind::StopStream, stream_id));
        self.device.deactivate(self.id);

        let flushed = {
            let mut state = self.device.state.lock();
            let DeviceState { pool, sessions, .. } = &mut *state;
            match sessions.get_mut(&self.id) {
                Some(record) => {
                    let flushed = pool.flush(self.id, || {
                        let sequence = record.sequence;
                        record.sequence += 1;
                        sequence
                    });
                    record.sequence = 0;
                    flushed
                }
                None => Vec::new(),
            }
        };
        self.device.buffers_ready.notify_all();

        info!(
            "{} stopped on device {}, {} buffers flushed",
            self.id,
            self.device.id(),
            flushed.len()
        );
        if !flushed.is_empty() {
            self.device.channel.publish(BridgeStatus::BuffersFlushed {
                device: self.device.id(),
                session: self.id.0,
                count: flushed.len(),
            });
        }
        self.publish(stream_id, SessionState::Requested);
        result
    }

    /// Negotiate and apply a capture format
    pub fn set_format(&self, width: u32, height: u32, format: PixelFormat) -> Result<NegotiatedFormat> {
        let _op = self.op_lock.lock();
        let stream_id = {
            let mut state = self.device.state.lock();
            let record = record_mut(&mut state.sessions, self.id)?;
            if matches!(record.state, SessionState::Streaming | SessionState::Closing) {
                return Err(invalid_state(self.id, "set format", record.state));
            }
            record.stream_id
        };

        self.post_sync(self.event(EventKind::CreatePipeline, stream_id))?;

        let (negotiated, compose, announced) = {
            let mut state = self.device.state.lock();
            let DeviceState {
                pool,
                sessions,
                formats,
                ..
            } = &mut *state;
            let negotiated = try_format(width, height, format, formats)?;
            let record = record_mut(sessions, self.id)?;
            if record.state == SessionState::Streaming {
                return Err(invalid_state(self.id, "set format", record.state));
            }
            if !pool.is_empty(self.id) && negotiated.size_image as usize > record.buffer_size {
                return Err(BridgeError::InvalidState(format!(
                    "{} byte frames exceed the {} byte buffers already allocated",
                    negotiated.size_image, record.buffer_size
                )));
            }
            record.format = negotiated;
            record.compose = Rect::full(negotiated.resolution);
            (negotiated, record.compose, record.announced)
        };
        debug!(
            "{} format {} {} ({} bytes)",
            self.id, negotiated.resolution, negotiated.format, negotiated.size_image
        );

        self.scratch.write_rect(&compose);
        self.post_sync(self.event(EventKind::SetCompose, stream_id).payload(self.scratch.payload()))?;
        if announced {
            self.post_sync(self.event(EventKind::SetFormat, stream_id).payload(Payload::Format {
                width: negotiated.resolution.width,
                height: negotiated.resolution.height,
                fourcc: negotiated.format.fourcc_u32(),
            }))?;
        }
        Ok(negotiated)
    }

    /// Negotiate a format without applying it
    pub fn try_format(&self, width: u32, height: u32, format: PixelFormat) -> Result<NegotiatedFormat> {
        let state = self.device.state.lock();
        try_format(width, height, format, &state.formats)
    }

    pub fn format(&self) -> Result<NegotiatedFormat> {
        let mut state = self.device.state.lock();
        Ok(record_mut(&mut state.sessions, self.id)?.format)
    }

    pub fn set_crop(&self, rect: Rect) -> Result<Rect> {
        self.set_selection(EventKind::SetCrop, rect)
    }

    pub fn set_compose(&self, rect: Rect) -> Result<Rect> {
        self.set_selection(EventKind::SetCompose, rect)
    }

    fn set_selection(&self, kind: EventKind, rect: Rect) -> Result<Rect> {
        let _op = self.op_lock.lock();
        let (has_mode, stream_id) = {
            let mut state = self.device.state.lock();
            let has_mode = state.camera.is_some();
            let record = record_mut(&mut state.sessions, self.id)?;
            if record.state == SessionState::Closing {
                return Err(invalid_state(self.id, "set selection", record.state));
            }
            (has_mode, record.stream_id)
        };
        if !has_mode {
            self.post_sync(self.event(EventKind::CreatePipeline, stream_id))?;
        }

        let bounds = if kind == EventKind::SetCrop {
            self.device.state.lock().defaults.sensor_bounds
        } else {
            MAX_FRAME
        };
        rect.validate_within(bounds)?;

        self.scratch.write_rect(&rect);
        self.post_sync(self.event(kind, stream_id).payload(self.scratch.payload()))?;
        let applied = self.scratch.read_rect().unwrap_or(rect);

        let mut state = self.device.state.lock();
        let record = record_mut(&mut state.sessions, self.id)?;
        if kind == EventKind::SetCrop {
            record.crop = applied;
        } else {
            record.compose = applied;
        }
        Ok(applied)
    }

    /// Current crop or compose rectangle, or their default and bounds
    pub fn selection(&self, target: SelectionTarget) -> Result<Rect> {
        let mut state = self.device.state.lock();
        let sensor_bounds = state.defaults.sensor_bounds;
        let record = record_mut(&mut state.sessions, self.id)?;
        Ok(match target {
            SelectionTarget::Crop => record.crop,
            SelectionTarget::CropDefault | SelectionTarget::CropBounds => Rect::full(sensor_bounds),
            SelectionTarget::Compose => record.compose,
            SelectionTarget::ComposeDefault | SelectionTarget::ComposeBounds => {
                Rect::new(0, 0, record.crop.width, record.crop.height)
            }
        })
    }

    /// Change the frame rate
    ///
    /// A zero numerator or denominator keeps the current interval; the rate
    /// is still pushed to the pipeline.
    pub fn set_frame_interval(&self, interval: FrameInterval) -> Result<FrameInterval> {
        let _op = self.op_lock.lock();
        let applied = {
            let mut state = self.device.state.lock();
            let max_fps = state
                .camera
                .map(|m| m.fps)
                .unwrap_or(self.device.config().fps);
            let record = record_mut(&mut state.sessions, self.id)?;
            if interval.denominator > max_fps {
                return Err(BridgeError::InvalidArgument(format!(
                    "{} fps exceeds the sensor's {} fps",
                    interval.denominator, max_fps
                )));
            }
            if !interval.is_unset() {
                record.interval = interval;
            }
            record.interval
        };

        let request = serde_json::json!({ "id": "s.fps", "fps": applied.denominator });
        self.device.set_ext_control(&request.to_string())?;
        Ok(applied)
    }

    pub fn frame_interval(&self) -> Result<FrameInterval> {
        let mut state = self.device.state.lock();
        Ok(record_mut(&mut state.sessions, self.id)?.interval)
    }

    /// Send a JSON control request and return the pipeline's response
    pub fn control(&self, id: u32, request: &str) -> Result<String> {
        let _op = self.op_lock.lock();
        let stream_id = self.stream_id()?;
        self.scratch.write_str(request)?;
        self.post_sync(self.event(EventKind::PassJson, stream_id).payload(Payload::Control {
            id,
            addr: self.scratch.addr(),
        }))?;
        Ok(self.scratch.read_str())
    }

    /// Select a capability mode; the pipeline's status is the result
    pub fn set_caps_mode(&self, mode: CapsMode) -> Result<()> {
        let _op = self.op_lock.lock();
        self.device.state.lock().caps_mode = mode;
        self.post_sync(
            self.event(EventKind::SetCapsMode, Some(0))
                .payload(Payload::Device(self.device.id())),
        )
    }

    /// Ask the pipeline for its capability table
    ///
    /// Waits for the first capabilities subscriber, bounded by the event
    /// timeout.
    pub fn get_caps_supports(&self) -> Result<CapsSupports> {
        let _op = self.op_lock.lock();
        let channel = &self.device.channel;
        let timeout = channel.config().event_timeout();
        if !channel.registry().wait_for_first_subscriber(timeout) {
            return Err(BridgeError::TimedOut {
                kind: EventKind::GetCapsSupports,
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        self.post_sync(
            self.event(EventKind::GetCapsSupports, Some(0))
                .payload(Payload::Device(self.device.id())),
        )?;
        Ok(self.device.caps_supports())
    }

    /// Allocate auxiliary reserved memory, freed at the latest on close
    pub fn alloc_extra(&self, size: usize) -> Result<Backing> {
        let _op = self.op_lock.lock();
        let mut state = self.device.state.lock();
        record_mut(&mut state.sessions, self.id)?;
        state.pool.alloc_extra(self.id, size)
    }

    pub fn free_extra(&self, addr: u64) -> Result<()> {
        let _op = self.op_lock.lock();
        self.device.state.lock().pool.free_extra(self.id, addr)
    }

    /// Close the session
    ///
    /// Stops streaming, withdraws an announced stream and releases every
    /// buffer. Teardown continues past pipeline errors; the first one is
    /// returned.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _op = self.op_lock.lock();
        let mut first_error = self.stop_locked().err();

        let (announced, stream_id) = {
            let state = self.device.state.lock();
            match state.sessions.get(&self.id) {
                Some(record) => (record.announced, record.stream_id),
                None => (false, None),
            }
        };
        if announced {
            if let Err(e) = self.post_sync(self.event(EventKind::DelStream, stream_id)) {
                first_error.get_or_insert(e);
            }
            self.device.reset_telemetry();
        }

        {
            let mut state = self.device.state.lock();
            if let Err(e) = state.pool.remove_owner(self.id) {
                first_error.get_or_insert(e);
            }
            if let Some(record) = state.sessions.get_mut(&self.id) {
                record.state = SessionState::Closing;
            }
            state.sessions.remove(&self.id);
        }
        self.device.deactivate(self.id);
        self.device.buffers_ready.notify_all();
        self.device.channel.release_scratch(self.scratch.addr());
        self.publish(stream_id, SessionState::Closing);
        debug!("Closed {} on device {}", self.id, self.device.id());

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.close() {
            error!("Abrupt close of {} failed: {}", self.id, e);
        }
    }
}
