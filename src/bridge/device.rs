//! Device coordinator
//!
//! One coordinator per video node. It owns the buffer pool, the records of
//! every open session, the active-streamer slot and the event channel, and
//! serves the pipeline-facing entry points (completions, buffer done, sensor
//! mode, capability tables).

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::channel::EventChannel;
use super::event::{Event, EventKind, ScratchBuffer, CONTROL_SCRATCH_SIZE, SESSION_SCRATCH_SIZE};
use super::pipeline::PipelineListener;
use super::session::{Session, SessionId, SessionRecord, SessionState};
use crate::config::{ChannelConfig, DeviceConfig, TelemetryConfig};
use crate::error::{BridgeError, Result};
use crate::status::{BridgeStatus, StatusBus};
use crate::utils::LogThrottler;
use crate::video::buffer::{BufferId, BufferPool, BufferStatus};
use crate::video::format::{
    try_format, FrameInterval, FrameSizeRange, NegotiatedFormat, PixelFormat, Resolution,
};
use crate::video::sensor::{CapsMode, CapsSupports, SensorControl, SensorMode};
use crate::video::telemetry::FpsMeter;
use crate::warn_throttled;

/// Video node index
pub type DeviceId = u32;

/// Format and rate a freshly opened session starts with
#[derive(Debug, Clone, Copy)]
pub(crate) struct StreamDefaults {
    pub(crate) format: NegotiatedFormat,
    pub(crate) interval: FrameInterval,
    /// Crop bounds (sensor size, or the configured size before a mode is known)
    pub(crate) sensor_bounds: Resolution,
}

/// Mutable device state, guarded by one mutex
pub(crate) struct DeviceState {
    pub(crate) pool: BufferPool,
    pub(crate) sessions: HashMap<SessionId, SessionRecord>,
    pub(crate) camera: Option<SensorMode>,
    pub(crate) formats: Vec<PixelFormat>,
    pub(crate) defaults: StreamDefaults,
    pub(crate) caps_mode: CapsMode,
    pub(crate) caps_supports: CapsSupports,
    pub(crate) shut_down: bool,
}

/// Static device capabilities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCaps {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub capture: bool,
    pub streaming: bool,
    pub time_per_frame: bool,
}

/// Builder for [`DeviceCoordinator`]
pub struct DeviceCoordinatorBuilder {
    config: DeviceConfig,
    channel: ChannelConfig,
    telemetry: TelemetryConfig,
    status: Option<Arc<StatusBus>>,
    sensor: Option<Arc<dyn SensorControl>>,
}

impl DeviceCoordinatorBuilder {
    pub fn channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    pub fn telemetry(mut self, telemetry: TelemetryConfig) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn status(mut self, status: Arc<StatusBus>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn sensor(mut self, sensor: Arc<dyn SensorControl>) -> Self {
        self.sensor = Some(sensor);
        self
    }

    pub fn build(self) -> Result<Arc<DeviceCoordinator>> {
        let config = self.config;
        let format = try_format(config.width, config.height, config.format, &PixelFormat::BASE)
            .map_err(|e| BridgeError::Config(format!("device {}: {}", config.id, e)))?;
        if config.reserved_size == 0 {
            return Err(BridgeError::Config(format!(
                "device {} has no reserved memory",
                config.id
            )));
        }
        if self.channel.listener_queue_depth == 0 {
            return Err(BridgeError::Config(
                "listener queue depth must be at least 1".to_string(),
            ));
        }
        if self.telemetry.enabled && self.telemetry.window_ms == 0 {
            return Err(BridgeError::Config(
                "telemetry window must be non-zero".to_string(),
            ));
        }

        let defaults = StreamDefaults {
            format,
            interval: FrameInterval::from_fps(config.fps),
            sensor_bounds: Resolution::new(config.width, config.height),
        };
        let channel = EventChannel::new(config.id, self.channel, self.status);
        let control_scratch = channel.register_scratch(CONTROL_SCRATCH_SIZE);
        let telemetry = self.telemetry.enabled.then(|| {
            Mutex::new(FpsMeter::new(
                Duration::from_millis(self.telemetry.window_ms),
                self.telemetry.warmup_windows,
            ))
        });

        info!(
            "Device {}: {} bytes reserved at {:#x}, default {} {}",
            config.id, config.reserved_size, config.reserved_base, format.resolution, format.format
        );

        Ok(Arc::new(DeviceCoordinator {
            id: config.id,
            state: Mutex::new(DeviceState {
                pool: BufferPool::new(config.reserved_base, config.reserved_size),
                sessions: HashMap::new(),
                camera: None,
                formats: PixelFormat::BASE.to_vec(),
                defaults,
                caps_mode: CapsMode::default(),
                caps_supports: CapsSupports::default(),
                shut_down: false,
            }),
            config,
            channel,
            buffers_ready: Condvar::new(),
            active: AtomicU64::new(0),
            next_session: AtomicU64::new(1),
            sensor: self.sensor,
            telemetry,
            control_scratch,
            control_lock: Mutex::new(()),
            throttle: LogThrottler::default(),
        }))
    }
}

/// Coordinator of one video node
pub struct DeviceCoordinator {
    id: DeviceId,
    config: DeviceConfig,
    pub(crate) channel: EventChannel,
    pub(crate) state: Mutex<DeviceState>,
    /// Signalled when a buffer completes or a stream stops
    pub(crate) buffers_ready: Condvar,
    /// Session id holding the streaming slot, 0 when free
    active: AtomicU64,
    next_session: AtomicU64,
    sensor: Option<Arc<dyn SensorControl>>,
    telemetry: Option<Mutex<FpsMeter>>,
    control_scratch: Arc<ScratchBuffer>,
    control_lock: Mutex<()>,
    throttle: LogThrottler,
}

impl DeviceCoordinator {
    pub fn builder(config: DeviceConfig) -> DeviceCoordinatorBuilder {
        DeviceCoordinatorBuilder {
            config,
            channel: ChannelConfig::default(),
            telemetry: TelemetryConfig::default(),
            status: None,
            sensor: None,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn channel(&self) -> &EventChannel {
        &self.channel
    }

    /// Open a consumer session
    pub fn open(self: &Arc<Self>) -> Result<Session> {
        let id = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        {
            let mut state = self.state.lock();
            if state.shut_down {
                return Err(BridgeError::InvalidState(format!(
                    "device {} is shut down",
                    self.id
                )));
            }
            let record = SessionRecord::new(&state.defaults);
            state.sessions.insert(id, record);
        }
        let scratch = self.channel.register_scratch(SESSION_SCRATCH_SIZE);
        debug!("Opened {} on device {}", id, self.id);
        self.publish_state(id, None, SessionState::Idle);
        Ok(Session::new(id, self.clone(), scratch))
    }

    /// Attach a pipeline listener
    pub fn connect_pipeline(self: &Arc<Self>) -> PipelineListener {
        PipelineListener::new(self.clone())
    }

    /// Claim the streaming slot for `session`
    pub fn try_activate(&self, session: SessionId) -> Result<()> {
        match self
            .active
            .compare_exchange(0, session.0, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(holder) if holder == session.0 => Ok(()),
            Err(holder) => Err(BridgeError::Busy(format!(
                "device {} is streaming for session-{}",
                self.id, holder
            ))),
        }
    }

    /// Release the streaming slot if `session` holds it
    pub fn deactivate(&self, session: SessionId) {
        let _ = self
            .active
            .compare_exchange(session.0, 0, Ordering::AcqRel, Ordering::Acquire);
    }

    pub fn active_session(&self) -> Option<SessionId> {
        match self.active.load(Ordering::Acquire) {
            0 => None,
            id => Some(SessionId(id)),
        }
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Pipeline reports that buffer `index` of `session` holds a frame
    ///
    /// Only in-flight buffers of a streaming session complete; anything else
    /// is discarded and logged.
    pub fn buffer_done(&self, session: SessionId, index: BufferId) -> bool {
        match self.complete_in_flight(session, index) {
            Ok(stream_id) => {
                self.buffers_ready.notify_all();
                self.record_frame(stream_id);
                true
            }
            Err(e) => {
                warn_throttled!(
                    self.throttle,
                    "buffer_done",
                    "Discarding completion of buffer {} for {} on device {}: {}",
                    index,
                    session,
                    self.id,
                    e
                );
                false
            }
        }
    }

    fn complete_in_flight(&self, session: SessionId, index: BufferId) -> Result<Option<i32>> {
        let mut state = self.state.lock();
        let DeviceState { pool, sessions, .. } = &mut *state;
        let record = sessions
            .get_mut(&session)
            .ok_or_else(|| BridgeError::NotFound(session.to_string()))?;
        if record.state != SessionState::Streaming {
            return Err(BridgeError::InvalidState(format!(
                "{} is {}",
                session, record.state
            )));
        }
        pool.mark_done(
            session,
            index,
            record.sequence,
            BufferStatus::Ok,
            record.format.size_image as usize,
        )?;
        record.sequence += 1;
        Ok(record.stream_id)
    }

    /// Complete in-flight buffer `index` with an error
    ///
    /// Used when the pipeline never received the buffer, so the consumer
    /// gets it back on the next dequeue.
    pub(crate) fn fail_in_flight(&self, session: SessionId, index: BufferId) -> Result<()> {
        {
            let mut state = self.state.lock();
            let DeviceState { pool, sessions, .. } = &mut *state;
            let record = sessions
                .get_mut(&session)
                .ok_or_else(|| BridgeError::NotFound(session.to_string()))?;
            pool.mark_done(session, index, record.sequence, BufferStatus::Error, 0)?;
            record.sequence += 1;
        }
        self.buffers_ready.notify_all();
        warn!(
            "Buffer {} of {} on device {} never reached the pipeline",
            index, session, self.id
        );
        Ok(())
    }

    fn record_frame(&self, stream_id: Option<i32>) {
        let Some(meter) = &self.telemetry else {
            return;
        };
        let sample = meter.lock().record(Instant::now());
        if let Some(sample) = sample {
            info!(
                "video{} stream {:?}: {:.2} fps",
                self.id, stream_id, sample.fps
            );
            self.channel.publish(BridgeStatus::FrameRate {
                device: self.id,
                stream_id,
                frames: sample.frames,
                elapsed_ms: sample.elapsed_ms,
                fps: sample.fps,
            });
        }
    }

    pub(crate) fn reset_telemetry(&self) {
        if let Some(meter) = &self.telemetry {
            meter.lock().reset();
        }
    }

    /// Apply the sensor mode reported by the pipeline
    ///
    /// Rebuilds the format list and resets the defaults of idle sessions.
    /// An empty mode clears the known sensor mode.
    pub fn apply_mode(&self, mode: SensorMode) -> Result<()> {
        let mut state = self.state.lock();
        if let Err(e) = mode.validate() {
            state.camera = None;
            return Err(e);
        }

        let mut formats = PixelFormat::BASE.to_vec();
        if let Some(raw) = mode.raw_format() {
            formats.push(raw);
        }
        let defaults = StreamDefaults {
            format: NegotiatedFormat::new(mode.resolution(), PixelFormat::BASE[0]),
            interval: FrameInterval::from_fps(mode.fps),
            sensor_bounds: mode.resolution(),
        };
        state.camera = Some(mode);
        state.formats = formats;
        state.defaults = defaults;
        for record in state.sessions.values_mut() {
            if record.state == SessionState::Idle {
                record.reset(&defaults);
            }
        }

        info!(
            "Device {} sensor mode {}: {}x{}@{} {:?} {}bit",
            self.id, mode.index, mode.width, mode.height, mode.fps, mode.bayer_pattern, mode.bit_width
        );
        Ok(())
    }

    pub fn camera_mode(&self) -> Option<SensorMode> {
        self.state.lock().camera
    }

    pub fn set_caps_supports(&self, caps: CapsSupports) {
        debug!("Device {} publishes {} capability modes", self.id, caps.modes.len());
        self.state.lock().caps_supports = caps;
    }

    pub fn caps_supports(&self) -> CapsSupports {
        self.state.lock().caps_supports.clone()
    }

    pub fn caps_mode(&self) -> CapsMode {
        self.state.lock().caps_mode
    }

    /// Send an extended control JSON string to the pipeline
    ///
    /// Returns the string as left in the control region by the pipeline.
    pub fn set_ext_control(&self, json: &str) -> Result<String> {
        let _guard = self.control_lock.lock();
        self.control_scratch.write_str(json)?;
        self.channel.send(
            Event::new(EventKind::SetControl)
                .stream(Some(0))
                .payload(self.control_scratch.payload()),
            true,
        )?;
        Ok(self.control_scratch.read_str())
    }

    /// Formats currently offered to consumers
    pub fn enum_formats(&self) -> Vec<PixelFormat> {
        self.state.lock().formats.clone()
    }

    pub fn frame_size_range(&self, format: PixelFormat) -> Result<FrameSizeRange> {
        self.ensure_format(format)?;
        Ok(FrameSizeRange::STEPWISE)
    }

    /// Discrete frame intervals `1/(fps - n)` for the current sensor mode
    pub fn enum_frame_intervals(
        &self,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<Vec<FrameInterval>> {
        self.ensure_format(format)?;
        if !FrameSizeRange::STEPWISE.contains(width, height) {
            return Err(BridgeError::InvalidArgument(format!(
                "frame size {}x{} not on the stepwise grid",
                width, height
            )));
        }
        let fps = self.state.lock().camera.map(|m| m.fps).unwrap_or(0);
        Ok((0..fps).map(|i| FrameInterval::from_fps(fps - i)).collect())
    }

    fn ensure_format(&self, format: PixelFormat) -> Result<()> {
        if self.state.lock().formats.contains(&format) {
            Ok(())
        } else {
            Err(BridgeError::InvalidArgument(format!(
                "pixel format {} not offered by device {}",
                format, self.id
            )))
        }
    }

    /// Reserved memory as (base, size)
    pub fn reserved_memory(&self) -> (u64, u64) {
        self.state.lock().pool.reserved_memory()
    }

    pub fn query_caps(&self) -> DeviceCaps {
        DeviceCaps {
            driver: "vvcam-bridge".to_string(),
            card: "VIV".to_string(),
            bus_info: format!("platform:viv{}", self.id),
            capture: true,
            streaming: true,
            time_per_frame: true,
        }
    }

    pub(crate) fn sensor_stream(&self, enable: bool) {
        if let Some(sensor) = &self.sensor {
            if let Err(e) = sensor.set_stream(enable) {
                warn!(
                    "Device {}: failed to switch sensor {}: {}",
                    self.id,
                    if enable { "on" } else { "off" },
                    e
                );
            }
        }
    }

    pub(crate) fn publish_state(&self, session: SessionId, stream_id: Option<i32>, state: SessionState) {
        debug!("{} on device {} -> {}", session, self.id, state);
        self.channel.publish(BridgeStatus::SessionStateChanged {
            device: self.id,
            session: session.0,
            stream_id,
            state: state.to_string(),
            timestamp: chrono::Utc::now(),
        });
    }

    /// Refuse new sessions, wake blocked consumers and close listener inboxes
    pub fn shutdown(&self) {
        self.state.lock().shut_down = true;
        self.buffers_ready.notify_all();
        self.channel.shutdown();
        info!("Device {} shut down", self.id);
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::BayerPattern;
    use std::sync::atomic::AtomicUsize;

    fn device() -> Arc<DeviceCoordinator> {
        DeviceCoordinator::builder(DeviceConfig::default())
            .build()
            .unwrap()
    }

    fn raw12_mode() -> SensorMode {
        SensorMode {
            index: 0,
            width: 1920,
            height: 1080,
            fps: 30,
            bayer_pattern: BayerPattern::Rggb,
            bit_width: 12,
        }
    }

    #[test]
    fn test_single_active_streamer() {
        let device = device();
        let a = SessionId(1);
        let b = SessionId(2);

        device.try_activate(a).unwrap();
        device.try_activate(a).unwrap();
        assert!(matches!(device.try_activate(b), Err(BridgeError::Busy(_))));

        // Only the holder clears the slot
        device.deactivate(b);
        assert_eq!(device.active_session(), Some(a));
        device.deactivate(a);
        assert_eq!(device.active_session(), None);
        device.try_activate(b).unwrap();
    }

    #[test]
    fn test_concurrent_activation() {
        let device = device();
        let winners = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (1..=8)
            .map(|i| {
                let device = device.clone();
                let winners = winners.clone();
                std::thread::spawn(move || {
                    if device.try_activate(SessionId(i)).is_ok() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mode_rebuilds_formats() {
        let device = device();
        assert_eq!(device.enum_formats(), PixelFormat::BASE.to_vec());
        assert!(device.enum_frame_intervals(PixelFormat::Yuyv, 1920, 1080).unwrap().is_empty());

        device.apply_mode(raw12_mode()).unwrap();
        let formats = device.enum_formats();
        assert_eq!(formats.len(), 4);
        assert_eq!(formats[3], PixelFormat::Srggb12);
        assert!(device.frame_size_range(PixelFormat::Srggb12).is_ok());
        assert!(device.frame_size_range(PixelFormat::Sbggr8).is_err());

        let intervals = device
            .enum_frame_intervals(PixelFormat::Srggb12, 1920, 1080)
            .unwrap();
        assert_eq!(intervals.len(), 30);
        assert_eq!(intervals[0], FrameInterval::from_fps(30));
        assert_eq!(intervals[29], FrameInterval::from_fps(1));
        assert!(device
            .enum_frame_intervals(PixelFormat::Srggb12, 1921, 1080)
            .is_err());

        let mut empty = raw12_mode();
        empty.width = 0;
        assert!(device.apply_mode(empty).is_err());
        assert!(device.camera_mode().is_none());
    }

    #[test]
    fn test_buffer_done_requires_streaming() {
        let device = device();
        let session = device.open().unwrap();
        session.request_buffers(2).unwrap();
        session.queue_buffer(0).unwrap();

        assert!(!device.buffer_done(session.id(), 0));
        assert!(!device.buffer_done(SessionId(999), 0));
    }

    #[test]
    fn test_device_info() {
        let device = device();
        assert_eq!(device.reserved_memory(), (0xb000_0000, 64 * 1024 * 1024));
        assert_eq!(device.query_caps().bus_info, "platform:viv0");
    }

    #[test]
    fn test_shutdown_refuses_open() {
        let device = device();
        device.shutdown();
        assert!(device.is_shut_down());
        assert!(matches!(device.open(), Err(BridgeError::InvalidState(_))));
    }

    #[test]
    fn test_builder_rejects_raw_default() {
        let config = DeviceConfig {
            format: PixelFormat::Srggb12,
            ..Default::default()
        };
        assert!(matches!(
            DeviceCoordinator::builder(config).build(),
            Err(BridgeError::Config(_))
        ));
    }

    #[test]
    fn test_builder_rejects_degenerate_limits() {
        let zero_depth = DeviceCoordinator::builder(DeviceConfig::default())
            .channel(ChannelConfig {
                listener_queue_depth: 0,
                ..Default::default()
            })
            .build();
        assert!(matches!(zero_depth, Err(BridgeError::Config(_))));

        let zero_window = DeviceCoordinator::builder(DeviceConfig::default())
            .telemetry(TelemetryConfig {
                window_ms: 0,
                ..Default::default()
            })
            .build();
        assert!(matches!(zero_window, Err(BridgeError::Config(_))));

        // A zero window is fine while telemetry is off
        let disabled = DeviceCoordinator::builder(DeviceConfig::default())
            .telemetry(TelemetryConfig {
                enabled: false,
                window_ms: 0,
                ..Default::default()
            })
            .build();
        assert!(disabled.is_ok());
    }
}
