//! Loopback pipeline
//!
//! A software stand-in for the user-space camera pipeline. It acknowledges
//! every synchronous event, answers capability and control queries, and
//! completes queued buffers at the sensor frame rate. Used by the CLI soak
//! run and by tests that need a live pipeline.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::device::DeviceCoordinator;
use super::event::{Event, EventKind, Payload};
use super::pipeline::PipelineListener;
use super::session::SessionId;
use crate::error::{BridgeError, Result};
use crate::video::buffer::BufferId;
use crate::video::sensor::{CapsSupports, SensorMode};

/// Longest time the worker sleeps between inbox polls
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Software pipeline attached to one device; stopped on drop
pub struct LoopbackPipeline {
    stop: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl LoopbackPipeline {
    /// Connect to `device`, report `mode` and start serving events
    pub fn spawn(device: &Arc<DeviceCoordinator>, mode: SensorMode) -> Result<Self> {
        if mode.fps == 0 {
            return Err(BridgeError::InvalidArgument(
                "loopback pipeline needs a non-zero frame rate".to_string(),
            ));
        }
        let listener = device.connect_pipeline();
        listener.subscribe_all();
        listener.set_mode_info(mode)?;

        let stop = Arc::new(AtomicBool::new(false));
        let frames = Arc::new(AtomicU64::new(0));
        let worker = Worker {
            listener,
            mode,
            period: Duration::from_secs(1) / mode.fps,
            pending: VecDeque::new(),
            stop: stop.clone(),
            frames: frames.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("loopback-video{}", device.id()))
            .spawn(move || worker.run())?;

        info!(
            "Loopback pipeline on device {}: {}x{}@{}",
            device.id(),
            mode.width,
            mode.height,
            mode.fps
        );
        Ok(Self {
            stop,
            frames,
            handle: Some(handle),
        })
    }

    /// Buffers completed so far
    pub fn frames_delivered(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Stop the worker and wait for it to exit
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Loopback pipeline worker panicked");
            }
        }
    }
}

impl Drop for LoopbackPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    listener: PipelineListener,
    mode: SensorMode,
    period: Duration,
    pending: VecDeque<(SessionId, BufferId)>,
    stop: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
}

impl Worker {
    fn run(mut self) {
        let mut next_frame = Instant::now() + self.period;
        while !self.stop.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= next_frame {
                self.deliver_frame();
                next_frame = if self.pending.is_empty() {
                    now + self.period
                } else {
                    next_frame + self.period
                };
            }

            let wait = next_frame
                .saturating_duration_since(Instant::now())
                .min(POLL_INTERVAL);
            if let Some(event) = self.listener.next_event(wait) {
                self.handle(event);
            }
        }
        debug!("Loopback worker {} exiting", self.listener.id());
    }

    fn deliver_frame(&mut self) {
        if let Some((session, index)) = self.pending.pop_front() {
            if self.listener.buffer_done(session, index) {
                self.frames.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn handle(&mut self, event: Event) {
        match (event.kind, event.payload) {
            (EventKind::BufferQueued, Payload::Buffer { index, .. }) => {
                if let Some(session) = event.session {
                    self.pending.push_back((session, index));
                }
            }
            (EventKind::StopStream | EventKind::DelStream, _) => {
                if let Some(session) = event.session {
                    self.pending.retain(|(owner, _)| *owner != session);
                }
            }
            (EventKind::GetCapsSupports, _) => {
                self.listener.set_caps_supports(CapsSupports {
                    modes: vec![self.mode],
                });
            }
            (EventKind::PassJson, Payload::Control { id, addr }) => {
                if let Some(scratch) = self.listener.scratch(addr) {
                    let response = serde_json::json!({ "id": id, "result": 0 }).to_string();
                    if let Err(e) = scratch.write_str(&response) {
                        warn!("Loopback control response dropped: {}", e);
                    }
                }
            }
            _ => {}
        }

        if event.sync {
            self.listener.complete(event.id, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::video::format::{BayerPattern, PixelFormat};

    fn mode(fps: u32) -> SensorMode {
        SensorMode {
            index: 1,
            width: 1280,
            height: 720,
            fps,
            bayer_pattern: BayerPattern::Bggr,
            bit_width: 10,
        }
    }

    #[test]
    fn test_loopback_streams_frames() {
        let device = DeviceCoordinator::builder(DeviceConfig::default())
            .build()
            .unwrap();
        let loopback = LoopbackPipeline::spawn(&device, mode(200)).unwrap();
        assert!(device.enum_formats().contains(&PixelFormat::Sbggr10));

        let session = device.open().unwrap();
        session.set_stream_id(0).unwrap();
        let granted = session.request_buffers(4).unwrap();
        for index in 0..granted.granted {
            session.queue_buffer(index).unwrap();
        }
        session.start_stream().unwrap();

        let mut last = None;
        for _ in 0..10 {
            let buffer = session.dequeue_buffer(true).unwrap();
            if let Some(previous) = last {
                assert!(buffer.sequence > previous);
            }
            last = Some(buffer.sequence);
            session.queue_buffer(buffer.index).unwrap();
        }
        session.stop_stream().unwrap();
        session.close().unwrap();

        assert!(loopback.frames_delivered() >= 10);
        assert_eq!(device.session_count(), 0);
    }

    #[test]
    fn test_loopback_answers_queries() {
        let device = DeviceCoordinator::builder(DeviceConfig::default())
            .build()
            .unwrap();
        let _loopback = LoopbackPipeline::spawn(&device, mode(30)).unwrap();
        let session = device.open().unwrap();

        let caps = session.get_caps_supports().unwrap();
        assert_eq!(caps.modes, vec![mode(30)]);

        let response: serde_json::Value =
            serde_json::from_str(&session.control(3, "{}").unwrap()).unwrap();
        assert_eq!(response["id"], 3);
        assert_eq!(response["result"], 0);
    }

    #[test]
    fn test_loopback_rejects_zero_fps() {
        let device = DeviceCoordinator::builder(DeviceConfig::default())
            .build()
            .unwrap();
        assert!(LoopbackPipeline::spawn(&device, mode(0)).is_err());
    }
}
