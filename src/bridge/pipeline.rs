//! Pipeline-facing endpoint
//!
//! A [`PipelineListener`] is the user-space pipeline's connection to one
//! device: it subscribes to event kinds, drains its inbox, completes
//! synchronous events and reports finished buffers and sensor modes.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::channel::ListenerQueue;
use super::device::DeviceCoordinator;
use super::event::{Event, EventId, EventKind, ScratchBuffer};
use super::session::SessionId;
use super::subscription::ListenerId;
use crate::error::Result;
use crate::video::buffer::BufferId;
use crate::video::sensor::{CapsSupports, SensorMode};

/// Connection of a pipeline to a device, disconnected on drop
pub struct PipelineListener {
    id: ListenerId,
    device: Arc<DeviceCoordinator>,
    queue: Arc<ListenerQueue>,
}

impl PipelineListener {
    pub(crate) fn new(device: Arc<DeviceCoordinator>) -> Self {
        let (id, queue) = device.channel.connect();
        Self { id, device, queue }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn device(&self) -> &Arc<DeviceCoordinator> {
        &self.device
    }

    pub fn subscribe(&self, kind: EventKind) -> bool {
        self.device.channel.subscribe(self.id, kind)
    }

    /// Subscribe to every predefined event kind
    pub fn subscribe_all(&self) {
        for kind in EventKind::ALL {
            self.subscribe(kind);
        }
    }

    pub fn unsubscribe(&self, kind: EventKind) -> bool {
        self.device.channel.unsubscribe(self.id, kind)
    }

    /// Next event in delivery order, `None` on timeout or disconnect
    pub fn next_event(&self, timeout: Duration) -> Option<Event> {
        self.queue.pop(timeout)
    }

    /// Events waiting in the inbox
    pub fn backlog(&self) -> usize {
        self.queue.len()
    }

    /// Complete a synchronous event with a status (0 is success)
    pub fn complete(&self, id: EventId, status: i32) -> bool {
        self.device.channel.complete(id, status)
    }

    /// Report that a queued buffer holds a frame
    pub fn buffer_done(&self, session: SessionId, index: BufferId) -> bool {
        self.device.buffer_done(session, index)
    }

    /// Scratch region referenced by an event payload
    pub fn scratch(&self, addr: u64) -> Option<Arc<ScratchBuffer>> {
        self.device.channel.scratch(addr)
    }

    /// Report the sensor mode now in effect
    pub fn set_mode_info(&self, mode: SensorMode) -> Result<()> {
        self.device.apply_mode(mode)
    }

    /// Publish the capability table answered to `GetCapsSupports`
    pub fn set_caps_supports(&self, caps: CapsSupports) {
        self.device.set_caps_supports(caps)
    }
}

impl Drop for PipelineListener {
    fn drop(&mut self) {
        debug!("Dropping {} on device {}", self.id, self.device.id());
        self.device.channel.disconnect(self.id);
    }
}
