//! Event channel between capture sessions and pipeline listeners
//!
//! Sessions post [`Event`]s; every listener subscribed to the event's kind
//! receives a copy in its queue. Synchronous posts block until the pipeline
//! completes that exact event id or the deadline passes. Completions that
//! arrive for unknown, expired or already completed ids are discarded.

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use super::event::{Event, EventId, EventKind, ScratchBuffer};
use super::subscription::{ListenerId, SubscriptionRegistry};
use crate::config::ChannelConfig;
use crate::error::{BridgeError, Result};
use crate::status::{BridgeStatus, StatusBus};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Base of the synthetic address range handed out to scratch regions
const SCRATCH_BASE: u64 = 0xffff_0000_0000;
const SCRATCH_STRIDE: u64 = 0x10_0000;

#[derive(Debug, Default)]
struct QueueState {
    events: VecDeque<Event>,
    closed: bool,
}

/// Bounded inbox of one pipeline listener
#[derive(Debug, Default)]
pub struct ListenerQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl ListenerQueue {
    /// Append an event
    ///
    /// Synchronous events are always accepted since their posters block
    /// until completion. An asynchronous event is refused when the inbox
    /// already holds `depth` events (a depth of 0 acts as 1). Returns false
    /// if the event was not queued.
    fn push(&self, event: Event, depth: usize) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        if !event.sync && state.events.len() >= depth.max(1) {
            return false;
        }
        state.events.push_back(event);
        self.ready.notify_one();
        true
    }

    /// Next event, waiting up to `timeout`
    ///
    /// Returns `None` on timeout or once the queue is closed and drained.
    pub fn pop(&self, timeout: Duration) -> Option<Event> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(event) = state.events.pop_front() {
                return Some(event);
            }
            if state.closed {
                return None;
            }
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                return state.events.pop_front();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }
}

#[derive(Debug, Clone, Copy)]
enum Completion {
    Waiting,
    Done(i32),
}

/// Event channel of one video node
pub struct EventChannel {
    device: u32,
    config: ChannelConfig,
    registry: SubscriptionRegistry,
    queues: Mutex<HashMap<ListenerId, Arc<ListenerQueue>>>,
    pending: Mutex<HashMap<EventId, (EventKind, Completion)>>,
    completed: Condvar,
    next_event: AtomicU64,
    next_listener: AtomicU64,
    scratch: Mutex<HashMap<u64, Arc<ScratchBuffer>>>,
    next_scratch: AtomicU64,
    throttle: LogThrottler,
    status: Option<Arc<StatusBus>>,
}

impl EventChannel {
    pub fn new(device: u32, config: ChannelConfig, status: Option<Arc<StatusBus>>) -> Self {
        Self {
            device,
            config,
            registry: SubscriptionRegistry::new(),
            queues: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            completed: Condvar::new(),
            next_event: AtomicU64::new(1),
            next_listener: AtomicU64::new(1),
            scratch: Mutex::new(HashMap::new()),
            next_scratch: AtomicU64::new(0),
            throttle: LogThrottler::default(),
            status,
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Attach a new listener with an empty inbox
    pub fn connect(&self) -> (ListenerId, Arc<ListenerQueue>) {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        let queue = Arc::new(ListenerQueue::default());
        self.queues.lock().insert(id, queue.clone());
        debug!("Pipeline {} connected to device {}", id, self.device);
        self.publish(BridgeStatus::PipelineConnected {
            device: self.device,
            listener: id.0,
        });
        (id, queue)
    }

    /// Detach a listener and drop all its subscriptions
    pub fn disconnect(&self, listener: ListenerId) {
        let removed = self.registry.remove_listener(listener);
        if let Some(queue) = self.queues.lock().remove(&listener) {
            queue.close();
            debug!(
                "Pipeline {} disconnected from device {} ({} subscriptions dropped)",
                listener, self.device, removed
            );
            self.publish(BridgeStatus::PipelineDisconnected {
                device: self.device,
                listener: listener.0,
            });
        }
    }

    /// Subscribe a connected listener; unknown listeners are ignored
    pub fn subscribe(&self, listener: ListenerId, kind: EventKind) -> bool {
        if !self.queues.lock().contains_key(&listener) {
            return false;
        }
        self.registry.subscribe(listener, kind)
    }

    pub fn unsubscribe(&self, listener: ListenerId, kind: EventKind) -> bool {
        self.registry.unsubscribe(listener, kind)
    }

    /// Post an event with the configured completion deadline
    pub fn send(&self, event: Event, sync: bool) -> Result<()> {
        self.post(event, sync, self.config.event_timeout())
    }

    /// Post an event to every subscribed listener
    ///
    /// Synchronous posts wait for a subscriber within the retry budget, then
    /// for the completion of this event until `timeout`. Asynchronous posts
    /// never fail; missed deliveries are only logged, see [`Self::post_async`]
    /// for the delivery count.
    pub fn post(&self, mut event: Event, sync: bool, timeout: Duration) -> Result<()> {
        if !sync {
            self.post_async(event);
            return Ok(());
        }
        event.id = EventId(self.next_event.fetch_add(1, Ordering::Relaxed));
        event.sync = true;
        let id = event.id;
        let kind = event.kind;

        if !self
            .registry
            .wait_for_subscriber(kind, self.config.subscribe_budget())
        {
            warn!(
                "Unsubscribed event {} {} on device {}",
                kind, id, self.device
            );
            return Err(BridgeError::Unsubscribed(kind));
        }
        self.pending.lock().insert(id, (kind, Completion::Waiting));

        trace!("Posting {} {} (sync)", kind, id);
        if self.deliver(event) == 0 {
            self.pending.lock().remove(&id);
            return Err(BridgeError::Unsubscribed(kind));
        }
        self.wait_completion(id, kind, timeout)
    }

    /// Post an event without waiting for completion
    ///
    /// Returns the number of listeners that queued it; 0 when nobody is
    /// subscribed or every subscribed inbox is full.
    pub fn post_async(&self, mut event: Event) -> usize {
        event.id = EventId(self.next_event.fetch_add(1, Ordering::Relaxed));
        event.sync = false;
        let kind = event.kind;

        trace!("Posting {} {} (async)", kind, event.id);
        let delivered = self.deliver(event);
        if delivered == 0 {
            warn_throttled!(
                self.throttle,
                &format!("undelivered:{}", kind),
                "No listener took {} on device {}, event dropped",
                kind,
                self.device
            );
        }
        delivered
    }

    fn deliver(&self, event: Event) -> usize {
        let depth = self.config.listener_queue_depth;
        let queues = self.queues.lock();
        let mut delivered = 0;
        for listener in self.registry.subscribers(event.kind) {
            let Some(queue) = queues.get(&listener) else {
                continue;
            };
            if queue.push(event.clone(), depth) {
                delivered += 1;
            } else {
                warn_throttled!(
                    self.throttle,
                    &format!("overflow:{}", listener),
                    "Queue of {} full on device {}, {} dropped",
                    listener,
                    self.device,
                    event.kind
                );
            }
        }
        delivered
    }

    fn wait_completion(&self, id: EventId, kind: EventKind, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut pending = self.pending.lock();
        loop {
            if let Some((_, Completion::Done(status))) = pending.get(&id) {
                let status = *status;
                pending.remove(&id);
                return if status == 0 {
                    Ok(())
                } else {
                    Err(BridgeError::Rejected { kind, status })
                };
            }
            if Instant::now() >= deadline {
                break;
            }
            self.completed.wait_until(&mut pending, deadline);
        }
        pending.remove(&id);
        drop(pending);

        let timeout_ms = timeout.as_millis() as u64;
        warn!(
            "Event {} {} on device {} timed out after {} ms",
            kind, id, self.device, timeout_ms
        );
        self.publish(BridgeStatus::EventTimedOut {
            device: self.device,
            event_id: id.0,
            kind: kind.to_string(),
            timeout_ms,
            timestamp: chrono::Utc::now(),
        });
        Err(BridgeError::TimedOut { kind, timeout_ms })
    }

    /// Complete a synchronous event
    ///
    /// Returns false for unknown, expired or duplicate completions, which
    /// are discarded.
    pub fn complete(&self, id: EventId, status: i32) -> bool {
        let mut pending = self.pending.lock();
        let duplicate_of = match pending.get_mut(&id) {
            Some((_, state @ Completion::Waiting)) => {
                *state = Completion::Done(status);
                self.completed.notify_all();
                return true;
            }
            Some((kind, Completion::Done(_))) => Some(*kind),
            None => None,
        };
        drop(pending);

        match duplicate_of {
            Some(kind) => warn_throttled!(
                self.throttle,
                "duplicate_completion",
                "Duplicate completion for {} {} on device {}",
                kind,
                id,
                self.device
            ),
            None => warn_throttled!(
                self.throttle,
                "stray_completion",
                "Discarding completion for unknown or expired event {} on device {}",
                id,
                self.device
            ),
        }
        false
    }

    /// Number of synchronous posts awaiting completion
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Register a scratch region reachable by the pipeline through its address
    pub fn register_scratch(&self, capacity: usize) -> Arc<ScratchBuffer> {
        let slot = self.next_scratch.fetch_add(1, Ordering::Relaxed);
        let addr = SCRATCH_BASE + slot * SCRATCH_STRIDE;
        let scratch = Arc::new(ScratchBuffer::new(addr, capacity));
        self.scratch.lock().insert(addr, scratch.clone());
        scratch
    }

    pub fn release_scratch(&self, addr: u64) {
        self.scratch.lock().remove(&addr);
    }

    pub fn scratch(&self, addr: u64) -> Option<Arc<ScratchBuffer>> {
        self.scratch.lock().get(&addr).cloned()
    }

    /// Close every listener inbox
    pub fn shutdown(&self) {
        for (_, queue) in self.queues.lock().drain() {
            queue.close();
        }
    }

    pub(crate) fn publish(&self, status: BridgeStatus) {
        if let Some(bus) = &self.status {
            bus.publish(status);
        }
    }
}
