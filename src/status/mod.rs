//! Status bus for bridge observers
//!
//! Broadcasts session state changes, frame-rate samples and pipeline
//! connectivity to anyone interested (the CLI, tests, a future control
//! surface). Publishing never blocks the capture path.

pub mod types;

pub use types::BridgeStatus;

use tokio::sync::broadcast;

/// Status channel capacity (ring buffer size)
const STATUS_CHANNEL_CAPACITY: usize = 256;

/// Broadcast bus of [`BridgeStatus`] events
///
/// # Example
///
/// ```no_run
/// use vvcam_bridge::status::{BridgeStatus, StatusBus};
///
/// let bus = StatusBus::new();
/// let mut rx = bus.subscribe();
///
/// bus.publish(BridgeStatus::PipelineConnected { device: 0, listener: 1 });
///
/// tokio::spawn(async move {
///     while let Ok(status) = rx.recv().await {
///         println!("{}", status.event_name());
///     }
/// });
/// ```
pub struct StatusBus {
    tx: broadcast::Sender<BridgeStatus>,
}

impl StatusBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// Dropped silently when nobody is subscribed.
    pub fn publish(&self, status: BridgeStatus) {
        let _ = self.tx.send(status);
    }

    /// Subscribe to events
    ///
    /// A receiver that falls too far behind gets `Lagged` and misses events.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeStatus> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = StatusBus::new();
        let mut rx = bus.subscribe();

        bus.publish(BridgeStatus::PipelineDisconnected {
            device: 0,
            listener: 2,
        });

        let status = rx.recv().await.unwrap();
        assert!(matches!(
            status,
            BridgeStatus::PipelineDisconnected { listener: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = StatusBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(BridgeStatus::BuffersFlushed {
            device: 0,
            session: 1,
            count: 4,
        });

        assert_eq!(rx1.recv().await.unwrap().event_name(), "session.buffers_flushed");
        assert_eq!(rx2.recv().await.unwrap().event_name(), "session.buffers_flushed");
    }

    #[test]
    fn test_no_subscribers() {
        let bus = StatusBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(BridgeStatus::PipelineConnected {
            device: 0,
            listener: 1,
        });
    }
}
