use thiserror::Error;

use crate::bridge::event::EventKind;
use crate::video::buffer::BufferId;

/// Bridge-wide error type
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Buffer allocation cannot fit the reserved memory even after clamping
    #[error("Out of resources: {0}")]
    OutOfResources(String),

    /// Another session is already streaming on the same device
    #[error("Device busy: {0}")]
    Busy(String),

    /// No pipeline listener subscribed within the retry budget
    #[error("No pipeline listener subscribed to {0}")]
    Unsubscribed(EventKind),

    /// Synchronous event not acknowledged before the deadline
    #[error("Pipeline did not acknowledge {kind} within {timeout_ms} ms")]
    TimedOut { kind: EventKind, timeout_ms: u64 },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Buffer was flushed by a stream stop or a pipeline failure
    #[error("Buffer {index} completed with error")]
    BufferError { index: BufferId },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Non-blocking dequeue with no completed buffer
    #[error("No buffer ready")]
    WouldBlock,

    /// Pipeline acknowledged the event with a non-zero status
    #[error("Pipeline rejected {kind} (status {status})")]
    Rejected { kind: EventKind, status: i32 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BridgeError {
    /// Whether retrying the same call later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Busy(_)
                | BridgeError::Unsubscribed(_)
                | BridgeError::TimedOut { .. }
                | BridgeError::WouldBlock
        )
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(BridgeError::Busy("stream 0".into()).is_retryable());
        assert!(BridgeError::TimedOut {
            kind: EventKind::StartStream,
            timeout_ms: 5000
        }
        .is_retryable());
        assert!(!BridgeError::InvalidState("closed".into()).is_retryable());
        assert!(!BridgeError::OutOfResources("0 buffers".into()).is_retryable());
    }

    #[test]
    fn test_display() {
        let err = BridgeError::BufferError { index: 3 };
        assert_eq!(err.to_string(), "Buffer 3 completed with error");
    }
}
