//! Capture-session event bridge
//!
//! Consumers drive a video node through [`Session`]s; a user-space pipeline
//! connects through a [`PipelineListener`]. Everything in between (event
//! routing, synchronous completion, buffer ownership and the single active
//! streamer) is handled by the [`DeviceCoordinator`] of each node.

pub mod channel;
pub mod device;
pub mod event;
pub mod loopback;
pub mod pipeline;
pub mod registry;
pub mod session;
pub mod subscription;

pub use channel::{EventChannel, ListenerQueue};
pub use device::{DeviceCaps, DeviceCoordinator, DeviceCoordinatorBuilder, DeviceId};
pub use event::{Event, EventId, EventKind, Payload, ScratchBuffer};
pub use loopback::LoopbackPipeline;
pub use pipeline::PipelineListener;
pub use registry::DeviceRegistry;
pub use session::{DequeuedBuffer, SelectionTarget, Session, SessionId, SessionState};
pub use subscription::{ListenerId, SubscriptionRegistry};
