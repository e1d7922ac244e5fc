//! Video node model
//!
//! Pixel formats, the capture buffer pool, sensor modes and frame-rate
//! telemetry.

pub mod buffer;
pub mod format;
pub mod sensor;
pub mod telemetry;

pub use buffer::{
    Backing, Buffer, BufferCount, BufferId, BufferPool, BufferState, BufferStatus, ExternalHandle,
    StateCounts,
};
pub use format::{
    try_format, BayerPattern, FrameInterval, FrameSizeRange, NegotiatedFormat, PixelFormat, Rect,
    Resolution,
};
pub use sensor::{CapsMode, CapsSupports, SensorControl, SensorMode};
pub use telemetry::{FpsMeter, FpsSample};
