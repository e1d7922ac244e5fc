use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::video::format::PixelFormat;

/// Main bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Event channel tuning
    pub channel: ChannelConfig,
    /// Frame-rate telemetry
    pub telemetry: TelemetryConfig,
    /// Video nodes bridged to the pipeline
    pub devices: Vec<DeviceConfig>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            telemetry: TelemetryConfig::default(),
            devices: vec![DeviceConfig::default()],
        }
    }
}

impl BridgeConfig {
    pub fn device(&self, id: u32) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.id == id)
    }
}

/// Event channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Subscriber checks before a synchronous post gives up
    pub retry_attempts: u32,
    /// Interval between subscriber checks
    pub retry_interval_ms: u64,
    /// Completion deadline of synchronous events
    pub event_timeout_ms: u64,
    /// Undelivered events kept per listener
    pub listener_queue_depth: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 10,
            retry_interval_ms: 5,
            event_timeout_ms: 5000,
            listener_queue_depth: 64,
        }
    }
}

impl ChannelConfig {
    /// Total time a synchronous post waits for a subscriber
    pub fn subscribe_budget(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms * self.retry_attempts as u64)
    }

    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.event_timeout_ms)
    }
}

/// Frame-rate telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    /// Measurement window in milliseconds
    pub window_ms: u64,
    /// Windows closed before samples are reported
    pub warmup_windows: u32,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 3000,
            warmup_windows: 10,
        }
    }
}

/// Per video node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub id: u32,
    /// Base address of the reserved memory region
    pub reserved_base: u64,
    /// Size of the reserved memory region in bytes
    pub reserved_size: u64,
    /// Default frame width
    pub width: u32,
    /// Default frame height
    pub height: u32,
    /// Default pixel format
    pub format: PixelFormat,
    /// Default frame rate
    pub fps: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: 0,
            reserved_base: 0xb000_0000,
            reserved_size: 64 * 1024 * 1024,
            width: 1920,
            height: 1080,
            format: PixelFormat::Yuyv,
            fps: 30,
        }
    }
}
