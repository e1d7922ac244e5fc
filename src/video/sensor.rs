//! Sensor mode description and stream control

use serde::{Deserialize, Serialize};

use super::format::{BayerPattern, PixelFormat, Resolution};
use crate::error::{BridgeError, Result};

/// Operating mode reported by the pipeline for the attached sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorMode {
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bayer_pattern: BayerPattern,
    pub bit_width: u32,
}

impl SensorMode {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Raw format produced by the sensor in this mode, if representable
    pub fn raw_format(&self) -> Option<PixelFormat> {
        PixelFormat::from_bayer(self.bayer_pattern, self.bit_width)
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(BridgeError::InvalidArgument(format!(
                "sensor mode {} has empty size {}x{}",
                self.index, self.width, self.height
            )));
        }
        Ok(())
    }
}

/// Capability mode selected by the consumer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsMode {
    pub mode: u32,
}

/// Capability table published by the pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsSupports {
    pub modes: Vec<SensorMode>,
}

/// Sensor stream switch, driven on stream start and stop
pub trait SensorControl: Send + Sync {
    fn set_stream(&self, enable: bool) -> Result<()>;
}
