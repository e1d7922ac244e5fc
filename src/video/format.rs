//! Pixel format definitions and format negotiation

use serde::{Deserialize, Serialize};
use std::fmt;
use v4l::format::fourcc::FourCC;

use crate::error::{BridgeError, Result};

pub const FRAME_MIN_WIDTH: u32 = 176;
pub const FRAME_MIN_HEIGHT: u32 = 144;
pub const FRAME_MAX_WIDTH: u32 = 4096;
pub const FRAME_MAX_HEIGHT: u32 = 3072;
pub const FRAME_WIDTH_ALIGN: u32 = 16;
pub const FRAME_HEIGHT_ALIGN: u32 = 8;

/// Bayer color filter arrangement reported by the sensor mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BayerPattern {
    Bggr,
    Gbrg,
    Grbg,
    Rggb,
}

/// Capture pixel formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed format
    Yuyv,
    /// NV12 semi-planar format (Y plane + interleaved UV)
    Nv12,
    /// NV16 semi-planar format
    Nv16,
    Sbggr8,
    Sgbrg8,
    Sgrbg8,
    Srggb8,
    Sbggr10,
    Sgbrg10,
    Sgrbg10,
    Srggb10,
    Sbggr12,
    Sgbrg12,
    Sgrbg12,
    Srggb12,
}

impl PixelFormat {
    /// Formats every device supports regardless of the sensor mode
    pub const BASE: [PixelFormat; 3] = [PixelFormat::Yuyv, PixelFormat::Nv12, PixelFormat::Nv16];

    /// Convert to V4L2 FourCC
    pub fn to_fourcc(&self) -> FourCC {
        FourCC::new(self.fourcc_code())
    }

    fn fourcc_code(&self) -> &'static [u8; 4] {
        match self {
            PixelFormat::Yuyv => b"YUYV",
            PixelFormat::Nv12 => b"NV12",
            PixelFormat::Nv16 => b"NV16",
            PixelFormat::Sbggr8 => b"BA81",
            PixelFormat::Sgbrg8 => b"GBRG",
            PixelFormat::Sgrbg8 => b"GRBG",
            PixelFormat::Srggb8 => b"RGGB",
            PixelFormat::Sbggr10 => b"BG10",
            PixelFormat::Sgbrg10 => b"GB10",
            PixelFormat::Sgrbg10 => b"BA10",
            PixelFormat::Srggb10 => b"RG10",
            PixelFormat::Sbggr12 => b"BG12",
            PixelFormat::Sgbrg12 => b"GB12",
            PixelFormat::Sgrbg12 => b"BA12",
            PixelFormat::Srggb12 => b"RG12",
        }
    }

    /// FourCC as the little-endian u32 the pipeline receives
    pub fn fourcc_u32(&self) -> u32 {
        u32::from_le_bytes(*self.fourcc_code())
    }

    /// Try to convert from V4L2 FourCC
    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|f| f.fourcc_code() == &fourcc.repr)
    }

    /// Raw format matching a sensor's bayer pattern and bit width
    pub fn from_bayer(pattern: BayerPattern, bit_width: u32) -> Option<Self> {
        use BayerPattern::*;
        use PixelFormat::*;
        let format = match (pattern, bit_width) {
            (Bggr, 8) => Sbggr8,
            (Gbrg, 8) => Sgbrg8,
            (Grbg, 8) => Sgrbg8,
            (Rggb, 8) => Srggb8,
            (Bggr, 10) => Sbggr10,
            (Gbrg, 10) => Sgbrg10,
            (Grbg, 10) => Sgrbg10,
            (Rggb, 10) => Srggb10,
            (Bggr, 12) => Sbggr12,
            (Gbrg, 12) => Sgbrg12,
            (Grbg, 12) => Sgrbg12,
            (Rggb, 12) => Srggb12,
            _ => return None,
        };
        Some(format)
    }

    /// Check if format is a bayer raw format
    pub fn is_raw(&self) -> bool {
        !Self::BASE.contains(self)
    }

    /// Bits per pixel in memory (used for the image size)
    pub fn depth(&self) -> u32 {
        match self {
            PixelFormat::Yuyv | PixelFormat::Nv16 => 16,
            PixelFormat::Nv12 => 12,
            PixelFormat::Sbggr8 | PixelFormat::Sgbrg8 | PixelFormat::Sgrbg8 | PixelFormat::Srggb8 => 8,
            _ => 16,
        }
    }

    /// Bytes per pixel on the first plane (used for the line stride)
    pub fn bpp(&self) -> u32 {
        match self {
            PixelFormat::Yuyv => 2,
            PixelFormat::Nv12 | PixelFormat::Nv16 => 1,
            PixelFormat::Sbggr8 | PixelFormat::Sgbrg8 | PixelFormat::Sgrbg8 | PixelFormat::Srggb8 => 1,
            _ => 2,
        }
    }

    /// Get all known formats
    pub fn all() -> &'static [PixelFormat] {
        &[
            PixelFormat::Yuyv,
            PixelFormat::Nv12,
            PixelFormat::Nv16,
            PixelFormat::Sbggr8,
            PixelFormat::Sgbrg8,
            PixelFormat::Sgrbg8,
            PixelFormat::Srggb8,
            PixelFormat::Sbggr10,
            PixelFormat::Sgbrg10,
            PixelFormat::Sgrbg10,
            PixelFormat::Srggb10,
            PixelFormat::Sbggr12,
            PixelFormat::Sgbrg12,
            PixelFormat::Sgrbg12,
            PixelFormat::Srggb12,
        ]
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Nv16 => "NV16",
            PixelFormat::Sbggr8 => "SBGGR8",
            PixelFormat::Sgbrg8 => "SGBRG8",
            PixelFormat::Sgrbg8 => "SGRBG8",
            PixelFormat::Srggb8 => "SRGGB8",
            PixelFormat::Sbggr10 => "SBGGR10",
            PixelFormat::Sgbrg10 => "SGBRG10",
            PixelFormat::Sgrbg10 => "SGRBG10",
            PixelFormat::Srggb10 => "SRGGB10",
            PixelFormat::Sbggr12 => "SBGGR12",
            PixelFormat::Sgbrg12 => "SGBRG12",
            PixelFormat::Sgrbg12 => "SGRBG12",
            PixelFormat::Srggb12 => "SRGGB12",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let upper = s.to_uppercase();
        Self::all()
            .iter()
            .copied()
            .find(|f| f.to_string() == upper || f.fourcc_code() == upper.as_bytes())
            .ok_or_else(|| format!("Unknown pixel format: {}", s))
    }
}

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const HD1080: Resolution = Resolution {
        width: 1920,
        height: 1080,
    };
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Selection rectangle (crop or compose)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(left: i32, top: i32, width: u32, height: u32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    /// Rectangle covering a whole frame
    pub fn full(resolution: Resolution) -> Self {
        Self::new(0, 0, resolution.width, resolution.height)
    }

    fn right(&self) -> i64 {
        self.left as i64 + self.width as i64
    }

    fn bottom(&self) -> i64 {
        self.top as i64 + self.height as i64
    }

    /// Check the rectangle against a bounding frame size
    pub fn validate_within(&self, bounds: Resolution) -> Result<()> {
        if self.left < 0 || self.top < 0 {
            return Err(BridgeError::InvalidArgument(format!(
                "negative selection offset {},{}",
                self.left, self.top
            )));
        }
        if self.right() < FRAME_MIN_WIDTH as i64
            || self.bottom() < FRAME_MIN_HEIGHT as i64
            || self.right() > bounds.width as i64
            || self.bottom() > bounds.height as i64
        {
            return Err(BridgeError::InvalidArgument(format!(
                "selection {:?} outside {}",
                self, bounds
            )));
        }
        Ok(())
    }
}

/// Time per frame as a fraction of a second
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInterval {
    pub numerator: u32,
    pub denominator: u32,
}

impl FrameInterval {
    pub fn from_fps(fps: u32) -> Self {
        Self {
            numerator: 1,
            denominator: fps,
        }
    }

    pub fn is_unset(&self) -> bool {
        self.numerator == 0 || self.denominator == 0
    }
}

/// Result of format negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiatedFormat {
    pub resolution: Resolution,
    pub format: PixelFormat,
    pub bytes_per_line: u32,
    pub size_image: u32,
}

impl NegotiatedFormat {
    /// Compute strides for an already-valid resolution
    pub fn new(resolution: Resolution, format: PixelFormat) -> Self {
        let bytes_per_line = resolution.width * format.bpp();
        let size_image =
            (resolution.width as u64 * resolution.height as u64 * format.depth() as u64 / 8) as u32;
        Self {
            resolution,
            format,
            bytes_per_line,
            size_image,
        }
    }
}

fn align_up(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}

/// Clamp and align a requested format against the supported list
pub fn try_format(
    width: u32,
    height: u32,
    format: PixelFormat,
    supported: &[PixelFormat],
) -> Result<NegotiatedFormat> {
    if !supported.contains(&format) {
        return Err(BridgeError::InvalidArgument(format!(
            "pixel format {} not supported",
            format
        )));
    }

    let width = align_up(width.clamp(FRAME_MIN_WIDTH, FRAME_MAX_WIDTH), FRAME_WIDTH_ALIGN);
    let height = align_up(
        height.clamp(FRAME_MIN_HEIGHT, FRAME_MAX_HEIGHT),
        FRAME_HEIGHT_ALIGN,
    );

    Ok(NegotiatedFormat::new(Resolution::new(width, height), format))
}

/// Stepwise frame size range reported to consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSizeRange {
    pub min: Resolution,
    pub max: Resolution,
    pub step_width: u32,
    pub step_height: u32,
}

impl FrameSizeRange {
    pub const STEPWISE: FrameSizeRange = FrameSizeRange {
        min: Resolution {
            width: FRAME_MIN_WIDTH,
            height: FRAME_MIN_HEIGHT,
        },
        max: Resolution {
            width: FRAME_MAX_WIDTH,
            height: FRAME_MAX_HEIGHT,
        },
        step_width: FRAME_WIDTH_ALIGN,
        step_height: FRAME_HEIGHT_ALIGN,
    };

    /// Whether a size lies on the stepwise grid
    pub fn contains(&self, width: u32, height: u32) -> bool {
        width % self.step_width == 0
            && height % self.step_height == 0
            && (self.min.width..=self.max.width).contains(&width)
            && (self.min.height..=self.max.height).contains(&height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bayer_lookup() {
        assert_eq!(
            PixelFormat::from_bayer(BayerPattern::Rggb, 12),
            Some(PixelFormat::Srggb12)
        );
        assert_eq!(
            PixelFormat::from_bayer(BayerPattern::Bggr, 8),
            Some(PixelFormat::Sbggr8)
        );
        assert_eq!(PixelFormat::from_bayer(BayerPattern::Gbrg, 14), None);
    }

    #[test]
    fn test_fourcc_roundtrip_and_parse() {
        for format in PixelFormat::all() {
            assert_eq!(PixelFormat::from_fourcc(format.to_fourcc()), Some(*format));
        }
        assert_eq!("srggb12".parse::<PixelFormat>(), Ok(PixelFormat::Srggb12));
        assert_eq!("NV12".parse::<PixelFormat>(), Ok(PixelFormat::Nv12));
        assert!("MJPEG".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn test_try_format_clamps_and_aligns() {
        let fmt = try_format(1921, 1079, PixelFormat::Yuyv, &PixelFormat::BASE).unwrap();
        assert_eq!(fmt.resolution, Resolution::new(1936, 1080));
        assert_eq!(fmt.bytes_per_line, 1936 * 2);
        assert_eq!(fmt.size_image, 1936 * 1080 * 2);

        let tiny = try_format(10, 10, PixelFormat::Nv12, &PixelFormat::BASE).unwrap();
        assert_eq!(tiny.resolution, Resolution::new(176, 144));
        assert_eq!(tiny.size_image, 176 * 144 * 12 / 8);

        let huge = try_format(9000, 9000, PixelFormat::Nv16, &PixelFormat::BASE).unwrap();
        assert_eq!(huge.resolution, Resolution::new(4096, 3072));
    }

    #[test]
    fn test_try_format_rejects_unlisted() {
        let err = try_format(1920, 1080, PixelFormat::Srggb12, &PixelFormat::BASE);
        assert!(matches!(err, Err(BridgeError::InvalidArgument(_))));
    }

    #[test]
    fn test_rect_validation() {
        let bounds = Resolution::HD1080;
        assert!(Rect::full(bounds).validate_within(bounds).is_ok());
        assert!(Rect::new(-1, 0, 640, 480).validate_within(bounds).is_err());
        assert!(Rect::new(0, 0, 100, 100).validate_within(bounds).is_err());
        assert!(Rect::new(1600, 0, 640, 480).validate_within(bounds).is_err());
        assert!(Rect::new(100, 100, 640, 480).validate_within(bounds).is_ok());
    }

    #[test]
    fn test_frame_size_range() {
        let range = FrameSizeRange::STEPWISE;
        assert!(range.contains(1920, 1080));
        assert!(!range.contains(1921, 1080));
        assert!(!range.contains(160, 144));
    }
}
