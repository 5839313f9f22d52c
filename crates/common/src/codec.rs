//! Codec, chroma and pixel format enums.

use serde::{Deserialize, Serialize};

/// Video codec identifier.
///
/// The library produces and consumes a single fixed profile, so only H.264
/// is modelled.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoCodec {
    #[default]
    H264,
}

impl VideoCodec {
    /// Human readable name (for display/logging).
    pub fn display_name(self) -> &'static str {
        match self {
            Self::H264 => "H.264/AVC",
        }
    }
}

/// Chroma subsampling reported by a stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChromaFormat {
    Monochrome,
    Yuv420,
    Yuv422,
    Yuv444,
}

/// Frame scan type reported by a stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanType {
    Progressive,
    Interlaced,
}

/// Pixel layout of uncompressed frames handed to or returned from a codec.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Packed 8-bit RGB, 3 bytes per pixel.
    #[default]
    Rgb,
    /// Packed 8-bit RGBA, 4 bytes per pixel.
    Rgba,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgb => 3,
            Self::Rgba => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_display() {
        assert_eq!(VideoCodec::H264.display_name(), "H.264/AVC");
        assert_eq!(VideoCodec::default(), VideoCodec::H264);
    }

    #[test]
    fn pixel_sizes() {
        assert_eq!(PixelFormat::Rgb.bytes_per_pixel(), 3);
        assert_eq!(PixelFormat::Rgba.bytes_per_pixel(), 4);
    }
}
