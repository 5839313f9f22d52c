//! Decoder configuration.

use serde::{Deserialize, Serialize};

use crate::codec::VideoCodec;
use crate::error::{NvpError, NvpResult};

/// Deinterlacing applied by the hardware decoder.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeinterlaceMode {
    Weave,
    Bob,
    #[default]
    Adaptive,
}

/// Hardware decoder configuration.
///
/// Every field has a default, so a JSON document only needs to name the
/// values it overrides.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub codec: VideoCodec,
    /// Streams wider than this are attempted anyway, with a warning.
    pub max_width: usize,
    /// Streams taller than this are attempted anyway, with a warning.
    pub max_height: usize,
    /// Decode surfaces for both the parser and the hardware decoder.
    pub num_decode_surfaces: u32,
    /// Output surfaces that may be mapped at the same time.
    pub num_output_surfaces: u32,
    /// Parser display latency in frames (0 = no deliberate queuing).
    pub max_display_delay: u32,
    /// Parser error tolerance, 0..=100.
    pub error_threshold: u32,
    pub deinterlace: DeinterlaceMode,
    /// CUDA device used by the production backend.
    pub device_ordinal: usize,
    /// Panic when an encode-only operation is invoked on a decoder.
    pub panic_on_misuse: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            codec: VideoCodec::H264,
            max_width: 4096,
            max_height: 4096,
            num_decode_surfaces: 2,
            num_output_surfaces: 1,
            max_display_delay: 0,
            error_threshold: 100,
            deinterlace: DeinterlaceMode::Adaptive,
            device_ordinal: 0,
            panic_on_misuse: cfg!(debug_assertions),
        }
    }
}

impl DecoderConfig {
    /// Parse a configuration from JSON and validate it.
    pub fn from_json(json: &str) -> NvpResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| NvpError::Configuration(format!("invalid decoder config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> NvpResult<()> {
        if self.max_width == 0 || self.max_height == 0 {
            return Err(NvpError::Configuration(
                "max_width and max_height must be non-zero".into(),
            ));
        }
        if self.num_decode_surfaces == 0 || self.num_output_surfaces == 0 {
            return Err(NvpError::Configuration(
                "surface counts must be non-zero".into(),
            ));
        }
        if self.error_threshold > 100 {
            return Err(NvpError::Configuration(format!(
                "error_threshold must be 0..=100, got {}",
                self.error_threshold
            )));
        }
        Ok(())
    }

    /// Whether a stream of the given size exceeds the soft limits.
    pub fn exceeds_limits(&self, width: usize, height: usize) -> bool {
        width > self.max_width || height > self.max_height
    }
}
