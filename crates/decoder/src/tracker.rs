//! Geometry tracking and the hardware decoder (re)creation policy.
//!
//! [`DecodeState`] is everything a decoder remembers between calls: the
//! hardware decoder object, the geometry it was built for, the RGB target
//! buffer, and the picture most recently reported ready for display.
//!
//! [`SequenceTracker`] receives the parser's callbacks for one submission
//! and updates that state. Callback failures are kept on the tracker so the
//! submission can surface the precise error after the parser returns.

use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};

use nvp_common::{
    ChromaFormat, DecodeDims, DecoderConfig, Dimensions, NvpError, NvpResult, ScanType,
};

use crate::backend::{
    CuvidApi, DecoderCreateInfo, DecoderHandle, DeviceRuntime, DisplayInfo, ParserCallbacks,
    PictureParams, SequenceFormat,
};
use crate::decoder::DecoderStats;
use crate::materialize::TargetBuffer;

/// Collaborators needed to build or tear down a hardware decoder.
#[derive(Clone, Copy)]
pub struct Hardware<'a> {
    pub api: &'a dyn CuvidApi,
    pub runtime: &'a Arc<dyn DeviceRuntime>,
    pub config: &'a DecoderConfig,
}

// ---------------------------------------------------------------------------
// Decode state
// ---------------------------------------------------------------------------

/// Per-decoder state carried across decode calls.
#[derive(Debug, Default)]
pub struct DecodeState {
    /// Set once the first sequence header produced a decoder.
    pub initialized: bool,
    pub decoder: Option<DecoderHandle>,
    pub dims: DecodeDims,
    pub target: Option<TargetBuffer>,
    /// Picture index from the latest display-ready callback.
    pub pending_picture: Option<i32>,
    pub stats: DecoderStats,
}

impl DecodeState {
    /// Whether the hardware decoder must be rebuilt before the picture just
    /// decoded can be delivered at `wanted`.
    pub fn needs_rebuild(&self, wanted: Dimensions) -> bool {
        !self.initialized
            || self.decoder.is_none()
            || self.dims.source != self.dims.input
            || self.dims.target != wanted
    }

    /// Destroy any current decoder and create one for `input` pictures
    /// scaled to `target`.
    ///
    /// The target buffer is reallocated only when `target` differs from the
    /// size it was allocated for. Any pending display index belongs to the
    /// old decoder and is dropped.
    ///
    /// `dims.input` only changes once the new decoder exists. A failed
    /// target allocation clears `dims.target`.
    pub fn rebuild(
        &mut self,
        hw: Hardware<'_>,
        input: Dimensions,
        target: Dimensions,
    ) -> NvpResult<()> {
        debug_assert!(!input.is_empty() && !target.is_empty());
        self.release_decoder(hw.api);
        self.pending_picture = None;

        info!(%input, %target, "creating hardware decoder");
        let info = DecoderCreateInfo::new(hw.config, input, target);
        let handle = hw.api.create_decoder(&info).map_err(|e| {
            error!(%input, %target, error = %e, "could not create hardware decoder");
            e
        })?;
        self.decoder = Some(handle);
        self.dims.input = input;
        self.stats.decoder_creations += 1;

        let reusable = self
            .target
            .as_ref()
            .is_some_and(|buffer| buffer.dimensions() == target);
        if !reusable {
            self.target = None;
            match TargetBuffer::allocate(hw.runtime, target) {
                Ok(buffer) => self.target = Some(buffer),
                Err(e) => {
                    // No buffer backs any size now; the next call must rebuild.
                    self.dims.target = Dimensions::ZERO;
                    return Err(e);
                }
            }
            self.stats.target_allocations += 1;
        }
        self.dims.target = target;
        self.initialized = true;
        Ok(())
    }

    /// Destroy the hardware decoder, if any. Failures are logged only.
    pub fn release_decoder(&mut self, api: &dyn CuvidApi) {
        if let Some(decoder) = self.decoder.take() {
            debug!(decoder = ?decoder, "destroying hardware decoder");
            if let Err(e) = api.destroy_decoder(decoder) {
                warn!(decoder = ?decoder, error = %e, "failed to destroy hardware decoder");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Parser callbacks
// ---------------------------------------------------------------------------

/// Receives the parser callbacks of one submission.
pub struct SequenceTracker<'a> {
    hw: Hardware<'a>,
    state: &'a mut DecodeState,
    failure: Option<NvpError>,
}

impl<'a> SequenceTracker<'a> {
    pub fn new(hw: Hardware<'a>, state: &'a mut DecodeState) -> Self {
        Self {
            hw,
            state,
            failure: None,
        }
    }

    /// The first error raised by a callback, if any.
    pub fn take_failure(&mut self) -> Option<NvpError> {
        self.failure.take()
    }

    fn fail(&mut self, err: NvpError) -> bool {
        if self.failure.is_none() {
            self.failure = Some(err);
        }
        false
    }
}

impl ParserCallbacks for SequenceTracker<'_> {
    fn on_sequence(&mut self, format: &SequenceFormat) -> bool {
        let shown = format.display_dimensions();
        let config = self.hw.config;

        if config.exceeds_limits(shown.width, shown.height) {
            warn!(
                display = %shown,
                max_width = config.max_width,
                max_height = config.max_height,
                "stream exceeds the supported size, decoding anyway"
            );
        }

        if format.bit_depth_luma_minus8 != 0 {
            let depth = u32::from(format.bit_depth_luma_minus8) + 8;
            warn!(bit_depth = depth, "only 8-bit streams are supported");
            return self.fail(NvpError::decode(format!("unsupported {depth}-bit stream")));
        }
        if format.codec != Some(config.codec)
            || format.chroma_format != ChromaFormat::Yuv420
            || format.scan != ScanType::Progressive
        {
            warn!(
                codec = ?format.codec,
                chroma = ?format.chroma_format,
                scan = ?format.scan,
                "stream does not match the progressive 4:2:0 profile"
            );
            return self.fail(NvpError::decode(format!(
                "unsupported stream profile: codec {:?}, chroma {:?}, scan {:?}",
                format.codec, format.chroma_format, format.scan
            )));
        }

        if format.coded_height as usize != shown.height {
            trace!(
                coded_height = format.coded_height,
                display_height = shown.height,
                "coded height differs from display height"
            );
        }

        if self.state.initialized && self.state.decoder.is_some() {
            return true;
        }
        // After a failed rebuild, recreate at the last geometry that worked.
        let (input, target) = if self.state.initialized
            && !self.state.dims.input.is_empty()
            && !self.state.dims.target.is_empty()
        {
            (self.state.dims.input, self.state.dims.target)
        } else {
            (shown, shown)
        };
        match self.state.rebuild(self.hw, input, target) {
            Ok(()) => true,
            Err(e) => self.fail(e),
        }
    }

    fn on_picture_decode(&mut self, picture: &PictureParams) -> bool {
        let Some(decoder) = self.state.decoder else {
            error!("picture arrived before any sequence header created a decoder");
            return self.fail(NvpError::decode("picture arrived before a sequence header"));
        };

        if let Err(e) = self.hw.api.decode_picture(decoder, picture) {
            error!(picture_index = picture.picture_index, error = %e, "hardware decode failed");
            return self.fail(e);
        }

        self.state.dims.source = picture.dimensions();
        self.state.stats.pictures_decoded += 1;
        true
    }

    fn on_display_ready(&mut self, info: Option<&DisplayInfo>) -> bool {
        match info {
            Some(info) => {
                trace!(picture_index = info.picture_index, pts = info.timestamp, "picture ready");
                self.state.pending_picture = Some(info.picture_index);
            }
            None => debug!("end of stream signalled by parser"),
        }
        true
    }
}
