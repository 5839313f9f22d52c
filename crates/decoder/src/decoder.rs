//! `NvpDecoder`: lifecycle and the submission loop.
//!
//! A decode call submits the whole compressed unit to the parser and then
//! reacts to what the callbacks reported:
//!
//! - no picture was decoded: submit the same unit once more (the parser may
//!   need a second look before it emits a picture), then give up;
//! - the decoded geometry or the requested output size no longer matches the
//!   hardware decoder: rebuild it and submit the unit again;
//! - otherwise: convert the displayed picture into the caller's buffer.
//!
//! Each of the two resubmissions can happen at most once per call, so a
//! call submits the unit at most three times.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use nvp_common::{
    CodecMode, DecodeDims, DecoderConfig, Dimensions, InputBuffer, NvpError, NvpResult,
    OutputBuffer, PipeCodec, PixelFormat,
};

use crate::backend::{
    CuvidApi, DeviceRuntime, EventHandle, ParserCreateInfo, ParserHandle, Reorganizer,
};
use crate::materialize::FrameSink;
use crate::staging::StagingBuffer;
use crate::tracker::{DecodeState, Hardware, SequenceTracker};

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Running counters for one decoder instance.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecoderStats {
    /// Units handed to the parser, resubmissions included.
    pub submissions: u64,
    /// Resubmissions because a submission produced no displayable picture.
    pub empty_resubmissions: u64,
    /// Resubmissions after rebuilding the hardware decoder.
    pub geometry_resubmissions: u64,
    pub decoder_creations: u64,
    pub target_allocations: u64,
    pub pictures_decoded: u64,
    pub frames_materialized: u64,
}

// ---------------------------------------------------------------------------
// Ready event (RAII)
// ---------------------------------------------------------------------------

/// Event signalling "the decoder's output is complete" to the conversion
/// stream. Destroyed on drop.
struct ReadyEvent {
    runtime: Arc<dyn DeviceRuntime>,
    handle: EventHandle,
}

impl ReadyEvent {
    fn create(runtime: &Arc<dyn DeviceRuntime>) -> NvpResult<Self> {
        let handle = runtime.create_event().map_err(|e| {
            error!(error = %e, "could not create synchronization event");
            e
        })?;
        Ok(Self {
            runtime: Arc::clone(runtime),
            handle,
        })
    }
}

impl Drop for ReadyEvent {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.destroy_event(self.handle) {
            warn!(event = ?self.handle, error = %e, "failed to destroy synchronization event");
        }
    }
}

// ---------------------------------------------------------------------------
// NvpDecoder
// ---------------------------------------------------------------------------

/// Hardware H.264 decoder producing packed RGB frames.
///
/// Not `Sync`: one decoder serves one caller at a time.
///
/// Teardown order is parser, hardware decoder, target buffer, conversion
/// stage, ready event. Failures during teardown are logged and skipped.
pub struct NvpDecoder {
    api: Arc<dyn CuvidApi>,
    runtime: Arc<dyn DeviceRuntime>,
    config: DecoderConfig,
    parser: Option<ParserHandle>,
    state: DecodeState,
    staging: StagingBuffer,
    // Field order matters: the conversion stage is dropped before the event.
    reorganizer: Box<dyn Reorganizer>,
    ready: ReadyEvent,
}

impl std::fmt::Debug for NvpDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvpDecoder")
            .field("initialized", &self.state.initialized)
            .field("decoder", &self.state.decoder)
            .field("parser", &self.parser)
            .field("dims", &self.state.dims)
            .field("staging_capacity", &self.staging.capacity())
            .field("stats", &self.state.stats)
            .finish()
    }
}

impl NvpDecoder {
    /// Create a decoder.
    ///
    /// Only the ready event and the conversion stage are created here. The
    /// parser appears on the first decode call, the hardware decoder on the
    /// first sequence header.
    pub fn create<F>(
        api: Arc<dyn CuvidApi>,
        runtime: Arc<dyn DeviceRuntime>,
        config: DecoderConfig,
        make_reorganizer: F,
    ) -> NvpResult<Self>
    where
        F: FnOnce() -> NvpResult<Box<dyn Reorganizer>>,
    {
        config.validate()?;
        let ready = ReadyEvent::create(&runtime)?;
        // `ready` is released by its guard if this fails.
        let reorganizer = make_reorganizer().map_err(|e| {
            error!(error = %e, "could not create the NV12 to RGB conversion stage");
            e
        })?;

        info!(
            codec = config.codec.display_name(),
            max_width = config.max_width,
            max_height = config.max_height,
            "decoder created"
        );
        Ok(Self {
            api,
            runtime,
            config,
            parser: None,
            state: DecodeState::default(),
            staging: StagingBuffer::new(),
            reorganizer,
            ready,
        })
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn stats(&self) -> &DecoderStats {
        &self.state.stats
    }

    pub fn dims(&self) -> DecodeDims {
        self.state.dims
    }

    pub fn is_initialized(&self) -> bool {
        self.state.initialized
    }

    pub fn staging_capacity(&self) -> usize {
        self.staging.capacity()
    }

    /// Decode one compressed unit into `output` as `width`x`height` packed RGB.
    ///
    /// Exactly `width * height * 3` bytes of `output` are written on success.
    pub fn decode(
        &mut self,
        input: InputBuffer<'_>,
        mut output: OutputBuffer<'_>,
        width: usize,
        height: usize,
    ) -> NvpResult<()> {
        let wanted = Self::validate_call(&input, &output, width, height)?;
        self.ensure_parser()?;

        self.state.dims.source = Dimensions::ZERO;
        let mut retried_empty = false;
        let mut rebuilt = false;

        loop {
            self.submit(input)?;

            if self.state.dims.source.is_empty() {
                self.retry_empty(&mut retried_empty, "no picture was decoded")?;
                continue;
            }

            if self.state.needs_rebuild(wanted) {
                if rebuilt {
                    error!(
                        source = %self.state.dims.source,
                        input = %self.state.dims.input,
                        "stream geometry changed again after rebuilding the decoder"
                    );
                    return Err(NvpError::decode(format!(
                        "stream geometry changed again ({} after rebuilding for {})",
                        self.state.dims.source, self.state.dims.input
                    )));
                }
                rebuilt = true;
                let source = self.state.dims.source;
                debug!(
                    %source,
                    input = %self.state.dims.input,
                    target = %self.state.dims.target,
                    %wanted,
                    "geometry mismatch, rebuilding decoder"
                );
                let hw = Hardware {
                    api: self.api.as_ref(),
                    runtime: &self.runtime,
                    config: &self.config,
                };
                self.state.rebuild(hw, source, wanted)?;
                self.state.stats.geometry_resubmissions += 1;
                continue;
            }

            let Some(picture_index) = self.state.pending_picture.take() else {
                self.retry_empty(&mut retried_empty, "no picture became ready for display")?;
                continue;
            };

            return self.materialize(picture_index, wanted, &mut output);
        }
    }

    fn validate_call(
        input: &InputBuffer<'_>,
        output: &OutputBuffer<'_>,
        width: usize,
        height: usize,
    ) -> NvpResult<Dimensions> {
        if input.is_empty() {
            error!("compressed input is empty");
            return Err(NvpError::invalid("compressed input is empty"));
        }
        if width == 0 || height == 0 {
            error!(width, height, "requested output size is empty");
            return Err(NvpError::invalid(format!("output size {width}x{height} is empty")));
        }
        if height % 2 != 0 {
            error!(height, "requested output height must be even");
            return Err(NvpError::invalid(format!("output height {height} is odd")));
        }
        let wanted = Dimensions::new(width, height);
        if output.len() < wanted.rgb_len() {
            error!(
                needed = wanted.rgb_len(),
                available = output.len(),
                "output buffer too small"
            );
            return Err(NvpError::invalid(format!(
                "output buffer holds {} bytes, {wanted} RGB needs {}",
                output.len(),
                wanted.rgb_len()
            )));
        }
        Ok(wanted)
    }

    fn ensure_parser(&mut self) -> NvpResult<ParserHandle> {
        if let Some(parser) = self.parser {
            return Ok(parser);
        }
        let info = ParserCreateInfo::from(&self.config);
        let parser = self.api.create_parser(&info).map_err(|e| {
            error!(error = %e, "could not create bitstream parser");
            e
        })?;
        debug!(
            parser = ?parser,
            surfaces = info.max_decode_surfaces,
            delay = info.max_display_delay,
            "created bitstream parser"
        );
        self.parser = Some(parser);
        Ok(parser)
    }

    /// Hand the whole unit to the parser once.
    fn submit(&mut self, input: InputBuffer<'_>) -> NvpResult<()> {
        let parser = self.ensure_parser()?;
        let data = self.staging.host_view(self.runtime.as_ref(), input)?;
        let hw = Hardware {
            api: self.api.as_ref(),
            runtime: &self.runtime,
            config: &self.config,
        };
        self.state.stats.submissions += 1;

        let mut tracker = SequenceTracker::new(hw, &mut self.state);
        let parsed = self.api.parse_unit(parser, data, &mut tracker);
        if let Some(failure) = tracker.take_failure() {
            return Err(failure);
        }
        parsed.map_err(|e| {
            error!(bytes = data.len(), error = %e, "parser rejected compressed input");
            e
        })
    }

    fn retry_empty(&mut self, retried: &mut bool, reason: &str) -> NvpResult<()> {
        if *retried {
            error!(reason, "input is only stream metadata, no frame to deliver");
            return Err(NvpError::invalid(format!(
                "input produced no frame after resubmission: {reason}"
            )));
        }
        *retried = true;
        self.state.stats.empty_resubmissions += 1;
        debug!(reason, "resubmitting unit");
        Ok(())
    }

    fn materialize(
        &mut self,
        picture_index: i32,
        dims: Dimensions,
        output: &mut OutputBuffer<'_>,
    ) -> NvpResult<()> {
        let decoder = self
            .state
            .decoder
            .ok_or_else(|| NvpError::decode("no hardware decoder to map from"))?;
        let mut sink = FrameSink {
            api: self.api.as_ref(),
            runtime: self.runtime.as_ref(),
            reorganizer: self.reorganizer.as_mut(),
            decoder,
            ready: self.ready.handle,
            target: self.state.target.as_ref().map(|buffer| buffer.ptr()),
        };
        sink.materialize(picture_index, dims, output)?;
        self.state.stats.frames_materialized += 1;
        Ok(())
    }

    fn reject_misuse(&self, operation: &str, message: &str) -> NvpError {
        error!(operation, "{message}");
        if self.config.panic_on_misuse {
            panic!("{operation}: {message}");
        }
        NvpError::Configuration(format!("{operation}: {message}"))
    }
}

impl Drop for NvpDecoder {
    fn drop(&mut self) {
        if let Some(parser) = self.parser.take() {
            if let Err(e) = self.api.destroy_parser(parser) {
                warn!(parser = ?parser, error = %e, "failed to destroy bitstream parser");
            }
        }
        self.state.release_decoder(self.api.as_ref());
        self.state.target = None;
        debug!(stats = ?self.state.stats, "decoder destroyed");
    }
}

impl PipeCodec for NvpDecoder {
    fn mode(&self) -> CodecMode {
        CodecMode::Decoder
    }

    fn encode(
        &mut self,
        _input: InputBuffer<'_>,
        _output: &mut [u8],
        _width: usize,
        _height: usize,
        _format: PixelFormat,
    ) -> NvpResult<usize> {
        Err(self.reject_misuse("encode", "a decoder cannot encode; create an encoder instead"))
    }

    fn set_bitrate(&mut self, _bitrate: u64) -> NvpResult<()> {
        Err(self.reject_misuse(
            "set_bitrate",
            "bitrate is a property of the encoded stream; set it on the encoder",
        ))
    }

    fn decode(
        &mut self,
        input: InputBuffer<'_>,
        output: OutputBuffer<'_>,
        width: usize,
        height: usize,
    ) -> NvpResult<()> {
        NvpDecoder::decode(self, input, output, width, height)
    }
}
