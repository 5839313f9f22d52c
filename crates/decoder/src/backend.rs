//! Collaborator seams of the decoder.
//!
//! The decode protocol talks to three external facilities through traits so
//! that it can be driven by the real NVDEC/CUDA stack or by test doubles:
//!
//! - [`CuvidApi`]: the hardware parser and decoder (CUVID).
//! - [`DeviceRuntime`]: device memory, copies, and cross-stream events.
//! - [`Reorganizer`]: the NV12 -> packed RGB conversion stage.
//!
//! The parser reports what it finds through [`ParserCallbacks`]; those
//! callbacks run synchronously inside [`CuvidApi::parse_unit`].

use std::ffi::c_void;
use std::ptr;

use nvp_common::{
    ChromaFormat, DecoderConfig, DeinterlaceMode, DevicePtr, Dimensions, DisplayArea, NvpResult,
    ResidencyQuery, ScanType, VideoCodec,
};

// ---------------------------------------------------------------------------
// Opaque handles
// ---------------------------------------------------------------------------

macro_rules! opaque_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        pub struct $name(u64);

        impl $name {
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn as_raw(self) -> u64 {
                self.0
            }
        }
    };
}

opaque_handle!(
    /// A hardware decoder object created by [`CuvidApi::create_decoder`].
    DecoderHandle
);
opaque_handle!(
    /// A bitstream parser created by [`CuvidApi::create_parser`].
    ParserHandle
);
opaque_handle!(
    /// A device event created by [`DeviceRuntime::create_event`].
    EventHandle
);
opaque_handle!(
    /// A device work queue.
    StreamHandle
);

impl StreamHandle {
    /// The runtime's default stream, which the hardware decoder writes on.
    pub const DEFAULT: Self = Self(0);
}

// ---------------------------------------------------------------------------
// Data reported by the parser
// ---------------------------------------------------------------------------

/// Stream format reported by a sequence header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequenceFormat {
    /// `None` when the stream uses a codec this library does not model.
    pub codec: Option<VideoCodec>,
    pub chroma_format: ChromaFormat,
    pub scan: ScanType,
    pub bit_depth_luma_minus8: u8,
    pub coded_width: u32,
    pub coded_height: u32,
    pub display_area: DisplayArea,
    pub min_num_decode_surfaces: u8,
}

impl SequenceFormat {
    /// Visible size of the stream. Falls back to the coded size when the
    /// display area is empty.
    pub fn display_dimensions(&self) -> Dimensions {
        let display = self.display_area.dimensions();
        if display.is_empty() {
            Dimensions::new(self.coded_width as usize, self.coded_height as usize)
        } else {
            display
        }
    }
}

/// A picture ready to be handed to the hardware decoder.
///
/// Produced by the parser; the protocol only reads the macroblock geometry
/// and forwards the whole value to [`CuvidApi::decode_picture`].
#[derive(Debug)]
pub struct PictureParams {
    pub width_in_mbs: u32,
    pub height_in_mbs: u32,
    pub picture_index: i32,
    /// Parser-owned parameter block, null for pictures built in Rust.
    raw: *mut c_void,
}

impl PictureParams {
    pub fn new(width_in_mbs: u32, height_in_mbs: u32, picture_index: i32) -> Self {
        Self {
            width_in_mbs,
            height_in_mbs,
            picture_index,
            raw: ptr::null_mut(),
        }
    }

    pub(crate) fn with_raw(
        width_in_mbs: u32,
        height_in_mbs: u32,
        picture_index: i32,
        raw: *mut c_void,
    ) -> Self {
        Self {
            width_in_mbs,
            height_in_mbs,
            picture_index,
            raw,
        }
    }

    pub(crate) fn raw(&self) -> *mut c_void {
        self.raw
    }

    /// Coded size of the picture (macroblocks are 16x16).
    pub fn dimensions(&self) -> Dimensions {
        Dimensions::from_macroblocks(self.width_in_mbs as usize, self.height_in_mbs as usize)
    }
}

/// A decoded picture the parser considers ready for display.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DisplayInfo {
    pub picture_index: i32,
    pub progressive: bool,
    pub timestamp: i64,
}

// ---------------------------------------------------------------------------
// Creation parameters
// ---------------------------------------------------------------------------

/// Parameters for a hardware decoder object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecoderCreateInfo {
    pub codec: VideoCodec,
    pub chroma_format: ChromaFormat,
    /// Geometry of the pictures the decoder will receive.
    pub input: Dimensions,
    /// Geometry the decoder scales its output surfaces to.
    pub target: Dimensions,
    /// Region of the input that is decoded (the whole picture).
    pub display_area: DisplayArea,
    pub num_decode_surfaces: u32,
    pub num_output_surfaces: u32,
    pub deinterlace: DeinterlaceMode,
}

impl DecoderCreateInfo {
    /// Single-profile parameters: 4:2:0 in, NV12 out, whole picture decoded.
    pub fn new(config: &DecoderConfig, input: Dimensions, target: Dimensions) -> Self {
        Self {
            codec: config.codec,
            chroma_format: ChromaFormat::Yuv420,
            input,
            target,
            display_area: DisplayArea::from_size(input.width, input.height),
            num_decode_surfaces: config.num_decode_surfaces,
            num_output_surfaces: config.num_output_surfaces,
            deinterlace: config.deinterlace,
        }
    }
}

/// Parameters for a bitstream parser.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParserCreateInfo {
    pub codec: VideoCodec,
    pub max_decode_surfaces: u32,
    pub error_threshold: u32,
    pub max_display_delay: u32,
}

impl From<&DecoderConfig> for ParserCreateInfo {
    fn from(config: &DecoderConfig) -> Self {
        Self {
            codec: config.codec,
            max_decode_surfaces: config.num_decode_surfaces,
            error_threshold: config.error_threshold,
            max_display_delay: config.max_display_delay,
        }
    }
}

/// A decoded surface mapped into device memory (NV12, `pitch` bytes per row).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MappedSurface {
    pub ptr: DevicePtr,
    pub pitch: u32,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Receiver of parser events during [`CuvidApi::parse_unit`].
///
/// Returning `false` tells the parser the event was rejected.
pub trait ParserCallbacks {
    /// A sequence header was parsed.
    fn on_sequence(&mut self, format: &SequenceFormat) -> bool;

    /// A complete picture is ready to be decoded.
    fn on_picture_decode(&mut self, picture: &PictureParams) -> bool;

    /// A picture is ready for display. `None` signals end of stream.
    fn on_display_ready(&mut self, info: Option<&DisplayInfo>) -> bool;
}

/// The hardware parser and decoder.
pub trait CuvidApi: Send + Sync {
    fn create_decoder(&self, info: &DecoderCreateInfo) -> NvpResult<DecoderHandle>;

    fn destroy_decoder(&self, decoder: DecoderHandle) -> NvpResult<()>;

    fn create_parser(&self, info: &ParserCreateInfo) -> NvpResult<ParserHandle>;

    fn destroy_parser(&self, parser: ParserHandle) -> NvpResult<()>;

    /// Feed one compressed unit to the parser. All resulting callbacks are
    /// delivered to `callbacks` before this returns.
    fn parse_unit(
        &self,
        parser: ParserHandle,
        data: &[u8],
        callbacks: &mut dyn ParserCallbacks,
    ) -> NvpResult<()>;

    fn decode_picture(&self, decoder: DecoderHandle, picture: &PictureParams) -> NvpResult<()>;

    /// Map a decoded picture as a progressive frame.
    fn map_frame(&self, decoder: DecoderHandle, picture_index: i32) -> NvpResult<MappedSurface>;

    fn unmap_frame(&self, decoder: DecoderHandle, surface: DevicePtr) -> NvpResult<()>;
}

/// Device memory, transfers, and event signalling.
pub trait DeviceRuntime: ResidencyQuery + Send + Sync {
    fn alloc_device(&self, bytes: usize) -> NvpResult<DevicePtr>;

    fn free_device(&self, ptr: DevicePtr) -> NvpResult<()>;

    /// Blocking device -> host copy of `dst.len()` bytes.
    fn copy_to_host(&self, dst: &mut [u8], src: DevicePtr) -> NvpResult<()>;

    /// Device -> host copy of `dst.len()` bytes queued on `stream`.
    ///
    /// `dst` must stay untouched until `stream` has been synchronized.
    fn copy_to_host_async(&self, dst: &mut [u8], src: DevicePtr, stream: StreamHandle)
        -> NvpResult<()>;

    fn create_event(&self) -> NvpResult<EventHandle>;

    fn record_event(&self, event: EventHandle, stream: StreamHandle) -> NvpResult<()>;

    /// Make future work on `stream` wait until `event` has fired.
    fn stream_wait_event(&self, stream: StreamHandle, event: EventHandle) -> NvpResult<()>;

    fn destroy_event(&self, event: EventHandle) -> NvpResult<()>;
}

/// NV12 -> packed RGB conversion stage with its own device stream.
pub trait Reorganizer: Send {
    /// Queue conversion of a `width`x`height` NV12 surface with row pitch
    /// `pitch` into `destination` (`width * height * 3` bytes).
    fn submit(
        &mut self,
        source: DevicePtr,
        width: usize,
        height: usize,
        destination: DevicePtr,
        pitch: u32,
    ) -> NvpResult<()>;

    /// Block until everything queued on [`Self::stream`] has completed.
    fn sync(&mut self) -> NvpResult<()>;

    fn stream(&self) -> StreamHandle;
}
