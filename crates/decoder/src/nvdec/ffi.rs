//! Raw FFI bindings for NVIDIA's CUVID (nvcuvid) library.
//!
//! Loaded dynamically at runtime via `libloading`. Only the surface needed
//! for single-profile H.264 decoding through NVDEC is bound.
//!
//! Reference: NVIDIA Video Codec SDK, `nvcuvid.h` and `cuviddec.h`. Fields
//! declared `unsigned long` in the headers use `c_ulong`, which is 32 bits
//! on Windows and 64 bits on Linux.

use std::ffi::{c_int, c_longlong, c_short, c_uchar, c_uint, c_ulong, c_void};
use std::path::Path;
use std::ptr;

use libloading::Library;
use tracing::{debug, info};

use nvp_common::{ChromaFormat, DeinterlaceMode, NvpError, VideoCodec};

// ---------------------------------------------------------------------------
// Result codes and handles
// ---------------------------------------------------------------------------

/// CUDA driver status code; 0 means success.
pub type CUresult = c_int;

pub const CUDA_SUCCESS: CUresult = 0;

pub type CUdeviceptr = u64;
pub type CUstream = *mut c_void;
pub type CUvideodecoder = *mut c_void;
pub type CUvideoparser = *mut c_void;
pub type CUvideoctxlock = *mut c_void;
pub type CUvideotimestamp = c_longlong;

// ---------------------------------------------------------------------------
// Enum values (kept as plain integers: the driver may report values this
// crate does not know about)
// ---------------------------------------------------------------------------

/// `cudaVideoCodec`.
pub mod codec {
    pub const H264: i32 = 4;
}

/// `cudaVideoChromaFormat`.
pub mod chroma {
    pub const MONOCHROME: i32 = 0;
    pub const YUV420: i32 = 1;
    pub const YUV422: i32 = 2;
    pub const YUV444: i32 = 3;
}

/// `cudaVideoSurfaceFormat`.
pub mod surface {
    pub const NV12: i32 = 0;
}

/// `cudaVideoDeinterlaceMode`.
pub mod deinterlace {
    pub const WEAVE: i32 = 0;
    pub const BOB: i32 = 1;
    pub const ADAPTIVE: i32 = 2;
}

/// `cudaVideoCreateFlags`.
pub mod create_flags {
    pub const PREFER_CUVID: super::c_ulong = 0x04;
}

pub fn codec_id(codec: VideoCodec) -> i32 {
    match codec {
        VideoCodec::H264 => codec::H264,
    }
}

pub fn codec_from_id(id: i32) -> Option<VideoCodec> {
    match id {
        codec::H264 => Some(VideoCodec::H264),
        _ => None,
    }
}

pub fn chroma_id(format: ChromaFormat) -> i32 {
    match format {
        ChromaFormat::Monochrome => chroma::MONOCHROME,
        ChromaFormat::Yuv420 => chroma::YUV420,
        ChromaFormat::Yuv422 => chroma::YUV422,
        ChromaFormat::Yuv444 => chroma::YUV444,
    }
}

pub fn chroma_from_id(id: i32) -> Option<ChromaFormat> {
    match id {
        chroma::MONOCHROME => Some(ChromaFormat::Monochrome),
        chroma::YUV420 => Some(ChromaFormat::Yuv420),
        chroma::YUV422 => Some(ChromaFormat::Yuv422),
        chroma::YUV444 => Some(ChromaFormat::Yuv444),
        _ => None,
    }
}

pub fn deinterlace_id(mode: DeinterlaceMode) -> i32 {
    match mode {
        DeinterlaceMode::Weave => deinterlace::WEAVE,
        DeinterlaceMode::Bob => deinterlace::BOB,
        DeinterlaceMode::Adaptive => deinterlace::ADAPTIVE,
    }
}

// ---------------------------------------------------------------------------
// Structures
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct ShortRect {
    pub left: c_short,
    pub top: c_short,
    pub right: c_short,
    pub bottom: c_short,
}

/// `CUVIDDECODECREATEINFO`.
#[repr(C)]
#[derive(Debug)]
pub struct CuvidDecodeCreateInfo {
    pub width: c_ulong,
    pub height: c_ulong,
    pub num_decode_surfaces: c_ulong,
    pub codec_type: c_int,
    pub chroma_format: c_int,
    pub creation_flags: c_ulong,
    pub bit_depth_minus8: c_ulong,
    pub intra_decode_only: c_ulong,
    pub max_width: c_ulong,
    pub max_height: c_ulong,
    pub reserved1: c_ulong,
    pub display_area: ShortRect,
    pub output_format: c_int,
    pub deinterlace_mode: c_int,
    pub target_width: c_ulong,
    pub target_height: c_ulong,
    pub num_output_surfaces: c_ulong,
    pub vid_lock: CUvideoctxlock,
    pub target_rect: ShortRect,
    pub enable_histogram: c_ulong,
    pub reserved2: [c_ulong; 4],
}

impl Default for CuvidDecodeCreateInfo {
    fn default() -> Self {
        // SAFETY: all-zero is the documented "unset" value of every field,
        // including the null context lock.
        unsafe { std::mem::zeroed() }
    }
}

/// Leading fields of `CUVIDPICPARAMS`.
///
/// The full structure is owned by the parser and only ever forwarded by
/// pointer; the geometry and picture index are read from its head.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct CuvidPicParamsHead {
    pub pic_width_in_mbs: c_int,
    pub frame_height_in_mbs: c_int,
    pub curr_pic_idx: c_int,
}

/// `CUVIDPROCPARAMS`.
#[repr(C)]
#[derive(Debug)]
pub struct CuvidProcParams {
    pub progressive_frame: c_int,
    pub second_field: c_int,
    pub top_field_first: c_int,
    pub unpaired_field: c_int,
    pub reserved_flags: c_uint,
    pub reserved_zero: c_uint,
    pub raw_input_dptr: u64,
    pub raw_input_pitch: c_uint,
    pub raw_input_format: c_uint,
    pub raw_output_dptr: u64,
    pub raw_output_pitch: c_uint,
    pub reserved1: c_uint,
    pub output_stream: CUstream,
    pub reserved: [c_uint; 46],
    pub histogram_dptr: *mut u64,
    pub reserved2: [*mut c_void; 1],
}

impl Default for CuvidProcParams {
    fn default() -> Self {
        // SAFETY: zero is a valid value for every integer and pointer field.
        unsafe { std::mem::zeroed() }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct FrameRate {
    pub numerator: c_uint,
    pub denominator: c_uint,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct IntRect {
    pub left: c_int,
    pub top: c_int,
    pub right: c_int,
    pub bottom: c_int,
}

/// `CUVIDEOFORMAT`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct CuVideoFormat {
    pub codec: c_int,
    pub frame_rate: FrameRate,
    pub progressive_sequence: c_uchar,
    pub bit_depth_luma_minus8: c_uchar,
    pub bit_depth_chroma_minus8: c_uchar,
    pub min_num_decode_surfaces: c_uchar,
    pub coded_width: c_uint,
    pub coded_height: c_uint,
    pub display_area: IntRect,
    pub chroma_format: c_int,
    pub bitrate: c_uint,
    pub display_aspect_ratio: [c_int; 2],
    /// Packed `video_signal_description` bitfields.
    pub video_signal_description: [c_uchar; 4],
    pub seqhdr_data_length: c_uint,
}

/// `CUVIDPARSERDISPINFO`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct CuvidParserDispInfo {
    pub picture_index: c_int,
    pub progressive_frame: c_int,
    pub top_field_first: c_int,
    pub repeat_first_field: c_int,
    pub timestamp: CUvideotimestamp,
}

pub type PfnSequenceCallback = unsafe extern "C" fn(*mut c_void, *mut CuVideoFormat) -> c_int;
pub type PfnDecodeCallback = unsafe extern "C" fn(*mut c_void, *mut c_void) -> c_int;
pub type PfnDisplayCallback = unsafe extern "C" fn(*mut c_void, *mut CuvidParserDispInfo) -> c_int;

/// `CUVIDPARSERPARAMS`.
#[repr(C)]
pub struct CuvidParserParams {
    pub codec_type: c_int,
    pub max_num_decode_surfaces: c_uint,
    pub clock_rate: c_uint,
    pub error_threshold: c_uint,
    pub max_display_delay: c_uint,
    /// `bAnnexb:1` and `uReserved:31`.
    pub annexb_and_reserved: c_uint,
    pub reserved1: [c_uint; 4],
    pub user_data: *mut c_void,
    pub pfn_sequence_callback: Option<PfnSequenceCallback>,
    pub pfn_decode_picture: Option<PfnDecodeCallback>,
    pub pfn_display_picture: Option<PfnDisplayCallback>,
    pub pfn_get_operating_point: Option<unsafe extern "C" fn()>,
    pub pfn_get_sei_msg: Option<unsafe extern "C" fn()>,
    pub reserved2: [*mut c_void; 5],
    pub ext_video_info: *mut c_void,
}

impl Default for CuvidParserParams {
    fn default() -> Self {
        Self {
            codec_type: 0,
            max_num_decode_surfaces: 0,
            clock_rate: 0,
            error_threshold: 0,
            max_display_delay: 0,
            annexb_and_reserved: 0,
            reserved1: [0; 4],
            user_data: ptr::null_mut(),
            pfn_sequence_callback: None,
            pfn_decode_picture: None,
            pfn_display_picture: None,
            pfn_get_operating_point: None,
            pfn_get_sei_msg: None,
            reserved2: [ptr::null_mut(); 5],
            ext_video_info: ptr::null_mut(),
        }
    }
}

/// `CUVIDSOURCEDATAPACKET`.
#[repr(C)]
#[derive(Debug)]
pub struct CuvidSourceDataPacket {
    pub flags: c_ulong,
    pub payload_size: c_ulong,
    pub payload: *const c_uchar,
    pub timestamp: CUvideotimestamp,
}

// ---------------------------------------------------------------------------
// Dynamic library wrapper
// ---------------------------------------------------------------------------

/// Dynamically loaded nvcuvid library with typed function pointers.
#[allow(non_snake_case)]
pub struct NvcuvidLibrary {
    /// Keeps the shared object mapped while the pointers below are in use.
    _lib: Library,

    pub cuvidCreateDecoder:
        unsafe extern "C" fn(*mut CUvideodecoder, *mut CuvidDecodeCreateInfo) -> CUresult,
    pub cuvidDestroyDecoder: unsafe extern "C" fn(CUvideodecoder) -> CUresult,
    pub cuvidDecodePicture: unsafe extern "C" fn(CUvideodecoder, *mut c_void) -> CUresult,
    pub cuvidMapVideoFrame64: unsafe extern "C" fn(
        CUvideodecoder,
        c_int,
        *mut CUdeviceptr,
        *mut c_uint,
        *mut CuvidProcParams,
    ) -> CUresult,
    pub cuvidUnmapVideoFrame64: unsafe extern "C" fn(CUvideodecoder, CUdeviceptr) -> CUresult,
    pub cuvidCreateVideoParser:
        unsafe extern "C" fn(*mut CUvideoparser, *mut CuvidParserParams) -> CUresult,
    pub cuvidDestroyVideoParser: unsafe extern "C" fn(CUvideoparser) -> CUresult,
    pub cuvidParseVideoData:
        unsafe extern "C" fn(CUvideoparser, *mut CuvidSourceDataPacket) -> CUresult,
}

// SAFETY: the function pointers reference driver entry points that may be
// called from any thread; `_lib` keeps them valid.
unsafe impl Send for NvcuvidLibrary {}
unsafe impl Sync for NvcuvidLibrary {}

impl std::fmt::Debug for NvcuvidLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvcuvidLibrary").finish_non_exhaustive()
    }
}

/// Copy a typed symbol out of `lib`.
///
/// # Safety
/// `T` must be the exact function pointer type of `name`.
unsafe fn load_symbol<T: Copy>(lib: &Library, name: &str) -> Result<T, NvcuvidLoadError> {
    let symbol = format!("{name}\0");
    lib.get::<T>(symbol.as_bytes())
        .map(|sym| *sym)
        .map_err(|e| NvcuvidLoadError::SymbolNotFound(format!("{name}: {e}")))
}

impl NvcuvidLibrary {
    /// Load nvcuvid from the system library path.
    pub fn load() -> Result<Self, NvcuvidLoadError> {
        let name = Self::library_name();
        info!(library = name, "loading NVDEC library");
        // SAFETY: loading the NVIDIA driver's own library runs no
        // initialisation beyond registering its entry points.
        let lib = unsafe { Library::new(name) }.map_err(|e| {
            NvcuvidLoadError::LibraryNotFound(format!(
                "{name}: {e}. Is the NVIDIA driver installed?"
            ))
        })?;
        Self::from_library(lib)
    }

    /// Load nvcuvid from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self, NvcuvidLoadError> {
        info!(path = %path.display(), "loading NVDEC library");
        // SAFETY: the caller names a library that exports the CUVID API.
        let lib = unsafe { Library::new(path) }.map_err(|e| {
            NvcuvidLoadError::LibraryNotFound(format!("{}: {e}", path.display()))
        })?;
        Self::from_library(lib)
    }

    fn from_library(lib: Library) -> Result<Self, NvcuvidLoadError> {
        // SAFETY: each type below matches the prototype in the SDK headers.
        unsafe {
            let loaded = Self {
                cuvidCreateDecoder: load_symbol(&lib, "cuvidCreateDecoder")?,
                cuvidDestroyDecoder: load_symbol(&lib, "cuvidDestroyDecoder")?,
                cuvidDecodePicture: load_symbol(&lib, "cuvidDecodePicture")?,
                cuvidMapVideoFrame64: load_symbol(&lib, "cuvidMapVideoFrame64")?,
                cuvidUnmapVideoFrame64: load_symbol(&lib, "cuvidUnmapVideoFrame64")?,
                cuvidCreateVideoParser: load_symbol(&lib, "cuvidCreateVideoParser")?,
                cuvidDestroyVideoParser: load_symbol(&lib, "cuvidDestroyVideoParser")?,
                cuvidParseVideoData: load_symbol(&lib, "cuvidParseVideoData")?,
                _lib: lib,
            };
            debug!("all NVDEC symbols loaded");
            Ok(loaded)
        }
    }

    fn library_name() -> &'static str {
        if cfg!(target_os = "windows") {
            "nvcuvid.dll"
        } else {
            "libnvcuvid.so.1"
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur when loading the nvcuvid library.
#[derive(Debug, thiserror::Error)]
pub enum NvcuvidLoadError {
    #[error("NVDEC library not found: {0}")]
    LibraryNotFound(String),

    #[error("required symbol not found: {0}")]
    SymbolNotFound(String),
}

impl From<NvcuvidLoadError> for NvpError {
    fn from(err: NvcuvidLoadError) -> Self {
        NvpError::Unavailable(err.to_string())
    }
}

/// Map a CUVID status to `Err(NvpError::Decode)` naming the failed call.
pub fn check(result: CUresult, function_name: &str) -> Result<(), NvpError> {
    if result == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(NvpError::decode(format!(
            "{function_name} failed with error code {result}"
        )))
    }
}
