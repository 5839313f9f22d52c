//! [`CuvidApi`] backed by the real nvcuvid library.
//!
//! The CUVID parser reports through C callbacks carrying a `user_data`
//! pointer. Each parser gets a boxed [`ParserEntry`] as its `user_data`;
//! while [`CuvidApi::parse_unit`] runs, the entry points at the caller's
//! [`ParserCallbacks`] and the trampolines below forward to it. Outside a
//! parse call the slot is empty and stray callbacks are rejected.

use std::ffi::{c_int, c_uint, c_ulong, c_void};
use std::ptr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use nvp_common::{DevicePtr, DisplayArea, NvpError, NvpResult, ScanType};

use super::ffi::{
    self, check, create_flags, surface, CUdeviceptr, CUvideodecoder, CUvideoparser, CuVideoFormat,
    CuvidDecodeCreateInfo, CuvidParserDispInfo, CuvidParserParams, CuvidPicParamsHead,
    CuvidProcParams, CuvidSourceDataPacket, NvcuvidLibrary, ShortRect,
};
use crate::backend::{
    CuvidApi, DecoderCreateInfo, DecoderHandle, DisplayInfo, MappedSurface, ParserCallbacks,
    ParserCreateInfo, ParserHandle, PictureParams, SequenceFormat,
};

// ---------------------------------------------------------------------------
// Parser entry (callback target)
// ---------------------------------------------------------------------------

/// Pointer to the `&mut dyn ParserCallbacks` of the parse call in progress.
struct SinkSlot(*mut c_void);

// SAFETY: the slot is only non-null while `parse_unit` holds the pointee on
// its stack, and the parser invokes callbacks on the calling thread.
unsafe impl Send for SinkSlot {}

struct ParserEntry {
    parser: CUvideoparser,
    sink: Mutex<SinkSlot>,
}

/// Run `f` against the callbacks of the parse call in progress.
///
/// # Safety
/// `user_data` must be the `ParserEntry` registered with the parser.
unsafe fn with_sink(user_data: *mut c_void, f: impl FnOnce(&mut dyn ParserCallbacks) -> bool) -> c_int {
    if user_data.is_null() {
        return 0;
    }
    let entry = &*(user_data as *const ParserEntry);
    let slot = entry.sink.lock().0;
    if slot.is_null() {
        warn!("parser callback outside of a parse call, ignoring");
        return 0;
    }
    let sink = &mut **(slot as *mut &mut dyn ParserCallbacks);
    c_int::from(f(sink))
}

unsafe extern "C" fn sequence_trampoline(user_data: *mut c_void, format: *mut CuVideoFormat) -> c_int {
    if format.is_null() {
        return 0;
    }
    // SAFETY: the parser passes a valid format for the duration of the call.
    let format = sequence_format(&*format);
    with_sink(user_data, |sink| sink.on_sequence(&format))
}

unsafe extern "C" fn decode_trampoline(user_data: *mut c_void, params: *mut c_void) -> c_int {
    if params.is_null() {
        return 0;
    }
    // SAFETY: `params` is a full CUVIDPICPARAMS; only its head is read.
    let head = *(params as *const CuvidPicParamsHead);
    let picture = PictureParams::with_raw(
        head.pic_width_in_mbs.max(0) as u32,
        head.frame_height_in_mbs.max(0) as u32,
        head.curr_pic_idx,
        params,
    );
    with_sink(user_data, |sink| sink.on_picture_decode(&picture))
}

unsafe extern "C" fn display_trampoline(
    user_data: *mut c_void,
    info: *mut CuvidParserDispInfo,
) -> c_int {
    if info.is_null() {
        return with_sink(user_data, |sink| sink.on_display_ready(None));
    }
    // SAFETY: non-null display info is valid for the duration of the call.
    let raw = &*info;
    let info = DisplayInfo {
        picture_index: raw.picture_index,
        progressive: raw.progressive_frame != 0,
        timestamp: raw.timestamp,
    };
    with_sink(user_data, |sink| sink.on_display_ready(Some(&info)))
}

fn sequence_format(raw: &CuVideoFormat) -> SequenceFormat {
    SequenceFormat {
        codec: ffi::codec_from_id(raw.codec),
        // Unknown chroma layouts are reported as 4:4:4, which is rejected.
        chroma_format: ffi::chroma_from_id(raw.chroma_format)
            .unwrap_or(nvp_common::ChromaFormat::Yuv444),
        scan: if raw.progressive_sequence != 0 {
            ScanType::Progressive
        } else {
            ScanType::Interlaced
        },
        bit_depth_luma_minus8: raw.bit_depth_luma_minus8,
        coded_width: raw.coded_width,
        coded_height: raw.coded_height,
        display_area: DisplayArea {
            left: raw.display_area.left,
            top: raw.display_area.top,
            right: raw.display_area.right,
            bottom: raw.display_area.bottom,
        },
        min_num_decode_surfaces: raw.min_num_decode_surfaces,
    }
}

// ---------------------------------------------------------------------------
// NvcuvidApi
// ---------------------------------------------------------------------------

/// CUVID parser and NVDEC decoder from the loaded nvcuvid library.
///
/// Decoder creation requires a CUDA context current on the calling thread;
/// the CUDA runtime binds one when it is created.
#[derive(Debug)]
pub struct NvcuvidApi {
    lib: Arc<NvcuvidLibrary>,
}

impl NvcuvidApi {
    pub fn new(lib: Arc<NvcuvidLibrary>) -> Self {
        Self { lib }
    }

    fn decoder_ptr(decoder: DecoderHandle) -> CUvideodecoder {
        decoder.as_raw() as usize as CUvideodecoder
    }

    /// # Safety
    /// `parser` must come from [`CuvidApi::create_parser`] on this instance
    /// and not have been destroyed.
    unsafe fn entry<'e>(parser: ParserHandle) -> &'e ParserEntry {
        &*(parser.as_raw() as usize as *const ParserEntry)
    }
}

impl CuvidApi for NvcuvidApi {
    fn create_decoder(&self, info: &DecoderCreateInfo) -> NvpResult<DecoderHandle> {
        let area = info.display_area;
        let mut params = CuvidDecodeCreateInfo {
            width: info.input.width as c_ulong,
            height: info.input.height as c_ulong,
            num_decode_surfaces: info.num_decode_surfaces as c_ulong,
            codec_type: ffi::codec_id(info.codec),
            chroma_format: ffi::chroma_id(info.chroma_format),
            creation_flags: create_flags::PREFER_CUVID,
            max_width: info.input.width as c_ulong,
            max_height: info.input.height as c_ulong,
            display_area: ShortRect {
                left: area.left as i16,
                top: area.top as i16,
                right: area.right as i16,
                bottom: area.bottom as i16,
            },
            output_format: surface::NV12,
            deinterlace_mode: ffi::deinterlace_id(info.deinterlace),
            target_width: info.target.width as c_ulong,
            target_height: info.target.height as c_ulong,
            num_output_surfaces: info.num_output_surfaces as c_ulong,
            ..CuvidDecodeCreateInfo::default()
        };

        let mut decoder: CUvideodecoder = ptr::null_mut();
        // SAFETY: `params` is fully initialised and outlives the call.
        let result = unsafe { (self.lib.cuvidCreateDecoder)(&mut decoder, &mut params) };
        check(result, "cuvidCreateDecoder")?;
        info!(input = %info.input, target = %info.target, "NVDEC decoder created");
        Ok(DecoderHandle::from_raw(decoder as usize as u64))
    }

    fn destroy_decoder(&self, decoder: DecoderHandle) -> NvpResult<()> {
        // SAFETY: the handle came from `create_decoder` and is destroyed once.
        let result = unsafe { (self.lib.cuvidDestroyDecoder)(Self::decoder_ptr(decoder)) };
        check(result, "cuvidDestroyDecoder")
    }

    fn create_parser(&self, info: &ParserCreateInfo) -> NvpResult<ParserHandle> {
        let mut entry = Box::new(ParserEntry {
            parser: ptr::null_mut(),
            sink: Mutex::new(SinkSlot(ptr::null_mut())),
        });
        let user_data: *mut ParserEntry = &mut *entry;

        let mut params = CuvidParserParams {
            codec_type: ffi::codec_id(info.codec),
            max_num_decode_surfaces: info.max_decode_surfaces as c_uint,
            error_threshold: info.error_threshold as c_uint,
            max_display_delay: info.max_display_delay as c_uint,
            user_data: user_data.cast(),
            pfn_sequence_callback: Some(sequence_trampoline),
            pfn_decode_picture: Some(decode_trampoline),
            pfn_display_picture: Some(display_trampoline),
            ..CuvidParserParams::default()
        };

        let mut parser: CUvideoparser = ptr::null_mut();
        // SAFETY: `params` is initialised; `user_data` points into a Box that
        // is leaked below and reclaimed in `destroy_parser`.
        let result = unsafe { (self.lib.cuvidCreateVideoParser)(&mut parser, &mut params) };
        check(result, "cuvidCreateVideoParser")?;
        entry.parser = parser;

        debug!(
            surfaces = info.max_decode_surfaces,
            delay = info.max_display_delay,
            "CUVID parser created"
        );
        Ok(ParserHandle::from_raw(Box::into_raw(entry) as usize as u64))
    }

    fn destroy_parser(&self, parser: ParserHandle) -> NvpResult<()> {
        // SAFETY: the handle is a leaked `ParserEntry` box from `create_parser`
        // and is destroyed once.
        let entry = unsafe { Box::from_raw(parser.as_raw() as usize as *mut ParserEntry) };
        // SAFETY: the parser handle is valid until this call.
        let result = unsafe { (self.lib.cuvidDestroyVideoParser)(entry.parser) };
        check(result, "cuvidDestroyVideoParser")
    }

    fn parse_unit(
        &self,
        parser: ParserHandle,
        data: &[u8],
        callbacks: &mut dyn ParserCallbacks,
    ) -> NvpResult<()> {
        // SAFETY: handles passed in were produced by `create_parser`.
        let entry = unsafe { Self::entry(parser) };

        let mut sink: &mut dyn ParserCallbacks = callbacks;
        let sink_ptr: *mut &mut dyn ParserCallbacks = &mut sink;
        entry.sink.lock().0 = sink_ptr.cast();

        let mut packet = CuvidSourceDataPacket {
            flags: 0,
            payload_size: data.len() as c_ulong,
            payload: data.as_ptr(),
            timestamp: 0,
        };
        // SAFETY: `packet` borrows `data`, which outlives the call; callbacks
        // run synchronously and only while `sink` is alive.
        let result = unsafe { (self.lib.cuvidParseVideoData)(entry.parser, &mut packet) };

        entry.sink.lock().0 = ptr::null_mut();
        check(result, "cuvidParseVideoData")
    }

    fn decode_picture(&self, decoder: DecoderHandle, picture: &PictureParams) -> NvpResult<()> {
        let raw = picture.raw();
        if raw.is_null() {
            return Err(NvpError::decode(
                "picture parameters were not produced by the CUVID parser",
            ));
        }
        // SAFETY: `raw` is the parser's CUVIDPICPARAMS for the callback in
        // progress.
        let result = unsafe { (self.lib.cuvidDecodePicture)(Self::decoder_ptr(decoder), raw) };
        check(result, "cuvidDecodePicture")
    }

    fn map_frame(&self, decoder: DecoderHandle, picture_index: i32) -> NvpResult<MappedSurface> {
        let mut params = CuvidProcParams {
            progressive_frame: 1,
            ..CuvidProcParams::default()
        };
        let mut device_ptr: CUdeviceptr = 0;
        let mut pitch: c_uint = 0;
        // SAFETY: the out-parameters are valid locals; the decoder is live.
        let result = unsafe {
            (self.lib.cuvidMapVideoFrame64)(
                Self::decoder_ptr(decoder),
                picture_index,
                &mut device_ptr,
                &mut pitch,
                &mut params,
            )
        };
        check(result, "cuvidMapVideoFrame64")?;
        Ok(MappedSurface {
            ptr: DevicePtr(device_ptr),
            pitch,
        })
    }

    fn unmap_frame(&self, decoder: DecoderHandle, surface: DevicePtr) -> NvpResult<()> {
        // SAFETY: `surface` was returned by `map_frame` on this decoder.
        let result =
            unsafe { (self.lib.cuvidUnmapVideoFrame64)(Self::decoder_ptr(decoder), surface.0) };
        check(result, "cuvidUnmapVideoFrame64")
    }
}
