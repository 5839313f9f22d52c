//! Scripted stand-ins for the CUVID API, the device runtime and the
//! conversion stage, recording every call into a shared journal.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use nvp_common::{
    ChromaFormat, DecoderConfig, DevicePtr, Dimensions, DisplayArea, NvpError, NvpResult,
    Residency, ResidencyQuery, ScanType, VideoCodec,
};
use nvp_decoder::{
    CuvidApi, DecoderCreateInfo, DecoderHandle, DeviceRuntime, DisplayInfo, EventHandle,
    MappedSurface, NvpDecoder, ParserCallbacks, ParserCreateInfo, ParserHandle, PictureParams,
    Reorganizer, SequenceFormat, StreamHandle,
};

/// Annex-B unit carrying a coded slice: yields a picture.
pub const FRAME_UNIT: &[u8] = &[0, 0, 0, 1, 0x65, 0x88, 0x84, 0x00, 0x33, 0xff];
/// Annex-B unit carrying only an SPS: yields no picture.
pub const METADATA_UNIT: &[u8] = &[0, 0, 0, 1, 0x67, 0x42, 0xc0, 0x1e];

/// Byte the stub conversion stage writes into every RGB pixel component.
pub const FILL: u8 = 0xab;

pub const CONVERSION_STREAM: StreamHandle = StreamHandle::from_raw(7);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct Journal(Mutex<Vec<&'static str>>);

impl Journal {
    pub fn push(&self, entry: &'static str) {
        self.0.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<&'static str> {
        self.0.lock().clone()
    }

    /// Entries that are one of `names`, in order.
    pub fn only(&self, names: &[&str]) -> Vec<&'static str> {
        self.0
            .lock()
            .iter()
            .copied()
            .filter(|entry| names.contains(entry))
            .collect()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

// ---------------------------------------------------------------------------
// CUVID stub
// ---------------------------------------------------------------------------

/// What the stub parser reports for each submitted unit.
#[derive(Clone, Debug)]
pub struct StreamScript {
    pub display: Dimensions,
    pub coded_mbs: (u32, u32),
    pub codec: Option<VideoCodec>,
    pub chroma_format: ChromaFormat,
    pub scan: ScanType,
    pub bit_depth_luma_minus8: u8,
    /// Macroblock geometry for the next pictures, ahead of `coded_mbs`.
    pub picture_overrides: VecDeque<(u32, u32)>,
    /// Number of upcoming frame units for which no picture is emitted.
    pub withhold_pictures: usize,
}

impl StreamScript {
    pub fn new(display: Dimensions) -> Self {
        Self {
            display,
            coded_mbs: (
                display.width.div_ceil(16) as u32,
                display.height.div_ceil(16) as u32,
            ),
            codec: Some(VideoCodec::H264),
            chroma_format: ChromaFormat::Yuv420,
            scan: ScanType::Progressive,
            bit_depth_luma_minus8: 0,
            picture_overrides: VecDeque::new(),
            withhold_pictures: 0,
        }
    }

    pub fn resize(&mut self, display: Dimensions) {
        *self = Self {
            picture_overrides: std::mem::take(&mut self.picture_overrides),
            ..Self::new(display)
        };
    }

    fn sequence_format(&self) -> SequenceFormat {
        SequenceFormat {
            codec: self.codec,
            chroma_format: self.chroma_format,
            scan: self.scan,
            bit_depth_luma_minus8: self.bit_depth_luma_minus8,
            coded_width: self.coded_mbs.0 * 16,
            coded_height: self.coded_mbs.1 * 16,
            display_area: DisplayArea::from_size(self.display.width, self.display.height),
            min_num_decode_surfaces: 2,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CuvidCounters {
    pub parsers_created: usize,
    pub parsers_destroyed: usize,
    pub decoders_created: usize,
    pub decoders_destroyed: usize,
    pub pictures_decoded: usize,
    pub maps: usize,
    pub unmaps: usize,
}

#[derive(Clone, Debug, Default)]
pub struct CuvidFailures {
    pub create_decoder: bool,
    pub destroy_decoder: bool,
    pub destroy_parser: bool,
    pub decode_picture: bool,
    pub map: bool,
    pub unmap: bool,
}

pub struct StubCuvid {
    journal: Arc<Journal>,
    pub script: Mutex<StreamScript>,
    pub failures: Mutex<CuvidFailures>,
    counters: Mutex<CuvidCounters>,
    decoder_infos: Mutex<Vec<DecoderCreateInfo>>,
    parser_infos: Mutex<Vec<ParserCreateInfo>>,
    parsed_units: Mutex<Vec<Vec<u8>>>,
    next_handle: Mutex<u64>,
    next_picture: Mutex<i32>,
}

impl StubCuvid {
    pub fn new(journal: Arc<Journal>, script: StreamScript) -> Self {
        Self {
            journal,
            script: Mutex::new(script),
            failures: Mutex::new(CuvidFailures::default()),
            counters: Mutex::new(CuvidCounters::default()),
            decoder_infos: Mutex::new(Vec::new()),
            parser_infos: Mutex::new(Vec::new()),
            parsed_units: Mutex::new(Vec::new()),
            next_handle: Mutex::new(0x100),
            next_picture: Mutex::new(0),
        }
    }

    pub fn counters(&self) -> CuvidCounters {
        self.counters.lock().clone()
    }

    pub fn decoder_infos(&self) -> Vec<DecoderCreateInfo> {
        self.decoder_infos.lock().clone()
    }

    pub fn parser_infos(&self) -> Vec<ParserCreateInfo> {
        self.parser_infos.lock().clone()
    }

    pub fn parsed_units(&self) -> Vec<Vec<u8>> {
        self.parsed_units.lock().clone()
    }

    fn handle(&self) -> u64 {
        let mut next = self.next_handle.lock();
        *next += 1;
        *next
    }
}

impl CuvidApi for StubCuvid {
    fn create_decoder(&self, info: &DecoderCreateInfo) -> NvpResult<DecoderHandle> {
        self.journal.push("create_decoder");
        if self.failures.lock().create_decoder {
            return Err(NvpError::decode("cuvidCreateDecoder failed with error code 2"));
        }
        self.decoder_infos.lock().push(info.clone());
        self.counters.lock().decoders_created += 1;
        Ok(DecoderHandle::from_raw(self.handle()))
    }

    fn destroy_decoder(&self, _decoder: DecoderHandle) -> NvpResult<()> {
        self.journal.push("destroy_decoder");
        self.counters.lock().decoders_destroyed += 1;
        if self.failures.lock().destroy_decoder {
            return Err(NvpError::decode("cuvidDestroyDecoder failed"));
        }
        Ok(())
    }

    fn create_parser(&self, info: &ParserCreateInfo) -> NvpResult<ParserHandle> {
        self.journal.push("create_parser");
        self.parser_infos.lock().push(info.clone());
        self.counters.lock().parsers_created += 1;
        Ok(ParserHandle::from_raw(self.handle()))
    }

    fn destroy_parser(&self, _parser: ParserHandle) -> NvpResult<()> {
        self.journal.push("destroy_parser");
        self.counters.lock().parsers_destroyed += 1;
        if self.failures.lock().destroy_parser {
            return Err(NvpError::decode("cuvidDestroyVideoParser failed"));
        }
        Ok(())
    }

    fn parse_unit(
        &self,
        _parser: ParserHandle,
        data: &[u8],
        callbacks: &mut dyn ParserCallbacks,
    ) -> NvpResult<()> {
        self.journal.push("parse");
        self.parsed_units.lock().push(data.to_vec());
        let metadata_only = data.get(4) == Some(&0x67);

        // Resolve the script first: callbacks re-enter this stub.
        let (format, picture_mbs) = {
            let mut script = self.script.lock();
            let picture = if metadata_only {
                None
            } else if script.withhold_pictures > 0 {
                script.withhold_pictures -= 1;
                None
            } else {
                Some(script.picture_overrides.pop_front().unwrap_or(script.coded_mbs))
            };
            (script.sequence_format(), picture)
        };

        if !callbacks.on_sequence(&format) {
            return Err(NvpError::decode("sequence callback rejected the stream"));
        }
        if let Some((width_in_mbs, height_in_mbs)) = picture_mbs {
            let index = {
                let mut next = self.next_picture.lock();
                let index = *next;
                *next = (*next + 1) % 2;
                index
            };
            let picture = PictureParams::new(width_in_mbs, height_in_mbs, index);
            if !callbacks.on_picture_decode(&picture) {
                return Err(NvpError::decode("decode callback failed"));
            }
            callbacks.on_display_ready(Some(&DisplayInfo {
                picture_index: index,
                progressive: true,
                timestamp: 0,
            }));
        }
        Ok(())
    }

    fn decode_picture(&self, _decoder: DecoderHandle, _picture: &PictureParams) -> NvpResult<()> {
        if self.failures.lock().decode_picture {
            return Err(NvpError::decode("cuvidDecodePicture failed with error code 1"));
        }
        self.counters.lock().pictures_decoded += 1;
        Ok(())
    }

    fn map_frame(&self, _decoder: DecoderHandle, picture_index: i32) -> NvpResult<MappedSurface> {
        self.journal.push("map");
        if self.failures.lock().map {
            return Err(NvpError::decode("cuvidMapVideoFrame64 failed"));
        }
        self.counters.lock().maps += 1;
        Ok(MappedSurface {
            ptr: DevicePtr(0xf000_0000 + picture_index as u64 * 0x10_0000),
            pitch: 512,
        })
    }

    fn unmap_frame(&self, _decoder: DecoderHandle, _surface: DevicePtr) -> NvpResult<()> {
        self.journal.push("unmap");
        self.counters.lock().unmaps += 1;
        if self.failures.lock().unmap {
            return Err(NvpError::decode("cuvidUnmapVideoFrame64 failed"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Device runtime stub
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuntimeCounters {
    pub allocs: usize,
    pub frees: usize,
    pub host_copies: usize,
    pub async_copies: usize,
    pub events_created: usize,
    pub events_destroyed: usize,
}

#[derive(Clone, Debug, Default)]
pub struct RuntimeFailures {
    pub alloc: bool,
    pub create_event: bool,
    pub record_event: bool,
    pub destroy_event: bool,
}

/// Fake device memory: blocks keyed by base address.
pub struct StubRuntime {
    journal: Arc<Journal>,
    pub failures: Mutex<RuntimeFailures>,
    counters: Mutex<RuntimeCounters>,
    blocks: Mutex<BTreeMap<u64, Vec<u8>>>,
    next_addr: Mutex<u64>,
}

impl StubRuntime {
    pub fn new(journal: Arc<Journal>) -> Self {
        Self {
            journal,
            failures: Mutex::new(RuntimeFailures::default()),
            counters: Mutex::new(RuntimeCounters::default()),
            blocks: Mutex::new(BTreeMap::new()),
            next_addr: Mutex::new(0x1000_0000),
        }
    }

    pub fn counters(&self) -> RuntimeCounters {
        self.counters.lock().clone()
    }

    /// Place `bytes` in device memory, as a caller-owned buffer would be.
    pub fn upload(&self, bytes: &[u8]) -> DevicePtr {
        let ptr = self.reserve(bytes.len());
        self.blocks.lock().insert(ptr.0, bytes.to_vec());
        ptr
    }

    pub fn read(&self, ptr: DevicePtr) -> Vec<u8> {
        self.blocks.lock().get(&ptr.0).cloned().unwrap_or_default()
    }

    pub fn live_blocks(&self) -> usize {
        self.blocks.lock().len()
    }

    /// Write `len` copies of `value` at `ptr` (used by the conversion stub).
    pub fn fill(&self, ptr: DevicePtr, len: usize, value: u8) -> NvpResult<()> {
        let mut blocks = self.blocks.lock();
        let block = blocks
            .get_mut(&ptr.0)
            .ok_or_else(|| NvpError::Conversion(format!("{ptr:?} is not device memory")))?;
        if block.len() < len {
            return Err(NvpError::Conversion(format!("{ptr:?} holds fewer than {len} bytes")));
        }
        block[..len].fill(value);
        Ok(())
    }

    fn reserve(&self, len: usize) -> DevicePtr {
        let mut next = self.next_addr.lock();
        let ptr = DevicePtr(*next);
        *next += (len as u64).max(1).next_multiple_of(0x1000);
        ptr
    }

    fn copy_out(&self, dst: &mut [u8], src: DevicePtr) -> NvpResult<()> {
        let blocks = self.blocks.lock();
        let block = blocks
            .get(&src.0)
            .ok_or_else(|| NvpError::CopyFailure(format!("{src:?} is not device memory")))?;
        if block.len() < dst.len() {
            return Err(NvpError::CopyFailure(format!("{src:?} is too small")));
        }
        dst.copy_from_slice(&block[..dst.len()]);
        Ok(())
    }
}

impl ResidencyQuery for StubRuntime {
    fn residency(&self, ptr: *const u8) -> Residency {
        let addr = ptr as u64;
        let blocks = self.blocks.lock();
        match blocks.range(..=addr).next_back() {
            Some((base, block)) if addr < base + block.len() as u64 => Residency::Device,
            _ => Residency::Host,
        }
    }
}

impl DeviceRuntime for StubRuntime {
    fn alloc_device(&self, bytes: usize) -> NvpResult<DevicePtr> {
        self.journal.push("alloc");
        if self.failures.lock().alloc {
            return Err(NvpError::AllocationFailure {
                bytes,
                reason: "out of memory".into(),
            });
        }
        self.counters.lock().allocs += 1;
        let ptr = self.reserve(bytes);
        self.blocks.lock().insert(ptr.0, vec![0; bytes]);
        Ok(ptr)
    }

    fn free_device(&self, ptr: DevicePtr) -> NvpResult<()> {
        self.journal.push("free");
        self.counters.lock().frees += 1;
        self.blocks
            .lock()
            .remove(&ptr.0)
            .map(|_| ())
            .ok_or_else(|| NvpError::Unavailable(format!("double free of {ptr:?}")))
    }

    fn copy_to_host(&self, dst: &mut [u8], src: DevicePtr) -> NvpResult<()> {
        self.journal.push("copy");
        self.counters.lock().host_copies += 1;
        self.copy_out(dst, src)
    }

    fn copy_to_host_async(
        &self,
        dst: &mut [u8],
        src: DevicePtr,
        stream: StreamHandle,
    ) -> NvpResult<()> {
        self.journal.push("copy_async");
        assert_eq!(stream, CONVERSION_STREAM, "copy must be queued on the conversion stream");
        self.counters.lock().async_copies += 1;
        self.copy_out(dst, src)
    }

    fn create_event(&self) -> NvpResult<EventHandle> {
        self.journal.push("create_event");
        if self.failures.lock().create_event {
            return Err(NvpError::Synchronization("cuEventCreate failed".into()));
        }
        self.counters.lock().events_created += 1;
        Ok(EventHandle::from_raw(0xe0))
    }

    fn record_event(&self, _event: EventHandle, stream: StreamHandle) -> NvpResult<()> {
        self.journal.push("record");
        assert_eq!(stream, StreamHandle::DEFAULT, "decoder output is complete on the default stream");
        if self.failures.lock().record_event {
            return Err(NvpError::Synchronization("cuEventRecord failed".into()));
        }
        Ok(())
    }

    fn stream_wait_event(&self, stream: StreamHandle, _event: EventHandle) -> NvpResult<()> {
        self.journal.push("wait");
        assert_eq!(stream, CONVERSION_STREAM);
        Ok(())
    }

    fn destroy_event(&self, _event: EventHandle) -> NvpResult<()> {
        self.journal.push("destroy_event");
        self.counters.lock().events_destroyed += 1;
        if self.failures.lock().destroy_event {
            return Err(NvpError::Synchronization("cuEventDestroy failed".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Conversion stub
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Conversion {
    pub source: DevicePtr,
    pub dims: Dimensions,
    pub destination: DevicePtr,
    pub pitch: u32,
}

/// Shared view of what the boxed conversion stub did.
#[derive(Default)]
pub struct ReorgProbe {
    pub fail_submit: Mutex<bool>,
    pub fail_sync: Mutex<bool>,
    conversions: Mutex<Vec<Conversion>>,
}

impl ReorgProbe {
    pub fn conversions(&self) -> Vec<Conversion> {
        self.conversions.lock().clone()
    }
}

pub struct StubReorganizer {
    runtime: Arc<StubRuntime>,
    journal: Arc<Journal>,
    probe: Arc<ReorgProbe>,
}

impl Reorganizer for StubReorganizer {
    fn submit(
        &mut self,
        source: DevicePtr,
        width: usize,
        height: usize,
        destination: DevicePtr,
        pitch: u32,
    ) -> NvpResult<()> {
        self.journal.push("submit");
        if *self.probe.fail_submit.lock() {
            return Err(NvpError::Conversion("kernel launch failed".into()));
        }
        let dims = Dimensions::new(width, height);
        self.probe.conversions.lock().push(Conversion {
            source,
            dims,
            destination,
            pitch,
        });
        self.runtime.fill(destination, dims.rgb_len(), FILL)
    }

    fn sync(&mut self) -> NvpResult<()> {
        self.journal.push("sync");
        if *self.probe.fail_sync.lock() {
            return Err(NvpError::Synchronization("stream sync failed".into()));
        }
        Ok(())
    }

    fn stream(&self) -> StreamHandle {
        CONVERSION_STREAM
    }
}

impl Drop for StubReorganizer {
    fn drop(&mut self) {
        self.journal.push("reorg_drop");
    }
}

// ---------------------------------------------------------------------------
// Rig
// ---------------------------------------------------------------------------

/// One set of stubs sharing a journal.
pub struct Rig {
    pub journal: Arc<Journal>,
    pub api: Arc<StubCuvid>,
    pub runtime: Arc<StubRuntime>,
    pub probe: Arc<ReorgProbe>,
}

impl Rig {
    /// Stubs for a stream whose display size is `width`x`height`.
    pub fn new(width: usize, height: usize) -> Self {
        Self::with_script(StreamScript::new(Dimensions::new(width, height)))
    }

    pub fn with_script(script: StreamScript) -> Self {
        init_tracing();
        let journal = Arc::new(Journal::default());
        Self {
            api: Arc::new(StubCuvid::new(Arc::clone(&journal), script)),
            runtime: Arc::new(StubRuntime::new(Arc::clone(&journal))),
            probe: Arc::new(ReorgProbe::default()),
            journal,
        }
    }

    pub fn config() -> DecoderConfig {
        DecoderConfig {
            panic_on_misuse: false,
            ..DecoderConfig::default()
        }
    }

    pub fn decoder(&self) -> NvpDecoder {
        self.decoder_with(Self::config())
            .expect("stub decoder creation cannot fail")
    }

    pub fn decoder_with(&self, config: DecoderConfig) -> NvpResult<NvpDecoder> {
        let reorganizer = StubReorganizer {
            runtime: Arc::clone(&self.runtime),
            journal: Arc::clone(&self.journal),
            probe: Arc::clone(&self.probe),
        };
        NvpDecoder::create(
            self.api.clone(),
            self.runtime.clone(),
            config,
            move || Ok(Box::new(reorganizer) as Box<dyn Reorganizer>),
        )
    }
}
