//! The codec surface the library dispatches through.
//!
//! Encoders and decoders share one interface; an instance only supports the
//! operations of its own mode and rejects the rest with
//! [`NvpError::Configuration`](crate::NvpError::Configuration).

use crate::codec::PixelFormat;
use crate::error::NvpResult;
use crate::types::{InputBuffer, OutputBuffer};

/// Which half of the library an instance implements.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CodecMode {
    Encoder,
    Decoder,
}

/// Operations exposed to the surrounding library for a codec instance.
pub trait PipeCodec {
    fn mode(&self) -> CodecMode;

    /// Compress one `width`x`height` frame of `format` into `output`,
    /// returning the number of bytes written.
    fn encode(
        &mut self,
        input: InputBuffer<'_>,
        output: &mut [u8],
        width: usize,
        height: usize,
        format: PixelFormat,
    ) -> NvpResult<usize>;

    /// Change the target bitrate in bits per second.
    fn set_bitrate(&mut self, bitrate: u64) -> NvpResult<()>;

    /// Decompress one unit into `output` as packed RGB of `width`x`height`.
    fn decode(
        &mut self,
        input: InputBuffer<'_>,
        output: OutputBuffer<'_>,
        width: usize,
        height: usize,
    ) -> NvpResult<()>;
}
