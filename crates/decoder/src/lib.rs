//! `nvp-decoder`: Decode side of the nvpipe codec library.
//!
//! Accepts a compressed H.264 unit, drives the NVDEC hardware decoder through
//! the CUVID parser, and writes a packed RGB frame into the caller's buffer.
//!
//! # Architecture
//!
//! Decoding itself is delegated to hardware. The work done here is keeping
//! four notions of image size consistent across a pipeline that may lag by
//! a submission:
//!
//! 1. the size the hardware decoder object was created for,
//! 2. the output size it was created to scale to,
//! 3. the size the stream actually carries, and
//! 4. the size the caller wants for this call.
//!
//! ## Module Overview
//!
//! - [`backend`]: Collaborator traits (`CuvidApi`, `DeviceRuntime`, `Reorganizer`)
//!   and the plain data that crosses them.
//! - [`staging`]: Host staging for device-resident compressed input.
//! - [`tracker`]: Parser callbacks and the decoder (re)creation policy.
//! - [`materialize`]: Map, convert, copy back, unmap.
//! - [`decoder`]: `NvpDecoder`, its lifecycle and the submission loop.
//! - [`nvdec`]: CUVID bindings loaded at runtime via `libloading`.
//! - `cuda`: CUDA driver runtime and the NV12->RGB conversion stage
//!   (behind the `cuda` feature).
//!
//! ## Usage
//!
//! ```ignore
//! use nvp_common::{DecoderConfig, InputBuffer, OutputBuffer};
//!
//! let mut decoder = nvp_decoder::cuda::create_decoder(DecoderConfig::default())?;
//! let mut rgb = vec![0u8; 1280 * 720 * 3];
//! decoder.decode(InputBuffer::Host(&unit), OutputBuffer::Host(&mut rgb), 1280, 720)?;
//! ```

pub mod backend;
pub mod decoder;
pub mod materialize;
pub mod nvdec;
pub mod staging;
pub mod tracker;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use backend::{
    CuvidApi, DecoderCreateInfo, DecoderHandle, DeviceRuntime, DisplayInfo, EventHandle,
    MappedSurface, ParserCallbacks, ParserCreateInfo, ParserHandle, PictureParams, Reorganizer,
    SequenceFormat, StreamHandle,
};
pub use decoder::{DecoderStats, NvpDecoder};
