//! `nvp-common`: Shared types, traits, and errors for the nvpipe codec adapters.
//!
//! Both sides of the library (encode and decode) build on this crate:
//!
//! - **Codec**: `VideoCodec`, `ChromaFormat`, `ScanType`, `PixelFormat`
//! - **Types**: `Dimensions`, `DecodeDims`, `DisplayArea`, `DevicePtr`
//! - **Buffers**: `InputBuffer`, `OutputBuffer` (tagged host/device memory)
//! - **Errors**: `NvpError`, `NvpResult` (thiserror-based)
//! - **Config**: `DecoderConfig`, `DeinterlaceMode`
//! - **Pipe**: `PipeCodec`, the surface every adapter exposes to the library

pub mod codec;
pub mod config;
pub mod error;
pub mod pipe;
pub mod types;

pub use codec::{ChromaFormat, PixelFormat, ScanType, VideoCodec};
pub use config::{DecoderConfig, DeinterlaceMode};
pub use error::{NvpError, NvpResult};
pub use pipe::{CodecMode, PipeCodec};
pub use types::{
    DecodeDims, DevicePtr, Dimensions, DisplayArea, InputBuffer, OutputBuffer, Residency,
    ResidencyQuery,
};
