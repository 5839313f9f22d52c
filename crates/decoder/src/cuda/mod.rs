//! Production CUDA backend.
//!
//! - [`CudaRuntime`]: device memory, copies and events via the driver API.
//! - [`CudaReorganizer`]: NVRTC-compiled NV12 -> RGB kernel on its own stream.
//! - [`create_decoder`]: wires both together with [`NvcuvidApi`].

mod reorganize;
mod runtime;

use std::sync::Arc;

use tracing::info;

use nvp_common::{DecoderConfig, NvpResult};

pub use reorganize::CudaReorganizer;
pub use runtime::CudaRuntime;

use crate::backend::Reorganizer;
use crate::decoder::NvpDecoder;
use crate::nvdec::{NvcuvidApi, NvcuvidLibrary};

/// Create a hardware decoder on `config.device_ordinal`.
///
/// Fails with [`NvpError::Unavailable`](nvp_common::NvpError::Unavailable)
/// when the driver, the nvcuvid library, or NVRTC cannot be used.
pub fn create_decoder(config: DecoderConfig) -> NvpResult<NvpDecoder> {
    let lib = Arc::new(NvcuvidLibrary::load()?);
    let runtime = Arc::new(CudaRuntime::new(config.device_ordinal)?);
    let ctx = Arc::clone(runtime.context());
    info!(ordinal = config.device_ordinal, "creating NVDEC decoder");

    NvpDecoder::create(
        Arc::new(NvcuvidApi::new(lib)),
        runtime,
        config,
        move || Ok(Box::new(CudaReorganizer::new(ctx)?) as Box<dyn Reorganizer>),
    )
}
