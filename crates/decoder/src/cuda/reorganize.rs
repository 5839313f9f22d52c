//! NV12 -> packed RGB conversion on a dedicated CUDA stream.
//!
//! The kernel is compiled at startup with NVRTC and dispatched through the
//! raw driver API (`cuModuleLoadData`, `cuModuleGetFunction`,
//! `cuLaunchKernel`). Colour conversion is BT.601 limited range.

use std::ffi::{c_int, c_void, CString};
use std::mem::MaybeUninit;
use std::sync::Arc;

use cudarc::driver::{sys, CudaContext};
use tracing::{debug, info, warn};

use nvp_common::{DevicePtr, NvpError, NvpResult};

use crate::backend::{Reorganizer, StreamHandle};

const KERNEL_NAME: &str = "nv12_to_rgb";

const NV12_TO_RGB_SRC: &str = r#"
extern "C" __global__ void nv12_to_rgb(
    const unsigned char* __restrict__ nv12,
    int width,
    int height,
    int pitch,
    unsigned char* __restrict__ rgb)
{
    int x = blockIdx.x * blockDim.x + threadIdx.x;
    int y = blockIdx.y * blockDim.y + threadIdx.y;
    if (x >= width || y >= height) {
        return;
    }

    const unsigned char* uv = nv12 + (size_t)pitch * height;
    size_t chroma = (size_t)(y / 2) * pitch + (x & ~1);

    float Y = 1.164f * ((float)nv12[(size_t)y * pitch + x] - 16.0f);
    float U = (float)uv[chroma] - 128.0f;
    float V = (float)uv[chroma + 1] - 128.0f;

    float r = Y + 1.596f * V;
    float g = Y - 0.392f * U - 0.813f * V;
    float b = Y + 2.017f * U;

    size_t out = ((size_t)y * width + x) * 3;
    rgb[out + 0] = (unsigned char)fminf(fmaxf(r, 0.0f), 255.0f);
    rgb[out + 1] = (unsigned char)fminf(fmaxf(g, 0.0f), 255.0f);
    rgb[out + 2] = (unsigned char)fminf(fmaxf(b, 0.0f), 255.0f);
}
"#;

const BLOCK: u32 = 16;

/// Grid covering a `width`x`height` image with 16x16 blocks.
fn grid_for(width: usize, height: usize) -> (u32, u32) {
    (
        (width as u32).div_ceil(BLOCK),
        (height as u32).div_ceil(BLOCK),
    )
}

// ---------------------------------------------------------------------------
// Raw module (RAII)
// ---------------------------------------------------------------------------

struct RawModule {
    module: sys::CUmodule,
    ctx: Arc<CudaContext>,
}

impl Drop for RawModule {
    fn drop(&mut self) {
        let _ = self.ctx.bind_to_thread();
        // SAFETY: the module came from cuModuleLoadData and is unloaded once.
        if let Err(e) = unsafe { sys::cuModuleUnload(self.module) }.result() {
            warn!(error = ?e, "failed to unload conversion module");
        }
    }
}

// ---------------------------------------------------------------------------
// CudaReorganizer
// ---------------------------------------------------------------------------

/// [`Reorganizer`] running the NV12 -> RGB kernel on a non-blocking stream.
pub struct CudaReorganizer {
    function: sys::CUfunction,
    stream: sys::CUstream,
    // Dropped after `Drop::drop` has destroyed the stream.
    module: RawModule,
}

// SAFETY: the function and stream handles belong to `module.ctx`, which is
// bound before every driver call.
unsafe impl Send for CudaReorganizer {}

impl std::fmt::Debug for CudaReorganizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaReorganizer")
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

impl CudaReorganizer {
    /// Compile the conversion kernel and create its stream.
    pub fn new(ctx: Arc<CudaContext>) -> NvpResult<Self> {
        let ptx = cudarc::nvrtc::compile_ptx(NV12_TO_RGB_SRC)
            .map_err(|e| NvpError::Unavailable(format!("NVRTC compile failed: {e:?}")))?;
        let image = CString::new(ptx.to_src())
            .map_err(|e| NvpError::Unavailable(format!("invalid PTX image: {e}")))?;
        let name = CString::new(KERNEL_NAME)
            .map_err(|e| NvpError::Unavailable(format!("invalid kernel name: {e}")))?;

        ctx.bind_to_thread()
            .map_err(|e| NvpError::Unavailable(format!("failed to bind CUDA context: {e}")))?;

        // SAFETY: `image` is NUL-terminated PTX text; the context is bound.
        let module = unsafe {
            let mut module = MaybeUninit::uninit();
            sys::cuModuleLoadData(module.as_mut_ptr(), image.as_ptr().cast::<c_void>())
                .result()
                .map_err(|e| NvpError::Unavailable(format!("cuModuleLoadData failed: {e:?}")))?;
            RawModule {
                module: module.assume_init(),
                ctx,
            }
        };

        // SAFETY: the module is loaded and `name` is NUL-terminated.
        let function = unsafe {
            let mut function = MaybeUninit::uninit();
            sys::cuModuleGetFunction(function.as_mut_ptr(), module.module, name.as_ptr())
                .result()
                .map_err(|e| {
                    NvpError::Unavailable(format!("kernel {KERNEL_NAME} not found: {e:?}"))
                })?;
            function.assume_init()
        };

        // SAFETY: out-parameter is valid; the context is bound.
        let stream = unsafe {
            let mut stream = MaybeUninit::uninit();
            sys::cuStreamCreate(
                stream.as_mut_ptr(),
                sys::CUstream_flags::CU_STREAM_NON_BLOCKING as u32,
            )
            .result()
            .map_err(|e| NvpError::Unavailable(format!("cuStreamCreate failed: {e:?}")))?;
            stream.assume_init()
        };

        info!(kernel = KERNEL_NAME, "NV12 to RGB conversion stage ready");
        Ok(Self {
            function,
            stream,
            module,
        })
    }

    fn bind(&self) -> NvpResult<()> {
        self.module
            .ctx
            .bind_to_thread()
            .map_err(|e| NvpError::Unavailable(format!("failed to bind CUDA context: {e}")))
    }
}

impl Reorganizer for CudaReorganizer {
    fn submit(
        &mut self,
        source: DevicePtr,
        width: usize,
        height: usize,
        destination: DevicePtr,
        pitch: u32,
    ) -> NvpResult<()> {
        self.bind()?;
        let mut nv12: u64 = source.0;
        let mut width_arg = width as c_int;
        let mut height_arg = height as c_int;
        let mut pitch_arg = pitch as c_int;
        let mut rgb: u64 = destination.0;
        let mut params: [*mut c_void; 5] = [
            (&mut nv12 as *mut u64).cast(),
            (&mut width_arg as *mut c_int).cast(),
            (&mut height_arg as *mut c_int).cast(),
            (&mut pitch_arg as *mut c_int).cast(),
            (&mut rgb as *mut u64).cast(),
        ];
        let (grid_x, grid_y) = grid_for(width, height);

        // SAFETY: `params` matches the kernel signature and outlives the
        // launch call, which copies the argument values.
        unsafe {
            sys::cuLaunchKernel(
                self.function,
                grid_x,
                grid_y,
                1,
                BLOCK,
                BLOCK,
                1,
                0,
                self.stream,
                params.as_mut_ptr(),
                std::ptr::null_mut(),
            )
        }
        .result()
        .map_err(|e| NvpError::Conversion(format!("NV12 to RGB launch failed: {e:?}")))
    }

    fn sync(&mut self) -> NvpResult<()> {
        self.bind()?;
        // SAFETY: the stream is live.
        unsafe { sys::cuStreamSynchronize(self.stream) }
            .result()
            .map_err(|e| NvpError::Synchronization(format!("cuStreamSynchronize failed: {e:?}")))
    }

    fn stream(&self) -> StreamHandle {
        StreamHandle::from_raw(self.stream as usize as u64)
    }
}

impl Drop for CudaReorganizer {
    fn drop(&mut self) {
        let _ = self.module.ctx.bind_to_thread();
        // SAFETY: the stream came from cuStreamCreate and is destroyed once.
        if let Err(e) = unsafe { sys::cuStreamDestroy_v2(self.stream) }.result() {
            warn!(error = ?e, "failed to destroy conversion stream");
        }
        debug!("conversion stage released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_covers_partial_blocks() {
        assert_eq!(grid_for(1920, 1080), (120, 68));
        assert_eq!(grid_for(17, 1), (2, 1));
        assert_eq!(grid_for(16, 16), (1, 1));
    }

    #[test]
    fn kernel_source_declares_entry_point() {
        assert!(NV12_TO_RGB_SRC.contains(&format!("void {KERNEL_NAME}(")));
    }
}
