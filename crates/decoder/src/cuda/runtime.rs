//! [`DeviceRuntime`] over the CUDA driver API.
//!
//! Uses cudarc's `CudaContext` for device initialisation and the raw
//! `cudarc::driver::sys` entry points for everything else, binding the
//! context to the calling thread before each call.

use std::ffi::c_void;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::Arc;

use cudarc::driver::{sys, CudaContext};
use tracing::{debug, info};

use nvp_common::{DevicePtr, NvpError, NvpResult, Residency, ResidencyQuery};

use crate::backend::{DeviceRuntime, EventHandle, StreamHandle};

pub(crate) fn raw_stream(stream: StreamHandle) -> sys::CUstream {
    stream.as_raw() as usize as sys::CUstream
}

fn raw_event(event: EventHandle) -> sys::CUevent {
    event.as_raw() as usize as sys::CUevent
}

/// CUDA device memory, copies and events on one device.
#[derive(Debug)]
pub struct CudaRuntime {
    ctx: Arc<CudaContext>,
}

impl CudaRuntime {
    /// Initialise device `ordinal` and make its primary context current.
    pub fn new(ordinal: usize) -> NvpResult<Self> {
        let ctx = CudaContext::new(ordinal).map_err(|e| {
            NvpError::Unavailable(format!("CUDA device {ordinal} init failed: {e}"))
        })?;
        ctx.bind_to_thread()
            .map_err(|e| NvpError::Unavailable(format!("failed to bind CUDA context: {e}")))?;
        info!(ordinal, "CUDA runtime ready");
        Ok(Self { ctx })
    }

    pub fn context(&self) -> &Arc<CudaContext> {
        &self.ctx
    }

    fn bind(&self) -> NvpResult<()> {
        self.ctx
            .bind_to_thread()
            .map_err(|e| NvpError::Unavailable(format!("failed to bind CUDA context: {e}")))
    }
}

impl ResidencyQuery for CudaRuntime {
    fn residency(&self, ptr: *const u8) -> Residency {
        if ptr.is_null() || self.bind().is_err() {
            return Residency::Host;
        }
        let mut memory_type: u32 = 0;
        // SAFETY: `memory_type` is a valid out-parameter of the attribute's
        // size. Unknown host pointers make the call fail, which means host.
        let result = unsafe {
            sys::cuPointerGetAttribute(
                (&mut memory_type as *mut u32).cast::<c_void>(),
                sys::CUpointer_attribute::CU_POINTER_ATTRIBUTE_MEMORY_TYPE,
                ptr as sys::CUdeviceptr,
            )
        };
        if result.result().is_ok()
            && memory_type == sys::CUmemorytype::CU_MEMORYTYPE_DEVICE as u32
        {
            Residency::Device
        } else {
            Residency::Host
        }
    }
}

impl DeviceRuntime for CudaRuntime {
    fn alloc_device(&self, bytes: usize) -> NvpResult<DevicePtr> {
        self.bind()?;
        // SAFETY: the context is bound; `ptr` is initialised on success.
        let ptr = unsafe {
            let mut ptr = MaybeUninit::uninit();
            sys::cuMemAlloc_v2(ptr.as_mut_ptr(), bytes)
                .result()
                .map_err(|e| NvpError::AllocationFailure {
                    bytes,
                    reason: format!("cuMemAlloc failed: {e:?}"),
                })?;
            ptr.assume_init()
        };
        Ok(DevicePtr(ptr))
    }

    fn free_device(&self, ptr: DevicePtr) -> NvpResult<()> {
        self.bind()?;
        // SAFETY: `ptr` came from `alloc_device` and is freed once.
        unsafe { sys::cuMemFree_v2(ptr.0) }
            .result()
            .map_err(|e| NvpError::Unavailable(format!("cuMemFree failed: {e:?}")))
    }

    fn copy_to_host(&self, dst: &mut [u8], src: DevicePtr) -> NvpResult<()> {
        self.bind()?;
        // SAFETY: `dst` is valid for `dst.len()` bytes; the caller vouches
        // for the device range.
        unsafe { sys::cuMemcpyDtoH_v2(dst.as_mut_ptr().cast(), src.0, dst.len()) }
            .result()
            .map_err(|e| NvpError::CopyFailure(format!("cuMemcpyDtoH failed: {e:?}")))
    }

    fn copy_to_host_async(
        &self,
        dst: &mut [u8],
        src: DevicePtr,
        stream: StreamHandle,
    ) -> NvpResult<()> {
        self.bind()?;
        // SAFETY: as above; the caller keeps `dst` alive until `stream` is
        // synchronized.
        unsafe {
            sys::cuMemcpyDtoHAsync_v2(dst.as_mut_ptr().cast(), src.0, dst.len(), raw_stream(stream))
        }
        .result()
        .map_err(|e| NvpError::CopyFailure(format!("cuMemcpyDtoHAsync failed: {e:?}")))
    }

    fn create_event(&self) -> NvpResult<EventHandle> {
        self.bind()?;
        let mut event: sys::CUevent = ptr::null_mut();
        // SAFETY: `event` is a valid out-parameter.
        unsafe {
            sys::cuEventCreate(
                &mut event,
                sys::CUevent_flags::CU_EVENT_DISABLE_TIMING as u32,
            )
        }
        .result()
        .map_err(|e| NvpError::Synchronization(format!("cuEventCreate failed: {e:?}")))?;
        debug!(event = ?event, "created CUDA event");
        Ok(EventHandle::from_raw(event as usize as u64))
    }

    fn record_event(&self, event: EventHandle, stream: StreamHandle) -> NvpResult<()> {
        self.bind()?;
        // SAFETY: both handles are live.
        unsafe { sys::cuEventRecord(raw_event(event), raw_stream(stream)) }
            .result()
            .map_err(|e| NvpError::Synchronization(format!("cuEventRecord failed: {e:?}")))
    }

    fn stream_wait_event(&self, stream: StreamHandle, event: EventHandle) -> NvpResult<()> {
        self.bind()?;
        // SAFETY: both handles are live.
        unsafe { sys::cuStreamWaitEvent(raw_stream(stream), raw_event(event), 0) }
            .result()
            .map_err(|e| NvpError::Synchronization(format!("cuStreamWaitEvent failed: {e:?}")))
    }

    fn destroy_event(&self, event: EventHandle) -> NvpResult<()> {
        self.bind()?;
        // SAFETY: the event came from `create_event` and is destroyed once.
        unsafe { sys::cuEventDestroy_v2(raw_event(event)) }
            .result()
            .map_err(|e| NvpError::Synchronization(format!("cuEventDestroy failed: {e:?}")))
    }
}
