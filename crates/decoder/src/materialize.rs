//! Turning a decoded surface into the caller's RGB frame.
//!
//! The sequence for one frame is:
//!
//! 1. map the decoded picture (NV12 in device memory),
//! 2. record the ready event on the default stream and make the conversion
//!    stream wait on it,
//! 3. convert into the caller's device buffer, or into the target buffer
//!    followed by an asynchronous copy to the caller's host buffer,
//! 4. synchronize the conversion stream,
//! 5. unmap, whatever happened before.

use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use nvp_common::{DevicePtr, Dimensions, NvpError, NvpResult, OutputBuffer};

use crate::backend::{
    CuvidApi, DecoderHandle, DeviceRuntime, EventHandle, MappedSurface, Reorganizer, StreamHandle,
};

// ---------------------------------------------------------------------------
// Target buffer
// ---------------------------------------------------------------------------

/// Device scratch buffer holding one packed RGB frame for host-bound output.
///
/// Freed on drop.
pub struct TargetBuffer {
    runtime: Arc<dyn DeviceRuntime>,
    ptr: DevicePtr,
    dims: Dimensions,
}

impl TargetBuffer {
    pub fn allocate(runtime: &Arc<dyn DeviceRuntime>, dims: Dimensions) -> NvpResult<Self> {
        let bytes = dims.rgb_len();
        let ptr = runtime.alloc_device(bytes).map_err(|e| {
            error!(bytes, %dims, error = %e, "could not allocate RGB target buffer");
            e
        })?;
        debug!(bytes, %dims, ptr = ?ptr, "allocated RGB target buffer");
        Ok(Self {
            runtime: Arc::clone(runtime),
            ptr,
            dims,
        })
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn dimensions(&self) -> Dimensions {
        self.dims
    }
}

impl std::fmt::Debug for TargetBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetBuffer")
            .field("ptr", &self.ptr)
            .field("dims", &self.dims)
            .finish()
    }
}

impl Drop for TargetBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.free_device(self.ptr) {
            warn!(ptr = ?self.ptr, error = %e, "failed to free RGB target buffer");
        }
    }
}

// ---------------------------------------------------------------------------
// Mapped frame (RAII surface guard)
// ---------------------------------------------------------------------------

/// A decoded picture mapped into device memory.
///
/// The surface is unmapped on drop; a failed unmap is logged and otherwise
/// ignored so it never replaces the result of the frame.
pub struct MappedFrame<'a> {
    api: &'a dyn CuvidApi,
    decoder: DecoderHandle,
    surface: MappedSurface,
}

impl<'a> MappedFrame<'a> {
    pub fn map(api: &'a dyn CuvidApi, decoder: DecoderHandle, picture_index: i32) -> NvpResult<Self> {
        let surface = api.map_frame(decoder, picture_index).map_err(|e| {
            error!(picture_index, error = %e, "could not map decoded frame");
            e
        })?;
        trace!(picture_index, ptr = ?surface.ptr, pitch = surface.pitch, "mapped frame");
        Ok(Self {
            api,
            decoder,
            surface,
        })
    }

    pub fn ptr(&self) -> DevicePtr {
        self.surface.ptr
    }

    pub fn pitch(&self) -> u32 {
        self.surface.pitch
    }
}

impl Drop for MappedFrame<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.api.unmap_frame(self.decoder, self.surface.ptr) {
            warn!(ptr = ?self.surface.ptr, error = %e, "failed to unmap frame");
        }
    }
}

// ---------------------------------------------------------------------------
// Materialization
// ---------------------------------------------------------------------------

/// Everything needed to materialize one decoded picture.
pub struct FrameSink<'a> {
    pub api: &'a dyn CuvidApi,
    pub runtime: &'a dyn DeviceRuntime,
    pub reorganizer: &'a mut dyn Reorganizer,
    pub decoder: DecoderHandle,
    /// Fired on the default stream once the decoder's output is complete.
    pub ready: EventHandle,
    /// Scratch buffer used when the caller's output lives in host memory.
    pub target: Option<DevicePtr>,
}

impl FrameSink<'_> {
    /// Write picture `picture_index` into `output` as `dims` packed RGB.
    pub fn materialize(
        &mut self,
        picture_index: i32,
        dims: Dimensions,
        output: &mut OutputBuffer<'_>,
    ) -> NvpResult<()> {
        let frame = MappedFrame::map(self.api, self.decoder, picture_index)?;
        self.wait_for_decoder()?;
        self.reorganize(&frame, dims, output)
    }

    fn wait_for_decoder(&mut self) -> NvpResult<()> {
        self.runtime
            .record_event(self.ready, StreamHandle::DEFAULT)
            .map_err(|e| {
                error!(error = %e, "could not record decoder-ready event");
                NvpError::Synchronization(format!("record ready event: {e}"))
            })?;
        let stream = self.reorganizer.stream();
        self.runtime.stream_wait_event(stream, self.ready).map_err(|e| {
            error!(stream = ?stream, error = %e, "conversion stream could not wait on decoder");
            NvpError::Synchronization(format!("wait on ready event: {e}"))
        })
    }

    fn reorganize(
        &mut self,
        frame: &MappedFrame<'_>,
        dims: Dimensions,
        output: &mut OutputBuffer<'_>,
    ) -> NvpResult<()> {
        let bytes = dims.rgb_len();
        let destination = match output {
            OutputBuffer::Device { ptr, .. } => *ptr,
            OutputBuffer::Host(_) => self.target.ok_or_else(|| {
                error!("no RGB target buffer for host output");
                NvpError::Conversion("no RGB target buffer for host output".into())
            })?,
        };

        self.reorganizer
            .submit(frame.ptr(), dims.width, dims.height, destination, frame.pitch())
            .map_err(|e| {
                error!(%dims, error = %e, "NV12 to RGB conversion failed");
                match e {
                    NvpError::Conversion(_) => e,
                    other => NvpError::Conversion(other.to_string()),
                }
            })?;

        let copied = match output {
            OutputBuffer::Host(host) => {
                let stream = self.reorganizer.stream();
                self.runtime
                    .copy_to_host_async(&mut host[..bytes], destination, stream)
                    .map_err(|e| {
                        error!(bytes, error = %e, "could not copy RGB frame to host");
                        NvpError::CopyFailure(format!("RGB frame ({bytes} bytes) to host: {e}"))
                    })
            }
            OutputBuffer::Device { .. } => Ok(()),
        };

        // The conversion must be finished before the surface is unmapped,
        // so synchronize even when the copy could not be queued.
        let synced = self.reorganizer.sync().map_err(|e| {
            error!(error = %e, "conversion stream synchronization failed");
            NvpError::Synchronization(format!("conversion stream: {e}"))
        });
        copied.and(synced)
    }
}
