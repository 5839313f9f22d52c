//! Host staging for compressed input.
//!
//! The CUVID parser only reads host memory. Device-resident input is copied
//! into a reusable host buffer first; host input is passed through as is.

use tracing::{debug, error};

use nvp_common::{InputBuffer, NvpError, NvpResult};

use crate::backend::DeviceRuntime;

/// Growable host buffer whose capacity never shrinks.
#[derive(Debug, Default)]
pub struct StagingBuffer {
    data: Vec<u8>,
}

impl StagingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently reserved.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Return a host view of `input`.
    ///
    /// Host input is borrowed directly. Device input is copied into the
    /// staging buffer, growing it first when it is too small.
    pub fn host_view<'a>(
        &'a mut self,
        runtime: &dyn DeviceRuntime,
        input: InputBuffer<'a>,
    ) -> NvpResult<&'a [u8]> {
        match input {
            InputBuffer::Host(data) => Ok(data),
            InputBuffer::Device { ptr, len } => {
                self.ensure(len)?;
                let staged = &mut self.data[..len];
                runtime.copy_to_host(staged, ptr).map_err(|e| {
                    error!(bytes = len, error = %e, "could not copy device input to host");
                    NvpError::CopyFailure(format!("device input ({len} bytes) to host: {e}"))
                })?;
                Ok(&self.data[..len])
            }
        }
    }

    fn ensure(&mut self, len: usize) -> NvpResult<()> {
        let current = self.data.len();
        if len <= current {
            return Ok(());
        }
        self.data
            .try_reserve_exact(len - current)
            .map_err(|e| {
                error!(bytes = len, "could not grow host staging buffer");
                NvpError::AllocationFailure {
                    bytes: len,
                    reason: e.to_string(),
                }
            })?;
        self.data.resize(len, 0);
        debug!(from = current, to = len, "grew host staging buffer");
        Ok(())
    }
}
