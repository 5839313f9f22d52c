//! Geometry newtypes and tagged host/device buffers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Width/height pair in pixels. `(0, 0)` means "unknown".
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: usize,
    pub height: usize,
}

impl Dimensions {
    pub const ZERO: Self = Self {
        width: 0,
        height: 0,
    };

    pub const fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    /// True when either side is zero.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Size in bytes of a packed RGB image of these dimensions.
    pub fn rgb_len(&self) -> usize {
        self.width * self.height * 3
    }

    /// Dimensions of a picture coded in 16x16 macroblocks.
    pub fn from_macroblocks(width_in_mbs: usize, height_in_mbs: usize) -> Self {
        Self::new(width_in_mbs * 16, height_in_mbs * 16)
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// The sizes a decoder tracks between calls.
///
/// The size the caller wants *now* is never stored: it is the argument of
/// each decode call and is compared against these.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodeDims {
    /// Input geometry the hardware decoder object was created with.
    pub input: Dimensions,
    /// Output geometry the hardware decoder object and target buffer were created for.
    pub target: Dimensions,
    /// Geometry of the most recently decoded picture in the current call.
    pub source: Dimensions,
}

/// Display rectangle reported by a stream's sequence header.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DisplayArea {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl DisplayArea {
    /// Area covering `(0, 0)..(width, height)`.
    pub fn from_size(width: usize, height: usize) -> Self {
        Self {
            left: 0,
            top: 0,
            right: width as i32,
            bottom: height as i32,
        }
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(
            (self.right - self.left).max(0) as usize,
            (self.bottom - self.top).max(0) as usize,
        )
    }
}

/// Device virtual address.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: Self = Self(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }
}

impl fmt::Debug for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevicePtr(0x{:x})", self.0)
    }
}

/// Where a caller-provided pointer lives.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Residency {
    Host,
    Device,
}

/// Capability query answering "is this address device memory?".
pub trait ResidencyQuery {
    fn residency(&self, ptr: *const u8) -> Residency;
}

/// Compressed input for a decode call, tagged by where it lives.
#[derive(Copy, Clone, Debug)]
pub enum InputBuffer<'a> {
    Host(&'a [u8]),
    Device { ptr: DevicePtr, len: usize },
}

impl<'a> InputBuffer<'a> {
    /// Tag a raw caller pointer by asking the runtime where it lives.
    ///
    /// # Safety
    /// `ptr` must be valid for reads of `len` bytes for `'a`, in whichever
    /// address space the runtime reports.
    pub unsafe fn classify(query: &dyn ResidencyQuery, ptr: *const u8, len: usize) -> Self {
        match query.residency(ptr) {
            Residency::Device => Self::Device {
                ptr: DevicePtr(ptr as u64),
                len,
            },
            // SAFETY: the caller guarantees `ptr` is readable for `len` bytes.
            Residency::Host => Self::Host(std::slice::from_raw_parts(ptr, len)),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Host(data) => data.len(),
            Self::Device { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn residency(&self) -> Residency {
        match self {
            Self::Host(_) => Residency::Host,
            Self::Device { .. } => Residency::Device,
        }
    }
}

/// Destination of a decoded frame, tagged by where it lives.
#[derive(Debug)]
pub enum OutputBuffer<'a> {
    Host(&'a mut [u8]),
    Device { ptr: DevicePtr, len: usize },
}

impl<'a> OutputBuffer<'a> {
    /// Tag a raw caller pointer by asking the runtime where it lives.
    ///
    /// # Safety
    /// `ptr` must be valid for writes of `len` bytes for `'a`, in whichever
    /// address space the runtime reports, and must not be aliased.
    pub unsafe fn classify(query: &dyn ResidencyQuery, ptr: *mut u8, len: usize) -> Self {
        match query.residency(ptr) {
            Residency::Device => Self::Device {
                ptr: DevicePtr(ptr as u64),
                len,
            },
            // SAFETY: the caller guarantees exclusive write access to `len` bytes.
            Residency::Host => Self::Host(std::slice::from_raw_parts_mut(ptr, len)),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Host(data) => data.len(),
            Self::Device { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn residency(&self) -> Residency {
        match self {
            Self::Host(_) => Residency::Host,
            Self::Device { .. } => Residency::Device,
        }
    }
}
