// Copyright 2026 the PTX Trace Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The device seam.
//!
//! The tracer talks to the GPU exclusively through [`Backend`]. The real
//! implementation (`ptx_trace_cuda`) wraps the NVIDIA driver API; the
//! hermetic implementation (`ptx_trace_emulator`) interprets the emitted
//! PTX on the host. The seam is deliberately coarse: [`Backend::launch`]
//! owns the whole link → load → launch → release cycle, so linker state,
//! module handles and the argument table never outlive a single launch.

use alloc::boxed::Box;
use core::fmt;

/// An address in device memory. Zero is the null pointer.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    /// The null device pointer.
    pub const NULL: Self = Self(0);

    /// Returns `true` for the null pointer.
    #[must_use]
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns this pointer advanced by `bytes`.
    #[must_use]
    #[inline]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }
}

/// Device-side failures.
///
/// Driver and linker errors are reported verbatim, including the linker
/// log. All of these are fatal to the current evaluation; the tracer never
/// retries.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BackendError {
    /// No usable device. Raised at construction time by backends that bind
    /// a driver at runtime.
    Unavailable(Box<str>),
    /// A driver call failed with a status code.
    Driver {
        /// Name of the failing driver entry point.
        call: &'static str,
        /// Raw status code as reported by the driver.
        code: i32,
    },
    /// The JIT linker rejected the kernel; payload is the linker log.
    Link(Box<str>),
    /// Device allocation failed.
    OutOfMemory {
        /// Requested allocation size.
        bytes: usize,
    },
    /// Kernel execution failed; payload is a backend-specific message.
    Launch(Box<str>),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(why) => write!(f, "device unavailable: {why}"),
            Self::Driver { call, code } => write!(f, "driver call {call} failed: code {code}"),
            Self::Link(log) => write!(f, "kernel link failed:\n{log}"),
            Self::OutOfMemory { bytes } => write!(f, "device allocation of {bytes} bytes failed"),
            Self::Launch(why) => write!(f, "kernel launch failed: {why}"),
        }
    }
}

impl core::error::Error for BackendError {}

/// Device operations consumed by the tracer.
///
/// Implementations are single-device and synchronous: every method blocks
/// until the device-side effect is visible to the host, and launches target
/// the default stream.
pub trait Backend {
    /// Allocates `bytes` of device memory.
    fn alloc(&mut self, bytes: usize) -> Result<DevicePtr, BackendError>;

    /// Releases an allocation previously returned by [`Backend::alloc`].
    fn free(&mut self, ptr: DevicePtr) -> Result<(), BackendError>;

    /// Copies `bytes` from host memory into device memory at `dst`.
    fn copy_to_device(&mut self, dst: DevicePtr, bytes: &[u8]) -> Result<(), BackendError>;

    /// Copies `out.len()` bytes from device memory at `src` into `out`.
    fn copy_to_host(&mut self, src: DevicePtr, out: &mut [u8]) -> Result<(), BackendError>;

    /// Links `ptx`, resolves `entry`, and launches it over `size` lanes.
    ///
    /// `args` is the argument table: the kernel's first parameter points at
    /// a device copy of this array, in order. The implementation copies the
    /// table to the device, launches with its fixed grid geometry, waits
    /// for completion, and releases the linker, module and table before
    /// returning.
    fn launch(
        &mut self,
        ptx: &str,
        entry: &str,
        args: &[DevicePtr],
        size: u32,
    ) -> Result<(), BackendError>;
}
