// Copyright 2026 the PTX Trace Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! NVIDIA driver API backend for `ptx_trace`.
//!
//! The driver is bound at runtime with `libloading`, so this crate builds
//! everywhere; [`CudaDevice::new`] reports
//! [`BackendError::Unavailable`] when no driver is installed. All FFI is
//! confined to this crate.
//!
//! One [`CudaDevice`] owns one driver context on one device. Launches
//! follow the JIT cycle the tracer's contract describes: link the PTX,
//! resolve the entry point, copy the argument table, launch a fixed 32×128
//! grid on the default stream, synchronize, then release the linker,
//! module and table.

#![allow(
    unsafe_code,
    reason = "FFI bindings to the runtime-loaded CUDA driver API"
)]

mod driver;

pub use driver::CudaDevice;

// Re-exported so embedders matching on launch failures need one import.
pub use ptx_trace::backend::BackendError;
