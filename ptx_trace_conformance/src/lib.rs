// Copyright 2026 the PTX Trace Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Shared fixtures for the conformance tests.

use ptx_trace::backend::Backend as _;
use ptx_trace::{Trace, TraceError, VarId, VarType};
use ptx_trace_emulator::Emulator;

/// A trace running on the emulator backend.
pub type EmuTrace = Trace<Emulator>;

/// Creates an empty emulator-backed trace.
#[must_use]
pub fn trace() -> EmuTrace {
    Trace::new(Emulator::new())
}

/// Registers an owned `F32` input holding `values`.
pub fn input_f32(t: &mut EmuTrace, values: &[f32]) -> Result<VarId, TraceError> {
    let ptr = t.managed_alloc(values.len() * 4)?;
    t.backend_mut().write_f32(ptr, values)?;
    t.register_input(
        VarType::F32,
        u32::try_from(values.len()).unwrap_or(u32::MAX),
        ptr,
        None,
        true,
    )
}

/// Registers a `Pointer` node whose payload is `target`'s buffer address,
/// keeping `target` alive through the parent edge. This is how scatter and
/// gather templates receive a base address.
pub fn input_ptr_to(t: &mut EmuTrace, target: VarId) -> Result<VarId, TraceError> {
    let addr = t.device_ptr(target)?.0;
    let cell = t.managed_alloc(8)?;
    t.backend_mut().copy_to_device(cell, &addr.to_le_bytes())?;
    t.register_input(VarType::Pointer, 1, cell, Some(target), true)
}

/// Fetches one `f32` lane.
pub fn fetch_f32(t: &mut EmuTrace, id: VarId, index: usize) -> Result<f32, TraceError> {
    let mut out = [0_u8; 4];
    t.fetch_element(id, index, &mut out)?;
    Ok(f32::from_le_bytes(out))
}

/// Fetches one `Bool` lane.
pub fn fetch_bool(t: &mut EmuTrace, id: VarId, index: usize) -> Result<bool, TraceError> {
    let mut out = [0_u8; 1];
    t.fetch_element(id, index, &mut out)?;
    Ok(out[0] != 0)
}
