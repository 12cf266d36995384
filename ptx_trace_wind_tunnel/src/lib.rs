// Copyright 2026 the PTX Trace Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Shared helpers for the `ptx_trace` wind-tunnel benchmarks.

use ptx_trace::{Trace, VarId, VarType};
use ptx_trace_emulator::Emulator;

/// An emulator-backed trace with one registered `F32` input of `lanes`
/// elements, initialized to `lane as f32`.
pub fn seeded_trace(lanes: u32) -> (Trace<Emulator>, VarId) {
    let mut t = Trace::new(Emulator::new());
    let values: Vec<f32> = (0..lanes).map(|i| i as f32).collect();
    let ptr = t.managed_alloc(values.len() * 4).expect("alloc");
    t.backend_mut().write_f32(ptr, &values).expect("upload");
    let a = t
        .register_input(VarType::F32, lanes, ptr, None, true)
        .expect("register");
    (t, a)
}

/// Appends a dependent chain of `len` unary ops rooted at `base`,
/// dropping intermediate handles so only the tip stays externally
/// referenced.
pub fn append_chain(t: &mut Trace<Emulator>, base: VarId, len: usize) -> VarId {
    let mut tip = base;
    for i in 0..len {
        let next = t
            .append1(VarType::F32, "add.f32 $r1, $r2, $r2", tip)
            .expect("append");
        if i > 0 {
            t.dec_ref_external(tip).expect("release");
        }
        tip = next;
    }
    tip
}
