// Copyright 2026 the PTX Trace Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end scenarios: trace, evaluate, fetch.

use ptx_trace::{TraceError, VarType};
use ptx_trace_conformance::{fetch_f32, input_f32, input_ptr_to, trace};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn doubling_materializes_every_lane() {
    init();
    let mut t = trace();
    let a = input_f32(&mut t, &[1.0, 2.0, 3.0, 4.0]).unwrap();
    let r = t
        .append1(VarType::F32, "add.f32 $r1, $r2, $r2", a)
        .unwrap();
    t.evaluate().unwrap();

    assert_eq!(fetch_f32(&mut t, r, 0).unwrap(), 2.0);
    assert_eq!(fetch_f32(&mut t, r, 3).unwrap(), 8.0);
}

#[test]
fn shared_operands_compile_to_three_instructions() {
    init();
    let mut t = trace();
    let a = input_f32(&mut t, &[1.0, 2.0, 3.0, 4.0]).unwrap();
    let b = t
        .append1(VarType::F32, "mul.f32 $r1, $r2, $r2", a)
        .unwrap();
    let c = t
        .append2(VarType::F32, "add.f32 $r1, $r2, $r3", a, b)
        .unwrap();
    t.evaluate().unwrap();

    // Schedule: one load for `a`, one multiply, one add; `a` feeds both
    // computed nodes but is emitted once.
    let ptx = t.backend().last_kernel().unwrap().to_owned();
    assert_eq!(ptx.matches("ld.global.f32").count(), 1, "{ptx}");
    assert_eq!(ptx.matches("mul.f32").count(), 1, "{ptx}");
    assert_eq!(ptx.matches("add.f32 %f").count(), 1, "{ptx}");

    // c[2] = a[2] + a[2]^2 = 3 + 9.
    assert_eq!(fetch_f32(&mut t, c, 2).unwrap(), 12.0);
    let _ = b;
}

#[test]
fn side_effect_sinks_run_without_handles_and_collect() {
    init();
    let mut t = trace();
    let s = t.append_printf("side effect\n", &[]).unwrap();
    // The node is already pinned by mark_side_effect; drop the handle.
    t.dec_ref_external(s).unwrap();
    assert!(!t.is_collected(s));

    t.evaluate().unwrap();

    assert_eq!(t.backend().launches(), 1, "the sink must still be scheduled");
    assert_eq!(t.backend().printed(), ["side effect\n".to_owned()]);
    assert!(t.is_collected(s), "no buffer, no references: collected");
}

#[test]
fn broadcast_scalars_fold_into_the_consuming_bucket() {
    init();
    let mut t = trace();
    let a = input_f32(&mut t, &[1.0, 2.0, 3.0, 4.0]).unwrap();
    let k = t.append(VarType::F32, "mov.f32 $r1, 0f42C80000").unwrap(); // 100.0
    let r = t
        .append2(VarType::F32, "add.f32 $r1, $r2, $r3", a, k)
        .unwrap();
    assert_eq!(t.element_count(r).unwrap(), 4);

    // K's only use is inside `r`; once the handle is gone there is nothing
    // to launch for the count-1 bucket.
    t.dec_ref_external(k).unwrap();
    t.evaluate().unwrap();

    assert_eq!(t.backend().launches(), 1, "no kernel for the empty bucket");
    assert_eq!(fetch_f32(&mut t, r, 1).unwrap(), 102.0);
}

#[test]
fn dirty_operands_force_evaluation_before_consumption() {
    init();
    let mut t = trace();
    let a = input_f32(&mut t, &[1.0, 2.0, 3.0, 4.0]).unwrap();

    // A scatter writing 9.0 over every lane of `a`, addressed through a
    // pointer node carrying `a`'s buffer address.
    let base = input_ptr_to(&mut t, a).unwrap();
    let nine = t.append(VarType::F32, "mov.f32 $r1, 0f41100000").unwrap();
    let w = t
        .append2(
            VarType::U32,
            "mul.wide.u32 %rd8, %r2, 4;\n    add.u64 %rd8, $r2, %rd8;\n    st.global.f32 [%rd8], $r3;\n",
            base,
            nine,
        )
        .unwrap();
    t.set_count(w, 4).unwrap();
    t.mark_side_effect(w).unwrap();
    t.mark_dirty(a).unwrap();
    t.dec_ref_external(w).unwrap();
    t.dec_ref_external(nine).unwrap();
    t.dec_ref_external(base).unwrap();
    assert!(t.is_dirty(a).unwrap());

    // Appending a consumer of the dirty operand runs the scatter first.
    let r = t
        .append1(VarType::F32, "add.f32 $r1, $r2, $r2", a)
        .unwrap();
    assert!(!t.is_dirty(a).unwrap(), "the barrier cleared the flag");

    for lane in 0..4 {
        assert_eq!(
            fetch_f32(&mut t, r, lane).unwrap(),
            18.0,
            "the consumer observes the scattered contents"
        );
    }
}

#[test]
fn heavy_subtrees_schedule_ahead_of_light_ones() {
    init();
    let mut t = trace();
    let a = input_f32(&mut t, &[1.0, 2.0, 3.0, 4.0]).unwrap();

    let mut dropped = Vec::new();
    let mut heavy = a;
    for _ in 0..5 {
        heavy = t
            .append1(VarType::F32, "neg.f32 $r1, $r2", heavy)
            .unwrap();
        dropped.push(heavy);
    }
    let light = t.append1(VarType::F32, "abs.f32 $r1, $r2", a).unwrap();
    dropped.push(light);
    let root = t
        .append2(VarType::F32, "add.f32 $r1, $r2, $r3", light, heavy)
        .unwrap();
    assert!(t.subtree_size(heavy).unwrap() > t.subtree_size(light).unwrap());
    for id in dropped {
        t.dec_ref_external(id).unwrap();
    }

    t.evaluate().unwrap();
    let ptx = t.backend().last_kernel().unwrap();
    let neg = ptx.find("neg.f32").unwrap();
    let abs = ptx.find("abs.f32").unwrap();
    assert!(neg < abs, "heavy descendants must be emitted first:\n{ptx}");

    // Five negations cancel to -a; adding |a| gives zero for positive a.
    assert_eq!(fetch_f32(&mut t, root, 2).unwrap(), 0.0);
}

#[test]
fn printf_formats_trace_values_per_lane() {
    init();
    let mut t = trace();
    let a = input_f32(&mut t, &[0.5, 1.5]).unwrap();
    let s = t.append_printf("lane value %f\n", &[a]).unwrap();
    t.dec_ref_external(s).unwrap();
    t.evaluate().unwrap();

    assert_eq!(
        t.backend().printed(),
        [
            "lane value 0.500000\n".to_owned(),
            "lane value 1.500000\n".to_owned(),
        ]
    );
}

#[test]
fn printf_rejects_more_than_three_arguments() {
    init();
    let mut t = trace();
    let a = input_f32(&mut t, &[1.0]).unwrap();
    assert!(matches!(
        t.append_printf("%f %f %f %f\n", &[a, a, a, a]),
        Err(TraceError::OperandOutOfRange { .. })
    ));
}
