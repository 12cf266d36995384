// Copyright 2026 the PTX Trace Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Tracing JIT compiler for vectorized GPU arrays.
//!
//! Front-end code appends elementwise operations to a [`Trace`]; each
//! operation carries a PTX instruction template and up to three operand
//! indices. Nothing executes until [`Trace::evaluate`] runs: the recorded
//! expression graph is partitioned by element count, each partition is
//! topologically scheduled, a single PTX kernel is emitted per partition and
//! handed to the [`Backend`](backend::Backend) for linking and launch, and
//! results land in device buffers owned by their trace nodes.
//!
//! ## Lifetime model
//!
//! Every node carries two reference counts. *External* references mirror
//! front-end array handles; *internal* references are taken when a node is
//! named as a dependency of a later node. A node is destroyed (and its
//! owned device buffer released) only when both counts reach zero, so a
//! value stays alive while any consumer upstream of an evaluation still
//! needs it, even after the user drops the handle.
//!
//! ## Evaluation barriers
//!
//! Scatter-like operations mark their target *dirty*. Appending a consumer
//! of a dirty operand forces a full evaluation first, so every kernel
//! observes the written-back contents of its inputs.
//!
//! The trace is a single-threaded structure: create a [`Trace`] and pass it
//! `&mut` everywhere. No process-wide instance exists.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod backend;
mod emit;
mod printf;
mod refs;
mod schedule;
mod store;
mod trace;
mod var;
mod vartype;

pub use trace::{Trace, TraceError};
pub use var::{EdgeCallback, RESERVED_REGS, VarId};
pub use vartype::VarType;
