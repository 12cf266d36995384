// Copyright 2026 the PTX Trace Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Trace nodes.

use alloc::boxed::Box;
use core::fmt;

use crate::backend::DevicePtr;
use crate::vartype::VarType;

/// Number of reserved register indices.
///
/// Index `0` means "no operand". Indices `1..RESERVED_REGS` are
/// pseudo-registers with fixed roles in the emitted kernel preamble
/// (`%rd0` argument pointer, `%r1` element count, `%r2` lane index, `%r3`
/// stride, `%r4..%r7` thread/block identifiers, `%rd8`/`%rd9` address
/// scratch). Reference-count operations silently ignore ids below this
/// bound, and the scheduler never visits them.
pub const RESERVED_REGS: u32 = 10;

/// Identifier for a node within a [`Trace`](crate::Trace).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct VarId(u32);

impl VarId {
    /// Creates a new variable id.
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw integer backing this id.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns `true` if this id names a reserved pseudo-register.
    #[inline]
    pub const fn is_reserved(self) -> bool {
        self.0 < RESERVED_REGS
    }
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Continuation callbacks attached to a dependency edge.
///
/// External layers (automatic differentiation, most notably) hang a
/// callback object off an edge of the trace. The edge owns the object:
/// `on_forward` fires when the edge is retired by edge collapse (its
/// consumer has been compiled into a kernel), after which the object is
/// dropped. `on_backward` is never invoked by the tracer itself; it is
/// reachable through [`Trace::take_edge_callback`](crate::Trace::take_edge_callback)
/// for reverse-mode traversals driven from outside.
pub trait EdgeCallback {
    /// The edge `source -> target` has been consumed by a compiled kernel.
    fn on_forward(&mut self, source: VarId, target: VarId);

    /// Reverse-mode hook; driven by external layers only.
    fn on_backward(&mut self, source: VarId, target: VarId);
}

/// One record in the append-only expression graph.
pub(crate) struct Variable {
    pub(crate) ty: VarType,
    /// PTX instruction template with `$t`/`$b`/`$r` placeholders. Empty for
    /// input nodes (which carry data instead).
    pub(crate) template: Box<str>,
    /// Operand ids; `0` marks an absent slot.
    pub(crate) deps: [u32; 3],
    /// Number of lanes; `1` denotes a broadcast scalar.
    pub(crate) count: u32,
    /// Device buffer, null until materialization.
    pub(crate) data: DevicePtr,
    /// Whether `data` is released when the node is destroyed.
    pub(crate) owns_data: bool,
    pub(crate) refs_ext: u32,
    pub(crate) refs_int: u32,
    /// Must be scheduled even without external references.
    pub(crate) side_effect: bool,
    /// Overwritten by a scatter; consumers must wait for an evaluation.
    pub(crate) dirty: bool,
    /// `1 + Σ subtree(dep)`, used as a scheduling tie-break.
    pub(crate) subtree: u32,
    pub(crate) comment: Option<Box<str>>,
    /// Schedule-assigned register index, valid during emission.
    pub(crate) reg: u32,
    /// Per-edge callback objects, owned by the edge.
    pub(crate) callbacks: [Option<Box<dyn EdgeCallback>>; 3],
}

impl Variable {
    /// A computed node carries a template; an input node carries data.
    #[inline]
    pub(crate) fn is_input(&self) -> bool {
        !self.data.is_null()
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variable")
            .field("ty", &self.ty)
            .field("template", &self.template)
            .field("deps", &self.deps)
            .field("count", &self.count)
            .field("data", &self.data)
            .field("owns_data", &self.owns_data)
            .field("refs_ext", &self.refs_ext)
            .field("refs_int", &self.refs_int)
            .field("side_effect", &self.side_effect)
            .field("dirty", &self.dirty)
            .field("subtree", &self.subtree)
            .field("comment", &self.comment)
            .field("reg", &self.reg)
            .field(
                "callbacks",
                &self.callbacks.each_ref().map(|c| c.is_some()),
            )
            .finish()
    }
}
