// Copyright 2026 the PTX Trace Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The trace context and builder API.

use alloc::boxed::Box;
use core::fmt;

use crate::backend::{Backend, BackendError, DevicePtr};
use crate::schedule::Scratch;
use crate::store::VarStore;
use crate::var::{EdgeCallback, RESERVED_REGS, VarId, Variable};
use crate::vartype::VarType;

/// Trace and compilation errors.
///
/// Every variant is fatal to the operation that produced it; the tracer
/// never retries. Device buffers already attached to nodes stay owned by
/// those nodes and are released through normal reference-count decrements.
#[derive(Debug)]
pub enum TraceError {
    /// The id does not name a table slot.
    UnknownVariable(VarId),
    /// The id names a node that has already been destroyed.
    CollectedVariable(VarId),
    /// A reference count would drop below zero.
    RefCountUnderflow {
        /// The node whose count underflowed.
        var: VarId,
        /// `true` for the external count, `false` for the internal one.
        external: bool,
    },
    /// An instruction template contains an unrecognized `$` sequence.
    BadPlaceholder {
        /// The node whose template failed to compile.
        var: VarId,
        /// Byte offset of the offending `$` within the template.
        offset: usize,
    },
    /// A placeholder names an operand slot that is absent, or a builder
    /// operation addressed a dependency slot that is not populated.
    OperandOutOfRange {
        /// The node being compiled or edited.
        var: VarId,
        /// Operand position in template numbering (1 = self, 2–4 = deps).
        operand: u8,
    },
    /// An element type cannot be used in this position.
    UnsupportedType {
        /// The offending node.
        var: VarId,
        /// Its element type.
        ty: VarType,
    },
    /// A scheduled node's element count is neither 1 nor the bucket size.
    ShapeMismatch {
        /// The offending node.
        var: VarId,
        /// The node's element count.
        count: u32,
        /// The bucket's element count.
        bucket: u32,
    },
    /// A node has neither an instruction template nor attached data.
    EmptyVariable(VarId),
    /// The device backend failed.
    Backend(BackendError),
}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownVariable(var) => write!(f, "unknown variable: {var}"),
            Self::CollectedVariable(var) => {
                write!(f, "variable {var} was already collected")
            }
            Self::RefCountUnderflow { var, external } => write!(
                f,
                "{} reference count of variable {var} fell below zero",
                if *external { "external" } else { "internal" }
            ),
            Self::BadPlaceholder { var, offset } => write!(
                f,
                "variable {var}: unrecognized '$' sequence at byte {offset} of its template"
            ),
            Self::OperandOutOfRange { var, operand } => {
                write!(f, "variable {var}: operand {operand} is not populated")
            }
            Self::UnsupportedType { var, ty } => {
                write!(f, "variable {var}: type {ty:?} is not usable here")
            }
            Self::ShapeMismatch { var, count, bucket } => write!(
                f,
                "variable {var} has {count} elements, incompatible with a kernel over {bucket}"
            ),
            Self::EmptyVariable(var) => write!(
                f,
                "variable {var} has neither an instruction nor attached data"
            ),
            Self::Backend(e) => write!(f, "{e}"),
        }
    }
}

impl core::error::Error for TraceError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::Backend(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BackendError> for TraceError {
    fn from(e: BackendError) -> Self {
        Self::Backend(e)
    }
}

/// The tracing JIT context.
///
/// Holds the append-only node table, the active set (roots of the next
/// evaluation) and the dirty queue, plus the device backend everything
/// executes through. All state is confined to this value: create one per
/// device and pass it `&mut` — there is no process-wide instance.
#[derive(Debug)]
pub struct Trace<B: Backend> {
    pub(crate) store: VarStore,
    pub(crate) backend: B,
    /// Buffers released by reference-count collection. Frees are deferred
    /// here so a buffer referenced by an already-emitted argument table is
    /// never released before the launch it participates in.
    pub(crate) free_queue: alloc::vec::Vec<DevicePtr>,
    pub(crate) scratch: Scratch,
}

impl<B: Backend> Trace<B> {
    /// Creates an empty trace executing on `backend`.
    #[must_use]
    pub fn new(backend: B) -> Self {
        Self {
            store: VarStore::new(),
            backend,
            free_queue: alloc::vec::Vec::new(),
            scratch: Scratch::default(),
        }
    }

    /// Releases every owned device buffer and resets the table.
    ///
    /// Idempotent; also run on drop.
    pub fn shutdown(&mut self) -> Result<(), TraceError> {
        for ptr in self.store.drain_owned_buffers() {
            self.free_queue.push(ptr);
        }
        self.flush_frees()?;
        self.store.reset();
        Ok(())
    }

    /// Shared access to the backend.
    #[inline]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Exclusive access to the backend.
    #[inline]
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Publishes an externally allocated device buffer as a trace input.
    ///
    /// The node starts with one external reference (the returned handle).
    /// When `owns` is set, the buffer is released when the node is
    /// destroyed. A non-null `parent` is internally referenced for the
    /// lifetime of the new node; this keeps a base allocation alive while
    /// views into it circulate.
    pub fn register_input(
        &mut self,
        ty: VarType,
        count: u32,
        ptr: DevicePtr,
        parent: Option<VarId>,
        owns: bool,
    ) -> Result<VarId, TraceError> {
        if ptr.is_null() {
            return Err(TraceError::EmptyVariable(self.store.next_id()));
        }
        let parent_raw = match parent {
            Some(p) => {
                self.store.var(p.as_u32())?;
                p.as_u32()
            }
            None => 0,
        };
        let id = self.store.insert(Variable {
            ty,
            template: "".into(),
            deps: [parent_raw, 0, 0],
            count,
            data: ptr,
            owns_data: owns,
            refs_ext: 1,
            refs_int: 0,
            side_effect: false,
            dirty: false,
            subtree: 1,
            comment: None,
            reg: 0,
            callbacks: [None, None, None],
        });
        self.inc_ref_raw(parent_raw, false);
        self.store.activate(id.as_u32());
        Ok(id)
    }

    /// Appends a node with no operands.
    pub fn append(
        &mut self,
        ty: VarType,
        template: impl Into<Box<str>>,
    ) -> Result<VarId, TraceError> {
        self.append_raw(ty, template.into(), [0, 0, 0])
    }

    /// Appends a node with one operand.
    pub fn append1(
        &mut self,
        ty: VarType,
        template: impl Into<Box<str>>,
        op1: VarId,
    ) -> Result<VarId, TraceError> {
        self.append_raw(ty, template.into(), [op1.as_u32(), 0, 0])
    }

    /// Appends a node with two operands.
    pub fn append2(
        &mut self,
        ty: VarType,
        template: impl Into<Box<str>>,
        op1: VarId,
        op2: VarId,
    ) -> Result<VarId, TraceError> {
        self.append_raw(ty, template.into(), [op1.as_u32(), op2.as_u32(), 0])
    }

    /// Appends a node with three operands.
    pub fn append3(
        &mut self,
        ty: VarType,
        template: impl Into<Box<str>>,
        op1: VarId,
        op2: VarId,
        op3: VarId,
    ) -> Result<VarId, TraceError> {
        self.append_raw(
            ty,
            template.into(),
            [op1.as_u32(), op2.as_u32(), op3.as_u32()],
        )
    }

    pub(crate) fn append_raw(
        &mut self,
        ty: VarType,
        template: Box<str>,
        deps: [u32; 3],
    ) -> Result<VarId, TraceError> {
        // A computed node without an instruction can never be scheduled.
        if template.is_empty() {
            return Err(TraceError::EmptyVariable(self.store.next_id()));
        }
        // Read-after-write barrier: consuming a scatter target before the
        // scatter ran would observe stale contents.
        let mut barrier = false;
        for &dep in &deps {
            if dep == 0 {
                continue;
            }
            barrier |= self.store.var(dep)?.dirty;
        }
        if barrier {
            log::debug!("append: dirty operand, forcing evaluation");
            self.evaluate()?;
        }

        let mut count = 1_u32;
        let mut subtree = 1_u32;
        for &dep in &deps {
            if dep == 0 {
                continue;
            }
            let op = self.store.var(dep)?;
            count = count.max(op.count);
            subtree = subtree.saturating_add(op.subtree);
        }

        let id = self.store.insert(Variable {
            ty,
            template,
            deps,
            count,
            data: DevicePtr::NULL,
            owns_data: false,
            refs_ext: 1,
            refs_int: 0,
            side_effect: false,
            dirty: false,
            subtree,
            comment: None,
            reg: 0,
            callbacks: [None, None, None],
        });
        for &dep in &deps {
            self.inc_ref_raw(dep, false);
        }
        self.store.activate(id.as_u32());
        Ok(id)
    }

    /// Pins `id` so the next evaluation schedules it even if every handle
    /// is dropped.
    ///
    /// The pin is one external reference, which the code emitter releases
    /// once the node's instruction has been placed in a kernel.
    pub fn mark_side_effect(&mut self, id: VarId) -> Result<(), TraceError> {
        let var = self.store.var_mut(id.as_u32())?;
        if !var.side_effect {
            var.side_effect = true;
            // Through the reference manager so a node whose handles are
            // already gone re-enters the active set.
            self.inc_ref_raw(id.as_u32(), true);
        }
        Ok(())
    }

    /// Flags `id` as overwritten by a pending side effect.
    ///
    /// Consumers appended before the next evaluation will trigger one.
    pub fn mark_dirty(&mut self, id: VarId) -> Result<(), TraceError> {
        let var = self.store.var_mut(id.as_u32())?;
        if !var.dirty {
            var.dirty = true;
            self.store.push_dirty(id.as_u32());
        }
        Ok(())
    }

    /// Attaches a diagnostic comment, reproduced in the emitted kernel.
    pub fn attach_comment(
        &mut self,
        id: VarId,
        text: impl Into<Box<str>>,
    ) -> Result<(), TraceError> {
        self.store.var_mut(id.as_u32())?.comment = Some(text.into());
        Ok(())
    }

    /// Overwrites the element count of `id`.
    pub fn set_count(&mut self, id: VarId, count: u32) -> Result<(), TraceError> {
        self.store.var_mut(id.as_u32())?.count = count;
        Ok(())
    }

    /// Copies one element to the host, evaluating first if needed.
    ///
    /// `out.len()` must be the element's byte size; the copy reads from
    /// byte offset `offset * out.len()` of the node's buffer. The node is
    /// clean once this returns.
    pub fn fetch_element(
        &mut self,
        id: VarId,
        offset: usize,
        out: &mut [u8],
    ) -> Result<(), TraceError> {
        let pending = {
            let var = self.store.var(id.as_u32())?;
            var.data.is_null() || var.dirty
        };
        if pending {
            self.evaluate()?;
        }
        let var = self.store.var(id.as_u32())?;
        if var.data.is_null() {
            return Err(TraceError::EmptyVariable(id));
        }
        let src = var.data.offset(offset * out.len());
        self.backend.copy_to_host(src, out)?;
        Ok(())
    }

    /// Allocates device memory on behalf of the front-end.
    pub fn managed_alloc(&mut self, bytes: usize) -> Result<DevicePtr, TraceError> {
        Ok(self.backend.alloc(bytes)?)
    }

    /// Releases memory obtained from [`Trace::managed_alloc`].
    pub fn managed_free(&mut self, ptr: DevicePtr) -> Result<(), TraceError> {
        Ok(self.backend.free(ptr)?)
    }

    /// Hangs a callback object off the dependency edge `target.slot`.
    ///
    /// The edge owns the object: `on_forward` runs when the edge is retired
    /// by edge collapse, after which the object is dropped.
    pub fn attach_edge_callback(
        &mut self,
        target: VarId,
        slot: usize,
        callback: Box<dyn EdgeCallback>,
    ) -> Result<(), TraceError> {
        let var = self.store.var_mut(target.as_u32())?;
        if slot >= 3 || var.deps[slot] == 0 {
            return Err(TraceError::OperandOutOfRange {
                var: target,
                operand: u8::try_from(slot).unwrap_or(u8::MAX).saturating_add(2),
            });
        }
        var.callbacks[slot] = Some(callback);
        Ok(())
    }

    /// Detaches and returns the callback on edge `target.slot`, if any.
    ///
    /// Used by external layers that drive `on_backward` themselves.
    pub fn take_edge_callback(
        &mut self,
        target: VarId,
        slot: usize,
    ) -> Result<Option<Box<dyn EdgeCallback>>, TraceError> {
        let var = self.store.var_mut(target.as_u32())?;
        if slot >= 3 {
            return Err(TraceError::OperandOutOfRange {
                var: target,
                operand: u8::try_from(slot).unwrap_or(u8::MAX).saturating_add(2),
            });
        }
        Ok(var.callbacks[slot].take())
    }

    /// Number of table slots ever created, reserved ids included.
    #[must_use]
    #[inline]
    pub fn var_count(&self) -> usize {
        self.store.len()
    }

    /// External reference count of `id`.
    pub fn external_refs(&self, id: VarId) -> Result<u32, TraceError> {
        Ok(self.store.var(id.as_u32())?.refs_ext)
    }

    /// Internal reference count of `id`.
    pub fn internal_refs(&self, id: VarId) -> Result<u32, TraceError> {
        Ok(self.store.var(id.as_u32())?.refs_int)
    }

    /// Whether `id` is flagged dirty.
    pub fn is_dirty(&self, id: VarId) -> Result<bool, TraceError> {
        Ok(self.store.var(id.as_u32())?.dirty)
    }

    /// Whether `id` named a node that has since been destroyed.
    #[must_use]
    pub fn is_collected(&self, id: VarId) -> bool {
        matches!(
            self.store.var(id.as_u32()),
            Err(TraceError::CollectedVariable(_))
        )
    }

    /// Device pointer of `id` (null until materialization).
    pub fn device_ptr(&self, id: VarId) -> Result<DevicePtr, TraceError> {
        Ok(self.store.var(id.as_u32())?.data)
    }

    /// Element count of `id`.
    pub fn element_count(&self, id: VarId) -> Result<u32, TraceError> {
        Ok(self.store.var(id.as_u32())?.count)
    }

    /// Cached subtree size of `id`.
    pub fn subtree_size(&self, id: VarId) -> Result<u32, TraceError> {
        Ok(self.store.var(id.as_u32())?.subtree)
    }
}

impl<B: Backend> Drop for Trace<B> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("trace shutdown failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use alloc::vec::Vec;

    use super::*;
    use crate::backend::{Backend, BackendError};

    #[derive(Debug, Default)]
    struct MockBackend {
        next: u64,
        freed: Vec<u64>,
    }

    impl Backend for MockBackend {
        fn alloc(&mut self, bytes: usize) -> Result<DevicePtr, BackendError> {
            self.next += 0x1000;
            let _ = bytes;
            Ok(DevicePtr(self.next))
        }

        fn free(&mut self, ptr: DevicePtr) -> Result<(), BackendError> {
            self.freed.push(ptr.0);
            Ok(())
        }

        fn copy_to_device(&mut self, _dst: DevicePtr, _bytes: &[u8]) -> Result<(), BackendError> {
            Ok(())
        }

        fn copy_to_host(&mut self, _src: DevicePtr, out: &mut [u8]) -> Result<(), BackendError> {
            out.fill(0);
            Ok(())
        }

        fn launch(
            &mut self,
            _ptx: &str,
            _entry: &str,
            _args: &[DevicePtr],
            _size: u32,
        ) -> Result<(), BackendError> {
            Ok(())
        }
    }

    #[test]
    fn append_computes_count_and_subtree() {
        let mut t = Trace::new(MockBackend::default());
        let a = t
            .register_input(VarType::F32, 4, DevicePtr(0x10), None, false)
            .unwrap();
        let k = t.append(VarType::F32, "mov.f32 $r1, 0f3F800000").unwrap();
        let s = t
            .append2(VarType::F32, "add.f32 $r1, $r2, $r3", a, k)
            .unwrap();

        assert_eq!(t.element_count(s).unwrap(), 4);
        assert_eq!(t.subtree_size(a).unwrap(), 1);
        assert_eq!(t.subtree_size(k).unwrap(), 1);
        assert_eq!(t.subtree_size(s).unwrap(), 3);
        assert_eq!(t.internal_refs(a).unwrap(), 1);
        assert_eq!(t.internal_refs(k).unwrap(), 1);
        assert_eq!(t.external_refs(s).unwrap(), 1);
    }

    #[test]
    fn append_rejects_unknown_operands() {
        let mut t = Trace::new(MockBackend::default());
        assert!(matches!(
            t.append1(VarType::F32, "mov.f32 $r1, $r2", VarId::new(99)),
            Err(TraceError::UnknownVariable(_))
        ));
    }

    #[test]
    fn dirty_operand_forces_evaluation() {
        let mut t = Trace::new(MockBackend::default());
        let a = t
            .register_input(VarType::F32, 4, DevicePtr(0x10), None, false)
            .unwrap();
        t.mark_dirty(a).unwrap();
        assert!(t.is_dirty(a).unwrap());

        let r = t.append1(VarType::F32, "mov.f32 $r1, $r2", a).unwrap();
        assert!(!t.is_dirty(a).unwrap(), "barrier must clear the flag");
        assert!(!t.is_dirty(r).unwrap());
    }

    #[test]
    fn mark_side_effect_pins_one_external_reference() {
        let mut t = Trace::new(MockBackend::default());
        let s = t.append(VarType::U32, "mov.u32 $r1, %r2").unwrap();
        assert_eq!(t.external_refs(s).unwrap(), 1);
        t.mark_side_effect(s).unwrap();
        t.mark_side_effect(s).unwrap();
        assert_eq!(t.external_refs(s).unwrap(), 2, "pin is taken once");
    }

    #[test]
    fn register_input_requires_data() {
        let mut t = Trace::new(MockBackend::default());
        assert!(matches!(
            t.register_input(VarType::F32, 4, DevicePtr::NULL, None, false),
            Err(TraceError::EmptyVariable(_))
        ));
    }

    #[test]
    fn register_input_pins_its_parent() {
        let mut t = Trace::new(MockBackend::default());
        let base = t
            .register_input(VarType::F32, 8, DevicePtr(0x10), None, false)
            .unwrap();
        let view = t
            .register_input(VarType::F32, 4, DevicePtr(0x18), Some(base), false)
            .unwrap();
        assert_eq!(t.internal_refs(base).unwrap(), 1);

        // Dropping the base handle keeps it alive through the view.
        t.dec_ref_external(base).unwrap();
        assert!(!t.is_collected(base));
        t.dec_ref_external(view).unwrap();
        assert!(t.is_collected(base));
        assert!(t.is_collected(view));
    }

    #[test]
    fn shutdown_releases_owned_buffers_once() {
        let mut t = Trace::new(MockBackend::default());
        let ptr = t.managed_alloc(16).unwrap();
        let _a = t
            .register_input(VarType::F32, 4, ptr, None, true)
            .unwrap();
        t.shutdown().unwrap();
        assert_eq!(t.backend().freed, std::vec![ptr.0]);
        t.shutdown().unwrap();
        assert_eq!(t.backend().freed.len(), 1, "shutdown is idempotent");
    }

    #[test]
    fn edge_callbacks_attach_to_populated_slots_only() {
        struct Cb;
        impl EdgeCallback for Cb {
            fn on_forward(&mut self, _source: VarId, _target: VarId) {}
            fn on_backward(&mut self, _source: VarId, _target: VarId) {}
        }

        let mut t = Trace::new(MockBackend::default());
        let a = t
            .register_input(VarType::F32, 4, DevicePtr(0x10), None, false)
            .unwrap();
        let r = t.append1(VarType::F32, "mov.f32 $r1, $r2", a).unwrap();

        t.attach_edge_callback(r, 0, Box::new(Cb)).unwrap();
        assert!(matches!(
            t.attach_edge_callback(r, 1, Box::new(Cb)),
            Err(TraceError::OperandOutOfRange { operand: 3, .. })
        ));
        assert!(t.take_edge_callback(r, 0).unwrap().is_some());
        assert!(t.take_edge_callback(r, 0).unwrap().is_none());
    }
}
