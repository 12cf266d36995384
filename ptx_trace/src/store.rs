// Copyright 2026 the PTX Trace Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The variable store: a growable table of trace nodes plus the active set
//! and the dirty queue.
//!
//! Destroyed nodes leave `None` slots behind so indices stay stable for the
//! lifetime of the trace; the table is append-only. The active set holds
//! the roots of the next evaluation (externally referenced or
//! side-effectful nodes), ordered so scheduling is deterministic.

use alloc::collections::BTreeSet;
use alloc::vec::Vec;

use crate::backend::DevicePtr;
use crate::trace::TraceError;
use crate::var::{RESERVED_REGS, VarId, Variable};
use crate::vartype::VarType;

#[derive(Debug, Default)]
pub(crate) struct VarStore {
    vars: Vec<Option<Variable>>,
    active: BTreeSet<u32>,
    dirty_queue: Vec<u32>,
}

impl VarStore {
    /// Creates a store with the reserved pseudo-register slots installed.
    pub(crate) fn new() -> Self {
        let mut store = Self::default();
        store.install_reserved();
        store
    }

    /// Installs slots `0..RESERVED_REGS` with their fixed kernel roles.
    pub(crate) fn install_reserved(&mut self) {
        debug_assert!(self.vars.is_empty(), "reserved slots installed twice");
        let roles: [(VarType, &str); RESERVED_REGS as usize] = [
            (VarType::Pointer, "argument pointer"),
            (VarType::U32, "element count"),
            (VarType::U32, "lane index"),
            (VarType::U32, "stride"),
            (VarType::U32, "thread index"),
            (VarType::U32, "block index"),
            (VarType::U32, "block dimension"),
            (VarType::U32, "grid dimension"),
            (VarType::U64, "address scratch"),
            (VarType::U64, "address scratch"),
        ];
        for (i, (ty, comment)) in roles.into_iter().enumerate() {
            self.vars.push(Some(Variable {
                ty,
                template: "".into(),
                deps: [0; 3],
                count: 1,
                data: DevicePtr::NULL,
                owns_data: false,
                refs_ext: 0,
                refs_int: 0,
                side_effect: false,
                dirty: false,
                subtree: 0,
                comment: Some(comment.into()),
                reg: u32::try_from(i).unwrap_or(0),
                callbacks: [None, None, None],
            }));
        }
    }

    /// Number of table slots, including reserved and collected ones.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.vars.len()
    }

    /// The id the next inserted node will receive.
    #[inline]
    pub(crate) fn next_id(&self) -> VarId {
        VarId::new(u32::try_from(self.vars.len()).unwrap_or(u32::MAX))
    }

    /// Appends a node and returns its id.
    pub(crate) fn insert(&mut self, var: Variable) -> VarId {
        let id = self.next_id();
        self.vars.push(Some(var));
        id
    }

    #[inline]
    pub(crate) fn get(&self, raw: u32) -> Option<&Variable> {
        self.vars.get(raw as usize).and_then(Option::as_ref)
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, raw: u32) -> Option<&mut Variable> {
        self.vars.get_mut(raw as usize).and_then(Option::as_mut)
    }

    /// Looks up a node, distinguishing never-existed from collected.
    pub(crate) fn var(&self, raw: u32) -> Result<&Variable, TraceError> {
        match self.vars.get(raw as usize) {
            None => Err(TraceError::UnknownVariable(VarId::new(raw))),
            Some(None) => Err(TraceError::CollectedVariable(VarId::new(raw))),
            Some(Some(var)) => Ok(var),
        }
    }

    /// Mutable counterpart of [`VarStore::var`].
    pub(crate) fn var_mut(&mut self, raw: u32) -> Result<&mut Variable, TraceError> {
        match self.vars.get_mut(raw as usize) {
            None => Err(TraceError::UnknownVariable(VarId::new(raw))),
            Some(None) => Err(TraceError::CollectedVariable(VarId::new(raw))),
            Some(Some(var)) => Ok(var),
        }
    }

    /// Removes a node from the table, leaving a collected slot.
    pub(crate) fn take(&mut self, raw: u32) -> Option<Variable> {
        self.vars.get_mut(raw as usize).and_then(Option::take)
    }

    /// Ids currently in the active set, in ascending order.
    #[inline]
    pub(crate) fn active_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.active.iter().copied()
    }

    #[inline]
    pub(crate) fn activate(&mut self, raw: u32) {
        self.active.insert(raw);
    }

    #[inline]
    pub(crate) fn deactivate(&mut self, raw: u32) {
        self.active.remove(&raw);
    }

    #[inline]
    pub(crate) fn push_dirty(&mut self, raw: u32) {
        self.dirty_queue.push(raw);
    }

    /// Takes the dirty queue, leaving it empty.
    #[inline]
    pub(crate) fn drain_dirty(&mut self) -> Vec<u32> {
        core::mem::take(&mut self.dirty_queue)
    }

    /// Clears everything back to a freshly initialized table.
    pub(crate) fn reset(&mut self) {
        self.vars.clear();
        self.active.clear();
        self.dirty_queue.clear();
        self.install_reserved();
    }

    /// Device buffers owned by live nodes; used by shutdown.
    pub(crate) fn drain_owned_buffers(&mut self) -> Vec<DevicePtr> {
        let mut out = Vec::new();
        for slot in &mut self.vars {
            if let Some(var) = slot
                && var.owns_data
                && !var.data.is_null()
            {
                out.push(var.data);
                var.data = DevicePtr::NULL;
                var.owns_data = false;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    #[test]
    fn reserved_slots_map_registers_to_themselves() {
        let store = VarStore::new();
        assert_eq!(store.len(), RESERVED_REGS as usize);
        for raw in 0..RESERVED_REGS {
            let var = store.var(raw).unwrap();
            assert_eq!(var.reg, raw);
            assert!(var.template.is_empty());
        }
        assert_eq!(store.var(0).unwrap().ty, VarType::Pointer);
        assert_eq!(store.var(2).unwrap().ty, VarType::U32);
        assert_eq!(store.var(8).unwrap().ty, VarType::U64);
    }

    #[test]
    fn lookup_distinguishes_unknown_from_collected() {
        let mut store = VarStore::new();
        assert!(matches!(
            store.var(99),
            Err(TraceError::UnknownVariable(_))
        ));

        let id = store.insert(Variable {
            ty: VarType::F32,
            template: "mov.f32 $r1, 0f00000000".into(),
            deps: [0; 3],
            count: 1,
            data: DevicePtr::NULL,
            owns_data: false,
            refs_ext: 1,
            refs_int: 0,
            side_effect: false,
            dirty: false,
            subtree: 1,
            comment: None,
            reg: 0,
            callbacks: [None, None, None],
        });
        assert!(store.var(id.as_u32()).is_ok());
        store.take(id.as_u32());
        assert!(matches!(
            store.var(id.as_u32()),
            Err(TraceError::CollectedVariable(_))
        ));
    }

    #[test]
    fn dirty_queue_drains_in_insertion_order() {
        let mut store = VarStore::new();
        store.push_dirty(12);
        store.push_dirty(11);
        assert_eq!(store.drain_dirty(), std::vec![12, 11]);
        assert!(store.drain_dirty().is_empty());
    }
}
