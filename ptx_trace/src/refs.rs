// Copyright 2026 the PTX Trace Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Reference management.
//!
//! Every node carries two counts. External references pin a node because
//! user code still holds a handle to it; internal references pin it because
//! a later trace node names it as a dependency. A node is destroyed only
//! when both reach zero, at which point destruction cascades into its
//! dependencies through an explicit worklist (expression chains can be long
//! enough that recursion is not an option).
//!
//! Buffer releases triggered by collection are deferred into the trace's
//! free queue rather than handed to the backend immediately: emission
//! decrements side-effect sinks before their kernel has launched, and the
//! argument table of that kernel may still name buffers the cascade just
//! released.

use alloc::vec::Vec;

use crate::backend::Backend;
use crate::trace::{Trace, TraceError};
use crate::var::{RESERVED_REGS, VarId};

impl<B: Backend> Trace<B> {
    /// Takes an external reference on `id` (a front-end handle clone).
    ///
    /// Ids below [`RESERVED_REGS`] are silently ignored.
    pub fn inc_ref_external(&mut self, id: VarId) -> Result<(), TraceError> {
        if !id.is_reserved() {
            self.store.var(id.as_u32())?;
        }
        self.inc_ref_raw(id.as_u32(), true);
        Ok(())
    }

    /// Releases an external reference on `id`.
    pub fn dec_ref_external(&mut self, id: VarId) -> Result<(), TraceError> {
        self.dec_ref_raw(id.as_u32(), true)?;
        self.flush_frees()
    }

    /// Takes an internal reference on `id` (a dependency edge).
    ///
    /// Ids below [`RESERVED_REGS`] are silently ignored.
    pub fn inc_ref_internal(&mut self, id: VarId) -> Result<(), TraceError> {
        if !id.is_reserved() {
            self.store.var(id.as_u32())?;
        }
        self.inc_ref_raw(id.as_u32(), false);
        Ok(())
    }

    /// Releases an internal reference on `id`.
    pub fn dec_ref_internal(&mut self, id: VarId) -> Result<(), TraceError> {
        self.dec_ref_raw(id.as_u32(), false)?;
        self.flush_frees()
    }

    pub(crate) fn inc_ref_raw(&mut self, raw: u32, external: bool) {
        if raw < RESERVED_REGS {
            return;
        }
        if let Some(var) = self.store.get_mut(raw) {
            if external {
                var.refs_ext += 1;
                if var.refs_ext == 1 {
                    self.store.activate(raw);
                }
            } else {
                var.refs_int += 1;
            }
        }
    }

    /// Decrements one count of `raw` and collects any node whose counts
    /// both reach zero, cascading into its dependencies.
    pub(crate) fn dec_ref_raw(&mut self, raw: u32, external: bool) -> Result<(), TraceError> {
        let mut work: Vec<(u32, bool)> = Vec::new();
        work.push((raw, external));

        while let Some((raw, external)) = work.pop() {
            if raw < RESERVED_REGS {
                continue;
            }
            let (now_ext, now_int) = {
                let var = self.store.var_mut(raw)?;
                let refs = if external {
                    &mut var.refs_ext
                } else {
                    &mut var.refs_int
                };
                if *refs == 0 {
                    return Err(TraceError::RefCountUnderflow {
                        var: VarId::new(raw),
                        external,
                    });
                }
                *refs -= 1;
                (var.refs_ext, var.refs_int)
            };

            if external && now_ext == 0 {
                self.store.deactivate(raw);
            }

            if now_ext == 0
                && now_int == 0
                && let Some(var) = self.store.take(raw)
            {
                if var.owns_data && !var.data.is_null() {
                    self.free_queue.push(var.data);
                }
                for &dep in &var.deps {
                    if dep != 0 {
                        work.push((dep, false));
                    }
                }
            }
        }
        Ok(())
    }

    /// Hands every queued buffer release to the backend.
    pub(crate) fn flush_frees(&mut self) -> Result<(), TraceError> {
        while let Some(ptr) = self.free_queue.pop() {
            self.backend.free(ptr)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use alloc::vec::Vec;

    use crate::backend::{Backend, BackendError, DevicePtr};
    use crate::trace::{Trace, TraceError};
    use crate::var::VarId;
    use crate::vartype::VarType;

    #[derive(Debug, Default)]
    struct MockBackend {
        freed: Vec<u64>,
    }

    impl Backend for MockBackend {
        fn alloc(&mut self, _bytes: usize) -> Result<DevicePtr, BackendError> {
            Ok(DevicePtr(0x1000))
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
    fn dropping_the_last_handle_releases_a_whole_chain() {
        let mut t = Trace::new(MockBackend::default());
        let a = t
            .register_input(VarType::F32, 4, DevicePtr(0x10), None, true)
            .unwrap();
        let b = t.append1(VarType::F32, "mov.f32 $r1, $r2", a).unwrap();
        let c = t.append1(VarType::F32, "neg.f32 $r1, $r2", b).unwrap();

        // Intermediate handles released; the chain hangs off `c`.
        t.dec_ref_external(a).unwrap();
        t.dec_ref_external(b).unwrap();
        assert!(!t.is_collected(a));
        assert!(!t.is_collected(b));

        t.dec_ref_external(c).unwrap();
        assert!(t.is_collected(a));
        assert!(t.is_collected(b));
        assert!(t.is_collected(c));
        assert_eq!(
            t.backend().freed,
            std::vec![0x10],
            "the one owned buffer is released exactly once"
        );
    }

    #[test]
    fn decrement_below_zero_is_fatal() {
        let mut t = Trace::new(MockBackend::default());
        let a = t
            .register_input(VarType::F32, 4, DevicePtr(0x10), None, false)
            .unwrap();
        t.inc_ref_internal(a).unwrap();
        t.dec_ref_internal(a).unwrap();
        assert!(matches!(
            t.dec_ref_internal(a),
            Err(TraceError::RefCountUnderflow {
                external: false,
                ..
            })
        ));
    }

    #[test]
    fn reserved_ids_are_silently_ignored() {
        let mut t = Trace::new(MockBackend::default());
        for raw in 0..crate::var::RESERVED_REGS {
            let id = VarId::new(raw);
            t.inc_ref_external(id).unwrap();
            t.dec_ref_external(id).unwrap();
            t.dec_ref_internal(id).unwrap();
        }
        assert_eq!(t.var_count(), crate::var::RESERVED_REGS as usize);
    }

    #[test]
    fn external_eviction_keeps_downstream_consumers_alive() {
        let mut t = Trace::new(MockBackend::default());
        let a = t
            .register_input(VarType::F32, 4, DevicePtr(0x10), None, false)
            .unwrap();
        let r = t.append1(VarType::F32, "mov.f32 $r1, $r2", a).unwrap();

        t.dec_ref_external(a).unwrap();
        assert!(!t.is_collected(a), "consumer still pins the input");
        assert_eq!(t.external_refs(a).unwrap(), 0);
        assert_eq!(t.internal_refs(a).unwrap(), 1);

        t.dec_ref_external(r).unwrap();
        assert!(t.is_collected(a));
        assert!(t.is_collected(r));
    }
}
