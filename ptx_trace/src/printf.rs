// Copyright 2026 the PTX Trace Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Device-side formatted printing.
//!
//! `printf` is ordinary trace machinery: one appended node whose template
//! declares the format string as a `.global` byte array, packs the
//! arguments into a local buffer at eight bytes per slot (the `vprintf`
//! ABI), and calls the device-side `vprintf`. The node is marked as a side
//! effect so it is scheduled even though nothing consumes its value.

use alloc::string::String;
use core::fmt::Write as _;

use crate::backend::Backend;
use crate::trace::{Trace, TraceError};
use crate::var::VarId;
use crate::vartype::VarType;

impl<B: Backend> Trace<B> {
    /// Appends a `vprintf` call formatting up to three trace values.
    ///
    /// `F32` and `F16` arguments are promoted to `F64` and sub-word
    /// integers to 32 bits, matching what `vprintf` expects to find in its
    /// argument buffer. The node's element count follows the usual rule, so
    /// printing a count-N value prints once per lane. More than three
    /// arguments (or a format consuming more than the supplied arguments)
    /// is a caller error; only the arity is diagnosed here.
    pub fn append_printf(&mut self, fmt: &str, args: &[VarId]) -> Result<VarId, TraceError> {
        if args.len() > 3 {
            return Err(TraceError::OperandOutOfRange {
                var: self.store.next_id(),
                operand: 4,
            });
        }
        for &arg in args {
            let ty = self.store.var(arg.as_u32())?.ty;
            if ty == VarType::Invalid {
                return Err(TraceError::UnsupportedType { var: arg, ty });
            }
        }

        // Globals inside the kernel need names unique per node; the id this
        // append will produce is already known.
        let tag = self.store.next_id().as_u32();
        let mut tpl = String::new();

        tpl.push_str("{\n");
        let _ = write!(
            tpl,
            "        .global .align 1 .b8 fmt_{tag}[{}] = {{ ",
            fmt.len() + 1
        );
        for byte in fmt.bytes() {
            let _ = write!(tpl, "{byte}, ");
        }
        tpl.push_str("0 };\n");
        if !args.is_empty() {
            let _ = writeln!(
                tpl,
                "        .local .align 8 .b8 buf_{tag}[{}];",
                args.len() * 8
            );
        }
        let _ = writeln!(tpl, "        .reg.b64 %fmt_{tag}_p, %buf_{tag}_p;");

        for (i, &arg) in args.iter().enumerate() {
            let ty = self.store.var(arg.as_u32())?.ty;
            let ph = i + 2; // `$r2..$r4`, declared operand order
            let slot = i * 8;
            match ty {
                VarType::F32 | VarType::F16 => {
                    let _ = writeln!(tpl, "        .reg.f64 %arg{i}_{tag};");
                    let _ = writeln!(tpl, "        cvt.f64.$t{ph} %arg{i}_{tag}, $r{ph};");
                    let _ = writeln!(
                        tpl,
                        "        st.local.f64 [buf_{tag}+{slot}], %arg{i}_{tag};"
                    );
                }
                VarType::Bool => {
                    let _ = writeln!(tpl, "        .reg.b32 %arg{i}_{tag};");
                    let _ = writeln!(tpl, "        selp.u32 %arg{i}_{tag}, 1, 0, $r{ph};");
                    let _ = writeln!(
                        tpl,
                        "        st.local.u32 [buf_{tag}+{slot}], %arg{i}_{tag};"
                    );
                }
                VarType::I8 | VarType::I16 => {
                    let _ = writeln!(tpl, "        .reg.b32 %arg{i}_{tag};");
                    let _ = writeln!(tpl, "        cvt.s32.$t{ph} %arg{i}_{tag}, $r{ph};");
                    let _ = writeln!(
                        tpl,
                        "        st.local.s32 [buf_{tag}+{slot}], %arg{i}_{tag};"
                    );
                }
                VarType::U8 | VarType::U16 => {
                    let _ = writeln!(tpl, "        .reg.b32 %arg{i}_{tag};");
                    let _ = writeln!(tpl, "        cvt.u32.$t{ph} %arg{i}_{tag}, $r{ph};");
                    let _ = writeln!(
                        tpl,
                        "        st.local.u32 [buf_{tag}+{slot}], %arg{i}_{tag};"
                    );
                }
                _ => {
                    let _ = writeln!(tpl, "        st.local.$t{ph} [buf_{tag}+{slot}], $r{ph};");
                }
            }
        }

        let _ = writeln!(tpl, "        cvta.global.u64 %fmt_{tag}_p, fmt_{tag};");
        if args.is_empty() {
            let _ = writeln!(tpl, "        mov.u64 %buf_{tag}_p, 0;");
        } else {
            let _ = writeln!(tpl, "        cvta.local.u64 %buf_{tag}_p, buf_{tag};");
        }
        tpl.push_str("        {\n");
        tpl.push_str("            .param .b64 fmt_p;\n");
        tpl.push_str("            .param .b64 buf_p;\n");
        tpl.push_str("            .param .b32 rv_p;\n");
        let _ = writeln!(tpl, "            st.param.b64 [fmt_p], %fmt_{tag}_p;");
        let _ = writeln!(tpl, "            st.param.b64 [buf_p], %buf_{tag}_p;");
        tpl.push_str("            call.uni (rv_p), vprintf, (fmt_p, buf_p);\n");
        tpl.push_str("        }\n");
        tpl.push_str("    }\n");

        let mut deps = [0_u32; 3];
        for (i, &arg) in args.iter().enumerate() {
            deps[i] = arg.as_u32();
        }
        let id = self.append_raw(VarType::U32, tpl.into_boxed_str(), deps)?;
        self.mark_side_effect(id)?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use alloc::string::String;
    use alloc::vec::Vec;

    use crate::backend::{Backend, BackendError, DevicePtr};
    use crate::trace::{Trace, TraceError};
    use crate::vartype::VarType;

    #[derive(Debug, Default)]
    struct MockBackend {
        next: u64,
        kernels: Vec<String>,
    }

    impl Backend for MockBackend {
        fn alloc(&mut self, _bytes: usize) -> Result<DevicePtr, BackendError> {
            self.next += 0x1000;
            Ok(DevicePtr(self.next))
        }

        fn free(&mut self, _ptr: DevicePtr) -> Result<(), BackendError> {
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
            ptx: &str,
            _entry: &str,
            _args: &[DevicePtr],
            _size: u32,
        ) -> Result<(), BackendError> {
            self.kernels.push(ptx.into());
            Ok(())
        }
    }

    #[test]
    fn printf_nodes_are_side_effect_sinks() {
        let mut t = Trace::new(MockBackend::default());
        let s = t.append_printf("hello\n", &[]).unwrap();
        assert_eq!(t.external_refs(s).unwrap(), 2, "handle plus scheduler pin");

        t.dec_ref_external(s).unwrap();
        t.evaluate().unwrap();

        assert_eq!(t.backend().kernels.len(), 1, "scheduled without handles");
        assert!(t.is_collected(s), "sink is released once emitted");
        let ptx = &t.backend().kernels[0];
        assert!(ptx.contains(".global .align 1 .b8 fmt_10[7]"));
        assert!(ptx.contains("call.uni (rv_p), vprintf, (fmt_p, buf_p);"));
        assert!(!ptx.contains(".local"), "no argument buffer without args");
    }

    #[test]
    fn f32_arguments_are_promoted_to_f64() {
        let mut t = Trace::new(MockBackend::default());
        let ptr = t.managed_alloc(4).unwrap();
        let a = t
            .register_input(VarType::F32, 1, ptr, None, true)
            .unwrap();
        let s = t.append_printf("%f\n", &[a]).unwrap();
        t.dec_ref_external(s).unwrap();
        t.evaluate().unwrap();

        let ptx = &t.backend().kernels[0];
        assert!(ptx.contains("cvt.f64.f32"), "{ptx}");
        assert!(ptx.contains("st.local.f64 [buf_11+0],"), "{ptx}");
        assert!(ptx.contains(".local .align 8 .b8 buf_11[8];"));
    }

    #[test]
    fn more_than_three_arguments_is_a_caller_error() {
        let mut t = Trace::new(MockBackend::default());
        let ptr = t.managed_alloc(4).unwrap();
        let a = t
            .register_input(VarType::U32, 1, ptr, None, true)
            .unwrap();
        assert!(matches!(
            t.append_printf("%u %u %u %u\n", &[a, a, a, a]),
            Err(TraceError::OperandOutOfRange { operand: 4, .. })
        ));
    }

    #[test]
    fn printf_count_follows_its_arguments() {
        let mut t = Trace::new(MockBackend::default());
        let ptr = t.managed_alloc(16).unwrap();
        let a = t
            .register_input(VarType::U32, 4, ptr, None, true)
            .unwrap();
        let s = t.append_printf("%u\n", &[a]).unwrap();
        assert_eq!(t.element_count(s).unwrap(), 4, "prints once per lane");
    }
}
