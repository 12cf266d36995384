// Copyright 2026 the PTX Trace Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! PTX emission.
//!
//! One kernel per bucket. The skeleton is fixed: module header, `vprintf`
//! declaration, a `.visible .entry` taking the argument-table pointer and
//! the lane count, per-class register files sized to the schedule, and a
//! grid-stride loop whose body is the schedule in order. Nodes with
//! attached data become typed global loads; computed nodes expand their
//! instruction template; externally referenced computed nodes whose count
//! matches the bucket get a buffer and a mirroring store.
//!
//! The template language is three placeholders: `$t<d>` (type token),
//! `$b<d>` (binary-type token) and `$r<d>` (register name), with `d` = 1
//! for the node itself and 2–4 for its dependencies in declared order. Any
//! other `$` sequence fails compilation.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write as _;

use crate::backend::{Backend, DevicePtr};
use crate::store::VarStore;
use crate::trace::{Trace, TraceError};
use crate::var::{RESERVED_REGS, VarId, Variable};
use crate::vartype::VarType;

/// Exported entry-point name of every emitted kernel.
pub(crate) const KERNEL_NAME: &str = "enoki_kernel";

/// One emitted kernel: PTX text plus its argument table.
#[derive(Clone, Debug)]
pub(crate) struct Kernel {
    pub(crate) ptx: String,
    /// Buffer addresses in the order the kernel's loads and stores index
    /// them through the argument-table pointer.
    pub(crate) args: Vec<DevicePtr>,
}

impl<B: Backend> Trace<B> {
    /// Renders the bucket's schedule into a kernel.
    ///
    /// Emission has two side effects on the trace: side-effect sinks give
    /// up their scheduler pin right after their instruction is placed, and
    /// externally referenced computed nodes matching the bucket count are
    /// materialized (buffer allocated and recorded in the argument table).
    pub(crate) fn emit_kernel(
        &mut self,
        bucket: u32,
        schedule: &[u32],
    ) -> Result<Kernel, TraceError> {
        let mut body = String::new();
        let mut args: Vec<DevicePtr> = Vec::new();

        for &raw in schedule {
            let (is_input, side_effect) = {
                let var = self.store.var(raw)?;
                (var.is_input(), var.side_effect)
            };

            if is_input {
                let var = self.store.var(raw)?;
                emit_load(&mut body, &mut args, VarId::new(raw), var)?;
                continue;
            }

            {
                let var = self.store.var(raw)?;
                if let Some(comment) = &var.comment {
                    let _ = writeln!(body, "    // {comment}");
                }
            }
            expand_template(&mut body, &self.store, raw)?;

            if side_effect {
                // The sink has been compiled; release the scheduler pin.
                if let Some(var) = self.store.get_mut(raw) {
                    var.side_effect = false;
                }
                self.dec_ref_raw(raw, true)?;
            }

            let needs_store = match self.store.get(raw) {
                Some(var) => var.refs_ext > 0 && var.count == bucket && var.data.is_null(),
                None => false,
            };
            if needs_store {
                let (count, ty) = {
                    let var = self.store.var(raw)?;
                    (var.count, var.ty)
                };
                let bytes = count as usize * ty.size();
                if bytes == 0 {
                    return Err(TraceError::UnsupportedType {
                        var: VarId::new(raw),
                        ty,
                    });
                }
                let ptr = self.backend.alloc(bytes)?;
                let var = self.store.var_mut(raw)?;
                var.data = ptr;
                var.owns_data = true;
                emit_store(&mut body, &mut args, VarId::new(raw), var)?;
            }
        }

        let mut ptx = String::new();
        kernel_prologue(&mut ptx, RESERVED_REGS as usize + schedule.len());
        ptx.push_str(&body);
        kernel_epilogue(&mut ptx);
        Ok(Kernel { ptx, args })
    }
}

fn kernel_prologue(out: &mut String, reg_count: usize) {
    out.push_str(".version 6.3\n");
    out.push_str(".target sm_75\n");
    out.push_str(".address_size 64\n\n");
    out.push_str(".extern .func (.param .b32 rv) vprintf (\n");
    out.push_str("    .param .b64 fmt,\n");
    out.push_str("    .param .b64 buf\n");
    out.push_str(");\n\n");
    let _ = writeln!(out, ".visible .entry {KERNEL_NAME}(.param .u64 ptr,");
    out.push_str("                             .param .u32 size) {\n");
    for (class, prefix) in [
        ("b8  ", "%b"),
        ("b16 ", "%w"),
        ("b16 ", "%h"),
        ("b32 ", "%r"),
        ("b64 ", "%rd"),
        ("f32 ", "%f"),
        ("f64 ", "%d"),
        ("pred", "%p"),
    ] {
        let _ = writeln!(out, "    .reg.{class} {prefix}<{reg_count}>;");
    }
    out.push('\n');
    out.push_str("    // Grid-stride loop setup\n");
    out.push_str("    ld.param.u64 %rd0, [ptr];\n");
    out.push_str("    ld.param.u32 %r1, [size];\n");
    out.push_str("    mov.u32 %r4, %tid.x;\n");
    out.push_str("    mov.u32 %r5, %ctaid.x;\n");
    out.push_str("    mov.u32 %r6, %ntid.x;\n");
    out.push_str("    mov.u32 %r7, %nctaid.x;\n");
    out.push_str("    mad.lo.u32 %r2, %r5, %r6, %r4;\n");
    out.push_str("    mul.lo.u32 %r3, %r6, %r7;\n");
    out.push_str("    setp.ge.u32 %p0, %r2, %r1;\n");
    out.push_str("    @%p0 bra L_done;\n\n");
    out.push_str("L_body:\n");
}

fn kernel_epilogue(out: &mut String) {
    // The post-`ret` store is unreachable by construction; it pins the
    // stride counter against register elimination by the assembler.
    out.push('\n');
    out.push_str("    add.u32 %r2, %r2, %r3;\n");
    out.push_str("    setp.lt.u32 %p0, %r2, %r1;\n");
    out.push_str("    @%p0 bra L_body;\n\n");
    out.push_str("L_done:\n");
    out.push_str("    ret;\n");
    out.push_str("    st.global.u32 [%rd8], %r3;\n");
    out.push_str("}\n");
}

/// Points `%rd8` at this node's lane slot via the argument table.
fn emit_address(out: &mut String, args: &mut Vec<DevicePtr>, var: &Variable) {
    let slot = args.len() * 8;
    args.push(var.data);
    let _ = writeln!(out, "    ld.global.u64 %rd8, [%rd0 + {slot}];");
    if var.count != 1 {
        let _ = writeln!(out, "    mul.wide.u32 %rd9, %r2, {};", var.ty.size());
        let _ = writeln!(out, "    add.u64 %rd8, %rd8, %rd9;");
    }
}

fn emit_load(
    out: &mut String,
    args: &mut Vec<DevicePtr>,
    id: VarId,
    var: &Variable,
) -> Result<(), TraceError> {
    if var.ty == VarType::Invalid {
        return Err(TraceError::UnsupportedType { var: id, ty: var.ty });
    }
    let prefix = var.ty.register_prefix();
    let reg = var.reg;
    match &var.comment {
        Some(comment) => {
            let _ = writeln!(out, "    // Load {prefix}{reg}: {comment}");
        }
        None => {
            let _ = writeln!(out, "    // Load {prefix}{reg}");
        }
    }
    emit_address(out, args, var);
    if var.ty == VarType::Bool {
        let _ = writeln!(out, "    ld.global.u8 %w1, [%rd8];");
        let _ = writeln!(out, "    setp.ne.u16 %p{reg}, %w1, 0;");
    } else {
        let _ = writeln!(
            out,
            "    ld.global.{} {prefix}{reg}, [%rd8];",
            var.ty.memory_suffix()
        );
    }
    Ok(())
}

fn emit_store(
    out: &mut String,
    args: &mut Vec<DevicePtr>,
    id: VarId,
    var: &Variable,
) -> Result<(), TraceError> {
    if var.ty == VarType::Invalid {
        return Err(TraceError::UnsupportedType { var: id, ty: var.ty });
    }
    let prefix = var.ty.register_prefix();
    let reg = var.reg;
    let _ = writeln!(out, "    // Store {prefix}{reg}");
    emit_address(out, args, var);
    if var.ty == VarType::Bool {
        let _ = writeln!(out, "    selp.u16 %w1, 1, 0, %p{reg};");
        let _ = writeln!(out, "    st.global.u8 [%rd8], %w1;");
    } else {
        let _ = writeln!(
            out,
            "    st.global.{} [%rd8], {prefix}{reg};",
            var.ty.memory_suffix()
        );
    }
    Ok(())
}

/// Expands the `$t`/`$b`/`$r` placeholders of one node's template.
///
/// Operand 1 is the node itself; 2–4 are its dependencies in declared
/// order. The expansion is appended with four spaces of indentation; a
/// template that does not end in a newline gets `;` and a newline.
pub(crate) fn expand_template(
    out: &mut String,
    store: &VarStore,
    raw: u32,
) -> Result<(), TraceError> {
    let id = VarId::new(raw);
    let var = store.var(raw)?;
    let template: &str = &var.template;

    out.push_str("    ");
    let bytes = template.as_bytes();
    let mut pos = 0;
    while let Some(off) = template[pos..].find('$') {
        let at = pos + off;
        out.push_str(&template[pos..at]);

        let kind = bytes.get(at + 1).copied();
        let digit = bytes.get(at + 2).copied();
        let (kind, digit) = match (kind, digit) {
            (Some(k @ (b't' | b'b' | b'r')), Some(d @ b'1'..=b'4')) => (k, d - b'0'),
            _ => return Err(TraceError::BadPlaceholder { var: id, offset: at }),
        };

        let op_raw = if digit == 1 {
            raw
        } else {
            var.deps[usize::from(digit) - 2]
        };
        if op_raw == 0 {
            return Err(TraceError::OperandOutOfRange {
                var: id,
                operand: digit,
            });
        }
        let op = store.var(op_raw)?;
        if op.ty == VarType::Invalid {
            return Err(TraceError::UnsupportedType {
                var: VarId::new(op_raw),
                ty: op.ty,
            });
        }
        match kind {
            b't' => out.push_str(op.ty.ptx_type()),
            b'b' => out.push_str(op.ty.ptx_binary_type()),
            _ => {
                out.push_str(op.ty.register_prefix());
                let _ = write!(out, "{}", op.reg);
            }
        }
        pos = at + 3;
    }
    out.push_str(&template[pos..]);

    if !template.ends_with('\n') {
        out.push_str(";\n");
    }
    Ok(())
}
