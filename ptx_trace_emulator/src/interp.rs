// Copyright 2026 the PTX Trace Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Line-oriented interpreter for the emitted PTX subset.
//!
//! The parser keeps exactly the shapes the `ptx_trace` emitter produces
//! (plus the arithmetic the instruction templates of a typical front-end
//! use): directives, labels, predicated branches, global/local/param
//! memory, integer and float ALU forms, `setp`/`selp` and the `vprintf`
//! call sequence. Anything else fails the launch — an unsupported opcode in
//! a template should be loud, not silently wrong.
//!
//! Execution emulates a 1×1 launch geometry: `%ntid` and `%nctaid` read as
//! one, so the kernel's own grid-stride loop walks every lane serially.

use std::fmt::Write as _;

use ptx_trace::backend::BackendError;
use rustc_hash::FxHashMap;

use crate::mem::DeviceMemory;

const MAX_STEPS: u64 = 50_000_000;

fn launch_error(msg: impl Into<String>) -> BackendError {
    BackendError::Launch(msg.into().into_boxed_str())
}

#[derive(Clone, Debug)]
enum MemBase {
    Reg(String),
    Sym(String),
}

#[derive(Clone, Debug)]
enum Operand {
    Reg(String),
    Imm(i64),
    /// Raw bits of a `0f`/`0d` float immediate.
    Bits(u64),
    Sym(String),
    Mem { base: MemBase, offset: u64 },
    /// Parenthesized name list, as in the `vprintf` call sequence.
    Group(Vec<String>),
}

#[derive(Clone, Debug)]
struct Instr {
    guard: Option<(String, bool)>,
    op: String,
    operands: Vec<Operand>,
}

#[derive(Debug, Default)]
struct Program {
    instrs: Vec<Instr>,
    labels: FxHashMap<String, usize>,
    globals: Vec<(String, Vec<u8>)>,
    locals: Vec<(String, usize)>,
}

fn parse(ptx: &str) -> Result<Program, BackendError> {
    let mut program = Program::default();
    for raw_line in ptx.lines() {
        let line = raw_line.trim();
        if line.is_empty()
            || line.starts_with("//")
            || line.starts_with('{')
            || line.starts_with('}')
            || line.starts_with(')')
        {
            continue;
        }
        if let Some(label) = line.strip_suffix(':')
            && !label.contains(' ')
        {
            program
                .labels
                .insert(label.to_owned(), program.instrs.len());
            continue;
        }
        if line.starts_with('.') {
            parse_directive(line, &mut program)?;
            continue;
        }
        program.instrs.push(parse_instr(line)?);
    }
    Ok(program)
}

/// Declarations with storage: initialized `.global` arrays and `.local`
/// buffers. Everything else (`.version`, `.reg`, `.param`, ...) is layout.
fn parse_directive(line: &str, program: &mut Program) -> Result<(), BackendError> {
    if line.starts_with(".global") && line.contains('=') {
        let name = directive_name(line)?;
        let open = line.find('{').ok_or_else(|| launch_error("malformed .global"))?;
        let close = line.rfind('}').ok_or_else(|| launch_error("malformed .global"))?;
        let mut bytes = Vec::new();
        for piece in line[open + 1..close].split(',') {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            let b: u8 = piece
                .parse()
                .map_err(|_| launch_error("malformed .global initializer"))?;
            bytes.push(b);
        }
        program.globals.push((name, bytes));
    } else if line.starts_with(".local") {
        let name = directive_name(line)?;
        let open = line.find('[').ok_or_else(|| launch_error("malformed .local"))?;
        let close = line.find(']').ok_or_else(|| launch_error("malformed .local"))?;
        let size: usize = line[open + 1..close]
            .parse()
            .map_err(|_| launch_error("malformed .local size"))?;
        program.locals.push((name, size));
    }
    Ok(())
}

/// The identifier ahead of the `[size]` suffix in a storage declaration.
fn directive_name(line: &str) -> Result<String, BackendError> {
    let open = line
        .find('[')
        .ok_or_else(|| launch_error("malformed declaration"))?;
    let head = &line[..open];
    head.rsplit(char::is_whitespace)
        .next()
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| launch_error("malformed declaration"))
}

fn parse_instr(line: &str) -> Result<Instr, BackendError> {
    let mut rest = line.trim_end_matches(';').trim();
    let mut guard = None;
    if let Some(guarded) = rest.strip_prefix('@') {
        let (g, tail) = guarded
            .split_once(char::is_whitespace)
            .ok_or_else(|| launch_error("dangling guard"))?;
        let (negated, reg) = match g.strip_prefix('!') {
            Some(reg) => (true, reg),
            None => (false, g),
        };
        guard = Some((reg.to_owned(), negated));
        rest = tail.trim();
    }

    let (op, tail) = match rest.split_once(char::is_whitespace) {
        Some((op, tail)) => (op, tail.trim()),
        None => (rest, ""),
    };

    let mut operands = Vec::new();
    for piece in split_top_level(tail) {
        operands.push(parse_operand(&piece)?);
    }
    Ok(Instr {
        guard,
        op: op.to_owned(),
        operands,
    })
}

/// Splits on commas outside brackets and parens.
fn split_top_level(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0_i32;
    let mut current = String::new();
    for c in s.chars() {
        match c {
            '[' | '(' => {
                depth += 1;
                current.push(c);
            }
            ']' | ')' => {
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 => {
                if !current.trim().is_empty() {
                    out.push(current.trim().to_owned());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        out.push(current.trim().to_owned());
    }
    out
}

fn parse_operand(piece: &str) -> Result<Operand, BackendError> {
    if let Some(inner) = piece.strip_prefix('[').and_then(|p| p.strip_suffix(']')) {
        let (base, offset) = match inner.split_once('+') {
            Some((base, off)) => {
                let offset: u64 = off
                    .trim()
                    .parse()
                    .map_err(|_| launch_error("malformed address offset"))?;
                (base.trim(), offset)
            }
            None => (inner.trim(), 0),
        };
        let base = if base.starts_with('%') {
            MemBase::Reg(base.to_owned())
        } else {
            MemBase::Sym(base.to_owned())
        };
        return Ok(Operand::Mem { base, offset });
    }
    if let Some(inner) = piece.strip_prefix('(').and_then(|p| p.strip_suffix(')')) {
        return Ok(Operand::Group(
            inner.split(',').map(|n| n.trim().to_owned()).collect(),
        ));
    }
    if piece.starts_with('%') {
        return Ok(Operand::Reg(piece.to_owned()));
    }
    if let Some(hex) = piece.strip_prefix("0f").or_else(|| piece.strip_prefix("0F")) {
        let bits = u32::from_str_radix(hex, 16)
            .map_err(|_| launch_error("malformed f32 immediate"))?;
        return Ok(Operand::Bits(u64::from(bits)));
    }
    if let Some(hex) = piece.strip_prefix("0d").or_else(|| piece.strip_prefix("0D")) {
        let bits = u64::from_str_radix(hex, 16)
            .map_err(|_| launch_error("malformed f64 immediate"))?;
        return Ok(Operand::Bits(bits));
    }
    if let Some(hex) = piece.strip_prefix("0x") {
        let v = i64::from_str_radix(hex, 16).map_err(|_| launch_error("malformed immediate"))?;
        return Ok(Operand::Imm(v));
    }
    if piece.starts_with('-') || piece.starts_with(|c: char| c.is_ascii_digit()) {
        let v: i64 = piece
            .parse()
            .map_err(|_| launch_error("malformed immediate"))?;
        return Ok(Operand::Imm(v));
    }
    Ok(Operand::Sym(piece.to_owned()))
}

fn width_of(ty: &str) -> Result<u32, BackendError> {
    match ty {
        "s8" | "u8" | "b8" => Ok(8),
        "s16" | "u16" | "b16" | "f16" => Ok(16),
        "s32" | "u32" | "b32" | "f32" => Ok(32),
        "s64" | "u64" | "b64" | "f64" => Ok(64),
        "pred" => Ok(1),
        other => Err(launch_error(format!("unsupported type suffix {other}"))),
    }
}

fn is_float(ty: &str) -> bool {
    matches!(ty, "f32" | "f64")
}

fn is_signed(ty: &str) -> bool {
    matches!(ty, "s8" | "s16" | "s32" | "s64")
}

fn mask(bits: u64, width: u32) -> u64 {
    if width >= 64 {
        bits
    } else {
        bits & ((1_u64 << width) - 1)
    }
}

fn sext(bits: u64, width: u32) -> i64 {
    let shift = 64 - width;
    ((mask(bits, width) << shift) as i64) >> shift
}

fn to_f(ty: &str, bits: u64) -> Result<f64, BackendError> {
    match ty {
        "f32" => Ok(f64::from(f32::from_bits(bits as u32))),
        "f64" => Ok(f64::from_bits(bits)),
        other => Err(launch_error(format!("no float interpretation of {other}"))),
    }
}

fn from_f(ty: &str, value: f64) -> Result<u64, BackendError> {
    match ty {
        "f32" => Ok(u64::from((value as f32).to_bits())),
        "f64" => Ok(value.to_bits()),
        other => Err(launch_error(format!("no float interpretation of {other}"))),
    }
}

struct Machine<'m> {
    regs: FxHashMap<String, u64>,
    params: FxHashMap<String, u64>,
    symbols: FxHashMap<String, u64>,
    mem: &'m mut DeviceMemory,
    output: &'m mut Vec<String>,
}

impl Machine<'_> {
    fn value(&self, op: &Operand) -> Result<u64, BackendError> {
        match op {
            Operand::Reg(name) => match name.as_str() {
                "%tid.x" | "%tid.y" | "%tid.z" | "%ctaid.x" | "%ctaid.y" | "%ctaid.z" => Ok(0),
                "%ntid.x" | "%ntid.y" | "%ntid.z" | "%nctaid.x" | "%nctaid.y" | "%nctaid.z" => {
                    Ok(1)
                }
                _ => Ok(self.regs.get(name).copied().unwrap_or(0)),
            },
            Operand::Imm(v) => Ok(*v as u64),
            Operand::Bits(b) => Ok(*b),
            Operand::Sym(name) => self
                .symbols
                .get(name)
                .copied()
                .ok_or_else(|| launch_error(format!("unknown symbol {name}"))),
            _ => Err(launch_error("operand has no scalar value")),
        }
    }

    fn write(&mut self, op: &Operand, value: u64) -> Result<(), BackendError> {
        let Operand::Reg(name) = op else {
            return Err(launch_error("destination is not a register"));
        };
        self.regs.insert(name.clone(), value);
        Ok(())
    }

    fn address(&self, base: &MemBase, offset: u64) -> Result<u64, BackendError> {
        let base = match base {
            MemBase::Reg(name) => self.regs.get(name).copied().unwrap_or(0),
            MemBase::Sym(name) => self
                .symbols
                .get(name)
                .copied()
                .ok_or_else(|| launch_error(format!("unknown symbol {name}")))?,
        };
        Ok(base + offset)
    }

    fn operand(op: Option<&Operand>) -> Result<&Operand, BackendError> {
        op.ok_or_else(|| launch_error("missing operand"))
    }

    /// Executes one instruction; returns the next pc, or `None` on `ret`.
    fn step(
        &mut self,
        instr: &Instr,
        pc: usize,
        labels: &FxHashMap<String, usize>,
    ) -> Result<Option<usize>, BackendError> {
        if let Some((reg, negated)) = &instr.guard {
            let set = self.regs.get(reg).copied().unwrap_or(0) != 0;
            if set == *negated {
                return Ok(Some(pc + 1));
            }
        }

        let parts: Vec<&str> = instr.op.split('.').collect();
        let ops = &instr.operands;
        match parts[0] {
            "ret" => return Ok(None),
            "bra" => {
                let Operand::Sym(target) = Self::operand(ops.first())? else {
                    return Err(launch_error("branch target is not a label"));
                };
                let next = labels
                    .get(target)
                    .ok_or_else(|| launch_error(format!("unknown label {target}")))?;
                return Ok(Some(*next));
            }
            "call" => {
                self.call_vprintf(ops)?;
                return Ok(Some(pc + 1));
            }
            _ => {}
        }

        let ty = *parts
            .last()
            .ok_or_else(|| launch_error("opcode without type"))?;
        match parts[0] {
            "mov" => {
                let v = self.value(Self::operand(ops.get(1))?)?;
                self.write(Self::operand(ops.first())?, v)?;
            }
            "ld" => {
                let Operand::Mem { base, offset } = Self::operand(ops.get(1))? else {
                    return Err(launch_error("ld source is not an address"));
                };
                let value = if parts.get(1) == Some(&"param") {
                    let MemBase::Sym(name) = base else {
                        return Err(launch_error("ld.param source is not a name"));
                    };
                    self.params
                        .get(name)
                        .copied()
                        .ok_or_else(|| launch_error(format!("unknown parameter {name}")))?
                } else {
                    let width = width_of(ty)?;
                    let addr = self.address(base, *offset)?;
                    let mut bytes = [0_u8; 8];
                    let len = (width / 8) as usize;
                    self.mem.read(addr, &mut bytes[..len])?;
                    let raw = u64::from_le_bytes(bytes);
                    if is_signed(ty) {
                        sext(raw, width) as u64
                    } else {
                        raw
                    }
                };
                self.write(Self::operand(ops.first())?, value)?;
            }
            "st" => {
                let Operand::Mem { base, offset } = Self::operand(ops.first())? else {
                    return Err(launch_error("st destination is not an address"));
                };
                let value = self.value(Self::operand(ops.get(1))?)?;
                if parts.get(1) == Some(&"param") {
                    let MemBase::Sym(name) = base else {
                        return Err(launch_error("st.param destination is not a name"));
                    };
                    self.params.insert(name.clone(), value);
                } else {
                    let width = width_of(ty)?;
                    let addr = self.address(base, *offset)?;
                    let bytes = value.to_le_bytes();
                    self.mem.write(addr, &bytes[..(width / 8) as usize])?;
                }
            }
            "cvta" => {
                // Address-space casts are the identity in a flat space.
                let v = self.value(Self::operand(ops.get(1))?)?;
                self.write(Self::operand(ops.first())?, v)?;
            }
            "cvt" => {
                let (dst_ty, src_ty) = cvt_types(&parts)?;
                let raw = self.value(Self::operand(ops.get(1))?)?;
                let out = convert(&parts, dst_ty, src_ty, raw)?;
                self.write(Self::operand(ops.first())?, out)?;
            }
            "setp" => {
                let cmp = *parts
                    .get(1)
                    .ok_or_else(|| launch_error("setp without comparison"))?;
                let a = self.value(Self::operand(ops.get(1))?)?;
                let b = self.value(Self::operand(ops.get(2))?)?;
                let result = compare(cmp, ty, a, b)?;
                self.write(Self::operand(ops.first())?, u64::from(result))?;
            }
            "selp" => {
                let a = self.value(Self::operand(ops.get(1))?)?;
                let b = self.value(Self::operand(ops.get(2))?)?;
                let p = self.value(Self::operand(ops.get(3))?)?;
                self.write(Self::operand(ops.first())?, if p != 0 { a } else { b })?;
            }
            "neg" | "abs" | "not" | "rcp" | "sqrt" | "rsqrt" => {
                let a = self.value(Self::operand(ops.get(1))?)?;
                let out = unary(parts[0], ty, a)?;
                self.write(Self::operand(ops.first())?, out)?;
            }
            "add" | "sub" | "mul" | "div" | "rem" | "min" | "max" | "and" | "or" | "xor"
            | "shl" | "shr" => {
                let a = self.value(Self::operand(ops.get(1))?)?;
                let b = self.value(Self::operand(ops.get(2))?)?;
                let wide = parts.contains(&"wide");
                let out = binary(parts[0], ty, a, b, wide)?;
                self.write(Self::operand(ops.first())?, out)?;
            }
            "mad" | "fma" => {
                let a = self.value(Self::operand(ops.get(1))?)?;
                let b = self.value(Self::operand(ops.get(2))?)?;
                let c = self.value(Self::operand(ops.get(3))?)?;
                let out = if is_float(ty) {
                    from_f(ty, to_f(ty, a)?.mul_add(to_f(ty, b)?, to_f(ty, c)?))?
                } else {
                    let width = if parts.contains(&"wide") {
                        width_of(ty)? * 2
                    } else {
                        width_of(ty)?
                    };
                    let product = sext(a, width_of(ty)?)
                        .wrapping_mul(sext(b, width_of(ty)?))
                        .wrapping_add(c as i64);
                    mask(product as u64, width)
                };
                self.write(Self::operand(ops.first())?, out)?;
            }
            other => {
                return Err(launch_error(format!("unsupported instruction {other}")));
            }
        }
        Ok(Some(pc + 1))
    }

    fn call_vprintf(&mut self, ops: &[Operand]) -> Result<(), BackendError> {
        let Some(Operand::Sym(callee)) = ops.get(1) else {
            return Err(launch_error("indirect calls are not supported"));
        };
        if callee != "vprintf" {
            return Err(launch_error(format!("unknown callee {callee}")));
        }
        let Some(Operand::Group(args)) = ops.get(2) else {
            return Err(launch_error("malformed call argument list"));
        };
        let fmt = self.call_param(args.first())?;
        let buf = self.call_param(args.get(1))?;
        let line = format_vprintf(self.mem, fmt, buf)?;
        self.output.push(line);
        Ok(())
    }

    fn call_param(&self, name: Option<&String>) -> Result<u64, BackendError> {
        let name = name.ok_or_else(|| launch_error("missing call parameter"))?;
        self.params
            .get(name)
            .copied()
            .ok_or_else(|| launch_error(format!("unbound call parameter {name}")))
    }
}

fn cvt_types<'a>(parts: &[&'a str]) -> Result<(&'a str, &'a str), BackendError> {
    let tys: Vec<&str> = parts[1..]
        .iter()
        .copied()
        .filter(|p| width_of(p).is_ok())
        .collect();
    match tys.as_slice() {
        [dst, src] => Ok((dst, src)),
        _ => Err(launch_error("malformed cvt")),
    }
}

fn convert(parts: &[&str], dst: &str, src: &str, raw: u64) -> Result<u64, BackendError> {
    if src == "f16" || dst == "f16" {
        return Err(launch_error("f16 conversions are not emulated"));
    }
    if is_float(src) {
        let f = to_f(src, raw)?;
        if is_float(dst) {
            return from_f(dst, f);
        }
        // Float-to-int honors the rni (round-to-nearest) modifier;
        // everything else truncates toward zero like rzi.
        let rounded = if parts.contains(&"rni") { f.round() } else { f.trunc() };
        let width = width_of(dst)?;
        return Ok(mask(rounded as i64 as u64, width));
    }
    let value = if is_signed(src) {
        sext(raw, width_of(src)?) as u64
    } else {
        mask(raw, width_of(src)?)
    };
    if is_float(dst) {
        let f = if is_signed(src) {
            value as i64 as f64
        } else {
            value as f64
        };
        return from_f(dst, f);
    }
    // Integer-to-integer: the extension was decided by the source type
    // above; the destination only narrows.
    Ok(mask(value, width_of(dst)?))
}

fn compare(cmp: &str, ty: &str, a: u64, b: u64) -> Result<bool, BackendError> {
    use core::cmp::Ordering;
    let ordering = if is_float(ty) {
        to_f(ty, a)?.partial_cmp(&to_f(ty, b)?)
    } else if is_signed(ty) {
        let w = width_of(ty)?;
        Some(sext(a, w).cmp(&sext(b, w)))
    } else {
        let w = width_of(ty)?;
        Some(mask(a, w).cmp(&mask(b, w)))
    };
    let Some(ordering) = ordering else {
        // Unordered (NaN) compares false for everything but `ne`.
        return Ok(cmp == "ne");
    };
    Ok(match cmp {
        "eq" => ordering == Ordering::Equal,
        "ne" => ordering != Ordering::Equal,
        "lt" => ordering == Ordering::Less,
        "le" => ordering != Ordering::Greater,
        "gt" => ordering == Ordering::Greater,
        "ge" => ordering != Ordering::Less,
        other => return Err(launch_error(format!("unsupported comparison {other}"))),
    })
}

fn unary(op: &str, ty: &str, a: u64) -> Result<u64, BackendError> {
    let width = width_of(ty)?;
    if is_float(ty) {
        let x = to_f(ty, a)?;
        let r = match op {
            "neg" => -x,
            "abs" => x.abs(),
            "rcp" => x.recip(),
            "sqrt" => x.sqrt(),
            "rsqrt" => x.sqrt().recip(),
            _ => return Err(launch_error(format!("unsupported float unary {op}"))),
        };
        return from_f(ty, r);
    }
    Ok(match op {
        "neg" => mask((sext(a, width).wrapping_neg()) as u64, width),
        "abs" => mask(sext(a, width).wrapping_abs() as u64, width),
        "not" => {
            if ty == "pred" {
                u64::from(a == 0)
            } else {
                mask(!a, width)
            }
        }
        _ => return Err(launch_error(format!("unsupported integer unary {op}"))),
    })
}

fn binary(op: &str, ty: &str, a: u64, b: u64, wide: bool) -> Result<u64, BackendError> {
    if is_float(ty) {
        let x = to_f(ty, a)?;
        let y = to_f(ty, b)?;
        let r = match op {
            "add" => x + y,
            "sub" => x - y,
            "mul" => x * y,
            "div" => x / y,
            "min" => x.min(y),
            "max" => x.max(y),
            _ => return Err(launch_error(format!("unsupported float op {op}"))),
        };
        return from_f(ty, r);
    }

    let width = width_of(ty)?;
    if ty == "pred" {
        return Ok(match op {
            "and" => u64::from(a != 0 && b != 0),
            "or" => u64::from(a != 0 || b != 0),
            "xor" => u64::from((a != 0) != (b != 0)),
            _ => return Err(launch_error(format!("unsupported predicate op {op}"))),
        });
    }

    let out_width = if wide { width * 2 } else { width };
    let (sa, sb) = (sext(a, width), sext(b, width));
    let (ua, ub) = (mask(a, width), mask(b, width));
    let signed = is_signed(ty);
    let r = match op {
        "add" => sa.wrapping_add(sb) as u64,
        "sub" => sa.wrapping_sub(sb) as u64,
        "mul" => {
            if signed {
                sa.wrapping_mul(sb) as u64
            } else {
                ua.wrapping_mul(ub)
            }
        }
        "div" => {
            if signed {
                sa.checked_div(sb).unwrap_or(0) as u64
            } else {
                ua.checked_div(ub).unwrap_or(0)
            }
        }
        "rem" => {
            if signed {
                sa.checked_rem(sb).unwrap_or(0) as u64
            } else {
                ua.checked_rem(ub).unwrap_or(0)
            }
        }
        "min" => {
            if signed {
                sa.min(sb) as u64
            } else {
                ua.min(ub)
            }
        }
        "max" => {
            if signed {
                sa.max(sb) as u64
            } else {
                ua.max(ub)
            }
        }
        "and" => ua & ub,
        "or" => ua | ub,
        "xor" => ua ^ ub,
        "shl" => ua.wrapping_shl(ub as u32),
        "shr" => {
            if signed {
                (sa.wrapping_shr(ub as u32)) as u64
            } else {
                ua.wrapping_shr(ub as u32)
            }
        }
        _ => return Err(launch_error(format!("unsupported integer op {op}"))),
    };
    Ok(mask(r, out_width))
}

/// Formats one `vprintf` call: reads the C string at `fmt`, pulling
/// conversions from the 8-byte argument slots at `buf`.
fn format_vprintf(mem: &DeviceMemory, fmt: u64, buf: u64) -> Result<String, BackendError> {
    let fmt = mem.read_cstr(fmt)?;
    let fmt = String::from_utf8_lossy(&fmt).into_owned();
    let mut out = String::new();
    let mut slot = 0_u64;
    let mut chars = fmt.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        // Flags, width, precision.
        while matches!(chars.peek(), Some(n) if n.is_ascii_digit() || "-+ #.".contains(*n)) {
            chars.next();
        }
        let mut longs = 0_u32;
        while matches!(chars.peek(), Some('l' | 'h')) {
            if chars.next() == Some('l') {
                longs += 1;
            }
        }
        let conv = chars
            .next()
            .ok_or_else(|| launch_error("dangling % in format string"))?;
        if conv == '%' {
            out.push('%');
            continue;
        }

        let mut bytes = [0_u8; 8];
        mem.read(buf + slot * 8, &mut bytes)?;
        slot += 1;
        let raw = u64::from_le_bytes(bytes);
        match conv {
            'd' | 'i' => {
                let v = if longs > 0 { raw as i64 } else { i64::from(raw as i32) };
                let _ = write!(out, "{v}");
            }
            'u' => {
                let v = if longs > 0 { raw } else { u64::from(raw as u32) };
                let _ = write!(out, "{v}");
            }
            'x' => {
                let v = if longs > 0 { raw } else { u64::from(raw as u32) };
                let _ = write!(out, "{v:x}");
            }
            'f' | 'F' | 'e' | 'g' => {
                let _ = write!(out, "{:.6}", f64::from_bits(raw));
            }
            'c' => out.push(char::from(raw as u8)),
            's' => {
                let s = mem.read_cstr(raw)?;
                out.push_str(&String::from_utf8_lossy(&s));
            }
            other => {
                return Err(launch_error(format!("unsupported conversion %{other}")));
            }
        }
    }
    Ok(out)
}

/// Parses and runs one kernel launch over `size` lanes.
pub(crate) fn run_kernel(
    mem: &mut DeviceMemory,
    output: &mut Vec<String>,
    ptx: &str,
    entry: &str,
    args: &[u64],
    size: u32,
) -> Result<(), BackendError> {
    if !ptx.contains(&format!(".entry {entry}(")) {
        return Err(launch_error(format!("entry point {entry} not found")));
    }
    let program = parse(ptx)?;

    // Launch-scoped storage: declared globals/locals plus the argument
    // table the kernel indexes through its first parameter.
    let mut temps: Vec<u64> = Vec::new();
    let mut symbols = FxHashMap::default();
    for (name, bytes) in &program.globals {
        let addr = mem.alloc(bytes.len());
        mem.write(addr, bytes)?;
        symbols.insert(name.clone(), addr);
        temps.push(addr);
    }
    for (name, bytes) in &program.locals {
        let addr = mem.alloc(*bytes);
        symbols.insert(name.clone(), addr);
        temps.push(addr);
    }
    let table = mem.alloc(args.len().max(1) * 8);
    temps.push(table);
    for (i, arg) in args.iter().enumerate() {
        mem.write(table + u64::try_from(i * 8).unwrap_or(0), &arg.to_le_bytes())?;
    }

    let mut params = FxHashMap::default();
    params.insert("ptr".to_owned(), table);
    params.insert("size".to_owned(), u64::from(size));

    let mut machine = Machine {
        regs: FxHashMap::default(),
        params,
        symbols,
        mem,
        output,
    };

    let mut pc = 0_usize;
    let mut steps = 0_u64;
    let result = loop {
        if pc >= program.instrs.len() {
            break Ok(());
        }
        steps += 1;
        if steps > MAX_STEPS {
            break Err(launch_error("instruction budget exhausted"));
        }
        match machine.step(&program.instrs[pc], pc, &program.labels) {
            Ok(Some(next)) => pc = next,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    for addr in temps {
        let _ = machine.mem.free(addr);
    }
    result
}
