// Copyright 2026 the PTX Trace Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Element-type registry.
//!
//! A pure mapping from the closed element-type tag set to the PTX encoding
//! of that type: byte size, type token (`f32`, `s64`, ...), binary-type
//! token (`b32`, ...), register-name prefix (`%f`, `%rd`, ...) and the
//! suffix used on global load/store paths.
//!
//! [`VarType::Bool`] computes in the `pred` register class but travels
//! through memory as an 8-bit integer; the emitter inserts `setp`/`selp`
//! conversions around its loads and stores. [`VarType::Pointer`] shares the
//! encoding of a 64-bit unsigned integer. [`VarType::Invalid`] yields
//! sentinel tokens and is only used for placeholder slots.

/// Element type of a traced variable.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum VarType {
    /// Signed 8-bit integer.
    I8,
    /// Unsigned 8-bit integer.
    U8,
    /// Signed 16-bit integer.
    I16,
    /// Unsigned 16-bit integer.
    U16,
    /// Signed 32-bit integer.
    I32,
    /// Unsigned 32-bit integer.
    U32,
    /// Signed 64-bit integer.
    I64,
    /// Unsigned 64-bit integer.
    U64,
    /// 16-bit float.
    F16,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
    /// Predicate; stored as `u8`, computed as `pred`.
    Bool,
    /// Device pointer; encoded as `u64`.
    Pointer,
    /// Placeholder sentinel.
    Invalid,
}

impl VarType {
    /// Size in bytes of one element in device memory.
    #[must_use]
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            Self::I8 | Self::U8 | Self::Bool => 1,
            Self::I16 | Self::U16 | Self::F16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 | Self::Pointer => 8,
            Self::Invalid => 0,
        }
    }

    /// PTX type token, substituted for `$t<i>` placeholders.
    #[must_use]
    #[inline]
    pub const fn ptx_type(self) -> &'static str {
        match self {
            Self::I8 => "s8",
            Self::U8 => "u8",
            Self::I16 => "s16",
            Self::U16 => "u16",
            Self::I32 => "s32",
            Self::U32 => "u32",
            Self::I64 => "s64",
            Self::U64 | Self::Pointer => "u64",
            Self::F16 => "f16",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::Bool => "pred",
            Self::Invalid => "???",
        }
    }

    /// PTX binary-type token, substituted for `$b<i>` placeholders.
    #[must_use]
    #[inline]
    pub const fn ptx_binary_type(self) -> &'static str {
        match self {
            Self::I8 | Self::U8 => "b8",
            Self::I16 | Self::U16 | Self::F16 => "b16",
            Self::I32 | Self::U32 | Self::F32 => "b32",
            Self::I64 | Self::U64 | Self::Pointer | Self::F64 => "b64",
            Self::Bool => "pred",
            Self::Invalid => "???",
        }
    }

    /// PTX register-name prefix, substituted (with the operand's assigned
    /// register index) for `$r<i>` placeholders.
    #[must_use]
    #[inline]
    pub const fn register_prefix(self) -> &'static str {
        match self {
            Self::I8 | Self::U8 => "%b",
            Self::I16 | Self::U16 => "%w",
            Self::I32 | Self::U32 => "%r",
            Self::I64 | Self::U64 | Self::Pointer => "%rd",
            Self::F16 => "%h",
            Self::F32 => "%f",
            Self::F64 => "%d",
            Self::Bool => "%p",
            Self::Invalid => "%u",
        }
    }

    /// Suffix used on `ld.global`/`st.global` for this type.
    ///
    /// `Bool` travels as `u8` and `F16` as raw 16-bit data; everything else
    /// loads and stores with its own type token.
    #[must_use]
    #[inline]
    pub const fn memory_suffix(self) -> &'static str {
        match self {
            Self::Bool => "u8",
            Self::F16 => "b16",
            other => other.ptx_type(),
        }
    }
}
