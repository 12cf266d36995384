// Copyright 2026 the PTX Trace Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Emulated device memory: a bump allocator over host-backed blocks.
//!
//! Addresses are plain integers in a private address space, so pointer
//! arithmetic performed inside kernels (lane scaling, interior offsets)
//! resolves the same way it would on a device. Failed resolutions map to
//! driver error 700 (`CUDA_ERROR_ILLEGAL_ADDRESS`) so misbehaving kernels
//! fail the way they would under the real driver.

use std::collections::BTreeMap;

use ptx_trace::backend::BackendError;

const BASE: u64 = 0x1_0000;
const ALIGN: u64 = 256;

pub(crate) fn illegal_address(call: &'static str) -> BackendError {
    BackendError::Driver { call, code: 700 }
}

#[derive(Debug)]
pub(crate) struct DeviceMemory {
    blocks: BTreeMap<u64, Vec<u8>>,
    next: u64,
}

impl Default for DeviceMemory {
    fn default() -> Self {
        Self {
            blocks: BTreeMap::new(),
            next: BASE,
        }
    }
}

impl DeviceMemory {
    pub(crate) fn alloc(&mut self, bytes: usize) -> u64 {
        let addr = self.next;
        self.blocks.insert(addr, vec![0; bytes.max(1)]);
        let span = u64::try_from(bytes.max(1)).unwrap_or(u64::MAX);
        self.next = (addr + span).next_multiple_of(ALIGN);
        addr
    }

    /// Releases a block; `addr` must be a base address from [`alloc`].
    ///
    /// [`alloc`]: DeviceMemory::alloc
    pub(crate) fn free(&mut self, addr: u64) -> Result<(), BackendError> {
        self.blocks
            .remove(&addr)
            .map(|_| ())
            .ok_or(illegal_address("cuMemFree"))
    }

    /// Maps an address (possibly interior) to its block and offset.
    fn resolve(&self, addr: u64, len: usize) -> Result<(u64, usize), BackendError> {
        let (&base, block) = self
            .blocks
            .range(..=addr)
            .next_back()
            .ok_or(illegal_address("resolve"))?;
        let offset = usize::try_from(addr - base).map_err(|_| illegal_address("resolve"))?;
        if offset + len > block.len() {
            return Err(illegal_address("resolve"));
        }
        Ok((base, offset))
    }

    pub(crate) fn read(&self, addr: u64, out: &mut [u8]) -> Result<(), BackendError> {
        let (base, offset) = self.resolve(addr, out.len())?;
        let block = &self.blocks[&base];
        out.copy_from_slice(&block[offset..offset + out.len()]);
        Ok(())
    }

    pub(crate) fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), BackendError> {
        let (base, offset) = self.resolve(addr, data.len())?;
        let block = self.blocks.get_mut(&base).ok_or(illegal_address("write"))?;
        block[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Reads a NUL-terminated byte string starting at `addr`.
    pub(crate) fn read_cstr(&self, addr: u64) -> Result<Vec<u8>, BackendError> {
        let (base, mut offset) = self.resolve(addr, 1)?;
        let block = &self.blocks[&base];
        let mut out = Vec::new();
        while offset < block.len() {
            let b = block[offset];
            if b == 0 {
                return Ok(out);
            }
            out.push(b);
            offset += 1;
        }
        Err(illegal_address("read_cstr"))
    }
}
