// Copyright 2026 the PTX Trace Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Hermetic [`Backend`] for `ptx_trace`: an interpreter for the PTX subset
//! the tracer emits.
//!
//! Kernels run on host memory, one emulated thread walking every lane
//! through the kernel's own grid-stride loop. Device `vprintf` calls are
//! captured as formatted lines instead of going to a console, which lets
//! tests assert on side-effect output.
//!
//! ```
//! use ptx_trace::{Trace, VarType};
//! use ptx_trace_emulator::Emulator;
//!
//! let mut t = Trace::new(Emulator::new());
//! let ptr = t.managed_alloc(16)?;
//! t.backend_mut().write_f32(ptr, &[1.0, 2.0, 3.0, 4.0])?;
//! let a = t.register_input(VarType::F32, 4, ptr, None, true)?;
//! let r = t.append1(VarType::F32, "add.f32 $r1, $r2, $r2", a)?;
//! t.evaluate()?;
//!
//! let mut out = [0_u8; 4];
//! t.fetch_element(r, 3, &mut out)?;
//! assert_eq!(f32::from_le_bytes(out), 8.0);
//! # Ok::<(), ptx_trace::TraceError>(())
//! ```

mod interp;
mod mem;

use ptx_trace::backend::{Backend, BackendError, DevicePtr};

use crate::mem::DeviceMemory;

/// In-process device: host-backed memory plus a PTX interpreter.
#[derive(Debug, Default)]
pub struct Emulator {
    mem: DeviceMemory,
    printed: Vec<String>,
    launches: usize,
    last_kernel: Option<String>,
}

impl Emulator {
    /// Creates an emulator with empty memory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines captured from device `vprintf` calls, in execution order.
    #[must_use]
    pub fn printed(&self) -> &[String] {
        &self.printed
    }

    /// Takes the captured `vprintf` output, leaving the buffer empty.
    pub fn take_printed(&mut self) -> Vec<String> {
        std::mem::take(&mut self.printed)
    }

    /// Number of kernels launched so far.
    #[must_use]
    pub fn launches(&self) -> usize {
        self.launches
    }

    /// PTX of the most recent launch, for listing-level assertions.
    #[must_use]
    pub fn last_kernel(&self) -> Option<&str> {
        self.last_kernel.as_deref()
    }

    /// Convenience: writes a host `f32` slice into device memory.
    pub fn write_f32(&mut self, dst: DevicePtr, values: &[f32]) -> Result<(), BackendError> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.copy_to_device(dst, &bytes)
    }

    /// Convenience: reads a host `f32` slice back out of device memory.
    pub fn read_f32(&mut self, src: DevicePtr, count: usize) -> Result<Vec<f32>, BackendError> {
        let mut bytes = vec![0_u8; count * 4];
        self.copy_to_host(src, &mut bytes)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

impl Backend for Emulator {
    fn alloc(&mut self, bytes: usize) -> Result<DevicePtr, BackendError> {
        Ok(DevicePtr(self.mem.alloc(bytes)))
    }

    fn free(&mut self, ptr: DevicePtr) -> Result<(), BackendError> {
        self.mem.free(ptr.0)
    }

    fn copy_to_device(&mut self, dst: DevicePtr, bytes: &[u8]) -> Result<(), BackendError> {
        self.mem.write(dst.0, bytes)
    }

    fn copy_to_host(&mut self, src: DevicePtr, out: &mut [u8]) -> Result<(), BackendError> {
        self.mem.read(src.0, out)
    }

    fn launch(
        &mut self,
        ptx: &str,
        entry: &str,
        args: &[DevicePtr],
        size: u32,
    ) -> Result<(), BackendError> {
        log::debug!("emulating {entry}: {} args over {size} lane(s)", args.len());
        let raw: Vec<u64> = args.iter().map(|p| p.0).collect();
        interp::run_kernel(&mut self.mem, &mut self.printed, ptx, entry, &raw, size)?;
        self.launches += 1;
        self.last_kernel = Some(ptx.to_owned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ptx_trace::{Trace, VarType};

    #[test]
    fn doubles_every_lane_end_to_end() {
        let mut t = Trace::new(Emulator::new());
        let ptr = t.managed_alloc(16).unwrap();
        t.backend_mut()
            .write_f32(ptr, &[1.0, 2.0, 3.0, 4.0])
            .unwrap();
        let a = t
            .register_input(VarType::F32, 4, ptr, None, true)
            .unwrap();
        let r = t
            .append1(VarType::F32, "add.f32 $r1, $r2, $r2", a)
            .unwrap();
        t.evaluate().unwrap();

        let out = t.device_ptr(r).unwrap();
        assert_eq!(
            t.backend_mut().read_f32(out, 4).unwrap(),
            vec![2.0, 4.0, 6.0, 8.0]
        );
    }

    #[test]
    fn fetch_element_reads_single_lanes() {
        let mut t = Trace::new(Emulator::new());
        let ptr = t.managed_alloc(16).unwrap();
        t.backend_mut()
            .write_f32(ptr, &[1.5, 2.5, 3.5, 4.5])
            .unwrap();
        let a = t
            .register_input(VarType::F32, 4, ptr, None, true)
            .unwrap();
        let r = t.append1(VarType::F32, "neg.f32 $r1, $r2", a).unwrap();

        let mut out = [0_u8; 4];
        t.fetch_element(r, 2, &mut out).unwrap();
        assert_eq!(f32::from_le_bytes(out), -3.5);
        assert_eq!(t.backend().launches(), 1, "fetch forced one evaluation");
    }

    #[test]
    fn printf_output_is_captured() {
        let mut t = Trace::new(Emulator::new());
        let s = t.append_printf("hello from the device\n", &[]).unwrap();
        t.dec_ref_external(s).unwrap();
        t.evaluate().unwrap();
        assert_eq!(
            t.backend().printed(),
            ["hello from the device\n".to_owned()]
        );
    }
}
