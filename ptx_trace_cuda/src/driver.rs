// Copyright 2026 the PTX Trace Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Runtime bindings to `libcuda` and the [`Backend`] implementation.

use std::ffi::{CString, c_char, c_int, c_uint, c_void};
use std::ptr;

use libloading::Library;
use ptx_trace::backend::{Backend, BackendError, DevicePtr};

type CUresult = c_int;
type CUdeviceptr = u64;
type Handle = *mut c_void;

// CUjit_option values consumed by the linker.
const CU_JIT_INFO_LOG_BUFFER: c_uint = 3;
const CU_JIT_INFO_LOG_BUFFER_SIZE_BYTES: c_uint = 4;
const CU_JIT_ERROR_LOG_BUFFER: c_uint = 5;
const CU_JIT_ERROR_LOG_BUFFER_SIZE_BYTES: c_uint = 6;
const CU_JIT_INPUT_PTX: c_uint = 1;
const CU_MEM_ATTACH_GLOBAL: c_uint = 1;

const LOG_BUFFER_BYTES: usize = 16 * 1024;
const BLOCKS: c_uint = 32;
const THREADS: c_uint = 128;

/// Resolved driver entry points. Field names match the driver's exported
/// symbols (versioned suffixes resolved at load time).
#[derive(Clone, Copy)]
struct Api {
    cu_init: unsafe extern "C" fn(c_uint) -> CUresult,
    cu_device_get: unsafe extern "C" fn(*mut c_int, c_int) -> CUresult,
    cu_ctx_create: unsafe extern "C" fn(*mut Handle, c_uint, c_int) -> CUresult,
    cu_ctx_destroy: unsafe extern "C" fn(Handle) -> CUresult,
    cu_ctx_synchronize: unsafe extern "C" fn() -> CUresult,
    cu_mem_alloc_managed: unsafe extern "C" fn(*mut CUdeviceptr, usize, c_uint) -> CUresult,
    cu_mem_free: unsafe extern "C" fn(CUdeviceptr) -> CUresult,
    cu_memcpy_htod: unsafe extern "C" fn(CUdeviceptr, *const c_void, usize) -> CUresult,
    cu_memcpy_dtoh: unsafe extern "C" fn(*mut c_void, CUdeviceptr, usize) -> CUresult,
    cu_link_create:
        unsafe extern "C" fn(c_uint, *mut c_uint, *mut *mut c_void, *mut Handle) -> CUresult,
    cu_link_add_data: unsafe extern "C" fn(
        Handle,
        c_uint,
        *mut c_void,
        usize,
        *const c_char,
        c_uint,
        *mut c_uint,
        *mut *mut c_void,
    ) -> CUresult,
    cu_link_complete: unsafe extern "C" fn(Handle, *mut *mut c_void, *mut usize) -> CUresult,
    cu_link_destroy: unsafe extern "C" fn(Handle) -> CUresult,
    cu_module_load_data: unsafe extern "C" fn(*mut Handle, *const c_void) -> CUresult,
    cu_module_get_function: unsafe extern "C" fn(*mut Handle, Handle, *const c_char) -> CUresult,
    cu_module_unload: unsafe extern "C" fn(Handle) -> CUresult,
    cu_launch_kernel: unsafe extern "C" fn(
        Handle,
        c_uint,
        c_uint,
        c_uint,
        c_uint,
        c_uint,
        c_uint,
        c_uint,
        Handle,
        *mut *mut c_void,
        *mut *mut c_void,
    ) -> CUresult,
}

impl std::fmt::Debug for Api {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Api").finish_non_exhaustive()
    }
}

fn unavailable(msg: impl Into<String>) -> BackendError {
    BackendError::Unavailable(msg.into().into_boxed_str())
}

fn check(code: CUresult, call: &'static str) -> Result<(), BackendError> {
    if code == 0 {
        Ok(())
    } else {
        Err(BackendError::Driver { call, code })
    }
}

macro_rules! resolve {
    ($lib:expr, $name:literal) => {
        *unsafe { $lib.get(concat!($name, "\0").as_bytes()) }
            .map_err(|e| unavailable(format!("missing driver symbol {}: {e}", $name)))?
    };
}

impl Api {
    fn load(lib: &Library) -> Result<Self, BackendError> {
        Ok(Self {
            cu_init: resolve!(lib, "cuInit"),
            cu_device_get: resolve!(lib, "cuDeviceGet"),
            cu_ctx_create: resolve!(lib, "cuCtxCreate_v2"),
            cu_ctx_destroy: resolve!(lib, "cuCtxDestroy_v2"),
            cu_ctx_synchronize: resolve!(lib, "cuCtxSynchronize"),
            cu_mem_alloc_managed: resolve!(lib, "cuMemAllocManaged"),
            cu_mem_free: resolve!(lib, "cuMemFree_v2"),
            cu_memcpy_htod: resolve!(lib, "cuMemcpyHtoD_v2"),
            cu_memcpy_dtoh: resolve!(lib, "cuMemcpyDtoH_v2"),
            cu_link_create: resolve!(lib, "cuLinkCreate_v2"),
            cu_link_add_data: resolve!(lib, "cuLinkAddData_v2"),
            cu_link_complete: resolve!(lib, "cuLinkComplete"),
            cu_link_destroy: resolve!(lib, "cuLinkDestroy"),
            cu_module_load_data: resolve!(lib, "cuModuleLoadData"),
            cu_module_get_function: resolve!(lib, "cuModuleGetFunction"),
            cu_module_unload: resolve!(lib, "cuModuleUnload"),
            cu_launch_kernel: resolve!(lib, "cuLaunchKernel"),
        })
    }
}

/// One driver context on one device.
#[derive(Debug)]
pub struct CudaDevice {
    api: Api,
    ctx: Handle,
    // Dropped last; the resolved function pointers borrow from it.
    _lib: Library,
}

impl CudaDevice {
    /// Binds the driver and creates a context on device 0.
    pub fn new() -> Result<Self, BackendError> {
        Self::with_device(0)
    }

    /// Binds the driver and creates a context on the given device ordinal.
    pub fn with_device(ordinal: i32) -> Result<Self, BackendError> {
        let lib = ["libcuda.so.1", "libcuda.so", "nvcuda.dll"]
            .iter()
            .find_map(|name| unsafe { Library::new(*name) }.ok())
            .ok_or_else(|| unavailable("no CUDA driver library found"))?;
        let api = Api::load(&lib)?;

        check(unsafe { (api.cu_init)(0) }, "cuInit")?;
        let mut device: c_int = 0;
        check(
            unsafe { (api.cu_device_get)(&raw mut device, ordinal) },
            "cuDeviceGet",
        )?;
        let mut ctx: Handle = ptr::null_mut();
        check(
            unsafe { (api.cu_ctx_create)(&raw mut ctx, 0, device) },
            "cuCtxCreate",
        )?;
        log::debug!("bound CUDA driver, context on device {ordinal}");
        Ok(Self {
            api,
            ctx,
            _lib: lib,
        })
    }

    /// Links `ptx` and loads the resulting module.
    ///
    /// The linker and its logs are launch-scoped; on failure the error log
    /// is reported verbatim.
    fn link_module(&self, ptx: &str) -> Result<Handle, BackendError> {
        let source = CString::new(ptx).map_err(|_| unavailable("PTX contains a NUL byte"))?;
        let name = c"enoki_kernel.ptx";

        let mut info_log = vec![0_u8; LOG_BUFFER_BYTES];
        let mut error_log = vec![0_u8; LOG_BUFFER_BYTES];
        let mut options = [
            CU_JIT_INFO_LOG_BUFFER,
            CU_JIT_INFO_LOG_BUFFER_SIZE_BYTES,
            CU_JIT_ERROR_LOG_BUFFER,
            CU_JIT_ERROR_LOG_BUFFER_SIZE_BYTES,
        ];
        let mut values = [
            info_log.as_mut_ptr().cast::<c_void>(),
            ptr::without_provenance_mut(LOG_BUFFER_BYTES),
            error_log.as_mut_ptr().cast::<c_void>(),
            ptr::without_provenance_mut(LOG_BUFFER_BYTES),
        ];

        let mut state: Handle = ptr::null_mut();
        check(
            unsafe {
                (self.api.cu_link_create)(
                    c_uint::try_from(options.len()).unwrap_or(0),
                    options.as_mut_ptr(),
                    values.as_mut_ptr(),
                    &raw mut state,
                )
            },
            "cuLinkCreate",
        )?;

        let added = unsafe {
            (self.api.cu_link_add_data)(
                state,
                CU_JIT_INPUT_PTX,
                source.as_ptr().cast_mut().cast::<c_void>(),
                source.as_bytes_with_nul().len(),
                name.as_ptr(),
                0,
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };
        if added != 0 {
            let log = read_log(&error_log);
            unsafe { (self.api.cu_link_destroy)(state) };
            return Err(BackendError::Link(log.into_boxed_str()));
        }

        let mut cubin: *mut c_void = ptr::null_mut();
        let mut cubin_size: usize = 0;
        let completed = unsafe {
            (self.api.cu_link_complete)(state, &raw mut cubin, &raw mut cubin_size)
        };
        if completed != 0 {
            let log = read_log(&error_log);
            unsafe { (self.api.cu_link_destroy)(state) };
            return Err(BackendError::Link(log.into_boxed_str()));
        }

        let info = read_log(&info_log);
        if !info.is_empty() {
            log::debug!("linker: {info}");
        }

        // The cubin buffer is owned by the linker; the module must load
        // before the linker is destroyed.
        let mut module: Handle = ptr::null_mut();
        let loaded = unsafe { (self.api.cu_module_load_data)(&raw mut module, cubin) };
        unsafe { (self.api.cu_link_destroy)(state) };
        check(loaded, "cuModuleLoadData")?;
        Ok(module)
    }
}

fn read_log(buffer: &[u8]) -> String {
    let end = buffer.iter().position(|&b| b == 0).unwrap_or(buffer.len());
    String::from_utf8_lossy(&buffer[..end]).into_owned()
}

impl Backend for CudaDevice {
    fn alloc(&mut self, bytes: usize) -> Result<DevicePtr, BackendError> {
        let mut ptr: CUdeviceptr = 0;
        let code = unsafe {
            (self.api.cu_mem_alloc_managed)(&raw mut ptr, bytes.max(1), CU_MEM_ATTACH_GLOBAL)
        };
        if code != 0 {
            return Err(BackendError::OutOfMemory { bytes });
        }
        Ok(DevicePtr(ptr))
    }

    fn free(&mut self, ptr: DevicePtr) -> Result<(), BackendError> {
        check(unsafe { (self.api.cu_mem_free)(ptr.0) }, "cuMemFree")
    }

    fn copy_to_device(&mut self, dst: DevicePtr, bytes: &[u8]) -> Result<(), BackendError> {
        check(
            unsafe { (self.api.cu_memcpy_htod)(dst.0, bytes.as_ptr().cast(), bytes.len()) },
            "cuMemcpyHtoD",
        )
    }

    fn copy_to_host(&mut self, src: DevicePtr, out: &mut [u8]) -> Result<(), BackendError> {
        check(
            unsafe { (self.api.cu_memcpy_dtoh)(out.as_mut_ptr().cast(), src.0, out.len()) },
            "cuMemcpyDtoH",
        )
    }

    fn launch(
        &mut self,
        ptx: &str,
        entry: &str,
        args: &[DevicePtr],
        size: u32,
    ) -> Result<(), BackendError> {
        let module = self.link_module(ptx)?;
        let result = (|| {
            let entry_name =
                CString::new(entry).map_err(|_| unavailable("entry name contains NUL"))?;
            let mut function: Handle = ptr::null_mut();
            check(
                unsafe {
                    (self.api.cu_module_get_function)(
                        &raw mut function,
                        module,
                        entry_name.as_ptr(),
                    )
                },
                "cuModuleGetFunction",
            )?;

            // Argument table: a device array of buffer addresses.
            let table = self.alloc(args.len().max(1) * 8)?;
            let table_result = (|| {
                let raw: Vec<u8> = args.iter().flat_map(|p| p.0.to_le_bytes()).collect();
                if !raw.is_empty() {
                    self.copy_to_device(table, &raw)?;
                }

                let mut ptr_param: CUdeviceptr = table.0;
                let mut size_param: c_uint = size;
                let mut params = [
                    (&raw mut ptr_param).cast::<c_void>(),
                    (&raw mut size_param).cast::<c_void>(),
                ];
                log::debug!(
                    "launching {entry}: {} argument(s), {size} lane(s), {BLOCKS}x{THREADS}",
                    args.len()
                );
                check(
                    unsafe {
                        (self.api.cu_launch_kernel)(
                            function,
                            BLOCKS,
                            1,
                            1,
                            THREADS,
                            1,
                            1,
                            0,
                            ptr::null_mut(),
                            params.as_mut_ptr(),
                            ptr::null_mut(),
                        )
                    },
                    "cuLaunchKernel",
                )?;
                check(unsafe { (self.api.cu_ctx_synchronize)() }, "cuCtxSynchronize")
            })();
            let freed = self.free(table);
            table_result.and(freed)
        })();
        let unloaded = check(
            unsafe { (self.api.cu_module_unload)(module) },
            "cuModuleUnload",
        );
        result.and(unloaded)
    }
}

impl Drop for CudaDevice {
    fn drop(&mut self) {
        let code = unsafe { (self.api.cu_ctx_destroy)(self.ctx) };
        if code != 0 {
            log::warn!("cuCtxDestroy failed: code {code}");
        }
    }
}
