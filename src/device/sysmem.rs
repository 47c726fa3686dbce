//! System-memory device runtime.
//!
//! Backs every device-side operation with page-aligned host memory. This is
//! what single-host deployments without GPUDirect use for staging, and what
//! the test suite runs the whole transport against. "IPC" handles are
//! process-local tokens resolved through a registry, which is sufficient
//! because attach always happens in the process that exported.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::ffi::c_void;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use once_cell::sync::Lazy;

use super::{
    DeviceAlloc, DeviceError, DeviceIpcHandle, DeviceRuntime, GdcAlloc, HostMappedAlloc,
    IpcMapping, DEVICE_IPC_HANDLE_SIZE,
};

const PAGE_SIZE: usize = 4096;
const IPC_MAGIC: [u8; 8] = *b"ccnetipc";

pub static SYSMEM_DEVICE: Lazy<SysmemDevice> = Lazy::new(SysmemDevice::new);

pub struct SysmemDevice {
    exported: Mutex<HashMap<u64, *mut c_void>>,
    next_export: AtomicU64,
    gdr: bool,
}

unsafe impl Send for SysmemDevice {}
unsafe impl Sync for SysmemDevice {}

impl SysmemDevice {
    pub fn new() -> Self {
        SysmemDevice {
            exported: Mutex::new(HashMap::new()),
            next_export: AtomicU64::new(1),
            gdr: false,
        }
    }

    /// A runtime that also reports GPU-direct-copy support, with GDC words
    /// backed by plain memory. Used to exercise the GDC sync/flush paths.
    pub fn with_gdr() -> Self {
        SysmemDevice {
            gdr: true,
            ..SysmemDevice::new()
        }
    }

    fn alloc_pages(&self, size: usize) -> Result<*mut c_void, DeviceError> {
        let layout = Layout::from_size_align(size.max(1), PAGE_SIZE)
            .map_err(|_| DeviceError::Alloc(size))?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(DeviceError::Alloc(size));
        }
        Ok(ptr as *mut c_void)
    }

    fn free_pages(&self, ptr: *mut c_void, size: usize) {
        if ptr.is_null() {
            return;
        }
        let layout = Layout::from_size_align(size.max(1), PAGE_SIZE).unwrap();
        unsafe { dealloc(ptr as *mut u8, layout) };
    }
}

impl Default for SysmemDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRuntime for SysmemDevice {
    fn current_device(&self) -> i32 {
        0
    }

    fn alloc_device(&'static self, size: usize) -> Result<DeviceAlloc, DeviceError> {
        let ptr = self.alloc_pages(size)?;
        Ok(DeviceAlloc::from_raw(ptr, size, self))
    }

    fn alloc_host_mapped(&'static self, size: usize) -> Result<HostMappedAlloc, DeviceError> {
        let ptr = self.alloc_pages(size)?;
        Ok(HostMappedAlloc::from_raw(ptr, ptr, size, self))
    }

    fn enable_peer_access(&self, _device: i32) -> Result<(), DeviceError> {
        Ok(())
    }

    fn ipc_export(&self, ptr: *mut c_void, _size: usize) -> Result<DeviceIpcHandle, DeviceError> {
        let id = self.next_export.fetch_add(1, Ordering::Relaxed);
        self.exported.lock().unwrap().insert(id, ptr);
        let mut bytes = [0u8; DEVICE_IPC_HANDLE_SIZE];
        bytes[..8].copy_from_slice(&IPC_MAGIC);
        bytes[8..16].copy_from_slice(&id.to_le_bytes());
        Ok(DeviceIpcHandle(bytes))
    }

    fn ipc_open(&'static self, handle: &DeviceIpcHandle) -> Result<IpcMapping, DeviceError> {
        if handle.0[..8] != IPC_MAGIC {
            return Err(DeviceError::InvalidIpcHandle);
        }
        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&handle.0[8..16]);
        let id = u64::from_le_bytes(id_bytes);
        let ptr = *self
            .exported
            .lock()
            .unwrap()
            .get(&id)
            .ok_or(DeviceError::InvalidIpcHandle)?;
        Ok(IpcMapping::from_raw(ptr, self))
    }

    fn gdr_available(&self) -> bool {
        self.gdr
    }

    fn alloc_gdc_words(&'static self, count: usize) -> Result<GdcAlloc, DeviceError> {
        if !self.gdr {
            return Err(DeviceError::NotSupported("GPU-direct-copy"));
        }
        let ptr = self.alloc_pages(count * std::mem::size_of::<u64>())? as *mut u64;
        Ok(GdcAlloc::from_raw(ptr, ptr, count, self))
    }

    fn dma_buf_supported(&self) -> bool {
        false
    }

    fn dma_buf_fd(&self, _ptr: *mut c_void, _size: usize) -> Result<RawFd, DeviceError> {
        Err(DeviceError::NotSupported("DMA-BUF export"))
    }

    fn free_device(&self, ptr: *mut c_void, size: usize) {
        self.free_pages(ptr, size);
    }

    fn free_host_mapped(&self, cpu_ptr: *mut c_void, size: usize) {
        self.free_pages(cpu_ptr, size);
    }

    fn free_gdc(&self, cpu_ptr: *mut u64, count: usize) {
        self.free_pages(cpu_ptr as *mut c_void, count * std::mem::size_of::<u64>());
    }

    fn ipc_close(&self, _ptr: *mut c_void) {}
}
