//! Device memory seam between the proxy transport and the GPU runtime.
//!
//! The transport never calls the GPU driver directly; it goes through a
//! [`DeviceRuntime`] so the engine can be exercised against system memory in
//! tests and against a real driver in deployment. Allocation wrappers carry
//! their runtime and release themselves on drop.

pub mod mapped_ptr;
pub mod ptr;
pub mod sysmem;

use std::ffi::c_void;
use std::fmt;
use std::os::fd::RawFd;

use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use thiserror::Error;

pub use sysmem::SYSMEM_DEVICE;

pub const DEVICE_IPC_HANDLE_SIZE: usize = 64;

/// Minimum alignment of a device allocation exported over IPC.
pub const DEVICE_IPC_MIN_SIZE: usize = 2 << 20;

/// Opaque device IPC handle, exchanged across the setup/connect RPC boundary.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIpcHandle(#[serde(with = "BigArray")] pub [u8; DEVICE_IPC_HANDLE_SIZE]);

impl fmt::Debug for DeviceIpcHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceIpcHandle({:02x?}..)", &self.0[..8])
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("allocation of {0} bytes failed")]
    Alloc(usize),
    #[error("invalid device IPC handle")]
    InvalidIpcHandle,
    #[error("failed to enable peer access to device {0}")]
    PeerAccess(i32),
    #[error("not supported by this device runtime: {0}")]
    NotSupported(&'static str),
}

/// The device-side operations the transport relies on. `&'static self`
/// receivers let the RAII wrappers keep a plain reference back to their
/// runtime.
pub trait DeviceRuntime: Send + Sync {
    fn current_device(&self) -> i32;

    fn alloc_device(&'static self, size: usize) -> Result<DeviceAlloc, DeviceError>;

    /// Pinned host memory mapped into the device address space.
    fn alloc_host_mapped(&'static self, size: usize) -> Result<HostMappedAlloc, DeviceError>;

    /// Tolerates peer access that is already enabled.
    fn enable_peer_access(&self, device: i32) -> Result<(), DeviceError>;

    fn ipc_export(&self, ptr: *mut c_void, size: usize) -> Result<DeviceIpcHandle, DeviceError>;

    fn ipc_open(&'static self, handle: &DeviceIpcHandle) -> Result<IpcMapping, DeviceError>;

    /// Whether low-latency GPU-direct-copy word mappings are available.
    fn gdr_available(&self) -> bool;

    /// Allocate `count` device-resident `u64` words with a CPU mapping.
    fn alloc_gdc_words(&'static self, count: usize) -> Result<GdcAlloc, DeviceError>;

    fn dma_buf_supported(&self) -> bool;

    /// Export a device range as a DMA-BUF file descriptor for NIC registration.
    fn dma_buf_fd(&self, ptr: *mut c_void, size: usize) -> Result<RawFd, DeviceError>;

    fn free_device(&self, ptr: *mut c_void, size: usize);
    fn free_host_mapped(&self, cpu_ptr: *mut c_void, size: usize);
    fn free_gdc(&self, cpu_ptr: *mut u64, count: usize);
    fn ipc_close(&self, ptr: *mut c_void);
}

pub struct DeviceAlloc {
    ptr: *mut c_void,
    size: usize,
    runtime: &'static dyn DeviceRuntime,
}

unsafe impl Send for DeviceAlloc {}
unsafe impl Sync for DeviceAlloc {}

impl DeviceAlloc {
    pub(crate) fn from_raw(
        ptr: *mut c_void,
        size: usize,
        runtime: &'static dyn DeviceRuntime,
    ) -> Self {
        DeviceAlloc { ptr, size, runtime }
    }

    #[must_use]
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr as *mut u8
    }

    #[must_use]
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for DeviceAlloc {
    fn drop(&mut self) {
        self.runtime.free_device(self.ptr, self.size);
    }
}

pub struct HostMappedAlloc {
    cpu_ptr: *mut c_void,
    gpu_ptr: *mut c_void,
    size: usize,
    runtime: &'static dyn DeviceRuntime,
}

unsafe impl Send for HostMappedAlloc {}
unsafe impl Sync for HostMappedAlloc {}

impl HostMappedAlloc {
    pub(crate) fn from_raw(
        cpu_ptr: *mut c_void,
        gpu_ptr: *mut c_void,
        size: usize,
        runtime: &'static dyn DeviceRuntime,
    ) -> Self {
        HostMappedAlloc {
            cpu_ptr,
            gpu_ptr,
            size,
            runtime,
        }
    }

    #[must_use]
    #[inline]
    pub fn as_ptr_host(&self) -> *mut u8 {
        self.cpu_ptr as *mut u8
    }

    #[must_use]
    #[inline]
    pub fn as_ptr_dev(&self) -> *mut u8 {
        self.gpu_ptr as *mut u8
    }

    #[must_use]
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for HostMappedAlloc {
    fn drop(&mut self) {
        self.runtime.free_host_mapped(self.cpu_ptr, self.size);
    }
}

/// GPU-direct-copy mapping of a few `u64` words: device-resident, with a
/// write-combined CPU view for low-latency flag updates.
pub struct GdcAlloc {
    cpu_ptr: *mut u64,
    gpu_ptr: *mut u64,
    count: usize,
    runtime: &'static dyn DeviceRuntime,
}

unsafe impl Send for GdcAlloc {}
unsafe impl Sync for GdcAlloc {}

impl GdcAlloc {
    pub(crate) fn from_raw(
        cpu_ptr: *mut u64,
        gpu_ptr: *mut u64,
        count: usize,
        runtime: &'static dyn DeviceRuntime,
    ) -> Self {
        GdcAlloc {
            cpu_ptr,
            gpu_ptr,
            count,
            runtime,
        }
    }

    #[inline]
    pub fn get_cpu_ptr(&self) -> *mut u64 {
        self.cpu_ptr
    }

    #[inline]
    pub fn get_gpu_ptr(&self) -> *mut u64 {
        self.gpu_ptr
    }

    #[inline]
    pub fn word_count(&self) -> usize {
        self.count
    }
}

impl Drop for GdcAlloc {
    fn drop(&mut self) {
        self.runtime.free_gdc(self.cpu_ptr, self.count);
    }
}

/// An opened device IPC mapping of a remote process' allocation.
pub struct IpcMapping {
    ptr: *mut c_void,
    runtime: &'static dyn DeviceRuntime,
}

unsafe impl Send for IpcMapping {}
unsafe impl Sync for IpcMapping {}

impl IpcMapping {
    pub(crate) fn from_raw(ptr: *mut c_void, runtime: &'static dyn DeviceRuntime) -> Self {
        IpcMapping { ptr, runtime }
    }

    #[must_use]
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr as *mut u8
    }
}

impl Drop for IpcMapping {
    fn drop(&mut self) {
        self.runtime.ipc_close(self.ptr);
    }
}
