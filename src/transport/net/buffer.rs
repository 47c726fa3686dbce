//! The connect-time resource map: a compact descriptor of up to five memory
//! banks plus tagged offsets into them, built by the proxy during connect and
//! shipped to the kernel side, which resolves the same offsets against its
//! own mappings of the banks.

use std::ffi::c_void;
use std::sync::Arc;

use num_enum::TryFromPrimitive;

use crate::device::mapped_ptr::DeviceHostPtr;
use crate::device::ptr::DeviceNonNull;
use crate::device::{DeviceAlloc, DeviceIpcHandle, HostMappedAlloc, IpcMapping};
use crate::transport::meta::{RecvBufMeta, SendBufMeta};
use crate::transport::{Protocol, NUM_PROTOCOLS};
use crate::utils::shm::ShmSegment;

pub const NET_MAP_MASK_DEVMEM: u32 = 0x4000_0000;
pub const NET_MAP_MASK_SHARED: u32 = 0x8000_0000;
pub const NET_MAP_MASK_USED: u32 = 0x2000_0000;
pub const NET_MAP_MASK_OFFSET: u32 = 0x1fff_ffff;

/// Bank index = the (shared, devmem) bits of an offset word.
#[derive(Debug, PartialEq, Eq, Clone, Copy, TryFromPrimitive)]
#[repr(u8)]
pub enum MemoryBankType {
    HostMem = 0,
    DeviceMem = 1,
    SharedHostMem = 2,
    SharedDeviceMem = 3,
    GdcMem = 4,
}

pub const NUM_MEMORY_BANKS: usize = 5;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum BufferType {
    SendMem,
    RecvMem,
    RingBuffer(Protocol),
}

/// Backing allocation of a dedicated bank, owned by the proxy side of the
/// map. Shared banks are owned by the buffer pool and only referenced here.
pub enum MemoryBankAlloc {
    Host(HostMappedAlloc),
    HostShm(ShmSegment),
    Device(DeviceAlloc),
}

/// Kernel-side mapping of a remote bank.
pub enum BankAttach {
    Shm(ShmSegment),
    Ipc(IpcMapping),
    SharedIpc(Arc<IpcMapping>),
}

#[derive(Clone)]
pub struct BufferBankMem {
    cpu_ptr: *mut c_void,
    gpu_ptr: *mut c_void,
    size: usize,
    /// Attach path for host banks crossing a process boundary.
    shm_path: Option<String>,
    /// Attach handle for device banks crossing a process boundary.
    ipc: Option<DeviceIpcHandle>,
    alloc: Option<Arc<MemoryBankAlloc>>,
    attach: Option<Arc<BankAttach>>,
}

unsafe impl Send for BufferBankMem {}
unsafe impl Sync for BufferBankMem {}

#[derive(Clone, Copy, Default)]
pub struct BufferOffset {
    send_mem: u32,
    recv_mem: u32,
    buffers: [u32; NUM_PROTOCOLS],
}

#[derive(Clone)]
pub struct BufferMap {
    same_process: bool,
    shared: bool,
    cuda_dev: i32,
    mems: [BufferBankMem; NUM_MEMORY_BANKS],
    offsets: BufferOffset,
}

impl BufferMap {
    pub fn new(same_process: bool, shared: bool, cuda_dev: i32) -> Self {
        let mems = std::array::from_fn(|_| BufferBankMem {
            cpu_ptr: std::ptr::null_mut(),
            gpu_ptr: std::ptr::null_mut(),
            size: 0,
            shm_path: None,
            ipc: None,
            alloc: None,
            attach: None,
        });
        BufferMap {
            same_process,
            shared,
            cuda_dev,
            mems,
            offsets: BufferOffset::default(),
        }
    }

    #[inline]
    pub fn same_process(&self) -> bool {
        self.same_process
    }

    #[inline]
    pub fn shared(&self) -> bool {
        self.shared
    }

    #[inline]
    pub fn cuda_dev(&self) -> i32 {
        self.cuda_dev
    }

    /// Bump-assign `buffer_type` into a bank. Dedicated banks grow by
    /// `mem_size`; shared banks are whole-arena handles, so the offset is
    /// just the bank tag. The call sequence fully determines the layout.
    pub fn assign_buffer_memory(
        &mut self,
        buffer_type: BufferType,
        shared: bool,
        device: bool,
        mem_size: usize,
    ) {
        let bank_mask = NET_MAP_MASK_USED
            + (device as u32) * NET_MAP_MASK_DEVMEM
            + (shared as u32) * NET_MAP_MASK_SHARED;
        let offset = if shared {
            bank_mask
        } else {
            let bank = if device {
                MemoryBankType::DeviceMem
            } else {
                MemoryBankType::HostMem
            };
            let mem = &mut self.mems[bank as usize];
            let offset = bank_mask + mem.size as u32;
            mem.size += mem_size;
            offset
        };
        match buffer_type {
            BufferType::SendMem => self.offsets.send_mem = offset,
            BufferType::RecvMem => self.offsets.recv_mem = offset,
            BufferType::RingBuffer(proto) => self.offsets.buffers[proto as usize] = offset,
        }
    }

    /// Install a dedicated bank's backing allocation and learn its pointers.
    pub fn register_bank_alloc(&mut self, alloc: MemoryBankAlloc) {
        let (bank, cpu_ptr, gpu_ptr, path) = match &alloc {
            MemoryBankAlloc::Host(host) => (
                MemoryBankType::HostMem,
                host.as_ptr_host() as *mut c_void,
                host.as_ptr_dev() as *mut c_void,
                None,
            ),
            MemoryBankAlloc::HostShm(seg) => (
                MemoryBankType::HostMem,
                seg.as_ptr() as *mut c_void,
                // The creating proxy has no device view; attachers make
                // their own.
                std::ptr::null_mut(),
                Some(seg.path().to_string()),
            ),
            MemoryBankAlloc::Device(dev) => (
                MemoryBankType::DeviceMem,
                dev.as_ptr() as *mut c_void,
                dev.as_ptr() as *mut c_void,
                None,
            ),
        };
        let mem = &mut self.mems[bank as usize];
        mem.cpu_ptr = cpu_ptr;
        mem.gpu_ptr = gpu_ptr;
        mem.shm_path = path;
        mem.alloc = Some(Arc::new(alloc));
    }

    /// Reference a pool-owned shared arena from this map.
    pub fn register_shared_bank(
        &mut self,
        bank: MemoryBankType,
        cpu_ptr: *mut c_void,
        gpu_ptr: *mut c_void,
        size: usize,
        ipc: Option<DeviceIpcHandle>,
    ) {
        let mem = &mut self.mems[bank as usize];
        mem.cpu_ptr = cpu_ptr;
        mem.gpu_ptr = gpu_ptr;
        mem.size = size;
        mem.ipc = ipc;
    }

    /// Record GDC sync-word pointers. The words themselves are owned by the
    /// endpoint resources, not the map.
    pub fn register_gdc_bank(&mut self, cpu_ptr: *mut u64, gpu_ptr: *mut u64) {
        let mem = &mut self.mems[MemoryBankType::GdcMem as usize];
        mem.cpu_ptr = cpu_ptr as *mut c_void;
        mem.gpu_ptr = gpu_ptr as *mut c_void;
        mem.size = std::mem::size_of::<u64>();
    }

    pub fn set_bank_ipc(&mut self, bank: MemoryBankType, ipc: DeviceIpcHandle) {
        self.mems[bank as usize].ipc = ipc.into();
    }

    #[inline]
    pub fn bank_size(&self, bank: MemoryBankType) -> usize {
        self.mems[bank as usize].size
    }

    /// Pad a bank to an allocation-granularity multiple (device banks that
    /// get exported over IPC).
    pub fn align_bank_size(&mut self, bank: MemoryBankType, align: usize) {
        let mem = &mut self.mems[bank as usize];
        mem.size = crate::utils::round_up(mem.size as u64, align as u64) as usize;
    }

    #[inline]
    pub fn bank_shm_path(&self, bank: MemoryBankType) -> Option<&str> {
        self.mems[bank as usize].shm_path.as_deref()
    }

    #[inline]
    pub fn bank_ipc_handle(&self, bank: MemoryBankType) -> Option<&DeviceIpcHandle> {
        self.mems[bank as usize].ipc.as_ref()
    }

    #[inline]
    pub fn bank_cpu_ptr(&self, bank: MemoryBankType) -> *mut c_void {
        self.mems[bank as usize].cpu_ptr
    }

    /// Detach a dedicated bank's backing allocation so teardown can release
    /// banks in a fixed order. Dropping the returned value frees the memory
    /// once no other map clone references it.
    pub fn take_bank_alloc(&mut self, bank: MemoryBankType) -> Option<Arc<MemoryBankAlloc>> {
        self.mems[bank as usize].alloc.take()
    }

    /// Kernel side, cross-process: adopt an attached view of a bank.
    pub fn attach_bank(&mut self, bank: MemoryBankType, attach: BankAttach) {
        let (cpu_ptr, gpu_ptr) = match &attach {
            BankAttach::Shm(seg) => {
                let p = seg.as_ptr() as *mut c_void;
                (p, p)
            }
            BankAttach::Ipc(map) => (std::ptr::null_mut(), map.as_ptr() as *mut c_void),
            BankAttach::SharedIpc(map) => (std::ptr::null_mut(), map.as_ptr() as *mut c_void),
        };
        let mem = &mut self.mems[bank as usize];
        mem.cpu_ptr = cpu_ptr;
        mem.gpu_ptr = gpu_ptr;
        mem.attach = Some(Arc::new(attach));
    }

    #[inline]
    fn offset_of(&self, buffer_type: BufferType) -> u32 {
        match buffer_type {
            BufferType::SendMem => self.offsets.send_mem,
            BufferType::RecvMem => self.offsets.recv_mem,
            BufferType::RingBuffer(proto) => self.offsets.buffers[proto as usize],
        }
    }

    #[inline]
    pub fn offset_bank(&self, buffer_type: BufferType) -> MemoryBankType {
        MemoryBankType::try_from((self.offset_of(buffer_type) >> 30) as u8).unwrap()
    }

    #[inline]
    pub fn is_offset_null(&self, buffer_type: BufferType) -> bool {
        (self.offset_of(buffer_type) >> 29) == 0
    }

    #[inline]
    pub fn is_buffer_device_memory(&self, proto: Protocol) -> bool {
        (self.offsets.buffers[proto as usize] & NET_MAP_MASK_DEVMEM) != 0
    }

    #[inline]
    pub fn is_buffer_shared(&self, proto: Protocol) -> bool {
        (self.offsets.buffers[proto as usize] & NET_MAP_MASK_SHARED) != 0
    }

    fn resolve(&self, buffer_type: BufferType, gpu: bool) -> Option<*mut c_void> {
        if self.is_offset_null(buffer_type) {
            return None;
        }
        let word = self.offset_of(buffer_type);
        let bank = &self.mems[(word >> 30) as usize];
        let base = if gpu { bank.gpu_ptr } else { bank.cpu_ptr };
        if base.is_null() {
            return None;
        }
        let offset = (word & NET_MAP_MASK_OFFSET) as usize;
        Some(unsafe { base.add(offset) })
    }

    #[inline]
    pub fn get_buffer_cpu_ptr(&self, proto: Protocol) -> Option<*mut u8> {
        self.resolve(BufferType::RingBuffer(proto), false)
            .map(|p| p as *mut u8)
    }

    #[inline]
    pub fn get_buffer_gpu_ptr(&self, proto: Protocol) -> Option<DeviceNonNull<u8>> {
        self.resolve(BufferType::RingBuffer(proto), true)
            .and_then(|p| DeviceNonNull::new(p as *mut u8))
    }

    #[inline]
    pub fn get_send_mem_cpu(&self) -> Option<*mut SendBufMeta> {
        self.resolve(BufferType::SendMem, false)
            .map(|p| p as *mut SendBufMeta)
    }

    #[inline]
    pub fn get_recv_mem_cpu(&self) -> Option<*mut RecvBufMeta> {
        self.resolve(BufferType::RecvMem, false)
            .map(|p| p as *mut RecvBufMeta)
    }

    #[inline]
    pub fn get_send_mem_meta(&self) -> Option<DeviceHostPtr<SendBufMeta>> {
        let cpu = self.resolve(BufferType::SendMem, false)?;
        let gpu = self.resolve(BufferType::SendMem, true)?;
        DeviceHostPtr::new(cpu as *mut SendBufMeta, gpu as *mut SendBufMeta)
    }

    #[inline]
    pub fn get_recv_mem_meta(&self) -> Option<DeviceHostPtr<RecvBufMeta>> {
        let cpu = self.resolve(BufferType::RecvMem, false)?;
        let gpu = self.resolve(BufferType::RecvMem, true)?;
        DeviceHostPtr::new(cpu as *mut RecvBufMeta, gpu as *mut RecvBufMeta)
    }

    #[inline]
    pub fn get_gdc_mem_gpu_ptr(&self) -> Option<DeviceNonNull<u64>> {
        DeviceNonNull::new(self.mems[MemoryBankType::GdcMem as usize].gpu_ptr as *mut u64)
    }
}
