//! Proxy-side agent of the net transport: builds connections, owns the
//! endpoint resources, and runs the send/receive progress state machines.
//!
//! Progress is cooperative. Each call makes at most one useful advance per
//! sub-operation and never blocks; a pass that advanced nothing leaves
//! `op.idle` set so the surrounding scheduler can back off.

use std::ffi::c_void;
use std::ptr::{addr_of, addr_of_mut};
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use strum::IntoEnumIterator;

use crate::device::{DeviceRuntime, DEVICE_IPC_MIN_SIZE};
use crate::transport::catalog::TransportCatalog;
use crate::transport::channel::ConnType;
use crate::transport::meta::{RecvBufMeta, SendBufMeta};
use crate::transport::op::{TransportOp, TransportOpState};
use crate::transport::transporter::{AnyResources, ConnResourceTable, TransportAgentId};
use crate::transport::{
    ll_flag, Protocol, LL128_DATA_ELEMS, LL128_LINE_ELEMS, LL128_LINE_SIZE, LL_FIFO_LINE_SIZE,
    NUM_BUFFER_SLOTS, NUM_PROTOCOLS, NUM_SHARED_SLOTS,
};
use crate::utils::shm::ShmSegment;
use crate::utils::{div_up, round_up, wc_store_fence};

use super::buffer::{BufferMap, BufferType, MemoryBankAlloc, MemoryBankType};
use super::provider::{
    AnyMrHandle, MemoryRegion, MrType, NetComm, NetProviderWrap, PtrSupport, NET_MAX_RECVS,
};
use super::resources::{
    AgentRecvConnectReply, AgentRecvConnectRequest, AgentRecvResources, AgentRecvSetup,
    AgentRecvSetupReply, AgentSendConnectReply, AgentSendConnectRequest, AgentSendResources,
    AgentSendSetup, AgentSetupRequest, AgentSharedInitRequest, NetSharedInitResources,
};
use super::shared::{shared_buffers_get, NetAgentState, NET_AGENT_STATE_KEY};
use super::NetAgentError;

type Result<T> = std::result::Result<T, NetAgentError>;

/// Shared proxy-side state, created by the first connection of a
/// communicator and found by everyone else through the catalog.
pub(crate) fn agent_state(catalog: &TransportCatalog) -> Result<Arc<NetAgentState>> {
    let state = catalog
        .get_or_register::<Arc<NetAgentState>, _>(NET_AGENT_STATE_KEY, || {
            Arc::new(NetAgentState::new())
        })?;
    Ok(Arc::clone(&state))
}

pub(crate) async fn net_agent_shared_init(
    request: AgentSharedInitRequest,
    state: Arc<NetAgentState>,
) -> Result<NetSharedInitResources> {
    let same_process = request.client_pid == std::process::id();
    state.shared_buffers_init(
        request.device,
        true,
        request.local_rank,
        request.num_local_ranks,
        request.conn_type,
        same_process,
        request.num_channels,
        request.chunk_size,
    )?;
    Ok(NetSharedInitResources {
        local_rank: request.local_rank,
        conn_type: request.conn_type,
        state,
    })
}

pub(crate) async fn net_agent_send_setup(
    request: AgentSetupRequest,
    state: Arc<NetAgentState>,
) -> Result<AgentSendSetup> {
    let props = request.provider.get_properties(request.net_device);
    let use_dma_buf = request.use_gdr
        && request.device.dma_buf_supported()
        && props.ptr_support.contains(PtrSupport::PTR_DMA_BUF);
    Ok(AgentSendSetup {
        rank: request.rank,
        local_rank: request.local_rank,
        remote_rank: request.remote_rank,
        net_device: request.net_device,
        shared: request.shared,
        use_gdr: request.use_gdr,
        use_dma_buf,
        max_recvs: props.max_recvs,
        channel_id: request.channel_id,
        conn_index: request.conn_index,
        same_process: request.client_pid == std::process::id(),
        num_local_ranks: request.num_local_ranks,
        num_channels: request.num_channels,
        buffer_sizes: request.buffer_sizes,
        chunk_size: request.chunk_size,
        alloc_ll_buffers: request.alloc_ll_buffers,
        config: request.config,
        provider: request.provider,
        device: request.device,
        state,
    })
}

pub(crate) async fn net_agent_recv_setup(
    request: AgentSetupRequest,
    state: Arc<NetAgentState>,
) -> Result<(AgentRecvSetupReply, AgentRecvSetup)> {
    let props = request.provider.get_properties(request.net_device);
    let use_dma_buf = request.use_gdr
        && request.device.dma_buf_supported()
        && props.ptr_support.contains(PtrSupport::PTR_DMA_BUF);
    let max_recvs = props.max_recvs;
    let listener = request.provider.listen(request.net_device).await?;
    let reply = AgentRecvSetupReply {
        handle: listener.handle,
    };
    let setup = AgentRecvSetup {
        listen_comm: listener.listen_comm,
        rank: request.rank,
        local_rank: request.local_rank,
        remote_rank: request.remote_rank,
        net_device: request.net_device,
        shared: request.shared,
        use_gdr: request.use_gdr,
        use_dma_buf,
        need_flush: request.need_flush,
        max_recvs,
        channel_id: request.channel_id,
        conn_index: request.conn_index,
        same_process: request.client_pid == std::process::id(),
        num_local_ranks: request.num_local_ranks,
        num_channels: request.num_channels,
        buffer_sizes: request.buffer_sizes,
        chunk_size: request.chunk_size,
        alloc_ll_buffers: request.alloc_ll_buffers,
        config: request.config,
        provider: request.provider,
        device: request.device,
        state,
    };
    Ok((reply, setup))
}

/// Register every populated per-protocol buffer with the provider, through
/// DMA-BUF when the buffer lives in device memory and both sides support it.
#[allow(clippy::too_many_arguments)]
fn register_buffers(
    map: &BufferMap,
    comm: &Arc<NetComm>,
    provider: &'static dyn NetProviderWrap,
    device: &'static dyn DeviceRuntime,
    use_dma_buf: bool,
    buffer_sizes: &[usize; NUM_PROTOCOLS],
    buffers: &mut [*mut u8; NUM_PROTOCOLS],
    mr_handles: &mut [Option<Box<AnyMrHandle>>; NUM_PROTOCOLS],
) -> Result<()> {
    for proto in Protocol::iter() {
        let Some(cpu_ptr) = map.get_buffer_cpu_ptr(proto) else {
            continue;
        };
        buffers[proto as usize] = cpu_ptr;
        let mr_type = if map.is_buffer_device_memory(proto) {
            MrType::Device
        } else {
            MrType::Host
        };
        let mr = MemoryRegion {
            data: cpu_ptr as *mut c_void,
            size: buffer_sizes[proto as usize],
            mr_type,
        };
        let mut guard = comm.lock();
        let handle = if mr_type == MrType::Device && use_dma_buf {
            let fd = device.dma_buf_fd(mr.data, mr.size)?;
            let handle = provider.register_mr_dma_buf(guard.as_mut(), mr, 0, fd);
            nix::unistd::close(fd)
                .map_err(|e| NetAgentError::BufferRegistration(format!("close dma-buf fd: {e}")))?;
            handle?
        } else {
            provider.register_mr(guard.as_mut(), mr)?
        };
        mr_handles[proto as usize] = Some(handle);
    }
    Ok(())
}

pub(crate) async fn net_agent_send_connect(
    request: AgentSendConnectRequest,
    setup: AgentSendSetup,
) -> Result<(AgentSendConnectReply, AgentSendResources)> {
    let provider = setup.provider;
    let device = setup.device;

    // Connect, reusing the pooled endpoint when channels may share one
    // provider connection.
    let (send_comm, pooled_comm) =
        if setup.shared && setup.max_recvs > 1 && setup.config.net_shared_comms {
            let comm = setup
                .state
                .get_or_connect_send(
                    provider,
                    setup.net_device,
                    setup.remote_rank,
                    setup.channel_id,
                    &request.handle,
                )
                .await?;
            (comm, true)
        } else {
            let comm = NetComm::new(provider.connect(setup.net_device, &request.handle).await?);
            (comm, false)
        };

    let mut map = BufferMap::new(setup.same_process, setup.shared, device.current_device());
    let mut buffer_sizes = [0usize; NUM_PROTOCOLS];

    if !setup.shared {
        // Dedicated per-channel staging for ring/tree; LL always stays in
        // host memory so its flags can be polled cheaply.
        for proto in Protocol::iter() {
            let dev = proto != Protocol::Ll && setup.use_gdr;
            map.assign_buffer_memory(
                BufferType::RingBuffer(proto),
                false,
                dev,
                setup.buffer_sizes[proto as usize],
            );
            buffer_sizes[proto as usize] = setup.buffer_sizes[proto as usize];
        }
    } else {
        let view = setup.state.shared_buffers_init(
            device,
            setup.use_gdr,
            setup.local_rank,
            setup.num_local_ranks,
            ConnType::Send,
            setup.same_process,
            setup.num_channels,
            setup.chunk_size,
        )?;
        let bank = if setup.use_gdr {
            MemoryBankType::SharedDeviceMem
        } else {
            MemoryBankType::SharedHostMem
        };
        buffer_sizes[Protocol::Simple as usize] = view.size;
        let (cpu_ptr, gpu_ptr, size, ipc) = (view.cpu_ptr, view.gpu_ptr, view.size, view.ipc);
        map.register_shared_bank(bank, cpu_ptr, gpu_ptr, size, ipc);

        if setup.alloc_ll_buffers {
            map.assign_buffer_memory(
                BufferType::RingBuffer(Protocol::Ll),
                false,
                false,
                setup.buffer_sizes[Protocol::Ll as usize],
            );
            buffer_sizes[Protocol::Ll as usize] = setup.buffer_sizes[Protocol::Ll as usize];
        }
        map.assign_buffer_memory(BufferType::RingBuffer(Protocol::Simple), true, setup.use_gdr, size);
    }

    map.assign_buffer_memory(
        BufferType::SendMem,
        false,
        false,
        std::mem::size_of::<SendBufMeta>(),
    );
    map.assign_buffer_memory(
        BufferType::RecvMem,
        false,
        false,
        std::mem::size_of::<RecvBufMeta>(),
    );

    if map.bank_size(MemoryBankType::DeviceMem) > 0 {
        if !setup.shared {
            if !setup.same_process {
                map.align_bank_size(MemoryBankType::DeviceMem, DEVICE_IPC_MIN_SIZE);
            }
            let alloc = device.alloc_device(map.bank_size(MemoryBankType::DeviceMem))?;
            map.register_bank_alloc(MemoryBankAlloc::Device(alloc));
        }
        if !setup.same_process {
            let handle = device.ipc_export(
                map.bank_cpu_ptr(MemoryBankType::DeviceMem),
                map.bank_size(MemoryBankType::DeviceMem),
            )?;
            map.set_bank_ipc(MemoryBankType::DeviceMem, handle);
        }
    }
    if setup.same_process {
        let host = device.alloc_host_mapped(map.bank_size(MemoryBankType::HostMem))?;
        map.register_bank_alloc(MemoryBankAlloc::Host(host));
    } else {
        let seg = ShmSegment::create(map.bank_size(MemoryBankType::HostMem))?;
        map.register_bank_alloc(MemoryBankAlloc::HostShm(seg));
    }

    let mut gdc_sync = std::ptr::null_mut::<u64>();
    let mut gdr_desc = None;
    if device.gdr_available() && setup.same_process && setup.config.gdr_copy_sync_enable {
        let gdc = device.alloc_gdc_words(1)?;
        gdc_sync = gdc.get_cpu_ptr();
        map.register_gdc_bank(gdc.get_cpu_ptr(), gdc.get_gpu_ptr());
        gdr_desc = Some(gdc);
    }

    let send_mem = map.get_send_mem_cpu().ok_or(NetAgentError::MapResolution)?;
    let recv_mem = map.get_recv_mem_cpu().ok_or(NetAgentError::MapResolution)?;

    // Credits start negative in shared mode: the kernel only proceeds once
    // the proxy pre-posts a slot offset.
    unsafe {
        let head = if setup.shared {
            0u64.wrapping_sub(NUM_BUFFER_SLOTS as u64)
        } else {
            0
        };
        addr_of_mut!((*send_mem).head).write_volatile(head);
        let sizes_fifo = addr_of_mut!((*recv_mem).slots_sizes) as *mut i32;
        for slot in 0..NUM_BUFFER_SLOTS {
            sizes_fifo.add(slot).write_volatile(-1);
        }
    }

    let mut buffers = [std::ptr::null_mut::<u8>(); NUM_PROTOCOLS];
    let mut mr_handles: [Option<Box<AnyMrHandle>>; NUM_PROTOCOLS] = Default::default();
    register_buffers(
        &map,
        &send_comm,
        provider,
        device,
        setup.use_dma_buf,
        &buffer_sizes,
        &mut buffers,
        &mut mr_handles,
    )?;

    let reply = AgentSendConnectReply { map: map.clone() };
    let resources = AgentSendResources {
        map,
        send_comm,
        send_mem,
        recv_mem,
        rank: setup.rank,
        local_rank: setup.local_rank,
        remote_rank: setup.remote_rank,
        net_device: setup.net_device,
        channel_id: setup.channel_id,
        conn_index: setup.conn_index,
        shared: setup.shared,
        use_gdr: setup.use_gdr,
        use_dma_buf: setup.use_dma_buf,
        max_recvs: setup.max_recvs,
        chunk_size: setup.chunk_size,
        gdc_sync,
        gdr_desc,
        buffers,
        buffer_sizes,
        mr_handles,
        step: 0,
        pooled_comm,
        provider,
        device,
        state: setup.state,
    };
    Ok((reply, resources))
}

pub(crate) async fn net_agent_recv_connect(
    request: AgentRecvConnectRequest,
    setup: AgentRecvSetup,
) -> Result<(AgentRecvConnectReply, AgentRecvResources)> {
    let provider = setup.provider;
    let device = setup.device;
    let proxy_rank = request.send_proxy_rank;

    // Remote recv proxies are unsupported: the receiving GPU's owner process
    // must drive its own NIC.
    if !setup.same_process {
        return Err(NetAgentError::RemoteRecvProxy);
    }

    let (recv_comm, pooled_comm) =
        if setup.shared && setup.max_recvs > 1 && setup.config.net_shared_comms {
            let comm = setup
                .state
                .get_or_accept_recv(
                    provider,
                    setup.net_device,
                    proxy_rank,
                    setup.channel_id,
                    setup.listen_comm,
                )
                .await?;
            (comm, true)
        } else {
            let comm = NetComm::new(provider.accept(setup.listen_comm).await?);
            (comm, false)
        };

    let mut map = BufferMap::new(true, setup.shared, device.current_device());
    let mut buffer_sizes = [0usize; NUM_PROTOCOLS];

    if !setup.shared {
        for proto in Protocol::iter() {
            map.assign_buffer_memory(
                BufferType::RingBuffer(proto),
                false,
                setup.use_gdr,
                setup.buffer_sizes[proto as usize],
            );
            buffer_sizes[proto as usize] = setup.buffer_sizes[proto as usize];
        }
    } else {
        let view = setup.state.shared_buffers_init(
            device,
            setup.use_gdr,
            setup.local_rank,
            setup.num_local_ranks,
            ConnType::Recv,
            true,
            setup.num_channels,
            setup.chunk_size,
        )?;
        let bank = if setup.use_gdr {
            MemoryBankType::SharedDeviceMem
        } else {
            MemoryBankType::SharedHostMem
        };
        buffer_sizes[Protocol::Simple as usize] = view.size;
        let size = view.size;
        map.register_shared_bank(bank, view.cpu_ptr, view.gpu_ptr, size, view.ipc);
        map.assign_buffer_memory(BufferType::RingBuffer(Protocol::Simple), true, setup.use_gdr, size);
    }

    map.assign_buffer_memory(
        BufferType::SendMem,
        false,
        false,
        std::mem::size_of::<SendBufMeta>(),
    );
    map.assign_buffer_memory(
        BufferType::RecvMem,
        false,
        false,
        std::mem::size_of::<RecvBufMeta>(),
    );

    if setup.alloc_ll_buffers {
        map.assign_buffer_memory(
            BufferType::RingBuffer(Protocol::Ll),
            false,
            false,
            setup.buffer_sizes[Protocol::Ll as usize],
        );
        buffer_sizes[Protocol::Ll as usize] = setup.buffer_sizes[Protocol::Ll as usize];
    }

    if map.bank_size(MemoryBankType::DeviceMem) > 0 && !setup.shared {
        let alloc = device.alloc_device(map.bank_size(MemoryBankType::DeviceMem))?;
        map.register_bank_alloc(MemoryBankAlloc::Device(alloc));
    }
    let host = device.alloc_host_mapped(map.bank_size(MemoryBankType::HostMem))?;
    map.register_bank_alloc(MemoryBankAlloc::Host(host));

    let mut gdc_sync = std::ptr::null_mut::<u64>();
    let mut gdc_flush = std::ptr::null_mut::<u64>();
    let mut gdr_desc = None;
    if device.gdr_available() {
        // First word syncs the tail, second word serves as the PCIe flush
        // read target.
        let gdc = device.alloc_gdc_words(2)?;
        if setup.config.gdr_copy_sync_enable {
            gdc_sync = gdc.get_cpu_ptr();
            map.register_gdc_bank(gdc.get_cpu_ptr(), gdc.get_gpu_ptr());
        }
        if setup.config.gdr_copy_flush_enable {
            gdc_flush = unsafe { gdc.get_cpu_ptr().add(1) };
        }
        gdr_desc = Some(gdc);
    }

    let send_mem = map.get_send_mem_cpu().ok_or(NetAgentError::MapResolution)?;
    let recv_mem = map.get_recv_mem_cpu().ok_or(NetAgentError::MapResolution)?;

    let mut buffers = [std::ptr::null_mut::<u8>(); NUM_PROTOCOLS];
    let mut mr_handles: [Option<Box<AnyMrHandle>>; NUM_PROTOCOLS] = Default::default();
    register_buffers(
        &map,
        &recv_comm,
        provider,
        device,
        setup.use_dma_buf,
        &buffer_sizes,
        &mut buffers,
        &mut mr_handles,
    )?;

    let reply = AgentRecvConnectReply { map: map.clone() };
    let resources = AgentRecvResources {
        map,
        recv_comm,
        send_mem,
        recv_mem,
        rank: setup.rank,
        local_rank: setup.local_rank,
        remote_rank: setup.remote_rank,
        proxy_rank,
        net_device: setup.net_device,
        channel_id: setup.channel_id,
        conn_index: setup.conn_index,
        shared: setup.shared,
        use_gdr: setup.use_gdr,
        use_dma_buf: setup.use_dma_buf,
        need_flush: setup.need_flush,
        max_recvs: setup.max_recvs,
        chunk_size: setup.chunk_size,
        gdc_sync,
        gdc_flush,
        gdr_desc,
        buffers,
        buffer_sizes,
        mr_handles,
        step: 0,
        pooled_comm,
        provider,
        device,
        state: setup.state,
    };
    Ok((reply, resources))
}

fn send_res<'a>(
    resources: &'a mut ConnResourceTable,
    agent: &TransportAgentId,
) -> Result<&'a mut AgentSendResources> {
    resources
        .get_mut(agent)
        .ok_or(NetAgentError::UnknownConnection)?
        .downcast_mut::<AgentSendResources>()
        .ok_or(NetAgentError::DowncastAgentResources)
}

fn recv_res<'a>(
    resources: &'a ConnResourceTable,
    agent: &TransportAgentId,
) -> Result<&'a AgentRecvResources> {
    resources
        .get(agent)
        .ok_or(NetAgentError::UnknownConnection)?
        .downcast_ref::<AgentRecvResources>()
        .ok_or(NetAgentError::DowncastAgentResources)
}

fn recv_res_mut<'a>(
    resources: &'a mut ConnResourceTable,
    agent: &TransportAgentId,
) -> Result<&'a mut AgentRecvResources> {
    resources
        .get_mut(agent)
        .ok_or(NetAgentError::UnknownConnection)?
        .downcast_mut::<AgentRecvResources>()
        .ok_or(NetAgentError::DowncastAgentResources)
}

/// Publish the send-side head, releasing slots back to the kernel.
#[inline]
unsafe fn publish_head(res: &AgentSendResources, value: u64) {
    if !res.gdc_sync.is_null() {
        res.gdc_sync.write_volatile(value);
        wc_store_fence();
    } else {
        addr_of_mut!((*res.send_mem).head).write_volatile(value);
    }
}

/// Publish the recv-side tail, handing received steps to the kernel.
#[inline]
unsafe fn publish_tail(res: &AgentRecvResources, value: u64) {
    if !res.gdc_sync.is_null() {
        res.gdc_sync.write_volatile(value);
        wc_store_fence();
    } else {
        addr_of_mut!((*res.recv_mem).tail).write_volatile(value);
    }
}

/// LL payload readiness: both flag words of every fifo line must carry the
/// step flag; the kernel writes data and flag in one 16-byte store, so a
/// stale flag means the line is not fully written yet.
fn ll_payload_ready(buff: *const u8, size: usize, flag: u32) -> bool {
    let n_fifo_lines = div_up(size, LL_FIFO_LINE_SIZE);
    let lines = buff as *const u32;
    for line in 0..n_fifo_lines {
        unsafe {
            let flag1 = lines.add(line * 4 + 1).read_volatile();
            let flag2 = lines.add(line * 4 + 3).read_volatile();
            if flag1 != flag || flag2 != flag {
                return false;
            }
        }
    }
    true
}

/// LL128 readiness in system memory: the flag element of every 128-byte line
/// must match, since the GPU only issued a threadfence.
fn ll128_payload_ready(buff: *const u8, size: usize, flag: u64) -> bool {
    let n_fifo_lines = div_up(size, LL128_LINE_SIZE);
    let lines = buff as *const u64;
    for line in 0..n_fifo_lines {
        unsafe {
            if lines
                .add(line * LL128_LINE_ELEMS + LL128_DATA_ELEMS)
                .read_volatile()
                != flag
            {
                return false;
            }
        }
    }
    true
}

pub(crate) fn net_agent_send_progress(
    resources: &mut ConnResourceTable,
    op: &mut TransportOp,
) -> Result<()> {
    if op.state == TransportOpState::Init {
        for sub in op.subs.iter_mut() {
            let res = send_res(resources, &sub.agent)?;
            // Align the window base to the next chunk boundary.
            sub.base = round_up(res.step, op.chunk_steps);
            sub.posted = 0;
            sub.transmitted = 0;
            sub.done = 0;
            sub.requests = [None; NUM_BUFFER_SLOTS];
        }
        op.state = TransportOpState::InProgress;
    }
    op.idle = true;
    if op.state != TransportOpState::InProgress {
        return Ok(());
    }

    let p = op.protocol;
    let slice_steps = op.slice_steps;
    let nsubs = op.subs.len();
    let max_depth = std::cmp::min(NUM_BUFFER_SLOTS as u64, (NUM_SHARED_SLOTS / nsubs) as u64);

    for s in 0..nsubs {
        let sub = &mut op.subs[s];
        if sub.done == sub.num_steps {
            continue;
        }
        let res = send_res(resources, &sub.agent)?;
        let step_size = res.buffer_sizes[p as usize] / NUM_BUFFER_SLOTS;
        let local_buff = res.buffers[p as usize];

        // Post buffers to the GPU.
        if sub.posted < sub.num_steps && sub.posted < sub.done + max_depth {
            if res.shared {
                let buff_slot = ((sub.base + sub.posted) % NUM_BUFFER_SLOTS as u64) as usize;
                let shared_buff_slot = (sub.posted % max_depth) as usize;
                let offset =
                    shared_buffers_get(res.chunk_size, res.channel_id, shared_buff_slot * nsubs + s);
                unsafe {
                    let offs_fifo = addr_of_mut!((*res.recv_mem).slots_offsets) as *mut i32;
                    offs_fifo.add(buff_slot).write_volatile(offset as i32);
                }
                fence(Ordering::SeqCst);
                sub.posted += slice_steps;
                unsafe {
                    publish_head(
                        res,
                        (sub.base + sub.posted).wrapping_sub(NUM_BUFFER_SLOTS as u64),
                    );
                }
            } else {
                sub.posted += slice_steps;
            }
            op.idle = false;
            continue;
        }

        // Ship a slot the kernel published to the network.
        if sub.transmitted < sub.posted && sub.transmitted < sub.done + NUM_BUFFER_SLOTS as u64 {
            let buff_slot = ((sub.base + sub.transmitted) % NUM_BUFFER_SLOTS as u64) as usize;
            let (size, recv_tail) = unsafe {
                let sizes_fifo = addr_of!((*res.recv_mem).slots_sizes) as *const i32;
                (
                    sizes_fifo.add(buff_slot).read_volatile(),
                    addr_of!((*res.recv_mem).tail).read_volatile(),
                )
            };
            if size != -1 && (recv_tail > sub.base + sub.transmitted || p == Protocol::Ll) {
                let fused = p == Protocol::Simple && res.shared;
                let buff = if fused {
                    let offset = unsafe {
                        let offs_fifo = addr_of!((*res.recv_mem).slots_offsets) as *const i32;
                        offs_fifo.add(buff_slot).read_volatile()
                    };
                    unsafe { local_buff.add(offset as usize) }
                } else {
                    unsafe { local_buff.add(buff_slot * step_size) }
                };
                let ready = match p {
                    Protocol::Simple => true,
                    Protocol::Ll => {
                        let flag = ll_flag(sub.base + sub.transmitted + 1);
                        ll_payload_ready(buff, size as usize, flag)
                    }
                    Protocol::Ll128 => {
                        // With GDR the NIC reads coherently from device
                        // memory; no flag scan is possible or needed.
                        res.use_gdr
                            || ll128_payload_ready(buff, size as usize, sub.base + sub.transmitted + 1)
                    }
                };
                if ready {
                    let mhandle = res.mr_handles[p as usize].as_deref().ok_or_else(|| {
                        NetAgentError::BufferRegistration(format!(
                            "no registered memory for protocol {:?}",
                            p
                        ))
                    })?;
                    let request = {
                        let mut comm = res.send_comm.lock();
                        res.provider.initiate_send(
                            comm.as_mut(),
                            buff as *mut c_void,
                            size as usize,
                            res.rank as u32,
                            mhandle,
                        )?
                    };
                    if let Some(request) = request {
                        log::trace!(
                            "sendProxy [{}/{}] Isend posted, req {:?}",
                            sub.transmitted,
                            buff_slot,
                            request
                        );
                        sub.requests[buff_slot] = Some(request);
                        unsafe {
                            let sizes_fifo = addr_of_mut!((*res.recv_mem).slots_sizes) as *mut i32;
                            sizes_fifo.add(buff_slot).write_volatile(-1);
                        }
                        // The size reset must land before the head moves.
                        fence(Ordering::SeqCst);
                        sub.transmitted += slice_steps;
                        op.idle = false;
                        continue;
                    }
                }
            }
        }

        // Reap network completions and release slots to the kernel.
        if sub.done < sub.transmitted {
            let buff_slot = ((sub.base + sub.done) % NUM_BUFFER_SLOTS as u64) as usize;
            if let Some(request) = sub.requests[buff_slot] {
                if res.provider.test(request, None)? {
                    log::trace!("sendProxy [{}/{}] request {:?} done", sub.done, buff_slot, request);
                    sub.requests[buff_slot] = None;
                    sub.done += slice_steps;
                    if !res.shared {
                        unsafe { publish_head(res, sub.base + sub.done) };
                    }
                    op.idle = false;
                    if sub.done == sub.num_steps {
                        res.step = sub.base + sub.num_steps;
                        op.done_subs += 1;
                    }
                }
            }
        }
    }

    if op.done_subs == op.subs.len() {
        op.state = TransportOpState::Completed;
    }
    Ok(())
}

pub(crate) fn net_agent_recv_progress(
    resources: &mut ConnResourceTable,
    op: &mut TransportOp,
) -> Result<()> {
    if op.state == TransportOpState::Init {
        // Reorder subs so contiguous runs share one recv comm, then stamp
        // each sub with its group size.
        let mut group_size = 0usize;
        let mut max_recvs = 1usize;
        let mut comm_token = 0usize;
        for s in 0..op.subs.len() {
            if group_size == max_recvs {
                group_size = 0;
            } else if s > 0 {
                let mut next = s;
                while next < op.subs.len() {
                    let res = recv_res(resources, &op.subs[next].agent)?;
                    if NetComm::token(&res.recv_comm) == comm_token {
                        break;
                    }
                    next += 1;
                }
                if next == op.subs.len() {
                    group_size = 0;
                } else if next != s {
                    op.subs.swap(s, next);
                }
            }
            group_size += 1;
            let res = recv_res(resources, &op.subs[s].agent)?;
            max_recvs = res.max_recvs.min(NET_MAX_RECVS);
            comm_token = NetComm::token(&res.recv_comm);
            let base = round_up(res.step, op.chunk_steps);
            let sub = &mut op.subs[s];
            sub.base = base;
            sub.posted = 0;
            sub.received = 0;
            sub.transmitted = 0;
            sub.done = 0;
            sub.requests = [None; NUM_BUFFER_SLOTS];
            for i in 0..group_size {
                op.subs[s - i].group_size = group_size;
            }
        }
        op.state = TransportOpState::InProgress;
    }
    op.idle = true;
    if op.state != TransportOpState::InProgress {
        return Ok(());
    }

    let p = op.protocol;
    let slice_steps = op.slice_steps;
    let nsubs = op.subs.len();
    let max_depth = std::cmp::min(NUM_BUFFER_SLOTS as u64, (NUM_SHARED_SLOTS / nsubs) as u64);

    // Stage 1: post one batched receive per group.
    let mut s = 0;
    while s < nsubs {
        let group_size = op.subs[s].group_size;
        let mut ptrs: Vec<*mut c_void> = Vec::with_capacity(group_size);
        let mut sizes: Vec<usize> = Vec::with_capacity(group_size);
        let mut tags: Vec<u32> = Vec::with_capacity(group_size);
        let mut mhandles: Vec<&AnyMrHandle> = Vec::with_capacity(group_size);
        let mut sub_count = 0;
        for i in 0..group_size {
            let sub = &op.subs[s + i];
            if sub.posted < sub.num_steps {
                if sub.posted >= sub.done + max_depth {
                    sub_count = 0;
                    break;
                }
                let res = recv_res(resources, &sub.agent)?;
                let step_size = res.buffer_sizes[p as usize] / NUM_BUFFER_SLOTS;
                let local_buff = res.buffers[p as usize];
                let buff_slot = ((sub.base + sub.posted) % NUM_BUFFER_SLOTS as u64) as usize;
                let ptr = if p == Protocol::Simple && res.shared {
                    let shared_buff_slot = (sub.posted % max_depth) as usize;
                    let offset = shared_buffers_get(
                        res.chunk_size,
                        res.channel_id,
                        shared_buff_slot * nsubs + s + i,
                    );
                    unsafe {
                        let offs_fifo = addr_of_mut!((*res.recv_mem).slots_offsets) as *mut i32;
                        offs_fifo.add(buff_slot).write_volatile(offset as i32);
                        local_buff.add(offset)
                    }
                } else {
                    unsafe { local_buff.add(buff_slot * step_size) }
                };
                let mut size = step_size * slice_steps as usize;
                if sub.nbytes < size {
                    size = sub.nbytes;
                }
                ptrs.push(ptr as *mut c_void);
                sizes.push(size);
                tags.push(res.remote_rank as u32);
                mhandles.push(res.mr_handles[p as usize].as_deref().ok_or_else(|| {
                    NetAgentError::BufferRegistration(format!(
                        "no registered memory for protocol {:?}",
                        p
                    ))
                })?);
                sub_count += 1;
            }
        }
        if sub_count > 0 {
            let leader_step = op.subs[s].posted;
            let res = recv_res(resources, &op.subs[s].agent)?;
            let request = {
                let mut comm = res.recv_comm.lock();
                res.provider.initiate_recv(
                    comm.as_mut(),
                    &ptrs[..sub_count],
                    &sizes[..sub_count],
                    &tags[..sub_count],
                    &mhandles[..sub_count],
                )?
            };
            if let Some(request) = request {
                let slot = (leader_step % NUM_BUFFER_SLOTS as u64) as usize;
                op.subs[s].requests[slot] = Some(request);
                for i in 0..group_size {
                    op.subs[s + i].posted += slice_steps;
                }
                op.idle = false;
            }
        }
        s += group_size;
    }
    if !op.idle {
        return Ok(());
    }

    // Stage 2: reap receive completions, then flush GDR data if required.
    let mut s = 0;
    while s < nsubs {
        let group_size = op.subs[s].group_size;
        if op.subs[s].posted > op.subs[s].received {
            let step = op.subs[s].received;
            let slot = (step % NUM_BUFFER_SLOTS as u64) as usize;
            if let Some(request) = op.subs[s].requests[slot] {
                let mut recv_sizes = [0usize; NET_MAX_RECVS];
                let done = {
                    let res = recv_res(resources, &op.subs[s].agent)?;
                    res.provider.test(request, Some(&mut recv_sizes))?
                };
                if done {
                    op.subs[s].requests[slot] = None;
                    let total_size: usize = recv_sizes.iter().sum();
                    let mut need_flush = false;
                    for i in 0..group_size {
                        let sub = &mut op.subs[s + i];
                        sub.received += slice_steps;
                        if step < sub.num_steps {
                            let res = recv_res(resources, &sub.agent)?;
                            need_flush |= res.use_gdr && res.need_flush;
                        }
                    }
                    if total_size > 0 && p == Protocol::Simple && need_flush {
                        let leader = recv_res(resources, &op.subs[s].agent)?;
                        if !leader.gdc_flush.is_null() {
                            gdc_pcie_flush(leader.gdc_flush)?;
                        } else {
                            let mut ptrs: Vec<*mut c_void> = Vec::with_capacity(group_size);
                            let mut mhandles: Vec<&AnyMrHandle> = Vec::with_capacity(group_size);
                            for i in 0..group_size {
                                let sub = &op.subs[s + i];
                                if step < sub.num_steps {
                                    let res = recv_res(resources, &sub.agent)?;
                                    let step_size =
                                        res.buffer_sizes[p as usize] / NUM_BUFFER_SLOTS;
                                    let local_buff = res.buffers[p as usize];
                                    let buff_slot =
                                        ((sub.base + sub.posted) % NUM_BUFFER_SLOTS as u64) as usize;
                                    let ptr = if res.shared {
                                        let offset = unsafe {
                                            let offs_fifo = addr_of!((*res.recv_mem).slots_offsets)
                                                as *const i32;
                                            offs_fifo.add(buff_slot).read_volatile()
                                        };
                                        unsafe { local_buff.add(offset as usize) }
                                    } else {
                                        unsafe { local_buff.add(buff_slot * step_size) }
                                    };
                                    ptrs.push(ptr as *mut c_void);
                                    mhandles.push(
                                        res.mr_handles[p as usize].as_deref().ok_or_else(|| {
                                            NetAgentError::BufferRegistration(format!(
                                                "no registered memory for protocol {:?}",
                                                p
                                            ))
                                        })?,
                                    );
                                }
                            }
                            let request = {
                                let mut comm = leader.recv_comm.lock();
                                leader.provider.initiate_flush(
                                    comm.as_mut(),
                                    &ptrs,
                                    &recv_sizes[..ptrs.len()],
                                    &mhandles,
                                )?
                            };
                            op.subs[s].requests[slot] = request;
                        }
                    }
                    op.idle = false;
                }
            }
        }
        s += group_size;
    }
    if !op.idle {
        return Ok(());
    }

    // Stage 3: once the (possibly absent) flush finished, publish the tail.
    let mut s = 0;
    while s < nsubs {
        let group_size = op.subs[s].group_size;
        if op.subs[s].received > op.subs[s].transmitted {
            let step = op.subs[s].transmitted;
            let slot = (step % NUM_BUFFER_SLOTS as u64) as usize;
            let done = match op.subs[s].requests[slot] {
                Some(request) => {
                    let res = recv_res(resources, &op.subs[s].agent)?;
                    res.provider.test(request, None)?
                }
                None => true,
            };
            if done {
                op.subs[s].requests[slot] = None;
                for i in 0..group_size {
                    let sub = &mut op.subs[s + i];
                    sub.transmitted += slice_steps;
                    if step < sub.num_steps {
                        fence(Ordering::SeqCst);
                        let res = recv_res(resources, &sub.agent)?;
                        unsafe { publish_tail(res, sub.base + sub.transmitted) };
                    }
                }
                op.idle = false;
            }
        }
        s += group_size;
    }
    if !op.idle {
        return Ok(());
    }

    // Stage 4: observe the kernel consuming steps through the head word.
    for s in 0..nsubs {
        let sub = &mut op.subs[s];
        if sub.done == sub.num_steps {
            continue;
        }
        if sub.transmitted > sub.done {
            let res = recv_res_mut(resources, &sub.agent)?;
            let head = unsafe { addr_of!((*res.send_mem).head).read_volatile() };
            // LL and LL128 can acknowledge sends before the data moved; never
            // run past what was actually transmitted.
            while head > sub.base + sub.done && sub.transmitted > sub.done {
                sub.done += slice_steps;
                op.idle = false;
                if sub.done == sub.num_steps {
                    res.step = sub.base + sub.num_steps;
                    op.done_subs += 1;
                    break;
                }
            }
        }
    }

    if op.done_subs == op.subs.len() {
        op.state = TransportOpState::Completed;
    }
    Ok(())
}

/// Force a PCIe read from device memory through the GDC flush word, fencing
/// outstanding GDR writes.
#[cfg(target_arch = "x86_64")]
fn gdc_pcie_flush(gdc_flush: *mut u64) -> Result<()> {
    unsafe {
        std::arch::asm!(
            "mov ({0}), %eax",
            in(reg) gdc_flush,
            out("eax") _,
            options(att_syntax, readonly, nostack),
        );
    }
    Ok(())
}

#[cfg(not(target_arch = "x86_64"))]
fn gdc_pcie_flush(_gdc_flush: *mut u64) -> Result<()> {
    Err(NetAgentError::GdrFlushUnsupported)
}

fn free_send_resources(mut res: AgentSendResources) -> Result<()> {
    for proto in Protocol::iter() {
        if let Some(handle) = res.mr_handles[proto as usize].take() {
            let mut comm = res.send_comm.lock();
            res.provider.deregister_mr(comm.as_mut(), handle)?;
        }
    }
    // Banks go in a fixed order: host, device, GDC words, then the pools and
    // finally the provider endpoint itself.
    drop(res.map.take_bank_alloc(MemoryBankType::HostMem));
    drop(res.map.take_bank_alloc(MemoryBankType::DeviceMem));
    res.gdr_desc = None;
    if res.shared {
        res.state
            .shared_buffers_destroy(res.local_rank, ConnType::Send)?;
        if res.pooled_comm {
            res.state.release_comm(
                res.net_device,
                res.remote_rank,
                res.channel_id,
                ConnType::Send,
            );
        }
    }
    Ok(())
}

fn free_recv_resources(mut res: AgentRecvResources) -> Result<()> {
    for proto in Protocol::iter() {
        if let Some(handle) = res.mr_handles[proto as usize].take() {
            let mut comm = res.recv_comm.lock();
            res.provider.deregister_mr(comm.as_mut(), handle)?;
        }
    }
    drop(res.map.take_bank_alloc(MemoryBankType::HostMem));
    drop(res.map.take_bank_alloc(MemoryBankType::DeviceMem));
    res.gdr_desc = None;
    if res.shared {
        res.state
            .shared_buffers_destroy(res.local_rank, ConnType::Recv)?;
        if res.pooled_comm {
            res.state.release_comm(
                res.net_device,
                res.proxy_rank,
                res.channel_id,
                ConnType::Recv,
            );
        }
    }
    Ok(())
}

/// Release a connection at any stage of its lifecycle. Connections that only
/// went through shared-init merely drop their arena reference; connected
/// endpoints deregister memory, free every bank the connect built, release
/// pool references, and close the provider endpoint with the last handle.
pub(crate) fn net_agent_free(resources: AnyResources) -> Result<()> {
    let resources = match resources.downcast::<NetSharedInitResources>() {
        Ok(shared) => {
            return shared
                .state
                .shared_buffers_destroy(shared.local_rank, shared.conn_type);
        }
        Err(other) => other,
    };
    let resources = match resources.downcast::<AgentSendResources>() {
        Ok(send) => return free_send_resources(*send),
        Err(other) => other,
    };
    let resources = match resources.downcast::<AgentRecvResources>() {
        Ok(recv) => return free_recv_resources(*recv),
        Err(other) => other,
    };
    // Setup-only connections: dropping the state closes the listen comm.
    let resources = match resources.downcast::<AgentSendSetup>() {
        Ok(_) => return Ok(()),
        Err(other) => other,
    };
    match resources.downcast::<AgentRecvSetup>() {
        Ok(_) => Ok(()),
        Err(_) => Err(NetAgentError::DowncastAgentResources),
    }
}
