//! Kernel-side entry points of the net transport and the dispatch of the
//! proxy-side agent calls.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use memoffset::raw_field;
use once_cell::sync::Lazy;
use strum::IntoEnumIterator;

use crate::comm::{CommProfile, PeerInfo};
use crate::device::ptr::DeviceNonNull;
use crate::device::{DeviceIpcHandle, DeviceRuntime, IpcMapping};
use crate::transport::catalog::TransportCatalog;
use crate::transport::channel::{PeerConnId, PeerConnInfo};
use crate::transport::meta::{RecvBufMeta, SendBufMeta};
use crate::transport::op::TransportOp;
use crate::transport::transporter::{
    AgentMessage, AnyResources, ConnResourceTable, ConnectHandle, TransportAgentId,
    TransportConnect, TransportSetup, Transporter, TransporterError,
};
use crate::transport::{Protocol, NUM_PROTOCOLS};
use crate::utils::shm::ShmSegment;

use super::agent;
use super::buffer::{BankAttach, BufferMap, MemoryBankType};
use super::config::NetTransportConfig;
use super::resources::{
    log_connection, AgentRecvConnectReply, AgentRecvConnectRequest, AgentRecvSetupReply,
    AgentSendConnectReply, AgentSendConnectRequest, AgentSetupRequest, AgentSharedInitRequest,
    NetRecvResources, NetSendResources, NetSendSetup,
};
use super::{NetAgentError, NetTransportError};

pub struct NetTransport;
pub static NET_TRANSPORT: NetTransport = NetTransport;

/// Shared device arenas are exported once per owning local rank; every
/// channel of this process maps the arena through one cached IPC open.
static SHARED_ARENA_CACHE: Lazy<DashMap<DeviceIpcHandle, Arc<IpcMapping>>> = Lazy::new(DashMap::new);

fn shared_arena_mapping(
    device: &'static dyn DeviceRuntime,
    handle: &DeviceIpcHandle,
) -> Result<Arc<IpcMapping>, NetTransportError> {
    if let Some(mapping) = SHARED_ARENA_CACHE.get(handle) {
        return Ok(Arc::clone(&mapping));
    }
    let mapping = Arc::new(device.ipc_open(handle)?);
    SHARED_ARENA_CACHE.insert(handle.clone(), Arc::clone(&mapping));
    Ok(mapping)
}

fn net_send_setup(
    conn_id: &PeerConnId,
    my_info: &PeerInfo,
    peer_info: &PeerInfo,
    profile: &CommProfile,
    config: &NetTransportConfig,
) -> Result<TransportSetup, NetTransportError> {
    let shared = if profile.collective_graph {
        false
    } else {
        config.net_shared_buffers.unwrap_or(true)
    };
    let (net_dev, proxy_rank) =
        profile.get_network_device(conn_id.channel, my_info.rank, conn_id.peer_rank);
    let use_gdr = profile.check_gdr(my_info.rank, net_dev, true) && config.gdr_enable;
    let provider = profile.get_net_provider();

    let setup_request = AgentSetupRequest {
        rank: my_info.rank,
        local_rank: my_info.local_rank,
        remote_rank: conn_id.peer_rank,
        net_device: net_dev,
        shared,
        use_gdr,
        need_flush: false,
        channel_id: conn_id.channel,
        conn_index: conn_id.conn_index,
        client_pid: my_info.pid,
        num_local_ranks: profile.num_local_ranks,
        num_channels: profile.p2p_num_channels,
        buffer_sizes: profile.buff_sizes,
        chunk_size: profile.p2p_chunk_size,
        alloc_ll_buffers: profile.alloc_p2p_net_ll_buffers,
        config: config.clone(),
        provider,
        device: profile.get_device_runtime(),
    };
    let setup_resources = NetSendSetup {
        proxy_rank,
        device: profile.get_device_runtime(),
    };
    let setup = TransportSetup::PreAgentCb {
        agent_cuda_dev: profile.get_cuda_device_idx(proxy_rank),
        agent_request: Some(Box::new(setup_request)),
        setup_resources: Some(Box::new(setup_resources)),
    };

    log_connection(
        "send",
        conn_id.channel,
        conn_id.conn_index,
        my_info,
        peer_info,
        &provider.get_properties(net_dev).name,
        net_dev,
        (proxy_rank != my_info.rank).then_some(proxy_rank),
        use_gdr,
        shared,
    );
    Ok(setup)
}

fn net_send_setup_agent_callback(
    setup_resources: Option<AnyResources>,
) -> Result<TransportSetup, NetTransportError> {
    let setup = setup_resources
        .ok_or(NetTransportError::DowncastSetupResources)?
        .downcast::<NetSendSetup>()
        .map_err(|_| NetTransportError::DowncastSetupResources)?;

    // Tell the peer which rank will drive our sends, so its receive proxy
    // can pool connections per sending proxy.
    let handle = ConnectHandle::serialize_from(setup.proxy_rank)?;
    Ok(TransportSetup::Setup {
        peer_connect_handle: handle,
        setup_resources: Some(setup),
    })
}

fn net_recv_setup(
    conn_id: &PeerConnId,
    my_info: &PeerInfo,
    peer_info: &PeerInfo,
    profile: &CommProfile,
    config: &NetTransportConfig,
) -> Result<TransportSetup, NetTransportError> {
    let shared = if profile.collective_graph {
        false
    } else {
        config.net_shared_buffers.unwrap_or(true)
    };
    // The receiver always uses its own NIC; remote recv proxies are not
    // supported.
    let (net_dev, _) = profile.get_network_device(conn_id.channel, my_info.rank, my_info.rank);
    let use_gdr = profile.check_gdr(my_info.rank, net_dev, false) && config.gdr_enable;
    let need_flush = use_gdr && profile.check_gdr_need_flush(my_info.rank);
    let provider = profile.get_net_provider();

    let setup_request = AgentSetupRequest {
        rank: my_info.rank,
        local_rank: my_info.local_rank,
        remote_rank: conn_id.peer_rank,
        net_device: net_dev,
        shared,
        use_gdr,
        need_flush,
        channel_id: conn_id.channel,
        conn_index: conn_id.conn_index,
        client_pid: my_info.pid,
        num_local_ranks: profile.num_local_ranks,
        num_channels: profile.p2p_num_channels,
        buffer_sizes: profile.buff_sizes,
        chunk_size: profile.p2p_chunk_size,
        alloc_ll_buffers: profile.alloc_p2p_net_ll_buffers,
        config: config.clone(),
        provider,
        device: profile.get_device_runtime(),
    };
    let setup = TransportSetup::PreAgentCb {
        agent_cuda_dev: my_info.cuda_device_idx,
        agent_request: Some(Box::new(setup_request)),
        setup_resources: None,
    };

    log_connection(
        "receive",
        conn_id.channel,
        conn_id.conn_index,
        peer_info,
        my_info,
        &provider.get_properties(net_dev).name,
        net_dev,
        None,
        use_gdr,
        shared,
    );
    Ok(setup)
}

fn net_recv_setup_agent_callback(
    agent_reply: AgentMessage,
    setup_resources: Option<AnyResources>,
) -> Result<TransportSetup, NetTransportError> {
    let reply = agent_reply
        .ok_or(NetTransportError::DowncastAgentReply)?
        .downcast::<AgentRecvSetupReply>()
        .map_err(|_| NetTransportError::DowncastAgentReply)?;
    // The provider listen handle goes into the connect-info blob so the
    // sender can dial us.
    Ok(TransportSetup::Setup {
        peer_connect_handle: reply.handle,
        setup_resources,
    })
}

fn net_send_connect(
    connect_handle: ConnectHandle,
    setup_resources: Option<AnyResources>,
) -> Result<TransportConnect, NetTransportError> {
    let request = AgentSendConnectRequest {
        handle: connect_handle,
    };
    Ok(TransportConnect::PreAgentCb {
        agent_request: Some(Box::new(request)),
        transport_resources: setup_resources,
    })
}

/// Resolve the GPU-visible connection view out of a connect-time map.
fn resolve_conn_info(map: &BufferMap) -> Result<PeerConnInfo, NetTransportError> {
    let send_mem = map
        .get_send_mem_meta()
        .ok_or(NetTransportError::InvalidAgentReply)?;
    let recv_mem = map
        .get_recv_mem_meta()
        .ok_or(NetTransportError::InvalidAgentReply)?;

    let tail = unsafe {
        let ptr = raw_field!(recv_mem.as_ptr_dev(), RecvBufMeta, tail);
        DeviceNonNull::new_unchecked(ptr as *mut u64)
    };
    let slots_sizes = unsafe {
        let ptr = raw_field!(recv_mem.as_ptr_dev(), RecvBufMeta, slots_sizes);
        DeviceNonNull::new_unchecked(ptr as *mut i32)
    };
    // Offsets are only meaningful when staging is fused into a shared arena.
    let slots_offsets = map.shared().then(|| unsafe {
        let ptr = raw_field!(recv_mem.as_ptr_dev(), RecvBufMeta, slots_offsets);
        DeviceNonNull::new_unchecked(ptr as *mut i32)
    });
    let head = unsafe {
        let ptr = raw_field!(send_mem.as_ptr_dev(), SendBufMeta, head);
        DeviceNonNull::new_unchecked(ptr as *mut u64)
    };

    let mut bufs = [None; NUM_PROTOCOLS];
    for proto in Protocol::iter() {
        bufs[proto as usize] = map.get_buffer_gpu_ptr(proto);
    }

    Ok(PeerConnInfo {
        bufs,
        head,
        tail,
        slots_sizes,
        slots_offsets,
    })
}

fn net_send_connect_agent_callback(
    agent_reply: AgentMessage,
    transport_resources: Option<AnyResources>,
) -> Result<TransportConnect, NetTransportError> {
    let reply = agent_reply
        .ok_or(NetTransportError::DowncastAgentReply)?
        .downcast::<AgentSendConnectReply>()
        .map_err(|_| NetTransportError::DowncastAgentReply)?;
    let setup = transport_resources
        .ok_or(NetTransportError::DowncastSetupResources)?
        .downcast::<NetSendSetup>()
        .map_err(|_| NetTransportError::DowncastSetupResources)?;
    let device = setup.device;
    let mut map = reply.map;

    if map.same_process() {
        if map.cuda_dev() != device.current_device() {
            device.enable_peer_access(map.cuda_dev())?;
        }
    } else {
        // Map the proxy process' host FIFO segment and device staging into
        // our address space.
        let path = map
            .bank_shm_path(MemoryBankType::HostMem)
            .ok_or(NetTransportError::InvalidAgentReply)?
            .to_string();
        let seg = ShmSegment::attach(&path, map.bank_size(MemoryBankType::HostMem))?;
        map.attach_bank(MemoryBankType::HostMem, BankAttach::Shm(seg));

        if map.bank_size(MemoryBankType::DeviceMem) > 0 {
            let handle = map
                .bank_ipc_handle(MemoryBankType::DeviceMem)
                .ok_or(NetTransportError::InvalidAgentReply)?
                .clone();
            let mapping = device.ipc_open(&handle)?;
            map.attach_bank(MemoryBankType::DeviceMem, BankAttach::Ipc(mapping));
        }
        if map.bank_size(MemoryBankType::SharedDeviceMem) > 0 {
            let handle = map
                .bank_ipc_handle(MemoryBankType::SharedDeviceMem)
                .ok_or(NetTransportError::InvalidAgentReply)?
                .clone();
            let mapping = shared_arena_mapping(device, &handle)?;
            map.attach_bank(MemoryBankType::SharedDeviceMem, BankAttach::SharedIpc(mapping));
        }
    }

    let mut conn_info = resolve_conn_info(&map)?;
    if let Some(gdc) = map.get_gdc_mem_gpu_ptr() {
        conn_info.head = gdc;
    }

    let resources = NetSendResources { map };
    Ok(TransportConnect::Connect {
        conn_info,
        transport_resources: Box::new(resources),
    })
}

fn net_recv_connect(
    connect_handle: ConnectHandle,
    setup_resources: Option<AnyResources>,
) -> Result<TransportConnect, NetTransportError> {
    let send_proxy_rank = connect_handle.deserialize_to::<usize>()?;
    log::debug!("peer send proxy rank is {send_proxy_rank}");
    let request = AgentRecvConnectRequest { send_proxy_rank };
    Ok(TransportConnect::PreAgentCb {
        agent_request: Some(Box::new(request)),
        transport_resources: setup_resources,
    })
}

fn net_recv_connect_agent_callback(
    agent_reply: AgentMessage,
) -> Result<TransportConnect, NetTransportError> {
    let reply = agent_reply
        .ok_or(NetTransportError::DowncastAgentReply)?
        .downcast::<AgentRecvConnectReply>()
        .map_err(|_| NetTransportError::DowncastAgentReply)?;
    let map = reply.map;

    let mut conn_info = resolve_conn_info(&map)?;
    if let Some(gdc) = map.get_gdc_mem_gpu_ptr() {
        conn_info.tail = gdc;
    }

    let resources = NetRecvResources { map };
    Ok(TransportConnect::Connect {
        conn_info,
        transport_resources: Box::new(resources),
    })
}

#[async_trait]
impl Transporter for NetTransport {
    #[inline]
    fn can_connect(
        &self,
        send_peer: &PeerInfo,
        recv_peer: &PeerInfo,
        profile: &CommProfile,
        _catalog: &TransportCatalog,
    ) -> bool {
        profile.check_net(send_peer, recv_peer)
    }

    fn send_setup(
        &self,
        conn_id: &PeerConnId,
        my_info: &PeerInfo,
        peer_info: &PeerInfo,
        profile: &CommProfile,
        catalog: &TransportCatalog,
    ) -> Result<TransportSetup, TransporterError> {
        let config = catalog.get_config::<NetTransportConfig>("NetTransport")?;
        let setup = net_send_setup(conn_id, my_info, peer_info, profile, &config)?;
        Ok(setup)
    }

    fn send_setup_agent_callback(
        &self,
        _rank: usize,
        _conn_id: &PeerConnId,
        _agent_reply: AgentMessage,
        setup_resources: Option<AnyResources>,
    ) -> Result<TransportSetup, TransporterError> {
        let setup = net_send_setup_agent_callback(setup_resources)?;
        Ok(setup)
    }

    fn send_connect(
        &self,
        _conn_id: &PeerConnId,
        connect_handle: ConnectHandle,
        setup_resources: Option<AnyResources>,
    ) -> Result<TransportConnect, TransporterError> {
        let connect = net_send_connect(connect_handle, setup_resources)?;
        Ok(connect)
    }

    fn send_connect_agent_callback(
        &self,
        _conn_id: &PeerConnId,
        agent_reply: AgentMessage,
        transport_resources: Option<AnyResources>,
    ) -> Result<TransportConnect, TransporterError> {
        let connect = net_send_connect_agent_callback(agent_reply, transport_resources)?;
        Ok(connect)
    }

    fn recv_setup(
        &self,
        conn_id: &PeerConnId,
        my_info: &PeerInfo,
        peer_info: &PeerInfo,
        profile: &CommProfile,
        catalog: &TransportCatalog,
    ) -> Result<TransportSetup, TransporterError> {
        let config = catalog.get_config::<NetTransportConfig>("NetTransport")?;
        let setup = net_recv_setup(conn_id, my_info, peer_info, profile, &config)?;
        Ok(setup)
    }

    fn recv_setup_agent_callback(
        &self,
        _rank: usize,
        _conn_id: &PeerConnId,
        agent_reply: AgentMessage,
        setup_resources: Option<AnyResources>,
    ) -> Result<TransportSetup, TransporterError> {
        let setup = net_recv_setup_agent_callback(agent_reply, setup_resources)?;
        Ok(setup)
    }

    fn recv_connect(
        &self,
        _conn_id: &PeerConnId,
        connect_handle: ConnectHandle,
        setup_resources: Option<AnyResources>,
    ) -> Result<TransportConnect, TransporterError> {
        let connect = net_recv_connect(connect_handle, setup_resources)?;
        Ok(connect)
    }

    fn recv_connect_agent_callback(
        &self,
        _conn_id: &PeerConnId,
        agent_reply: AgentMessage,
        _transport_resources: Option<AnyResources>,
    ) -> Result<TransportConnect, TransporterError> {
        let connect = net_recv_connect_agent_callback(agent_reply)?;
        Ok(connect)
    }

    async fn agent_shared_init(
        &self,
        _id: TransportAgentId,
        agent_request: AgentMessage,
        catalog: Arc<TransportCatalog>,
    ) -> Result<AnyResources, TransporterError> {
        let request = *agent_request
            .ok_or(NetAgentError::DowncastAgentRequest)?
            .downcast::<AgentSharedInitRequest>()
            .map_err(|_| NetAgentError::DowncastAgentRequest)?;
        let state = agent::agent_state(&catalog)?;
        let resources = agent::net_agent_shared_init(request, state).await?;
        Ok(Box::new(resources))
    }

    async fn agent_send_setup(
        &self,
        _id: TransportAgentId,
        agent_request: AgentMessage,
        catalog: Arc<TransportCatalog>,
    ) -> Result<(AnyResources, AgentMessage), TransporterError> {
        let request = *agent_request
            .ok_or(NetAgentError::DowncastAgentRequest)?
            .downcast::<AgentSetupRequest>()
            .map_err(|_| NetAgentError::DowncastAgentRequest)?;
        let state = agent::agent_state(&catalog)?;
        let setup = agent::net_agent_send_setup(request, state).await?;
        Ok((Box::new(setup), None))
    }

    async fn agent_send_connect(
        &self,
        _id: TransportAgentId,
        agent_request: AgentMessage,
        setup_resources: Option<AnyResources>,
    ) -> Result<(AnyResources, AgentMessage), TransporterError> {
        let request = *agent_request
            .ok_or(NetAgentError::DowncastAgentRequest)?
            .downcast::<AgentSendConnectRequest>()
            .map_err(|_| NetAgentError::DowncastAgentRequest)?;
        let setup = *setup_resources
            .ok_or(NetAgentError::DowncastAgentResources)?
            .downcast::<super::resources::AgentSendSetup>()
            .map_err(|_| NetAgentError::DowncastAgentResources)?;
        let (reply, resources) = agent::net_agent_send_connect(request, setup).await?;
        Ok((Box::new(resources), Some(Box::new(reply))))
    }

    async fn agent_recv_setup(
        &self,
        _id: TransportAgentId,
        agent_request: AgentMessage,
        catalog: Arc<TransportCatalog>,
    ) -> Result<(AnyResources, AgentMessage), TransporterError> {
        let request = *agent_request
            .ok_or(NetAgentError::DowncastAgentRequest)?
            .downcast::<AgentSetupRequest>()
            .map_err(|_| NetAgentError::DowncastAgentRequest)?;
        let state = agent::agent_state(&catalog)?;
        let (reply, setup) = agent::net_agent_recv_setup(request, state).await?;
        Ok((Box::new(setup), Some(Box::new(reply))))
    }

    async fn agent_recv_connect(
        &self,
        _id: TransportAgentId,
        agent_request: AgentMessage,
        setup_resources: Option<AnyResources>,
    ) -> Result<(AnyResources, AgentMessage), TransporterError> {
        let request = *agent_request
            .ok_or(NetAgentError::DowncastAgentRequest)?
            .downcast::<AgentRecvConnectRequest>()
            .map_err(|_| NetAgentError::DowncastAgentRequest)?;
        let setup = *setup_resources
            .ok_or(NetAgentError::DowncastAgentResources)?
            .downcast::<super::resources::AgentRecvSetup>()
            .map_err(|_| NetAgentError::DowncastAgentResources)?;
        let (reply, resources) = agent::net_agent_recv_connect(request, setup).await?;
        Ok((Box::new(resources), Some(Box::new(reply))))
    }

    fn agent_free(
        &self,
        _id: &TransportAgentId,
        resources: AnyResources,
    ) -> Result<(), TransporterError> {
        agent::net_agent_free(resources)?;
        Ok(())
    }

    fn agent_send_progress_op(
        &self,
        op: &mut TransportOp,
        resources: &mut ConnResourceTable,
    ) -> Result<(), TransporterError> {
        agent::net_agent_send_progress(resources, op)?;
        Ok(())
    }

    fn agent_recv_progress_op(
        &self,
        op: &mut TransportOp,
        resources: &mut ConnResourceTable,
    ) -> Result<(), TransporterError> {
        agent::net_agent_recv_progress(resources, op)?;
        Ok(())
    }
}
