use std::sync::Arc;

use crate::comm::PeerInfo;
use crate::device::{DeviceRuntime, GdcAlloc};
use crate::transport::channel::{ChannelId, ConnType};
use crate::transport::meta::{RecvBufMeta, SendBufMeta};
use crate::transport::transporter::ConnectHandle;
use crate::transport::NUM_PROTOCOLS;

use super::buffer::BufferMap;
use super::config::NetTransportConfig;
use super::provider::{AnyMrHandle, AnyNetComm, NetComm, NetProviderWrap};
use super::shared::NetAgentState;

/// Setup request shipped from the kernel side to the proxy agent. Everything
/// the agent needs to build the connection travels in here; the agent never
/// reaches back into the communicator.
pub struct AgentSetupRequest {
    pub rank: usize,
    pub local_rank: usize,
    pub remote_rank: usize,
    pub net_device: usize,
    pub shared: bool,
    pub use_gdr: bool,
    pub need_flush: bool,
    pub channel_id: ChannelId,
    pub conn_index: u32,
    /// Pid of the requesting process; the agent compares it with its own to
    /// detect a cross-process (PXN) connection.
    pub client_pid: u32,
    pub num_local_ranks: usize,
    pub num_channels: u32,
    pub buffer_sizes: [usize; NUM_PROTOCOLS],
    pub chunk_size: usize,
    pub alloc_ll_buffers: bool,
    pub config: NetTransportConfig,
    pub provider: &'static dyn NetProviderWrap,
    pub device: &'static dyn DeviceRuntime,
}

/// Shared-state-only initialization (preconnect): reserves the local peer's
/// staging arena without opening a connection.
pub struct AgentSharedInitRequest {
    pub local_rank: usize,
    pub num_local_ranks: usize,
    pub conn_type: ConnType,
    pub client_pid: u32,
    pub num_channels: u32,
    pub chunk_size: usize,
    pub device: &'static dyn DeviceRuntime,
}

pub struct AgentSendConnectRequest {
    /// The peer proxy's provider listen handle.
    pub handle: ConnectHandle,
}

pub struct AgentRecvConnectRequest {
    /// Rank of the proxy driving the peer's sends, which is where our
    /// pooled connection to the peer actually terminates.
    pub send_proxy_rank: usize,
}

pub struct AgentRecvSetupReply {
    pub handle: ConnectHandle,
}

pub struct AgentSendConnectReply {
    pub map: BufferMap,
}

pub struct AgentRecvConnectReply {
    pub map: BufferMap,
}

/// Kernel-side setup state kept between `send_setup` and `send_connect`.
pub struct NetSendSetup {
    pub proxy_rank: usize,
    pub device: &'static dyn DeviceRuntime,
}

/// Kernel-side connected resources: the map keeps bank attachments (shm,
/// device IPC) alive for the lifetime of the connection.
pub struct NetSendResources {
    pub map: BufferMap,
}

pub struct NetRecvResources {
    pub map: BufferMap,
}

/// Agent-side state between setup and connect.
pub struct AgentSendSetup {
    pub rank: usize,
    pub local_rank: usize,
    pub remote_rank: usize,
    pub net_device: usize,
    pub shared: bool,
    pub use_gdr: bool,
    pub use_dma_buf: bool,
    pub max_recvs: usize,
    pub channel_id: ChannelId,
    pub conn_index: u32,
    pub same_process: bool,
    pub num_local_ranks: usize,
    pub num_channels: u32,
    pub buffer_sizes: [usize; NUM_PROTOCOLS],
    pub chunk_size: usize,
    pub alloc_ll_buffers: bool,
    pub config: NetTransportConfig,
    pub provider: &'static dyn NetProviderWrap,
    pub device: &'static dyn DeviceRuntime,
    pub state: Arc<NetAgentState>,
}

pub struct AgentRecvSetup {
    pub listen_comm: Box<AnyNetComm>,
    pub rank: usize,
    pub local_rank: usize,
    pub remote_rank: usize,
    pub net_device: usize,
    pub shared: bool,
    pub use_gdr: bool,
    pub use_dma_buf: bool,
    pub need_flush: bool,
    pub max_recvs: usize,
    pub channel_id: ChannelId,
    pub conn_index: u32,
    pub same_process: bool,
    pub num_local_ranks: usize,
    pub num_channels: u32,
    pub buffer_sizes: [usize; NUM_PROTOCOLS],
    pub chunk_size: usize,
    pub alloc_ll_buffers: bool,
    pub config: NetTransportConfig,
    pub provider: &'static dyn NetProviderWrap,
    pub device: &'static dyn DeviceRuntime,
    pub state: Arc<NetAgentState>,
}

/// One send endpoint owned by the proxy: the connect-time map, the provider
/// comm, CPU views of the FIFO records, per-protocol staging pointers and
/// registered-memory handles, and the monotone step counter.
pub struct AgentSendResources {
    pub map: BufferMap,
    pub send_comm: Arc<NetComm>,
    pub send_mem: *mut SendBufMeta,
    pub recv_mem: *mut RecvBufMeta,
    pub rank: usize,
    pub local_rank: usize,
    pub remote_rank: usize,
    pub net_device: usize,
    pub channel_id: ChannelId,
    pub conn_index: u32,
    pub shared: bool,
    pub use_gdr: bool,
    pub use_dma_buf: bool,
    pub max_recvs: usize,
    pub chunk_size: usize,
    /// Head word in GDC memory, null when GDC sync is off.
    pub gdc_sync: *mut u64,
    pub gdr_desc: Option<GdcAlloc>,
    pub buffers: [*mut u8; NUM_PROTOCOLS],
    pub buffer_sizes: [usize; NUM_PROTOCOLS],
    pub mr_handles: [Option<Box<AnyMrHandle>>; NUM_PROTOCOLS],
    pub step: u64,
    /// Whether `send_comm` came out of the shared connection pool.
    pub pooled_comm: bool,
    pub provider: &'static dyn NetProviderWrap,
    pub device: &'static dyn DeviceRuntime,
    pub state: Arc<NetAgentState>,
}

unsafe impl Send for AgentSendResources {}

pub struct AgentRecvResources {
    pub map: BufferMap,
    pub recv_comm: Arc<NetComm>,
    pub send_mem: *mut SendBufMeta,
    pub recv_mem: *mut RecvBufMeta,
    pub rank: usize,
    pub local_rank: usize,
    pub remote_rank: usize,
    /// The peer's send-side proxy rank; keys the shared connection pool.
    pub proxy_rank: usize,
    pub net_device: usize,
    pub channel_id: ChannelId,
    pub conn_index: u32,
    pub shared: bool,
    pub use_gdr: bool,
    pub use_dma_buf: bool,
    pub need_flush: bool,
    pub max_recvs: usize,
    pub chunk_size: usize,
    pub gdc_sync: *mut u64,
    /// One-word PCIe read target used as the GDR flush, null unless enabled.
    pub gdc_flush: *mut u64,
    pub gdr_desc: Option<GdcAlloc>,
    pub buffers: [*mut u8; NUM_PROTOCOLS],
    pub buffer_sizes: [usize; NUM_PROTOCOLS],
    pub mr_handles: [Option<Box<AnyMrHandle>>; NUM_PROTOCOLS],
    pub step: u64,
    pub pooled_comm: bool,
    pub provider: &'static dyn NetProviderWrap,
    pub device: &'static dyn DeviceRuntime,
    pub state: Arc<NetAgentState>,
}

unsafe impl Send for AgentRecvResources {}

/// Resources of a connection that only ever went through shared-init.
pub struct NetSharedInitResources {
    pub local_rank: usize,
    pub conn_type: ConnType,
    pub state: Arc<NetAgentState>,
}

/// Log banner for one side of a connection, mirroring what operators expect
/// to grep for when debugging NIC selection.
#[allow(clippy::too_many_arguments)]
pub fn log_connection(
    direction: &str,
    channel: ChannelId,
    conn_index: u32,
    from: &PeerInfo,
    to: &PeerInfo,
    net_name: &str,
    net_dev: usize,
    proxy_rank: Option<usize>,
    use_gdr: bool,
    shared: bool,
) {
    let proxy = proxy_rank.map(|r| format!("({})", r)).unwrap_or_default();
    log::info!(
        "Channel {:0>2}/{} : {} -> {} [{}] via NET/{}/{}{}{}{}",
        channel,
        conn_index,
        from.rank,
        to.rank,
        direction,
        net_name,
        net_dev,
        proxy,
        if use_gdr { "/GDRDMA" } else { "" },
        if shared { "/Shared" } else { "" },
    );
}
