use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::device::DeviceRuntime;
use crate::transport::channel::ChannelId;
use crate::transport::net::provider::NetProviderWrap;
use crate::transport::NUM_PROTOCOLS;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommunicatorId(pub u32);

#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub rank: usize,
    pub local_rank: usize,
    pub host: IpAddr,
    pub pid: u32,
    pub cuda_device_idx: i32,
}

/// Per-communicator settings and topology lookups the transport needs.
///
/// The graph search that fills these tables lives outside this crate; the
/// transport only consumes the answers.
pub struct CommProfile {
    pub buff_sizes: [usize; NUM_PROTOCOLS],
    /// Chunk size used to partition shared staging arenas.
    pub p2p_chunk_size: usize,
    /// Number of channels sharing the per-local-rank arenas.
    pub p2p_num_channels: u32,
    pub num_local_ranks: usize,
    /// Set when connections are built for a ring/tree collective graph, which
    /// always gets dedicated per-channel buffers.
    pub collective_graph: bool,
    /// Allocate a dedicated LL buffer even in shared (fused) mode.
    pub alloc_p2p_net_ll_buffers: bool,
    /// channel -> network device; empty means device 0 everywhere.
    pub channel_net_devices: Vec<usize>,
    /// rank -> substitute proxy rank when the NIC is driven from a neighbor
    /// process (PXN); `None` means the rank drives its own NIC.
    pub pxn_proxy_ranks: Vec<Option<usize>>,
    /// Whether GPU-Direct RDMA is permitted for (read, write) access.
    pub gdr_read: bool,
    pub gdr_write: bool,
    /// Whether a GDR receive must be flushed before publishing the tail.
    pub gdr_need_flush: bool,
    /// Whether NIC traffic between two ranks of the same host is allowed.
    pub intra_node_net: bool,
    pub peers: Vec<PeerInfo>,
    pub provider: &'static dyn NetProviderWrap,
    pub device: &'static dyn DeviceRuntime,
}

impl CommProfile {
    #[inline]
    pub fn get_local_rank(&self, rank: usize) -> usize {
        self.peers[rank].local_rank
    }

    #[inline]
    pub fn get_cuda_device_idx(&self, rank: usize) -> i32 {
        self.peers[rank].cuda_device_idx
    }

    /// Returns `(net_device, proxy_rank)` for one connection. The proxy rank
    /// is the rank whose process drives the NIC; it differs from `rank` only
    /// in PXN setups.
    #[inline]
    pub fn get_network_device(
        &self,
        channel: ChannelId,
        rank: usize,
        _peer_rank: usize,
    ) -> (usize, usize) {
        let net_dev = if self.channel_net_devices.is_empty() {
            0
        } else {
            self.channel_net_devices[channel.0 as usize % self.channel_net_devices.len()]
        };
        let proxy_rank = self
            .pxn_proxy_ranks
            .get(rank)
            .copied()
            .flatten()
            .unwrap_or(rank);
        (net_dev, proxy_rank)
    }

    #[inline]
    pub fn check_gdr(&self, _rank: usize, _net_dev: usize, read: bool) -> bool {
        if read {
            self.gdr_read
        } else {
            self.gdr_write
        }
    }

    #[inline]
    pub fn check_gdr_need_flush(&self, _rank: usize) -> bool {
        self.gdr_need_flush
    }

    /// Whether the NIC may carry traffic between two ranks on the same host.
    #[inline]
    pub fn check_net(&self, info1: &PeerInfo, info2: &PeerInfo) -> bool {
        if info1.host == info2.host {
            self.intra_node_net
        } else {
            true
        }
    }

    #[inline]
    pub fn get_net_provider(&self) -> &'static dyn NetProviderWrap {
        self.provider
    }

    #[inline]
    pub fn get_device_runtime(&self) -> &'static dyn DeviceRuntime {
        self.device
    }
}
