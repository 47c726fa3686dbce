use serde::{Deserialize, Serialize};

/// Tunables of the net transport, registered in the catalog under
/// `"NetTransport"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetTransportConfig {
    /// Gate on GPU-Direct RDMA; the topology check must also pass.
    pub gdr_enable: bool,
    /// `Some(false)` forces dedicated per-channel buffers, `Some(true)`
    /// forces shared arenas; `None` picks shared unless the connection is
    /// built for a ring/tree graph.
    pub net_shared_buffers: Option<bool>,
    /// Reuse one provider connection per (device, peer) across channels when
    /// the provider can post multi-buffer receives.
    pub net_shared_comms: bool,
    /// Place the send-side `head` / recv-side `tail` words in GDC memory.
    pub gdr_copy_sync_enable: bool,
    /// Flush GDR receives with a GDC PCIe read instead of a provider flush.
    pub gdr_copy_flush_enable: bool,
}

impl Default for NetTransportConfig {
    fn default() -> Self {
        NetTransportConfig {
            gdr_enable: true,
            net_shared_buffers: None,
            net_shared_comms: true,
            gdr_copy_sync_enable: true,
            gdr_copy_flush_enable: false,
        }
    }
}
