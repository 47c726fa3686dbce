//! Proxy-side shared state: per-local-rank staging arenas reused by all
//! channels of a peer, and per-(device, peer) provider connections reused
//! across channels. Both are reference counted; the last releaser tears the
//! resource down. All access happens from the proxy thread; the mutexes are
//! only there to satisfy the `Send + Sync` bound of the catalog.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::{Arc, Mutex};

use crate::device::{DeviceAlloc, DeviceIpcHandle, DeviceRuntime, HostMappedAlloc};
use crate::transport::channel::{ChannelId, ConnType};
use crate::transport::transporter::ConnectHandle;
use crate::transport::NUM_SHARED_SLOTS;

use super::provider::{NetComm, NetProviderWrap};
use super::NetAgentError;

/// Catalog key under which the per-communicator net agent state lives.
pub const NET_AGENT_STATE_KEY: &str = "NetAgentState";

/// Byte offset of `(channel, slot)` inside a shared arena: arenas are
/// partitioned by channel first, then by round-robin slot.
#[inline]
pub fn shared_buffers_get(chunk_size: usize, channel: ChannelId, slot: usize) -> usize {
    chunk_size * (channel.0 as usize * NUM_SHARED_SLOTS + slot)
}

/// One direction's staging arena for a local rank.
#[derive(Default)]
pub struct SharedBufferSlot {
    refcount: usize,
    size: usize,
    device_buff: Option<DeviceAlloc>,
    host_buff: Option<HostMappedAlloc>,
    ipc: Option<DeviceIpcHandle>,
}

#[derive(Default)]
struct ProxyPeer {
    send: SharedBufferSlot,
    recv: SharedBufferSlot,
}

/// Non-owning view of an arena handed to one endpoint's map.
#[derive(Debug)]
pub struct SharedBufferView {
    pub cpu_ptr: *mut c_void,
    pub gpu_ptr: *mut c_void,
    pub size: usize,
    pub ipc: Option<DeviceIpcHandle>,
}

unsafe impl Send for SharedBufferView {}

struct SharedCommEntry {
    comm: Arc<NetComm>,
    refcount: usize,
}

#[derive(Default)]
struct SharedNetComms {
    send: HashMap<ChannelId, SharedCommEntry>,
    recv: HashMap<ChannelId, SharedCommEntry>,
}

#[derive(Default)]
pub struct NetAgentState {
    local_peers: Mutex<Vec<Option<ProxyPeer>>>,
    net_comms: Mutex<HashMap<(usize, usize), SharedNetComms>>,
}

impl NetAgentState {
    pub fn new() -> Self {
        Self::default()
    }

    /// First caller sizes and allocates the arena; later callers only bump
    /// the refcount. Host arenas are refused when the connection crosses
    /// processes: host memory cannot bridge a PXN path.
    #[allow(clippy::too_many_arguments)]
    pub fn shared_buffers_init(
        &self,
        device: &'static dyn DeviceRuntime,
        cuda: bool,
        local_rank: usize,
        num_local_ranks: usize,
        conn_type: ConnType,
        same_process: bool,
        num_channels: u32,
        chunk_size: usize,
    ) -> Result<SharedBufferView, NetAgentError> {
        if !cuda && !same_process {
            return Err(NetAgentError::CrossProcessHostBuffer);
        }
        let mut peers = self.local_peers.lock().unwrap();
        if peers.is_empty() {
            peers.resize_with(num_local_ranks, || None);
        }
        let peer = peers[local_rank].get_or_insert_with(ProxyPeer::default);
        let state = match conn_type {
            ConnType::Send => &mut peer.send,
            ConnType::Recv => &mut peer.recv,
        };
        state.refcount += 1;
        if state.size == 0 {
            state.size = num_channels as usize * NUM_SHARED_SLOTS * chunk_size;
        }
        if cuda && state.device_buff.is_none() {
            let buff = device.alloc_device(state.size)?;
            if !same_process {
                state.ipc = Some(device.ipc_export(buff.as_ptr() as *mut c_void, state.size)?);
            }
            state.device_buff = Some(buff);
        }
        if !cuda && state.host_buff.is_none() {
            state.host_buff = Some(device.alloc_host_mapped(state.size)?);
        }
        let (cpu_ptr, gpu_ptr) = if cuda {
            let ptr = state.device_buff.as_ref().unwrap().as_ptr() as *mut c_void;
            (ptr, if same_process { ptr } else { std::ptr::null_mut() })
        } else {
            let buff = state.host_buff.as_ref().unwrap();
            (
                buff.as_ptr_host() as *mut c_void,
                buff.as_ptr_dev() as *mut c_void,
            )
        };
        Ok(SharedBufferView {
            cpu_ptr,
            gpu_ptr,
            size: state.size,
            ipc: state.ipc.clone(),
        })
    }

    /// Drop one reference to an arena; the last one frees the backing
    /// allocation, then the peer entry, then the whole table.
    pub fn shared_buffers_destroy(
        &self,
        local_rank: usize,
        conn_type: ConnType,
    ) -> Result<(), NetAgentError> {
        let mut peers = self.local_peers.lock().unwrap();
        let peer = peers
            .get_mut(local_rank)
            .and_then(|p| p.as_mut())
            .ok_or(NetAgentError::SharedPoolCorrupted(local_rank))?;
        let state = match conn_type {
            ConnType::Send => &mut peer.send,
            ConnType::Recv => &mut peer.recv,
        };
        if state.size == 0 || state.refcount == 0 {
            return Err(NetAgentError::SharedPoolCorrupted(local_rank));
        }
        state.refcount -= 1;
        if state.refcount == 0 {
            state.device_buff = None;
            state.host_buff = None;
            state.ipc = None;
        }
        if peer.send.refcount == 0 && peer.recv.refcount == 0 {
            peers[local_rank] = None;
            if peers.iter().all(|p| p.is_none()) {
                peers.clear();
            }
        }
        Ok(())
    }

    /// Connect-or-reuse the send endpoint for `(net_dev, remote_rank,
    /// channel)`. Only the first caller talks to the provider.
    pub async fn get_or_connect_send(
        &self,
        provider: &'static dyn NetProviderWrap,
        net_dev: usize,
        remote_rank: usize,
        channel: ChannelId,
        handle: &ConnectHandle,
    ) -> Result<Arc<NetComm>, NetAgentError> {
        {
            let mut comms = self.net_comms.lock().unwrap();
            if let Some(entry) = comms
                .get_mut(&(net_dev, remote_rank))
                .and_then(|c| c.send.get_mut(&channel))
            {
                entry.refcount += 1;
                return Ok(Arc::clone(&entry.comm));
            }
        }
        let comm = NetComm::new(provider.connect(net_dev, handle).await?);
        let mut comms = self.net_comms.lock().unwrap();
        let entry = comms
            .entry((net_dev, remote_rank))
            .or_default()
            .send
            .entry(channel)
            .or_insert_with(|| SharedCommEntry {
                comm,
                refcount: 0,
            });
        entry.refcount += 1;
        Ok(Arc::clone(&entry.comm))
    }

    /// Accept-or-reuse the receive endpoint. On reuse the caller's listen
    /// comm is simply dropped; the peer never dialed a second connection.
    pub async fn get_or_accept_recv(
        &self,
        provider: &'static dyn NetProviderWrap,
        net_dev: usize,
        proxy_rank: usize,
        channel: ChannelId,
        listen_comm: Box<dyn std::any::Any + Send>,
    ) -> Result<Arc<NetComm>, NetAgentError> {
        {
            let mut comms = self.net_comms.lock().unwrap();
            if let Some(entry) = comms
                .get_mut(&(net_dev, proxy_rank))
                .and_then(|c| c.recv.get_mut(&channel))
            {
                entry.refcount += 1;
                return Ok(Arc::clone(&entry.comm));
            }
        }
        let comm = NetComm::new(provider.accept(listen_comm).await?);
        let mut comms = self.net_comms.lock().unwrap();
        let entry = comms
            .entry((net_dev, proxy_rank))
            .or_default()
            .recv
            .entry(channel)
            .or_insert_with(|| SharedCommEntry {
                comm,
                refcount: 0,
            });
        entry.refcount += 1;
        Ok(Arc::clone(&entry.comm))
    }

    /// Release one user of a pooled endpoint; the entry (and with it the
    /// provider connection, once the endpoint's own handle drops) goes away
    /// at refcount zero.
    pub fn release_comm(
        &self,
        net_dev: usize,
        peer_rank: usize,
        channel: ChannelId,
        conn_type: ConnType,
    ) {
        let mut comms = self.net_comms.lock().unwrap();
        let Some(shared) = comms.get_mut(&(net_dev, peer_rank)) else {
            return;
        };
        let table = match conn_type {
            ConnType::Send => &mut shared.send,
            ConnType::Recv => &mut shared.recv,
        };
        if let Some(entry) = table.get_mut(&channel) {
            entry.refcount -= 1;
            if entry.refcount == 0 {
                table.remove(&channel);
            }
        }
        if shared.send.is_empty() && shared.recv.is_empty() {
            comms.remove(&(net_dev, peer_rank));
        }
    }

    pub(crate) fn send_comm_refcount(
        &self,
        net_dev: usize,
        remote_rank: usize,
        channel: ChannelId,
    ) -> Option<usize> {
        self.net_comms
            .lock()
            .unwrap()
            .get(&(net_dev, remote_rank))
            .and_then(|c| c.send.get(&channel))
            .map(|e| e.refcount)
    }

    pub(crate) fn buffer_refcount(&self, local_rank: usize, conn_type: ConnType) -> usize {
        let peers = self.local_peers.lock().unwrap();
        peers
            .get(local_rank)
            .and_then(|p| p.as_ref())
            .map(|p| match conn_type {
                ConnType::Send => p.send.refcount,
                ConnType::Recv => p.recv.refcount,
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sysmem::SysmemDevice;
    use once_cell::sync::Lazy;

    static TEST_DEVICE: Lazy<SysmemDevice> = Lazy::new(SysmemDevice::new);

    #[test]
    fn arena_offsets_partition_by_channel_then_slot() {
        let chunk = 1 << 17;
        // Distinct (channel, slot) pairs never overlap.
        let mut seen = std::collections::HashSet::new();
        for c in 0..4u32 {
            for s in 0..NUM_SHARED_SLOTS {
                let offset = shared_buffers_get(chunk, ChannelId(c), s);
                assert_eq!(offset, chunk * (c as usize * NUM_SHARED_SLOTS + s));
                assert!(seen.insert(offset));
            }
        }
        // Slots of one channel are contiguous chunks.
        assert_eq!(
            shared_buffers_get(chunk, ChannelId(1), 0)
                - shared_buffers_get(chunk, ChannelId(0), NUM_SHARED_SLOTS - 1),
            chunk
        );
    }

    #[test]
    fn buffer_pool_refcounts_and_frees() {
        let state = NetAgentState::new();
        let device: &'static SysmemDevice = &TEST_DEVICE;
        let view1 = state
            .shared_buffers_init(device, true, 0, 2, ConnType::Send, true, 2, 4096)
            .unwrap();
        let view2 = state
            .shared_buffers_init(device, true, 0, 2, ConnType::Send, true, 2, 4096)
            .unwrap();
        assert_eq!(view1.cpu_ptr, view2.cpu_ptr);
        assert_eq!(view1.size, 2 * NUM_SHARED_SLOTS * 4096);
        assert_eq!(state.buffer_refcount(0, ConnType::Send), 2);

        state.shared_buffers_destroy(0, ConnType::Send).unwrap();
        assert_eq!(state.buffer_refcount(0, ConnType::Send), 1);
        state.shared_buffers_destroy(0, ConnType::Send).unwrap();
        assert_eq!(state.buffer_refcount(0, ConnType::Send), 0);
        // A further destroy reports a broken pool.
        assert!(state.shared_buffers_destroy(0, ConnType::Send).is_err());
    }

    #[test]
    fn cross_process_host_arena_is_refused() {
        let state = NetAgentState::new();
        let device: &'static SysmemDevice = &TEST_DEVICE;
        let err = state
            .shared_buffers_init(device, false, 0, 1, ConnType::Send, false, 1, 4096)
            .unwrap_err();
        assert!(matches!(err, NetAgentError::CrossProcessHostBuffer));
    }
}
