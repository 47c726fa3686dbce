//! Scenario tests for the net transport, driven against a scripted
//! in-memory provider so every provider interaction is observable.

use std::any::Any;
use std::collections::HashMap;
use std::ffi::c_void;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::ptr::{addr_of, addr_of_mut};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::executor::block_on;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::comm::CommunicatorId;
use crate::device::sysmem::SysmemDevice;
use crate::transport::channel::{ChannelId, ConnType, PeerConnId};
use crate::transport::meta::{RecvBufMeta, SendBufMeta};
use crate::transport::op::{TransportOp, TransportOpState, TransportSubOp};
use crate::transport::transporter::{ConnResourceTable, ConnectHandle, TransportAgentId};
use crate::transport::{Protocol, NUM_BUFFER_SLOTS, NUM_PROTOCOLS, NUM_SHARED_SLOTS};

use super::agent::{
    net_agent_free, net_agent_recv_connect, net_agent_recv_progress, net_agent_recv_setup,
    net_agent_send_connect, net_agent_send_progress, net_agent_send_setup, net_agent_shared_init,
};
use super::config::NetTransportConfig;
use super::provider::{
    AnyMrHandle, AnyNetComm, MemoryRegion, NetComm, NetListener, NetProperties, NetProvider,
    NetRequestId, PtrSupport,
};
use super::resources::{
    AgentRecvConnectRequest, AgentRecvResources, AgentSendConnectRequest, AgentSendResources,
    AgentSetupRequest, AgentSharedInitRequest,
};
use super::shared::{shared_buffers_get, NetAgentState};
use super::NetAgentError;

// ---------------------------------------------------------------------------
// Scripted provider
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
enum MockError {
    #[error("no pending connection for listener {0}")]
    NoPendingConnection(u64),
    #[error("message of {send} bytes overflows buffer of {capacity}")]
    Overflow { send: usize, capacity: usize },
    #[error("unknown request {0}")]
    UnknownRequest(u32),
    #[error("bad comm object")]
    BadComm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MockHandle {
    key: u64,
}

#[derive(Default)]
struct MockConnInner {
    messages: Vec<(u32, Vec<u8>)>,
}

type MockConn = Arc<Mutex<MockConnInner>>;

struct MockListenComm {
    key: u64,
}

struct MockSendComm {
    conn: MockConn,
    stats: Arc<MockStats>,
}

impl Drop for MockSendComm {
    fn drop(&mut self) {
        self.stats.send_closes.fetch_add(1, Ordering::Relaxed);
    }
}

struct MockRecvComm {
    conn: MockConn,
}

struct MockMrHandle;

struct MockRecvSlot {
    ptr: *mut u8,
    capacity: usize,
    tag: u32,
    received: Option<usize>,
}

unsafe impl Send for MockRecvSlot {}

enum MockRequest {
    Send,
    Recv {
        conn: MockConn,
        slots: Vec<MockRecvSlot>,
    },
    Flush,
}

#[derive(Default)]
struct MockStats {
    connects: AtomicUsize,
    accepts: AtomicUsize,
    isends: Mutex<Vec<(usize, u32)>>,
    irecv_batches: Mutex<Vec<usize>>,
    iflushes: AtomicUsize,
    send_closes: AtomicUsize,
}

struct MockNetProvider {
    props: NetProperties,
    pending_conns: Mutex<HashMap<u64, MockConn>>,
    requests: Mutex<HashMap<u32, MockRequest>>,
    next_key: AtomicU64,
    next_request: AtomicU32,
    refuse_sends: AtomicUsize,
    stats: Arc<MockStats>,
}

impl MockNetProvider {
    fn leaked(max_recvs: usize) -> &'static MockNetProvider {
        Box::leak(Box::new(MockNetProvider {
            props: NetProperties {
                name: "mock".to_string(),
                pci_path: String::new(),
                guid: 0,
                ptr_support: PtrSupport::PTR_HOST | PtrSupport::PTR_CUDA,
                speed: 100_000,
                port: 1,
                latency: 0.0,
                max_comms: 1024,
                max_recvs,
            },
            pending_conns: Mutex::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
            next_key: AtomicU64::new(1),
            next_request: AtomicU32::new(1),
            refuse_sends: AtomicUsize::new(0),
            stats: Arc::new(MockStats::default()),
        }))
    }
}

fn comm_mut<T: Any>(comm: Pin<&mut AnyNetComm>) -> Result<&mut T, MockError> {
    let comm = unsafe { comm.get_unchecked_mut() };
    comm.downcast_mut::<T>().ok_or(MockError::BadComm)
}

#[async_trait]
impl NetProvider for MockNetProvider {
    type NetError = MockError;
    type NetHandle = MockHandle;

    fn init(&self) -> Result<(), MockError> {
        Ok(())
    }

    fn get_num_devices(&self) -> usize {
        1
    }

    fn get_properties(&self, _device: usize) -> &NetProperties {
        &self.props
    }

    async fn listen(&self, _device: usize) -> Result<NetListener<MockHandle>, MockError> {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        Ok(NetListener {
            handle: MockHandle { key },
            listen_comm: Box::new(MockListenComm { key }),
        })
    }

    async fn connect(
        &self,
        _device: usize,
        handle: MockHandle,
    ) -> Result<Box<AnyNetComm>, MockError> {
        let conn: MockConn = Arc::new(Mutex::new(MockConnInner::default()));
        self.pending_conns
            .lock()
            .unwrap()
            .insert(handle.key, Arc::clone(&conn));
        self.stats.connects.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MockSendComm {
            conn,
            stats: Arc::clone(&self.stats),
        }))
    }

    async fn accept(&self, listen_comm: Box<AnyNetComm>) -> Result<Box<AnyNetComm>, MockError> {
        let listen_comm = listen_comm
            .downcast::<MockListenComm>()
            .map_err(|_| MockError::BadComm)?;
        let conn = self
            .pending_conns
            .lock()
            .unwrap()
            .remove(&listen_comm.key)
            .ok_or(MockError::NoPendingConnection(listen_comm.key))?;
        self.stats.accepts.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MockRecvComm { conn }))
    }

    fn register_mr(
        &self,
        _comm: Pin<&mut AnyNetComm>,
        _mr: MemoryRegion,
    ) -> Result<Box<AnyMrHandle>, MockError> {
        Ok(Box::new(MockMrHandle))
    }

    fn register_mr_dma_buf(
        &self,
        _comm: Pin<&mut AnyNetComm>,
        _mr: MemoryRegion,
        _offset: u64,
        _fd: RawFd,
    ) -> Result<Box<AnyMrHandle>, MockError> {
        Ok(Box::new(MockMrHandle))
    }

    fn deregister_mr(
        &self,
        _comm: Pin<&mut AnyNetComm>,
        _handle: Box<AnyMrHandle>,
    ) -> Result<(), MockError> {
        Ok(())
    }

    fn initiate_send(
        &self,
        send_comm: Pin<&mut AnyNetComm>,
        data: *mut c_void,
        size: usize,
        tag: u32,
        _mr_handle: &AnyMrHandle,
    ) -> Result<Option<NetRequestId>, MockError> {
        if self
            .refuse_sends
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(None);
        }
        let comm = comm_mut::<MockSendComm>(send_comm)?;
        let payload = unsafe { std::slice::from_raw_parts(data as *const u8, size) }.to_vec();
        comm.conn.lock().unwrap().messages.push((tag, payload));
        self.stats.isends.lock().unwrap().push((size, tag));
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        self.requests
            .lock()
            .unwrap()
            .insert(id, MockRequest::Send);
        Ok(Some(NetRequestId(id)))
    }

    fn initiate_recv(
        &self,
        recv_comm: Pin<&mut AnyNetComm>,
        data: &[*mut c_void],
        sizes: &[usize],
        tags: &[u32],
        _mr_handles: &[&AnyMrHandle],
    ) -> Result<Option<NetRequestId>, MockError> {
        let comm = comm_mut::<MockRecvComm>(recv_comm)?;
        let slots = (0..data.len())
            .map(|i| MockRecvSlot {
                ptr: data[i] as *mut u8,
                capacity: sizes[i],
                tag: tags[i],
                received: None,
            })
            .collect();
        self.stats.irecv_batches.lock().unwrap().push(data.len());
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().unwrap().insert(
            id,
            MockRequest::Recv {
                conn: Arc::clone(&comm.conn),
                slots,
            },
        );
        Ok(Some(NetRequestId(id)))
    }

    fn initiate_flush(
        &self,
        _recv_comm: Pin<&mut AnyNetComm>,
        data: &[*mut c_void],
        _sizes: &[usize],
        _mr_handles: &[&AnyMrHandle],
    ) -> Result<Option<NetRequestId>, MockError> {
        assert!(!data.is_empty());
        self.stats.iflushes.fetch_add(1, Ordering::Relaxed);
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        self.requests
            .lock()
            .unwrap()
            .insert(id, MockRequest::Flush);
        Ok(Some(NetRequestId(id)))
    }

    fn test(
        &self,
        request: NetRequestId,
        sizes: Option<&mut [usize]>,
    ) -> Result<bool, MockError> {
        let mut requests = self.requests.lock().unwrap();
        let entry = requests
            .get_mut(&request.0)
            .ok_or(MockError::UnknownRequest(request.0))?;
        let done = match entry {
            MockRequest::Send | MockRequest::Flush => true,
            MockRequest::Recv { conn, slots } => {
                let mut conn = conn.lock().unwrap();
                for slot in slots.iter_mut() {
                    if slot.received.is_some() {
                        continue;
                    }
                    if let Some(pos) = conn.messages.iter().position(|(tag, _)| *tag == slot.tag) {
                        let (_, payload) = conn.messages.remove(pos);
                        if payload.len() > slot.capacity {
                            return Err(MockError::Overflow {
                                send: payload.len(),
                                capacity: slot.capacity,
                            });
                        }
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                payload.as_ptr(),
                                slot.ptr,
                                payload.len(),
                            );
                        }
                        slot.received = Some(payload.len());
                    }
                }
                if slots.iter().all(|s| s.received.is_some()) {
                    if let Some(sizes) = sizes {
                        for (i, slot) in slots.iter().enumerate() {
                            if i < sizes.len() {
                                sizes[i] = slot.received.unwrap_or(0);
                            }
                        }
                    }
                    true
                } else {
                    false
                }
            }
        };
        if done {
            requests.remove(&request.0);
        }
        Ok(done)
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn agent_id(peer: usize, channel: u32, conn_index: u32, conn_type: ConnType) -> TransportAgentId {
    TransportAgentId {
        communicator_id: CommunicatorId(42),
        client_rank: 0,
        client_cuda_dev: 0,
        peer_conn: PeerConnId {
            peer_rank: peer,
            channel: ChannelId(channel),
            conn_index,
            conn_type,
        },
    }
}

struct SetupParams {
    shared: bool,
    use_gdr: bool,
    need_flush: bool,
    channel: u32,
    conn_index: u32,
    client_pid: u32,
    num_channels: u32,
    buffer_sizes: [usize; NUM_PROTOCOLS],
    chunk_size: usize,
    config: NetTransportConfig,
}

impl Default for SetupParams {
    fn default() -> Self {
        SetupParams {
            shared: false,
            use_gdr: true,
            need_flush: false,
            channel: 0,
            conn_index: 0,
            client_pid: std::process::id(),
            num_channels: 2,
            buffer_sizes: [4096, 8192, 8 * NUM_BUFFER_SLOTS * 16],
            chunk_size: 1024,
            config: NetTransportConfig {
                gdr_enable: true,
                gdr_copy_sync_enable: false,
                ..Default::default()
            },
        }
    }
}

fn setup_request(
    params: &SetupParams,
    provider: &'static MockNetProvider,
    device: &'static SysmemDevice,
) -> AgentSetupRequest {
    AgentSetupRequest {
        rank: 0,
        local_rank: 0,
        remote_rank: 1,
        net_device: 0,
        shared: params.shared,
        use_gdr: params.use_gdr,
        need_flush: params.need_flush,
        channel_id: ChannelId(params.channel),
        conn_index: params.conn_index,
        client_pid: params.client_pid,
        num_local_ranks: 2,
        num_channels: params.num_channels,
        buffer_sizes: params.buffer_sizes,
        chunk_size: params.chunk_size,
        alloc_ll_buffers: false,
        config: params.config.clone(),
        provider,
        device,
    }
}

fn connect_send(
    params: &SetupParams,
    provider: &'static MockNetProvider,
    device: &'static SysmemDevice,
    state: Arc<NetAgentState>,
) -> AgentSendResources {
    block_on(async {
        let listener = NetProvider::listen(provider, 0).await.unwrap();
        let handle = ConnectHandle::serialize_from(listener.handle).unwrap();
        let setup = net_agent_send_setup(setup_request(params, provider, device), state)
            .await
            .unwrap();
        let (_reply, resources) =
            net_agent_send_connect(AgentSendConnectRequest { handle }, setup)
                .await
                .unwrap();
        resources
    })
}

/// Establish one recv endpoint; the "remote sender" side is simulated by a
/// bare provider connect against the listen handle.
fn connect_recv(
    params: &SetupParams,
    provider: &'static MockNetProvider,
    device: &'static SysmemDevice,
    state: Arc<NetAgentState>,
    send_proxy_rank: usize,
    dial: bool,
) -> AgentRecvResources {
    block_on(async {
        let (reply, setup) =
            net_agent_recv_setup(setup_request(params, provider, device), state)
                .await
                .unwrap();
        if dial {
            let handle = reply.handle.deserialize_to::<MockHandle>().unwrap();
            let comm = NetProvider::connect(provider, 0, handle).await.unwrap();
            drop(NetComm::new(comm));
        }
        let (_reply, resources) =
            net_agent_recv_connect(AgentRecvConnectRequest { send_proxy_rank }, setup)
                .await
                .unwrap();
        resources
    })
}

fn send_op(agents: &[TransportAgentId], num_steps: u64, nbytes: usize, proto: Protocol) -> TransportOp {
    send_op_slices(agents, num_steps, nbytes, proto, 1, 1)
}

fn send_op_slices(
    agents: &[TransportAgentId],
    num_steps: u64,
    nbytes: usize,
    proto: Protocol,
    slice_steps: u64,
    chunk_steps: u64,
) -> TransportOp {
    let subs = agents
        .iter()
        .map(|&a| TransportSubOp::new(a, num_steps, nbytes))
        .collect();
    TransportOp::new(CommunicatorId(42), proto, slice_steps, chunk_steps, subs)
}

fn assert_counter_invariants(op: &TransportOp, max_depth: u64) {
    for sub in &op.subs {
        assert!(sub.done <= sub.transmitted);
        assert!(sub.transmitted <= sub.posted);
        assert!(sub.posted <= sub.num_steps);
        assert!(sub.posted <= sub.done + max_depth);
        for v in [sub.posted, sub.received, sub.transmitted, sub.done] {
            assert_eq!(v % op.slice_steps, 0);
        }
    }
}

unsafe fn kernel_publish_send(res: &AgentSendResources, slot: usize, size: i32, tail: u64) {
    let sizes_fifo = addr_of_mut!((*res.recv_mem).slots_sizes) as *mut i32;
    sizes_fifo.add(slot).write_volatile(size);
    addr_of_mut!((*res.recv_mem).tail).write_volatile(tail);
}

unsafe fn read_send_head(send_mem: *mut SendBufMeta) -> u64 {
    addr_of!((*send_mem).head).read_volatile()
}

unsafe fn read_recv_tail(recv_mem: *mut RecvBufMeta) -> u64 {
    addr_of!((*recv_mem).tail).read_volatile()
}

fn device_leaked() -> &'static SysmemDevice {
    Box::leak(Box::new(SysmemDevice::new()))
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// S1: a dedicated SIMPLE send in one process pushes four steps, releases
/// them through `head` at completion, and never touches the shared pools.
#[test]
fn dedicated_simple_send_same_process() {
    let provider = MockNetProvider::leaked(1);
    let device = device_leaked();
    let state = Arc::new(NetAgentState::new());
    let params = SetupParams::default();
    let resources = connect_send(&params, provider, device, Arc::clone(&state));

    let step_size = resources.buffer_sizes[Protocol::Simple as usize] / NUM_BUFFER_SLOTS;
    let send_mem = resources.send_mem;
    let agent = agent_id(1, 0, 0, ConnType::Send);

    let mut table = ConnResourceTable::new();
    table.insert(agent, Box::new(resources));
    let mut op = send_op(&[agent], 4, 4 * step_size, Protocol::Simple);

    // The kernel publishes all four slots up front.
    {
        let res = table
            .get(&agent)
            .unwrap()
            .downcast_ref::<AgentSendResources>()
            .unwrap();
        for slot in 0..4 {
            unsafe { kernel_publish_send(res, slot, step_size as i32, (slot + 1) as u64) };
        }
    }

    // Let the provider refuse the first isend; the proxy must retry.
    provider.refuse_sends.store(1, Ordering::Relaxed);

    let mut passes = 0;
    while op.state != TransportOpState::Completed {
        net_agent_send_progress(&mut table, &mut op).unwrap();
        assert_counter_invariants(&op, NUM_BUFFER_SLOTS as u64);
        passes += 1;
        assert!(passes < 100, "progress stalled");
    }

    assert_eq!(unsafe { read_send_head(send_mem) }, 4);
    let isends = provider.stats.isends.lock().unwrap();
    assert_eq!(isends.len(), 4);
    assert!(isends.iter().all(|&(size, tag)| size == step_size && tag == 0));
    assert_eq!(state.buffer_refcount(0, ConnType::Send), 0);

    let res = table.remove(&agent).unwrap();
    net_agent_free(res).unwrap();
    assert_eq!(provider.stats.send_closes.load(Ordering::Relaxed), 1);
}

/// S2: shared (fused) send across a process boundary. Credits are pre-posted
/// through `offsFifo` with the `-NUM_BUFFER_SLOTS` head bias, and completion
/// does not touch `head` again.
#[test]
fn shared_send_cross_process_credits() {
    let provider = MockNetProvider::leaked(1);
    let device = device_leaked();
    let state = Arc::new(NetAgentState::new());

    let mk_params = |channel: u32| SetupParams {
        shared: true,
        use_gdr: true,
        channel,
        client_pid: std::process::id().wrapping_add(1),
        ..Default::default()
    };
    let res_a = connect_send(&mk_params(0), provider, device, Arc::clone(&state));
    let res_b = connect_send(&mk_params(1), provider, device, Arc::clone(&state));
    assert_eq!(state.buffer_refcount(0, ConnType::Send), 2);

    // The host FIFO records live in a named shm segment; the device arena
    // was exported over IPC.
    assert!(res_a
        .map
        .bank_shm_path(super::buffer::MemoryBankType::HostMem)
        .is_some());
    assert!(res_a
        .map
        .bank_ipc_handle(super::buffer::MemoryBankType::SharedDeviceMem)
        .is_some());

    let send_mem_a = res_a.send_mem;
    let recv_mem_a = res_a.recv_mem;
    let chunk_size = res_a.chunk_size;
    assert_eq!(
        unsafe { read_send_head(send_mem_a) } as i64,
        -(NUM_BUFFER_SLOTS as i64)
    );

    let agent_a = agent_id(1, 0, 0, ConnType::Send);
    let agent_b = agent_id(1, 1, 0, ConnType::Send);
    let mut table = ConnResourceTable::new();
    table.insert(agent_a, Box::new(res_a));
    table.insert(agent_b, Box::new(res_b));

    let mut op = send_op_slices(&[agent_a, agent_b], 8, usize::MAX, Protocol::Simple, 2, 2);
    let max_depth = std::cmp::min(NUM_BUFFER_SLOTS as u64, (NUM_SHARED_SLOTS / 2) as u64);
    assert_eq!(max_depth, 8);

    let mut credit_rounds = 0;
    loop {
        net_agent_send_progress(&mut table, &mut op).unwrap();
        assert_counter_invariants(&op, max_depth);
        if op.idle {
            break;
        }
        credit_rounds += 1;
        assert!(credit_rounds < 100);
    }

    // ceil(8/2) = 4 credit publications per sub, each with a distinct fused
    // offset, and the head parked at base + posted - NUM_BUFFER_SLOTS.
    assert_eq!(op.subs[0].posted, 8);
    assert_eq!(op.subs[1].posted, 8);
    assert_eq!(unsafe { read_send_head(send_mem_a) }, 0);
    // Sub 0 posted slices at slots 0,2,4,6 with arena slots 0,4,8,12 of
    // channel 0 (slot index scales by the sub count).
    unsafe {
        let offs_fifo = addr_of!((*recv_mem_a).slots_offsets) as *const i32;
        for (i, slot) in [0usize, 2, 4, 6].into_iter().enumerate() {
            let offset = offs_fifo.add(slot).read_volatile() as usize;
            assert_eq!(offset, chunk_size * (i * 2 * 2));
        }
    }

    for agent in [agent_a, agent_b] {
        net_agent_free(table.remove(&agent).unwrap()).unwrap();
    }
    assert_eq!(state.buffer_refcount(0, ConnType::Send), 0);
}

/// S3: receives of subs sharing one comm are batched into a single grouped
/// irecv, advance together, and one provider flush covers the whole group.
#[test]
fn grouped_recv_with_flush() {
    let provider = MockNetProvider::leaked(3);
    let device = device_leaked();
    let state = Arc::new(NetAgentState::new());

    let mk_params = |conn_index: u32| SetupParams {
        shared: true,
        use_gdr: true,
        need_flush: true,
        channel: 1,
        conn_index,
        num_channels: 2,
        ..Default::default()
    };
    let agents: Vec<_> = (0..3)
        .map(|i| agent_id(1, 1, i, ConnType::Recv))
        .collect();
    let mut table = ConnResourceTable::new();
    let mut send_mems = Vec::new();
    let mut recv_mems = Vec::new();
    let mut arena = std::ptr::null_mut::<u8>();
    let mut chunk_size = 0;
    let conn = {
        let mut conn = None;
        for (i, &agent) in agents.iter().enumerate() {
            let res = connect_recv(
                &mk_params(i as u32),
                provider,
                device,
                Arc::clone(&state),
                1,
                i == 0,
            );
            send_mems.push(res.send_mem);
            recv_mems.push(res.recv_mem);
            arena = res.buffers[Protocol::Simple as usize];
            chunk_size = res.chunk_size;
            if i == 0 {
                let guard = res.recv_comm.lock();
                let inner = guard
                    .as_ref()
                    .get_ref()
                    .downcast_ref::<MockRecvComm>()
                    .unwrap();
                conn = Some(Arc::clone(&inner.conn));
            }
            table.insert(agent, Box::new(res));
        }
        conn.unwrap()
    };
    // One provider accept serves all three channels' endpoints.
    assert_eq!(provider.stats.accepts.load(Ordering::Relaxed), 1);

    let mut op = send_op(&agents, 4, usize::MAX, Protocol::Simple);

    // The staged early-exit posts one grouped receive per pass until the
    // whole window is in flight.
    net_agent_recv_progress(&mut table, &mut op).unwrap();
    assert!(!op.idle);
    assert_eq!(*provider.stats.irecv_batches.lock().unwrap().last().unwrap(), 3);
    assert!(op.subs.iter().all(|sub| sub.posted == 1));
    assert_eq!(op.subs[0].group_size, 3);
    for _ in 0..3 {
        net_agent_recv_progress(&mut table, &mut op).unwrap();
    }
    assert!(op.subs.iter().all(|sub| sub.posted == 4));
    assert_eq!(provider.stats.irecv_batches.lock().unwrap().len(), 4);

    // The remote sender delivers one message per sub.
    let payloads: Vec<Vec<u8>> = (0..3u8).map(|i| vec![0xA0 + i; 512]).collect();
    {
        let mut conn = conn.lock().unwrap();
        for payload in &payloads {
            conn.messages.push((1, payload.clone()));
        }
    }

    // Next pass reaps the grouped completion and issues exactly one flush.
    net_agent_recv_progress(&mut table, &mut op).unwrap();
    assert!(op.subs.iter().all(|sub| sub.received == 1));
    assert_eq!(provider.stats.iflushes.load(Ordering::Relaxed), 1);

    // The following pass confirms the flush and publishes every tail.
    net_agent_recv_progress(&mut table, &mut op).unwrap();
    assert!(op.subs.iter().all(|sub| sub.transmitted == 1));
    for &recv_mem in &recv_mems {
        assert_eq!(unsafe { read_recv_tail(recv_mem) }, 1);
    }

    // Payloads landed in the fused arena slots of channel 1.
    for (i, payload) in payloads.iter().enumerate() {
        let offset = shared_buffers_get(chunk_size, ChannelId(1), i);
        let got = unsafe { std::slice::from_raw_parts(arena.add(offset), payload.len()) };
        assert_eq!(got, payload.as_slice());
    }

    // The kernel consumes everything; remaining steps drain without flushes.
    for _ in 0..64 {
        for &send_mem in &send_mems {
            unsafe {
                let tail = op.subs[0].transmitted;
                addr_of_mut!((*send_mem).head).write_volatile(tail);
            }
        }
        {
            let mut conn = conn.lock().unwrap();
            for payload in &payloads {
                conn.messages.push((1, payload.clone()));
            }
        }
        net_agent_recv_progress(&mut table, &mut op).unwrap();
        assert_counter_invariants(&op, NUM_BUFFER_SLOTS as u64);
        if op.state == TransportOpState::Completed {
            break;
        }
    }
    assert_eq!(op.state, TransportOpState::Completed);
    for sub in &op.subs {
        assert_eq!(sub.done, 4);
    }
    for &agent in &agents {
        let res = table
            .get(&agent)
            .unwrap()
            .downcast_ref::<AgentRecvResources>()
            .unwrap();
        assert_eq!(res.step, 4);
    }

    for &agent in &agents {
        net_agent_free(table.remove(&agent).unwrap()).unwrap();
    }
    assert_eq!(state.buffer_refcount(0, ConnType::Recv), 0);
}

/// S4: an LL128 slot whose last line still carries a stale flag must not be
/// sent; flipping the flag on a later pass releases it.
#[test]
fn ll128_readiness_gates_isend() {
    let provider = MockNetProvider::leaked(1);
    let device = device_leaked();
    let state = Arc::new(NetAgentState::new());
    let params = SetupParams {
        use_gdr: false,
        ..Default::default()
    };
    let resources = connect_send(&params, provider, device, state);
    let buff = resources.buffers[Protocol::Ll128 as usize];
    let agent = agent_id(1, 0, 0, ConnType::Send);

    let size: usize = 256; // two 128-byte lines
    unsafe {
        let res = &resources;
        kernel_publish_send(res, 0, size as i32, 1);
        // Fill payload but leave the second line's flag stale.
        std::ptr::write_bytes(buff, 0x5c, size);
        let lines = buff as *mut u64;
        lines.add(crate::transport::LL128_DATA_ELEMS).write_volatile(1);
        lines
            .add(crate::transport::LL128_LINE_ELEMS + crate::transport::LL128_DATA_ELEMS)
            .write_volatile(7);
    }

    let mut table = ConnResourceTable::new();
    table.insert(agent, Box::new(resources));
    let mut op = send_op(&[agent], 1, size, Protocol::Ll128);

    net_agent_send_progress(&mut table, &mut op).unwrap();
    net_agent_send_progress(&mut table, &mut op).unwrap();
    assert_eq!(provider.stats.isends.lock().unwrap().len(), 0);
    assert_eq!(op.subs[0].transmitted, 0);

    unsafe {
        let lines = buff as *mut u64;
        lines
            .add(crate::transport::LL128_LINE_ELEMS + crate::transport::LL128_DATA_ELEMS)
            .write_volatile(1);
    }
    net_agent_send_progress(&mut table, &mut op).unwrap();
    assert_eq!(provider.stats.isends.lock().unwrap().len(), 1);
    assert_eq!(op.subs[0].transmitted, 1);
}

/// LL sends gate on both flag words of every 16-byte line and do not wait
/// for the tail.
#[test]
fn ll_readiness_gates_isend() {
    let provider = MockNetProvider::leaked(1);
    let device = device_leaked();
    let state = Arc::new(NetAgentState::new());
    let params = SetupParams {
        use_gdr: false,
        ..Default::default()
    };
    let resources = connect_send(&params, provider, device, state);
    let buff = resources.buffers[Protocol::Ll as usize];
    let agent = agent_id(1, 0, 0, ConnType::Send);

    let size: usize = 32; // two LL lines
    unsafe {
        let sizes_fifo = addr_of_mut!((*resources.recv_mem).slots_sizes) as *mut i32;
        sizes_fifo.write_volatile(size as i32);
        // Note: no tail bump; LL does not need one.
        let words = buff as *mut u32;
        for line in 0..2 {
            words.add(line * 4).write_volatile(0xdead);
            words.add(line * 4 + 2).write_volatile(0xbeef);
            words.add(line * 4 + 1).write_volatile(1);
        }
        words.add(3).write_volatile(1);
        // Second line's flag2 left stale.
        words.add(7).write_volatile(0);
    }

    let mut table = ConnResourceTable::new();
    table.insert(agent, Box::new(resources));
    let mut op = send_op(&[agent], 1, size, Protocol::Ll);

    net_agent_send_progress(&mut table, &mut op).unwrap();
    assert_eq!(provider.stats.isends.lock().unwrap().len(), 0);

    unsafe {
        let words = buff as *mut u32;
        words.add(7).write_volatile(1);
    }
    net_agent_send_progress(&mut table, &mut op).unwrap();
    assert_eq!(provider.stats.isends.lock().unwrap().len(), 1);
}

/// S5: two endpoints on the same (device, peer, channel) share one provider
/// connection; the second free closes it.
#[test]
fn shared_conn_pool_reuse() {
    let provider = MockNetProvider::leaked(3);
    let device = device_leaked();
    let state = Arc::new(NetAgentState::new());
    let params = SetupParams {
        shared: true,
        use_gdr: true,
        channel: 5,
        num_channels: 8,
        ..Default::default()
    };

    let res1 = connect_send(&params, provider, device, Arc::clone(&state));
    let res2 = connect_send(&params, provider, device, Arc::clone(&state));
    assert_eq!(provider.stats.connects.load(Ordering::Relaxed), 1);
    assert_eq!(
        state.send_comm_refcount(0, 1, ChannelId(5)),
        Some(2)
    );

    net_agent_free(Box::new(res1)).unwrap();
    assert_eq!(state.send_comm_refcount(0, 1, ChannelId(5)), Some(1));
    assert_eq!(provider.stats.send_closes.load(Ordering::Relaxed), 0);

    net_agent_free(Box::new(res2)).unwrap();
    assert_eq!(state.send_comm_refcount(0, 1, ChannelId(5)), None);
    assert_eq!(provider.stats.send_closes.load(Ordering::Relaxed), 1);
}

/// A preconnect that only reserved the staging arena releases exactly that
/// reference on free.
#[test]
fn shared_init_then_free_releases_pool() {
    let device = device_leaked();
    let state = Arc::new(NetAgentState::new());
    let resources = block_on(net_agent_shared_init(
        AgentSharedInitRequest {
            local_rank: 0,
            num_local_ranks: 1,
            conn_type: ConnType::Send,
            client_pid: std::process::id(),
            num_channels: 2,
            chunk_size: 1024,
            device,
        },
        Arc::clone(&state),
    ))
    .unwrap();
    assert_eq!(state.buffer_refcount(0, ConnType::Send), 1);
    net_agent_free(Box::new(resources)).unwrap();
    assert_eq!(state.buffer_refcount(0, ConnType::Send), 0);
}

/// S6: a receive proxy in a different process than the GPU owner is refused.
#[test]
fn remote_recv_proxy_refused() {
    let provider = MockNetProvider::leaked(1);
    let device = device_leaked();
    let state = Arc::new(NetAgentState::new());
    let params = SetupParams {
        client_pid: std::process::id().wrapping_add(1),
        ..Default::default()
    };
    let err = block_on(async {
        let (_reply, setup) =
            net_agent_recv_setup(setup_request(&params, provider, device), state)
                .await
                .unwrap();
        net_agent_recv_connect(AgentRecvConnectRequest { send_proxy_rank: 1 }, setup)
            .await
            .map(|_| ())
            .unwrap_err()
    });
    assert!(matches!(err, NetAgentError::RemoteRecvProxy));
}
