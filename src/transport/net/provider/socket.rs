//! TCP socket provider: the fallback data plane when no RDMA-capable NIC is
//! usable. Control plane is plain connect/accept on a loopback-or-NIC bound
//! listener; the data plane frames every message as `(size, tag)` + payload
//! over a non-blocking stream and matches arrivals against posted receive
//! buffers by tag, in post order.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::ffi::c_void;
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::os::fd::RawFd;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Socket, Type};
use thiserror::Error;

use super::{
    AnyMrHandle, AnyNetComm, MemoryRegion, MrType, NetListener, NetProperties, NetProvider,
    NetRequestId, PtrSupport, NET_MAX_RECVS, NET_MAX_REQUESTS,
};

const MSG_HEADER_SIZE: usize = 8;

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Message of {send} bytes overflows a receive buffer of {capacity}")]
    RecvOverflow { send: usize, capacity: usize },
    #[error("Socket transport does not reach device memory")]
    DeviceMemoryUnsupported,
    #[error("Unknown request {0}")]
    UnknownRequest(u32),
    #[error("No such network device {0}")]
    UnknownDevice(usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketHandle {
    pub addr: SocketAddr,
}

pub struct SocketListenComm {
    listener: TcpListener,
}

pub struct SocketSendComm {
    inner: Arc<Mutex<SendInner>>,
}

pub struct SocketRecvComm {
    inner: Arc<Mutex<RecvInner>>,
}

/// Registered-memory handle. Plain sockets need no registration; the handle
/// only pins the access type.
pub struct SocketMrHandle;

struct SendState {
    id: u32,
    data: *const u8,
    size: usize,
    header: [u8; MSG_HEADER_SIZE],
    header_written: usize,
    body_written: usize,
    done: bool,
}

unsafe impl Send for SendState {}

struct SendInner {
    stream: TcpStream,
    queue: VecDeque<SendState>,
}

struct RecvSlot {
    ptr: *mut u8,
    capacity: usize,
    tag: u32,
    claimed: bool,
    received: Option<usize>,
}

unsafe impl Send for RecvSlot {}

struct RecvState {
    id: u32,
    slots: Vec<RecvSlot>,
}

impl RecvState {
    fn done(&self) -> bool {
        self.slots.iter().all(|s| s.received.is_some())
    }
}

struct MsgTarget {
    req: u32,
    slot: usize,
    ptr: *mut u8,
}

unsafe impl Send for MsgTarget {}

struct InMsg {
    tag: u32,
    size: usize,
    read: usize,
    /// `None` means no matching buffer was posted yet; the payload goes to
    /// the stash and is claimed by a later receive.
    target: Option<MsgTarget>,
    stash: Vec<u8>,
}

struct RecvInner {
    stream: TcpStream,
    pending: VecDeque<RecvState>,
    hdr_buf: [u8; MSG_HEADER_SIZE],
    hdr_read: usize,
    cur: Option<InMsg>,
    unmatched: VecDeque<(u32, Vec<u8>)>,
}

#[derive(Clone)]
enum SocketCommRef {
    Send(Arc<Mutex<SendInner>>),
    Recv(Arc<Mutex<RecvInner>>),
}

struct SocketTransportContext {
    properties: Vec<NetProperties>,
    requests: Mutex<HashMap<u32, SocketCommRef>>,
    next_request: AtomicU32,
}

pub struct SocketTransportProvider(OnceCell<SocketTransportContext>);

pub static SOCKET_TRANSPORT: SocketTransportProvider = SocketTransportProvider(OnceCell::new());

impl SocketTransportProvider {
    fn ctx(&self) -> &SocketTransportContext {
        self.0.get_or_init(|| SocketTransportContext {
            properties: vec![NetProperties {
                name: "socket".to_string(),
                pci_path: String::new(),
                guid: 0,
                ptr_support: PtrSupport::PTR_HOST,
                speed: 10_000,
                port: 0,
                latency: 0.0,
                max_comms: 65_536,
                max_recvs: NET_MAX_RECVS,
            }],
            requests: Mutex::new(HashMap::new()),
            next_request: AtomicU32::new(1),
        })
    }

    fn register_request(&self, comm: SocketCommRef) -> NetRequestId {
        let ctx = self.ctx();
        let id = ctx.next_request.fetch_add(1, Ordering::Relaxed);
        ctx.requests.lock().unwrap().insert(id, comm);
        NetRequestId(id)
    }
}

fn drive_send(inner: &mut SendInner) -> Result<(), SocketError> {
    for st in inner.queue.iter_mut() {
        if st.done {
            continue;
        }
        while st.header_written < MSG_HEADER_SIZE {
            match inner.stream.write(&st.header[st.header_written..]) {
                Ok(n) => st.header_written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        while st.body_written < st.size {
            let remaining = unsafe {
                std::slice::from_raw_parts(st.data.add(st.body_written), st.size - st.body_written)
            };
            match inner.stream.write(remaining) {
                Ok(n) => st.body_written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        st.done = true;
    }
    Ok(())
}

/// Pick the destination for an incoming `(tag, size)` header: the first
/// unclaimed slot with a matching tag, scanning posted receives in order.
fn match_slot(inner: &mut RecvInner, tag: u32, size: usize) -> Result<Option<MsgTarget>, SocketError> {
    for req in inner.pending.iter_mut() {
        for (idx, slot) in req.slots.iter_mut().enumerate() {
            if !slot.claimed && slot.tag == tag {
                if size > slot.capacity {
                    return Err(SocketError::RecvOverflow {
                        send: size,
                        capacity: slot.capacity,
                    });
                }
                slot.claimed = true;
                return Ok(Some(MsgTarget {
                    req: req.id,
                    slot: idx,
                    ptr: slot.ptr,
                }));
            }
        }
    }
    Ok(None)
}

fn drive_recv(inner: &mut RecvInner) -> Result<(), SocketError> {
    loop {
        if inner.cur.is_none() {
            while inner.hdr_read < MSG_HEADER_SIZE {
                let hdr_read = inner.hdr_read;
                match inner.stream.read(&mut inner.hdr_buf[hdr_read..]) {
                    Ok(0) => {
                        if inner.hdr_read > 0 || !inner.pending.is_empty() {
                            return Err(std::io::Error::from(ErrorKind::UnexpectedEof).into());
                        }
                        return Ok(());
                    }
                    Ok(n) => inner.hdr_read += n,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            let size = u32::from_le_bytes(inner.hdr_buf[0..4].try_into().unwrap()) as usize;
            let tag = u32::from_le_bytes(inner.hdr_buf[4..8].try_into().unwrap());
            inner.hdr_read = 0;
            let target = match_slot(inner, tag, size)?;
            let stash = if target.is_none() {
                vec![0u8; size]
            } else {
                Vec::new()
            };
            inner.cur = Some(InMsg {
                tag,
                size,
                read: 0,
                target,
                stash,
            });
        }
        let msg = inner.cur.as_mut().unwrap();
        while msg.read < msg.size {
            let buf = match &msg.target {
                Some(target) => unsafe {
                    std::slice::from_raw_parts_mut(target.ptr.add(msg.read), msg.size - msg.read)
                },
                None => &mut msg.stash[msg.read..],
            };
            match inner.stream.read(buf) {
                Ok(0) => return Err(std::io::Error::from(ErrorKind::UnexpectedEof).into()),
                Ok(n) => msg.read += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let msg = inner.cur.take().unwrap();
        match msg.target {
            Some(target) => {
                for req in inner.pending.iter_mut() {
                    if req.id == target.req {
                        req.slots[target.slot].received = Some(msg.size);
                        break;
                    }
                }
            }
            None => inner.unmatched.push_back((msg.tag, msg.stash)),
        }
    }
}

#[async_trait]
impl NetProvider for SocketTransportProvider {
    type NetError = SocketError;
    type NetHandle = SocketHandle;

    fn init(&self) -> Result<(), SocketError> {
        self.ctx();
        Ok(())
    }

    fn get_num_devices(&self) -> usize {
        self.ctx().properties.len()
    }

    fn get_properties(&self, device: usize) -> &NetProperties {
        &self.ctx().properties[device]
    }

    async fn listen(&self, device: usize) -> Result<NetListener<SocketHandle>, SocketError> {
        if device >= self.ctx().properties.len() {
            return Err(SocketError::UnknownDevice(device));
        }
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&SocketAddr::from((Ipv4Addr::LOCALHOST, 0)).into())?;
        socket.listen(128)?;
        let listener: TcpListener = socket.into();
        let addr = listener.local_addr()?;
        Ok(NetListener {
            handle: SocketHandle { addr },
            listen_comm: Box::new(SocketListenComm { listener }),
        })
    }

    async fn connect(
        &self,
        _device: usize,
        handle: SocketHandle,
    ) -> Result<Box<AnyNetComm>, SocketError> {
        let stream = TcpStream::connect(handle.addr)?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        let comm = SocketSendComm {
            inner: Arc::new(Mutex::new(SendInner {
                stream,
                queue: VecDeque::new(),
            })),
        };
        Ok(Box::new(comm))
    }

    async fn accept(&self, listen_comm: Box<AnyNetComm>) -> Result<Box<AnyNetComm>, SocketError> {
        let listen_comm = listen_comm
            .downcast::<SocketListenComm>()
            .map_err(|_| std::io::Error::from(ErrorKind::InvalidInput))?;
        let (stream, _) = listen_comm.listener.accept()?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        let comm = SocketRecvComm {
            inner: Arc::new(Mutex::new(RecvInner {
                stream,
                pending: VecDeque::new(),
                hdr_buf: [0; MSG_HEADER_SIZE],
                hdr_read: 0,
                cur: None,
                unmatched: VecDeque::new(),
            })),
        };
        Ok(Box::new(comm))
    }

    fn register_mr(
        &self,
        _comm: Pin<&mut AnyNetComm>,
        mr: MemoryRegion,
    ) -> Result<Box<AnyMrHandle>, SocketError> {
        if mr.mr_type == MrType::Device {
            return Err(SocketError::DeviceMemoryUnsupported);
        }
        Ok(Box::new(SocketMrHandle))
    }

    fn register_mr_dma_buf(
        &self,
        _comm: Pin<&mut AnyNetComm>,
        _mr: MemoryRegion,
        _offset: u64,
        _fd: RawFd,
    ) -> Result<Box<AnyMrHandle>, SocketError> {
        Err(SocketError::DeviceMemoryUnsupported)
    }

    fn deregister_mr(
        &self,
        _comm: Pin<&mut AnyNetComm>,
        _handle: Box<AnyMrHandle>,
    ) -> Result<(), SocketError> {
        Ok(())
    }

    fn initiate_send(
        &self,
        send_comm: Pin<&mut AnyNetComm>,
        data: *mut c_void,
        size: usize,
        tag: u32,
        _mr_handle: &AnyMrHandle,
    ) -> Result<Option<NetRequestId>, SocketError> {
        let comm = comm_downcast::<SocketSendComm>(send_comm)?;
        let inner_arc = Arc::clone(&comm.inner);
        let mut inner = comm.inner.lock().unwrap();
        if inner.queue.len() >= NET_MAX_REQUESTS {
            return Ok(None);
        }
        let request = self.register_request(SocketCommRef::Send(inner_arc));
        let mut header = [0u8; MSG_HEADER_SIZE];
        header[0..4].copy_from_slice(&(size as u32).to_le_bytes());
        header[4..8].copy_from_slice(&tag.to_le_bytes());
        inner.queue.push_back(SendState {
            id: request.0,
            data: data as *const u8,
            size,
            header,
            header_written: 0,
            body_written: 0,
            done: false,
        });
        drive_send(&mut inner)?;
        Ok(Some(request))
    }

    fn initiate_recv(
        &self,
        recv_comm: Pin<&mut AnyNetComm>,
        data: &[*mut c_void],
        sizes: &[usize],
        tags: &[u32],
        _mr_handles: &[&AnyMrHandle],
    ) -> Result<Option<NetRequestId>, SocketError> {
        let comm = comm_downcast::<SocketRecvComm>(recv_comm)?;
        let inner_arc = Arc::clone(&comm.inner);
        let mut inner = comm.inner.lock().unwrap();
        if inner.pending.len() >= NET_MAX_REQUESTS {
            return Ok(None);
        }
        let request = self.register_request(SocketCommRef::Recv(inner_arc));
        let mut slots = Vec::with_capacity(data.len());
        for i in 0..data.len() {
            slots.push(RecvSlot {
                ptr: data[i] as *mut u8,
                capacity: sizes[i],
                tag: tags[i],
                claimed: false,
                received: None,
            });
        }
        // Adopt payloads that arrived before this receive was posted.
        for slot in slots.iter_mut() {
            if let Some(pos) = inner
                .unmatched
                .iter()
                .position(|(tag, _)| *tag == slot.tag)
            {
                let (_, payload) = inner.unmatched.remove(pos).unwrap();
                if payload.len() > slot.capacity {
                    return Err(SocketError::RecvOverflow {
                        send: payload.len(),
                        capacity: slot.capacity,
                    });
                }
                unsafe {
                    std::ptr::copy_nonoverlapping(payload.as_ptr(), slot.ptr, payload.len());
                }
                slot.claimed = true;
                slot.received = Some(payload.len());
            }
        }
        inner.pending.push_back(RecvState {
            id: request.0,
            slots,
        });
        drive_recv(&mut inner)?;
        Ok(Some(request))
    }

    fn initiate_flush(
        &self,
        _recv_comm: Pin<&mut AnyNetComm>,
        _data: &[*mut c_void],
        _sizes: &[usize],
        _mr_handles: &[&AnyMrHandle],
    ) -> Result<Option<NetRequestId>, SocketError> {
        // Socket receives land in host memory; nothing to flush.
        Ok(None)
    }

    fn test(
        &self,
        request: NetRequestId,
        sizes: Option<&mut [usize]>,
    ) -> Result<bool, SocketError> {
        let comm = {
            let requests = self.ctx().requests.lock().unwrap();
            requests
                .get(&request.0)
                .cloned()
                .ok_or(SocketError::UnknownRequest(request.0))?
        };
        let done = match comm {
            SocketCommRef::Send(inner) => {
                let mut inner = inner.lock().unwrap();
                drive_send(&mut inner)?;
                if let Some(pos) = inner.queue.iter().position(|st| st.id == request.0) {
                    if inner.queue[pos].done {
                        inner.queue.remove(pos);
                        true
                    } else {
                        false
                    }
                } else {
                    return Err(SocketError::UnknownRequest(request.0));
                }
            }
            SocketCommRef::Recv(inner) => {
                let mut inner = inner.lock().unwrap();
                drive_recv(&mut inner)?;
                if let Some(pos) = inner.pending.iter().position(|st| st.id == request.0) {
                    if inner.pending[pos].done() {
                        let state = inner.pending.remove(pos).unwrap();
                        if let Some(sizes) = sizes {
                            for (i, slot) in state.slots.iter().enumerate() {
                                if i < sizes.len() {
                                    sizes[i] = slot.received.unwrap_or(0);
                                }
                            }
                        }
                        true
                    } else {
                        false
                    }
                } else {
                    return Err(SocketError::UnknownRequest(request.0));
                }
            }
        };
        if done {
            self.ctx().requests.lock().unwrap().remove(&request.0);
        }
        Ok(done)
    }
}

fn comm_downcast<T: Any>(comm: Pin<&mut AnyNetComm>) -> Result<&mut T, SocketError> {
    // Comm types hold only an Arc handle and are not address-sensitive.
    let comm = unsafe { comm.get_unchecked_mut() };
    comm.downcast_mut::<T>()
        .ok_or_else(|| std::io::Error::from(ErrorKind::InvalidInput).into())
}
