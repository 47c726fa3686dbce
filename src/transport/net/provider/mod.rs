//! Pluggable network provider interface.
//!
//! Providers expose an async control plane (listen/connect/accept) and a
//! strictly non-blocking data plane (isend/irecv/iflush/test). Comm objects
//! are type-erased; closing a comm is its `Drop`. The sealed [`NetProviderWrap`]
//! erases the provider's handle type so the transport can carry handles inside
//! fixed-size [`ConnectHandle`] blobs.

pub mod socket;

use std::any::Any;
use std::ffi::c_void;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bitflags::bitflags;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::transport::transporter::{ConnectHandle, ConnectHandleError};

pub type AnyNetComm = dyn Any + Send;
pub type AnyMrHandle = dyn Any + Send;

/// Maximum in-flight requests per comm; at least the FIFO depth.
pub const NET_MAX_REQUESTS: usize = 32;

static_assertions::const_assert!(crate::transport::NUM_BUFFER_SLOTS <= NET_MAX_REQUESTS);

/// Upper bound on buffers per grouped receive.
pub const NET_MAX_RECVS: usize = 8;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct PtrSupport: u8 {
        const PTR_HOST = 0b00000001;
        const PTR_CUDA = 0b00000010;
        const PTR_DMA_BUF = 0b00000100;
    }
}

#[derive(Debug, Clone)]
pub struct NetProperties {
    pub name: String,
    /// Path to the PCI device, used by topology matching.
    pub pci_path: String,
    /// Unique identifier of the NIC chip; relevant for cards exposing
    /// multiple PCI functions.
    pub guid: u64,
    pub ptr_support: PtrSupport,
    pub speed: u32,
    pub port: u16,
    pub latency: f32,
    pub max_comms: usize,
    /// Maximum number of buffers a single grouped receive can cover.
    pub max_recvs: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MrType {
    Host,
    Device,
}

#[derive(Clone, Copy)]
pub struct MemoryRegion {
    pub data: *mut c_void,
    pub size: usize,
    pub mr_type: MrType,
}

unsafe impl Send for MemoryRegion {}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct NetRequestId(pub u32);

pub struct NetListener<NetHandle> {
    pub handle: NetHandle,
    pub listen_comm: Box<AnyNetComm>,
}

/// A provider comm shared between endpoints. Identity (for grouping receives
/// and pooling) is the allocation address; the mutex serializes the
/// non-blocking data-plane calls.
pub struct NetComm {
    inner: Mutex<Pin<Box<AnyNetComm>>>,
}

impl NetComm {
    pub fn new(comm: Box<AnyNetComm>) -> Arc<NetComm> {
        Arc::new(NetComm {
            inner: Mutex::new(Box::into_pin(comm)),
        })
    }

    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, Pin<Box<AnyNetComm>>> {
        self.inner.lock().unwrap()
    }

    /// Stable token identifying the underlying connection, used to group
    /// receives and to pool endpoints.
    #[inline]
    pub fn token(comm: &Arc<NetComm>) -> usize {
        Arc::as_ptr(comm) as *const () as usize
    }
}

#[derive(Debug, Error)]
pub enum NetProviderError {
    #[error("Connection handle: {0}")]
    ConnectionHandle(#[from] ConnectHandleError),
    #[error("Net provider: {0}")]
    NetProvider(#[from] anyhow::Error),
}

/// The provider implementation trait. Control-plane calls may await; the
/// data plane must return immediately. `initiate_*` returning `Ok(None)`
/// means the provider cannot take the request right now and the caller
/// retries on a later pass.
#[async_trait]
pub trait NetProvider: Send + Sync {
    type NetError: std::error::Error + Send + Sync + 'static;
    type NetHandle: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Initialize the provider. State mutations go through interior
    /// mutability; the provider lives in a static.
    fn init(&self) -> Result<(), Self::NetError>;

    fn get_num_devices(&self) -> usize;

    fn get_properties(&self, device: usize) -> &NetProperties;

    /// Create a receiving object and a handle a peer can connect to.
    async fn listen(&self, device: usize) -> Result<NetListener<Self::NetHandle>, Self::NetError>;

    /// Connect to a peer's listen handle; returns the send comm.
    async fn connect(
        &self,
        device: usize,
        handle: Self::NetHandle,
    ) -> Result<Box<AnyNetComm>, Self::NetError>;

    /// Finalize connection establishment on the receiving side.
    async fn accept(&self, listen_comm: Box<AnyNetComm>) -> Result<Box<AnyNetComm>, Self::NetError>;

    /// Register memory for transfers on this comm.
    fn register_mr(
        &self,
        comm: Pin<&mut AnyNetComm>,
        mr: MemoryRegion,
    ) -> Result<Box<AnyMrHandle>, Self::NetError>;

    /// Register device memory exported as a DMA-BUF file descriptor.
    fn register_mr_dma_buf(
        &self,
        comm: Pin<&mut AnyNetComm>,
        mr: MemoryRegion,
        offset: u64,
        fd: RawFd,
    ) -> Result<Box<AnyMrHandle>, Self::NetError>;

    fn deregister_mr(
        &self,
        comm: Pin<&mut AnyNetComm>,
        handle: Box<AnyMrHandle>,
    ) -> Result<(), Self::NetError>;

    fn initiate_send(
        &self,
        send_comm: Pin<&mut AnyNetComm>,
        data: *mut c_void,
        size: usize,
        tag: u32,
        mr_handle: &AnyMrHandle,
    ) -> Result<Option<NetRequestId>, Self::NetError>;

    /// Post one grouped receive over up to `max_recvs` buffers; `sizes` are
    /// capacities, matched to incoming messages by `tags`.
    fn initiate_recv(
        &self,
        recv_comm: Pin<&mut AnyNetComm>,
        data: &[*mut c_void],
        sizes: &[usize],
        tags: &[u32],
        mr_handles: &[&AnyMrHandle],
    ) -> Result<Option<NetRequestId>, Self::NetError>;

    /// Make data received into device memory visible to the GPU. `Ok(None)`
    /// means no flush is required.
    fn initiate_flush(
        &self,
        recv_comm: Pin<&mut AnyNetComm>,
        data: &[*mut c_void],
        sizes: &[usize],
        mr_handles: &[&AnyMrHandle],
    ) -> Result<Option<NetRequestId>, Self::NetError>;

    /// Poll a request. On completion of a grouped receive, `sizes` receives
    /// the actual per-buffer byte counts.
    fn test(
        &self,
        request: NetRequestId,
        sizes: Option<&mut [usize]>,
    ) -> Result<bool, Self::NetError>;
}

pub struct NetListenerErased {
    pub handle: ConnectHandle,
    pub listen_comm: Box<AnyNetComm>,
}

mod private {
    pub trait Sealed {}
}

/// Object-safe provider facade with the handle type erased into
/// [`ConnectHandle`] blobs. Implemented for every [`NetProvider`].
#[async_trait]
pub trait NetProviderWrap: private::Sealed + Send + Sync {
    fn init(&self) -> Result<(), NetProviderError>;
    fn get_num_devices(&self) -> usize;
    fn get_properties(&self, device: usize) -> &NetProperties;
    async fn listen(&self, device: usize) -> Result<NetListenerErased, NetProviderError>;
    async fn connect(
        &self,
        device: usize,
        handle: &ConnectHandle,
    ) -> Result<Box<AnyNetComm>, NetProviderError>;
    async fn accept(&self, listen_comm: Box<AnyNetComm>)
        -> Result<Box<AnyNetComm>, NetProviderError>;
    fn register_mr(
        &self,
        comm: Pin<&mut AnyNetComm>,
        mr: MemoryRegion,
    ) -> Result<Box<AnyMrHandle>, NetProviderError>;
    fn register_mr_dma_buf(
        &self,
        comm: Pin<&mut AnyNetComm>,
        mr: MemoryRegion,
        offset: u64,
        fd: RawFd,
    ) -> Result<Box<AnyMrHandle>, NetProviderError>;
    fn deregister_mr(
        &self,
        comm: Pin<&mut AnyNetComm>,
        handle: Box<AnyMrHandle>,
    ) -> Result<(), NetProviderError>;
    fn initiate_send(
        &self,
        send_comm: Pin<&mut AnyNetComm>,
        data: *mut c_void,
        size: usize,
        tag: u32,
        mr_handle: &AnyMrHandle,
    ) -> Result<Option<NetRequestId>, NetProviderError>;
    fn initiate_recv(
        &self,
        recv_comm: Pin<&mut AnyNetComm>,
        data: &[*mut c_void],
        sizes: &[usize],
        tags: &[u32],
        mr_handles: &[&AnyMrHandle],
    ) -> Result<Option<NetRequestId>, NetProviderError>;
    fn initiate_flush(
        &self,
        recv_comm: Pin<&mut AnyNetComm>,
        data: &[*mut c_void],
        sizes: &[usize],
        mr_handles: &[&AnyMrHandle],
    ) -> Result<Option<NetRequestId>, NetProviderError>;
    fn test(
        &self,
        request: NetRequestId,
        sizes: Option<&mut [usize]>,
    ) -> Result<bool, NetProviderError>;
}

impl<T: NetProvider> private::Sealed for T {}

#[async_trait]
impl<T: NetProvider> NetProviderWrap for T {
    #[inline]
    fn init(&self) -> Result<(), NetProviderError> {
        <Self as NetProvider>::init(self).map_err(|e| anyhow::Error::new(e).into())
    }

    #[inline]
    fn get_num_devices(&self) -> usize {
        <Self as NetProvider>::get_num_devices(self)
    }

    #[inline]
    fn get_properties(&self, device: usize) -> &NetProperties {
        <Self as NetProvider>::get_properties(self, device)
    }

    #[inline]
    async fn listen(&self, device: usize) -> Result<NetListenerErased, NetProviderError> {
        let listener = <Self as NetProvider>::listen(self, device)
            .await
            .map_err(anyhow::Error::new)?;
        let serialized_handle = ConnectHandle::serialize_from(listener.handle)?;
        Ok(NetListenerErased {
            handle: serialized_handle,
            listen_comm: listener.listen_comm,
        })
    }

    #[inline]
    async fn connect(
        &self,
        device: usize,
        handle: &ConnectHandle,
    ) -> Result<Box<AnyNetComm>, NetProviderError> {
        let handle = handle.deserialize_to::<<Self as NetProvider>::NetHandle>()?;
        let send_comm = <Self as NetProvider>::connect(self, device, handle)
            .await
            .map_err(anyhow::Error::new)?;
        Ok(send_comm)
    }

    #[inline]
    async fn accept(
        &self,
        listen_comm: Box<AnyNetComm>,
    ) -> Result<Box<AnyNetComm>, NetProviderError> {
        let recv_comm = <Self as NetProvider>::accept(self, listen_comm)
            .await
            .map_err(anyhow::Error::new)?;
        Ok(recv_comm)
    }

    #[inline]
    fn register_mr(
        &self,
        comm: Pin<&mut AnyNetComm>,
        mr: MemoryRegion,
    ) -> Result<Box<AnyMrHandle>, NetProviderError> {
        <Self as NetProvider>::register_mr(self, comm, mr)
            .map_err(|e| anyhow::Error::new(e).into())
    }

    #[inline]
    fn register_mr_dma_buf(
        &self,
        comm: Pin<&mut AnyNetComm>,
        mr: MemoryRegion,
        offset: u64,
        fd: RawFd,
    ) -> Result<Box<AnyMrHandle>, NetProviderError> {
        <Self as NetProvider>::register_mr_dma_buf(self, comm, mr, offset, fd)
            .map_err(|e| anyhow::Error::new(e).into())
    }

    #[inline]
    fn deregister_mr(
        &self,
        comm: Pin<&mut AnyNetComm>,
        handle: Box<AnyMrHandle>,
    ) -> Result<(), NetProviderError> {
        <Self as NetProvider>::deregister_mr(self, comm, handle)
            .map_err(|e| anyhow::Error::new(e).into())
    }

    #[inline]
    fn initiate_send(
        &self,
        send_comm: Pin<&mut AnyNetComm>,
        data: *mut c_void,
        size: usize,
        tag: u32,
        mr_handle: &AnyMrHandle,
    ) -> Result<Option<NetRequestId>, NetProviderError> {
        <Self as NetProvider>::initiate_send(self, send_comm, data, size, tag, mr_handle)
            .map_err(|e| anyhow::Error::new(e).into())
    }

    #[inline]
    fn initiate_recv(
        &self,
        recv_comm: Pin<&mut AnyNetComm>,
        data: &[*mut c_void],
        sizes: &[usize],
        tags: &[u32],
        mr_handles: &[&AnyMrHandle],
    ) -> Result<Option<NetRequestId>, NetProviderError> {
        <Self as NetProvider>::initiate_recv(self, recv_comm, data, sizes, tags, mr_handles)
            .map_err(|e| anyhow::Error::new(e).into())
    }

    #[inline]
    fn initiate_flush(
        &self,
        recv_comm: Pin<&mut AnyNetComm>,
        data: &[*mut c_void],
        sizes: &[usize],
        mr_handles: &[&AnyMrHandle],
    ) -> Result<Option<NetRequestId>, NetProviderError> {
        <Self as NetProvider>::initiate_flush(self, recv_comm, data, sizes, mr_handles)
            .map_err(|e| anyhow::Error::new(e).into())
    }

    #[inline]
    fn test(
        &self,
        request: NetRequestId,
        sizes: Option<&mut [usize]>,
    ) -> Result<bool, NetProviderError> {
        <Self as NetProvider>::test(self, request, sizes)
            .map_err(|e| anyhow::Error::new(e).into())
    }
}
