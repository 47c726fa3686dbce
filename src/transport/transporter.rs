use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use super::catalog::TransportCatalog;
use super::channel::{PeerConnId, PeerConnInfo};
use super::op::TransportOp;
use crate::comm::{CommProfile, CommunicatorId, PeerInfo};

pub type AgentMessage = Option<Box<dyn Any + Send>>;
pub type AnyResources = Box<dyn Any + Send>;
pub type TransporterError = anyhow::Error;

/// Connected per-agent resources owned by the transport engine and borrowed
/// by the progress entry points, which resolve each sub-operation's endpoint
/// out of it.
pub type ConnResourceTable = HashMap<TransportAgentId, AnyResources>;

pub const CONNECT_HANDLE_SIZE: usize = 128;

/// Fixed-size connect-info blob exchanged between peers during setup. Large
/// enough for any provider listen handle.
#[derive(Clone, Debug)]
#[repr(transparent)]
pub struct ConnectHandle(pub [u8; CONNECT_HANDLE_SIZE]);

#[derive(Debug, Error)]
pub enum ConnectHandleError {
    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("Required size {0} exceeds maximum of {}", CONNECT_HANDLE_SIZE)]
    ExceedMaxSize(usize),
}

impl ConnectHandle {
    pub fn serialize_from<T: Serialize>(handle: T) -> Result<Self, ConnectHandleError> {
        let mut serialized = [0u8; CONNECT_HANDLE_SIZE];
        let required_size = bincode::serialized_size(&handle)?;
        if required_size as usize > CONNECT_HANDLE_SIZE {
            return Err(ConnectHandleError::ExceedMaxSize(required_size as usize));
        }
        bincode::serialize_into(serialized.as_mut_slice(), &handle)?;
        Ok(ConnectHandle(serialized))
    }

    pub fn deserialize_to<T: DeserializeOwned>(&self) -> Result<T, ConnectHandleError> {
        let handle = bincode::deserialize::<T>(self.0.as_slice())?;
        Ok(handle)
    }
}

pub enum TransportSetup {
    /// Setup needs a proxy-side agent round before the connect handle exists.
    PreAgentCb {
        agent_cuda_dev: i32,
        agent_request: AgentMessage,
        setup_resources: Option<AnyResources>,
    },
    Setup {
        peer_connect_handle: ConnectHandle,
        setup_resources: Option<AnyResources>,
    },
}

pub enum TransportConnect {
    PreAgentCb {
        agent_request: AgentMessage,
        transport_resources: Option<AnyResources>,
    },
    Connect {
        conn_info: PeerConnInfo,
        transport_resources: AnyResources,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TransportAgentId {
    pub communicator_id: CommunicatorId,
    pub client_rank: usize,
    pub client_cuda_dev: i32,
    pub peer_conn: PeerConnId,
}

/// The transport v-table. The first block runs on the rank that owns the
/// GPU ("kernel side"); the `agent_*` block runs on the proxy that drives the
/// NIC, possibly in another process.
#[async_trait]
pub trait Transporter: Send + Sync {
    /// Whether this transport progresses through proxy ops at all.
    #[inline]
    fn need_op(&self) -> bool {
        true
    }

    /// Whether two peers can communicate through this transport.
    #[inline]
    fn can_connect(
        &self,
        _send_peer: &PeerInfo,
        _recv_peer: &PeerInfo,
        _profile: &CommProfile,
        _catalog: &TransportCatalog,
    ) -> bool {
        false
    }

    fn send_setup(
        &self,
        conn_id: &PeerConnId,
        my_info: &PeerInfo,
        peer_info: &PeerInfo,
        profile: &CommProfile,
        catalog: &TransportCatalog,
    ) -> Result<TransportSetup, TransporterError>;

    /// Completes `send_setup` once the agent round-trip finished.
    fn send_setup_agent_callback(
        &self,
        _rank: usize,
        _conn_id: &PeerConnId,
        _agent_reply: AgentMessage,
        _setup_resources: Option<AnyResources>,
    ) -> Result<TransportSetup, TransporterError> {
        unimplemented!("Transport agent is not implemented for this transport");
    }

    fn send_connect(
        &self,
        conn_id: &PeerConnId,
        connect_handle: ConnectHandle,
        setup_resources: Option<AnyResources>,
    ) -> Result<TransportConnect, TransporterError>;

    fn send_connect_agent_callback(
        &self,
        _conn_id: &PeerConnId,
        _agent_reply: AgentMessage,
        _transport_resources: Option<AnyResources>,
    ) -> Result<TransportConnect, TransporterError> {
        unimplemented!("Transport agent is not implemented for this transport");
    }

    fn recv_setup(
        &self,
        conn_id: &PeerConnId,
        my_info: &PeerInfo,
        peer_info: &PeerInfo,
        profile: &CommProfile,
        catalog: &TransportCatalog,
    ) -> Result<TransportSetup, TransporterError>;

    fn recv_setup_agent_callback(
        &self,
        _rank: usize,
        _conn_id: &PeerConnId,
        _agent_reply: AgentMessage,
        _setup_resources: Option<AnyResources>,
    ) -> Result<TransportSetup, TransporterError> {
        unimplemented!("Transport agent is not implemented for this transport");
    }

    fn recv_connect(
        &self,
        conn_id: &PeerConnId,
        connect_handle: ConnectHandle,
        setup_resources: Option<AnyResources>,
    ) -> Result<TransportConnect, TransporterError>;

    fn recv_connect_agent_callback(
        &self,
        _conn_id: &PeerConnId,
        _agent_reply: AgentMessage,
        _transport_resources: Option<AnyResources>,
    ) -> Result<TransportConnect, TransporterError> {
        unimplemented!("Transport agent is not implemented for this transport");
    }

    /// Proxy-side shared-state initialization without a connection (used by
    /// preconnect paths that only reserve shared staging buffers).
    async fn agent_shared_init(
        &self,
        _id: TransportAgentId,
        _agent_request: AgentMessage,
        _catalog: Arc<TransportCatalog>,
    ) -> Result<AnyResources, TransporterError> {
        unimplemented!("Transport agent is not implemented for this transport");
    }

    async fn agent_send_setup(
        &self,
        _id: TransportAgentId,
        _agent_request: AgentMessage,
        _catalog: Arc<TransportCatalog>,
    ) -> Result<(AnyResources, AgentMessage), TransporterError> {
        unimplemented!("Transport agent is not implemented for this transport");
    }

    async fn agent_send_connect(
        &self,
        _id: TransportAgentId,
        _agent_request: AgentMessage,
        _setup_resources: Option<AnyResources>,
    ) -> Result<(AnyResources, AgentMessage), TransporterError> {
        unimplemented!("Transport agent is not implemented for this transport");
    }

    async fn agent_recv_setup(
        &self,
        _id: TransportAgentId,
        _agent_request: AgentMessage,
        _catalog: Arc<TransportCatalog>,
    ) -> Result<(AnyResources, AgentMessage), TransporterError> {
        unimplemented!("Transport agent is not implemented for this transport");
    }

    async fn agent_recv_connect(
        &self,
        _id: TransportAgentId,
        _agent_request: AgentMessage,
        _setup_resources: Option<AnyResources>,
    ) -> Result<(AnyResources, AgentMessage), TransporterError> {
        unimplemented!("Transport agent is not implemented for this transport");
    }

    /// Releases everything an agent connection owns. Must accept resources
    /// from any stage of the lifecycle (shared-init only, setup, connected).
    fn agent_free(
        &self,
        _id: &TransportAgentId,
        _resources: AnyResources,
    ) -> Result<(), TransporterError> {
        unimplemented!("Transport agent is not implemented for this transport");
    }

    /// One cooperative pass over a send op. Must not block: either advance at
    /// least one step or leave `op.idle` set.
    fn agent_send_progress_op(
        &self,
        _op: &mut TransportOp,
        _resources: &mut ConnResourceTable,
    ) -> Result<(), TransporterError> {
        unimplemented!("Transport agent is not implemented for this transport");
    }

    fn agent_recv_progress_op(
        &self,
        _op: &mut TransportOp,
        _resources: &mut ConnResourceTable,
    ) -> Result<(), TransporterError> {
        unimplemented!("Transport agent is not implemented for this transport");
    }
}
