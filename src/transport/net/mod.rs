pub mod agent;
pub mod buffer;
pub mod config;
pub mod provider;
pub mod resources;
pub mod shared;
pub mod transporter;

#[cfg(test)]
mod tests;

use thiserror::Error;

use crate::device::DeviceError;
use crate::transport::transporter::ConnectHandleError;
use crate::utils::shm::ShmError;
use provider::NetProviderError;

/// Kernel-side errors of the net transport.
#[derive(Debug, Error)]
pub enum NetTransportError {
    #[error("failed to downcast setup resources")]
    DowncastSetupResources,
    #[error("failed to downcast agent reply")]
    DowncastAgentReply,
    #[error("invalid agent reply")]
    InvalidAgentReply,
    #[error("connect handle: {0}")]
    ConnectHandle(#[from] ConnectHandleError),
    #[error("device runtime: {0}")]
    Device(#[from] DeviceError),
    #[error("shared memory: {0}")]
    Shm(#[from] ShmError),
}

/// Proxy-side errors. Any of these kills the connection; nothing is retried
/// locally.
#[derive(Debug, Error)]
pub enum NetAgentError {
    #[error("failed to downcast agent request")]
    DowncastAgentRequest,
    #[error("failed to downcast agent resources")]
    DowncastAgentResources,
    #[error("net provider: {0}")]
    Provider(#[from] NetProviderError),
    #[error("device runtime: {0}")]
    Device(#[from] DeviceError),
    #[error("shared memory: {0}")]
    Shm(#[from] ShmError),
    #[error("connect handle: {0}")]
    ConnectHandle(#[from] ConnectHandleError),
    #[error("remote proxy is not supported on the receive side")]
    RemoteRecvProxy,
    #[error("host-backed shared buffers cannot bridge processes")]
    CrossProcessHostBuffer,
    #[error("shared pool entry missing for local rank {0}")]
    SharedPoolCorrupted(usize),
    #[error("GDR flush through a GDC read is only supported on x86-64")]
    GdrFlushUnsupported,
    #[error("transport op references an unknown connection")]
    UnknownConnection,
    #[error("memory registration: {0}")]
    BufferRegistration(String),
    #[error("connect map is missing a populated offset")]
    MapResolution,
    #[error("transport catalog: {0}")]
    Catalog(#[from] crate::transport::catalog::Error),
}
