//! Proxy network transport for GPU collective communication: the data-plane
//! bridge between GPU-resident producers/consumers and a pluggable
//! RDMA/socket network provider.

pub mod comm;
pub mod device;
pub mod transport;
pub mod utils;
