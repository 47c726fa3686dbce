use std::fmt::Display;

use serde::{Deserialize, Serialize};

use super::NUM_PROTOCOLS;
use crate::device::ptr::DeviceNonNull;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub u32);

impl Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0.to_string().as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnType {
    Send,
    Recv,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PeerConnId {
    pub peer_rank: usize,
    pub channel: ChannelId,
    pub conn_index: u32,
    pub conn_type: ConnType,
}

/// GPU-visible view of one connection, resolved from the connect-time map and
/// handed to the collective kernel.
pub struct PeerConnInfo {
    pub bufs: [Option<DeviceNonNull<u8>>; NUM_PROTOCOLS],
    pub head: DeviceNonNull<u64>,
    pub tail: DeviceNonNull<u64>,
    pub slots_sizes: DeviceNonNull<i32>,
    /// Present only when staging goes through a shared arena.
    pub slots_offsets: Option<DeviceNonNull<i32>>,
}
