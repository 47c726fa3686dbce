use super::net::provider::NetRequestId;
use super::transporter::TransportAgentId;
use super::{Protocol, NUM_BUFFER_SLOTS};
use crate::comm::CommunicatorId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportOpState {
    Init,
    InProgress,
    Completed,
}

/// One connection's share of a transport op. Counter invariant:
/// `done <= transmitted <= posted <= num_steps` (the receive path tracks
/// `received` between posted and transmitted), every increment a multiple of
/// the op's `slice_steps`.
#[derive(Clone, Debug)]
pub struct TransportSubOp {
    pub agent: TransportAgentId,
    pub num_steps: u64,
    pub nbytes: usize,
    /// Number of consecutive subs sharing one receive endpoint; set when the
    /// op leaves `Init`.
    pub(crate) group_size: usize,
    pub(crate) base: u64,
    pub(crate) posted: u64,
    pub(crate) received: u64,
    pub(crate) transmitted: u64,
    pub(crate) done: u64,
    pub(crate) requests: [Option<NetRequestId>; NUM_BUFFER_SLOTS],
}

impl TransportSubOp {
    pub fn new(agent: TransportAgentId, num_steps: u64, nbytes: usize) -> Self {
        TransportSubOp {
            agent,
            num_steps,
            nbytes,
            group_size: 1,
            base: 0,
            posted: 0,
            received: 0,
            transmitted: 0,
            done: 0,
            requests: [None; NUM_BUFFER_SLOTS],
        }
    }

    #[inline]
    pub fn steps_done(&self) -> u64 {
        self.done
    }
}

/// A batch of sub-operations progressed together by the proxy. All subs share
/// direction, protocol and step quantization.
#[derive(Clone, Debug)]
pub struct TransportOp {
    pub communicator_id: CommunicatorId,
    pub slice_steps: u64,
    pub chunk_steps: u64,
    pub protocol: Protocol,
    pub state: TransportOpState,
    pub idle: bool,
    pub(crate) done_subs: usize,
    pub subs: Vec<TransportSubOp>,
}

impl TransportOp {
    pub fn new(
        communicator_id: CommunicatorId,
        protocol: Protocol,
        slice_steps: u64,
        chunk_steps: u64,
        subs: Vec<TransportSubOp>,
    ) -> Self {
        TransportOp {
            communicator_id,
            slice_steps,
            chunk_steps,
            protocol,
            state: TransportOpState::Init,
            idle: true,
            done_subs: 0,
            subs,
        }
    }
}
