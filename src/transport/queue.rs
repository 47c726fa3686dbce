use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};

use super::op::TransportOp;
use super::transporter::TransportAgentId;

const PER_CONN_QUEUE_INIT_CAPACITY: usize = 16;

/// Active transport ops, one FIFO per agent connection so that ops on the
/// same endpoint never reorder, while distinct connections progress
/// round-robin.
pub struct TransportOpQueue {
    queue: Vec<(TransportAgentId, VecDeque<TransportOp>)>,
    connection_index: HashMap<TransportAgentId, usize>,
}

impl TransportOpQueue {
    pub fn new() -> Self {
        TransportOpQueue {
            queue: Vec::new(),
            connection_index: HashMap::new(),
        }
    }

    pub fn submit_op(&mut self, agent: TransportAgentId, op: TransportOp) {
        match self.connection_index.entry(agent) {
            Entry::Occupied(entry) => {
                let index = *entry.get();
                self.queue[index].1.push_back(op);
            }
            Entry::Vacant(entry) => {
                entry.insert(self.queue.len());
                let mut agent_queue = VecDeque::with_capacity(PER_CONN_QUEUE_INIT_CAPACITY);
                agent_queue.push_back(op);
                self.queue.push((agent, agent_queue));
            }
        }
    }

    /// Progress the head op of every connection; `f` returns whether the op
    /// completed.
    pub fn progress_ops<F>(&mut self, mut f: F)
    where
        F: FnMut(&TransportAgentId, &mut TransportOp) -> bool,
    {
        for (agent_id, agent_queue) in self.queue.iter_mut() {
            if let Some(op) = agent_queue.front_mut() {
                let finished = f(agent_id, op);
                if finished {
                    agent_queue.pop_front();
                }
            }
        }
    }

    pub fn remove_agent(&mut self, agent_id: &TransportAgentId) {
        if let Some(index) = self.connection_index.remove(agent_id) {
            self.queue.swap_remove(index);
            if let Some((moved, _)) = self.queue.get(index) {
                self.connection_index.insert(*moved, index);
            }
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.iter().all(|(_, q)| q.is_empty())
    }
}

impl Default for TransportOpQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::CommunicatorId;
    use crate::transport::channel::{ChannelId, ConnType, PeerConnId};
    use crate::transport::op::{TransportOp, TransportSubOp};
    use crate::transport::Protocol;

    fn agent(peer: usize) -> TransportAgentId {
        TransportAgentId {
            communicator_id: CommunicatorId(0),
            client_rank: 0,
            client_cuda_dev: 0,
            peer_conn: PeerConnId {
                peer_rank: peer,
                channel: ChannelId(0),
                conn_index: 0,
                conn_type: ConnType::Send,
            },
        }
    }

    fn op(agent_id: TransportAgentId) -> TransportOp {
        TransportOp::new(
            CommunicatorId(0),
            Protocol::Simple,
            1,
            1,
            vec![TransportSubOp::new(agent_id, 4, 1024)],
        )
    }

    #[test]
    fn per_connection_fifo_order() {
        let mut queue = TransportOpQueue::new();
        let a = agent(1);
        let b = agent(2);
        queue.submit_op(a, op(a));
        queue.submit_op(a, op(a));
        queue.submit_op(b, op(b));

        let mut seen = Vec::new();
        queue.progress_ops(|id, _| {
            seen.push(id.peer_conn.peer_rank);
            true
        });
        // One op per connection per pass.
        assert_eq!(seen, vec![1, 2]);
        queue.progress_ops(|id, _| {
            seen.push(id.peer_conn.peer_rank);
            true
        });
        assert_eq!(seen, vec![1, 2, 1]);
        assert!(queue.is_empty());
    }

    #[test]
    fn remove_agent_keeps_index_consistent() {
        let mut queue = TransportOpQueue::new();
        let ids: Vec<_> = (0..3).map(agent).collect();
        for &id in &ids {
            queue.submit_op(id, op(id));
        }
        queue.remove_agent(&ids[0]);
        // The swapped-in tail entry must still be reachable by its id.
        queue.submit_op(ids[2], op(ids[2]));
        let mut count = 0;
        queue.progress_ops(|_, _| {
            count += 1;
            true
        });
        assert_eq!(count, 2);
    }
}
