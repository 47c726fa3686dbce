use std::collections::HashMap;
use std::sync::Arc;
use std::task::{Context, Poll};

use crossbeam::channel::{Receiver, Sender, TryRecvError};
use futures::future::BoxFuture;
use futures::FutureExt;

use super::catalog::TransportCatalog;
use super::channel::ConnType;
use super::message::{TransportEngineReply, TransportEngineRequest};
use super::op::{TransportOp, TransportOpState};
use super::queue::TransportOpQueue;
use super::transporter::{
    AgentMessage, AnyResources, ConnResourceTable, TransportAgentId, Transporter, TransporterError,
};
use crate::utils::pool::WorkPool;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TransportEngineId {
    pub cuda_device_idx: i32,
    pub index: u32,
}

enum AsyncTaskOutput {
    Setup {
        setup_resources: AnyResources,
        reply: AgentMessage,
    },
    Connect {
        agent_resources: AnyResources,
        reply: AgentMessage,
    },
    SharedInit {
        resources: AnyResources,
    },
}

struct AsyncTask {
    agent_id: TransportAgentId,
    transporter: &'static dyn Transporter,
    task: BoxFuture<'static, Result<AsyncTaskOutput, TransporterError>>,
}

fn new_setup_task(
    transporter: &'static dyn Transporter,
    id: TransportAgentId,
    request: AgentMessage,
    catalog: Arc<TransportCatalog>,
) -> AsyncTask {
    let setup = match id.peer_conn.conn_type {
        ConnType::Send => transporter.agent_send_setup(id, request, catalog),
        ConnType::Recv => transporter.agent_recv_setup(id, request, catalog),
    };
    let task = setup.map(|result| {
        result.map(|(resources, reply)| AsyncTaskOutput::Setup {
            setup_resources: resources,
            reply,
        })
    });
    AsyncTask {
        agent_id: id,
        transporter,
        task: Box::pin(task),
    }
}

fn new_connect_task(
    transporter: &'static dyn Transporter,
    id: TransportAgentId,
    request: AgentMessage,
    setup_resources: Option<AnyResources>,
) -> AsyncTask {
    let connect = match id.peer_conn.conn_type {
        ConnType::Send => transporter.agent_send_connect(id, request, setup_resources),
        ConnType::Recv => transporter.agent_recv_connect(id, request, setup_resources),
    };
    let task = connect.map(|result| {
        result.map(|(resources, reply)| AsyncTaskOutput::Connect {
            agent_resources: resources,
            reply,
        })
    });
    AsyncTask {
        agent_id: id,
        transporter,
        task: Box::pin(task),
    }
}

fn new_shared_init_task(
    transporter: &'static dyn Transporter,
    id: TransportAgentId,
    request: AgentMessage,
    catalog: Arc<TransportCatalog>,
) -> AsyncTask {
    let task = transporter
        .agent_shared_init(id, request, catalog)
        .map(|result| result.map(|resources| AsyncTaskOutput::SharedInit { resources }));
    AsyncTask {
        agent_id: id,
        transporter,
        task: Box::pin(task),
    }
}

struct TransportEngineResources {
    agent_setup: HashMap<TransportAgentId, (&'static dyn Transporter, AnyResources)>,
    agent_connected: HashMap<TransportAgentId, &'static dyn Transporter>,
    conn_resources: ConnResourceTable,
    catalog: Arc<TransportCatalog>,
    proxy_tx: Vec<Sender<TransportEngineReply>>,
    proxy_rx: Vec<Receiver<TransportEngineRequest>>,
}

impl TransportEngineResources {
    fn reply(&self, agent_id: &TransportAgentId, reply: TransportEngineReply) {
        let chan = agent_id.client_cuda_dev as usize % self.proxy_tx.len();
        if self.proxy_tx[chan].send(reply).is_err() {
            log::error!("proxy {} hung up, dropping reply", chan);
        }
    }

    fn progress_op(&mut self, agent_id: &TransportAgentId, op: &mut TransportOp) -> bool {
        let Some(transporter) = self.agent_connected.get(agent_id) else {
            log::error!("transport op for unknown connection {:?}", agent_id);
            return true;
        };
        let result = match agent_id.peer_conn.conn_type {
            ConnType::Send => transporter.agent_send_progress_op(op, &mut self.conn_resources),
            ConnType::Recv => transporter.agent_recv_progress_op(op, &mut self.conn_resources),
        };
        match result {
            Ok(()) => op.state == TransportOpState::Completed,
            Err(e) => {
                log::error!("transport op failed on {:?}: {:#}", agent_id, e);
                self.reply(
                    agent_id,
                    TransportEngineReply::AgentError(*agent_id, format!("{:#}", e)),
                );
                true
            }
        }
    }

    fn progress_async_task(&mut self, task: &mut AsyncTask) -> bool {
        let waker = futures::task::noop_waker_ref();
        let mut cx = Context::from_waker(waker);
        match task.task.as_mut().poll(&mut cx) {
            Poll::Ready(Ok(output)) => {
                match output {
                    AsyncTaskOutput::Setup {
                        setup_resources,
                        reply,
                    } => {
                        self.agent_setup
                            .insert(task.agent_id, (task.transporter, setup_resources));
                        self.reply(
                            &task.agent_id,
                            TransportEngineReply::AgentSetup(task.agent_id, reply),
                        );
                    }
                    AsyncTaskOutput::Connect {
                        agent_resources,
                        reply,
                    } => {
                        self.agent_connected.insert(task.agent_id, task.transporter);
                        self.conn_resources.insert(task.agent_id, agent_resources);
                        self.reply(
                            &task.agent_id,
                            TransportEngineReply::AgentConnect(task.agent_id, reply),
                        );
                    }
                    AsyncTaskOutput::SharedInit { resources } => {
                        self.agent_setup
                            .insert(task.agent_id, (task.transporter, resources));
                    }
                }
                true
            }
            Poll::Ready(Err(e)) => {
                log::error!("agent task failed on {:?}: {:#}", task.agent_id, e);
                self.reply(
                    &task.agent_id,
                    TransportEngineReply::AgentError(task.agent_id, format!("{:#}", e)),
                );
                true
            }
            Poll::Pending => false,
        }
    }

    fn free_agent(&mut self, agent_id: &TransportAgentId) {
        let freed = if let Some(resources) = self.conn_resources.remove(agent_id) {
            let transporter = self.agent_connected.remove(agent_id);
            transporter.map(|t| t.agent_free(agent_id, resources))
        } else {
            self.agent_setup
                .remove(agent_id)
                .map(|(transporter, resources)| transporter.agent_free(agent_id, resources))
        };
        match freed {
            Some(Ok(())) => self.reply(agent_id, TransportEngineReply::AgentFree(*agent_id)),
            Some(Err(e)) => {
                log::error!("agent free failed on {:?}: {:#}", agent_id, e);
                self.reply(
                    agent_id,
                    TransportEngineReply::AgentError(*agent_id, format!("{:#}", e)),
                );
            }
            None => log::error!("free for unknown connection {:?}", agent_id),
        }
    }
}

/// Cooperative single-threaded driver for transport agents: accepts setup,
/// connect and op-submission requests from proxies, polls the agents' async
/// tasks with a no-op waker, and progresses active ops one pass at a time.
pub struct TransportEngine {
    pub id: TransportEngineId,
    resources: TransportEngineResources,
    async_tasks: WorkPool<AsyncTask>,
    op_queue: TransportOpQueue,
}

impl TransportEngine {
    pub fn new(
        id: TransportEngineId,
        catalog: Arc<TransportCatalog>,
        proxy_tx: Vec<Sender<TransportEngineReply>>,
        proxy_rx: Vec<Receiver<TransportEngineRequest>>,
    ) -> Self {
        TransportEngine {
            id,
            resources: TransportEngineResources {
                agent_setup: HashMap::new(),
                agent_connected: HashMap::new(),
                conn_resources: ConnResourceTable::new(),
                catalog,
                proxy_tx,
                proxy_rx,
            },
            async_tasks: WorkPool::new(),
            op_queue: TransportOpQueue::new(),
        }
    }

    /// One scheduler pass. Returns whether any work remains queued.
    pub fn mainloop(&mut self) -> bool {
        self.check_proxy_requests();
        self.progress_async_tasks();
        self.progress_ops();
        !(self.async_tasks.is_empty() && self.op_queue.is_empty())
    }

    fn check_proxy_requests(&mut self) {
        for chan in 0..self.resources.proxy_rx.len() {
            loop {
                match self.resources.proxy_rx[chan].try_recv() {
                    Ok(request) => match request {
                        TransportEngineRequest::AgentSetup(transporter, agent_id, request) => {
                            let task = new_setup_task(
                                transporter,
                                agent_id,
                                request,
                                Arc::clone(&self.resources.catalog),
                            );
                            self.async_tasks.enqueue(task);
                        }
                        TransportEngineRequest::AgentConnect(transporter, agent_id, request) => {
                            let setup_resources = self
                                .resources
                                .agent_setup
                                .remove(&agent_id)
                                .map(|(_, resources)| resources);
                            let task =
                                new_connect_task(transporter, agent_id, request, setup_resources);
                            self.async_tasks.enqueue(task);
                        }
                        TransportEngineRequest::AgentSharedInit(transporter, agent_id, request) => {
                            let task = new_shared_init_task(
                                transporter,
                                agent_id,
                                request,
                                Arc::clone(&self.resources.catalog),
                            );
                            self.async_tasks.enqueue(task);
                        }
                        TransportEngineRequest::AgentTransportOp(agent_id, op) => {
                            self.op_queue.submit_op(agent_id, op);
                        }
                        TransportEngineRequest::AgentFree(agent_id) => {
                            self.op_queue.remove_agent(&agent_id);
                            self.resources.free_agent(&agent_id);
                        }
                    },
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => break,
                }
            }
        }
    }

    fn progress_async_tasks(&mut self) {
        let resources = &mut self.resources;
        self.async_tasks.progress(|x| resources.progress_async_task(x));
    }

    fn progress_ops(&mut self) {
        let resources = &mut self.resources;
        self.op_queue
            .progress_ops(|agent_id, op| resources.progress_op(agent_id, op));
    }
}
