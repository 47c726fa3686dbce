use super::op::TransportOp;
use super::transporter::{AgentMessage, TransportAgentId, Transporter};

pub enum TransportEngineRequest {
    AgentSetup(&'static dyn Transporter, TransportAgentId, AgentMessage),
    AgentConnect(&'static dyn Transporter, TransportAgentId, AgentMessage),
    AgentSharedInit(&'static dyn Transporter, TransportAgentId, AgentMessage),
    AgentTransportOp(TransportAgentId, TransportOp),
    AgentFree(TransportAgentId),
}

pub enum TransportEngineReply {
    AgentSetup(TransportAgentId, AgentMessage),
    AgentConnect(TransportAgentId, AgentMessage),
    AgentFree(TransportAgentId),
    /// A setup, connect or progress entry point failed; the connection is
    /// dead and the error travels up to the caller.
    AgentError(TransportAgentId, String),
}
