use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::AgentError;
use crate::types::{AgentId, AgentResponse, Credentials, RequestId};

pub mod tcp;
pub use tcp::TcpAgentChannel;

/// An asynchronous request that has been handed to an agent.
///
/// `response` resolves at most once.  If the sender side is dropped the
/// agent is treated as never having answered.
#[derive(Debug)]
pub struct PendingRequest {
    pub request_id: RequestId,
    pub response: oneshot::Receiver<AgentResponse>,
}

/// Handle to a single agent.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Issues a sync_dns request without waiting for the reply.
    async fn sync_dns(
        &self,
        blobstore_id: &str,
        sha1: &str,
        version: u64,
    ) -> Result<PendingRequest, AgentError>;

    /// Best-effort cancel of an in-flight sync_dns request.  Does not wait
    /// for the agent to acknowledge.
    async fn cancel_sync_dns(&self, request_id: &RequestId) -> Result<(), AgentError>;

    /// Blocks until the agent acknowledges or the call fails.
    async fn delete_arp_entries(&self, ips: &[String]) -> Result<(), AgentError>;
}

/// Produces agent handles from VM credentials and agent ids.
pub trait AgentChannel: Send + Sync {
    fn client(&self, credentials: Option<&Credentials>, agent_id: &AgentId) -> Arc<dyn AgentClient>;
}
