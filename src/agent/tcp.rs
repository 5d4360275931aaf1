//! Agent transport over plain TCP.
//!
//! Every request opens a connection to the agent, writes one JSON
//! envelope terminated by a newline and, for methods that expect an
//! answer, reads one JSON line back.  Envelopes are signed with the
//! VM's sign key so agents can drop messages from anyone else.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::AbortHandle;
use tokio::time::timeout;

use super::{AgentChannel, AgentClient, PendingRequest};
use crate::error::AgentError;
use crate::types::{AgentId, AgentRequest, AgentResponse, Credentials, RequestId};

const REPLY_TO: &str = "fleetsync";

type Inflight = Arc<Mutex<HashMap<RequestId, AbortHandle>>>;

#[derive(Serialize)]
struct Envelope<'a> {
    request_id: &'a RequestId,
    #[serde(flatten)]
    request: &'a AgentRequest,
    reply_to: &'a str,
    signature: String,
}

/// Signature agents verify: hex SHA-256 over key, request id and method.
pub fn sign(key: &str, request_id: &RequestId, method: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(request_id.0.as_bytes());
    hasher.update(method.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct TcpAgentChannel {
    endpoints: HashMap<AgentId, SocketAddr>,
    default_sign_key: Option<String>,
    connect_timeout: Duration,
    inflight: Inflight,
}

impl TcpAgentChannel {
    pub fn new(
        endpoints: HashMap<AgentId, SocketAddr>,
        default_sign_key: Option<String>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            endpoints,
            default_sign_key,
            connect_timeout,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of sync_dns requests still waiting for a reply.
    pub async fn inflight_count(&self) -> usize {
        self.inflight.lock().await.len()
    }
}

impl AgentChannel for TcpAgentChannel {
    fn client(&self, credentials: Option<&Credentials>, agent_id: &AgentId) -> Arc<dyn AgentClient> {
        let sign_key = credentials
            .map(|c| c.sign_key.clone())
            .or_else(|| self.default_sign_key.clone())
            .unwrap_or_default();
        Arc::new(TcpAgentClient {
            agent_id: agent_id.clone(),
            addr: self.endpoints.get(agent_id).copied(),
            sign_key,
            connect_timeout: self.connect_timeout,
            inflight: Arc::clone(&self.inflight),
        })
    }
}

#[derive(Clone)]
struct TcpAgentClient {
    agent_id: AgentId,
    addr: Option<SocketAddr>,
    sign_key: String,
    connect_timeout: Duration,
    inflight: Inflight,
}

impl TcpAgentClient {
    /// Connects and writes the request, returning the open stream.
    async fn send(&self, request_id: &RequestId, request: &AgentRequest) -> Result<TcpStream, AgentError> {
        let addr = self
            .addr
            .ok_or_else(|| AgentError::UnknownAgent(self.agent_id.clone()))?;

        let mut stream = match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(AgentError::Connect {
                    agent: self.agent_id.clone(),
                    source,
                })
            }
            Err(_) => {
                return Err(AgentError::Connect {
                    agent: self.agent_id.clone(),
                    source: std::io::ErrorKind::TimedOut.into(),
                })
            }
        };

        let envelope = Envelope {
            request_id,
            request,
            reply_to: REPLY_TO,
            signature: sign(&self.sign_key, request_id, request.method()),
        };
        let mut line = serde_json::to_vec(&envelope).map_err(|source| AgentError::Codec {
            agent: self.agent_id.clone(),
            source,
        })?;
        line.push(b'\n');

        stream.write_all(&line).await.map_err(|source| self.io_err(source))?;
        stream.flush().await.map_err(|source| self.io_err(source))?;
        debug!("Sent {} [{}] to agent {}", request.method(), request_id, self.agent_id);
        Ok(stream)
    }

    /// Sends the request and waits for the single reply line.
    async fn request(
        &self,
        request_id: &RequestId,
        request: &AgentRequest,
    ) -> Result<Option<AgentResponse>, AgentError> {
        let stream = self.send(request_id, request).await?;
        read_response(stream).await.map_err(|source| self.io_err(source))
    }

    fn io_err(&self, source: std::io::Error) -> AgentError {
        AgentError::Io {
            agent: self.agent_id.clone(),
            source,
        }
    }
}

/// Reads one reply line.  A line that is not a valid reply is turned into
/// a failure response rather than an error, since the agent did answer.
async fn read_response(stream: TcpStream) -> std::io::Result<Option<AgentResponse>> {
    let mut lines = BufReader::new(stream).lines();
    Ok(lines.next_line().await?.map(|line| {
        serde_json::from_str(&line)
            .unwrap_or_else(|e| AgentResponse::failure(format!("malformed reply {:?}: {}", line, e)))
    }))
}

#[async_trait]
impl AgentClient for TcpAgentClient {
    /// Returns as soon as the request is registered; connecting, writing
    /// and reading the reply happen in a background task.
    async fn sync_dns(
        &self,
        blobstore_id: &str,
        sha1: &str,
        version: u64,
    ) -> Result<PendingRequest, AgentError> {
        if self.addr.is_none() {
            return Err(AgentError::UnknownAgent(self.agent_id.clone()));
        }

        let request_id = RequestId::generate();
        let request = AgentRequest::SyncDns {
            blobstore_id: blobstore_id.to_string(),
            sha1: sha1.to_string(),
            version,
        };

        let (tx, rx) = oneshot::channel();
        let client = self.clone();
        let id = request_id.clone();

        // Hold the lock while spawning so the task cannot deregister
        // itself before it has been registered.
        let mut registry = self.inflight.lock().await;
        let handle = tokio::spawn(async move {
            match client.request(&id, &request).await {
                Ok(Some(response)) => {
                    let _ = tx.send(response);
                }
                Ok(None) => debug!(
                    "Agent {} closed connection without replying",
                    client.agent_id
                ),
                Err(e) => {
                    warn!("sync_dns to agent {} failed: {}", client.agent_id, e);
                    let _ = tx.send(AgentResponse::failure(e.to_string()));
                }
            }
            client.inflight.lock().await.remove(&id);
        });
        registry.insert(request_id.clone(), handle.abort_handle());

        Ok(PendingRequest {
            request_id,
            response: rx,
        })
    }

    async fn cancel_sync_dns(&self, request_id: &RequestId) -> Result<(), AgentError> {
        if let Some(handle) = self.inflight.lock().await.remove(request_id) {
            handle.abort();
        }
        if self.addr.is_none() {
            return Err(AgentError::UnknownAgent(self.agent_id.clone()));
        }

        let request = AgentRequest::CancelTask {
            request_id: request_id.clone(),
        };
        let client = self.clone();
        tokio::spawn(async move {
            if let Err(e) = client.send(&RequestId::generate(), &request).await {
                debug!("cancel_task to agent {} failed: {}", client.agent_id, e);
            }
        });
        Ok(())
    }

    async fn delete_arp_entries(&self, ips: &[String]) -> Result<(), AgentError> {
        let request = AgentRequest::DeleteArpEntries { ips: ips.to_vec() };
        match self.request(&RequestId::generate(), &request).await? {
            Some(response) => match response.exception {
                Some(e) => Err(AgentError::Rejected {
                    agent: self.agent_id.clone(),
                    method: request.method(),
                    reason: e.message,
                }),
                None => Ok(()),
            },
            None => Err(AgentError::Rejected {
                agent: self.agent_id.clone(),
                method: request.method(),
                reason: "connection closed without reply".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, SocketAddr) {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = l.local_addr().unwrap();
        (l, addr)
    }

    fn channel(agent: &str, addr: SocketAddr) -> TcpAgentChannel {
        let mut endpoints = HashMap::new();
        endpoints.insert(AgentId::from(agent), addr);
        TcpAgentChannel::new(endpoints, Some("secret".into()), Duration::from_secs(1))
    }

    /// Accepts one connection, returns the received envelope and answers
    /// with `reply` if given.
    async fn serve_once(l: TcpListener, reply: Option<&'static str>) -> serde_json::Value {
        let (stream, _) = l.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        if let Some(reply) = reply {
            write.write_all(reply.as_bytes()).await.unwrap();
            write.write_all(b"\n").await.unwrap();
        }
        serde_json::from_str(&line).unwrap()
    }

    #[test]
    fn test_sign_is_stable() {
        let id = RequestId("r-1".into());
        assert_eq!(sign("k", &id, "sync_dns"), sign("k", &id, "sync_dns"));
        assert_ne!(sign("k", &id, "sync_dns"), sign("other", &id, "sync_dns"));
        assert_eq!(sign("k", &id, "sync_dns").len(), 64);
    }

    #[tokio::test]
    async fn test_sync_dns_round_trip() {
        let (l, addr) = listener().await;
        let server = tokio::spawn(serve_once(l, Some(r#"{"value":"synced"}"#)));

        let chan = channel("agent-1", addr);
        let client = chan.client(None, &AgentId::from("agent-1"));
        let pending = client.sync_dns("blob", "abc", 3).await.unwrap();

        let response = pending.response.await.unwrap();
        assert_eq!(response.value, "synced");

        let envelope = server.await.unwrap();
        assert_eq!(envelope["method"], "sync_dns");
        assert_eq!(envelope["arguments"]["blobstore_id"], "blob");
        assert_eq!(envelope["request_id"], pending.request_id.0.as_str());
        assert_eq!(
            envelope["signature"],
            sign("secret", &pending.request_id, "sync_dns").as_str()
        );
    }

    #[tokio::test]
    async fn test_cancel_drops_pending_reply() {
        let (l, addr) = listener().await;
        let chan = channel("agent-1", addr);
        let client = chan.client(
            Some(&Credentials {
                sign_key: "vm-key".into(),
            }),
            &AgentId::from("agent-1"),
        );

        let (received_tx, received_rx) = oneshot::channel();
        let accept = tokio::spawn(async move {
            // First connection is the sync_dns request, never answered.
            let (held, _) = l.accept().await.unwrap();
            let mut lines = BufReader::new(held).lines();
            lines.next_line().await.unwrap().unwrap();
            received_tx.send(()).unwrap();
            let cancel = serve_once(l, None).await;
            drop(lines);
            cancel
        });

        let pending = client.sync_dns("blob", "abc", 3).await.unwrap();
        assert_eq!(chan.inflight_count().await, 1);
        received_rx.await.unwrap();

        client.cancel_sync_dns(&pending.request_id).await.unwrap();
        assert_eq!(chan.inflight_count().await, 0);
        assert!(pending.response.await.is_err());

        let cancel = accept.await.unwrap();
        assert_eq!(cancel["method"], "cancel_task");
        assert_eq!(cancel["arguments"]["request_id"], pending.request_id.0.as_str());
    }

    #[tokio::test]
    async fn test_delete_arp_entries_reports_exception() {
        let (l, addr) = listener().await;
        let server = tokio::spawn(serve_once(
            l,
            Some(r#"{"exception":{"message":"arp failed"}}"#),
        ));
        let chan = channel("agent-1", addr);
        let client = chan.client(None, &AgentId::from("agent-1"));

        let err = client
            .delete_arp_entries(&["10.0.0.1".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Rejected { reason, .. } if reason == "arp failed"));

        let envelope = server.await.unwrap();
        assert_eq!(envelope["arguments"]["ips"][0], "10.0.0.1");
    }

    #[tokio::test]
    async fn test_unknown_agent() {
        let chan = TcpAgentChannel::new(HashMap::new(), None, Duration::from_secs(1));
        let client = chan.client(None, &AgentId::from("ghost"));
        let err = client.sync_dns("blob", "abc", 1).await.unwrap_err();
        assert!(matches!(err, AgentError::UnknownAgent(id) if id.as_str() == "ghost"));
    }

    #[tokio::test]
    async fn test_sync_dns_returns_before_connecting() {
        // Nothing listens on this port any more.
        let (l, addr) = listener().await;
        drop(l);

        let chan = channel("agent-1", addr);
        let client = chan.client(None, &AgentId::from("agent-1"));
        let pending = client.sync_dns("blob", "abc", 3).await.unwrap();

        let response = pending.response.await.unwrap();
        assert_ne!(response.value, "synced");
        assert!(response.exception.is_some());
    }

    #[tokio::test]
    async fn test_malformed_reply_becomes_failure() {
        let (l, addr) = listener().await;
        let server = tokio::spawn(serve_once(l, Some("agent exploded")));

        let chan = channel("agent-1", addr);
        let client = chan.client(None, &AgentId::from("agent-1"));
        let pending = client.sync_dns("blob", "abc", 3).await.unwrap();

        let response = pending.response.await.unwrap();
        let exception = response.exception.unwrap();
        assert!(exception.message.contains("agent exploded"));
        server.await.unwrap();
    }
}
