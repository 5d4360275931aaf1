//! Data structures shared by the reservation planner and the agent
//! broadcaster.
//!
//! Instances and networks are owned by the wider director; this crate
//! only reads the handful of fields it needs from them.  The request and
//! response types are serialised using [`serde`](https://serde.rs/) and
//! exchanged with agents one JSON object per line.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of the agent process running inside a VM.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier returned when an asynchronous agent request is issued.
/// Used later to cancel the request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-VM credentials used to sign messages sent to its agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credentials {
    pub sign_key: String,
}

/// The VM currently backing an instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActiveVm {
    pub cid: String,
}

/// A compute instance as far as this crate is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instance {
    /// Human readable name, e.g. `router/0`.
    pub name: String,
    pub agent_id: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_vm: Option<ActiveVm>,
    #[serde(default)]
    pub compilation: bool,
}

impl Instance {
    pub fn vm_cid(&self) -> Option<&str> {
        self.active_vm.as_ref().map(|vm| vm.cid.as_str())
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.agent_id)
    }
}

/// A network an instance is attached to.  Only the name is used, for
/// diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
}

impl Network {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A command sent to an agent.
///
/// Serialised as `{"method": "...", "arguments": {...}}` inside the
/// request envelope built by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "arguments", rename_all = "snake_case")]
pub enum AgentRequest {
    /// Fetch the DNS records blob and apply it.
    SyncDns {
        blobstore_id: String,
        sha1: String,
        version: u64,
    },
    /// Drop a previously issued request; the agent sends no reply.
    CancelTask { request_id: RequestId },
    /// Remove stale ARP cache entries for the given addresses.
    DeleteArpEntries { ips: Vec<String> },
}

impl AgentRequest {
    pub fn method(&self) -> &'static str {
        match self {
            AgentRequest::SyncDns { .. } => "sync_dns",
            AgentRequest::CancelTask { .. } => "cancel_task",
            AgentRequest::DeleteArpEntries { .. } => "delete_arp_entries",
        }
    }
}

/// Reply payload sent back by an agent.  Agents may add other keys; only
/// `value` and `exception` are inspected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<AgentException>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentException {
    pub message: String,
}

impl AgentResponse {
    pub fn new(value: impl Into<serde_json::Value>) -> Self {
        Self {
            value: value.into(),
            exception: None,
        }
    }

    /// Reply standing in for one the agent never produced in a usable form,
    /// e.g. the connection failed or the line was not JSON.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            value: serde_json::Value::Null,
            exception: Some(AgentException {
                message: message.into(),
            }),
        }
    }
}

impl fmt::Display for AgentResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.exception {
            Some(e) => write!(f, "{{exception={}}}", e.message),
            None => write!(f, "{{value={}}}", self.value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_request_wire_shape() {
        let req = AgentRequest::SyncDns {
            blobstore_id: "blob-1".into(),
            sha1: "abc".into(),
            version: 7,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["method"], "sync_dns");
        assert_eq!(json["arguments"]["version"], 7);
        assert_eq!(req.method(), "sync_dns");
    }

    #[test]
    fn test_response_ignores_extra_keys() {
        let resp: AgentResponse =
            serde_json::from_str(r#"{"value": "synced", "agent_task_id": "1"}"#).unwrap();
        assert_eq!(resp.value, "synced");
        assert_eq!(resp.exception, None);
        assert_eq!(resp.to_string(), r#"{value="synced"}"#);
    }

    #[test]
    fn test_failure_is_not_a_value() {
        let resp = AgentResponse::failure("connection refused");
        assert_eq!(resp.value, serde_json::Value::Null);
        assert_eq!(resp.to_string(), "{exception=connection refused}");
    }

    #[test]
    fn test_instance_defaults() {
        let inst: Instance =
            serde_json::from_str(r#"{"name": "router/0", "agent_id": "agent-1"}"#).unwrap();
        assert!(!inst.compilation);
        assert_eq!(inst.vm_cid(), None);
        assert_eq!(inst.to_string(), "router/0 (agent-1)");
    }
}
