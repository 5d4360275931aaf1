use std::path::PathBuf;

use crate::reservation::ReservationType;
use crate::types::AgentId;

#[derive(Debug, thiserror::Error)]
pub enum IpError {
    #[error("Invalid IP address: '{0}'")]
    Invalid(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ReservationError {
    #[error("IP '{ip}' on network '{network}' does not belong to {declared} pool")]
    WrongType {
        ip: String,
        network: String,
        declared: ReservationType,
    },
    #[error(transparent)]
    Ip(#[from] IpError),
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("No endpoint configured for agent {0}")]
    UnknownAgent(AgentId),
    #[error("Failed to connect to agent {agent}: {source}")]
    Connect {
        agent: AgentId,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error talking to agent {agent}: {source}")]
    Io {
        agent: AgentId,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed message for agent {agent}: {source}")]
    Codec {
        agent: AgentId,
        #[source]
        source: serde_json::Error,
    },
    #[error("Agent {agent} rejected {method}: {reason}")]
    Rejected {
        agent: AgentId,
        method: &'static str,
        reason: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to access DNS version store {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Corrupt DNS version store {path}: {source}")]
    Codec {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
