use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::broadcast::DEFAULT_BROADCAST_TIMEOUT;
use crate::types::AgentId;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub broadcast_timeout_secs: u64,
    pub inventory_path: PathBuf,
    pub dns_versions_path: PathBuf,
    /// Agent id → address the agent listens on.
    pub agent_endpoints: HashMap<String, SocketAddr>,
    pub connect_timeout_ms: u64,
    /// Used to sign requests for instances without their own credentials.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_secret: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broadcast_timeout_secs: DEFAULT_BROADCAST_TIMEOUT.as_secs(),
            inventory_path: "inventory.json".into(),
            dns_versions_path: "dns_versions.json".into(),
            agent_endpoints: HashMap::new(),
            connect_timeout_ms: 2000,
            agent_secret: None,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Config::default()))
                .merge(Toml::file("fleetsync.toml"))
                .merge(Json::file("fleetsync.json"))
                .merge(Env::prefixed("FLEETSYNC_")),
        )
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Support Docker-style secrets
        if let Ok(secret_file) = std::env::var("FLEETSYNC_AGENT_SECRET_FILE") {
            config.agent_secret = Some(std::fs::read_to_string(secret_file)?.trim().to_string());
        }

        Ok(config)
    }

    pub fn broadcast_timeout(&self) -> Duration {
        Duration::from_secs(self.broadcast_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn endpoints(&self) -> HashMap<AgentId, SocketAddr> {
        self.agent_endpoints
            .iter()
            .map(|(id, addr)| (AgentId(id.clone()), *addr))
            .collect()
    }
}
