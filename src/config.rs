//! Node configuration: local consensus parameters and the node config file.

use crate::base::{NetworkId, Node, NodeAddress, PrivateKey, PublicKey, Threshold};
use crate::error::ErrorKind;
use crate::network::ConnInfo;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("invalid environment variable {name}: {reason}")]
    Env { name: &'static str, reason: String },

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Base(#[from] crate::base::BaseError),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConfigError::Io(_) => ErrorKind::NotFound,
            _ => ErrorKind::Invalid,
        }
    }
}

/// Durations are written as milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Tunables of one node's consensus loop.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalParams {
    pub threshold: Threshold,
    #[serde(with = "millis")]
    pub interval_broadcast_ballot: Duration,
    #[serde(with = "millis")]
    pub wait_preparing_init_ballot: Duration,
    #[serde(with = "millis")]
    pub timeout_request: Duration,
    #[serde(with = "millis")]
    pub sync_source_checker_interval: Duration,
    #[serde(with = "millis")]
    pub valid_proposal_operation_expire: Duration,
    #[serde(with = "millis")]
    pub valid_proposal_suffrage_operations_expire: Duration,
    #[serde(with = "millis")]
    pub ballot_stuck_wait: Duration,
    #[serde(with = "millis")]
    pub ballot_stuck_resolve_after: Duration,
    pub max_message_size: u64,
    pub same_member_limit: u64,
    /// How long before its voteproof finished a ballot may be signed.
    #[serde(with = "millis")]
    pub ballot_valid_window: Duration,
    #[serde(with = "millis")]
    pub sync_source_renew_timeout: Duration,
    pub sync_retry_limit: u64,
    #[serde(with = "millis")]
    pub sync_retry_interval: Duration,
    pub proposal_retry_limit: u64,
    #[serde(with = "millis")]
    pub proposal_retry_interval: Duration,
    pub process_concurrency: usize,
    pub ballotbox_voteproof_buffer: usize,
    pub inbound_ballot_queue: usize,
}

impl Default for LocalParams {
    fn default() -> Self {
        LocalParams {
            threshold: Threshold::default(),
            interval_broadcast_ballot: Duration::from_secs(3),
            wait_preparing_init_ballot: Duration::from_secs(5),
            timeout_request: Duration::from_secs(3),
            sync_source_checker_interval: Duration::from_secs(30),
            valid_proposal_operation_expire: Duration::from_secs(24 * 60 * 60),
            valid_proposal_suffrage_operations_expire: Duration::from_secs(2 * 60 * 60),
            ballot_stuck_wait: Duration::from_secs(33),
            ballot_stuck_resolve_after: Duration::from_secs(66),
            max_message_size: 1 << 18,
            same_member_limit: 3,
            ballot_valid_window: Duration::from_secs(30),
            sync_source_renew_timeout: Duration::from_secs(10),
            sync_retry_limit: 15,
            sync_retry_interval: Duration::from_secs(1),
            proposal_retry_limit: 15,
            proposal_retry_interval: Duration::from_millis(300),
            process_concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            ballotbox_voteproof_buffer: 33,
            inbound_ballot_queue: 1024,
        }
    }
}

impl LocalParams {
    pub fn is_valid(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| Err(ConfigError::Invalid(reason.to_string()));

        let intervals = [
            ("interval_broadcast_ballot", self.interval_broadcast_ballot),
            ("wait_preparing_init_ballot", self.wait_preparing_init_ballot),
            ("timeout_request", self.timeout_request),
            ("sync_source_checker_interval", self.sync_source_checker_interval),
            ("valid_proposal_operation_expire", self.valid_proposal_operation_expire),
            (
                "valid_proposal_suffrage_operations_expire",
                self.valid_proposal_suffrage_operations_expire,
            ),
            ("ballot_stuck_wait", self.ballot_stuck_wait),
            ("ballot_stuck_resolve_after", self.ballot_stuck_resolve_after),
            ("sync_source_renew_timeout", self.sync_source_renew_timeout),
            ("sync_retry_interval", self.sync_retry_interval),
            ("proposal_retry_interval", self.proposal_retry_interval),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::Invalid(format!("{name} must be positive")));
        }

        Threshold::new(self.threshold.percent())?;

        if self.ballot_stuck_resolve_after <= self.ballot_stuck_wait {
            return invalid("ballot_stuck_resolve_after must be longer than ballot_stuck_wait");
        }
        if self.max_message_size == 0 {
            return invalid("max_message_size must be positive");
        }
        if self.process_concurrency == 0 {
            return invalid("process_concurrency must be positive");
        }
        if self.ballotbox_voteproof_buffer == 0 || self.inbound_ballot_queue == 0 {
            return invalid("queue sizes must be positive");
        }
        Ok(())
    }
}

/// A known node and where to reach it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub address: NodeAddress,
    pub publickey: PublicKey,
    pub url: String,
}

impl PeerConfig {
    pub fn node(&self) -> Node {
        Node::new(self.address.clone(), self.publickey)
    }

    pub fn conn_info(&self) -> ConnInfo {
        ConnInfo {
            address: self.address.clone(),
            publickey: self.publickey,
            url: self.url.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database: PathBuf,
    pub blocks: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            database: PathBuf::from("isaac.db"),
            blocks: PathBuf::from("blocks"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub network_id: NetworkId,
    pub address: NodeAddress,
    pub privatekey_seed: String,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub url: String,
    /// Nodes of the genesis suffrage; block 0 is generated when the local
    /// node is one of them and the database is empty.
    #[serde(default)]
    pub genesis: Vec<PeerConfig>,
    /// Suffrage members ballots are broadcast to.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub sync_sources: Vec<PeerConfig>,
    #[serde(default)]
    pub params: LocalParams,
}

fn default_bind() -> String {
    "127.0.0.1:4320".to_string()
}

impl NodeConfig {
    /// Reads `path` then applies `ISAAC_*` environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let raw = std::fs::read_to_string(path)?;
        let mut config: NodeConfig = serde_json::from_str(&raw)?;
        config.apply_env(|name| std::env::var(name).ok())?;
        config.is_valid()?;
        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = var("ISAAC_NETWORK_ID") {
            self.network_id = NetworkId::new(v)?;
        }
        if let Some(v) = var("ISAAC_ADDRESS") {
            self.address = NodeAddress::new(v)?;
        }
        if let Some(v) = var("ISAAC_PRIVATEKEY_SEED") {
            self.privatekey_seed = v;
        }
        if let Some(v) = var("ISAAC_DATABASE") {
            self.storage.database = PathBuf::from(v);
        }
        if let Some(v) = var("ISAAC_BLOCKS") {
            self.storage.blocks = PathBuf::from(v);
        }
        if let Some(v) = var("ISAAC_BIND") {
            self.bind = v;
        }
        if let Some(v) = var("ISAAC_URL") {
            self.url = v;
        }
        if let Some(v) = var("ISAAC_THRESHOLD") {
            let percent: f64 = v.parse().map_err(|e: std::num::ParseFloatError| ConfigError::Env {
                name: "ISAAC_THRESHOLD",
                reason: e.to_string(),
            })?;
            self.params.threshold = Threshold::new(percent)?;
        }
        Ok(())
    }

    pub fn privatekey(&self) -> Result<PrivateKey, ConfigError> {
        Ok(PrivateKey::from_seed(self.privatekey_seed.as_bytes())?)
    }

    pub fn is_valid(&self) -> Result<(), ConfigError> {
        self.params.is_valid()?;
        self.privatekey()?;
        if self.bind.is_empty() {
            return Err(ConfigError::Invalid("empty bind address".to_string()));
        }
        Ok(())
    }

    /// Public URL peers reach this node at.
    pub fn public_url(&self) -> String {
        if self.url.is_empty() {
            format!("http://{}", self.bind)
        } else {
            self.url.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    const SEED: &str = "0123456789abcdef0123456789abcdef0123456789";

    #[test]
    fn defaults_are_valid() {
        let params = LocalParams::default();
        assert!(params.is_valid().is_ok());
        assert_eq!(params.ballot_stuck_wait, Duration::from_secs(33));
        assert_eq!(params.max_message_size, 262_144);
        assert!(params.process_concurrency >= 1);
    }

    #[test]
    fn rejects_bad_params() {
        let mut params = LocalParams::default();
        params.ballot_stuck_resolve_after = params.ballot_stuck_wait;
        assert!(params.is_valid().is_err());

        let mut params = LocalParams::default();
        params.interval_broadcast_ballot = Duration::ZERO;
        assert!(params.is_valid().is_err());

        let mut params = LocalParams::default();
        params.max_message_size = 0;
        assert!(params.is_valid().is_err());
    }

    #[test]
    fn loads_file_with_partial_params() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "network_id": "n",
                "address": "node0",
                "privatekey_seed": "{SEED}",
                "params": {{ "threshold": 100, "interval_broadcast_ballot": 500 }}
            }}"#
        )
        .unwrap();

        let config = NodeConfig::load(file.path()).unwrap();
        assert_eq!(config.params.threshold, Threshold::MAX);
        assert_eq!(config.params.interval_broadcast_ballot, Duration::from_millis(500));
        assert_eq!(config.params.timeout_request, Duration::from_secs(3));
        assert_eq!(config.bind, "127.0.0.1:4320");
        assert_eq!(config.public_url(), "http://127.0.0.1:4320");
    }

    #[test]
    fn env_overrides() {
        let mut config: NodeConfig = serde_json::from_str(&format!(
            r#"{{"network_id": "n", "address": "node0", "privatekey_seed": "{SEED}"}}"#
        ))
        .unwrap();

        let vars: HashMap<&str, &str> = [("ISAAC_ADDRESS", "node9"), ("ISAAC_THRESHOLD", "80")].into();
        config.apply_env(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.address.as_str(), "node9");
        assert_eq!(config.params.threshold.percent(), 80.0);

        let bad: HashMap<&str, &str> = [("ISAAC_THRESHOLD", "lots")].into();
        assert!(config.apply_env(|k| bad.get(k).map(|v| v.to_string())).is_err());
    }

    #[test]
    fn peer_maps_to_node_and_conn() {
        let publickey = PrivateKey::from_seed(SEED.as_bytes()).unwrap().public_key();
        let peer = PeerConfig {
            address: NodeAddress::new("node1").unwrap(),
            publickey,
            url: "http://127.0.0.1:4321".to_string(),
        };

        let node = peer.node();
        assert_eq!(node.address, peer.address);
        let conn = peer.conn_info();
        assert_eq!(conn.url, peer.url);
        assert_eq!(conn.publickey.to_string(), publickey.to_string());
    }
}
