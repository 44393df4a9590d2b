//! # config
//!
//! why: one explicit description of a node, loaded from yaml or assembled from cli flags
//! relations: consumed by node.rs to build storage, raft and the network; main.rs builds it
//! what: NodeConfig, MemberConfig, raft/storage sections, loaders, validation, --initial-cluster parsing

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use kvraft_core::{NodeId, RaftConfig};
use kvraft_storage::{EngineOptions, FsyncPolicy};
use serde::{Deserialize, Serialize};

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's id; must appear in `members`.
    pub id: NodeId,

    /// Every member of the cluster, this node included.
    pub members: Vec<MemberConfig>,

    /// Address to accept peer connections on. Defaults to this member's `peer_addr`.
    #[serde(default)]
    pub peer_listen: Option<String>,

    /// Address to accept client connections on. Defaults to this member's `client_addr`.
    #[serde(default)]
    pub client_listen: Option<String>,

    /// Defaults to a per-node directory under the system temp dir.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Shared secret every peer presents in its handshake.
    #[serde(default = "default_cluster_token")]
    pub cluster_token: String,

    #[serde(default)]
    pub raft: RaftSection,

    #[serde(default)]
    pub storage: StorageSection,

    /// Upper bound on every client call, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Upper bound on peer connects and writes, in milliseconds.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberConfig {
    pub id: NodeId,
    /// host:port peers dial for raft traffic
    pub peer_addr: String,
    /// host:port clients dial; lets followers point at the leader
    #[serde(default)]
    pub client_addr: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftSection {
    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,

    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Most entries carried by one AppendEntries.
    #[serde(default = "default_max_entries_per_message")]
    pub max_entries_per_message: usize,

    /// A follower further behind than this gets a snapshot instead of a log replay.
    #[serde(default = "default_snapshot_catch_up_threshold")]
    pub snapshot_catch_up_threshold: u64,

    /// Applied entries kept in the log before it is compacted into a snapshot; 0 disables compaction.
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: u64,
}

impl Default for RaftSection {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: default_election_timeout_min_ms(),
            election_timeout_max_ms: default_election_timeout_max_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            max_entries_per_message: default_max_entries_per_message(),
            snapshot_catch_up_threshold: default_snapshot_catch_up_threshold(),
            snapshot_threshold: default_snapshot_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    /// Fsync policy: "always", "batch", "none".
    #[serde(default)]
    pub fsync: FsyncPolicy,

    /// Revisions of key history kept readable; 0 keeps everything.
    #[serde(default = "default_history_revisions")]
    pub history_revisions: u64,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            fsync: FsyncPolicy::default(),
            history_revisions: default_history_revisions(),
        }
    }
}

// --- Defaults ---

fn default_cluster_token() -> String {
    "token-kvraft".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_rpc_timeout_ms() -> u64 {
    1000
}

fn default_election_timeout_min_ms() -> u64 {
    RaftConfig::default().election_timeout_min
}

fn default_election_timeout_max_ms() -> u64 {
    RaftConfig::default().election_timeout_max
}

fn default_heartbeat_interval_ms() -> u64 {
    RaftConfig::default().heartbeat_interval
}

fn default_max_entries_per_message() -> usize {
    RaftConfig::default().max_entries_per_message
}

fn default_snapshot_catch_up_threshold() -> u64 {
    RaftConfig::default().snapshot_catch_up_threshold
}

fn default_snapshot_threshold() -> u64 {
    1000
}

fn default_history_revisions() -> u64 {
    EngineOptions::default().history_revisions
}

/// Three local members with peer ports 3021..3023
pub const DEFAULT_INITIAL_CLUSTER: &str =
    "node0=http://127.0.0.1:3021,node1=http://127.0.0.1:3022,node2=http://127.0.0.1:3023";

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn check_addr(field: &str, addr: &str) -> Result<(), ConfigError> {
    let valid = addr
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
    if valid {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{field}: {addr:?} is not a host:port address"
        )))
    }
}

impl NodeConfig {
    /// A config for `id` in `members` with every other setting at its default
    pub fn new(id: NodeId, members: Vec<MemberConfig>) -> Self {
        Self {
            id,
            members,
            peer_listen: None,
            client_listen: None,
            data_dir: None,
            cluster_token: default_cluster_token(),
            raft: RaftSection::default(),
            storage: StorageSection::default(),
            request_timeout_ms: default_request_timeout_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
        }
    }

    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.members.is_empty() {
            return Err(ConfigError::Invalid("members must not be empty".into()));
        }
        let mut seen = HashSet::new();
        for member in &self.members {
            if !seen.insert(member.id) {
                return Err(ConfigError::Invalid(format!(
                    "member id {} appears more than once",
                    member.id
                )));
            }
            check_addr("peer_addr", &member.peer_addr)?;
            if let Some(addr) = &member.client_addr {
                check_addr("client_addr", addr)?;
            }
        }
        if self.member(self.id).is_none() {
            return Err(ConfigError::Invalid(format!(
                "node id {} is not a cluster member",
                self.id
            )));
        }
        if let Some(addr) = &self.peer_listen {
            check_addr("peer_listen", addr)?;
        }
        if let Some(addr) = &self.client_listen {
            check_addr("client_listen", addr)?;
        }

        let raft = &self.raft;
        if raft.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid("raft.heartbeat_interval_ms must be > 0".into()));
        }
        if raft.heartbeat_interval_ms >= raft.election_timeout_min_ms {
            return Err(ConfigError::Invalid(format!(
                "raft.heartbeat_interval_ms ({}) must be < raft.election_timeout_min_ms ({})",
                raft.heartbeat_interval_ms, raft.election_timeout_min_ms
            )));
        }
        if raft.election_timeout_min_ms >= raft.election_timeout_max_ms {
            return Err(ConfigError::Invalid(format!(
                "raft.election_timeout_min_ms ({}) must be < raft.election_timeout_max_ms ({})",
                raft.election_timeout_min_ms, raft.election_timeout_max_ms
            )));
        }
        if raft.max_entries_per_message == 0 {
            return Err(ConfigError::Invalid(
                "raft.max_entries_per_message must be > 0".into(),
            ));
        }
        if self.request_timeout_ms == 0 || self.rpc_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be > 0".into()));
        }
        Ok(())
    }

    pub fn member(&self, id: NodeId) -> Option<&MemberConfig> {
        self.members.iter().find(|m| m.id == id)
    }

    pub fn member_ids(&self) -> Vec<NodeId> {
        self.members.iter().map(|m| m.id).collect()
    }

    /// Peer addresses of every other member
    pub fn peers(&self) -> HashMap<NodeId, String> {
        self.members
            .iter()
            .filter(|m| m.id != self.id)
            .map(|m| (m.id, m.peer_addr.clone()))
            .collect()
    }

    /// Client addresses known up front, this node included
    pub fn client_addrs(&self) -> HashMap<NodeId, String> {
        let mut addrs: HashMap<NodeId, String> = self
            .members
            .iter()
            .filter_map(|m| m.client_addr.clone().map(|a| (m.id, a)))
            .collect();
        if let Some(addr) = self.client_listen_addr() {
            addrs.insert(self.id, addr);
        }
        addrs
    }

    pub fn peer_listen_addr(&self) -> Option<String> {
        self.peer_listen
            .clone()
            .or_else(|| self.member(self.id).map(|m| m.peer_addr.clone()))
    }

    pub fn client_listen_addr(&self) -> Option<String> {
        self.client_listen
            .clone()
            .or_else(|| self.member(self.id).and_then(|m| m.client_addr.clone()))
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(format!("kvraft-node{}", self.id)))
    }

    pub fn raft_config(&self) -> RaftConfig {
        RaftConfig {
            election_timeout_min: self.raft.election_timeout_min_ms,
            election_timeout_max: self.raft.election_timeout_max_ms,
            heartbeat_interval: self.raft.heartbeat_interval_ms,
            max_entries_per_message: self.raft.max_entries_per_message,
            snapshot_catch_up_threshold: self.raft.snapshot_catch_up_threshold,
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            fsync: self.storage.fsync,
            history_revisions: self.storage.history_revisions,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

/// Load a `NodeConfig` from a YAML file path.
pub fn load_from_file(path: &Path) -> Result<NodeConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Load a `NodeConfig` from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<NodeConfig, ConfigError> {
    let config: NodeConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}

fn strip_scheme(url: &str) -> &str {
    let url = url.trim();
    let url = ["http://", "https://", "tcp://"]
        .iter()
        .find_map(|scheme| url.strip_prefix(scheme))
        .unwrap_or(url);
    url.trim_end_matches('/')
}

fn parse_member_id(name: &str) -> Result<NodeId, ConfigError> {
    let name = name.trim();
    let digits = &name[name.trim_end_matches(|c: char| c.is_ascii_digit()).len()..];
    digits
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("member name {name:?} does not end in an id")))
}

/// Parse `node0=http://localhost:3021,node1=...` into members.
///
/// Names contribute their trailing digits as the id (`node0`, `0`); entries
/// without a name take their position as id. Schemes are optional.
pub fn parse_initial_cluster(list: &str) -> Result<Vec<MemberConfig>, ConfigError> {
    let members: Vec<MemberConfig> = list
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .enumerate()
        .map(|(position, part)| {
            let (id, url) = match part.split_once('=') {
                Some((name, url)) => (parse_member_id(name)?, url),
                None => (position as NodeId, part),
            };
            let peer_addr = strip_scheme(url).to_string();
            check_addr("initial-cluster", &peer_addr)?;
            Ok(MemberConfig {
                id,
                peer_addr,
                client_addr: None,
            })
        })
        .collect::<Result<_, ConfigError>>()?;
    if members.is_empty() {
        return Err(ConfigError::Invalid("initial cluster is empty".into()));
    }
    Ok(members)
}

/// Listen address from a command-line value: `3000` and `:3000` mean
/// `127.0.0.1:3000`, anything else is kept as `host:port`.
pub fn listen_addr(arg: &str) -> String {
    let arg = strip_scheme(arg.trim());
    let port = arg.strip_prefix(':').unwrap_or(arg);
    match port.parse::<u16>() {
        Ok(port) => format!("127.0.0.1:{port}"),
        Err(_) => arg.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_members() -> Vec<MemberConfig> {
        parse_initial_cluster(DEFAULT_INITIAL_CLUSTER).unwrap()
    }

    #[test]
    fn bare_ports_listen_on_loopback() {
        assert_eq!(listen_addr("3000"), "127.0.0.1:3000");
        assert_eq!(listen_addr(":3001"), "127.0.0.1:3001");
        assert_eq!(listen_addr("0.0.0.0:3002"), "0.0.0.0:3002");
        assert_eq!(listen_addr("http://localhost:3003"), "localhost:3003");

        let mut config = NodeConfig::new(0, three_members());
        config.client_listen = Some(listen_addr("3000"));
        config.peer_listen = Some(listen_addr("3021"));
        config.validate().unwrap();
    }

    #[test]
    fn parse_minimal_config() {
        let yaml = r#"
id: 1
members:
  - id: 0
    peer_addr: "127.0.0.1:3021"
  - id: 1
    peer_addr: "127.0.0.1:3022"
    client_addr: "127.0.0.1:3012"
  - id: 2
    peer_addr: "127.0.0.1:3023"
"#;
        let config = load_from_str(yaml).unwrap();
        assert_eq!(config.id, 1);
        assert_eq!(config.members.len(), 3);
        assert_eq!(config.cluster_token, "token-kvraft");
        assert_eq!(config.raft.heartbeat_interval_ms, 50);
        assert_eq!(config.storage.fsync, FsyncPolicy::Batch);
        assert_eq!(config.peer_listen_addr().as_deref(), Some("127.0.0.1:3022"));
        assert_eq!(config.client_listen_addr().as_deref(), Some("127.0.0.1:3012"));
        assert_eq!(config.peers().len(), 2);
    }

    #[test]
    fn parse_full_config() {
        let yaml = r#"
id: 0
members:
  - id: 0
    peer_addr: "localhost:4000"
peer_listen: "0.0.0.0:4000"
client_listen: "0.0.0.0:5000"
data_dir: "/var/lib/kvraft"
cluster_token: "secret"
raft:
  election_timeout_min_ms: 500
  election_timeout_max_ms: 900
  heartbeat_interval_ms: 100
  snapshot_threshold: 10
storage:
  fsync: always
  history_revisions: 50
request_timeout_ms: 2000
"#;
        let config = load_from_str(yaml).unwrap();
        assert_eq!(config.data_dir(), PathBuf::from("/var/lib/kvraft"));
        assert_eq!(config.storage.fsync, FsyncPolicy::Always);
        assert_eq!(config.raft_config().election_timeout_min, 500);
        assert_eq!(config.raft.max_entries_per_message, 64);
        assert_eq!(config.engine_options().history_revisions, 50);
        assert_eq!(config.request_timeout(), Duration::from_secs(2));
        assert_eq!(config.rpc_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn initial_cluster_in_sample_syntax() {
        let members = three_members();
        assert_eq!(members.len(), 3);
        assert_eq!(members[0].id, 0);
        assert_eq!(members[2].id, 2);
        assert_eq!(members[1].peer_addr, "127.0.0.1:3022");
    }

    #[test]
    fn initial_cluster_bare_forms() {
        let members = parse_initial_cluster("localhost:7001, localhost:7002").unwrap();
        assert_eq!(members[0].id, 0);
        assert_eq!(members[1].id, 1);
        assert_eq!(members[1].peer_addr, "localhost:7002");

        let members = parse_initial_cluster("7=tcp://10.0.0.7:9000/").unwrap();
        assert_eq!(members[0].id, 7);
        assert_eq!(members[0].peer_addr, "10.0.0.7:9000");
    }

    #[test]
    fn initial_cluster_rejects_garbage() {
        assert!(parse_initial_cluster("").is_err());
        assert!(parse_initial_cluster("nodeX=http://localhost:1").is_err());
        assert!(parse_initial_cluster("node0=http://localhost").is_err());
    }

    #[test]
    fn validate_rejects_unknown_self() {
        let config = NodeConfig::new(9, three_members());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let mut members = three_members();
        members[2].id = 0;
        assert!(NodeConfig::new(0, members).validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_timeouts() {
        let mut config = NodeConfig::new(0, three_members());
        assert!(config.validate().is_ok());

        config.raft.heartbeat_interval_ms = config.raft.election_timeout_min_ms;
        assert!(config.validate().is_err());

        config.raft.heartbeat_interval_ms = 10;
        config.raft.election_timeout_max_ms = config.raft.election_timeout_min_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_data_dir_is_per_node() {
        let config = NodeConfig::new(2, three_members());
        assert!(config.data_dir().ends_with("kvraft-node2"));
    }

    #[test]
    fn invalid_yaml_is_reported() {
        assert!(matches!(load_from_str("id: [oops"), Err(ConfigError::Yaml(_))));
    }
}
