//! Server configuration
//!
//! Loaded from a TOML file and then overridden by `CHRONICLE_*` environment
//! variables. Priority: environment > file > defaults.

use chronicle_core::{MemberInfo, NodeState, ReplicationConfig};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read {path}: {source}")]
    Read {
        /// File that was read
        path: String,
        /// Underlying error
        source: std::io::Error,
    },

    /// File is not valid TOML for this schema
    #[error("Failed to parse {path}: {source}")]
    Parse {
        /// File that was parsed
        path: String,
        /// Underlying error
        source: toml::de::Error,
    },

    /// Environment override could not be parsed
    #[error("Invalid value for {name}: {value}")]
    Env {
        /// Variable name
        name: String,
        /// Rejected value
        value: String,
    },

    /// Values parse but do not make a runnable node
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Role the node starts in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    /// Owns the log and serves replicas
    #[default]
    Leader,
    /// Voting replica
    Replica,
    /// Replica that is never promoted to follower
    ReadOnlyReplica,
}

impl NodeRole {
    /// State the node is put in once its services are up
    pub fn initial_state(self) -> NodeState {
        match self {
            Self::Leader => NodeState::Leader,
            Self::Replica => NodeState::PreReplica,
            Self::ReadOnlyReplica => NodeState::PreReadOnlyReplica,
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "leader" => Some(Self::Leader),
            "replica" => Some(Self::Replica),
            "read-only-replica" => Some(Self::ReadOnlyReplica),
            _ => None,
        }
    }
}

/// Identity and addressing of this node
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Instance id; a random one is generated when unset
    pub instance_id: Option<Uuid>,
    /// Starting role
    pub role: NodeRole,
    /// Replication listener address
    pub bind_addr: SocketAddr,
    /// Leader replication address (replica roles)
    pub leader_addr: Option<SocketAddr>,
    /// Leader instance id (replica roles)
    pub leader_instance_id: Option<Uuid>,
    /// Size of each chunk of the in-memory log
    pub chunk_size: i32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            role: NodeRole::Leader,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 1112)),
            leader_addr: None,
            leader_instance_id: None,
            chunk_size: 256 * 1024 * 1024,
        }
    }
}

/// Whole server configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// This node
    pub node: NodeConfig,
    /// Replication tunables
    pub replication: ReplicationConfig,
}

impl ServerConfig {
    /// Parse a TOML document
    pub fn from_toml(content: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })
    }

    /// Load `path`, falling back to defaults when the file does not exist
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!("Config file not found: {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml(&content, &path.display().to_string())?;
        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Load `path`, apply environment overrides and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `CHRONICLE_*` variables resolved by `lookup`
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup("CHRONICLE_INSTANCE_ID") {
            self.node.instance_id = Some(parse_env("CHRONICLE_INSTANCE_ID", &value)?);
        }
        if let Some(value) = lookup("CHRONICLE_ROLE") {
            self.node.role = NodeRole::parse(&value).ok_or_else(|| ConfigError::Env {
                name: "CHRONICLE_ROLE".to_string(),
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup("CHRONICLE_BIND_ADDR") {
            self.node.bind_addr = parse_env("CHRONICLE_BIND_ADDR", &value)?;
        }
        if let Some(value) = lookup("CHRONICLE_LEADER_ADDR") {
            self.node.leader_addr = Some(parse_env("CHRONICLE_LEADER_ADDR", &value)?);
        }
        if let Some(value) = lookup("CHRONICLE_LEADER_ID") {
            self.node.leader_instance_id = Some(parse_env("CHRONICLE_LEADER_ID", &value)?);
        }
        if let Some(value) = lookup("CHRONICLE_CLUSTER_SIZE") {
            self.replication.cluster_size = parse_env("CHRONICLE_CLUSTER_SIZE", &value)?;
        }
        Ok(())
    }

    /// Check that the node can start
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.replication
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if self.node.chunk_size <= 0 {
            return Err(ConfigError::Invalid("node.chunk_size must be positive".to_string()));
        }
        if self.node.role != NodeRole::Leader {
            if self.node.leader_addr.is_none() {
                return Err(ConfigError::Invalid(
                    "node.leader_addr is required for replica roles".to_string(),
                ));
            }
            if self.node.leader_instance_id.is_none() {
                return Err(ConfigError::Invalid(
                    "node.leader_instance_id is required for replica roles".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Identity advertised by this node
    pub fn member(&self, instance_id: Uuid) -> MemberInfo {
        let mut member = MemberInfo::new(instance_id, self.node.bind_addr);
        member.is_read_only = self.node.role == NodeRole::ReadOnlyReplica;
        member
    }

    /// Leader this node subscribes to, for replica roles
    pub fn leader(&self) -> Option<MemberInfo> {
        match (self.node.leader_instance_id, self.node.leader_addr) {
            (Some(instance_id), Some(addr)) => Some(MemberInfo::new(instance_id, addr)),
            _ => None,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Env {
        name: name.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    const REPLICA_TOML: &str = r#"
[node]
instance_id = "5f0cc0a6-47a4-4f5c-9b8e-1b6f4fbf3c21"
role = "read-only-replica"
bind_addr = "127.0.0.1:2113"
leader_addr = "127.0.0.1:1112"
leader_instance_id = "0b8f1c43-9b44-4f8f-8d2c-5b1a9c6f3e10"
chunk_size = 1048576

[replication]
cluster_size = 3
bulk_size = 4096
reconnect_delay = 250
terminology = "legacy"
"#;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.node.role, NodeRole::Leader);
        assert_eq!(config.node.bind_addr, "127.0.0.1:1112".parse().unwrap());
        assert_eq!(config.replication, ReplicationConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_replica_file() {
        let config = ServerConfig::from_toml(REPLICA_TOML, "test").unwrap();
        assert_eq!(config.node.role, NodeRole::ReadOnlyReplica);
        assert_eq!(config.node.chunk_size, 1 << 20);
        assert_eq!(config.replication.cluster_size, 3);
        assert_eq!(config.replication.bulk_size, 4096);
        assert_eq!(config.replication.reconnect_delay, Duration::from_millis(250));
        // Unset fields keep their defaults.
        assert_eq!(config.replication.max_queue_size, 100);
        assert!(config.validate().is_ok());

        let leader = config.leader().unwrap();
        assert_eq!(leader.internal_tcp, Some("127.0.0.1:1112".parse().unwrap()));
        let member = config.member(config.node.instance_id.unwrap());
        assert!(member.is_read_only);
        assert_eq!(
            config.node.role.initial_state(),
            NodeState::PreReadOnlyReplica
        );
    }

    #[test]
    fn test_parse_error_names_origin() {
        let err = ServerConfig::from_toml("[node]\nrole = \"boss\"", "bad.toml").unwrap_err();
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::from_file(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn test_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chronicle.toml");
        std::fs::write(&path, REPLICA_TOML).unwrap();
        let config = ServerConfig::from_file(&path).unwrap();
        assert_eq!(config.node.bind_addr, "127.0.0.1:2113".parse().unwrap());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = ServerConfig::from_toml(REPLICA_TOML, "test").unwrap();
        let env: HashMap<&str, &str> = [
            ("CHRONICLE_ROLE", "replica"),
            ("CHRONICLE_BIND_ADDR", "0.0.0.0:3113"),
            ("CHRONICLE_CLUSTER_SIZE", "5"),
        ]
        .into_iter()
        .collect();
        config
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.node.role, NodeRole::Replica);
        assert_eq!(config.node.bind_addr, "0.0.0.0:3113".parse().unwrap());
        assert_eq!(config.replication.cluster_size, 5);
        assert_eq!(config.node.leader_addr, Some("127.0.0.1:1112".parse().unwrap()));
    }

    #[test]
    fn test_bad_env_value_rejected() {
        let mut config = ServerConfig::default();
        let result = config.apply_overrides(|name| {
            (name == "CHRONICLE_ROLE").then(|| "boss".to_string())
        });
        assert!(matches!(result, Err(ConfigError::Env { .. })));
    }

    #[test]
    fn test_replica_needs_leader() {
        let mut config = ServerConfig::default();
        config.node.role = NodeRole::Replica;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.node.leader_addr = Some("127.0.0.1:1112".parse().unwrap());
        config.node.leader_instance_id = Some(Uuid::new_v4());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_replication_config_rejected() {
        let mut config = ServerConfig::default();
        config.replication.cluster_size = 3;
        config.replication.quorum_size = Some(4);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
