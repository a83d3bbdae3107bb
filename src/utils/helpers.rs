// YAML node configuration.
//
//   node_name: alpha
//   http_addr: 127.0.0.1:4001
//   raft:
//     listener_addr: 127.0.0.1:5001
//     persist_path: ./data/alpha
//     leader: 127.0.0.1:4001
//     heartbeat_ms: 1000
//     propose_timeout_ms: 5000
//     snapshot_threshold: 1024
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use yaml_rust2::{Yaml, YamlLoader};

const DEFAULT_HEARTBEAT_MS: u64 = 1000;
const DEFAULT_PROPOSE_TIMEOUT_MS: u64 = 5000;
const DEFAULT_SNAPSHOT_THRESHOLD: usize = 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid yaml: {0}")]
    Yaml(#[from] yaml_rust2::ScanError),

    #[error("empty configuration")]
    Empty,

    #[error("missing required key `{0}`")]
    Missing(&'static str),

    #[error("invalid value for `{key}`: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftConfig {
    pub listener_addr: SocketAddr,
    pub persist_path: PathBuf,
    /// HTTP address of the leader to join on startup.
    pub leader: Option<String>,
    pub heartbeat: Duration,
    pub propose_timeout: Duration,
    pub snapshot_threshold: usize,
}

impl RaftConfig {
    pub fn new(listener_addr: SocketAddr, persist_path: impl Into<PathBuf>) -> RaftConfig {
        RaftConfig {
            listener_addr,
            persist_path: persist_path.into(),
            leader: None,
            heartbeat: Duration::from_millis(DEFAULT_HEARTBEAT_MS),
            propose_timeout: Duration::from_millis(DEFAULT_PROPOSE_TIMEOUT_MS),
            snapshot_threshold: DEFAULT_SNAPSHOT_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub node_name: Option<String>,
    pub http_addr: SocketAddr,
    pub raft: RaftConfig,
}

pub fn parse_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config_str(&contents)
}

pub fn parse_config_str(contents: &str) -> Result<Config, ConfigError> {
    let docs = YamlLoader::load_from_str(contents)?;
    let doc = docs.first().ok_or(ConfigError::Empty)?;
    let raft = &doc["raft"];
    if raft.is_badvalue() {
        return Err(ConfigError::Missing("raft"));
    }

    let mut raft_config = RaftConfig::new(
        socket_addr(raft, "listener_addr", "raft.listener_addr")?,
        required_str(raft, "persist_path", "raft.persist_path")?,
    );
    raft_config.leader = optional_str(raft, "leader").map(str::to_string);
    if let Some(ms) = optional_u64(raft, "heartbeat_ms", "raft.heartbeat_ms")? {
        raft_config.heartbeat = Duration::from_millis(ms);
    }
    if let Some(ms) = optional_u64(raft, "propose_timeout_ms", "raft.propose_timeout_ms")? {
        raft_config.propose_timeout = Duration::from_millis(ms);
    }
    if let Some(n) = optional_u64(raft, "snapshot_threshold", "raft.snapshot_threshold")? {
        if n == 0 {
            return Err(ConfigError::Invalid {
                key: "raft.snapshot_threshold",
                value: n.to_string(),
            });
        }
        raft_config.snapshot_threshold = n as usize;
    }

    Ok(Config {
        node_name: optional_str(doc, "node_name").map(str::to_string),
        http_addr: socket_addr(doc, "http_addr", "http_addr")?,
        raft: raft_config,
    })
}

fn optional_str<'a>(yaml: &'a Yaml, key: &str) -> Option<&'a str> {
    yaml[key].as_str()
}

fn required_str<'a>(yaml: &'a Yaml, key: &str, path: &'static str) -> Result<&'a str, ConfigError> {
    optional_str(yaml, key).ok_or(ConfigError::Missing(path))
}

fn socket_addr(yaml: &Yaml, key: &str, path: &'static str) -> Result<SocketAddr, ConfigError> {
    let value = required_str(yaml, key, path)?;
    value.parse().map_err(|_| ConfigError::Invalid {
        key: path,
        value: value.to_string(),
    })
}

fn optional_u64(yaml: &Yaml, key: &str, path: &'static str) -> Result<Option<u64>, ConfigError> {
    match &yaml[key] {
        Yaml::BadValue | Yaml::Null => Ok(None),
        Yaml::Integer(n) if *n >= 0 => Ok(Some(*n as u64)),
        other => Err(ConfigError::Invalid {
            key: path,
            value: format!("{:?}", other),
        }),
    }
}
