//! Node configuration read by the `tsdq-broker` and `tsdq-storage` binaries.

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

use tsdq_common::{Node, QueryConfig, Result, ShardId, StreamConfig, TsdqError};
use tsdq_planner::DatabaseAssignment;

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or_default<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn parse_addr(key: &str, raw: &str) -> Result<SocketAddr> {
    raw.parse()
        .map_err(|e| TsdqError::InvalidConfig(format!("{key}={raw}: {e}")))
}

/// Comma separated `host:port` list; blanks are skipped.
pub fn parse_nodes(raw: &str) -> Result<Vec<Node>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Node::from_str)
        .collect()
}

/// Parses `db=node/shard+shard;node/shard,...`, e.g.
/// `db1=1.1.1.1:9000/1+2,1.1.1.2:9000/3;db2=1.1.1.1:9000/7`.
pub fn parse_assignments(raw: &str) -> Result<Vec<DatabaseAssignment>> {
    let mut out = Vec::new();
    for entry in raw.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let (name, nodes) = entry
            .split_once('=')
            .ok_or_else(|| TsdqError::InvalidConfig(format!("database entry '{entry}' has no '='")))?;
        let mut assignment = DatabaseAssignment::new(name.trim());
        for part in nodes.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (node, shards) = part.split_once('/').ok_or_else(|| {
                TsdqError::InvalidConfig(format!("node entry '{part}' has no shard list"))
            })?;
            let shards = shards
                .split('+')
                .map(|s| {
                    s.trim().parse::<ShardId>().map_err(|e| {
                        TsdqError::InvalidConfig(format!("shard id '{s}' in '{part}': {e}"))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            assignment = assignment.with_node(node.parse()?, shards);
        }
        out.push(assignment);
    }
    Ok(out)
}

fn query_config_from_env() -> QueryConfig {
    let d = QueryConfig::default();
    QueryConfig {
        max_workers: env_parse_or_default("TSDQ_MAX_WORKERS", d.max_workers),
        timeout_ms: env_parse_or_default("TSDQ_QUERY_TIMEOUT_MS", d.timeout_ms),
    }
}

fn stream_config_from_env() -> StreamConfig {
    let d = StreamConfig::default();
    StreamConfig {
        channel_capacity: env_parse_or_default("TSDQ_STREAM_CAPACITY", d.channel_capacity),
        backoff_initial_ms: env_parse_or_default("TSDQ_BACKOFF_INITIAL_MS", d.backoff_initial_ms),
        backoff_max_ms: env_parse_or_default("TSDQ_BACKOFF_MAX_MS", d.backoff_max_ms),
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub node: Node,
    pub grpc_bind: SocketAddr,
    pub http_bind: SocketAddr,
    /// Every broker of the cluster; self may be listed.
    pub brokers: Vec<Node>,
    pub storage_nodes: Vec<Node>,
    pub databases: Vec<DatabaseAssignment>,
    pub query: QueryConfig,
    pub stream: StreamConfig,
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self> {
        let node: Node = env_or_default("TSDQ_NODE", "127.0.0.1:8100").parse()?;
        let grpc_bind = env_or_default("TSDQ_GRPC_BIND", "0.0.0.0:8100");
        let http_bind = env_or_default("TSDQ_HTTP_BIND", "0.0.0.0:8080");
        let databases = parse_assignments(&env_or_default("TSDQ_DATABASES", ""))?;
        let mut storage_nodes: Vec<Node> = databases
            .iter()
            .flat_map(|db| db.nodes.keys().cloned())
            .collect();
        storage_nodes.extend(parse_nodes(&env_or_default("TSDQ_STORAGE_NODES", ""))?);
        storage_nodes.sort();
        storage_nodes.dedup();
        Ok(Self {
            brokers: parse_nodes(&env_or_default("TSDQ_BROKERS", ""))?,
            grpc_bind: parse_addr("TSDQ_GRPC_BIND", &grpc_bind)?,
            http_bind: parse_addr("TSDQ_HTTP_BIND", &http_bind)?,
            node,
            storage_nodes,
            databases,
            query: query_config_from_env(),
            stream: stream_config_from_env(),
        })
    }

    /// Peers this broker dials: other brokers and every storage node.
    pub fn peers(&self) -> Vec<Node> {
        let mut peers: Vec<Node> = self
            .brokers
            .iter()
            .filter(|b| **b != self.node)
            .cloned()
            .collect();
        peers.extend(self.storage_nodes.iter().cloned());
        peers.sort();
        peers.dedup();
        peers
    }
}

#[derive(Debug, Clone)]
pub struct StorageNodeConfig {
    pub node: Node,
    pub grpc_bind: SocketAddr,
    pub metrics_bind: SocketAddr,
    /// JSON fixture loaded into the in-memory engine.
    pub data_path: Option<String>,
    pub query: QueryConfig,
    pub stream: StreamConfig,
}

impl StorageNodeConfig {
    pub fn from_env() -> Result<Self> {
        let grpc_bind = env_or_default("TSDQ_GRPC_BIND", "0.0.0.0:9000");
        let metrics_bind = env_or_default("TSDQ_METRICS_BIND", "0.0.0.0:9090");
        Ok(Self {
            node: env_or_default("TSDQ_NODE", "127.0.0.1:9000").parse()?,
            grpc_bind: parse_addr("TSDQ_GRPC_BIND", &grpc_bind)?,
            metrics_bind: parse_addr("TSDQ_METRICS_BIND", &metrics_bind)?,
            data_path: env::var("TSDQ_DATA_PATH").ok(),
            query: query_config_from_env(),
            stream: stream_config_from_env(),
        })
    }
}
