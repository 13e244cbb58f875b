//! Typed identifiers shared by planner, storage and distributed components.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TsdqError;

/// Shard identifier within a database.
pub type ShardId = u32;

/// A cluster participant, named by its `host:port` indicator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Node {
    pub host: String,
    pub port: u16,
}

impl Node {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The `host:port` string identifying this node cluster-wide.
    pub fn indicator(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Node {
    type Err = TsdqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TsdqError::InvalidConfig(format!("node indicator '{s}' has no port")))?;
        if host.is_empty() {
            return Err(TsdqError::InvalidConfig(format!(
                "node indicator '{s}' has no host"
            )));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| TsdqError::InvalidConfig(format!("node indicator '{s}': {e}")))?;
        Ok(Node::new(host, port))
    }
}

/// Registration token handed out by a stream registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamEpoch(
    /// Raw monotonic value.
    pub u64,
);

impl fmt::Display for StreamEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_indicator() {
        let node: Node = "1.1.1.1:9000".parse().expect("node");
        assert_eq!(node, Node::new("1.1.1.1", 9000));
        assert_eq!(node.indicator(), "1.1.1.1:9000");
        assert_eq!(node.to_string(), node.indicator());
    }

    #[test]
    fn rejects_bad_indicators() {
        assert!("1.1.1.1".parse::<Node>().is_err());
        assert!(":9000".parse::<Node>().is_err());
        assert!("host:port".parse::<Node>().is_err());
    }
}
