use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Query execution limits shared by brokers and storage nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Max concurrently running tasks in a node's worker pool.
    pub max_workers: usize,
    /// Per-request deadline, applied to every suspension point of a task.
    pub timeout_ms: u64,
}

impl QueryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_workers: 30,
            timeout_ms: 30_000,
        }
    }
}

/// Bidirectional stream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Buffered messages per outbound stream before senders wait.
    pub channel_capacity: usize,
    /// First reconnect delay after a receive error.
    pub backoff_initial_ms: u64,
    /// Upper bound for the exponential reconnect delay.
    pub backoff_max_ms: u64,
}

impl StreamConfig {
    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            backoff_initial_ms: 100,
            backoff_max_ms: 5_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_values() {
        let q = QueryConfig::default();
        assert_eq!(q.max_workers, 30);
        assert_eq!(q.timeout(), Duration::from_secs(30));

        let s = StreamConfig::default();
        assert_eq!(s.backoff_initial(), Duration::from_millis(100));
        assert_eq!(s.backoff_max(), Duration::from_secs(5));
    }

    #[test]
    fn config_round_trips_through_json() {
        let raw = r#"{"max_workers":4,"timeout_ms":250}"#;
        let q: QueryConfig = serde_json::from_str(raw).expect("parse");
        assert_eq!(q.max_workers, 4);
        assert_eq!(q.timeout(), Duration::from_millis(250));
    }
}
