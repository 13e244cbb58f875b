//! Broker view of the cluster: database shard assignments and live brokers.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use tsdq_common::{Node, Result};
use tsdq_planner::DatabaseAssignment;

pub trait ClusterState: Send + Sync {
    /// Shard assignment of `name`, or `None` for an unknown database.
    fn database(&self, name: &str) -> Option<DatabaseAssignment>;

    fn list_databases(&self) -> Result<Vec<String>>;

    /// Brokers currently able to take intermediate work, self included.
    fn live_brokers(&self) -> Vec<Node>;
}

/// Cluster state fixed at startup, optionally updated by tests.
#[derive(Default)]
pub struct StaticClusterState {
    databases: RwLock<BTreeMap<String, DatabaseAssignment>>,
    brokers: RwLock<Vec<Node>>,
}

impl StaticClusterState {
    pub fn new(brokers: Vec<Node>) -> Self {
        Self {
            databases: RwLock::new(BTreeMap::new()),
            brokers: RwLock::new(brokers),
        }
    }

    pub fn with_database(self, database: DatabaseAssignment) -> Self {
        self.put_database(database);
        self
    }

    pub fn put_database(&self, database: DatabaseAssignment) {
        self.databases
            .write()
            .insert(database.name.clone(), database);
    }

    pub fn set_brokers(&self, brokers: Vec<Node>) {
        *self.brokers.write() = brokers;
    }
}

impl ClusterState for StaticClusterState {
    fn database(&self, name: &str) -> Option<DatabaseAssignment> {
        self.databases.read().get(name).cloned()
    }

    fn list_databases(&self) -> Result<Vec<String>> {
        Ok(self.databases.read().keys().cloned().collect())
    }

    fn live_brokers(&self) -> Vec<Node> {
        self.brokers.read().clone()
    }
}
