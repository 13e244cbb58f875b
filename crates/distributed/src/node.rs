//! Wiring of the per-role components.

use std::sync::Arc;

use tracing::{info, warn};
use tsdq_common::{Node, QueryConfig, StreamConfig, TsdqError};
use tsdq_storage::Engine;

use crate::broker::BrokerExecutor;
use crate::client::{ResponseRouter, TaskClientFactory, TaskStreamConnector};
use crate::cluster::ClusterState;
use crate::dispatch::{IntermediateTaskDispatcher, LeafTaskDispatcher, TaskHandler};
use crate::stream::StreamRegistry;
use crate::task_manager::TaskManager;

/// A broker: plans and roots statements, runs intermediate merges, and
/// dials every other node.
pub struct BrokerNode {
    pub current: Node,
    pub registry: Arc<StreamRegistry>,
    pub task_manager: Arc<TaskManager>,
    pub clients: TaskClientFactory,
    pub executor: Arc<BrokerExecutor>,
    pub handler: TaskHandler,
}

impl BrokerNode {
    pub fn new(
        current: Node,
        cluster: Arc<dyn ClusterState>,
        connector: Arc<dyn TaskStreamConnector>,
        query: QueryConfig,
        stream: StreamConfig,
    ) -> Self {
        let registry = Arc::new(StreamRegistry::new());
        let task_manager = Arc::new(TaskManager::new(current.clone(), Arc::clone(&registry)));
        let clients = TaskClientFactory::new(
            current.clone(),
            connector,
            Arc::clone(&registry),
            Arc::new(ResponseRouter::new(Arc::clone(&task_manager))),
            stream,
        );
        let dispatcher = Arc::new(IntermediateTaskDispatcher::new(
            current.clone(),
            Arc::clone(&task_manager),
            query.clone(),
        ));
        let executor = Arc::new(BrokerExecutor::new(cluster, Arc::clone(&task_manager), query));
        Self {
            handler: TaskHandler::new(Arc::clone(&registry), dispatcher),
            current,
            registry,
            task_manager,
            clients,
            executor,
        }
    }

    /// Opens a task stream to every peer; returns the peers that failed.
    pub async fn connect_peers(&self, peers: &[Node]) -> Vec<(Node, TsdqError)> {
        let mut failed = Vec::new();
        for peer in peers.iter().filter(|p| **p != self.current) {
            match self.clients.create_task_client(peer).await {
                Ok(()) => info!(peer = %peer, "task client ready"),
                Err(err) => {
                    warn!(peer = %peer, error = %err, "task client failed");
                    failed.push((peer.clone(), err));
                }
            }
        }
        failed
    }
}

/// A storage node: serves leaf work over streams opened by brokers.
pub struct StorageNode {
    pub current: Node,
    pub registry: Arc<StreamRegistry>,
    pub task_manager: Arc<TaskManager>,
    pub handler: TaskHandler,
}

impl StorageNode {
    pub fn new(current: Node, engine: Arc<dyn Engine>, query: QueryConfig) -> Self {
        let registry = Arc::new(StreamRegistry::new());
        let task_manager = Arc::new(TaskManager::new(current.clone(), Arc::clone(&registry)));
        let dispatcher = Arc::new(LeafTaskDispatcher::new(
            current.clone(),
            engine,
            Arc::clone(&task_manager),
            query,
        ));
        Self {
            handler: TaskHandler::new(Arc::clone(&registry), dispatcher),
            current,
            registry,
            task_manager,
        }
    }
}
