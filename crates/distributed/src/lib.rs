//! Distributed execution substrate linking brokers and storage nodes.
//!
//! Request path: [`broker::BrokerExecutor`] plans a statement, registers a
//! root [`context::TaskContext`] and sends [`grpc::v1::TaskRequest`]s over
//! outbound streams. Storage nodes run leaf work in a [`pool::WorkerPool`]
//! and answer over the caller's stream; brokers picked as intermediates
//! merge partial results before forwarding them to the root.
//!
//! Key modules:
//! - [`stream`]: per-peer stream tables with epoch-checked deregistration
//! - [`client`]: outbound streams, receive loops, reconnect backoff, response routing
//! - [`dispatch`]: inbound stream handling, leaf and intermediate dispatchers
//! - [`context`] / [`merger`]: task state machines and result merging
//! - [`search`], [`metadata_executor`], [`query_executor`]: storage-side execution
//! - [`api`]: HTTP adaptor

pub mod aggregate;
pub mod api;
pub mod broker;
pub mod client;
pub mod cluster;
pub mod config;
pub mod conn;
pub mod context;
pub mod dispatch;
pub mod grpc;
pub mod local;
pub mod merger;
pub mod metadata_executor;
pub mod node;
pub mod pool;
pub mod query_executor;
pub mod search;
pub mod stream;
pub mod task_manager;

pub use broker::BrokerExecutor;
pub use client::{Backoff, ResponseRouter, TaskClientFactory, TaskReceiver, TaskStream, TaskStreamConnector};
pub use cluster::{ClusterState, StaticClusterState};
pub use config::{BrokerConfig, StorageNodeConfig};
pub use conn::ClientConnFactory;
pub use context::{JobContext, JobHandle, QueryEvent, TaskContext, TaskType};
pub use dispatch::{IntermediateTaskDispatcher, LeafTaskDispatcher, TaskDispatcher, TaskHandler};
pub use grpc::{GrpcTaskStreamConnector, TaskServiceImpl};
pub use local::{LocalConnector, LocalNetwork};
pub use merger::ResultMerger;
pub use node::{BrokerNode, StorageNode};
pub use pool::{TaskOutcome, WorkerPool};
pub use stream::StreamRegistry;
pub use task_manager::TaskManager;
