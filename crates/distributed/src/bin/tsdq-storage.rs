use std::sync::Arc;

use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tsdq_common::run_metrics_exporter;
use tsdq_distributed::grpc::TaskServiceServer;
use tsdq_distributed::{StorageNode, StorageNodeConfig, TaskServiceImpl};
use tsdq_storage::{Engine, MemoryEngine};

fn load_engine(path: Option<&str>) -> Result<MemoryEngine, Box<dyn std::error::Error>> {
    match path {
        Some(p) => Ok(MemoryEngine::load_from_json(p)?),
        None => Ok(MemoryEngine::new()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = StorageNodeConfig::from_env()?;
    let engine = load_engine(config.data_path.as_deref())?;
    let databases = engine.database_names();
    let node = StorageNode::new(config.node.clone(), Arc::new(engine), config.query.clone());

    let metrics_addr = config.metrics_bind;
    let metrics = tokio::spawn(async move { run_metrics_exporter(metrics_addr).await });

    info!(
        node = %config.node,
        grpc = %config.grpc_bind,
        metrics = %config.metrics_bind,
        databases = ?databases,
        "tsdq-storage started"
    );
    Server::builder()
        .add_service(TaskServiceServer::new(TaskServiceImpl::new(
            node.handler.clone(),
            config.stream.channel_capacity,
        )))
        .serve(config.grpc_bind)
        .await?;

    metrics.abort();
    Ok(())
}
