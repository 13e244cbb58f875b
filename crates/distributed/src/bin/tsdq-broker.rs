use std::sync::Arc;

use tonic::transport::Server;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tsdq_distributed::grpc::TaskServiceServer;
use tsdq_distributed::{
    api, Backoff, BrokerConfig, BrokerNode, ClientConnFactory, GrpcTaskStreamConnector,
    StaticClusterState, TaskServiceImpl,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = BrokerConfig::from_env()?;
    let cluster = StaticClusterState::new(config.brokers.clone());
    for database in &config.databases {
        cluster.put_database(database.clone());
    }
    let conns = Arc::new(ClientConnFactory::new());
    let connector = Arc::new(GrpcTaskStreamConnector::new(
        Arc::clone(&conns),
        config.node.clone(),
        config.stream.channel_capacity,
    ));
    let broker = Arc::new(BrokerNode::new(
        config.node.clone(),
        Arc::new(cluster),
        connector,
        config.query.clone(),
        config.stream.clone(),
    ));

    let service = TaskServiceImpl::new(broker.handler.clone(), config.stream.channel_capacity);
    let grpc_addr = config.grpc_bind;
    let grpc = tokio::spawn(async move {
        Server::builder()
            .add_service(TaskServiceServer::new(service))
            .serve(grpc_addr)
            .await
    });

    // Peers may start after us; keep dialing until every stream is up.
    let dialer = {
        let broker = Arc::clone(&broker);
        let mut pending = config.peers();
        let mut backoff = Backoff::new(config.stream.backoff_initial(), config.stream.backoff_max());
        tokio::spawn(async move {
            while !pending.is_empty() {
                let failed = broker.connect_peers(&pending).await;
                pending = failed.into_iter().map(|(peer, _)| peer).collect();
                if !pending.is_empty() {
                    let delay = backoff.next_delay();
                    warn!(pending = pending.len(), delay_ms = delay.as_millis() as u64, "retrying peer connections");
                    tokio::time::sleep(delay).await;
                }
            }
            info!("connected to all peers");
        })
    };

    info!(
        node = %config.node,
        grpc = %config.grpc_bind,
        http = %config.http_bind,
        databases = config.databases.len(),
        "tsdq-broker started"
    );
    api::serve(config.http_bind, Arc::clone(&broker.executor)).await?;

    dialer.abort();
    grpc.abort();
    broker.clients.close().await;
    conns.close();
    Ok(())
}
