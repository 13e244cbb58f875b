use std::io;
use std::net::SocketAddr;

use axum::{routing::get, Router};
use tokio::net::TcpListener;

use crate::metrics::global_metrics;

/// Router exposing `GET /metrics`; merged into other HTTP surfaces or served standalone.
pub fn metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

pub async fn run_metrics_exporter(addr: SocketAddr) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, metrics_router())
        .await
        .map_err(io::Error::other)
}

async fn metrics_handler() -> String {
    global_metrics().render_prometheus()
}

#[cfg(test)]
mod tests {
    use super::metrics_handler;
    use crate::metrics::global_metrics;

    #[tokio::test]
    async fn metrics_handler_returns_prometheus_text() {
        global_metrics().record_reconnect("9.9.9.9:2891");
        let body = metrics_handler().await;
        assert!(body.contains("tsdq_stream_reconnects_total"));
        assert!(body.contains("9.9.9.9:2891"));
    }
}
