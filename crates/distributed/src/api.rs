//! Thin HTTP adaptor over [`BrokerExecutor`].
//!
//! - `GET /query?db=<database>&sql=<statement>`: 200 with the JSON event, or
//!   500 with the error message as the body
//! - `GET /metrics`: Prometheus text
//!
//! A request holds its job only while the client waits: if the connection
//! drops, axum drops the handler future, the [`crate::JobHandle`] goes with
//! it and the job is cancelled.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::warn;
use tsdq_common::{metrics_router, Result};
use tsdq_sql::parse_statement;

use crate::broker::BrokerExecutor;
use crate::context::QueryEvent;

/// Query string of `GET /query`.
#[derive(Debug, Deserialize)]
pub struct QueryParams {
    /// Target database. May be empty for statements that need none, such as
    /// `show databases`.
    #[serde(default)]
    pub db: String,
    /// Statement text, in the dialect accepted by [`parse_statement`].
    pub sql: String,
}

/// Routes of the broker's HTTP endpoint, with `/metrics` merged in.
pub fn router(executor: Arc<BrokerExecutor>) -> Router {
    Router::new()
        .route("/query", get(query_handler))
        .with_state(executor)
        .merge(metrics_router())
}

/// Binds `addr` and serves [`router`] until the listener fails.
pub async fn serve(addr: SocketAddr, executor: Arc<BrokerExecutor>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router(executor))
        .await
        .map_err(std::io::Error::other)
}

/// Parses `sql`, executes it and waits for the job's terminal event.
///
/// Responds 200 with the event as JSON. Parse, planning and execution
/// errors all respond 500 with the error message as a plain text body.
pub async fn query_handler(
    State(executor): State<Arc<BrokerExecutor>>,
    Query(params): Query<QueryParams>,
) -> Response {
    match run_query(&executor, &params).await {
        Ok(event) => (StatusCode::OK, Json(event)).into_response(),
        Err(err) => {
            warn!(db = %params.db, sql = %params.sql, error = %err, "query failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

async fn run_query(executor: &BrokerExecutor, params: &QueryParams) -> Result<QueryEvent> {
    let statement = parse_statement(&params.sql)?;
    let handle = executor.execute(&params.db, statement).await?;
    handle.first().await
}
