//! gRPC glue for the task stream.
//!
//! RPC schema source: `proto/tsdq_task.proto`.
//!
//! - [`TaskServiceImpl`]: server side of `TaskService.Handle`; every inbound
//!   stream is served by a [`TaskHandler`]
//! - [`GrpcTaskStreamConnector`]: opens outbound streams over channels from a
//!   [`ClientConnFactory`]
//!
//! Callers identify themselves with the [`LOGIC_NODE`] request metadata.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::{Request, Response, Status, Streaming};
use tracing::info;
use tsdq_common::{ErrorKind, Node, Result, TsdqError};

use crate::client::{TaskStream, TaskStreamConnector};
use crate::conn::ClientConnFactory;
use crate::dispatch::TaskHandler;

#[allow(missing_docs)]
pub mod v1 {
    tonic::include_proto!("tsdq.task.v1");
}

pub use v1::task_service_client::TaskServiceClient;
pub use v1::task_service_server::{TaskService, TaskServiceServer};

/// Request metadata key carrying the caller's `host:port` indicator.
pub const LOGIC_NODE: &str = "logic-node";

/// Server side of `TaskService.Handle`.
///
/// Each call must carry the caller's indicator in [`LOGIC_NODE`]; calls
/// without it, or with one that is not `host:port`, are refused with
/// `INVALID_ARGUMENT`. Accepted streams are served by the node's
/// [`TaskHandler`], and responses are buffered up to `capacity` messages
/// per stream.
#[derive(Clone)]
pub struct TaskServiceImpl {
    handler: TaskHandler,
    capacity: usize,
}

impl TaskServiceImpl {
    pub fn new(handler: TaskHandler, capacity: usize) -> Self {
        Self {
            handler,
            capacity: capacity.max(1),
        }
    }
}

#[tonic::async_trait]
impl TaskService for TaskServiceImpl {
    type HandleStream = ReceiverStream<std::result::Result<v1::TaskResponse, Status>>;

    async fn handle(
        &self,
        request: Request<Streaming<v1::TaskRequest>>,
    ) -> std::result::Result<Response<Self::HandleStream>, Status> {
        let peer = request
            .metadata()
            .get(LOGIC_NODE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Status::invalid_argument(format!("missing {LOGIC_NODE} metadata")))?;
        peer.parse::<Node>().map_err(to_status)?;
        info!(peer = %peer, "task stream opened");

        let requests = request
            .into_inner()
            .map(|r| r.map_err(|s| TsdqError::Transport(s.message().to_string())))
            .boxed();
        let (tx, rx) = mpsc::channel(self.capacity);
        // Registered before the response headers go out, so the caller can
        // be answered as soon as its connect returns.
        let epoch = self.handler.accept(&peer, tx);
        let handler = self.handler.clone();
        tokio::spawn(async move { handler.handle(peer, epoch, requests).await });
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Opens task streams over gRPC.
///
/// Channels come from a shared [`ClientConnFactory`], so every stream to the
/// same peer reuses one HTTP/2 connection. The local indicator is sent as
/// [`LOGIC_NODE`] metadata on every call.
pub struct GrpcTaskStreamConnector {
    conns: Arc<ClientConnFactory>,
    current: Node,
    capacity: usize,
}

impl GrpcTaskStreamConnector {
    pub fn new(conns: Arc<ClientConnFactory>, current: Node, capacity: usize) -> Self {
        Self {
            conns,
            current,
            capacity: capacity.max(1),
        }
    }
}

#[tonic::async_trait]
impl TaskStreamConnector for GrpcTaskStreamConnector {
    async fn connect(&self, target: &Node) -> Result<TaskStream> {
        let mut client = TaskServiceClient::new(self.conns.get_client_conn(target)?);
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut request = Request::new(ReceiverStream::new(rx));
        let logic_node: MetadataValue<Ascii> = self
            .current
            .indicator()
            .parse()
            .map_err(|e| TsdqError::InvalidConfig(format!("node indicator {}: {e}", self.current)))?;
        request.metadata_mut().insert(LOGIC_NODE, logic_node);

        let responses = client
            .handle(request)
            .await
            .map_err(|s| TsdqError::Transport(format!("open task stream to {target}: {}", s.message())))?
            .into_inner()
            .map(|r| r.map_err(|s| TsdqError::Transport(s.message().to_string())))
            .boxed();
        Ok(TaskStream {
            requests: tx,
            responses,
        })
    }
}

/// Maps an error to the gRPC status returned to callers, by error kind.
pub fn to_status(err: TsdqError) -> Status {
    let msg = err.to_string();
    match err.kind() {
        ErrorKind::InvalidConfig | ErrorKind::Protocol => Status::invalid_argument(msg),
        ErrorKind::Planning => Status::failed_precondition(msg),
        ErrorKind::Transport => Status::unavailable(msg),
        ErrorKind::Cancelled => Status::cancelled(msg),
        ErrorKind::Execution => Status::internal(msg),
    }
}
