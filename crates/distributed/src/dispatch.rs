//! Inbound task handling.
//!
//! [`TaskHandler`] owns the server side of one task stream. The response
//! half is registered under the caller's indicator before the stream is
//! handed back to the caller; requests are then read until the stream ends
//! and each one goes to a [`TaskDispatcher`]. Storage nodes run
//! [`LeafTaskDispatcher`]; brokers run [`IntermediateTaskDispatcher`].

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tsdq_common::{Node, QueryConfig, Result, ShardId, StreamEpoch, TsdqError};
use tsdq_planner::PhysicalPlan;
use tsdq_sql::Statement;
use tsdq_storage::{Database, Engine, TimeSeries, TimeSeriesEvent};

use crate::context::{TaskContext, TaskType};
use crate::grpc::v1::{RequestType, TaskRequest, TaskResponse};
use crate::merger::ResultMerger;
use crate::metadata_executor::MetadataExecutor;
use crate::pool::{TaskOutcome, WorkerPool};
use crate::query_executor::QueryExecutor;
use crate::stream::{ResponseSender, StreamRegistry};
use crate::task_manager::{spawn_deadline_watch, TaskManager};

#[tonic::async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Handles one request received from `peer`. Failures are reported back
    /// as error responses, never returned.
    async fn dispatch(&self, peer: &str, req: TaskRequest);
}

/// Server side of task streams, shared by every stream a node accepts.
#[derive(Clone)]
pub struct TaskHandler {
    registry: Arc<StreamRegistry>,
    dispatcher: Arc<dyn TaskDispatcher>,
}

impl TaskHandler {
    pub fn new(registry: Arc<StreamRegistry>, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        Self {
            registry,
            dispatcher,
        }
    }

    /// Registers the response half of a new stream from `peer`. Transports
    /// call this before the stream is visible to the caller, so a peer that
    /// sees its stream open can already be answered through it.
    pub fn accept(&self, peer: &str, responses: ResponseSender) -> StreamEpoch {
        self.registry.register_server(peer, responses)
    }

    /// Serves one accepted stream until the peer closes it or it errors,
    /// then deregisters the response half registered under `epoch`.
    pub async fn handle(
        &self,
        peer: String,
        epoch: StreamEpoch,
        mut requests: BoxStream<'static, Result<TaskRequest>>,
    ) {
        while let Some(next) = requests.next().await {
            match next {
                Ok(req) => {
                    debug!(peer = %peer, request_id = %req.request_id, "task request received");
                    let dispatcher = Arc::clone(&self.dispatcher);
                    let peer = peer.clone();
                    tokio::spawn(async move { dispatcher.dispatch(&peer, req).await });
                }
                Err(err) => {
                    warn!(peer = %peer, error = %err, "task stream receive failed");
                    break;
                }
            }
        }
        self.registry.deregister_server(epoch, &peer);
    }
}

/// Deadline of a request: its own timeout capped by the node's.
pub fn request_deadline(req: &TaskRequest, config: &QueryConfig) -> Instant {
    let timeout = if req.timeout_ms > 0 {
        Duration::from_millis(req.timeout_ms as u64).min(config.timeout())
    } else {
        config.timeout()
    };
    Instant::now() + timeout
}

fn decode_statement(req: &TaskRequest) -> Result<Statement> {
    let statement = Statement::from_json_bytes(&req.payload)?;
    let request_type = RequestType::try_from(req.request_type)
        .map_err(|_| TsdqError::Protocol(format!("unknown request type {}", req.request_type)))?;
    match (request_type, &statement) {
        (RequestType::Data, Statement::Query(_)) | (RequestType::Metadata, Statement::Metadata(_)) => {
            Ok(statement)
        }
        _ => Err(TsdqError::Protocol(format!(
            "request type {} does not match payload",
            request_type.as_str_name()
        ))),
    }
}

fn error_response(task_id: &str, current: &Node, err: &TsdqError) -> TaskResponse {
    TaskResponse {
        task_id: task_id.to_string(),
        completed: true,
        err_msg: err.to_string(),
        payload: Vec::new(),
        send_node: current.indicator(),
        ack: false,
    }
}

fn ack_response(task_id: &str, current: &Node) -> TaskResponse {
    TaskResponse {
        task_id: task_id.to_string(),
        completed: false,
        err_msg: String::new(),
        payload: Vec::new(),
        send_node: current.indicator(),
        ack: true,
    }
}

enum LeafOutput {
    Metadata(Vec<u8>),
    Series(Vec<TimeSeries>),
}

struct LeafTask {
    database: Arc<dyn Database>,
    shard_ids: Vec<ShardId>,
    statement: Statement,
}

impl LeafTask {
    fn run(self) -> Result<LeafOutput> {
        match self.statement {
            Statement::Metadata(m) => {
                let result = MetadataExecutor::new(self.database, self.shard_ids, m).execute()?;
                Ok(LeafOutput::Metadata(result.to_payload()?))
            }
            Statement::Query(q) => Ok(LeafOutput::Series(
                QueryExecutor::new(self.database, self.shard_ids, q).execute()?,
            )),
        }
    }
}

/// Runs leaf work on a storage node and streams results to the leaf's
/// receivers.
///
/// Each request is checked against the plan (this node must be one of its
/// leaves, the database must exist) and then executed on the worker pool.
/// Scans block, so they run on tokio's blocking threads and are bounded by
/// the request deadline. Results go to every receiver of the leaf: series
/// are split between receivers by group key, metadata goes to all of them.
/// A leaf that runs past its deadline sends nothing; the receiving context
/// times out on its own.
pub struct LeafTaskDispatcher {
    current: Node,
    engine: Arc<dyn Engine>,
    task_manager: Arc<TaskManager>,
    pool: WorkerPool,
    config: QueryConfig,
}

impl LeafTaskDispatcher {
    pub fn new(
        current: Node,
        engine: Arc<dyn Engine>,
        task_manager: Arc<TaskManager>,
        config: QueryConfig,
    ) -> Self {
        Self {
            current,
            engine,
            task_manager,
            pool: WorkerPool::new(config.max_workers),
            config,
        }
    }

    fn prepare(&self, req: &TaskRequest) -> Result<(LeafTask, Vec<String>)> {
        let plan = PhysicalPlan::from_json_bytes(&req.physical_plan)?;
        let indicator = self.current.indicator();
        let leaf = plan
            .find_leaf(&indicator)
            .ok_or_else(|| TsdqError::Protocol(format!("plan has no leaf for {indicator}")))?;
        let database = self.engine.get_database(&plan.database).ok_or_else(|| {
            TsdqError::Execution(format!("database not found: {}", plan.database))
        })?;
        let receivers = leaf.receivers.iter().map(Node::indicator).collect();
        let task = LeafTask {
            database,
            shard_ids: leaf.shard_ids.clone(),
            statement: decode_statement(req)?,
        };
        Ok((task, receivers))
    }

    async fn send(&self, target: &str, resp: TaskResponse, deadline: Instant) {
        if let Err(err) = self.task_manager.send_response(target, resp, deadline).await {
            warn!(target, error = %err, "send leaf response failed");
        }
    }

    async fn send_error(
        &self,
        targets: &[String],
        task_id: &str,
        err: &TsdqError,
        deadline: Instant,
    ) {
        for target in targets {
            self.send(target, error_response(task_id, &self.current, err), deadline)
                .await;
        }
    }

    async fn send_output(
        &self,
        receivers: &[String],
        task_id: &str,
        output: LeafOutput,
        deadline: Instant,
    ) {
        match output {
            LeafOutput::Metadata(payload) => {
                for receiver in receivers {
                    self.send(
                        receiver,
                        TaskResponse {
                            task_id: task_id.to_string(),
                            completed: true,
                            err_msg: String::new(),
                            payload: payload.clone(),
                            send_node: self.current.indicator(),
                            ack: false,
                        },
                        deadline,
                    )
                    .await;
                }
            }
            LeafOutput::Series(series) => {
                for (receiver, part) in receivers.iter().zip(partition(series, receivers.len())) {
                    let event = TimeSeriesEvent {
                        series_list: part,
                        ..Default::default()
                    };
                    let resp = match event.to_json_bytes() {
                        Ok(payload) => TaskResponse {
                            task_id: task_id.to_string(),
                            completed: true,
                            err_msg: String::new(),
                            payload,
                            send_node: self.current.indicator(),
                            ack: false,
                        },
                        Err(err) => error_response(task_id, &self.current, &err),
                    };
                    self.send(receiver, resp, deadline).await;
                }
            }
        }
    }
}

/// Splits groups across `n` receivers by a hash of the group key, so every
/// receiver sees each group from every leaf or not at all.
fn partition(series: Vec<TimeSeries>, n: usize) -> Vec<Vec<TimeSeries>> {
    let mut parts: Vec<Vec<TimeSeries>> = (0..n).map(|_| Vec::new()).collect();
    if n == 0 {
        return parts;
    }
    for s in series {
        let mut hasher = DefaultHasher::new();
        s.group_key().hash(&mut hasher);
        parts[(hasher.finish() % n as u64) as usize].push(s);
    }
    parts
}

#[tonic::async_trait]
impl TaskDispatcher for LeafTaskDispatcher {
    async fn dispatch(&self, peer: &str, req: TaskRequest) {
        let deadline = request_deadline(&req, &self.config);
        let task_id = req.parent_task_id.clone();
        let (task, receivers) = match self.prepare(&req) {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!(peer, task_id = %task_id, error = %err, "reject leaf request");
                self.send_error(&[peer.to_string()], &task_id, &err, deadline)
                    .await;
                return;
            }
        };

        let handle = match self.pool.submit_blocking(deadline, move || task.run()).await {
            Ok(handle) => handle,
            Err(err) => {
                self.send_error(&receivers, &task_id, &err, deadline).await;
                return;
            }
        };
        let outcome = handle.await;
        if Instant::now() >= deadline {
            warn!(task_id = %task_id, "leaf task finished past its deadline, no response sent");
            return;
        }
        match outcome {
            Ok(TaskOutcome::Done(Ok(output))) => {
                info!(task_id = %task_id, receivers = receivers.len(), "leaf task done");
                self.send_output(&receivers, &task_id, output, deadline).await;
            }
            Ok(TaskOutcome::Done(Err(err))) => {
                warn!(task_id = %task_id, error = %err, "leaf task failed");
                self.send_error(&receivers, &task_id, &err, deadline).await;
            }
            Ok(TaskOutcome::Panicked(msg)) => {
                let err = TsdqError::Execution(format!("leaf task panicked: {msg}"));
                self.send_error(&receivers, &task_id, &err, deadline).await;
            }
            Ok(TaskOutcome::TimedOut) => {
                warn!(task_id = %task_id, "leaf task timed out, no response sent");
            }
            Err(join) => {
                let err = TsdqError::Execution(format!("leaf task aborted: {join}"));
                self.send_error(&receivers, &task_id, &err, deadline).await;
            }
        }
    }
}

/// Registers intermediate merge contexts on a broker and acknowledges each
/// one to the root. Leaf responses reach the context through the broker's
/// [`crate::client::ResponseRouter`].
pub struct IntermediateTaskDispatcher {
    current: Node,
    task_manager: Arc<TaskManager>,
    config: QueryConfig,
}

impl IntermediateTaskDispatcher {
    pub fn new(current: Node, task_manager: Arc<TaskManager>, config: QueryConfig) -> Self {
        Self {
            current,
            task_manager,
            config,
        }
    }

    fn register(&self, peer: &str, req: &TaskRequest) -> Result<Arc<TaskContext>> {
        let query = match decode_statement(req)? {
            Statement::Query(q) => q,
            Statement::Metadata(_) => {
                return Err(TsdqError::Protocol(
                    "metadata requests have no intermediate stage".to_string(),
                ))
            }
        };
        let plan = PhysicalPlan::from_json_bytes(&req.physical_plan)?;
        let indicator = self.current.indicator();
        let intermediate = plan.find_intermediate(&indicator).ok_or_else(|| {
            TsdqError::Protocol(format!("plan has no intermediate for {indicator}"))
        })?;
        let forward = self
            .task_manager
            .streams()
            .server_stream(peer)
            .ok_or_else(|| TsdqError::NoSendStream(peer.to_string()))?;

        let merger = ResultMerger::intermediate(&query, forward, &req.parent_task_id, indicator);
        let ctx = Arc::new(TaskContext::new(
            &req.parent_task_id,
            TaskType::Intermediate,
            &req.parent_task_id,
            &req.parent_node,
            intermediate.num_of_task,
            merger,
        ));
        if !self.task_manager.submit(Arc::clone(&ctx)) {
            return Err(TsdqError::Protocol(format!(
                "task {} already registered",
                req.parent_task_id
            )));
        }
        Ok(ctx)
    }
}

#[tonic::async_trait]
impl TaskDispatcher for IntermediateTaskDispatcher {
    async fn dispatch(&self, peer: &str, req: TaskRequest) {
        let deadline = request_deadline(&req, &self.config);
        match self.register(peer, &req) {
            Ok(ctx) => {
                debug!(task_id = ctx.task_id(), expect = ctx.expect_results(), "intermediate task registered");
                spawn_deadline_watch(Arc::clone(&self.task_manager), Arc::clone(&ctx), deadline);
                let ack = ack_response(ctx.task_id(), &self.current);
                if let Err(err) = self.task_manager.send_response(peer, ack, deadline).await {
                    warn!(peer, task_id = ctx.task_id(), error = %err, "send intermediate ack failed");
                }
            }
            Err(err) => {
                warn!(peer, task_id = %req.parent_task_id, error = %err, "reject intermediate request");
                let resp = error_response(&req.parent_task_id, &self.current, &err);
                if let Err(err) = self.task_manager.send_response(peer, resp, deadline).await {
                    warn!(peer, error = %err, "send intermediate rejection failed");
                }
            }
        }
    }
}
