//! Registry of in-flight task contexts on one node, plus the send helpers
//! used to reach peers over registered streams.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, warn};
use tsdq_common::{global_metrics, Node, Result, TsdqError};

use crate::context::TaskContext;
use crate::grpc::v1::{TaskRequest, TaskResponse};
use crate::stream::StreamRegistry;

/// Task contexts of one node, keyed by task id.
///
/// The root registers its context under a freshly allocated id; an
/// intermediate registers under the id allocated by its root. Responses read
/// from outbound streams are routed here by `task_id` (see
/// [`crate::client::ResponseRouter`]), and whoever moves a context to its
/// terminal state removes it with [`TaskManager::complete`].
///
/// Sends go through the node's [`StreamRegistry`] and are bounded by the
/// deadline of the task they belong to.
pub struct TaskManager {
    current: Node,
    seq: AtomicI64,
    tasks: DashMap<String, Arc<TaskContext>>,
    streams: Arc<StreamRegistry>,
}

impl TaskManager {
    pub fn new(current: Node, streams: Arc<StreamRegistry>) -> Self {
        Self {
            current,
            seq: AtomicI64::new(0),
            tasks: DashMap::new(),
            streams,
        }
    }

    pub fn current(&self) -> &Node {
        &self.current
    }

    pub fn streams(&self) -> &Arc<StreamRegistry> {
        &self.streams
    }

    /// Returns `"{indicator}-{seq}"`; seq starts at 1 and never repeats
    /// within the process.
    pub fn alloc_task_id(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{}", self.current.indicator(), seq)
    }

    /// Registers a context. A second submit for the same id is a no-op and
    /// returns false.
    pub fn submit(&self, ctx: Arc<TaskContext>) -> bool {
        match self.tasks.entry(ctx.task_id().to_string()) {
            Entry::Occupied(_) => {
                warn!(task_id = ctx.task_id(), "duplicate task submit ignored");
                false
            }
            Entry::Vacant(slot) => {
                global_metrics().record_task_submitted(ctx.task_type().role());
                slot.insert(ctx);
                true
            }
        }
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<TaskContext>> {
        self.tasks.get(task_id).map(|e| Arc::clone(e.value()))
    }

    /// Removes a context; idempotent.
    pub fn complete(&self, task_id: &str) {
        if self.tasks.remove(task_id).is_some() {
            debug!(task_id, "task removed");
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Sends a request over the client stream this node opened to `target`,
    /// waiting for channel capacity no longer than `deadline`.
    pub async fn send_request(&self, target: &str, req: TaskRequest, deadline: Instant) -> Result<()> {
        let stream = self
            .streams
            .client_stream(target)
            .ok_or_else(|| TsdqError::NoSendStream(target.to_string()))?;
        match tokio::time::timeout_at(deadline, stream.send(req)).await {
            Err(_) => Err(TsdqError::Timeout(format!("send request to {target}"))),
            Ok(Err(e)) => Err(TsdqError::TaskSend {
                target: target.to_string(),
                reason: e.to_string(),
            }),
            Ok(Ok(())) => Ok(()),
        }
    }

    /// Sends a response over the server stream `target` opened to this node,
    /// waiting for channel capacity no longer than `deadline`.
    pub async fn send_response(
        &self,
        target: &str,
        resp: TaskResponse,
        deadline: Instant,
    ) -> Result<()> {
        let stream = self
            .streams
            .server_stream(target)
            .ok_or_else(|| TsdqError::NoSendStream(target.to_string()))?;
        match tokio::time::timeout_at(deadline, stream.send(Ok(resp))).await {
            Err(_) => Err(TsdqError::Timeout(format!("send response to {target}"))),
            Ok(Err(e)) => Err(TsdqError::TaskSend {
                target: target.to_string(),
                reason: e.to_string(),
            }),
            Ok(Ok(())) => Ok(()),
        }
    }
}

/// Fails `ctx` with a timeout if it is still running at `deadline`.
pub fn spawn_deadline_watch(
    task_manager: Arc<TaskManager>,
    ctx: Arc<TaskContext>,
    deadline: Instant,
) {
    let finished = ctx.finished();
    tokio::spawn(async move {
        tokio::select! {
            _ = finished.cancelled() => {}
            _ = tokio::time::sleep_until(deadline) => {
                if ctx.fail(TsdqError::Timeout(format!("task {}", ctx.task_id()))) {
                    warn!(task_id = ctx.task_id(), expect = ctx.expect_results(), "task timed out");
                    task_manager.complete(ctx.task_id());
                }
            }
        }
    });
}
