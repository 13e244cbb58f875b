//! Task and job contexts.
//!
//! A [`TaskContext`] tracks one task on one node: how many completions are
//! still expected, the first error seen, and the merger that combines
//! responses. Its terminal transition is one-shot: the first of
//! "all completions arrived", "an error arrived" or "failed locally" wins,
//! and everything after is dropped.
//!
//! A [`JobContext`] owns the caller-facing side of a statement on the root:
//! the plan, the deadline, the cancellation token and the child task contexts.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tsdq_common::{global_metrics, Result, TsdqError};
use tsdq_planner::PhysicalPlan;
use tsdq_sql::Statement;
use tsdq_storage::{FieldMeta, TimeSeriesEvent};

use crate::grpc::v1::TaskResponse;
use crate::merger::ResultMerger;
use crate::task_manager::TaskManager;

/// Terminal output of a statement.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryEvent {
    Series(TimeSeriesEvent),
    Metadata(Vec<String>),
    Fields(Vec<FieldMeta>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Root,
    Intermediate,
}

impl TaskType {
    pub fn role(self) -> &'static str {
        match self {
            TaskType::Root => "root",
            TaskType::Intermediate => "intermediate",
        }
    }
}

/// One task on one node.
///
/// On the root the context expects one completion per direct child (an
/// intermediate, or a leaf when the plan has no intermediates) and feeds the
/// job's result channel. On an intermediate it expects one completion per
/// leaf and forwards its merged output to the root. Acknowledgements from
/// intermediates are counted separately so the root can hold leaf requests
/// back until every intermediate context exists.
pub struct TaskContext {
    task_id: String,
    task_type: TaskType,
    parent_task_id: String,
    parent_node: String,
    expect_results: AtomicI32,
    terminal: AtomicBool,
    error: OnceLock<String>,
    merger: ResultMerger,
    finished: CancellationToken,
    acks: Semaphore,
    created: Instant,
}

impl TaskContext {
    pub fn new(
        task_id: impl Into<String>,
        task_type: TaskType,
        parent_task_id: impl Into<String>,
        parent_node: impl Into<String>,
        expect_results: i32,
        merger: ResultMerger,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            task_type,
            parent_task_id: parent_task_id.into(),
            parent_node: parent_node.into(),
            expect_results: AtomicI32::new(expect_results),
            terminal: AtomicBool::new(false),
            error: OnceLock::new(),
            merger,
            finished: CancellationToken::new(),
            acks: Semaphore::new(0),
            created: Instant::now(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub fn parent_task_id(&self) -> &str {
        &self.parent_task_id
    }

    pub fn parent_node(&self) -> &str {
        &self.parent_node
    }

    pub fn merger(&self) -> &ResultMerger {
        &self.merger
    }

    pub fn expect_results(&self) -> i32 {
        self.expect_results.load(Ordering::SeqCst)
    }

    /// True once every expected completion has arrived or an error latched.
    pub fn completed(&self) -> bool {
        self.expect_results() <= 0
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::SeqCst)
    }

    /// First error observed by this task, if any.
    pub fn error(&self) -> Option<&str> {
        self.error.get().map(String::as_str)
    }

    /// Cancelled when the task reaches its terminal state.
    pub fn finished(&self) -> CancellationToken {
        self.finished.clone()
    }

    /// Records that one intermediate registered its context for this task.
    pub fn acknowledge(&self) {
        self.acks.add_permits(1);
    }

    /// Waits for `expected` acknowledgements. Fails if the task reaches its
    /// terminal state first or `deadline` passes.
    pub async fn wait_acks(&self, expected: u32, deadline: tokio::time::Instant) -> Result<()> {
        if expected == 0 {
            return Ok(());
        }
        tokio::select! {
            _ = self.finished.cancelled() => Err(TsdqError::Execution(format!(
                "task {} finished before intermediates acknowledged",
                self.task_id
            ))),
            acquired = tokio::time::timeout_at(deadline, self.acks.acquire_many(expected)) => match acquired {
                Ok(Ok(permits)) => {
                    permits.forget();
                    Ok(())
                }
                Ok(Err(_)) => Err(TsdqError::Cancelled),
                Err(_) => Err(TsdqError::Timeout(format!(
                    "task {} waiting for intermediates",
                    self.task_id
                ))),
            },
        }
    }

    /// Applies one response. Returns true if this call moved the task to its
    /// terminal state; the caller then removes it from the task manager.
    pub fn receive_result(&self, resp: &TaskResponse) -> bool {
        if self.is_terminal() {
            debug!(task_id = %self.task_id, from = %resp.send_node, "late response dropped");
            return false;
        }
        if !resp.err_msg.is_empty() {
            return self.terminate(Some(TsdqError::Remote(resp.err_msg.clone())));
        }
        if let Err(err) = self.merger.merge(resp) {
            return self.terminate(Some(err));
        }
        if resp.completed {
            let left = self.expect_results.fetch_sub(1, Ordering::SeqCst) - 1;
            if left <= 0 {
                return self.terminate(None);
            }
        }
        false
    }

    /// Latches `err` as the task outcome unless the task already finished.
    pub fn fail(&self, err: TsdqError) -> bool {
        self.terminate(Some(err))
    }

    fn terminate(&self, err: Option<TsdqError>) -> bool {
        if self
            .terminal
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let ok = err.is_none();
        if let Some(err) = &err {
            let _ = self.error.set(err.to_string());
            self.expect_results.store(0, Ordering::SeqCst);
        }
        info!(
            task_id = %self.task_id,
            role = self.task_type.role(),
            ok,
            error = self.error().unwrap_or(""),
            "task finished"
        );
        global_metrics().record_task_finished(
            self.task_type.role(),
            ok,
            self.created.elapsed().as_secs_f64(),
        );
        self.merger.finish(err);
        self.finished.cancel();
        true
    }
}

/// Caller-facing state of one statement on the root broker.
///
/// Holds the parsed statement, its plan (absent for statements the broker
/// answers itself) and the overall deadline. Child task contexts are
/// attached with [`JobContext::add_child`]; [`JobContext::cancel`] fails
/// them all so responses still in flight are dropped.
pub struct JobContext {
    statement: Statement,
    plan: Option<PhysicalPlan>,
    deadline: tokio::time::Instant,
    cancel: CancellationToken,
    task_manager: Arc<TaskManager>,
    children: Mutex<Vec<Arc<TaskContext>>>,
}

impl JobContext {
    pub fn new(
        statement: Statement,
        plan: Option<PhysicalPlan>,
        deadline: tokio::time::Instant,
        task_manager: Arc<TaskManager>,
    ) -> Self {
        Self {
            statement,
            plan,
            deadline,
            cancel: CancellationToken::new(),
            task_manager,
            children: Mutex::new(Vec::new()),
        }
    }

    pub fn statement(&self) -> &Statement {
        &self.statement
    }

    pub fn plan(&self) -> Option<&PhysicalPlan> {
        self.plan.as_ref()
    }

    pub fn deadline(&self) -> tokio::time::Instant {
        self.deadline
    }

    pub fn add_child(&self, ctx: Arc<TaskContext>) {
        self.children.lock().push(ctx);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Aborts the job: unblocks the reader and latches every child task so
    /// later responses are dropped.
    pub fn cancel(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let children = std::mem::take(&mut *self.children.lock());
        for child in children {
            if child.fail(TsdqError::Cancelled) {
                self.task_manager.complete(child.task_id());
            }
        }
    }
}

/// Reader side of a job's result channel. Dropping the handle cancels the
/// job.
pub struct JobHandle {
    events: mpsc::Receiver<Result<QueryEvent>>,
    job: Arc<JobContext>,
}

impl JobHandle {
    pub fn new(events: mpsc::Receiver<Result<QueryEvent>>, job: Arc<JobContext>) -> Self {
        Self { events, job }
    }

    pub fn job(&self) -> &Arc<JobContext> {
        &self.job
    }

    /// Next event, or `None` once the channel is closed or the job cancelled.
    pub async fn recv(&mut self) -> Option<Result<QueryEvent>> {
        let cancelled = self.job.cancel_token();
        tokio::select! {
            biased;
            _ = cancelled.cancelled() => {
                self.events.close();
                None
            }
            event = self.events.recv() => event,
        }
    }

    /// Waits for the terminal event of the job.
    pub async fn first(mut self) -> Result<QueryEvent> {
        match self.recv().await {
            Some(event) => event,
            None => Err(TsdqError::Cancelled),
        }
    }

    pub fn cancel(&self) {
        self.job.cancel();
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        self.job.cancel();
    }
}

/// Channel sized for the single terminal event of a job.
pub fn job_channel() -> (
    mpsc::Sender<Result<QueryEvent>>,
    mpsc::Receiver<Result<QueryEvent>>,
) {
    mpsc::channel(1)
}
