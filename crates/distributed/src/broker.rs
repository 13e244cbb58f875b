//! Root-side statement execution on a broker.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{info, warn};
use tsdq_common::{Node, QueryConfig, Result, TsdqError};
use tsdq_planner::{explain, PhysicalPlanner};
use tsdq_sql::{MetadataType, Statement};

use crate::cluster::ClusterState;
use crate::context::{job_channel, JobContext, JobHandle, QueryEvent, TaskContext, TaskType};
use crate::grpc::v1::{RequestType, TaskRequest};
use crate::merger::ResultMerger;
use crate::task_manager::{spawn_deadline_watch, TaskManager};

/// Roots statements on this broker.
///
/// For each statement the executor plans against the current cluster view,
/// registers a root [`TaskContext`] and sends one request per plan node:
/// intermediates first, then, once every intermediate has acknowledged its
/// context, the leaves. The caller reads the single terminal event from the
/// returned [`JobHandle`].
pub struct BrokerExecutor {
    planner: PhysicalPlanner,
    cluster: Arc<dyn ClusterState>,
    task_manager: Arc<TaskManager>,
    config: QueryConfig,
}

impl BrokerExecutor {
    pub fn new(
        cluster: Arc<dyn ClusterState>,
        task_manager: Arc<TaskManager>,
        config: QueryConfig,
    ) -> Self {
        Self {
            planner: PhysicalPlanner::new(task_manager.current().clone()),
            cluster,
            task_manager,
            config,
        }
    }

    pub fn current(&self) -> &Node {
        self.planner.current()
    }

    /// Plans `statement` against `db` and fans it out. Planning failures are
    /// returned directly; everything after surfaces as the job's single
    /// terminal event.
    pub async fn execute(&self, db: &str, statement: Statement) -> Result<JobHandle> {
        let deadline = Instant::now() + self.config.timeout();
        let (events, rx) = job_channel();

        if let Statement::Metadata(m) = &statement {
            if m.metadata_type == MetadataType::Database {
                let names = self.cluster.list_databases()?;
                let job = Arc::new(JobContext::new(
                    statement,
                    None,
                    deadline,
                    Arc::clone(&self.task_manager),
                ));
                let _ = events.try_send(Ok(QueryEvent::Metadata(names)));
                return Ok(JobHandle::new(rx, job));
            }
        }

        let database = self
            .cluster
            .database(db)
            .ok_or_else(|| TsdqError::Planning(format!("database not found: {db}")))?;
        let (plan, merger, request_type) = match &statement {
            Statement::Query(q) => (
                self.planner
                    .plan_query(&database, q, &self.cluster.live_brokers())?,
                ResultMerger::root(q, events),
                RequestType::Data,
            ),
            Statement::Metadata(m) => (
                self.planner.plan_metadata(&database)?,
                ResultMerger::metadata(m, events),
                RequestType::Metadata,
            ),
        };
        let physical_plan = plan.to_json_bytes()?;
        let payload = statement.to_json_bytes()?;
        let intermediates: Vec<String> = plan
            .intermediates
            .iter()
            .map(|i| i.base.indicator.clone())
            .collect();
        let leaves: Vec<String> = plan.leaves.iter().map(|l| l.base.indicator.clone()).collect();

        let task_id = self.task_manager.alloc_task_id();
        info!(task_id = %task_id, database = db, plan = %explain(&plan), "statement planned");
        let ctx = Arc::new(TaskContext::new(
            &task_id,
            TaskType::Root,
            "",
            "",
            plan.root.num_of_task,
            merger,
        ));
        let job = Arc::new(JobContext::new(
            statement,
            Some(plan),
            deadline,
            Arc::clone(&self.task_manager),
        ));
        job.add_child(Arc::clone(&ctx));
        self.task_manager.submit(Arc::clone(&ctx));
        spawn_deadline_watch(Arc::clone(&self.task_manager), Arc::clone(&ctx), deadline);
        let handle = JobHandle::new(rx, Arc::clone(&job));

        let parent_node = self.current().indicator();
        let request_for = |target: &str| TaskRequest {
            request_id: format!("{task_id}@{target}"),
            parent_task_id: task_id.clone(),
            parent_node: parent_node.clone(),
            request_type: request_type as i32,
            physical_plan: physical_plan.clone(),
            payload: payload.clone(),
            timeout_ms: deadline.saturating_duration_since(Instant::now()).as_millis() as i64,
        };

        // Leaves answer intermediates directly, so every intermediate context
        // must exist before the first leaf request goes out.
        if self.fan_out(&job, &ctx, &intermediates, &request_for, deadline).await {
            match ctx.wait_acks(intermediates.len() as u32, deadline).await {
                Ok(()) => {
                    self.fan_out(&job, &ctx, &leaves, &request_for, deadline).await;
                }
                Err(err) => {
                    warn!(task_id = %task_id, error = %err, "intermediates not ready");
                    if ctx.fail(err) {
                        self.task_manager.complete(&task_id);
                    }
                }
            }
        }
        Ok(handle)
    }

    /// Sends one request per target. Returns false if sending stopped early
    /// because the job ended or a send failed; a failed send fails `ctx`.
    async fn fan_out(
        &self,
        job: &JobContext,
        ctx: &TaskContext,
        targets: &[String],
        request_for: &(dyn Fn(&str) -> TaskRequest + Sync),
        deadline: Instant,
    ) -> bool {
        for target in targets {
            if job.is_cancelled() || ctx.is_terminal() {
                return false;
            }
            if let Err(err) = self
                .task_manager
                .send_request(target, request_for(target), deadline)
                .await
            {
                warn!(task_id = ctx.task_id(), target = %target, error = %err, "send task request failed");
                if ctx.fail(err) {
                    self.task_manager.complete(ctx.task_id());
                }
                return false;
            }
        }
        true
    }
}
