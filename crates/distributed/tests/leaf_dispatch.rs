//! Leaf requests served by a storage node whose stub shards panic or stall,
//! driven over one task stream the way a broker would use it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use roaring::RoaringBitmap;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;
use tsdq_common::{Node, QueryConfig, Result, ShardId, TsdqError};
use tsdq_distributed::grpc::v1::{RequestType, TaskRequest, TaskResponse};
use tsdq_distributed::StorageNode;
use tsdq_planner::{BaseNode, Leaf, PhysicalPlan, Root};
use tsdq_sql::{parse_statement, Expr};
use tsdq_storage::{
    Database, Engine, FieldMeta, GroupingContext, IndexDatabase, MetadataDatabase, MetricId,
    ScanRequest, ScannedSeries, Shard, TagKeyId, TagKeyMeta, TagMetadata,
};

const BROKER: &str = "1.1.2.1:8000";
const STORAGE: &str = "1.1.1.1:9000";

const PANICKING_SHARD: ShardId = 1;
const SLOW_SHARD: ShardId = 2;
const HEALTHY_SHARD: ShardId = 3;

struct StubMetadata;

impl MetadataDatabase for StubMetadata {
    fn suggest_namespace(&self, _prefix: &str, _limit: usize) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn suggest_metrics(&self, _ns: &str, _prefix: &str, _limit: usize) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn get_metric_id(&self, _ns: &str, metric_name: &str) -> Result<MetricId> {
        match metric_name {
            "cpu" => Ok(1),
            other => Err(TsdqError::Execution(format!("metric not found: {other}"))),
        }
    }

    fn get_tag_key_id(&self, _ns: &str, _metric: &str, tag_key: &str) -> Result<TagKeyId> {
        Err(TsdqError::Execution(format!("tag key not found: {tag_key}")))
    }

    fn get_all_tag_keys(&self, _ns: &str, _metric: &str) -> Result<Vec<TagKeyMeta>> {
        Ok(Vec::new())
    }

    fn get_all_fields(&self, _ns: &str, _metric: &str) -> Result<Vec<FieldMeta>> {
        Ok(Vec::new())
    }
}

struct StubTags;

impl TagMetadata for StubTags {
    fn find_tag_value_ids(&self, _tag_key_id: TagKeyId, _expr: &Expr) -> Result<RoaringBitmap> {
        Ok(RoaringBitmap::new())
    }

    fn suggest_tag_values(&self, _id: TagKeyId, _prefix: &str, _limit: usize) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn collect_tag_values(
        &self,
        _tag_key_id: TagKeyId,
        _tag_value_ids: &RoaringBitmap,
        _out: &mut BTreeMap<u32, String>,
    ) -> Result<()> {
        Ok(())
    }
}

struct StubIndex;

impl IndexDatabase for StubIndex {
    fn suggest_tag_values(
        &self,
        _ns: &str,
        _metric: &str,
        _tag_key: &str,
        _prefix: &str,
        _limit: usize,
    ) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn get_series_ids(&self, _id: TagKeyId, _values: &RoaringBitmap) -> Result<RoaringBitmap> {
        Ok(RoaringBitmap::new())
    }

    fn get_series_ids_for_metric(&self, _metric_id: MetricId) -> Result<RoaringBitmap> {
        Ok((1..=2).collect())
    }

    fn get_grouping_context(
        &self,
        _tag_key_ids: &[TagKeyId],
        _series_ids: &RoaringBitmap,
    ) -> Result<Box<dyn GroupingContext>> {
        Err(TsdqError::Execution("no grouping index".to_string()))
    }
}

struct StubShard {
    id: ShardId,
    index: StubIndex,
}

impl Shard for StubShard {
    fn id(&self) -> ShardId {
        self.id
    }

    fn index_database(&self) -> &dyn IndexDatabase {
        &self.index
    }

    fn scan(&self, _request: &ScanRequest) -> Result<Vec<ScannedSeries>> {
        match self.id {
            PANICKING_SHARD => panic!("shard {} block index corrupted", self.id),
            SLOW_SHARD => {
                std::thread::sleep(Duration::from_millis(400));
                Ok(Vec::new())
            }
            _ => Ok(Vec::new()),
        }
    }
}

struct StubDatabase {
    shards: Vec<Arc<StubShard>>,
}

impl Database for StubDatabase {
    fn name(&self) -> &str {
        "db"
    }

    fn metadata(&self) -> &dyn MetadataDatabase {
        &StubMetadata
    }

    fn tag_metadata(&self) -> &dyn TagMetadata {
        &StubTags
    }

    fn get_shard(&self, shard_id: ShardId) -> Option<Arc<dyn Shard>> {
        self.shards
            .iter()
            .find(|s| s.id == shard_id)
            .map(|s| Arc::clone(s) as Arc<dyn Shard>)
    }
}

struct StubEngine {
    database: Arc<StubDatabase>,
}

impl Engine for StubEngine {
    fn get_database(&self, name: &str) -> Option<Arc<dyn Database>> {
        (name == "db").then(|| Arc::clone(&self.database) as Arc<dyn Database>)
    }

    fn database_names(&self) -> Vec<String> {
        vec!["db".to_string()]
    }
}

fn node(s: &str) -> Node {
    s.parse().expect("node")
}

/// A storage node with one inbound stream from [`BROKER`] already accepted.
struct LeafStream {
    requests: mpsc::Sender<TaskRequest>,
    responses: mpsc::Receiver<std::result::Result<TaskResponse, Status>>,
    _storage: StorageNode,
}

fn start(timeout_ms: u64) -> LeafStream {
    let engine = StubEngine {
        database: Arc::new(StubDatabase {
            shards: [PANICKING_SHARD, SLOW_SHARD, HEALTHY_SHARD]
                .into_iter()
                .map(|id| Arc::new(StubShard { id, index: StubIndex }))
                .collect(),
        }),
    };
    let storage = StorageNode::new(
        node(STORAGE),
        Arc::new(engine),
        QueryConfig {
            max_workers: 2,
            timeout_ms,
        },
    );
    let (req_tx, req_rx) = mpsc::channel(16);
    let (resp_tx, resp_rx) = mpsc::channel(16);
    let epoch = storage.handler.accept(BROKER, resp_tx);
    let handler = storage.handler.clone();
    let requests = ReceiverStream::new(req_rx).map(Ok::<_, TsdqError>).boxed();
    tokio::spawn(async move { handler.handle(BROKER.to_string(), epoch, requests).await });
    LeafStream {
        requests: req_tx,
        responses: resp_rx,
        _storage: storage,
    }
}

fn request(task_id: &str, shard_id: ShardId) -> TaskRequest {
    let mut plan = PhysicalPlan::new(
        "db",
        Root {
            indicator: BROKER.to_string(),
            num_of_task: 1,
        },
    );
    plan.add_leaf(Leaf {
        base: BaseNode {
            parent: BROKER.to_string(),
            indicator: STORAGE.to_string(),
        },
        shard_ids: vec![shard_id],
        receivers: vec![node(BROKER)],
    });
    TaskRequest {
        request_id: format!("{task_id}@{STORAGE}"),
        parent_task_id: task_id.to_string(),
        parent_node: BROKER.to_string(),
        request_type: RequestType::Data as i32,
        physical_plan: plan.to_json_bytes().expect("plan"),
        payload: parse_statement("select sum(usage) from cpu")
            .expect("parse")
            .to_json_bytes()
            .expect("statement"),
        timeout_ms: 0,
    }
}

impl LeafStream {
    async fn send(&self, req: TaskRequest) {
        self.requests.send(req).await.expect("stream open");
    }

    async fn next(&mut self, wait: Duration) -> Option<TaskResponse> {
        match tokio::time::timeout(wait, self.responses.recv()).await {
            Ok(Some(resp)) => Some(resp.expect("response")),
            Ok(None) | Err(_) => None,
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_scan_reports_error_and_stream_keeps_serving() {
    let mut leaf = start(2_000);
    leaf.send(request("1.1.2.1:8000-1", PANICKING_SHARD)).await;
    let resp = leaf
        .next(Duration::from_secs(2))
        .await
        .expect("error response");
    assert_eq!(resp.task_id, "1.1.2.1:8000-1");
    assert!(resp.completed);
    assert!(resp.err_msg.contains("panicked"), "{}", resp.err_msg);
    assert!(resp.err_msg.contains("block index corrupted"), "{}", resp.err_msg);
    assert_eq!(resp.send_node, STORAGE);

    leaf.send(request("1.1.2.1:8000-2", HEALTHY_SHARD)).await;
    let resp = leaf
        .next(Duration::from_secs(2))
        .await
        .expect("data response");
    assert_eq!(resp.task_id, "1.1.2.1:8000-2");
    assert!(resp.completed);
    assert!(resp.err_msg.is_empty(), "{}", resp.err_msg);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scan_past_deadline_sends_nothing() {
    let mut leaf = start(100);
    leaf.send(request("1.1.2.1:8000-1", SLOW_SHARD)).await;
    assert!(leaf.next(Duration::from_millis(700)).await.is_none());

    leaf.send(request("1.1.2.1:8000-2", HEALTHY_SHARD)).await;
    let resp = leaf
        .next(Duration::from_secs(2))
        .await
        .expect("data response");
    assert_eq!(resp.task_id, "1.1.2.1:8000-2");
    assert!(resp.err_msg.is_empty(), "{}", resp.err_msg);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_database_is_rejected_to_the_sender() {
    let mut leaf = start(2_000);
    let mut req = request("1.1.2.1:8000-1", HEALTHY_SHARD);
    let mut plan = PhysicalPlan::from_json_bytes(&req.physical_plan).expect("plan");
    plan.database = "missing".to_string();
    req.physical_plan = plan.to_json_bytes().expect("plan");
    leaf.send(req).await;
    let resp = leaf
        .next(Duration::from_secs(2))
        .await
        .expect("error response");
    assert!(resp.err_msg.contains("database not found"), "{}", resp.err_msg);
}
