//! Tag value search over a stub storage engine whose index returns fixed
//! bitmaps, so the search pipeline is exercised without real data.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use roaring::RoaringBitmap;
use tsdq_common::{Result, ShardId, TsdqError};
use tsdq_distributed::metadata_executor::{MetadataExecutor, MetadataResult};
use tsdq_sql::{parse_statement, Expr, Metadata, Statement};
use tsdq_storage::{
    Database, FieldMeta, GroupingContext, IndexDatabase, MetadataDatabase, MetricId, ScanRequest,
    ScannedSeries, Shard, TagKeyId, TagKeyMeta, TagMetadata,
};

const HOST_KEY: TagKeyId = 7;

fn bitmap(ids: &[u32]) -> RoaringBitmap {
    ids.iter().copied().collect()
}

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
        match tag_key {
            "host" => Ok(HOST_KEY),
            "zone" => Ok(HOST_KEY + 1),
            other => Err(TsdqError::Execution(format!("tag key not found: {other}"))),
        }
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
        Ok(bitmap(&[1]))
    }

    fn suggest_tag_values(&self, _id: TagKeyId, _prefix: &str, _limit: usize) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn collect_tag_values(
        &self,
        tag_key_id: TagKeyId,
        tag_value_ids: &RoaringBitmap,
        out: &mut BTreeMap<u32, String>,
    ) -> Result<()> {
        assert_eq!(tag_key_id, HOST_KEY);
        for (id, value) in [(12, "a"), (13, "b"), (14, "c"), (15, "d")] {
            if tag_value_ids.contains(id) {
                out.insert(id, value.to_string());
            }
        }
        Ok(())
    }
}

struct StubGrouping;

impl GroupingContext for StubGrouping {
    fn scan_tag_value_ids(&self, _series_ids: &RoaringBitmap) -> Vec<RoaringBitmap> {
        vec![bitmap(&[12, 13, 14, 15])]
    }
}

#[derive(Default)]
struct StubIndex {
    grouping_calls: AtomicUsize,
}

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
        Ok(bitmap(&[1, 2, 3]))
    }

    fn get_series_ids_for_metric(&self, _metric_id: MetricId) -> Result<RoaringBitmap> {
        Ok(bitmap(&[1, 2, 3, 4]))
    }

    fn get_grouping_context(
        &self,
        tag_key_ids: &[TagKeyId],
        series_ids: &RoaringBitmap,
    ) -> Result<Box<dyn GroupingContext>> {
        assert_eq!(tag_key_ids, &[HOST_KEY]);
        assert_eq!(*series_ids, bitmap(&[1, 2, 3]));
        self.grouping_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubGrouping))
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
        Ok(Vec::new())
    }
}

struct StubDatabase {
    shard: Arc<StubShard>,
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
        (shard_id == self.shard.id).then(|| Arc::clone(&self.shard) as Arc<dyn Shard>)
    }
}

fn database() -> (Arc<StubDatabase>, Arc<StubShard>) {
    let shard = Arc::new(StubShard {
        id: 1,
        index: StubIndex::default(),
    });
    (
        Arc::new(StubDatabase {
            shard: Arc::clone(&shard),
        }),
        shard,
    )
}

fn metadata(sql: &str) -> Metadata {
    match parse_statement(sql).expect("parse") {
        Statement::Metadata(m) => m,
        other => panic!("not a metadata statement: {other:?}"),
    }
}

#[test]
fn conditional_tag_values_are_limited() {
    let (db, shard) = database();
    let md = metadata("show tag values from cpu with key = host where zone = 'sh' limit 2");
    let result = MetadataExecutor::new(db, vec![1, 2], md)
        .execute()
        .expect("execute");
    let MetadataResult::Values(values) = result else {
        panic!("expected values, got {result:?}");
    };
    assert_eq!(values.len(), 2);
    for v in &values {
        assert!(["a", "b", "c", "d"].contains(&v.as_str()), "unexpected value {v}");
    }
    assert_eq!(shard.index.grouping_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn conditional_tag_values_without_limit_return_all() {
    let (db, _shard) = database();
    let md = metadata("show tag values from cpu with key = host where zone = 'sh' or zone = 'bj'");
    let result = MetadataExecutor::new(db, vec![1], md)
        .execute()
        .expect("execute");
    assert_eq!(
        result,
        MetadataResult::Values(vec!["a".into(), "b".into(), "c".into(), "d".into()])
    );
}

#[test]
fn unknown_tag_key_in_condition_fails() {
    let (db, _shard) = database();
    let md = metadata("show tag values from cpu with key = host where region = 'sh'");
    let err = MetadataExecutor::new(db, vec![1], md)
        .execute()
        .expect_err("unknown tag key");
    assert!(err.to_string().contains("tag key not found"), "{err}");
}
