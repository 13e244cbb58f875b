use std::collections::BTreeMap;
use std::sync::Arc;

use roaring::RoaringBitmap;
use tsdq_common::{Result, ShardId};
use tsdq_sql::Expr;

use crate::series::{FieldMeta, MetricId, ScanRequest, ScannedSeries, TagKeyId, TagKeyMeta};

/// Entry point into a storage node's local databases.
pub trait Engine: Send + Sync {
    fn get_database(&self, name: &str) -> Option<Arc<dyn Database>>;

    fn database_names(&self) -> Vec<String>;
}

/// One database on a storage node: global metadata plus the local shards.
pub trait Database: Send + Sync {
    fn name(&self) -> &str;

    fn metadata(&self) -> &dyn MetadataDatabase;

    fn tag_metadata(&self) -> &dyn TagMetadata;

    /// Returns `None` if the shard is not hosted on this node.
    fn get_shard(&self, shard_id: ShardId) -> Option<Arc<dyn Shard>>;
}

/// Namespace/metric/tag-key/field dictionary of a database.
///
/// Lookups of unknown names fail with an execution error naming the missing
/// entity; suggest calls on unknown names return empty lists.
pub trait MetadataDatabase: Send + Sync {
    fn suggest_namespace(&self, prefix: &str, limit: usize) -> Result<Vec<String>>;

    fn suggest_metrics(&self, namespace: &str, prefix: &str, limit: usize) -> Result<Vec<String>>;

    fn get_metric_id(&self, namespace: &str, metric_name: &str) -> Result<MetricId>;

    fn get_tag_key_id(&self, namespace: &str, metric_name: &str, tag_key: &str)
        -> Result<TagKeyId>;

    fn get_all_tag_keys(&self, namespace: &str, metric_name: &str) -> Result<Vec<TagKeyMeta>>;

    fn get_all_fields(&self, namespace: &str, metric_name: &str) -> Result<Vec<FieldMeta>>;
}

/// Tag value dictionary: maps tag values to ids per tag key and back.
pub trait TagMetadata: Send + Sync {
    /// Ids of the values of `tag_key_id` selected by a leaf predicate.
    fn find_tag_value_ids(&self, tag_key_id: TagKeyId, expr: &Expr) -> Result<RoaringBitmap>;

    fn suggest_tag_values(&self, tag_key_id: TagKeyId, prefix: &str, limit: usize)
        -> Result<Vec<String>>;

    /// Resolves `tag_value_ids` to strings, inserting into `out` keyed by id.
    fn collect_tag_values(
        &self,
        tag_key_id: TagKeyId,
        tag_value_ids: &RoaringBitmap,
        out: &mut BTreeMap<u32, String>,
    ) -> Result<()>;
}

/// A horizontal partition of a database's series.
pub trait Shard: Send + Sync {
    fn id(&self) -> ShardId;

    fn index_database(&self) -> &dyn IndexDatabase;

    /// Reads raw points for the requested series and fields.
    ///
    /// # Errors
    /// Returns an error for unreadable shard data.
    fn scan(&self, request: &ScanRequest) -> Result<Vec<ScannedSeries>>;
}

/// Per-shard inverted index from tag values to series ids.
pub trait IndexDatabase: Send + Sync {
    fn suggest_tag_values(
        &self,
        namespace: &str,
        metric_name: &str,
        tag_key: &str,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<String>>;

    /// Series carrying `tag_key_id` with one of `tag_value_ids`.
    fn get_series_ids(
        &self,
        tag_key_id: TagKeyId,
        tag_value_ids: &RoaringBitmap,
    ) -> Result<RoaringBitmap>;

    /// Every series of a metric; the universe used to complement `not` filters.
    fn get_series_ids_for_metric(&self, metric_id: MetricId) -> Result<RoaringBitmap>;

    fn get_grouping_context(
        &self,
        tag_key_ids: &[TagKeyId],
        series_ids: &RoaringBitmap,
    ) -> Result<Box<dyn GroupingContext>>;
}

/// Maps series ids to tag value ids for a fixed list of tag keys.
pub trait GroupingContext: Send {
    /// One bitmap of tag value ids per tag key passed to
    /// [`IndexDatabase::get_grouping_context`], in the same order.
    fn scan_tag_value_ids(&self, series_ids: &RoaringBitmap) -> Vec<RoaringBitmap>;
}
