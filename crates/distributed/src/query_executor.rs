//! Storage-side data query: filter, scan and partially aggregate the shards
//! assigned to one leaf.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use roaring::RoaringBitmap;
use tracing::debug;
use tsdq_common::{Result, ShardId};
use tsdq_sql::Query;
use tsdq_storage::{Database, ScanRequest, TimeSeries};

use crate::aggregate::{bucket_of, GroupAggregator};
use crate::search::{SeriesSearch, TagFilterResults, TagSearch};

pub struct QueryExecutor {
    database: Arc<dyn Database>,
    shard_ids: Vec<ShardId>,
    query: Query,
}

impl QueryExecutor {
    pub fn new(database: Arc<dyn Database>, shard_ids: Vec<ShardId>, query: Query) -> Self {
        Self {
            database,
            shard_ids,
            query,
        }
    }

    /// Partial groups of this leaf ordered by group key. No limit is applied
    /// here: a group may also receive points from other leaves.
    pub fn execute(&self) -> Result<Vec<TimeSeries>> {
        let q = &self.query;
        let meta = self.database.metadata();
        let metric_id = meta.get_metric_id(&q.namespace, &q.metric_name)?;
        let filter_results: Option<TagFilterResults> = match &q.condition {
            Some(condition) => Some(
                TagSearch::new(
                    &q.namespace,
                    &q.metric_name,
                    condition,
                    meta,
                    self.database.tag_metadata(),
                )
                .filter()?,
            ),
            None => None,
        };
        let fields: Vec<String> = q
            .field_names()
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(str::to_string)
            .collect();

        let mut aggregator = GroupAggregator::new(q);
        for shard_id in &self.shard_ids {
            let Some(shard) = self.database.get_shard(*shard_id) else {
                debug!(shard_id, database = self.database.name(), "shard not on this node");
                continue;
            };
            let index = shard.index_database();
            let series_ids: RoaringBitmap = match (&q.condition, &filter_results) {
                (Some(condition), Some(results)) => {
                    SeriesSearch::new(index, results, metric_id).search(condition)?
                }
                _ => index.get_series_ids_for_metric(metric_id)?,
            };
            if series_ids.is_empty() {
                continue;
            }
            let scanned = shard.scan(&ScanRequest {
                metric_id,
                series_ids,
                fields: fields.clone(),
                time_range: q.time_range,
            })?;
            for series in scanned {
                let tags = group_tags(q, &series.tags);
                for (field, points) in &series.points {
                    for (ts, value) in points {
                        aggregator.add_point(&tags, field, bucket_of(q, *ts), *value);
                    }
                }
            }
        }
        Ok(aggregator.take_series(0))
    }
}

/// Projects series tags onto the group-by keys; a missing key groups as "".
fn group_tags(query: &Query, tags: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    query
        .group_by
        .iter()
        .map(|key| (key.clone(), tags.get(key).cloned().unwrap_or_default()))
        .collect()
}
