//! Storage-side metadata suggest.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use roaring::RoaringBitmap;
use tracing::debug;
use tsdq_common::{Result, ShardId, TsdqError};
use tsdq_sql::{Expr, Metadata, MetadataType};
use tsdq_storage::{Database, FieldMeta};

use crate::search::{SeriesSearch, TagSearch};

/// Result of one leaf's metadata suggest, before it is put on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataResult {
    Values(Vec<String>),
    Fields(Vec<FieldMeta>),
}

impl MetadataResult {
    /// JSON array payload understood by the metadata merger.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        let encoded = match self {
            MetadataResult::Values(values) => serde_json::to_vec(values),
            MetadataResult::Fields(fields) => serde_json::to_vec(fields),
        };
        encoded.map_err(|e| TsdqError::Protocol(format!("encode metadata result: {e}")))
    }
}

pub struct MetadataExecutor {
    database: Arc<dyn Database>,
    shard_ids: Vec<ShardId>,
    metadata: Metadata,
}

impl MetadataExecutor {
    pub fn new(database: Arc<dyn Database>, shard_ids: Vec<ShardId>, metadata: Metadata) -> Self {
        Self {
            database,
            shard_ids,
            metadata,
        }
    }

    pub fn execute(&self) -> Result<MetadataResult> {
        let m = &self.metadata;
        let meta = self.database.metadata();
        let result = match m.metadata_type {
            MetadataType::Database => {
                return Err(TsdqError::Unsupported(
                    "database listing is answered by the broker".to_string(),
                ))
            }
            MetadataType::Namespace => {
                MetadataResult::Values(meta.suggest_namespace(&m.prefix, m.limit)?)
            }
            MetadataType::Metric => {
                MetadataResult::Values(meta.suggest_metrics(&m.namespace, &m.prefix, m.limit)?)
            }
            MetadataType::TagKey => {
                let keys = meta
                    .get_all_tag_keys(&m.namespace, &m.metric_name)?
                    .into_iter()
                    .map(|k| k.key)
                    .filter(|k| k.starts_with(&m.prefix));
                MetadataResult::Values(bounded(keys, m.limit))
            }
            MetadataType::Field => {
                MetadataResult::Fields(meta.get_all_fields(&m.namespace, &m.metric_name)?)
            }
            MetadataType::TagValue => match &m.condition {
                None => MetadataResult::Values(self.suggest_tag_values()?),
                Some(condition) => MetadataResult::Values(self.search_tag_values(condition)?),
            },
        };
        Ok(result)
    }

    fn suggest_tag_values(&self) -> Result<Vec<String>> {
        let m = &self.metadata;
        let mut values = BTreeSet::new();
        for shard_id in &self.shard_ids {
            let Some(shard) = self.database.get_shard(*shard_id) else {
                debug!(shard_id, database = self.database.name(), "shard not on this node");
                continue;
            };
            values.extend(shard.index_database().suggest_tag_values(
                &m.namespace,
                &m.metric_name,
                &m.tag_key,
                &m.prefix,
                m.limit,
            )?);
        }
        Ok(bounded(values.into_iter(), m.limit))
    }

    /// Values of `tag_key` carried by the series the condition selects, in
    /// ascending tag value id order.
    fn search_tag_values(&self, condition: &Expr) -> Result<Vec<String>> {
        let m = &self.metadata;
        let meta = self.database.metadata();
        let tag_key_id = meta.get_tag_key_id(&m.namespace, &m.metric_name, &m.tag_key)?;
        let metric_id = meta.get_metric_id(&m.namespace, &m.metric_name)?;
        let filter_results = TagSearch::new(
            &m.namespace,
            &m.metric_name,
            condition,
            meta,
            self.database.tag_metadata(),
        )
        .filter()?;

        let mut tag_value_ids = RoaringBitmap::new();
        for shard_id in &self.shard_ids {
            let Some(shard) = self.database.get_shard(*shard_id) else {
                continue;
            };
            let index = shard.index_database();
            let series_ids = SeriesSearch::new(index, &filter_results, metric_id).search(condition)?;
            if series_ids.is_empty() {
                continue;
            }
            let grouping = index.get_grouping_context(&[tag_key_id], &series_ids)?;
            for ids in grouping.scan_tag_value_ids(&series_ids) {
                tag_value_ids |= ids;
            }
        }
        if tag_value_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut values = BTreeMap::new();
        self.database
            .tag_metadata()
            .collect_tag_values(tag_key_id, &tag_value_ids, &mut values)?;
        Ok(bounded(values.into_values(), m.limit))
    }
}

fn bounded(items: impl Iterator<Item = String>, limit: usize) -> Vec<String> {
    let limit = if limit == 0 { usize::MAX } else { limit };
    items.take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsdq_sql::DEFAULT_NAMESPACE;
    use tsdq_storage::{FieldType, MemoryDatabase, Point};

    fn point(shard: ShardId, metric: &str, host: &str, zone: &str) -> Point {
        Point {
            shard,
            namespace: DEFAULT_NAMESPACE.to_string(),
            metric: metric.to_string(),
            tags: [
                ("host".to_string(), host.to_string()),
                ("zone".to_string(), zone.to_string()),
            ]
            .into_iter()
            .collect(),
            field: "usage".to_string(),
            field_type: FieldType::Sum,
            timestamp: 1,
            value: 1.0,
        }
    }

    fn database() -> Arc<dyn Database> {
        let mut db = MemoryDatabase::new("db");
        db.add_shard(1);
        db.add_shard(2);
        db.write(&point(1, "cpu", "a", "sh"));
        db.write(&point(1, "cpu", "b", "sh"));
        db.write(&point(2, "cpu", "c", "bj"));
        db.write(&point(2, "mem", "d", "bj"));
        Arc::new(db)
    }

    fn run(mut metadata: Metadata, shards: Vec<ShardId>) -> Result<MetadataResult> {
        metadata.metric_name = if metadata.metric_name.is_empty() {
            "cpu".to_string()
        } else {
            metadata.metric_name
        };
        MetadataExecutor::new(database(), shards, metadata).execute()
    }

    #[test]
    fn suggests_metrics_and_tag_keys() {
        let metrics = run(Metadata::new(MetadataType::Metric), vec![1, 2]).expect("metrics");
        assert_eq!(
            metrics,
            MetadataResult::Values(vec!["cpu".to_string(), "mem".to_string()])
        );

        let mut keys = Metadata::new(MetadataType::TagKey);
        keys.prefix = "h".to_string();
        assert_eq!(
            run(keys, vec![1]).expect("keys"),
            MetadataResult::Values(vec!["host".to_string()])
        );
    }

    #[test]
    fn tag_values_without_condition_union_shards_and_skip_missing() {
        let mut m = Metadata::new(MetadataType::TagValue);
        m.tag_key = "host".to_string();
        let values = run(m, vec![1, 2, 9]).expect("values");
        assert_eq!(
            values,
            MetadataResult::Values(vec!["a".into(), "b".into(), "c".into()])
        );
    }

    #[test]
    fn tag_values_with_condition() {
        let mut m = Metadata::new(MetadataType::TagValue);
        m.tag_key = "host".to_string();
        m.condition = Some(Expr::equals("zone", "sh"));
        m.limit = 1;
        assert_eq!(
            run(m, vec![1, 2]).expect("values"),
            MetadataResult::Values(vec!["a".to_string()])
        );
    }

    #[test]
    fn fields_encode_as_descriptors() {
        let result = run(Metadata::new(MetadataType::Field), vec![1]).expect("fields");
        let payload = result.to_payload().expect("encode");
        let decoded: Vec<FieldMeta> = serde_json::from_slice(&payload).expect("decode");
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].name, "usage");
    }

    #[test]
    fn database_listing_is_not_a_leaf_operation() {
        let err = run(Metadata::new(MetadataType::Database), vec![1]).expect_err("unsupported");
        assert!(matches!(err, TsdqError::Unsupported(_)));
    }
}
