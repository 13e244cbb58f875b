//! In-memory implementation of the storage engine interfaces.
//!
//! Used by tests and by the demo storage node, which loads a JSON fixture of
//! points at startup. Ids are allocated densely per database in write order.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;
use roaring::RoaringBitmap;
use serde::Deserialize;
use tsdq_common::{Result, ShardId, TsdqError};
use tsdq_sql::{like_match, Expr, DEFAULT_NAMESPACE};

use crate::engine::{
    Database, Engine, GroupingContext, IndexDatabase, MetadataDatabase, Shard, TagMetadata,
};
use crate::series::{
    FieldId, FieldMeta, FieldType, MetricId, ScanRequest, ScannedSeries, SeriesId, TagKeyId,
    TagKeyMeta, TagValueId,
};

/// One written point.
#[derive(Debug, Clone, Deserialize)]
pub struct Point {
    pub shard: ShardId,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub metric: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub field: String,
    #[serde(default = "default_field_type")]
    pub field_type: FieldType,
    pub timestamp: i64,
    pub value: f64,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_field_type() -> FieldType {
    FieldType::Sum
}

#[derive(Debug, Deserialize)]
struct DatabaseFixture {
    name: String,
    #[serde(default)]
    shards: Vec<ShardId>,
    #[serde(default)]
    points: Vec<Point>,
}

#[derive(Default)]
pub struct MemoryEngine {
    databases: RwLock<BTreeMap<String, Arc<MemoryDatabase>>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_database(&self, database: MemoryDatabase) {
        self.databases
            .write()
            .insert(database.name.clone(), Arc::new(database));
    }

    /// Loads `[{"name": "...", "shards": [..], "points": [..]}, ...]`.
    pub fn load_from_json(path: &str) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        Self::from_json_str(&s)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let fixtures: Vec<DatabaseFixture> =
            serde_json::from_str(raw).map_err(|e| TsdqError::InvalidConfig(e.to_string()))?;
        let engine = MemoryEngine::new();
        for fixture in fixtures {
            let mut db = MemoryDatabase::new(fixture.name);
            for shard in fixture.shards {
                db.add_shard(shard);
            }
            for point in &fixture.points {
                db.write(point);
            }
            engine.add_database(db);
        }
        Ok(engine)
    }
}

impl Engine for MemoryEngine {
    fn get_database(&self, name: &str) -> Option<Arc<dyn Database>> {
        self.databases
            .read()
            .get(name)
            .map(|db| Arc::clone(db) as Arc<dyn Database>)
    }

    fn database_names(&self) -> Vec<String> {
        self.databases.read().keys().cloned().collect()
    }
}

pub struct MemoryDatabase {
    name: String,
    metadata: MemoryMetadata,
    tags: MemoryTagMetadata,
    shards: BTreeMap<ShardId, Arc<MemoryShard>>,
    series_ids: BTreeMap<(MetricId, Vec<(TagKeyId, TagValueId)>), SeriesId>,
}

impl MemoryDatabase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            metadata: MemoryMetadata::default(),
            tags: MemoryTagMetadata::default(),
            shards: BTreeMap::new(),
            series_ids: BTreeMap::new(),
        }
    }

    pub fn add_shard(&mut self, shard_id: ShardId) {
        self.shards
            .entry(shard_id)
            .or_insert_with(|| Arc::new(MemoryShard::new(shard_id)));
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.shards.keys().copied().collect()
    }

    /// Records a point; a later write to the same series, field and timestamp wins.
    pub fn write(&mut self, point: &Point) {
        let metric_id = self.metadata.metric(&point.namespace, &point.metric).id;
        self.metadata
            .field(&point.namespace, &point.metric, &point.field, point.field_type);

        let mut tag_ids = Vec::with_capacity(point.tags.len());
        for (key, value) in &point.tags {
            let key_id = self.metadata.tag_key(&point.namespace, &point.metric, key);
            let value_id = self.tags.value_id(key_id, value);
            tag_ids.push((key_id, value_id));
        }
        let next_id = self.series_ids.len() as SeriesId + 1;
        let series_id = *self
            .series_ids
            .entry((metric_id, tag_ids.clone()))
            .or_insert(next_id);

        let shard = self
            .shards
            .entry(point.shard)
            .or_insert_with(|| Arc::new(MemoryShard::new(point.shard)));
        // Shards are only shared after the database is handed to an engine.
        if let Some(shard) = Arc::get_mut(shard) {
            shard.write(
                SeriesKey {
                    namespace: &point.namespace,
                    metric: &point.metric,
                    metric_id,
                    series_id,
                },
                &point.tags,
                &tag_ids,
                &point.field,
                point.timestamp,
                point.value,
            );
        }
    }
}

impl Database for MemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn metadata(&self) -> &dyn MetadataDatabase {
        &self.metadata
    }

    fn tag_metadata(&self) -> &dyn TagMetadata {
        &self.tags
    }

    fn get_shard(&self, shard_id: ShardId) -> Option<Arc<dyn Shard>> {
        self.shards
            .get(&shard_id)
            .map(|s| Arc::clone(s) as Arc<dyn Shard>)
    }
}

#[derive(Debug, Clone)]
struct MetricEntry {
    id: MetricId,
    tag_keys: BTreeMap<String, TagKeyId>,
    fields: BTreeMap<String, FieldMeta>,
}

#[derive(Debug, Default)]
struct MemoryMetadata {
    namespaces: BTreeMap<String, BTreeMap<String, MetricEntry>>,
    next_metric_id: MetricId,
    next_tag_key_id: TagKeyId,
}

impl MemoryMetadata {
    fn metric(&mut self, namespace: &str, metric: &str) -> &mut MetricEntry {
        let next = &mut self.next_metric_id;
        self.namespaces
            .entry(namespace.to_string())
            .or_default()
            .entry(metric.to_string())
            .or_insert_with(|| {
                *next += 1;
                MetricEntry {
                    id: *next,
                    tag_keys: BTreeMap::new(),
                    fields: BTreeMap::new(),
                }
            })
    }

    fn tag_key(&mut self, namespace: &str, metric: &str, key: &str) -> TagKeyId {
        let mut next = self.next_tag_key_id;
        let entry = self.metric(namespace, metric);
        let id = *entry.tag_keys.entry(key.to_string()).or_insert_with(|| {
            next += 1;
            next
        });
        self.next_tag_key_id = next;
        id
    }

    fn field(&mut self, namespace: &str, metric: &str, field: &str, field_type: FieldType) {
        let entry = self.metric(namespace, metric);
        let next = entry.fields.len() as FieldId + 1;
        entry
            .fields
            .entry(field.to_string())
            .or_insert_with(|| FieldMeta {
                name: field.to_string(),
                field_type,
                id: next,
            });
    }

    fn lookup(&self, namespace: &str, metric: &str) -> Result<&MetricEntry> {
        self.namespaces
            .get(namespace)
            .and_then(|metrics| metrics.get(metric))
            .ok_or_else(|| {
                TsdqError::Execution(format!("metric not found: {namespace}/{metric}"))
            })
    }
}

impl MetadataDatabase for MemoryMetadata {
    fn suggest_namespace(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        Ok(bounded(
            self.namespaces.keys().filter(|ns| ns.starts_with(prefix)),
            limit,
        ))
    }

    fn suggest_metrics(&self, namespace: &str, prefix: &str, limit: usize) -> Result<Vec<String>> {
        let Some(metrics) = self.namespaces.get(namespace) else {
            return Ok(Vec::new());
        };
        Ok(bounded(
            metrics.keys().filter(|m| m.starts_with(prefix)),
            limit,
        ))
    }

    fn get_metric_id(&self, namespace: &str, metric_name: &str) -> Result<MetricId> {
        Ok(self.lookup(namespace, metric_name)?.id)
    }

    fn get_tag_key_id(
        &self,
        namespace: &str,
        metric_name: &str,
        tag_key: &str,
    ) -> Result<TagKeyId> {
        self.lookup(namespace, metric_name)?
            .tag_keys
            .get(tag_key)
            .copied()
            .ok_or_else(|| {
                TsdqError::Execution(format!(
                    "tag key not found: {namespace}/{metric_name}/{tag_key}"
                ))
            })
    }

    fn get_all_tag_keys(&self, namespace: &str, metric_name: &str) -> Result<Vec<TagKeyMeta>> {
        Ok(self
            .lookup(namespace, metric_name)?
            .tag_keys
            .iter()
            .map(|(key, id)| TagKeyMeta {
                key: key.clone(),
                id: *id,
            })
            .collect())
    }

    fn get_all_fields(&self, namespace: &str, metric_name: &str) -> Result<Vec<FieldMeta>> {
        Ok(self
            .lookup(namespace, metric_name)?
            .fields
            .values()
            .cloned()
            .collect())
    }
}

#[derive(Debug, Default)]
struct MemoryTagMetadata {
    by_value: BTreeMap<TagKeyId, BTreeMap<String, TagValueId>>,
    by_id: BTreeMap<TagKeyId, BTreeMap<TagValueId, String>>,
}

impl MemoryTagMetadata {
    fn value_id(&mut self, key_id: TagKeyId, value: &str) -> TagValueId {
        let values = self.by_value.entry(key_id).or_default();
        if let Some(id) = values.get(value) {
            return *id;
        }
        let id = values.len() as TagValueId + 1;
        values.insert(value.to_string(), id);
        self.by_id
            .entry(key_id)
            .or_default()
            .insert(id, value.to_string());
        id
    }
}

impl TagMetadata for MemoryTagMetadata {
    fn find_tag_value_ids(&self, tag_key_id: TagKeyId, expr: &Expr) -> Result<RoaringBitmap> {
        let Some(values) = self.by_value.get(&tag_key_id) else {
            return Ok(RoaringBitmap::new());
        };
        let selected: RoaringBitmap = match expr {
            Expr::Equals { value, .. } => values.get(value).copied().into_iter().collect(),
            Expr::In { values: wanted, .. } => wanted
                .iter()
                .filter_map(|v| values.get(v).copied())
                .collect(),
            Expr::Like { pattern, .. } => values
                .iter()
                .filter(|(v, _)| like_match(pattern, v))
                .map(|(_, id)| *id)
                .collect(),
            Expr::Regex { pattern, .. } => {
                let re = Regex::new(pattern).map_err(|e| {
                    TsdqError::Execution(format!("invalid regex '{pattern}': {e}"))
                })?;
                values
                    .iter()
                    .filter(|(v, _)| re.is_match(v))
                    .map(|(_, id)| *id)
                    .collect()
            }
            Expr::Not(_) | Expr::Binary { .. } | Expr::Paren(_) => {
                return Err(TsdqError::Execution(format!(
                    "tag value lookup needs a single predicate, got '{}'",
                    expr.rewrite()
                )));
            }
        };
        Ok(selected)
    }

    fn suggest_tag_values(
        &self,
        tag_key_id: TagKeyId,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<String>> {
        let Some(values) = self.by_value.get(&tag_key_id) else {
            return Ok(Vec::new());
        };
        Ok(bounded(values.keys().filter(|v| v.starts_with(prefix)), limit))
    }

    fn collect_tag_values(
        &self,
        tag_key_id: TagKeyId,
        tag_value_ids: &RoaringBitmap,
        out: &mut BTreeMap<u32, String>,
    ) -> Result<()> {
        let Some(values) = self.by_id.get(&tag_key_id) else {
            return Ok(());
        };
        for id in tag_value_ids {
            if let Some(v) = values.get(&id) {
                out.insert(id, v.clone());
            }
        }
        Ok(())
    }
}

struct SeriesKey<'a> {
    namespace: &'a str,
    metric: &'a str,
    metric_id: MetricId,
    series_id: SeriesId,
}

#[derive(Debug, Clone)]
struct MemorySeries {
    metric_id: MetricId,
    tags: BTreeMap<String, String>,
    points: BTreeMap<String, BTreeMap<i64, f64>>,
}

pub struct MemoryShard {
    id: ShardId,
    series: BTreeMap<SeriesId, MemorySeries>,
    index: MemoryIndex,
}

impl MemoryShard {
    fn new(id: ShardId) -> Self {
        Self {
            id,
            series: BTreeMap::new(),
            index: MemoryIndex::default(),
        }
    }

    fn write(
        &mut self,
        key: SeriesKey<'_>,
        tags: &BTreeMap<String, String>,
        tag_ids: &[(TagKeyId, TagValueId)],
        field: &str,
        timestamp: i64,
        value: f64,
    ) {
        let series = self
            .series
            .entry(key.series_id)
            .or_insert_with(|| MemorySeries {
                metric_id: key.metric_id,
                tags: tags.clone(),
                points: BTreeMap::new(),
            });
        series
            .points
            .entry(field.to_string())
            .or_default()
            .insert(timestamp, value);

        self.index
            .metric_series
            .entry(key.metric_id)
            .or_default()
            .insert(key.series_id);
        for (key_id, value_id) in tag_ids {
            self.index
                .postings
                .entry((*key_id, *value_id))
                .or_default()
                .insert(key.series_id);
        }
        self.index
            .series_tags
            .insert(key.series_id, tag_ids.iter().copied().collect());
        for (tag_key, tag_value) in tags {
            self.index
                .tag_values
                .entry((
                    key.namespace.to_string(),
                    key.metric.to_string(),
                    tag_key.clone(),
                ))
                .or_default()
                .insert(tag_value.clone());
        }
    }
}

impl Shard for MemoryShard {
    fn id(&self) -> ShardId {
        self.id
    }

    fn index_database(&self) -> &dyn IndexDatabase {
        &self.index
    }

    fn scan(&self, request: &ScanRequest) -> Result<Vec<ScannedSeries>> {
        let mut out = Vec::new();
        for series_id in &request.series_ids {
            let Some(series) = self.series.get(&series_id) else {
                continue;
            };
            if series.metric_id != request.metric_id {
                continue;
            }
            let mut points = BTreeMap::new();
            for (field, values) in &series.points {
                if !request.fields.is_empty() && !request.fields.contains(field) {
                    continue;
                }
                let in_range: Vec<(i64, f64)> = values
                    .iter()
                    .filter(|(ts, _)| request.time_range.contains(**ts))
                    .map(|(ts, v)| (*ts, *v))
                    .collect();
                if !in_range.is_empty() {
                    points.insert(field.clone(), in_range);
                }
            }
            out.push(ScannedSeries {
                series_id,
                tags: series.tags.clone(),
                points,
            });
        }
        Ok(out)
    }
}

#[derive(Debug, Default)]
struct MemoryIndex {
    postings: BTreeMap<(TagKeyId, TagValueId), RoaringBitmap>,
    metric_series: BTreeMap<MetricId, RoaringBitmap>,
    series_tags: BTreeMap<SeriesId, BTreeMap<TagKeyId, TagValueId>>,
    tag_values: BTreeMap<(String, String, String), BTreeSet<String>>,
}

impl IndexDatabase for MemoryIndex {
    fn suggest_tag_values(
        &self,
        namespace: &str,
        metric_name: &str,
        tag_key: &str,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<String>> {
        let key = (
            namespace.to_string(),
            metric_name.to_string(),
            tag_key.to_string(),
        );
        let Some(values) = self.tag_values.get(&key) else {
            return Ok(Vec::new());
        };
        Ok(bounded(values.iter().filter(|v| v.starts_with(prefix)), limit))
    }

    fn get_series_ids(
        &self,
        tag_key_id: TagKeyId,
        tag_value_ids: &RoaringBitmap,
    ) -> Result<RoaringBitmap> {
        let mut out = RoaringBitmap::new();
        for value_id in tag_value_ids {
            if let Some(series) = self.postings.get(&(tag_key_id, value_id)) {
                out |= series;
            }
        }
        Ok(out)
    }

    fn get_series_ids_for_metric(&self, metric_id: MetricId) -> Result<RoaringBitmap> {
        Ok(self
            .metric_series
            .get(&metric_id)
            .cloned()
            .unwrap_or_default())
    }

    fn get_grouping_context(
        &self,
        tag_key_ids: &[TagKeyId],
        series_ids: &RoaringBitmap,
    ) -> Result<Box<dyn GroupingContext>> {
        let mut series_tags = BTreeMap::new();
        for series_id in series_ids {
            if let Some(tags) = self.series_tags.get(&series_id) {
                series_tags.insert(series_id, tags.clone());
            }
        }
        Ok(Box::new(MemoryGroupingContext {
            tag_key_ids: tag_key_ids.to_vec(),
            series_tags,
        }))
    }
}

struct MemoryGroupingContext {
    tag_key_ids: Vec<TagKeyId>,
    series_tags: BTreeMap<SeriesId, BTreeMap<TagKeyId, TagValueId>>,
}

impl GroupingContext for MemoryGroupingContext {
    fn scan_tag_value_ids(&self, series_ids: &RoaringBitmap) -> Vec<RoaringBitmap> {
        self.tag_key_ids
            .iter()
            .map(|key_id| {
                series_ids
                    .iter()
                    .filter_map(|sid| self.series_tags.get(&sid))
                    .filter_map(|tags| tags.get(key_id).copied())
                    .collect()
            })
            .collect()
    }
}

/// Takes at most `limit` items; 0 means unbounded.
fn bounded<'a>(items: impl Iterator<Item = &'a String>, limit: usize) -> Vec<String> {
    let limit = if limit == 0 { usize::MAX } else { limit };
    items.take(limit).cloned().collect()
}
