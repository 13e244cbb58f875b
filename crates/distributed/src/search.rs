//! Tag filter evaluation.
//!
//! [`TagSearch`] resolves every leaf predicate of a filter to the tag value
//! ids it selects, once per database. [`SeriesSearch`] then walks the filter
//! tree against one shard's index, turning those value ids into series ids.

use std::collections::BTreeMap;

use roaring::RoaringBitmap;
use tsdq_common::{Result, TsdqError};
use tsdq_sql::{BinaryOp, Expr};
use tsdq_storage::{IndexDatabase, MetadataDatabase, MetricId, TagKeyId, TagMetadata};

/// Tag value ids selected by one leaf predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct TagFilterResult {
    pub tag_key_id: TagKeyId,
    pub tag_value_ids: RoaringBitmap,
}

/// Filter results keyed by [`Expr::rewrite`] of the leaf predicate.
pub type TagFilterResults = BTreeMap<String, TagFilterResult>;

pub struct TagSearch<'a> {
    namespace: &'a str,
    metric_name: &'a str,
    condition: &'a Expr,
    metadata: &'a dyn MetadataDatabase,
    tags: &'a dyn TagMetadata,
}

impl<'a> TagSearch<'a> {
    pub fn new(
        namespace: &'a str,
        metric_name: &'a str,
        condition: &'a Expr,
        metadata: &'a dyn MetadataDatabase,
        tags: &'a dyn TagMetadata,
    ) -> Self {
        Self {
            namespace,
            metric_name,
            condition,
            metadata,
            tags,
        }
    }

    /// Resolves every leaf predicate. Predicates selecting no values are
    /// kept with an empty bitmap; a filter where nothing matched at all is
    /// reported as an error.
    pub fn filter(&self) -> Result<TagFilterResults> {
        let mut predicates = Vec::new();
        self.condition.for_each_predicate(&mut |p| predicates.push(p));

        let mut results = TagFilterResults::new();
        let mut matched = false;
        for predicate in predicates {
            let rewrite = predicate.rewrite();
            if results.contains_key(&rewrite) {
                continue;
            }
            let key = predicate.tag_key().ok_or_else(|| {
                TsdqError::Protocol(format!("'{rewrite}' is not a tag predicate"))
            })?;
            let tag_key_id = self
                .metadata
                .get_tag_key_id(self.namespace, self.metric_name, key)?;
            let tag_value_ids = self.tags.find_tag_value_ids(tag_key_id, predicate)?;
            matched |= !tag_value_ids.is_empty();
            results.insert(
                rewrite,
                TagFilterResult {
                    tag_key_id,
                    tag_value_ids,
                },
            );
        }
        if !matched {
            return Err(TsdqError::Execution(format!(
                "tag not found for filter '{}'",
                self.condition.rewrite()
            )));
        }
        Ok(results)
    }
}

pub struct SeriesSearch<'a> {
    index: &'a dyn IndexDatabase,
    filter_results: &'a TagFilterResults,
    metric_id: MetricId,
}

impl<'a> SeriesSearch<'a> {
    pub fn new(
        index: &'a dyn IndexDatabase,
        filter_results: &'a TagFilterResults,
        metric_id: MetricId,
    ) -> Self {
        Self {
            index,
            filter_results,
            metric_id,
        }
    }

    /// Series ids of this shard selected by `expr`.
    pub fn search(&self, expr: &Expr) -> Result<RoaringBitmap> {
        match expr {
            Expr::Binary { op, left, right } => {
                let left = self.search(left)?;
                let right = self.search(right)?;
                Ok(match op {
                    BinaryOp::And => left & right,
                    BinaryOp::Or => left | right,
                })
            }
            Expr::Paren(inner) => self.search(inner),
            Expr::Not(inner) => {
                let all = self.index.get_series_ids_for_metric(self.metric_id)?;
                Ok(all - self.search(inner)?)
            }
            _ => {
                let rewrite = expr.rewrite();
                let result = self.filter_results.get(&rewrite).ok_or_else(|| {
                    TsdqError::Execution(format!("no tag filter result for '{rewrite}'"))
                })?;
                self.index
                    .get_series_ids(result.tag_key_id, &result.tag_value_ids)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsdq_sql::DEFAULT_NAMESPACE;
    use tsdq_storage::{Database, MemoryDatabase, Point};

    fn point(host: &str, zone: &str) -> Point {
        Point {
            shard: 1,
            namespace: DEFAULT_NAMESPACE.to_string(),
            metric: "cpu".to_string(),
            tags: [
                ("host".to_string(), host.to_string()),
                ("zone".to_string(), zone.to_string()),
            ]
            .into_iter()
            .collect(),
            field: "usage".to_string(),
            field_type: tsdq_storage::FieldType::Sum,
            timestamp: 1,
            value: 1.0,
        }
    }

    fn database() -> MemoryDatabase {
        let mut db = MemoryDatabase::new("db");
        db.add_shard(1);
        for (host, zone) in [("a", "sh"), ("b", "sh"), ("c", "bj"), ("d", "bj")] {
            db.write(&point(host, zone));
        }
        db
    }

    fn hosts(db: &MemoryDatabase, expr: &Expr) -> Result<Vec<String>> {
        let metric_id = db.metadata().get_metric_id(DEFAULT_NAMESPACE, "cpu")?;
        let results =
            TagSearch::new(DEFAULT_NAMESPACE, "cpu", expr, db.metadata(), db.tag_metadata())
                .filter()?;
        let shard = db.get_shard(1).expect("shard");
        let series = SeriesSearch::new(shard.index_database(), &results, metric_id).search(expr)?;
        let host_key = db
            .metadata()
            .get_tag_key_id(DEFAULT_NAMESPACE, "cpu", "host")?;
        let ctx = shard
            .index_database()
            .get_grouping_context(&[host_key], &series)?;
        let value_ids = ctx.scan_tag_value_ids(&series).remove(0);
        let mut out = BTreeMap::new();
        db.tag_metadata()
            .collect_tag_values(host_key, &value_ids, &mut out)?;
        let mut values: Vec<String> = out.into_values().collect();
        values.sort();
        Ok(values)
    }

    #[test]
    fn and_or_not_combine_series() {
        let db = database();
        let sh = Expr::equals("zone", "sh");
        assert_eq!(hosts(&db, &sh).expect("search"), vec!["a", "b"]);

        let expr = Expr::or(
            Expr::and(sh.clone(), Expr::equals("host", "a")),
            Expr::equals("host", "d"),
        );
        assert_eq!(hosts(&db, &expr).expect("search"), vec!["a", "d"]);

        let not = Expr::Not(Box::new(Expr::Paren(Box::new(sh))));
        assert_eq!(hosts(&db, &not).expect("search"), vec!["c", "d"]);

        let like = Expr::Like {
            key: "host".to_string(),
            pattern: "*".to_string(),
        };
        assert_eq!(hosts(&db, &like).expect("search").len(), 4);
    }

    #[test]
    fn filter_matching_nothing_is_an_error() {
        let db = database();
        let err = hosts(&db, &Expr::equals("host", "zz")).expect_err("no match");
        assert!(err.to_string().contains("tag not found"));
    }

    #[test]
    fn unknown_tag_key_is_an_error() {
        let db = database();
        assert!(hosts(&db, &Expr::equals("rack", "r1")).is_err());
    }
}
