//! Statement AST consumed by the planner and executors.
//!
//! Every type here round-trips through `serde_json`; the JSON form is the
//! payload carried by task requests between brokers and storage nodes.

use serde::{Deserialize, Serialize};
use tsdq_common::{Result, TsdqError};

/// Namespace used when a statement does not name one.
pub const DEFAULT_NAMESPACE: &str = "default-ns";
/// Result bound applied to metadata statements without an explicit `limit`.
pub const DEFAULT_METADATA_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Query(Query),
    Metadata(Metadata),
}

impl Statement {
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| TsdqError::Protocol(format!("encode statement: {e}")))
    }

    pub fn from_json_bytes(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|e| TsdqError::Protocol(format!("decode statement: {e}")))
    }
}

/// Data query: `select <items> from <metric> [where ...] [group by ...]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub namespace: String,
    pub metric_name: String,
    pub select: Vec<SelectItem>,
    #[serde(default)]
    pub condition: Option<Expr>,
    /// Tag keys to group by, in statement order.
    #[serde(default)]
    pub group_by: Vec<String>,
    /// Bucket width in milliseconds; 0 collapses the time range into one bucket.
    #[serde(default)]
    pub interval_ms: i64,
    #[serde(default)]
    pub time_range: TimeRange,
    /// Max number of result series; 0 means unbounded.
    #[serde(default)]
    pub limit: usize,
}

impl Query {
    pub fn new(metric_name: impl Into<String>) -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            metric_name: metric_name.into(),
            select: Vec::new(),
            condition: None,
            group_by: Vec::new(),
            interval_ms: 0,
            time_range: TimeRange::default(),
            limit: 0,
        }
    }

    pub fn has_group_by(&self) -> bool {
        !self.group_by.is_empty()
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.select.iter().map(|s| s.field.as_str()).collect()
    }
}

/// Inclusive start, exclusive end, both in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.start && ts < self.end
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        Self {
            start: 0,
            end: i64::MAX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectItem {
    pub field: String,
    #[serde(default)]
    pub func: AggFunc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggFunc {
    #[default]
    Sum,
    Count,
    Min,
    Max,
}

impl AggFunc {
    /// Value a single raw point contributes before any combining.
    pub fn seed(self, value: f64) -> f64 {
        match self {
            AggFunc::Count => 1.0,
            AggFunc::Sum | AggFunc::Min | AggFunc::Max => value,
        }
    }

    /// Combines two partial aggregates; associative so leaves, intermediates
    /// and the root can all apply it.
    pub fn combine(self, acc: f64, value: f64) -> f64 {
        match self {
            AggFunc::Sum | AggFunc::Count => acc + value,
            AggFunc::Min => acc.min(value),
            AggFunc::Max => acc.max(value),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AggFunc::Sum => "sum",
            AggFunc::Count => "count",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MetadataType {
    Database,
    Namespace,
    Metric,
    TagKey,
    TagValue,
    Field,
}

impl MetadataType {
    pub fn name(self) -> &'static str {
        match self {
            MetadataType::Database => "database",
            MetadataType::Namespace => "namespace",
            MetadataType::Metric => "metric",
            MetadataType::TagKey => "tagKey",
            MetadataType::TagValue => "tagValue",
            MetadataType::Field => "field",
        }
    }
}

/// Metadata suggest statement (`show ...`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(rename = "type")]
    pub metadata_type: MetadataType,
    pub namespace: String,
    #[serde(default)]
    pub metric_name: String,
    #[serde(default)]
    pub tag_key: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub condition: Option<Expr>,
    pub limit: usize,
}

impl Metadata {
    pub fn new(metadata_type: MetadataType) -> Self {
        Self {
            metadata_type,
            namespace: DEFAULT_NAMESPACE.to_string(),
            metric_name: String::new(),
            tag_key: String::new(),
            prefix: String::new(),
            condition: None,
            limit: DEFAULT_METADATA_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryOp {
    And,
    Or,
}

/// Tag filter expression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Expr {
    Equals { key: String, value: String },
    In { key: String, values: Vec<String> },
    /// `*` matches any run of characters.
    Like { key: String, pattern: String },
    Regex { key: String, pattern: String },
    Not(Box<Expr>),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Paren(Box<Expr>),
}

impl Expr {
    pub fn and(left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            op: BinaryOp::And,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn or(left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            op: BinaryOp::Or,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Expr {
        Expr::Equals {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Tag key of a leaf predicate; `None` for composite nodes.
    pub fn tag_key(&self) -> Option<&str> {
        match self {
            Expr::Equals { key, .. }
            | Expr::In { key, .. }
            | Expr::Like { key, .. }
            | Expr::Regex { key, .. } => Some(key),
            Expr::Not(_) | Expr::Binary { .. } | Expr::Paren(_) => None,
        }
    }

    /// Canonical text form. Two leaf predicates with equal rewrites select the
    /// same tag values, so the rewrite keys per-predicate search results.
    pub fn rewrite(&self) -> String {
        match self {
            Expr::Equals { key, value } => format!("{key}='{value}'"),
            Expr::In { key, values } => {
                let quoted: Vec<String> = values.iter().map(|v| format!("'{v}'")).collect();
                format!("{key} in ({})", quoted.join(","))
            }
            Expr::Like { key, pattern } => format!("{key} like '{pattern}'"),
            Expr::Regex { key, pattern } => format!("{key}=~'{pattern}'"),
            Expr::Not(inner) => format!("not {}", inner.rewrite()),
            Expr::Binary { op, left, right } => {
                let op = match op {
                    BinaryOp::And => "and",
                    BinaryOp::Or => "or",
                };
                format!("{} {op} {}", left.rewrite(), right.rewrite())
            }
            Expr::Paren(inner) => format!("({})", inner.rewrite()),
        }
    }

    /// Visits every leaf predicate, left to right.
    pub fn for_each_predicate<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        match self {
            Expr::Not(inner) | Expr::Paren(inner) => inner.for_each_predicate(f),
            Expr::Binary { left, right, .. } => {
                left.for_each_predicate(f);
                right.for_each_predicate(f);
            }
            _ => f(self),
        }
    }
}

/// Glob match where `*` matches any (possibly empty) substring.
pub fn like_match(pattern: &str, value: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == value;
    }
    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !value.starts_with(first) || value.len() < first.len() + last.len() {
        return false;
    }
    let mut rest = &value[first.len()..value.len() - last.len()];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    value.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_type_serializes_camel_case() {
        let raw = serde_json::to_string(&MetadataType::TagValue).expect("encode");
        assert_eq!(raw, "\"tagValue\"");
    }

    #[test]
    fn statement_json_round_trip_preserves_condition() {
        let mut md = Metadata::new(MetadataType::TagValue);
        md.metric_name = "cpu".to_string();
        md.tag_key = "host".to_string();
        md.condition = Some(Expr::and(
            Expr::equals("region", "sh"),
            Expr::Not(Box::new(Expr::Like {
                key: "host".to_string(),
                pattern: "db*".to_string(),
            })),
        ));
        let stmt = Statement::Metadata(md);
        let raw = stmt.to_json_bytes().expect("encode");
        let decoded = Statement::from_json_bytes(&raw).expect("decode");
        assert_eq!(decoded, stmt);
    }

    #[test]
    fn decode_garbage_is_protocol_error() {
        let err = Statement::from_json_bytes(b"{not json").expect_err("must fail");
        assert_eq!(err.kind(), tsdq_common::ErrorKind::Protocol);
    }

    #[test]
    fn rewrite_is_canonical() {
        let expr = Expr::or(
            Expr::equals("host", "a"),
            Expr::Paren(Box::new(Expr::In {
                key: "zone".to_string(),
                values: vec!["x".to_string(), "y".to_string()],
            })),
        );
        assert_eq!(expr.rewrite(), "host='a' or (zone in ('x','y'))");
    }

    #[test]
    fn collects_predicates_in_order() {
        let expr = Expr::and(
            Expr::equals("host", "a"),
            Expr::Not(Box::new(Expr::equals("zone", "b"))),
        );
        let mut keys = Vec::new();
        expr.for_each_predicate(&mut |p| keys.push(p.tag_key().unwrap_or_default().to_string()));
        assert_eq!(keys, vec!["host", "zone"]);
    }

    #[test]
    fn like_matching() {
        assert!(like_match("db*", "db-01"));
        assert!(like_match("*01", "db-01"));
        assert!(like_match("d*-*1", "db-01"));
        assert!(like_match("*", ""));
        assert!(!like_match("db*", "web-01"));
        assert!(!like_match("ab*ba", "aba"));
        assert!(like_match("exact", "exact"));
    }

    #[test]
    fn agg_funcs_combine_associatively() {
        assert_eq!(AggFunc::Count.seed(42.0), 1.0);
        assert_eq!(AggFunc::Sum.combine(1.5, 2.0), 3.5);
        assert_eq!(AggFunc::Min.combine(1.5, 2.0), 1.5);
        assert_eq!(AggFunc::Max.combine(1.5, 2.0), 2.0);
    }
}
