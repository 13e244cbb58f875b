//! Series and field data model exchanged between storage scans, leaves and mergers.

use std::collections::BTreeMap;

use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use tsdq_common::{Result, TsdqError};
use tsdq_sql::TimeRange;

pub type MetricId = u32;
pub type TagKeyId = u32;
pub type TagValueId = u32;
pub type SeriesId = u32;
pub type FieldId = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Sum,
    Min,
    Max,
    Gauge,
}

/// Field descriptor as returned by `show fields`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub id: FieldId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagKeyMeta {
    pub key: String,
    pub id: TagKeyId,
}

/// Shard scan input. Only series in `series_ids` and points inside
/// `time_range` are returned.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub metric_id: MetricId,
    pub series_ids: RoaringBitmap,
    pub fields: Vec<String>,
    pub time_range: TimeRange,
}

/// Raw points of one series as read from a shard.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedSeries {
    pub series_id: SeriesId,
    pub tags: BTreeMap<String, String>,
    /// field name -> (timestamp, value), ascending by timestamp.
    pub points: BTreeMap<String, Vec<(i64, f64)>>,
}

/// One result series: group tags plus bucketed field values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    pub tags: BTreeMap<String, String>,
    /// field name -> bucket timestamp -> value
    pub fields: BTreeMap<String, BTreeMap<i64, f64>>,
}

impl TimeSeries {
    /// Stable key of the group this series belongs to.
    pub fn group_key(&self) -> String {
        let parts: Vec<String> = self.tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
        parts.join(",")
    }
}

/// Data query result, partial (leaf/intermediate) or final (root).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesEvent {
    pub series_list: Vec<TimeSeries>,
    pub start_time: i64,
    pub end_time: i64,
    pub interval_ms: i64,
}

impl TimeSeriesEvent {
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| TsdqError::Protocol(format!("encode series event: {e}")))
    }

    pub fn from_json_bytes(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw)
            .map_err(|e| TsdqError::Protocol(format!("decode series event: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_meta_uses_lowercase_keys() {
        let meta = FieldMeta {
            name: "usage".to_string(),
            field_type: FieldType::Sum,
            id: 1,
        };
        let raw = serde_json::to_string(&meta).expect("encode");
        assert_eq!(raw, r#"{"name":"usage","type":"sum","id":1}"#);
    }

    #[test]
    fn group_key_is_ordered_by_tag_key() {
        let mut series = TimeSeries::default();
        series.tags.insert("zone".to_string(), "a".to_string());
        series.tags.insert("host".to_string(), "h1".to_string());
        assert_eq!(series.group_key(), "host=h1,zone=a");
    }
}
