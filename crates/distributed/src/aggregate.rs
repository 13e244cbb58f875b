//! Group-by aggregation shared by leaves (raw points) and mergers (partials).

use std::collections::BTreeMap;

use tsdq_sql::{AggFunc, Query, SelectItem};
use tsdq_storage::{TimeSeries, TimeSeriesEvent};

/// Result column name for a select item, e.g. `sum(usage)`.
pub fn output_name(item: &SelectItem) -> String {
    format!("{}({})", item.func.name(), item.field)
}

/// Bucket timestamp for a raw point.
pub fn bucket_of(query: &Query, ts: i64) -> i64 {
    if query.interval_ms > 0 {
        ts - ts.rem_euclid(query.interval_ms)
    } else {
        query.time_range.start
    }
}

/// Hash aggregation keyed by group key; output is ordered by group key.
#[derive(Debug, Clone)]
pub struct GroupAggregator {
    /// output name -> (source field, function)
    columns: BTreeMap<String, (String, AggFunc)>,
    groups: BTreeMap<String, TimeSeries>,
}

impl GroupAggregator {
    pub fn new(query: &Query) -> Self {
        let columns = query
            .select
            .iter()
            .map(|item| (output_name(item), (item.field.clone(), item.func)))
            .collect();
        Self {
            columns,
            groups: BTreeMap::new(),
        }
    }

    /// Adds one raw point of `field` to every column reading that field.
    pub fn add_point(
        &mut self,
        tags: &BTreeMap<String, String>,
        field: &str,
        bucket: i64,
        value: f64,
    ) {
        let series = group_entry(&mut self.groups, tags);
        for (name, (source, func)) in &self.columns {
            if source != field {
                continue;
            }
            let seeded = func.seed(value);
            series
                .fields
                .entry(name.clone())
                .or_default()
                .entry(bucket)
                .and_modify(|acc| *acc = func.combine(*acc, seeded))
                .or_insert(seeded);
        }
    }

    /// Folds an already-aggregated partial series into the state.
    pub fn merge_series(&mut self, partial: TimeSeries) {
        let series = group_entry(&mut self.groups, &partial.tags);
        for (name, buckets) in partial.fields {
            let Some((_, func)) = self.columns.get(&name) else {
                continue;
            };
            let target = series.fields.entry(name).or_default();
            for (bucket, value) in buckets {
                target
                    .entry(bucket)
                    .and_modify(|acc| *acc = func.combine(*acc, value))
                    .or_insert(value);
            }
        }
    }

    pub fn merge_event(&mut self, event: TimeSeriesEvent) {
        for series in event.series_list {
            self.merge_series(series);
        }
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Drains the state into series ordered by group key, keeping at most
    /// `limit` groups (0 keeps all).
    pub fn take_series(&mut self, limit: usize) -> Vec<TimeSeries> {
        let limit = if limit == 0 { usize::MAX } else { limit };
        std::mem::take(&mut self.groups)
            .into_values()
            .take(limit)
            .collect()
    }
}

fn group_entry<'a>(
    groups: &'a mut BTreeMap<String, TimeSeries>,
    tags: &BTreeMap<String, String>,
) -> &'a mut TimeSeries {
    let series = TimeSeries {
        tags: tags.clone(),
        fields: BTreeMap::new(),
    };
    groups.entry(series.group_key()).or_insert(series)
}
