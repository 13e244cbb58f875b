//! Result mergers: per-task strategies combining incoming responses.
//!
//! The variant is chosen when the task context is built; every variant
//! serializes its own state behind a mutex because responses for one task
//! may arrive on different streams concurrently.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tonic::Status;
use tracing::{debug, warn};
use tsdq_common::{Result, TsdqError};
use tsdq_sql::{Metadata, MetadataType, Query};
use tsdq_storage::{FieldMeta, TimeSeriesEvent};

use crate::aggregate::GroupAggregator;
use crate::context::QueryEvent;
use crate::grpc::v1::TaskResponse;
use crate::stream::ResponseSender;

/// Channel carrying the single terminal event of a job to its caller.
pub type EventSender = mpsc::Sender<Result<QueryEvent>>;

pub enum ResultMerger {
    /// Final data aggregation on the root; emits to the job channel.
    Root(RootMerger),
    /// Partial data aggregation on an intermediate; forwards to the root.
    Intermediate(IntermediateMerger),
    /// Bounded, deduplicated union of metadata values; emits to the job channel.
    Metadata(MetadataMerger),
}

impl ResultMerger {
    pub fn root(query: &Query, events: EventSender) -> Self {
        ResultMerger::Root(RootMerger {
            query: query.clone(),
            state: Mutex::new(DataState::new(query)),
            events,
        })
    }

    pub fn intermediate(
        query: &Query,
        forward: ResponseSender,
        parent_task_id: impl Into<String>,
        current: impl Into<String>,
    ) -> Self {
        ResultMerger::Intermediate(IntermediateMerger {
            state: Mutex::new(DataState::new(query)),
            forward,
            parent_task_id: parent_task_id.into(),
            current: current.into(),
        })
    }

    pub fn metadata(metadata: &Metadata, events: EventSender) -> Self {
        ResultMerger::Metadata(MetadataMerger {
            metadata_type: metadata.metadata_type,
            limit: metadata.limit,
            state: Mutex::new(MetadataState::default()),
            events,
        })
    }

    /// Folds one response payload into the merger state. Calls after
    /// [`ResultMerger::finish`] are ignored.
    pub fn merge(&self, resp: &TaskResponse) -> Result<()> {
        match self {
            ResultMerger::Root(m) => merge_data(&m.state, resp),
            ResultMerger::Intermediate(m) => merge_data(&m.state, resp),
            ResultMerger::Metadata(m) => m.merge(resp),
        }
    }

    /// Emits the merged result, or `err`, exactly once.
    pub fn finish(&self, err: Option<TsdqError>) {
        match self {
            ResultMerger::Root(m) => m.finish(err),
            ResultMerger::Intermediate(m) => m.finish(err),
            ResultMerger::Metadata(m) => m.finish(err),
        }
    }

    /// Number of responses merged so far.
    pub fn merge_count(&self) -> usize {
        match self {
            ResultMerger::Root(m) => m.state.lock().merged,
            ResultMerger::Intermediate(m) => m.state.lock().merged,
            ResultMerger::Metadata(m) => m.state.lock().merged,
        }
    }
}

struct DataState {
    aggregator: GroupAggregator,
    merged: usize,
    done: bool,
}

impl DataState {
    fn new(query: &Query) -> Self {
        Self {
            aggregator: GroupAggregator::new(query),
            merged: 0,
            done: false,
        }
    }
}

fn merge_data(state: &Mutex<DataState>, resp: &TaskResponse) -> Result<()> {
    let event = if resp.payload.is_empty() {
        None
    } else {
        Some(TimeSeriesEvent::from_json_bytes(&resp.payload)?)
    };
    let mut state = state.lock();
    if state.done {
        return Ok(());
    }
    state.merged += 1;
    if let Some(event) = event {
        state.aggregator.merge_event(event);
    }
    Ok(())
}

pub struct RootMerger {
    query: Query,
    state: Mutex<DataState>,
    events: EventSender,
}

impl RootMerger {
    fn finish(&self, err: Option<TsdqError>) {
        let mut state = self.state.lock();
        if state.done {
            return;
        }
        state.done = true;
        let event = match err {
            Some(err) => Err(err),
            None => Ok(QueryEvent::Series(TimeSeriesEvent {
                series_list: state.aggregator.take_series(self.query.limit),
                start_time: self.query.time_range.start,
                end_time: self.query.time_range.end,
                interval_ms: self.query.interval_ms,
            })),
        };
        emit(&self.events, event);
    }
}

pub struct IntermediateMerger {
    state: Mutex<DataState>,
    forward: ResponseSender,
    parent_task_id: String,
    current: String,
}

impl IntermediateMerger {
    fn finish(&self, err: Option<TsdqError>) {
        let mut state = self.state.lock();
        if state.done {
            return;
        }
        state.done = true;
        let mut resp = TaskResponse {
            task_id: self.parent_task_id.clone(),
            completed: true,
            err_msg: String::new(),
            payload: Vec::new(),
            send_node: self.current.clone(),
            ack: false,
        };
        match err {
            Some(err) => resp.err_msg = err.to_string(),
            None => {
                let event = TimeSeriesEvent {
                    series_list: state.aggregator.take_series(0),
                    ..Default::default()
                };
                match event.to_json_bytes() {
                    Ok(payload) => resp.payload = payload,
                    Err(err) => resp.err_msg = err.to_string(),
                }
            }
        }
        drop(state);
        forward(&self.forward, resp);
    }
}

#[derive(Default)]
struct MetadataState {
    values: BTreeSet<String>,
    fields: BTreeMap<String, FieldMeta>,
    merged: usize,
    done: bool,
}

pub struct MetadataMerger {
    metadata_type: MetadataType,
    limit: usize,
    state: Mutex<MetadataState>,
    events: EventSender,
}

impl MetadataMerger {
    fn merge(&self, resp: &TaskResponse) -> Result<()> {
        let mut state = self.state.lock();
        if state.done {
            return Ok(());
        }
        state.merged += 1;
        if resp.payload.is_empty() {
            return Ok(());
        }
        if self.metadata_type == MetadataType::Field {
            let fields: Vec<FieldMeta> = decode(&resp.payload)?;
            for field in fields {
                state.fields.entry(field.name.clone()).or_insert(field);
            }
        } else {
            let values: Vec<String> = decode(&resp.payload)?;
            state.values.extend(values);
        }
        Ok(())
    }

    fn finish(&self, err: Option<TsdqError>) {
        let mut state = self.state.lock();
        if state.done {
            return;
        }
        state.done = true;
        let limit = if self.limit == 0 {
            usize::MAX
        } else {
            self.limit
        };
        let event = match err {
            Some(err) => Err(err),
            None if self.metadata_type == MetadataType::Field => Ok(QueryEvent::Fields(
                std::mem::take(&mut state.fields)
                    .into_values()
                    .take(limit)
                    .collect(),
            )),
            None => Ok(QueryEvent::Metadata(
                std::mem::take(&mut state.values)
                    .into_iter()
                    .take(limit)
                    .collect(),
            )),
        };
        emit(&self.events, event);
    }
}

fn decode<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload)
        .map_err(|e| TsdqError::Protocol(format!("decode metadata payload: {e}")))
}

/// The job channel holds one slot and receives one event, so this never waits.
fn emit(events: &EventSender, event: Result<QueryEvent>) {
    if let Err(e) = events.try_send(event) {
        debug!(error = %e, "job channel no longer accepts events");
    }
}

fn forward(stream: &ResponseSender, resp: TaskResponse) {
    match stream.try_send(Ok::<_, Status>(resp)) {
        Ok(()) => {}
        Err(TrySendError::Full(msg)) => {
            let stream = stream.clone();
            tokio::spawn(async move {
                if stream.send(msg).await.is_err() {
                    warn!("parent stream closed before merged result was forwarded");
                }
            });
        }
        Err(TrySendError::Closed(_)) => {
            warn!("parent stream closed before merged result was forwarded");
        }
    }
}
