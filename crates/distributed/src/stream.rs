//! Per-peer stream tables.
//!
//! Two tables are kept, both keyed by peer indicator:
//! - server streams: response senders for peers that dialed this node;
//! - client streams: request senders for peers this node dialed.
//!
//! Every registration gets a fresh epoch from one monotonic counter. A
//! deregistration only takes effect if it presents the epoch currently held
//! for the peer, so a loop closing a stale stream cannot remove the stream
//! of a newer connection.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tonic::Status;
use tracing::{debug, info};
use tsdq_common::{global_metrics, StreamEpoch};

use crate::grpc::v1::{TaskRequest, TaskResponse};

/// Sends responses back to a peer over the stream it opened to us.
pub type ResponseSender = mpsc::Sender<Result<TaskResponse, Status>>;
/// Sends requests to a peer over a stream we opened.
pub type RequestSender = mpsc::Sender<TaskRequest>;

#[derive(Debug)]
struct StreamTable<S> {
    direction: &'static str,
    streams: DashMap<String, (StreamEpoch, S)>,
}

impl<S: Clone> StreamTable<S> {
    fn new(direction: &'static str) -> Self {
        Self {
            direction,
            streams: DashMap::new(),
        }
    }

    fn register(&self, indicator: &str, epoch: StreamEpoch, stream: S) {
        let replaced = self
            .streams
            .insert(indicator.to_string(), (epoch, stream))
            .is_some();
        global_metrics().record_stream_registered(self.direction);
        if replaced {
            // The replaced stream is gone without a matching deregister.
            global_metrics().record_stream_deregistered(self.direction);
        }
        info!(
            peer = indicator,
            epoch = epoch.0,
            direction = self.direction,
            replaced,
            "stream registered"
        );
    }

    fn deregister(&self, epoch: StreamEpoch, indicator: &str) -> bool {
        let removed = self
            .streams
            .remove_if(indicator, |_, (current, _)| *current == epoch)
            .is_some();
        if removed {
            global_metrics().record_stream_deregistered(self.direction);
            info!(
                peer = indicator,
                epoch = epoch.0,
                direction = self.direction,
                "stream deregistered"
            );
        } else {
            debug!(
                peer = indicator,
                epoch = epoch.0,
                direction = self.direction,
                "stale stream deregister ignored"
            );
        }
        removed
    }

    fn get(&self, indicator: &str) -> Option<S> {
        self.streams.get(indicator).map(|entry| entry.1.clone())
    }

    fn nodes(&self) -> Vec<String> {
        self.streams.iter().map(|e| e.key().clone()).collect()
    }
}

/// Server and client stream tables of one node.
///
/// Registration replaces whatever stream the peer had in that direction and
/// returns the new epoch; hold on to it to deregister later.
#[derive(Debug)]
pub struct StreamRegistry {
    epoch: AtomicU64,
    server: StreamTable<ResponseSender>,
    client: StreamTable<RequestSender>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            epoch: AtomicU64::new(0),
            server: StreamTable::new("server"),
            client: StreamTable::new("client"),
        }
    }

    fn next_epoch(&self) -> StreamEpoch {
        StreamEpoch(self.epoch.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn register_server(&self, indicator: &str, stream: ResponseSender) -> StreamEpoch {
        let epoch = self.next_epoch();
        self.server.register(indicator, epoch, stream);
        epoch
    }

    pub fn deregister_server(&self, epoch: StreamEpoch, indicator: &str) -> bool {
        self.server.deregister(epoch, indicator)
    }

    pub fn server_stream(&self, indicator: &str) -> Option<ResponseSender> {
        self.server.get(indicator)
    }

    pub fn register_client(&self, indicator: &str, stream: RequestSender) -> StreamEpoch {
        let epoch = self.next_epoch();
        self.client.register(indicator, epoch, stream);
        epoch
    }

    pub fn deregister_client(&self, epoch: StreamEpoch, indicator: &str) -> bool {
        self.client.deregister(epoch, indicator)
    }

    pub fn client_stream(&self, indicator: &str) -> Option<RequestSender> {
        self.client.get(indicator)
    }

    /// Peers with a registered stream in either direction, sorted.
    pub fn nodes(&self) -> Vec<String> {
        let mut nodes = self.server.nodes();
        nodes.extend(self.client.nodes());
        nodes.sort();
        nodes.dedup();
        nodes
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}
