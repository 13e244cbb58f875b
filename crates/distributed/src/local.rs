//! In-process task transport.
//!
//! Connects [`TaskHandler`]s registered under node indicators through plain
//! channels, with switches to sever live links and refuse new ones. Used by
//! tests and single-process setups in place of gRPC.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tsdq_common::{Node, Result, TsdqError};

use crate::client::{TaskStream, TaskStreamConnector};
use crate::dispatch::TaskHandler;

#[derive(Default)]
pub struct LocalNetwork {
    handlers: RwLock<HashMap<String, TaskHandler>>,
    unreachable: RwLock<Vec<String>>,
    /// (from, to) -> kill switch of the live link.
    links: RwLock<HashMap<(String, String), CancellationToken>>,
    capacity: usize,
}

impl LocalNetwork {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            ..Default::default()
        })
    }

    pub fn register(&self, node: &Node, handler: TaskHandler) {
        self.handlers.write().insert(node.indicator(), handler);
    }

    pub fn connector(self: &Arc<Self>, current: Node) -> LocalConnector {
        LocalConnector {
            network: Arc::clone(self),
            current,
        }
    }

    /// Breaks the live link from `from` to `to`, if any. Both halves end:
    /// the caller's response stream yields a transport error.
    pub fn sever(&self, from: &Node, to: &Node) -> bool {
        match self.links.write().remove(&(from.indicator(), to.indicator())) {
            Some(kill) => {
                kill.cancel();
                true
            }
            None => false,
        }
    }

    /// New connections to `node` fail while it is unreachable.
    pub fn set_reachable(&self, node: &Node, reachable: bool) {
        let indicator = node.indicator();
        let mut unreachable = self.unreachable.write();
        unreachable.retain(|n| *n != indicator);
        if !reachable {
            unreachable.push(indicator);
        }
    }

    fn open(&self, from: &Node, to: &Node) -> Result<TaskStream> {
        let target = to.indicator();
        if self.unreachable.read().contains(&target) {
            return Err(TsdqError::Transport(format!("{target} unreachable")));
        }
        let handler = self
            .handlers
            .read()
            .get(&target)
            .cloned()
            .ok_or_else(|| TsdqError::Transport(format!("no task service at {target}")))?;

        let kill = CancellationToken::new();
        if let Some(old) = self
            .links
            .write()
            .insert((from.indicator(), target.clone()), kill.clone())
        {
            old.cancel();
        }

        let (req_tx, req_rx) = mpsc::channel(self.capacity);
        let (resp_tx, resp_rx) = mpsc::channel(self.capacity);
        let server_kill = kill.clone();
        let requests = ReceiverStream::new(req_rx)
            .map(Ok::<_, TsdqError>)
            .take_until(async move { server_kill.cancelled().await })
            .boxed();
        let peer = from.indicator();
        let epoch = handler.accept(&peer, resp_tx);
        tokio::spawn(async move { handler.handle(peer, epoch, requests).await });

        let client_kill = kill;
        let responses = ReceiverStream::new(resp_rx)
            .map(|r| r.map_err(|s| TsdqError::Transport(s.message().to_string())))
            .take_until(async move { client_kill.cancelled().await })
            .chain(futures::stream::once(async move {
                Err(TsdqError::Transport(format!("link to {target} closed")))
            }))
            .boxed();
        Ok(TaskStream {
            requests: req_tx,
            responses,
        })
    }
}

pub struct LocalConnector {
    network: Arc<LocalNetwork>,
    current: Node,
}

#[tonic::async_trait]
impl TaskStreamConnector for LocalConnector {
    async fn connect(&self, target: &Node) -> Result<TaskStream> {
        self.network.open(&self.current, target)
    }
}
