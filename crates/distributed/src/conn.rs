//! Cache of gRPC channels keyed by peer indicator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;
use tsdq_common::{Node, Result, TsdqError};

/// Lazily connected gRPC channels, one per peer.
///
/// A channel is created on first use and reused by every stream to that
/// peer; tonic reconnects it underneath. After [`ClientConnFactory::close`]
/// no new channels are handed out.
#[derive(Default)]
pub struct ClientConnFactory {
    conns: RwLock<HashMap<String, Channel>>,
    closed: AtomicBool,
}

impl ClientConnFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached channel for `target`, creating a lazy one on first
    /// use. Channels are shared by every stream opened to the same peer.
    pub fn get_client_conn(&self, target: &Node) -> Result<Channel> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TsdqError::Transport("connection factory closed".to_string()));
        }
        let indicator = target.indicator();
        if let Some(conn) = self.conns.read().get(&indicator) {
            return Ok(conn.clone());
        }
        let mut conns = self.conns.write();
        if let Some(conn) = conns.get(&indicator) {
            return Ok(conn.clone());
        }
        let conn = Endpoint::from_shared(format!("http://{indicator}"))
            .map_err(|e| TsdqError::Transport(format!("invalid endpoint {indicator}: {e}")))?
            .connect_lazy();
        debug!(peer = %indicator, "client connection created");
        conns.insert(indicator, conn.clone());
        Ok(conn)
    }

    /// Drops the cached channel so the next lookup dials again.
    pub fn close_client_conn(&self, target: &Node) -> bool {
        self.conns.write().remove(&target.indicator()).is_some()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.conns.write().clear();
    }

    pub fn len(&self) -> usize {
        self.conns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.read().is_empty()
    }
}
