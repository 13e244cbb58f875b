//! Outbound task streams.
//!
//! A [`TaskClientFactory`] keeps one bidirectional stream per peer. The
//! request half is registered in the [`StreamRegistry`] so task code can send
//! through it; the response half is drained by a receive loop that hands each
//! response to a [`TaskReceiver`]. When the stream breaks the loop
//! deregisters it, backs off and reconnects until the client is closed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tsdq_common::{global_metrics, Node, Result, StreamConfig, TsdqError};

use crate::grpc::v1::TaskResponse;
use crate::stream::{RequestSender, StreamRegistry};
use crate::task_manager::TaskManager;

/// Both halves of an opened task stream.
pub struct TaskStream {
    pub requests: RequestSender,
    pub responses: BoxStream<'static, Result<TaskResponse>>,
}

/// Opens task streams to peers. The gRPC implementation lives in
/// [`crate::grpc`]; tests use an in-process one.
#[tonic::async_trait]
pub trait TaskStreamConnector: Send + Sync {
    async fn connect(&self, target: &Node) -> Result<TaskStream>;
}

/// Consumes responses read from outbound streams.
pub trait TaskReceiver: Send + Sync {
    fn receive(&self, resp: TaskResponse);
}

/// Routes responses to the task context named by `task_id`.
pub struct ResponseRouter {
    task_manager: Arc<TaskManager>,
}

impl ResponseRouter {
    pub fn new(task_manager: Arc<TaskManager>) -> Self {
        Self { task_manager }
    }
}

impl TaskReceiver for ResponseRouter {
    fn receive(&self, resp: TaskResponse) {
        let Some(ctx) = self.task_manager.get(&resp.task_id) else {
            global_metrics().record_response(false);
            debug!(task_id = %resp.task_id, from = %resp.send_node, "no task context, response dropped");
            return;
        };
        global_metrics().record_response(true);
        if resp.ack {
            debug!(task_id = %resp.task_id, from = %resp.send_node, "intermediate acknowledged");
            ctx.acknowledge();
            return;
        }
        if ctx.receive_result(&resp) {
            self.task_manager.complete(&resp.task_id);
        }
    }
}

/// Exponential reconnect delay with jitter in `[base / 2, base]`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self
            .initial
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        let half = base / 2;
        let spread = (base - half).as_millis() as u64;
        half + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

struct ClientHandle {
    running: Arc<AtomicBool>,
    stop: CancellationToken,
    join: JoinHandle<()>,
}

pub struct TaskClientFactory {
    current: Node,
    connector: Arc<dyn TaskStreamConnector>,
    registry: Arc<StreamRegistry>,
    receiver: Arc<dyn TaskReceiver>,
    config: StreamConfig,
    clients: Mutex<HashMap<String, ClientHandle>>,
}

impl TaskClientFactory {
    pub fn new(
        current: Node,
        connector: Arc<dyn TaskStreamConnector>,
        registry: Arc<StreamRegistry>,
        receiver: Arc<dyn TaskReceiver>,
        config: StreamConfig,
    ) -> Self {
        Self {
            current,
            connector,
            registry,
            receiver,
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Opens a stream to `target` unless a running client already exists.
    /// The first connect is attempted inline so dial errors reach the caller.
    pub async fn create_task_client(&self, target: &Node) -> Result<()> {
        let indicator = target.indicator();
        if indicator == self.current.indicator() {
            return Err(TsdqError::Transport(format!(
                "refusing to dial self {indicator}"
            )));
        }
        if self.is_running(&indicator) {
            return Ok(());
        }
        let stream = self.connector.connect(target).await?;

        let mut clients = self.clients.lock();
        if let Some(existing) = clients.get(&indicator) {
            if existing.running.load(Ordering::SeqCst) {
                return Ok(());
            }
        }
        let epoch = self.registry.register_client(&indicator, stream.requests);
        let running = Arc::new(AtomicBool::new(true));
        let stop = CancellationToken::new();
        let receive = ReceiveLoop {
            target: target.clone(),
            connector: Arc::clone(&self.connector),
            registry: Arc::clone(&self.registry),
            receiver: Arc::clone(&self.receiver),
            backoff: Backoff::new(self.config.backoff_initial(), self.config.backoff_max()),
            running: Arc::clone(&running),
            stop: stop.clone(),
        };
        let join = tokio::spawn(receive.run(stream.responses, epoch));
        if let Some(old) = clients.insert(
            indicator,
            ClientHandle {
                running,
                stop,
                join,
            },
        ) {
            old.stop.cancel();
        }
        Ok(())
    }

    fn is_running(&self, indicator: &str) -> bool {
        self.clients
            .lock()
            .get(indicator)
            .map(|c| c.running.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Stops the receive loop for `target` and drops its stream.
    pub async fn close_task_client(&self, target: &Node) {
        let handle = self.clients.lock().remove(&target.indicator());
        if let Some(handle) = handle {
            handle.stop.cancel();
            let _ = handle.join.await;
        }
    }

    pub async fn close(&self) {
        let handles: Vec<ClientHandle> = self.clients.lock().drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.stop.cancel();
        }
        for handle in handles {
            let _ = handle.join.await;
        }
    }

    pub fn connected(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self
            .clients
            .lock()
            .iter()
            .filter(|(_, c)| c.running.load(Ordering::SeqCst))
            .map(|(k, _)| k.clone())
            .collect();
        nodes.sort();
        nodes
    }
}

struct ReceiveLoop {
    target: Node,
    connector: Arc<dyn TaskStreamConnector>,
    registry: Arc<StreamRegistry>,
    receiver: Arc<dyn TaskReceiver>,
    backoff: Backoff,
    running: Arc<AtomicBool>,
    stop: CancellationToken,
}

impl ReceiveLoop {
    async fn run(
        mut self,
        mut responses: BoxStream<'static, Result<TaskResponse>>,
        mut epoch: tsdq_common::StreamEpoch,
    ) {
        let indicator = self.target.indicator();
        loop {
            let reason = loop {
                tokio::select! {
                    biased;
                    _ = self.stop.cancelled() => {
                        self.registry.deregister_client(epoch, &indicator);
                        self.running.store(false, Ordering::SeqCst);
                        return;
                    }
                    next = responses.next() => match next {
                        Some(Ok(resp)) => self.receiver.receive(resp),
                        Some(Err(err)) => break err.to_string(),
                        None => break "stream closed by peer".to_string(),
                    },
                }
            };
            warn!(peer = %indicator, epoch = epoch.0, reason = %reason, "task stream broken");
            self.registry.deregister_client(epoch, &indicator);

            match self.reconnect().await {
                Some(stream) => {
                    epoch = self.registry.register_client(&indicator, stream.requests);
                    responses = stream.responses;
                }
                None => {
                    self.running.store(false, Ordering::SeqCst);
                    return;
                }
            }
        }
    }

    /// Retries until a stream opens or the client is stopped.
    async fn reconnect(&mut self) -> Option<TaskStream> {
        loop {
            let delay = self.backoff.next_delay();
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            global_metrics().record_reconnect(&self.target.indicator());
            match self.connector.connect(&self.target).await {
                Ok(stream) => {
                    info!(peer = %self.target, "task stream reconnected");
                    self.backoff.reset();
                    return Some(stream);
                }
                Err(err) => {
                    warn!(peer = %self.target, error = %err, delay_ms = delay.as_millis() as u64, "reconnect failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_within_bounds_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1_000));
        let expected_bases = [100u64, 200, 400, 800, 1_000, 1_000];
        for base in expected_bases {
            let delay = backoff.next_delay().as_millis() as u64;
            assert!(delay >= base / 2 && delay <= base, "delay {delay} base {base}");
        }
        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_millis(100));
    }

    #[test]
    fn backoff_max_below_initial_is_raised() {
        let mut backoff = Backoff::new(Duration::from_millis(300), Duration::from_millis(10));
        let delay = backoff.next_delay();
        assert!(delay >= Duration::from_millis(150) && delay <= Duration::from_millis(300));
    }
}
