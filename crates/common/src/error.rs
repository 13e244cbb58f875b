use thiserror::Error;

/// Canonical error taxonomy shared by every tsdq crate.
///
/// Classification guidance (see [`ErrorKind`]):
/// - planning: no storage nodes, inconsistent shard assignment, unsupported statement shape
/// - transport: no stream to a peer, send/receive failures, closed streams
/// - execution: timeouts, worker-pool saturation, recovered panics, shard/index failures
/// - protocol: malformed requests or payloads, unknown metadata types
/// - cancelled: the caller aborted the job
#[derive(Debug, Error)]
pub enum TsdqError {
    /// Invalid or inconsistent configuration/environment values.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The database has no storage node holding an active shard.
    #[error("planning error: no available storage node")]
    NoAvailableStorageNode,

    /// Plan construction or validation failures.
    #[error("planning error: {0}")]
    Planning(String),

    /// No outbound/inbound stream is registered for the target node.
    #[error("transport error: no send stream for node {0}")]
    NoSendStream(String),

    /// The stream exists but sending on it failed.
    #[error("transport error: send task message to {target} failed: {reason}")]
    TaskSend {
        /// Indicator of the peer the message was addressed to.
        target: String,
        /// Transport-level cause.
        reason: String,
    },

    /// Other transport failures: dial errors, receive errors, closed factories.
    #[error("transport error: {0}")]
    Transport(String),

    /// The per-request deadline elapsed.
    #[error("execution error: timeout: {0}")]
    Timeout(String),

    /// No worker slot freed up before the request deadline.
    #[error("execution error: worker pool saturated")]
    WorkerPoolSaturated,

    /// Runtime failures after planning succeeded.
    ///
    /// Examples:
    /// - shard or index read failures
    /// - panics recovered inside a worker
    /// - remote error messages latched by a task context
    #[error("execution error: {0}")]
    Execution(String),

    /// Error message reported by a remote task, surfaced verbatim.
    #[error("{0}")]
    Remote(String),

    /// Malformed requests, undecodable payloads, unknown enum tags.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The job was cancelled by its caller.
    #[error("cancelled")]
    Cancelled,

    /// Valid request for a feature not implemented in this version.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse error classification used by logs, metrics and status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidConfig,
    Planning,
    Transport,
    Execution,
    Protocol,
    Cancelled,
}

impl TsdqError {
    /// Returns the taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TsdqError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            TsdqError::NoAvailableStorageNode
            | TsdqError::Planning(_)
            | TsdqError::Unsupported(_) => ErrorKind::Planning,
            TsdqError::NoSendStream(_) | TsdqError::TaskSend { .. } | TsdqError::Transport(_) => {
                ErrorKind::Transport
            }
            TsdqError::Timeout(_)
            | TsdqError::WorkerPoolSaturated
            | TsdqError::Execution(_)
            | TsdqError::Remote(_)
            | TsdqError::Io(_) => ErrorKind::Execution,
            TsdqError::Protocol(_) => ErrorKind::Protocol,
            TsdqError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Standard tsdq result alias.
pub type Result<T> = std::result::Result<T, TsdqError>;
