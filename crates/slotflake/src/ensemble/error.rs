use core::time::Duration;

/// Failure of a single coordination operation.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum EnsembleError {
    /// The addressed node does not exist.
    #[error("node {path} does not exist")]
    NoNode { path: String },

    /// A node already exists at the path being created.
    #[error("node {path} already exists")]
    NodeExists { path: String },

    /// The client is currently disconnected; the session may still be alive.
    #[error("connection to the ensemble was lost")]
    ConnectionLoss,

    /// The session has expired and all of its ephemeral nodes are gone.
    #[error("ensemble session expired")]
    SessionExpired,

    /// The lock could not be taken before the timeout elapsed.
    #[error("timed out after {waited:?} waiting for lock {path}")]
    LockTimeout { path: String, waited: Duration },

    /// `unlock` was called for a lock this session does not hold.
    #[error("lock {path} is not held by this session")]
    NotLocked { path: String },
}

impl EnsembleError {
    /// Whether retrying the same operation may succeed. Only transient
    /// disconnects qualify; an expired session never comes back.
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::ConnectionLoss)
    }
}
