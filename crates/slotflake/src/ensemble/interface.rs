use core::{fmt, time::Duration};
use tokio::sync::mpsc;

use crate::ensemble::EnsembleError;

/// Connection state transitions reported by the coordination client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    /// The first successful connection.
    Connected,
    /// The connection dropped; the session may still be alive server-side.
    Suspended,
    /// The session expired. Every ephemeral node it owned is gone.
    Lost,
    /// The connection was re-established after `Suspended` or `Lost`.
    Reconnected,
}

impl ConnectivityState {
    /// `true` for the transitions after which a slot must no longer be used.
    pub const fn is_disconnect(self) -> bool {
        matches!(self, Self::Suspended | Self::Lost)
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connected => "CONNECTED",
            Self::Suspended => "SUSPENDED",
            Self::Lost => "LOST",
            Self::Reconnected => "RECONNECTED",
        };
        f.write_str(name)
    }
}

/// Receiving half of a connectivity notification stream. Either await it or
/// consume it from a plain thread with
/// [`mpsc::UnboundedReceiver::blocking_recv`].
pub type ConnectivityReceiver = mpsc::UnboundedReceiver<ConnectivityState>;

/// A linearizable, hierarchical coordination service.
///
/// Paths are absolute and `/`-separated. Ephemeral nodes belong to the
/// client's current session and disappear when that session expires.
pub trait Ensemble: Send + Sync {
    /// Creates a persistent node, creating missing parents.
    ///
    /// # Errors
    ///
    /// [`EnsembleError::NodeExists`] if the node is already present, or a
    /// connectivity error.
    fn create_persistent(&self, path: &str) -> Result<(), EnsembleError>;

    /// Creates an ephemeral node holding `data` and returns its path.
    /// Missing parents are created as persistent nodes.
    ///
    /// # Errors
    ///
    /// [`EnsembleError::NodeExists`] if the node is already present, or a
    /// connectivity error.
    fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<String, EnsembleError>;

    /// Deletes a node together with its children.
    ///
    /// # Errors
    ///
    /// [`EnsembleError::NoNode`] if nothing exists at `path`, or a
    /// connectivity error.
    fn delete(&self, path: &str) -> Result<(), EnsembleError>;

    /// Lists the names (last path segment) of the children of `path`, in no
    /// particular order.
    ///
    /// # Errors
    ///
    /// [`EnsembleError::NoNode`] if `path` does not exist, or a connectivity
    /// error.
    fn children(&self, path: &str) -> Result<Vec<String>, EnsembleError>;

    /// Blocks until this session holds the mutual-exclusion lock at `path`
    /// or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// [`EnsembleError::LockTimeout`] on timeout, or a connectivity error.
    fn lock(&self, path: &str, timeout: Duration) -> Result<(), EnsembleError>;

    /// Releases a lock previously taken with [`Ensemble::lock`].
    ///
    /// # Errors
    ///
    /// [`EnsembleError::NotLocked`] if this session does not hold it, or a
    /// connectivity error.
    fn unlock(&self, path: &str) -> Result<(), EnsembleError>;

    /// Blocks until the client is connected, returning `false` on timeout.
    fn wait_connected(&self, timeout: Duration) -> bool;

    /// Opens a new connectivity notification stream. Transitions that happen
    /// after this call are delivered in order.
    fn subscribe(&self) -> ConnectivityReceiver;
}
