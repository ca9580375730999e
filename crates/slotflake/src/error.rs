//! Error types for identifier generation and instance leasing.
//!
//! Minting errors ([`Error::ClockRegression`], [`Error::InstanceUnavailable`],
//! ...) are returned synchronously to the caller of the generator. Lease
//! errors ([`Error::CapacityExceeded`], [`Error::LockAcquisition`],
//! [`Error::EnsembleUnavailable`], [`Error::SessionLost`]) are returned to
//! whoever called [`LeaseManager::acquire`]; when they happen on the
//! connectivity watcher thread they are logged and recorded instead.
//!
//! [`LeaseManager::acquire`]: crate::LeaseManager::acquire

use crate::ensemble::EnsembleError;

/// Result alias defaulting to the crate [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// All errors that `slotflake` can produce.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The local clock reported a time earlier than the last issued
    /// timestamp. Generator state is left untouched; the caller may retry
    /// once the clock has caught up.
    #[error(
        "clock moved backwards, refusing to generate ids for {behind_ms} ms (last timestamp {last_timestamp})"
    )]
    ClockRegression {
        /// Magnitude of the regression in milliseconds.
        behind_ms: u64,
        /// The last timestamp (ms since the generator epoch) handed out.
        last_timestamp: u64,
    },

    /// The clock reported a time before the configured epoch.
    #[error("clock reads {now_ms} ms since unix epoch, before the generator epoch {epoch_ms}")]
    ClockBeforeEpoch { now_ms: u64, epoch_ms: u64 },

    /// Elapsed time no longer fits in the timestamp field.
    #[error("elapsed time {elapsed_ms} ms exceeds the timestamp field maximum {max}")]
    TimestampOverflow { elapsed_ms: u64, max: u64 },

    /// A layout or lease configuration was rejected at construction time.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// The resolved instance value does not fit in the instance field.
    #[error("instance value {value} exceeds the instance field maximum {max}")]
    InstanceOutOfRange { value: u64, max: u64 },

    /// A lease manager is configured but does not currently hold a slot.
    #[error("no instance slot is currently leased")]
    InstanceUnavailable,

    /// [`IdentityProvider::set`] was called more than once.
    ///
    /// [`IdentityProvider::set`]: crate::IdentityProvider::set
    #[error("identity source was already configured")]
    IdentityAlreadySet,

    /// Every slot up to the configured maximum is held by a live member.
    #[error("instance id overflow, computed slot {slot} exceeds max slot {max}")]
    CapacityExceeded { slot: u64, max: u64 },

    /// The distributed mutual-exclusion lock could not be obtained.
    #[error("failed to acquire lock at {path}: {source}")]
    LockAcquisition {
        path: String,
        #[source]
        source: EnsembleError,
    },

    /// A coordination operation failed after exhausting its retries.
    #[error("ensemble unavailable while {context}: {source}")]
    EnsembleUnavailable {
        context: String,
        #[source]
        source: EnsembleError,
    },

    /// The ensemble session was suspended or lost while an acquisition was in
    /// flight; the partially registered lease was abandoned.
    #[error("ensemble session lost during lease acquisition")]
    SessionLost,

    /// The connectivity watcher thread could not be started.
    #[error("failed to spawn connectivity watcher: {reason}")]
    WatcherSpawn { reason: String },
}

impl Error {
    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    pub(crate) fn ensemble(context: impl Into<String>, source: EnsembleError) -> Self {
        Self::EnsembleUnavailable {
            context: context.into(),
            source,
        }
    }
}
