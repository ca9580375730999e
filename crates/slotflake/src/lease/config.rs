use core::time::Duration;

use crate::{
    RetryPolicy,
    error::{Error, Result},
};

/// Widest supported lease range.
pub const MAX_LEASE_BITS: u8 = 32;

const LOCK_SUFFIX: &str = "/lock";
const INSTANCES_SUFFIX: &str = "/instances";

/// Settings of a [`LeaseManager`].
///
/// Under `base_path` the manager uses `<base>/lock` for the mutual-exclusion
/// recipe and `<base>/instances` for membership entries.
///
/// [`LeaseManager`]: crate::LeaseManager
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseConfig {
    base_path: String,
    instance_bits: u8,
    lock_timeout: Duration,
    reconnect_timeout: Duration,
    retry: RetryPolicy,
}

impl LeaseConfig {
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `base_path` is not an absolute
    /// path without a trailing slash, or `instance_bits` is not in
    /// `1..=32`.
    pub fn new(base_path: impl Into<String>, instance_bits: u8) -> Result<Self> {
        let base_path = base_path.into();
        if !base_path.starts_with('/') || base_path.len() < 2 || base_path.ends_with('/') {
            return Err(Error::invalid_config(format!(
                "coordination path {base_path:?} must be absolute and must not end with '/'"
            )));
        }
        if base_path.contains("//") {
            return Err(Error::invalid_config(format!(
                "coordination path {base_path:?} contains an empty segment"
            )));
        }
        if instance_bits == 0 || instance_bits > MAX_LEASE_BITS {
            return Err(Error::invalid_config(format!(
                "lease width {instance_bits} must be between 1 and {MAX_LEASE_BITS}"
            )));
        }
        Ok(Self {
            base_path,
            instance_bits,
            lock_timeout: Duration::from_secs(30),
            reconnect_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        })
    }

    /// How long [`LeaseManager::acquire`] waits for the distributed lock.
    ///
    /// [`LeaseManager::acquire`]: crate::LeaseManager::acquire
    #[must_use]
    pub fn with_lock_timeout(self, lock_timeout: Duration) -> Self {
        Self {
            lock_timeout,
            ..self
        }
    }

    /// How long a reconnect notification waits for the client to report
    /// itself connected before reacquiring.
    #[must_use]
    pub fn with_reconnect_timeout(self, reconnect_timeout: Duration) -> Self {
        Self {
            reconnect_timeout,
            ..self
        }
    }

    #[must_use]
    pub fn with_retry(self, retry: RetryPolicy) -> Self {
        Self { retry, ..self }
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub const fn instance_bits(&self) -> u8 {
        self.instance_bits
    }

    /// Largest slot that may be handed out: `2^instance_bits - 1`.
    pub const fn max_slot(&self) -> u64 {
        (1u64 << self.instance_bits) - 1
    }

    pub const fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub const fn reconnect_timeout(&self) -> Duration {
        self.reconnect_timeout
    }

    pub const fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn lock_path(&self) -> String {
        format!("{}{LOCK_SUFFIX}", self.base_path)
    }

    pub fn instances_path(&self) -> String {
        format!("{}{INSTANCES_SUFFIX}", self.base_path)
    }

    pub(crate) fn member_path(&self, slot: u64) -> String {
        format!("{}/{}", self.instances_path(), crate::lease::node_name(slot))
    }
}
