use std::sync::{Arc, OnceLock};

use crate::{
    error::{Error, Result},
    fallback,
    id::GeneratorConfig,
    lease::LeaseManager,
};

/// Where a process gets the instance value embedded in its identifiers.
#[derive(Clone, Debug)]
pub enum InstanceSource {
    /// A statically configured pair, combined as
    /// `(datacenter_id << worker_bits) | worker_id`.
    Static { worker_id: u64, datacenter_id: u64 },
    /// Whatever slot the lease manager currently holds.
    Leased(Arc<LeaseManager>),
    /// A fixed, uncoordinated value.
    Fallback(u64),
}

/// The single point the generator consults for "the current instance value".
///
/// The source can be set at most once, either at construction or later
/// during startup; concurrent readers see either no source or the final
/// one. Without a source the provider falls back to the network-derived
/// value, computed once on first use.
#[derive(Debug, Default)]
pub struct IdentityProvider {
    source: OnceLock<InstanceSource>,
    fallback: OnceLock<u64>,
}

impl IdentityProvider {
    /// A provider with no source set yet.
    pub const fn new() -> Self {
        Self {
            source: OnceLock::new(),
            fallback: OnceLock::new(),
        }
    }

    pub fn with_source(source: InstanceSource) -> Self {
        let provider = Self::new();
        let _ = provider.source.set(source);
        provider
    }

    /// Installs the source.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IdentityAlreadySet`] if a source was already set.
    pub fn set(&self, source: InstanceSource) -> Result<()> {
        self.source
            .set(source)
            .map_err(|_| Error::IdentityAlreadySet)
    }

    pub fn source(&self) -> Option<&InstanceSource> {
        self.source.get()
    }

    /// Resolves the instance value for `config`.
    ///
    /// # Errors
    ///
    /// - [`Error::InstanceUnavailable`] if the source is a lease manager
    ///   that holds no slot right now
    /// - [`Error::InvalidConfig`] if a static pair does not fit the split
    /// - [`Error::InstanceOutOfRange`] if the value exceeds the instance field
    pub fn resolve(&self, config: &GeneratorConfig) -> Result<u64> {
        let value = match self.source.get() {
            Some(InstanceSource::Static {
                worker_id,
                datacenter_id,
            }) => config.combine_static(*worker_id, *datacenter_id)?,
            Some(InstanceSource::Leased(manager)) => manager
                .current_slot()
                .ok_or(Error::InstanceUnavailable)?,
            Some(InstanceSource::Fallback(value)) => *value,
            None => *self
                .fallback
                .get_or_init(|| fallback::network_instance(config.instance_bits())),
        };

        let max = config.max_instance();
        if value > max {
            return Err(Error::InstanceOutOfRange { value, max });
        }
        Ok(value)
    }
}
