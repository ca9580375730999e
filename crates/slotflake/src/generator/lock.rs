use core::cmp::Ordering;
use parking_lot::Mutex;
use std::{sync::Arc, thread};

use crate::{
    error::{Error, Result},
    generator::IdGenStatus,
    id::{GeneratorConfig, Identifier, RANDOM_START_RANGE},
    lease::LeaseManager,
    provider::{IdentityProvider, InstanceSource},
    rand::{RandSource, ThreadRandom},
    time::{SystemClock, TimeSource},
};

/// Polls spent spinning before the blocking path starts yielding the thread.
const SPIN_LIMIT: u32 = 64;

/// Per-process mutable generator state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GeneratorState {
    /// Milliseconds since the layout epoch of the last issued identifier;
    /// `None` until the first one.
    pub last_timestamp: Option<u64>,
    pub sequence: u64,
}

/// A lock-based Snowflake generator suitable for multi-threaded use.
///
/// Every call runs through one mutex-protected critical section that reads
/// the clock, compares it with the last issued timestamp and advances the
/// sequence. Clones share the same state.
///
/// On a fresh millisecond the sequence restarts at a random value in
/// `[0, 10)` rather than at zero, so that systems sharding on the low bits of
/// identifiers do not see the start of the sequence range overrepresented.
/// Ordering is still preserved because the timestamp occupies the high bits.
///
/// # Example
///
/// ```
/// use slotflake::SnowflakeGenerator;
///
/// let generator = SnowflakeGenerator::with_static(1, 2).unwrap();
/// let a = generator.next_id().unwrap();
/// let b = generator.next_id().unwrap();
/// assert!(a < b);
///
/// let parts = b.decode(generator.config());
/// assert_eq!(parts.instance, (2 << 5) | 1);
/// ```
pub struct SnowflakeGenerator<T = SystemClock, R = ThreadRandom>
where
    T: TimeSource,
    R: RandSource,
{
    config: GeneratorConfig,
    identity: Arc<IdentityProvider>,
    #[cfg(feature = "cache-padded")]
    state: Arc<crossbeam_utils::CachePadded<Mutex<GeneratorState>>>,
    #[cfg(not(feature = "cache-padded"))]
    state: Arc<Mutex<GeneratorState>>,
    time: T,
    rand: R,
}

impl<T, R> Clone for SnowflakeGenerator<T, R>
where
    T: TimeSource + Clone,
    R: RandSource + Clone,
{
    fn clone(&self) -> Self {
        Self {
            config: self.config,
            identity: Arc::clone(&self.identity),
            state: Arc::clone(&self.state),
            time: self.time.clone(),
            rand: self.rand.clone(),
        }
    }
}

impl SnowflakeGenerator<SystemClock, ThreadRandom> {
    /// A generator with the default layout and an explicit
    /// `(worker_id, datacenter_id)` pair, each in `[0, 31]`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if either id is out of range.
    pub fn with_static(worker_id: u64, datacenter_id: u64) -> Result<Self> {
        Self::from_source(
            GeneratorConfig::default(),
            InstanceSource::Static {
                worker_id,
                datacenter_id,
            },
            SystemClock,
            ThreadRandom,
        )
    }

    /// A generator from a single packed worker id in `[0, 1023]`: the low 5
    /// bits are the worker, the high bits the datacenter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the packed id is out of range.
    pub fn with_legacy_worker_id(packed: u64) -> Result<Self> {
        let config = GeneratorConfig::default();
        let (worker_id, datacenter_id) = config.split_legacy(packed);
        Self::with_static(worker_id, datacenter_id)
    }

    /// A generator whose instance value is the slot currently leased by
    /// `manager`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the lease range is wider than the
    /// default instance field.
    pub fn with_lease(manager: Arc<LeaseManager>) -> Result<Self> {
        Self::from_source(
            GeneratorConfig::default(),
            InstanceSource::Leased(manager),
            SystemClock,
            ThreadRandom,
        )
    }

    /// A generator without coordination; the instance value is derived from
    /// the local network address.
    pub fn with_fallback() -> Self {
        Self::new(
            GeneratorConfig::default(),
            Arc::new(IdentityProvider::new()),
            SystemClock,
            ThreadRandom,
        )
    }
}

impl<T, R> SnowflakeGenerator<T, R>
where
    T: TimeSource,
    R: RandSource,
{
    /// Creates a generator reading its instance value from `identity`.
    ///
    /// The provider may still be unset; it is only consulted per call.
    pub fn new(config: GeneratorConfig, identity: Arc<IdentityProvider>, time: T, rand: R) -> Self {
        tracing::info!(
            timestamp_shift = config.timestamp_shift(),
            instance_bits = config.instance_bits(),
            worker_bits = config.worker_bits(),
            sequence_bits = config.sequence_bits(),
            epoch_ms = config.epoch_millis(),
            "snowflake generator starting"
        );
        Self {
            config,
            identity,
            #[cfg(feature = "cache-padded")]
            state: Arc::new(crossbeam_utils::CachePadded::new(Mutex::new(
                GeneratorState::default(),
            ))),
            #[cfg(not(feature = "cache-padded"))]
            state: Arc::new(Mutex::new(GeneratorState::default())),
            time,
            rand,
        }
    }

    /// Creates a generator bound to `source`, validating it against `config`
    /// up front.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a static pair that does not fit
    /// the worker/datacenter split or a lease range wider than the instance
    /// field, and [`Error::InstanceOutOfRange`] for an oversized fallback
    /// value.
    pub fn from_source(
        config: GeneratorConfig,
        source: InstanceSource,
        time: T,
        rand: R,
    ) -> Result<Self> {
        match &source {
            InstanceSource::Static {
                worker_id,
                datacenter_id,
            } => {
                config.combine_static(*worker_id, *datacenter_id)?;
            }
            InstanceSource::Leased(manager) => {
                if manager.max_slot() > config.max_instance() {
                    return Err(Error::invalid_config(format!(
                        "lease range of {} bits does not fit a {} bit instance field",
                        manager.config().instance_bits(),
                        config.instance_bits()
                    )));
                }
            }
            InstanceSource::Fallback(value) => {
                if *value > config.max_instance() {
                    return Err(Error::InstanceOutOfRange {
                        value: *value,
                        max: config.max_instance(),
                    });
                }
            }
        }
        Ok(Self::new(
            config,
            Arc::new(IdentityProvider::with_source(source)),
            time,
            rand,
        ))
    }

    /// Generates the next identifier, blocking while the current
    /// millisecond's sequence space is exhausted.
    ///
    /// The wait spins briefly and then yields the thread between polls; it
    /// ends as soon as the clock advances.
    ///
    /// # Errors
    ///
    /// Same as [`SnowflakeGenerator::try_poll_id`].
    pub fn next_id(&self) -> Result<Identifier> {
        let mut spins = 0;
        loop {
            match self.try_poll_id()? {
                IdGenStatus::Ready { id } => return Ok(id),
                IdGenStatus::Pending { .. } => {
                    if spins < SPIN_LIMIT {
                        spins += 1;
                        core::hint::spin_loop();
                    } else {
                        thread::yield_now();
                    }
                }
            }
        }
    }

    /// Attempts to generate the next identifier without blocking.
    ///
    /// # Returns
    /// - `Ok(IdGenStatus::Ready { id })`: A new ID is available
    /// - `Ok(IdGenStatus::Pending { yield_until })`: the sequence is
    ///   exhausted until the clock reaches `yield_until`
    ///
    /// # Errors
    ///
    /// - [`Error::ClockRegression`] if the clock is behind the last issued
    ///   timestamp; state is left untouched
    /// - [`Error::ClockBeforeEpoch`] / [`Error::TimestampOverflow`] if the
    ///   clock is outside the representable range
    /// - any error of [`IdentityProvider::resolve`], e.g.
    ///   [`Error::InstanceUnavailable`] while no slot is leased
    pub fn try_poll_id(&self) -> Result<IdGenStatus> {
        let instance = self.identity.resolve(&self.config)?;

        let mut state = self.state.lock();
        let now = self.elapsed_millis()?;

        let Some(last) = state.last_timestamp else {
            return Ok(self.rollover(&mut state, now, instance));
        };

        match now.cmp(&last) {
            Ordering::Equal => {
                if state.sequence < self.config.max_sequence() {
                    state.sequence += 1;
                    let id = Identifier::from_components(&self.config, now, instance, state.sequence);
                    Ok(IdGenStatus::Ready { id })
                } else {
                    Ok(IdGenStatus::Pending {
                        yield_until: last + 1,
                    })
                }
            }
            Ordering::Greater => Ok(self.rollover(&mut state, now, instance)),
            Ordering::Less => Err(Self::cold_clock_behind(now, last)),
        }
    }

    fn rollover(&self, state: &mut GeneratorState, now: u64, instance: u64) -> IdGenStatus {
        state.last_timestamp = Some(now);
        state.sequence = self.rand.below(RANDOM_START_RANGE);
        IdGenStatus::Ready {
            id: Identifier::from_components(&self.config, now, instance, state.sequence),
        }
    }

    #[cold]
    #[inline(never)]
    fn cold_clock_behind(now: u64, last: u64) -> Error {
        let behind_ms = last - now;
        tracing::error!(
            behind_ms,
            last_timestamp = last,
            "clock is moving backwards, rejecting requests"
        );
        Error::ClockRegression {
            behind_ms,
            last_timestamp: last,
        }
    }

    fn elapsed_millis(&self) -> Result<u64> {
        let now_ms = self.time.current_millis();
        let epoch_ms = self.config.epoch_millis();
        let elapsed_ms = now_ms
            .checked_sub(epoch_ms)
            .ok_or(Error::ClockBeforeEpoch { now_ms, epoch_ms })?;
        let max = self.config.max_timestamp();
        if elapsed_ms > max {
            return Err(Error::TimestampOverflow { elapsed_ms, max });
        }
        Ok(elapsed_ms)
    }

    pub const fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn identity(&self) -> &IdentityProvider {
        &self.identity
    }

    /// Snapshot of the sequence state.
    pub fn state(&self) -> GeneratorState {
        *self.state.lock()
    }
}
