use core::time::Duration;

use crate::error::{Error, Result};

/// Default epoch: Thursday, December 31, 2015 16:00:00 UTC (midnight of
/// January 1, 2016 in UTC+8).
pub const DEFAULT_EPOCH: Duration = Duration::from_millis(1_451_577_600_000);

/// Twitter epoch: Thursday, November 4, 2010 1:42:54.657 UTC
pub const TWITTER_EPOCH: Duration = Duration::from_millis(1_288_834_974_657);

/// Discord epoch: Thursday, January 1, 2015 00:00:00 UTC
pub const DISCORD_EPOCH: Duration = Duration::from_millis(1_420_070_400_000);

/// Smallest allowed sequence width. The generator restarts each millisecond at
/// a random value below [`RANDOM_START_RANGE`], which must fit in the field.
pub const MIN_SEQUENCE_BITS: u8 = 4;

/// Exclusive upper bound of the random sequence value used on a fresh
/// millisecond.
pub const RANDOM_START_RANGE: u64 = 10;

/// Total width available to the three fields; the sign bit stays clear.
const USABLE_BITS: u8 = 63;

/// Immutable bit layout shared by the generator and decoder.
///
/// ```text
///  Bit Index:  63   62 ...                                                 0
///              +----+----------------+---------------------+---------------+
///  Field:      | 0  | timestamp (T)  | instance (I)        | sequence (S)  |
///              |    |                | [datacenter|worker] |               |
///              +----+----------------+---------------------+---------------+
///              |<----------- MSB ---------- 64 bits ----------- LSB ------>|
/// ```
///
/// The instance field is either one combined range (leased or fallback
/// instance values) or, for statically configured processes, split into a
/// high `datacenter` part and a low `worker` part.
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GeneratorConfig {
    epoch: Duration,
    timestamp_bits: u8,
    instance_bits: u8,
    sequence_bits: u8,
    worker_bits: u8,
}

impl Default for GeneratorConfig {
    /// 41 timestamp bits from [`DEFAULT_EPOCH`], 10 instance bits split 5/5
    /// and 12 sequence bits.
    fn default() -> Self {
        Self {
            epoch: DEFAULT_EPOCH,
            timestamp_bits: 41,
            instance_bits: 10,
            sequence_bits: 12,
            worker_bits: 5,
        }
    }
}

impl GeneratorConfig {
    /// Builds and validates a layout. The static worker/datacenter split
    /// defaults to half of the instance bits (worker gets the odd bit).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when a width is zero, the sequence is
    /// narrower than [`MIN_SEQUENCE_BITS`], or the widths add up to more than
    /// 63 bits.
    pub fn new(
        epoch: Duration,
        timestamp_bits: u8,
        instance_bits: u8,
        sequence_bits: u8,
    ) -> Result<Self> {
        let config = Self {
            epoch,
            timestamp_bits,
            instance_bits,
            sequence_bits,
            worker_bits: instance_bits.div_ceil(2),
        };
        config.validate()?;
        Ok(config)
    }

    /// Returns a copy with a different static split: the low `worker_bits` of
    /// the instance field hold the worker id, the rest the datacenter id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when the split is wider than the
    /// instance field.
    pub fn with_worker_bits(self, worker_bits: u8) -> Result<Self> {
        let config = Self {
            worker_bits,
            ..self
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.timestamp_bits == 0 || self.instance_bits == 0 {
            return Err(Error::invalid_config(
                "timestamp and instance widths must be non-zero",
            ));
        }
        if self.sequence_bits < MIN_SEQUENCE_BITS {
            return Err(Error::invalid_config(format!(
                "sequence width {} is below the minimum of {MIN_SEQUENCE_BITS}",
                self.sequence_bits
            )));
        }
        let total =
            u16::from(self.timestamp_bits) + u16::from(self.instance_bits) + u16::from(self.sequence_bits);
        if total > u16::from(USABLE_BITS) {
            return Err(Error::invalid_config(format!(
                "layout uses {total} bits, at most {USABLE_BITS} are available"
            )));
        }
        if self.worker_bits > self.instance_bits {
            return Err(Error::invalid_config(format!(
                "worker width {} exceeds instance width {}",
                self.worker_bits, self.instance_bits
            )));
        }
        Ok(())
    }

    /// Reference instant, as a [`Duration`] since 1970-01-01 UTC.
    pub const fn epoch(&self) -> Duration {
        self.epoch
    }

    /// Reference instant in milliseconds since the Unix epoch.
    pub const fn epoch_millis(&self) -> u64 {
        self.epoch.as_millis() as u64
    }

    pub const fn timestamp_bits(&self) -> u8 {
        self.timestamp_bits
    }

    pub const fn instance_bits(&self) -> u8 {
        self.instance_bits
    }

    pub const fn sequence_bits(&self) -> u8 {
        self.sequence_bits
    }

    pub const fn worker_bits(&self) -> u8 {
        self.worker_bits
    }

    pub const fn datacenter_bits(&self) -> u8 {
        self.instance_bits - self.worker_bits
    }

    /// Shift of the instance field (= sequence width).
    pub const fn instance_shift(&self) -> u8 {
        self.sequence_bits
    }

    /// Shift of the timestamp field (= instance + sequence width).
    pub const fn timestamp_shift(&self) -> u8 {
        self.instance_bits + self.sequence_bits
    }

    pub const fn max_timestamp(&self) -> u64 {
        mask(self.timestamp_bits)
    }

    pub const fn max_instance(&self) -> u64 {
        mask(self.instance_bits)
    }

    pub const fn max_sequence(&self) -> u64 {
        mask(self.sequence_bits)
    }

    pub const fn max_worker_id(&self) -> u64 {
        mask(self.worker_bits)
    }

    pub const fn max_datacenter_id(&self) -> u64 {
        mask(self.datacenter_bits())
    }

    /// Combines a static pair into one instance value:
    /// `(datacenter_id << worker_bits) | worker_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if either id exceeds its share of the
    /// instance field.
    pub fn combine_static(&self, worker_id: u64, datacenter_id: u64) -> Result<u64> {
        if worker_id > self.max_worker_id() {
            return Err(Error::invalid_config(format!(
                "worker id can't be greater than {} (got {worker_id})",
                self.max_worker_id()
            )));
        }
        if datacenter_id > self.max_datacenter_id() {
            return Err(Error::invalid_config(format!(
                "datacenter id can't be greater than {} (got {datacenter_id})",
                self.max_datacenter_id()
            )));
        }
        Ok((datacenter_id << self.worker_bits) | worker_id)
    }

    /// Splits a packed legacy worker id into `(worker_id, datacenter_id)`:
    /// the low `worker_bits` are the worker, the remaining bits the
    /// datacenter.
    pub const fn split_legacy(&self, packed: u64) -> (u64, u64) {
        (packed & self.max_worker_id(), packed >> self.worker_bits)
    }
}

const fn mask(bits: u8) -> u64 {
    if bits == 0 { 0 } else { u64::MAX >> (64 - bits as u32) }
}
