use crate::id::Identifier;

/// Represents the result of attempting to generate a new identifier.
///
/// This type models the outcome of [`SnowflakeGenerator::try_poll_id`]:
///
/// - [`IdGenStatus::Ready`] indicates a new ID was successfully generated.
/// - [`IdGenStatus::Pending`] means the sequence space of the current
///   millisecond is exhausted and no ID can be generated until the clock
///   reaches `yield_until`.
///
/// This allows non-blocking generation loops and clean backoff strategies.
///
/// [`SnowflakeGenerator::try_poll_id`]: crate::SnowflakeGenerator::try_poll_id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdGenStatus {
    /// A unique ID was generated and is ready to use.
    Ready {
        /// The generated identifier.
        id: Identifier,
    },
    /// No ID could be generated because the sequence has been exhausted for
    /// the current tick.
    Pending {
        /// The next timestamp (ms since the layout epoch, inclusive) at which
        /// you may resume generating IDs.
        yield_until: u64,
    },
}
