/// A trait for random sources that pick the starting sequence of a fresh
/// millisecond.
///
/// This abstraction allows you to plug in a real random source or a fixed
/// one in tests.
///
/// # Example
/// ```
/// use slotflake::RandSource;
///
/// struct FixedRand;
/// impl RandSource for FixedRand {
///     fn below(&self, _bound: u64) -> u64 {
///         3
///     }
/// }
///
/// assert_eq!(FixedRand.below(10), 3);
/// ```
pub trait RandSource {
    /// Returns a value uniformly distributed in `[0, bound)`. `bound` is
    /// never zero.
    fn below(&self, bound: u64) -> u64;
}
