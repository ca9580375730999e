use core::time::Duration;
use portable_atomic::{AtomicU64, Ordering};
use std::{
    sync::Arc,
    thread,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use crate::time::TimeSource;

#[derive(Debug)]
struct SharedTicker {
    elapsed_ms: AtomicU64,
}

/// A time source that never moves backwards.
///
/// At construction the clock samples `SystemTime::now()` once and from then on
/// advances with `Instant`, so wall-clock steps after startup are invisible.
/// A background ticker thread publishes the elapsed milliseconds into a
/// shared atomic, which keeps syscalls off the generator's hot path. The
/// thread exits once every clone of the clock has been dropped.
///
/// Use this when the process must never stall on clock regressions; use
/// [`SystemClock`] when timestamps must track the wall clock exactly.
///
/// [`SystemClock`]: crate::SystemClock
#[derive(Clone, Debug)]
pub struct MonotonicClock {
    inner: Arc<SharedTicker>,
    unix_offset_ms: u64,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    /// Starts a new ticker anchored at the current wall-clock time.
    pub fn new() -> Self {
        let unix_offset_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |now| now.as_millis() as u64);

        let inner = Arc::new(SharedTicker {
            elapsed_ms: AtomicU64::new(0),
        });

        let weak = Arc::downgrade(&inner);
        let spawned = thread::Builder::new()
            .name("slotflake-ticker".into())
            .spawn(move || {
                let start = Instant::now();
                let mut tick = 0;

                loop {
                    let Some(ticker) = weak.upgrade() else {
                        break;
                    };

                    let target = start + Duration::from_millis(tick);
                    let now = Instant::now();
                    if now < target {
                        thread::sleep(target - now);
                    }

                    let now_ms = start.elapsed().as_millis() as u64;
                    ticker.elapsed_ms.store(now_ms, Ordering::Release);
                    tick = now_ms + 1;
                }
            });
        if let Err(err) = spawned {
            tracing::warn!(%err, "failed to spawn ticker thread, monotonic clock is frozen");
        }

        Self {
            inner,
            unix_offset_ms,
        }
    }
}

impl TimeSource for MonotonicClock {
    fn current_millis(&self) -> u64 {
        self.unix_offset_ms + self.inner.elapsed_ms.load(Ordering::Acquire)
    }
}
