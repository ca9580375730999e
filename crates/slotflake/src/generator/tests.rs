use crate::{
    Error, GeneratorConfig, IdGenStatus, Identifier, IdentityProvider, InstanceSource,
    LeaseConfig, LeaseManager, MemoryEnsemble, MonotonicClock, RandSource, RetryPolicy,
    SnowflakeGenerator, ThreadRandom, TimeSource,
};
use core::{cell::Cell, time::Duration};
use std::{collections::HashSet, sync::Arc, thread};

struct MockTime {
    millis: u64,
}

impl TimeSource for MockTime {
    fn current_millis(&self) -> u64 {
        self.millis
    }
}

struct MockStepTime {
    values: Vec<u64>,
    index: Cell<usize>,
}

impl TimeSource for MockStepTime {
    fn current_millis(&self) -> u64 {
        self.values[self.index.get()]
    }
}

/// Reads `base` for the first `after` calls, then `base + 1`.
struct AdvanceAfter {
    base: u64,
    after: u32,
    reads: Cell<u32>,
}

impl TimeSource for AdvanceAfter {
    fn current_millis(&self) -> u64 {
        let reads = self.reads.get() + 1;
        self.reads.set(reads);
        if reads > self.after {
            self.base + 1
        } else {
            self.base
        }
    }
}

#[derive(Clone, Copy)]
struct FixedRand(u64);

impl RandSource for FixedRand {
    fn below(&self, bound: u64) -> u64 {
        assert!(self.0 < bound);
        self.0
    }
}

trait IdGenStatusExt {
    fn unwrap_ready(self) -> Identifier;
    fn unwrap_pending(self) -> u64;
}

impl IdGenStatusExt for IdGenStatus {
    fn unwrap_ready(self) -> Identifier {
        match self {
            IdGenStatus::Ready { id } => id,
            IdGenStatus::Pending { yield_until } => {
                panic!("unexpected pending (yield until: {yield_until})")
            }
        }
    }

    fn unwrap_pending(self) -> u64 {
        match self {
            IdGenStatus::Ready { id } => panic!("unexpected ready ({id})"),
            IdGenStatus::Pending { yield_until } => yield_until,
        }
    }
}

/// Unix epoch layout so mock clock values equal id timestamps.
fn unix_config() -> GeneratorConfig {
    GeneratorConfig::new(Duration::ZERO, 41, 10, 12).unwrap()
}

fn fixed_instance<T: TimeSource, R: RandSource>(
    time: T,
    rand: R,
) -> SnowflakeGenerator<T, R> {
    SnowflakeGenerator::from_source(unix_config(), InstanceSource::Fallback(1), time, rand)
        .unwrap()
}

#[test]
fn sequence_increments_within_same_tick() {
    let generator = fixed_instance(MockTime { millis: 42 }, FixedRand(0));
    let config = *generator.config();

    let id1 = generator.try_poll_id().unwrap().unwrap_ready();
    let id2 = generator.try_poll_id().unwrap().unwrap_ready();
    let id3 = generator.try_poll_id().unwrap().unwrap_ready();

    assert_eq!(id1.timestamp(&config), 42);
    assert_eq!(id2.timestamp(&config), 42);
    assert_eq!(id3.timestamp(&config), 42);
    assert_eq!(id1.sequence(&config), 0);
    assert_eq!(id2.sequence(&config), 1);
    assert_eq!(id3.sequence(&config), 2);
    assert_eq!(id1.instance(&config), 1);
    assert!(id1 < id2 && id2 < id3);
}

#[test]
fn fresh_millisecond_starts_at_random_low_sequence() {
    let time = MockStepTime {
        values: vec![42, 43],
        index: Cell::new(0),
    };
    let generator = fixed_instance(&time, FixedRand(7));
    let config = *generator.config();

    let id = generator.try_poll_id().unwrap().unwrap_ready();
    assert_eq!(id.sequence(&config), 7);
    let id = generator.try_poll_id().unwrap().unwrap_ready();
    assert_eq!(id.sequence(&config), 8);

    time.index.set(1);
    let id = generator.try_poll_id().unwrap().unwrap_ready();
    assert_eq!(id.timestamp(&config), 43);
    assert_eq!(id.sequence(&config), 7);
}

#[test]
fn random_start_stays_below_ten() {
    let generator = SnowflakeGenerator::from_source(
        unix_config(),
        InstanceSource::Fallback(1),
        MonotonicClock::new(),
        ThreadRandom,
    )
    .unwrap();
    let config = *generator.config();

    let mut last_ts = None;
    for _ in 0..20_000 {
        let id = generator.next_id().unwrap();
        let ts = id.timestamp(&config);
        if last_ts != Some(ts) {
            assert!(id.sequence(&config) < 10, "fresh tick started at {id:?}");
            last_ts = Some(ts);
        }
    }
}

#[test]
fn exhausted_sequence_returns_pending_then_rolls_over() {
    let time = MockStepTime {
        values: vec![42, 43],
        index: Cell::new(0),
    };
    let generator = fixed_instance(&time, FixedRand(0));
    let config = *generator.config();

    for expected in 0..=config.max_sequence() {
        let id = generator.try_poll_id().unwrap().unwrap_ready();
        assert_eq!(id.sequence(&config), expected);
        assert_eq!(id.timestamp(&config), 42);
    }

    assert_eq!(generator.try_poll_id().unwrap().unwrap_pending(), 43);
    assert_eq!(generator.try_poll_id().unwrap().unwrap_pending(), 43);
    assert_eq!(generator.state().sequence, config.max_sequence());

    time.index.set(1);
    let id = generator.try_poll_id().unwrap().unwrap_ready();
    assert_eq!(id.timestamp(&config), 43);
    assert_eq!(id.sequence(&config), 0);
}

#[test]
fn next_id_waits_for_clock_to_advance() {
    let config = GeneratorConfig::new(Duration::ZERO, 47, 10, 6).unwrap();
    // 64 ids fit one tick; the 65th poll and a few more see the same tick.
    let time = AdvanceAfter {
        base: 100,
        after: 70,
        reads: Cell::new(0),
    };
    let generator =
        SnowflakeGenerator::from_source(config, InstanceSource::Fallback(3), &time, FixedRand(0))
            .unwrap();

    let mut ids = Vec::new();
    for _ in 0..=config.max_sequence() {
        ids.push(generator.next_id().unwrap());
    }
    let next = generator.next_id().unwrap();

    assert!(ids.iter().all(|id| id.timestamp(&config) == 100));
    assert_eq!(next.timestamp(&config), 101);
    assert_eq!(next.sequence(&config), 0);
    assert!(time.reads.get() > 70);
    assert!(ids.last().is_some_and(|last| *last < next));
}

#[test]
fn clock_regression_is_rejected_without_touching_state() {
    let time = MockStepTime {
        values: vec![50, 45, 50],
        index: Cell::new(0),
    };
    let generator = fixed_instance(&time, FixedRand(0));
    let config = *generator.config();

    let first = generator.try_poll_id().unwrap().unwrap_ready();
    let before = generator.state();

    time.index.set(1);
    assert_eq!(
        generator.try_poll_id(),
        Err(Error::ClockRegression {
            behind_ms: 5,
            last_timestamp: 50
        })
    );
    assert_eq!(generator.next_id().unwrap_err(), Error::ClockRegression {
        behind_ms: 5,
        last_timestamp: 50
    });
    assert_eq!(generator.state(), before);

    time.index.set(2);
    let second = generator.try_poll_id().unwrap().unwrap_ready();
    assert_eq!(second.sequence(&config), first.sequence(&config) + 1);
    assert!(second > first);
}

#[test]
fn clock_outside_layout_range_is_an_error() {
    let config = GeneratorConfig::new(Duration::from_millis(1_000), 10, 10, 12).unwrap();
    let early = SnowflakeGenerator::from_source(
        config,
        InstanceSource::Fallback(0),
        MockTime { millis: 999 },
        FixedRand(0),
    )
    .unwrap();
    assert_eq!(
        early.try_poll_id(),
        Err(Error::ClockBeforeEpoch {
            now_ms: 999,
            epoch_ms: 1_000
        })
    );

    let late = SnowflakeGenerator::from_source(
        config,
        InstanceSource::Fallback(0),
        MockTime {
            millis: 1_000 + 1_024,
        },
        FixedRand(0),
    )
    .unwrap();
    assert_eq!(
        late.try_poll_id(),
        Err(Error::TimestampOverflow {
            elapsed_ms: 1_024,
            max: 1_023
        })
    );
}

#[test]
fn static_pair_lands_in_instance_field() {
    let generator = SnowflakeGenerator::with_static(9, 7).unwrap();
    let id = generator.next_id().unwrap();
    let parts = id.decode(generator.config());
    assert_eq!(parts.instance, (7 << 5) | 9);

    assert!(matches!(
        SnowflakeGenerator::with_static(32, 0),
        Err(Error::InvalidConfig { .. })
    ));
    assert!(matches!(
        SnowflakeGenerator::with_static(0, 32),
        Err(Error::InvalidConfig { .. })
    ));
}

#[test]
fn legacy_worker_id_splits_into_pair() {
    let generator = SnowflakeGenerator::with_legacy_worker_id(0b00111_01001).unwrap();
    let id = generator.next_id().unwrap();
    assert_eq!(id.instance(generator.config()), 0b00111_01001);

    assert!(SnowflakeGenerator::with_legacy_worker_id(1023).is_ok());
    assert!(matches!(
        SnowflakeGenerator::with_legacy_worker_id(1024),
        Err(Error::InvalidConfig { .. })
    ));
}

#[test]
fn oversized_fallback_value_is_rejected() {
    assert_eq!(
        SnowflakeGenerator::from_source(
            unix_config(),
            InstanceSource::Fallback(1024),
            MockTime { millis: 1 },
            FixedRand(0),
        )
        .err(),
        Some(Error::InstanceOutOfRange {
            value: 1024,
            max: 1023
        })
    );
}

#[test]
fn leased_generator_fails_until_slot_is_held() {
    let ensemble = MemoryEnsemble::new();
    let config = LeaseConfig::new("/ids", 10)
        .unwrap()
        .with_retry(RetryPolicy::never());
    let manager = Arc::new(LeaseManager::new(Arc::new(ensemble.connect()), config).unwrap());
    let generator = SnowflakeGenerator::from_source(
        unix_config(),
        InstanceSource::Leased(Arc::clone(&manager)),
        MockTime { millis: 5 },
        FixedRand(0),
    )
    .unwrap();

    assert_eq!(generator.try_poll_id(), Err(Error::InstanceUnavailable));
    assert_eq!(generator.state().last_timestamp, None);

    assert_eq!(manager.acquire().unwrap(), 0);
    let id = generator.next_id().unwrap();
    assert_eq!(id.instance(generator.config()), 0);

    manager.release().unwrap();
    assert_eq!(generator.next_id(), Err(Error::InstanceUnavailable));
}

#[test]
fn lease_range_must_fit_instance_field() {
    let ensemble = MemoryEnsemble::new();
    let config = LeaseConfig::new("/ids", 11).unwrap();
    let manager = Arc::new(LeaseManager::new(Arc::new(ensemble.connect()), config).unwrap());
    assert!(matches!(
        SnowflakeGenerator::with_lease(manager),
        Err(Error::InvalidConfig { .. })
    ));
}

#[test]
fn late_identity_is_picked_up() {
    let identity = Arc::new(IdentityProvider::new());
    let generator = SnowflakeGenerator::new(
        unix_config(),
        Arc::clone(&identity),
        MockTime { millis: 9 },
        FixedRand(0),
    );
    identity.set(InstanceSource::Fallback(77)).unwrap();
    let id = generator.next_id().unwrap();
    assert_eq!(id.instance(generator.config()), 77);
}

#[test]
fn ids_strictly_increase() {
    let generator = SnowflakeGenerator::from_source(
        GeneratorConfig::default(),
        InstanceSource::Fallback(1),
        MonotonicClock::new(),
        ThreadRandom,
    )
    .unwrap();
    let config = *generator.config();

    let mut last = generator.next_id().unwrap();
    for _ in 0..16_384 {
        let id = generator.next_id().unwrap();
        assert!(id > last, "{id:?} after {last:?}");
        if id.timestamp(&config) == last.timestamp(&config) {
            assert_eq!(id.sequence(&config), last.sequence(&config) + 1);
        }
        last = id;
    }
}

#[test]
fn ids_are_unique_across_threads() {
    const THREADS: usize = 8;
    const IDS_PER_THREAD: usize = 4096;

    let generator = SnowflakeGenerator::from_source(
        GeneratorConfig::default(),
        InstanceSource::Fallback(1),
        MonotonicClock::new(),
        ThreadRandom,
    )
    .unwrap();

    let batches: Vec<Vec<Identifier>> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let generator = generator.clone();
                s.spawn(move || {
                    let mut ids = Vec::with_capacity(IDS_PER_THREAD);
                    let mut last = None;
                    for _ in 0..IDS_PER_THREAD {
                        let id = generator.next_id().unwrap();
                        assert!(last.is_none_or(|last| id > last));
                        last = Some(id);
                        ids.push(id);
                    }
                    ids
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let seen: HashSet<Identifier> = batches.into_iter().flatten().collect();
    assert_eq!(seen.len(), THREADS * IDS_PER_THREAD);
}
