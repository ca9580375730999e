use core::fmt;
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, AtomicU64, Ordering};
use std::{
    net::Ipv4Addr,
    sync::{Arc, Weak},
    thread::{self, JoinHandle},
    time::{Instant, SystemTime},
};
use tokio::sync::watch;
use tracing::instrument;

use crate::{
    ensemble::{ConnectivityReceiver, ConnectivityState, Ensemble, EnsembleError, RetryPolicy},
    error::{Error, Result},
    fallback,
    lease::{LeaseConfig, parse_slot, smallest_free_slot},
};

const NO_SLOT: u64 = u64::MAX;

/// A held instance slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    pub slot: u64,
    /// Path of the ephemeral membership entry advertising the slot.
    pub node_path: String,
    pub held_since: SystemTime,
}

#[derive(Debug, Default)]
struct LeaseState {
    lease: Option<Lease>,
    /// Membership entry we failed to delete while disconnected.
    stale_node: Option<String>,
    /// The distributed lock could not be released while disconnected, so
    /// the ensemble may still list this session as its owner.
    stale_lock: bool,
    /// Cleared by an explicit release; reconnects only reacquire while set.
    wanted: bool,
}

/// Releases the distributed lock when dropped. A failed release is
/// recorded in `stale` and retried before the lock is taken again.
struct DistributedLock<'a> {
    ensemble: &'a dyn Ensemble,
    path: &'a str,
    stale: &'a mut bool,
}

impl Drop for DistributedLock<'_> {
    fn drop(&mut self) {
        *self.stale = !unlock(self.ensemble, self.path);
    }
}

/// Returns `false` if the ensemble may still consider the lock held.
fn unlock(ensemble: &dyn Ensemble, path: &str) -> bool {
    match ensemble.unlock(path) {
        // An expired session or a lock we no longer own holds nothing.
        Ok(()) | Err(EnsembleError::NotLocked { .. } | EnsembleError::SessionExpired) => true,
        Err(err) => {
            tracing::warn!(%err, path, "failed to release distributed lock");
            false
        }
    }
}

/// Leases a fleet-unique instance slot from a coordination ensemble.
///
/// At most one slot is held at a time. A slot is the smallest integer not
/// advertised by any other live member under `<base>/instances`, computed
/// while holding the distributed lock at `<base>/lock`, and advertised by an
/// ephemeral entry tied to this client's session.
///
/// State transitions are serialized by an internal mutex. The slot exposed
/// through [`LeaseManager::current_slot`] is published separately through an
/// atomic so minting threads never wait on ensemble round-trips.
///
/// ```text
///   UNLEASED --acquire ok--> LEASED
///   LEASED --release | SUSPENDED | LOST--> UNLEASED
///   UNLEASED --CONNECTED | RECONNECTED--> acquire
/// ```
pub struct LeaseManager {
    ensemble: Arc<dyn Ensemble>,
    config: LeaseConfig,
    metadata: Vec<u8>,
    state: Mutex<LeaseState>,
    published: AtomicU64,
    /// Bumped on every SUSPENDED or LOST notification.
    generation: AtomicU64,
    shut_down: AtomicBool,
    last_reacquire_error: Mutex<Option<Error>>,
    /// Flipped on shutdown; dropping it also stops the watcher.
    stop: watch::Sender<bool>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseManager")
            .field("config", &self.config)
            .field("current_slot", &self.current_slot())
            .finish_non_exhaustive()
    }
}

impl LeaseManager {
    /// Creates a manager without acquiring a slot or watching connectivity.
    /// The instances path is created if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EnsembleUnavailable`] if the instances path cannot be
    /// created.
    pub fn new(ensemble: Arc<dyn Ensemble>, config: LeaseConfig) -> Result<Self> {
        let instances = config.instances_path();
        match config.retry().run(|| ensemble.create_persistent(&instances)) {
            Ok(()) => tracing::debug!(path = %instances, "created instances path"),
            Err(EnsembleError::NodeExists { .. }) => {}
            Err(err) => return Err(Error::ensemble(format!("creating {instances}"), err)),
        }

        Ok(Self {
            ensemble,
            config,
            metadata: process_metadata(),
            state: Mutex::new(LeaseState::default()),
            published: AtomicU64::new(NO_SLOT),
            generation: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
            last_reacquire_error: Mutex::new(None),
            stop: watch::Sender::new(false),
            watcher: Mutex::new(None),
        })
    }

    /// Creates a manager, acquires the initial slot and starts the
    /// connectivity watcher thread.
    ///
    /// # Errors
    ///
    /// Any error of [`LeaseManager::new`] or [`LeaseManager::acquire`], or
    /// [`Error::WatcherSpawn`].
    pub fn start(ensemble: Arc<dyn Ensemble>, config: LeaseConfig) -> Result<Arc<Self>> {
        // Subscribe first so no transition between acquisition and watching
        // is missed.
        let events = ensemble.subscribe();
        let manager = Arc::new(Self::new(ensemble, config)?);
        manager.acquire()?;
        manager.watch(events)?;
        Ok(manager)
    }

    /// Spawns a thread that feeds `events` into
    /// [`LeaseManager::handle_connectivity`]. The thread exits as soon as the
    /// stream closes or the manager is shut down or dropped, without waiting
    /// for another transition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WatcherSpawn`] if the thread or its event loop cannot
    /// be created.
    pub fn watch(self: &Arc<Self>, mut events: ConnectivityReceiver) -> Result<()> {
        let spawn_error = |err: std::io::Error| Error::WatcherSpawn {
            reason: err.to_string(),
        };
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .map_err(spawn_error)?;
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut stop = self.stop.subscribe();

        let handle = thread::Builder::new()
            .name("slotflake-lease-watcher".into())
            .spawn(move || {
                runtime.block_on(async move {
                    if *stop.borrow_and_update() {
                        return;
                    }
                    loop {
                        let event = tokio::select! {
                            event = events.recv() => match event {
                                Some(event) => event,
                                None => break,
                            },
                            // Shutdown, or the sender went away with the manager.
                            _ = stop.changed() => break,
                        };
                        let Some(manager) = weak.upgrade() else {
                            break;
                        };
                        if manager.shut_down.load(Ordering::Acquire) {
                            break;
                        }
                        manager.on_transition(event);
                    }
                });
                tracing::debug!("connectivity watcher exiting");
            })
            .map_err(spawn_error)?;
        *self.watcher.lock() = Some(handle);
        Ok(())
    }

    fn on_transition(&self, event: ConnectivityState) {
        match self.handle_connectivity(event) {
            Ok(_) => *self.last_reacquire_error.lock() = None,
            Err(err) => {
                tracing::error!(%err, state = %event, "failed to reacquire instance slot");
                *self.last_reacquire_error.lock() = Some(err);
            }
        }
    }

    /// Whether a connectivity watcher thread is still running.
    pub fn is_watching(&self) -> bool {
        self.watcher
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Returns the held slot, acquiring one if none is held.
    ///
    /// Idempotent: with a lease in place this returns immediately without
    /// contacting the ensemble. Otherwise it takes the distributed lock,
    /// lists the live members, picks the smallest free slot and registers an
    /// ephemeral entry for it. The lock is released on every exit path.
    ///
    /// May block for ensemble round-trips and lock contention; do not call it
    /// from the minting hot path.
    ///
    /// # Errors
    ///
    /// - [`Error::CapacityExceeded`] if every slot up to the maximum is taken
    /// - [`Error::LockAcquisition`] if the distributed lock cannot be taken
    /// - [`Error::EnsembleUnavailable`] if listing or registration fails
    /// - [`Error::SessionLost`] if the session was suspended or lost while
    ///   the acquisition was in flight
    #[instrument(level = "debug", skip(self), fields(base_path = %self.config.base_path()))]
    pub fn acquire(&self) -> Result<u64> {
        let mut state = self.state.lock();
        // Sampled under the state lock, so only disconnects observed while
        // this acquisition runs abandon it.
        let generation = self.generation.load(Ordering::SeqCst);
        state.wanted = true;
        if let Some(lease) = &state.lease {
            tracing::debug!(slot = lease.slot, "lease already held, returning current slot");
            return Ok(lease.slot);
        }

        let started = Instant::now();
        self.delete_stale(&mut state);
        self.unlock_stale(&mut state);
        let result = self.register(&mut state.stale_lock, generation);
        tracing::debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "slot acquisition finished"
        );
        let lease = result?;
        let slot = lease.slot;

        // A disconnect notification bumps the generation before clearing
        // `published`, so checking after the store cannot leave a stale
        // slot visible.
        self.published.store(slot, Ordering::SeqCst);
        if self.generation.load(Ordering::SeqCst) != generation {
            self.published.store(NO_SLOT, Ordering::SeqCst);
            self.abandon(&mut state, lease.node_path);
            return Err(Error::SessionLost);
        }

        tracing::info!(slot, node = %lease.node_path, "acquired instance slot");
        state.lease = Some(lease);
        Ok(slot)
    }

    fn register(&self, stale_lock: &mut bool, generation: u64) -> Result<Lease> {
        let retry = self.config.retry();
        let lock_path = self.config.lock_path();
        retry
            .run(|| self.ensemble.lock(&lock_path, self.config.lock_timeout()))
            .map_err(|source| {
                self.classify(
                    generation,
                    Error::LockAcquisition {
                        path: lock_path.clone(),
                        source,
                    },
                )
            })?;
        let _lock = DistributedLock {
            ensemble: &*self.ensemble,
            path: &lock_path,
            stale: stale_lock,
        };

        let instances = self.config.instances_path();
        let children = retry
            .run(|| self.ensemble.children(&instances))
            .map_err(|err| self.classify(generation, Error::ensemble("listing members", err)))?;

        let mut slots = Vec::with_capacity(children.len());
        for child in &children {
            match parse_slot(child) {
                Some(slot) => slots.push(slot),
                None => tracing::warn!(%child, "ignoring unrecognized membership entry"),
            }
        }

        let slot = smallest_free_slot(&mut slots);
        let max = self.config.max_slot();
        if slot > max {
            tracing::error!(slot, max, members = slots.len(), "instance slots exhausted");
            return Err(Error::CapacityExceeded { slot, max });
        }

        let path = self.config.member_path(slot);
        let node_path = retry
            .run(|| self.ensemble.create_ephemeral(&path, &self.metadata))
            .map_err(|err| {
                self.classify(generation, Error::ensemble("registering membership", err))
            })?;
        tracing::debug!(%node_path, "registered membership entry");

        Ok(Lease {
            slot,
            node_path,
            held_since: SystemTime::now(),
        })
    }

    /// Replaces `err` with [`Error::SessionLost`] when a disconnect was
    /// observed since `generation` was sampled.
    fn classify(&self, generation: u64, err: Error) -> Error {
        if self.generation.load(Ordering::SeqCst) == generation {
            err
        } else {
            tracing::debug!(%err, "acquisition raced a disconnect");
            Error::SessionLost
        }
    }

    fn abandon(&self, state: &mut LeaseState, node_path: String) {
        match self.ensemble.delete(&node_path) {
            Ok(()) | Err(EnsembleError::NoNode { .. } | EnsembleError::SessionExpired) => {}
            Err(err) => {
                tracing::warn!(%err, %node_path, "could not remove abandoned membership entry");
                state.stale_node = Some(node_path);
            }
        }
    }

    fn delete_stale(&self, state: &mut LeaseState) {
        let Some(node_path) = state.stale_node.take() else {
            return;
        };
        match self.ensemble.delete(&node_path) {
            Ok(()) => tracing::warn!(%node_path, "deleted stale membership entry"),
            Err(EnsembleError::NoNode { .. } | EnsembleError::SessionExpired) => {}
            Err(err) => {
                tracing::warn!(%err, %node_path, "stale membership entry is still present");
                state.stale_node = Some(node_path);
            }
        }
    }

    fn unlock_stale(&self, state: &mut LeaseState) {
        if state.stale_lock {
            let path = self.config.lock_path();
            state.stale_lock = !unlock(&*self.ensemble, &path);
            if !state.stale_lock {
                tracing::warn!(%path, "released distributed lock left behind by a disconnect");
            }
        }
    }

    /// Deletes the membership entry, if any, and clears the local lease.
    ///
    /// An entry that is already gone (for example because the session
    /// expired) counts as released. After an explicit release, reconnect
    /// notifications no longer reacquire a slot until
    /// [`LeaseManager::acquire`] is called again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EnsembleUnavailable`] if the entry could not be
    /// deleted. The local lease is cleared regardless and the entry is
    /// deleted before the next acquisition.
    #[instrument(level = "debug", skip(self))]
    pub fn release(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.wanted = false;
        self.unlock_stale(&mut state);
        self.release_locked(&mut state, self.config.retry())
    }

    fn release_locked(&self, state: &mut LeaseState, retry: &RetryPolicy) -> Result<()> {
        self.published.store(NO_SLOT, Ordering::SeqCst);
        let Some(lease) = state.lease.take() else {
            return Ok(());
        };

        match retry.run(|| self.ensemble.delete(&lease.node_path)) {
            Ok(()) => {
                tracing::info!(slot = lease.slot, "released instance slot");
                Ok(())
            }
            Err(EnsembleError::NoNode { .. } | EnsembleError::SessionExpired) => {
                tracing::debug!(node = %lease.node_path, "membership entry already gone");
                Ok(())
            }
            Err(err) => {
                state.stale_node = Some(lease.node_path);
                Err(Error::ensemble("releasing instance slot", err))
            }
        }
    }

    /// The currently held slot. Never blocks.
    pub fn current_slot(&self) -> Option<u64> {
        let slot = self.published.load(Ordering::SeqCst);
        (slot != NO_SLOT).then_some(slot)
    }

    /// Snapshot of the held lease. Waits for an in-flight acquisition.
    pub fn lease(&self) -> Option<Lease> {
        self.state.lock().lease.clone()
    }

    /// Reacts to a connectivity transition.
    ///
    /// SUSPENDED and LOST drop the local lease immediately (without retries;
    /// the ensemble is unreachable or the entry is already gone). CONNECTED
    /// and RECONNECTED wait for the client to be connected and reacquire,
    /// unless the lease was explicitly released or the manager shut down.
    ///
    /// Returns the slot held after the transition.
    ///
    /// # Errors
    ///
    /// Any error of [`LeaseManager::acquire`], or
    /// [`Error::EnsembleUnavailable`] if the client does not report itself
    /// connected within the reconnect timeout.
    pub fn handle_connectivity(&self, event: ConnectivityState) -> Result<Option<u64>> {
        if event.is_disconnect() {
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.published.store(NO_SLOT, Ordering::SeqCst);

            let mut state = self.state.lock();
            tracing::info!(state = %event, "ensemble connection interrupted, releasing instance slot");
            if let Err(err) = self.release_locked(&mut state, &RetryPolicy::never()) {
                tracing::warn!(%err, "membership entry left behind, deleting before next acquisition");
            }
            return Ok(None);
        }

        if self.shut_down.load(Ordering::Acquire) || !self.state.lock().wanted {
            return Ok(self.current_slot());
        }
        if !self.ensemble.wait_connected(self.config.reconnect_timeout()) {
            return Err(Error::ensemble(
                "waiting for reconnection",
                EnsembleError::ConnectionLoss,
            ));
        }
        tracing::info!(state = %event, "ensemble connection available, acquiring instance slot");
        self.acquire().map(Some)
    }

    /// The error of the most recent failed reacquisition on the watcher
    /// thread; cleared by the next successful transition.
    pub fn last_reacquire_error(&self) -> Option<Error> {
        self.last_reacquire_error.lock().clone()
    }

    /// Releases the lease and stops reacting to connectivity transitions.
    ///
    /// # Errors
    ///
    /// See [`LeaseManager::release`].
    ///
    /// Waits for the watcher thread to exit unless called from it.
    pub fn shutdown(&self) -> Result<()> {
        self.shut_down.store(true, Ordering::Release);
        self.stop.send_replace(true);
        let watcher = self.watcher.lock().take();
        if let Some(handle) = watcher {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::warn!("connectivity watcher panicked");
            }
        }
        self.release()
    }

    pub const fn config(&self) -> &LeaseConfig {
        &self.config
    }

    pub const fn max_slot(&self) -> u64 {
        self.config.max_slot()
    }
}

impl Drop for LeaseManager {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.stale_lock {
            unlock(&*self.ensemble, &self.config.lock_path());
        }
        let Some(lease) = state.lease.take() else {
            return;
        };
        match self.ensemble.delete(&lease.node_path) {
            Ok(()) | Err(EnsembleError::NoNode { .. } | EnsembleError::SessionExpired) => {
                tracing::debug!(slot = lease.slot, "released instance slot on drop");
            }
            Err(err) => {
                tracing::warn!(%err, slot = lease.slot, "failed to release instance slot on drop");
            }
        }
    }
}

/// Membership entry payload: `<hostname>/<ipv4>:<pid>`.
fn process_metadata() -> Vec<u8> {
    let host = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let ip = fallback::local_ipv4().unwrap_or(Ipv4Addr::UNSPECIFIED);
    format!("{host}/{ip}:{}", std::process::id()).into_bytes()
}
