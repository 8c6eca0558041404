//! Session manager: the single owner of "which run is being tracked".
//!
//! `current_run_id` is mirrored in memory and in the durable [`SessionMarker`],
//! and is the only input to [`RunManager::is_tracking_run`]. Whether the
//! location source is actually delivering is tracked separately
//! ([`RunManager::is_delivering`]); after a restart the id can be set while no
//! subscription exists yet, and [`RunManager::open`] resumes delivery when
//! configured to.
//!
//! Locking: transitions (start/stop) are serialized by `transition`; the
//! session fields sit behind an `RwLock`. Sample inserts and store reads hold
//! the read lock, so they never interleave with a state mutation. Delivery is
//! ended with no session lock held, because the delivery worker needs the
//! read lock to drain queued samples.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tracing::{debug, info, warn};

use crate::config::TrackerConfig;
use crate::error::{Result, TrackerError};
use crate::location::{DeliveryQueue, LocationEvent, LocationSource, SubscriptionHandle};
use crate::marker::SessionMarker;
use crate::run::{now_millis, LocationSample, Run};
use crate::store::{RunCursor, RunStore};

/// What happened to a sample handed to [`RunManager::insert_location`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Persisted under the current run with this row id.
    Stored(i64),
    /// No run was current; the sample was dropped.
    Discarded,
    /// The store rejected the write; already logged.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub current_run: Option<Run>,
    pub tracking: bool,
    pub delivering: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SessionOptions {
    resume_on_start: bool,
    seed_from_last_known: bool,
    queue_capacity: usize,
}

impl SessionOptions {
    fn from_config(config: &TrackerConfig) -> Self {
        Self {
            resume_on_start: config.session.resume_on_start,
            seed_from_last_known: config.session.seed_from_last_known,
            queue_capacity: config.delivery.queue_capacity,
        }
    }
}

struct Delivery {
    handle: SubscriptionHandle,
    queue: DeliveryQueue,
}

#[derive(Default)]
struct Session {
    current_run_id: Option<i64>,
    delivery: Option<Delivery>,
}

pub struct RunManager {
    store: RunStore,
    marker: SessionMarker,
    source: Arc<dyn LocationSource>,
    options: SessionOptions,
    transition: Mutex<()>,
    session: RwLock<Session>,
    this: Weak<RunManager>,
}

impl RunManager {
    /// Builds the manager and restores the persisted current run.
    ///
    /// A persisted id that no longer names a stored run is dropped. With
    /// `session.resume_on_start`, delivery restarts for a restored run.
    pub fn open(
        store: RunStore,
        marker: SessionMarker,
        source: Arc<dyn LocationSource>,
        config: &TrackerConfig,
    ) -> Result<Arc<Self>> {
        let restored = restore_current_run(&store, &marker)?;
        let options = SessionOptions::from_config(config);

        let manager = Arc::new_cyclic(|this| Self {
            store,
            marker,
            source,
            options,
            transition: Mutex::new(()),
            session: RwLock::new(Session {
                current_run_id: restored,
                delivery: None,
            }),
            this: this.clone(),
        });

        if let Some(run_id) = restored {
            info!(run_id, "Restored current run from session marker");
            if options.resume_on_start {
                let _transition = manager.transition_lock();
                if let Err(err) = manager.resume_delivery() {
                    warn!(run_id, error = %err, "Failed to resume location delivery");
                }
            }
        }

        Ok(manager)
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    /// Creates a run, makes it current and starts location delivery.
    ///
    /// The run is seeded with the source's cached fix, re-timestamped to now,
    /// so the first point is best effort and may carry a synthetic timestamp.
    /// Fails with [`TrackerError::AlreadyTracking`] while another run is
    /// current.
    pub fn start_new_run(&self) -> Result<Run> {
        let _transition = self.transition_lock();
        if let Some(run_id) = self.session_read().current_run_id {
            return Err(TrackerError::AlreadyTracking { run_id });
        }

        let mut run = Run::new();
        run.id = self.store.insert_run(&run)?;
        info!(run_id = run.id, start_date = run.start_date, "Run created");

        let cached_fix = if self.options.seed_from_last_known {
            self.source.last_known()
        } else {
            None
        };

        self.activate(&run)?;

        if let Some(fix) = cached_fix {
            let seed = fix.retimestamped(now_millis());
            debug!(run_id = run.id, provider = %seed.provider, "Seeding run with cached fix");
            self.insert_location(seed);
        }

        Ok(run)
    }

    /// Makes an existing run current and starts delivery for it.
    ///
    /// Calling this for the run that is already current restarts delivery if
    /// it was lost and is otherwise a no-op.
    pub fn start_tracking_run(&self, run: &Run) -> Result<()> {
        if !run.is_saved() {
            return Err(TrackerError::UnsavedRun);
        }

        let _transition = self.transition_lock();
        let (current, delivering) = {
            let session = self.session_read();
            (session.current_run_id, session.delivery.is_some())
        };

        match current {
            Some(run_id) if run_id == run.id => {
                if delivering {
                    debug!(run_id, "Run already tracked");
                    Ok(())
                } else {
                    info!(run_id, "Resuming delivery for current run");
                    self.resume_delivery()
                }
            }
            Some(run_id) => Err(TrackerError::AlreadyTracking { run_id }),
            None => {
                if self.store.query_run(run.id)?.is_none() {
                    return Err(TrackerError::RunNotFound(run.id));
                }
                self.activate(run)
            }
        }
    }

    /// Stops delivery and clears the current run.
    ///
    /// Samples already queued are stored under the run before it is cleared.
    /// The marker is cleared before the in-memory id; if that fails the run
    /// stays current (without delivery) and the error is returned.
    pub fn stop_run(&self) -> Result<()> {
        let _transition = self.transition_lock();

        let delivery = self.session_write().delivery.take();
        match delivery {
            Some(delivery) => self.end_delivery(delivery),
            None => debug!("No delivery subscription held"),
        }

        self.marker.clear()?;
        let previous = self.session_write().current_run_id.take();

        match previous {
            Some(run_id) => info!(run_id, "Run stopped"),
            None => debug!("Stop requested with no current run"),
        }
        Ok(())
    }

    /// True while a run is current, whether or not samples are flowing.
    pub fn is_tracking_run(&self) -> bool {
        self.session_read().current_run_id.is_some()
    }

    /// True while the location source holds a subscription for us.
    pub fn is_delivering(&self) -> bool {
        self.session_read().delivery.is_some()
    }

    /// True if `run` is the current run.
    pub fn is_tracking(&self, run: &Run) -> bool {
        run.is_saved() && self.session_read().current_run_id == Some(run.id)
    }

    pub fn current_run_id(&self) -> Option<i64> {
        self.session_read().current_run_id
    }

    /// Stores `sample` under the current run, or drops it when none is.
    pub fn insert_location(&self, sample: LocationSample) -> InsertOutcome {
        let session = self.session_read();
        let Some(run_id) = session.current_run_id else {
            warn!(
                provider = %sample.provider,
                timestamp = sample.timestamp,
                "Location received with no tracking run; ignoring"
            );
            return InsertOutcome::Discarded;
        };

        match self.store.insert_location(run_id, &sample) {
            Ok(row_id) => {
                debug!(
                    run_id,
                    provider = %sample.provider,
                    latitude = sample.latitude,
                    longitude = sample.longitude,
                    "Location stored"
                );
                InsertOutcome::Stored(row_id)
            }
            Err(err) => {
                warn!(run_id, error = %err, "Failed to store location");
                InsertOutcome::Failed
            }
        }
    }

    pub fn get_run(&self, id: i64) -> Result<Option<Run>> {
        let _session = self.session_read();
        self.store.query_run(id)
    }

    pub fn get_current_run(&self) -> Result<Option<Run>> {
        let session = self.session_read();
        match session.current_run_id {
            Some(run_id) => self.store.query_run(run_id),
            None => Ok(None),
        }
    }

    /// All runs by start date. The cursor reads lazily and takes no session
    /// lock, so a run started mid-iteration may or may not appear.
    pub fn query_runs(&self) -> RunCursor<'_> {
        self.store.query_runs()
    }

    pub fn get_last_location_for_run(&self, run_id: i64) -> Result<Option<LocationSample>> {
        let _session = self.session_read();
        self.store.query_last_location_for_run(run_id)
    }

    pub fn status(&self) -> Result<SessionStatus> {
        let session = self.session_read();
        let current_run = match session.current_run_id {
            Some(run_id) => self.store.query_run(run_id)?,
            None => None,
        };
        Ok(SessionStatus {
            current_run,
            tracking: session.current_run_id.is_some(),
            delivering: session.delivery.is_some(),
        })
    }

    fn handle_event(&self, event: LocationEvent) {
        match event {
            LocationEvent::Sample(sample) => {
                self.insert_location(sample);
            }
            LocationEvent::ProviderStatus { provider, enabled } => {
                info!(provider = %provider, enabled, "Location provider status changed");
            }
        }
    }

    /// Persists and publishes `run` as current, then begins delivery. Rolls
    /// back to idle if delivery cannot start. Caller holds `transition`.
    fn activate(&self, run: &Run) -> Result<()> {
        self.marker.store(run.id)?;
        self.session_write().current_run_id = Some(run.id);

        if let Err(err) = self.resume_delivery() {
            warn!(run_id = run.id, error = %err, "Failed to start location delivery");
            self.session_write().current_run_id = None;
            if let Err(clear_err) = self.marker.clear() {
                warn!(error = %clear_err, "Failed to roll back session marker");
            }
            return Err(err);
        }

        info!(run_id = run.id, "Tracking run");
        Ok(())
    }

    /// Caller holds `transition`.
    fn resume_delivery(&self) -> Result<()> {
        let this = self.this.clone();
        let queue = DeliveryQueue::spawn(self.options.queue_capacity, move |event| {
            if let Some(manager) = this.upgrade() {
                manager.handle_event(event);
            }
        })?;
        let handle = self.source.begin(queue.sink())?;
        info!(
            provider = %self.source.provider(),
            handle = handle.id(),
            "Location delivery started"
        );

        let replaced = self
            .session_write()
            .delivery
            .replace(Delivery { handle, queue });
        if let Some(stale) = replaced {
            self.end_delivery(stale);
        }
        Ok(())
    }

    /// Must be called with no session lock held.
    fn end_delivery(&self, delivery: Delivery) {
        self.source.end(delivery.handle);
        let dropped = delivery.queue.dropped();
        delivery.queue.close();
        info!(handle = delivery.handle.id(), dropped, "Location delivery ended");
    }

    fn transition_lock(&self) -> MutexGuard<'_, ()> {
        self.transition
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn session_read(&self) -> RwLockReadGuard<'_, Session> {
        self.session
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn session_write(&self) -> RwLockWriteGuard<'_, Session> {
        self.session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// Ends delivery but leaves the run current. Events still queued at this point
// are dropped; `stop_run` is the path that drains them.
impl Drop for RunManager {
    fn drop(&mut self) {
        let delivery = self
            .session
            .get_mut()
            .map(|session| session.delivery.take())
            .unwrap_or_else(|poisoned| poisoned.into_inner().delivery.take());
        if let Some(delivery) = delivery {
            delivery.queue.reject_new();
            self.source.end(delivery.handle);
        }
    }
}

fn restore_current_run(store: &RunStore, marker: &SessionMarker) -> Result<Option<i64>> {
    let persisted = match marker.load() {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "Failed to read session marker; starting idle");
            return Ok(None);
        }
    };

    let Some(run_id) = persisted else {
        return Ok(None);
    };

    if store.query_run(run_id)?.is_some() {
        return Ok(Some(run_id));
    }

    warn!(run_id, "Session marker names a missing run; clearing it");
    marker.clear()?;
    Ok(None)
}
