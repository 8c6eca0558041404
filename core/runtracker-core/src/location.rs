//! Location sources and sample delivery.
//!
//! A [`LocationSource`] pushes [`LocationEvent`]s into a [`SampleSink`] from
//! whatever thread it likes. The manager never lets a source call into the
//! store directly: sinks feed a bounded [`DeliveryQueue`] whose worker thread
//! does the persisting, so a slow disk never stalls the source. When the queue
//! is full the sample is dropped and counted.
//!
//! Two sources ship with the crate: [`ManualLocationSource`] (samples pushed
//! in-process, used by the CLI and tests) and [`ReplayLocationSource`] (a JSON
//! lines file played back on a background thread, the simulated provider).

use fs_err as fs;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::ProviderConfig;
use crate::error::{Result, TrackerError};
use crate::run::LocationSample;

const REPLAY_POLL_INTERVAL: Duration = Duration::from_millis(10);
const BACKPRESSURE_RETRY_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq)]
pub enum LocationEvent {
    Sample(LocationSample),
    /// The source's provider was switched on or off. Informational only.
    ProviderStatus { provider: String, enabled: bool },
}

/// Callback a source delivers events into. Cheap to clone.
///
/// Live sources use [`SampleSink::sample`], which never waits. Sources that
/// can pace themselves (a replayed track) use [`SampleSink::sample_blocking`]
/// so nothing is dropped when the consumer falls behind.
#[derive(Clone)]
pub struct SampleSink {
    deliver: Arc<dyn Fn(LocationEvent) + Send + Sync>,
    deliver_blocking: Arc<dyn Fn(LocationEvent) + Send + Sync>,
}

impl SampleSink {
    /// A sink with one delivery path for both modes.
    pub fn new(deliver: impl Fn(LocationEvent) + Send + Sync + 'static) -> Self {
        let deliver: Arc<dyn Fn(LocationEvent) + Send + Sync> = Arc::new(deliver);
        Self {
            deliver_blocking: Arc::clone(&deliver),
            deliver,
        }
    }

    pub fn with_backpressure(
        deliver: impl Fn(LocationEvent) + Send + Sync + 'static,
        deliver_blocking: impl Fn(LocationEvent) + Send + Sync + 'static,
    ) -> Self {
        Self {
            deliver: Arc::new(deliver),
            deliver_blocking: Arc::new(deliver_blocking),
        }
    }

    pub fn deliver(&self, event: LocationEvent) {
        (self.deliver)(event)
    }

    pub fn sample(&self, sample: LocationSample) {
        self.deliver(LocationEvent::Sample(sample))
    }

    /// Waits for room instead of dropping.
    pub fn sample_blocking(&self, sample: LocationSample) {
        (self.deliver_blocking)(LocationEvent::Sample(sample))
    }
}

impl fmt::Debug for SampleSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleSink").finish_non_exhaustive()
    }
}

/// Identifies one active delivery subscription on a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Platform location mechanism, as seen by the session manager.
pub trait LocationSource: Send + Sync {
    /// Name of the provider fixes come from (`gps`, `TEST_PROVIDER`, ...).
    fn provider(&self) -> String;

    /// Starts delivering events into `sink` until [`LocationSource::end`].
    fn begin(&self, sink: SampleSink) -> Result<SubscriptionHandle>;

    /// Stops delivery. Unknown or already-ended handles are ignored.
    fn end(&self, handle: SubscriptionHandle);

    /// The most recent cached fix, which may be arbitrarily old.
    fn last_known(&self) -> Option<LocationSample>;
}

/// Chooses which provider a source should use.
///
/// A configured test provider wins when it is available and enabled;
/// otherwise the default provider is used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderPolicy {
    pub default: String,
    pub test_provider: String,
    pub prefer_test_provider: bool,
}

impl ProviderPolicy {
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            default: config.default.clone(),
            test_provider: config.test_provider.clone(),
            prefer_test_provider: config.prefer_test_provider,
        }
    }

    pub fn select(&self, is_available_and_enabled: impl Fn(&str) -> bool) -> String {
        if self.prefer_test_provider
            && !self.test_provider.is_empty()
            && is_available_and_enabled(&self.test_provider)
        {
            return self.test_provider.clone();
        }
        self.default.clone()
    }
}

impl Default for ProviderPolicy {
    fn default() -> Self {
        Self::from_config(&ProviderConfig::default())
    }
}

enum QueueMessage {
    Event(LocationEvent),
    Shutdown,
}

/// Bounded hand-off between a source and the thread that persists samples.
pub struct DeliveryQueue {
    sender: SyncSender<QueueMessage>,
    closed: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
}

impl DeliveryQueue {
    pub fn spawn(
        capacity: usize,
        mut handler: impl FnMut(LocationEvent) + Send + 'static,
    ) -> Result<Self> {
        let (sender, receiver) = mpsc::sync_channel::<QueueMessage>(capacity.max(1));
        let worker = thread::Builder::new()
            .name("runtracker-delivery".to_string())
            .spawn(move || {
                while let Ok(message) = receiver.recv() {
                    match message {
                        QueueMessage::Event(event) => handler(event),
                        QueueMessage::Shutdown => break,
                    }
                }
                tracing::debug!("Delivery worker exiting");
            })
            .map_err(|err| TrackerError::io("Failed to spawn delivery worker", err))?;

        Ok(Self {
            sender,
            closed: Arc::new(AtomicBool::new(false)),
            dropped: Arc::new(AtomicU64::new(0)),
            worker: Some(worker),
        })
    }

    /// A sink that enqueues without blocking on [`SampleSink::sample`] and
    /// waits for room on [`SampleSink::sample_blocking`].
    pub fn sink(&self) -> SampleSink {
        let sender = self.sender.clone();
        let closed = Arc::clone(&self.closed);
        let dropped = Arc::clone(&self.dropped);
        let try_deliver = move |event| {
            if closed.load(Ordering::Acquire) {
                tracing::debug!("Delivery queue closed; dropping location event");
                return;
            }
            match sender.try_send(QueueMessage::Event(event)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(dropped = total, "Delivery queue full; dropping location event");
                }
                Err(TrySendError::Disconnected(_)) => {
                    tracing::debug!("Delivery worker gone; dropping location event");
                }
            }
        };

        let sender = self.sender.clone();
        let closed = Arc::clone(&self.closed);
        let deliver = move |event| {
            // Polls rather than `send` so a closed queue releases the caller.
            let mut message = QueueMessage::Event(event);
            loop {
                if closed.load(Ordering::Acquire) {
                    tracing::debug!("Delivery queue closed; dropping location event");
                    return;
                }
                match sender.try_send(message) {
                    Ok(()) => return,
                    Err(TrySendError::Full(returned)) => {
                        message = returned;
                        thread::sleep(BACKPRESSURE_RETRY_INTERVAL);
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        tracing::debug!("Delivery worker gone; dropping location event");
                        return;
                    }
                }
            }
        };

        SampleSink::with_backpressure(try_deliver, deliver)
    }

    /// Events rejected because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Rejects further events, including from senders waiting for room.
    /// Events already queued are still handled.
    pub fn reject_new(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Processes everything already queued, then stops the worker.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.reject_new();
        let Some(worker) = self.worker.take() else {
            return;
        };
        // The last manager handle can be released from the worker itself; it
        // must not wait on its own queue.
        if worker.thread().id() == thread::current().id() {
            let _ = self.sender.try_send(QueueMessage::Shutdown);
            return;
        }
        let _ = self.sender.send(QueueMessage::Shutdown);
        if worker.join().is_err() {
            tracing::warn!("Delivery worker panicked");
        }
    }
}

impl Drop for DeliveryQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryQueue")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("dropped", &self.dropped())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Manual source
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ManualState {
    next_handle: u64,
    subscription: Option<(SubscriptionHandle, SampleSink)>,
    last_known: Option<LocationSample>,
    enabled: bool,
}

/// Source fed by the embedding process: whatever is pushed is delivered to
/// the active subscription.
#[derive(Debug)]
pub struct ManualLocationSource {
    provider: String,
    state: Mutex<ManualState>,
}

impl ManualLocationSource {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            state: Mutex::new(ManualState {
                enabled: true,
                ..ManualState::default()
            }),
        }
    }

    /// Records `sample` as the cached fix and delivers it if subscribed.
    /// Returns whether a subscription received it.
    pub fn push(&self, sample: LocationSample) -> bool {
        let sink = {
            let mut state = self.lock();
            state.last_known = Some(sample.clone());
            if !state.enabled {
                return false;
            }
            state.subscription.as_ref().map(|(_, sink)| sink.clone())
        };

        match sink {
            Some(sink) => {
                sink.sample(sample);
                true
            }
            None => false,
        }
    }

    pub fn set_last_known(&self, sample: Option<LocationSample>) {
        self.lock().last_known = sample;
    }

    /// Toggles the provider and notifies the active subscription.
    pub fn set_enabled(&self, enabled: bool) {
        let sink = {
            let mut state = self.lock();
            state.enabled = enabled;
            state.subscription.as_ref().map(|(_, sink)| sink.clone())
        };
        if let Some(sink) = sink {
            sink.deliver(LocationEvent::ProviderStatus {
                provider: self.provider.clone(),
                enabled,
            });
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    pub fn is_subscribed(&self) -> bool {
        self.lock().subscription.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, ManualState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LocationSource for ManualLocationSource {
    fn provider(&self) -> String {
        self.provider.clone()
    }

    fn begin(&self, sink: SampleSink) -> Result<SubscriptionHandle> {
        let mut state = self.lock();
        state.next_handle += 1;
        let handle = SubscriptionHandle::new(state.next_handle);
        if let Some((previous, _)) = state.subscription.replace((handle, sink)) {
            tracing::debug!(handle = previous.id(), "Replacing manual subscription");
        }
        Ok(handle)
    }

    fn end(&self, handle: SubscriptionHandle) {
        let mut state = self.lock();
        match &state.subscription {
            Some((active, _)) if *active == handle => {
                state.subscription = None;
            }
            _ => tracing::debug!(handle = handle.id(), "Ignoring stale subscription handle"),
        }
    }

    fn last_known(&self) -> Option<LocationSample> {
        self.lock().last_known.clone()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Replay source
// ─────────────────────────────────────────────────────────────────────────────

struct ReplayRun {
    handle: SubscriptionHandle,
    cancel: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

#[derive(Default)]
struct ReplayState {
    next_handle: u64,
    active: Option<ReplayRun>,
}

/// Plays a recorded track back as if it came from a live provider.
///
/// The file holds one JSON [`LocationSample`] per line; blank lines are
/// skipped. Samples without a provider are stamped with the source's.
pub struct ReplayLocationSource {
    provider: String,
    samples: Arc<Vec<LocationSample>>,
    interval: Duration,
    last_known: Arc<Mutex<Option<LocationSample>>>,
    state: Mutex<ReplayState>,
}

impl ReplayLocationSource {
    pub fn from_file(path: &Path, provider: impl Into<String>) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|err| TrackerError::io(format!("Failed to read {}", path.display()), err))?;

        let mut samples = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let sample: LocationSample = serde_json::from_str(line).map_err(|err| {
                TrackerError::json(
                    format!("Invalid sample at {}:{}", path.display(), index + 1),
                    err,
                )
            })?;
            samples.push(sample);
        }

        Ok(Self::from_samples(samples, provider))
    }

    pub fn from_samples(samples: Vec<LocationSample>, provider: impl Into<String>) -> Self {
        let provider = provider.into();
        let samples = samples
            .into_iter()
            .map(|mut sample| {
                if sample.provider.is_empty() {
                    sample.provider = provider.clone();
                }
                sample
            })
            .collect();

        Self {
            provider,
            samples: Arc::new(samples),
            interval: Duration::ZERO,
            last_known: Arc::new(Mutex::new(None)),
            state: Mutex::new(ReplayState::default()),
        }
    }

    /// Pause between consecutive samples.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Blocks until the active replay has delivered every sample or ended.
    pub fn wait(&self) {
        loop {
            let running = self
                .lock()
                .active
                .as_ref()
                .map(|run| !run.thread.is_finished())
                .unwrap_or(false);
            if !running {
                return;
            }
            thread::sleep(REPLAY_POLL_INTERVAL);
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReplayState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LocationSource for ReplayLocationSource {
    fn provider(&self) -> String {
        self.provider.clone()
    }

    fn begin(&self, sink: SampleSink) -> Result<SubscriptionHandle> {
        let mut state = self.lock();
        if let Some(previous) = state.active.take() {
            previous.cancel.store(true, Ordering::Release);
            let _ = previous.thread.join();
        }

        state.next_handle += 1;
        let handle = SubscriptionHandle::new(state.next_handle);
        let cancel = Arc::new(AtomicBool::new(false));

        let samples = Arc::clone(&self.samples);
        let last_known = Arc::clone(&self.last_known);
        let interval = self.interval;
        let thread_cancel = Arc::clone(&cancel);
        let thread = thread::Builder::new()
            .name("runtracker-replay".to_string())
            .spawn(move || {
                for (index, sample) in samples.iter().enumerate() {
                    if thread_cancel.load(Ordering::Acquire) {
                        tracing::debug!(delivered = index, "Replay cancelled");
                        return;
                    }
                    if index > 0 && !interval.is_zero() {
                        thread::sleep(interval);
                    }
                    if let Ok(mut cached) = last_known.lock() {
                        *cached = Some(sample.clone());
                    }
                    sink.sample_blocking(sample.clone());
                }
                tracing::debug!(delivered = samples.len(), "Replay finished");
            })
            .map_err(|err| TrackerError::io("Failed to spawn replay thread", err))?;

        state.active = Some(ReplayRun {
            handle,
            cancel,
            thread,
        });
        Ok(handle)
    }

    fn end(&self, handle: SubscriptionHandle) {
        let run = {
            let mut state = self.lock();
            match &state.active {
                Some(run) if run.handle == handle => state.active.take(),
                _ => None,
            }
        };

        match run {
            Some(run) => {
                run.cancel.store(true, Ordering::Release);
                if run.thread.join().is_err() {
                    tracing::warn!("Replay thread panicked");
                }
            }
            None => tracing::debug!(handle = handle.id(), "Ignoring stale subscription handle"),
        }
    }

    fn last_known(&self) -> Option<LocationSample> {
        self.last_known.lock().ok().and_then(|cached| cached.clone())
    }
}

impl fmt::Debug for ReplayLocationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplayLocationSource")
            .field("provider", &self.provider)
            .field("samples", &self.samples.len())
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}
