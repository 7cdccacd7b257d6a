//! The host's concurrency control loop.
//!
//! On every tick the [ConcurrencyThrottleManager] closes each function's sample window, adjusts
//! its concurrency, and publishes a [HostConcurrencySnapshot] when something changed. Listeners
//! query decisions synchronously, without ever waiting on storage.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::Duration,
};

use chrono::{DateTime, Utc};
use conv::ConvUtil;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    clock::{Clock, SystemClock},
    error::{Error, Result},
    repository::ConcurrencyStatusRepository,
    snapshot::HostConcurrencySnapshot,
    throttle::{
        ConcurrencyOptions, FunctionState, Phase, Sample, ThrottleProvider, ThrottleStatus,
    },
    Outcome,
};

/// Computes and publishes per-function concurrency for this host.
pub struct ConcurrencyThrottleManager {
    options: ConcurrencyOptions,
    repository: Arc<dyn ConcurrencyStatusRepository>,
    throttles: Vec<Arc<dyn ThrottleProvider>>,
    clock: Arc<dyn Clock>,
    number_of_cores: u32,

    /// Read on every listener query. Lock order: `functions`, then `decisions`.
    decisions: RwLock<HashMap<String, u32>>,
    functions: Mutex<HashMap<String, FunctionState>>,

    /// Held for the whole of an evaluation, so evaluations (and writes) never overlap.
    publish: tokio::sync::Mutex<PublishState>,
}

#[derive(Debug, Default)]
struct PublishState {
    /// The startup snapshot has been read (or there was nothing usable to read).
    initialized: bool,
    last_published: Option<HostConcurrencySnapshot>,
    /// The timestamp of this host's snapshot from before a restart. Later snapshots never predate
    /// it, even if the clock does.
    min_timestamp: Option<DateTime<Utc>>,
    /// The last write failed, so publish on the next tick regardless.
    write_pending: bool,
}

/// The outcome of one evaluation tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    /// Every function's concurrency after this tick.
    pub snapshot: HostConcurrencySnapshot,
    /// Whether the snapshot was written to the repository.
    pub published: bool,
}

impl fmt::Debug for ConcurrencyThrottleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyThrottleManager")
            .field("options", &self.options)
            .field("throttles", &self.throttles)
            .field("number_of_cores", &self.number_of_cores)
            .finish_non_exhaustive()
    }
}

impl ConcurrencyThrottleManager {
    /// Fails if `options` are invalid.
    pub fn new(
        options: ConcurrencyOptions,
        repository: Arc<dyn ConcurrencyStatusRepository>,
    ) -> Result<Self> {
        options.validate()?;

        let number_of_cores = std::thread::available_parallelism()
            .map_or(1, |n| u32::try_from(n.get()).unwrap_or(u32::MAX));

        Ok(Self {
            options,
            repository,
            throttles: Vec::new(),
            clock: Arc::new(SystemClock),
            number_of_cores,
            decisions: RwLock::new(HashMap::new()),
            functions: Mutex::new(HashMap::new()),
            publish: tokio::sync::Mutex::new(PublishState::default()),
        })
    }

    /// Add a source of host-wide throttle signals.
    pub fn with_throttle(mut self, throttle: Arc<dyn ThrottleProvider>) -> Self {
        self.throttles.push(throttle);
        self
    }

    #[allow(missing_docs)]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Override the detected number of cores.
    pub fn with_number_of_cores(mut self, cores: u32) -> Self {
        assert!(cores > 0);
        self.number_of_cores = cores;
        self
    }

    #[allow(missing_docs)]
    pub fn options(&self) -> &ConcurrencyOptions {
        &self.options
    }

    /// The concurrency `function_id` may currently run at.
    ///
    /// Never blocks on storage. A function seen for the first time starts warming up at its
    /// configured floor.
    pub fn get_current_concurrency(&self, function_id: &str) -> u32 {
        if let Some(concurrency) = self.read_decisions().get(function_id) {
            return *concurrency;
        }

        self.with_function(function_id, |state| state.concurrency())
    }

    /// Record the result of one job, to be taken into account at the next evaluation.
    pub fn record_sample(
        &self,
        function_id: &str,
        latency: Duration,
        in_flight: usize,
        outcome: Outcome,
    ) {
        self.with_function(function_id, |state| {
            state.record(Sample::new(latency, in_flight, outcome));
        });
    }

    /// Stop `function_id` until it is [resume](Self::resume)d. Its concurrency is zero meanwhile.
    pub fn pause(&self, function_id: &str) {
        self.with_function(function_id, FunctionState::pause);
        tracing::info!(function_id, "Function paused");
    }

    /// Restore the concurrency `function_id` had before it was paused.
    pub fn resume(&self, function_id: &str) {
        let limits = self.options.limits_for(function_id);
        let concurrency = self.with_function(function_id, |state| {
            state.resume(limits);
            state.concurrency()
        });
        tracing::info!(function_id, concurrency, "Function resumed");
    }

    /// Where `function_id` is in its lifecycle, if it's known.
    pub fn phase(&self, function_id: &str) -> Option<Phase> {
        self.lock_functions().get(function_id).map(FunctionState::phase)
    }

    /// The current decisions for every known function, as a snapshot taken now.
    pub fn snapshot(&self) -> HostConcurrencySnapshot {
        let mut snapshot = HostConcurrencySnapshot::new(self.number_of_cores, self.clock.now());
        for (function_id, concurrency) in self.read_decisions().iter() {
            snapshot = snapshot.with_function(function_id.clone(), *concurrency);
        }
        snapshot
    }

    /// The last snapshot successfully written to the repository.
    pub async fn last_published(&self) -> Option<HostConcurrencySnapshot> {
        self.publish.lock().await.last_published.clone()
    }

    /// Run [evaluate](Self::evaluate) every evaluation interval until `cancel` is cancelled.
    ///
    /// The first evaluation happens immediately.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.options.evaluation_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.evaluate(&cancel).await;
                }
            }
        }

        tracing::debug!("Concurrency evaluation stopped");
    }

    /// [run](Self::run) on a new task.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.run(cancel).await })
    }

    /// One tick: adjust every function, then publish if warranted.
    ///
    /// Storage failures are logged and retried on later ticks, never returned.
    pub async fn evaluate(&self, cancel: &CancellationToken) -> Evaluation {
        let mut publish = self.publish.lock().await;

        let mut persist = self.options.snapshot_persistence_enabled;
        if persist && !publish.initialized {
            persist = self.initialize(&mut publish, cancel).await;
        }

        let status = ThrottleStatus::combine(self.throttles.iter().map(|t| t.status()));
        if !status.enabled_throttles.is_empty() {
            tracing::debug!(throttles = ?status.enabled_throttles, "Host throttles enabled");
        }
        let decisions = self.adjust_all(&status);

        let now = self.clock.now();
        let floor = publish
            .last_published
            .as_ref()
            .map(|last| last.timestamp)
            .max(publish.min_timestamp);
        let timestamp = floor.map_or(now, |floor| now.max(floor));
        let mut snapshot = HostConcurrencySnapshot::new(self.number_of_cores, timestamp);
        for (function_id, concurrency) in decisions {
            snapshot = snapshot.with_function(function_id, concurrency);
        }

        let mut published = false;
        if persist && self.should_publish(&publish, &snapshot, now) {
            published = self.write(&mut publish, &snapshot, cancel).await;
        }

        Evaluation {
            snapshot,
            published,
        }
    }

    /// Read this host's previous snapshot, and seed warming functions from it.
    ///
    /// Returns `false` if the host ID couldn't be resolved, in which case nothing should be
    /// persisted this tick.
    async fn initialize(&self, publish: &mut PublishState, cancel: &CancellationToken) -> bool {
        match self.repository.read(cancel).await {
            Ok(Some(previous)) => {
                publish.initialized = true;
                publish.min_timestamp = Some(previous.timestamp);
                if self.is_fresh(&previous) {
                    self.seed(&previous);
                } else {
                    tracing::info!(
                        timestamp = %previous.timestamp,
                        "Ignoring stale concurrency status"
                    );
                }
                true
            }
            Ok(None) => {
                publish.initialized = true;
                true
            }
            Err(Error::Cancelled) => false,
            Err(e @ Error::HostId(_)) => {
                tracing::warn!(error = %e, "Unable to resolve host ID, skipping persistence");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read concurrency status, starting fresh");
                publish.initialized = true;
                true
            }
        }
    }

    fn is_fresh(&self, snapshot: &HostConcurrencySnapshot) -> bool {
        let Some(max_age) = self.options.snapshot_max_age else {
            return true;
        };
        age(self.clock.now(), snapshot.timestamp) <= max_age
    }

    /// Scale a previous snapshot to this host's core count and start warming functions from it.
    fn seed(&self, previous: &HostConcurrencySnapshot) {
        let scale = f64::from(self.number_of_cores) / f64::from(previous.number_of_cores.max(1));

        let mut functions = self.lock_functions();
        let mut decisions = self.write_decisions();

        for (function_id, function) in &previous.function_snapshots {
            let limits = self.options.limits_for(function_id);
            let scaled = (f64::from(function.concurrency) * scale)
                .floor()
                .approx_as::<u32>()
                .unwrap_or(limits.max);

            let state = functions
                .entry(function_id.clone())
                .or_insert_with(|| FunctionState::new(limits));

            if state.seed(scaled, limits) {
                let concurrency = state.concurrency();
                decisions.insert(function_id.clone(), concurrency);

                if concurrency != function.concurrency {
                    tracing::debug!(
                        function_id = %function_id,
                        previous = function.concurrency,
                        concurrency,
                        "Adjusted previous concurrency for this host"
                    );
                }
                tracing::info!(function_id = %function_id, concurrency, "Resuming concurrency");
            }
        }
    }

    fn adjust_all(&self, status: &ThrottleStatus) -> HashMap<String, u32> {
        let mut functions = self.lock_functions();

        let decisions: HashMap<String, u32> = functions
            .iter_mut()
            .map(|(function_id, state)| {
                let limits = self.options.limits_for(function_id);
                let before = (state.phase(), state.concurrency());

                let concurrency = state.evaluate(status.state, &self.options, limits);

                if before != (state.phase(), concurrency) {
                    tracing::debug!(
                        function_id = %function_id,
                        phase = ?state.phase(),
                        from = before.1,
                        to = concurrency,
                        "Concurrency adjusted"
                    );
                }
                (function_id.clone(), concurrency)
            })
            .collect();

        *self.write_decisions() = decisions.clone();
        decisions
    }

    fn should_publish(
        &self,
        publish: &PublishState,
        snapshot: &HostConcurrencySnapshot,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(last) = &publish.last_published else {
            return true;
        };

        publish.write_pending
            || snapshot.differs_from(last, self.options.publish_threshold)
            || age(now, last.timestamp) >= self.options.heartbeat_interval
    }

    /// Returns whether the write succeeded.
    async fn write(
        &self,
        publish: &mut PublishState,
        snapshot: &HostConcurrencySnapshot,
        cancel: &CancellationToken,
    ) -> bool {
        match self.repository.write(snapshot, cancel).await {
            Ok(()) => {
                tracing::debug!(
                    functions = snapshot.function_snapshots.len(),
                    timestamp = %snapshot.timestamp,
                    "Published concurrency status"
                );
                publish.last_published = Some(snapshot.clone());
                publish.write_pending = false;
                true
            }
            Err(Error::Cancelled) => false,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to publish concurrency status, will retry");
                publish.write_pending = true;
                false
            }
        }
    }

    /// Run `f` on a function's state, registering the function if it's new, and keep the
    /// published decision in sync.
    fn with_function<T>(&self, function_id: &str, f: impl FnOnce(&mut FunctionState) -> T) -> T {
        let mut functions = self.lock_functions();
        let state = functions
            .entry(function_id.to_string())
            .or_insert_with(|| FunctionState::new(self.options.limits_for(function_id)));

        let result = f(state);

        let concurrency = state.concurrency();
        let mut decisions = self.write_decisions();
        if decisions.get(function_id) != Some(&concurrency) {
            decisions.insert(function_id.to_string(), concurrency);
        }
        result
    }

    fn lock_functions(&self) -> std::sync::MutexGuard<'_, HashMap<String, FunctionState>> {
        self.functions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_decisions(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, u32>> {
        self.decisions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_decisions(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, u32>> {
        self.decisions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// How long ago `then` was. Zero if it's in the future.
fn age(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::TimeZone;

    use crate::{
        clock::ManualClock,
        host_id::{FixedHostIdProvider, HostIdProvider},
        repository::{
            BlobStorageConcurrencyStatusRepository, NullConcurrencyStatusRepository,
            HOSTS_CONTAINER_NAME,
        },
        storage::{memory::InMemoryBlobService, BlobServiceClient, StorageError},
        throttle::{ManualThrottle, ThrottleState},
    };

    use super::*;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    struct Harness {
        manager: ConcurrencyThrottleManager,
        repository: Arc<BlobStorageConcurrencyStatusRepository>,
        service: InMemoryBlobService,
        clock: Arc<ManualClock>,
        cancel: CancellationToken,
    }

    const STATUS_PATH: &str = "concurrency/test123/concurrencyStatus.json";

    /// Fails to resolve the host ID a number of times, then resolves `test123`.
    #[derive(Debug)]
    struct FlakyHostIdProvider {
        failures: AtomicUsize,
    }

    #[async_trait]
    impl HostIdProvider for FlakyHostIdProvider {
        async fn get_host_id(&self, _cancel: &CancellationToken) -> Result<String> {
            let failed = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(Error::HostId("identity service unavailable".into()));
            }
            Ok("test123".to_string())
        }
    }

    fn harness(options: ConcurrencyOptions) -> Harness {
        harness_with(options, Arc::new(FixedHostIdProvider::new("test123").unwrap()))
    }

    fn harness_with(options: ConcurrencyOptions, host_ids: Arc<dyn HostIdProvider>) -> Harness {
        let service = InMemoryBlobService::new();
        let repository = Arc::new(BlobStorageConcurrencyStatusRepository::new(
            Some(Arc::new(service.clone())),
            host_ids,
        ));
        let clock = Arc::new(ManualClock::new(start()));
        let manager = ConcurrencyThrottleManager::new(options, repository.clone())
            .unwrap()
            .with_clock(clock.clone())
            .with_number_of_cores(4);

        Harness {
            manager,
            repository,
            service,
            clock,
            cancel: CancellationToken::new(),
        }
    }

    /// Store raw content as this host's status, bypassing the repository.
    async fn put_status(service: &InMemoryBlobService, content: &str) {
        let container = service.container(HOSTS_CONTAINER_NAME);
        container.create_if_not_exists().await.unwrap();
        container.upload_text(STATUS_PATH, content).await.unwrap();
    }

    fn busy(manager: &ConcurrencyThrottleManager, function_id: &str) {
        let concurrency = manager.get_current_concurrency(function_id);
        manager.record_sample(
            function_id,
            Duration::from_millis(10),
            concurrency as usize,
            Outcome::Success,
        );
    }

    #[test]
    fn rejects_invalid_options() {
        let mut options = ConcurrencyOptions::default();
        options.decrease_factor = 2.0;

        assert!(matches!(
            ConcurrencyThrottleManager::new(options, Arc::new(NullConcurrencyStatusRepository)),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn unknown_functions_start_at_the_floor() {
        let options = ConcurrencyOptions::default().with_function_limits("big", 5, 100);
        let manager =
            ConcurrencyThrottleManager::new(options, Arc::new(NullConcurrencyStatusRepository))
                .unwrap();

        assert_eq!(manager.get_current_concurrency("f0"), 1);
        assert_eq!(manager.get_current_concurrency("big"), 5);
        assert_eq!(manager.phase("f0"), Some(Phase::Warming));
        assert_eq!(manager.snapshot().function_concurrency("big"), Some(5));
    }

    #[tokio::test]
    async fn increases_under_load_and_publishes() {
        let h = harness(ConcurrencyOptions::default());

        for _ in 0..3 {
            busy(&h.manager, "f0");
            h.manager.evaluate(&h.cancel).await;
        }

        assert_eq!(h.manager.get_current_concurrency("f0"), 4);
        assert_eq!(h.manager.phase("f0"), Some(Phase::Increasing));

        let stored = h.repository.read(&h.cancel).await.unwrap().unwrap();
        assert_eq!(stored.function_concurrency("f0"), Some(4));
        assert_eq!(stored.number_of_cores, 4);
        assert_eq!(h.manager.last_published().await, Some(stored));
    }

    #[tokio::test]
    async fn decreases_when_host_is_throttled() {
        let throttle = Arc::new(ManualThrottle::new("cpu"));
        let mut h = harness(ConcurrencyOptions::default().decrease_factor(0.5));
        h.manager = h.manager.with_throttle(throttle.clone());

        for _ in 0..9 {
            busy(&h.manager, "f0");
            h.manager.evaluate(&h.cancel).await;
        }
        assert_eq!(h.manager.get_current_concurrency("f0"), 10);

        throttle.set(ThrottleState::Enabled);
        busy(&h.manager, "f0");
        h.manager.evaluate(&h.cancel).await;

        assert_eq!(h.manager.get_current_concurrency("f0"), 5);
        assert_eq!(h.manager.phase("f0"), Some(Phase::Decreasing));
    }

    #[tokio::test]
    async fn publishes_only_on_change_or_heartbeat() {
        let h = harness(
            ConcurrencyOptions::default().with_heartbeat_interval(Duration::from_secs(60)),
        );
        h.manager.get_current_concurrency("f0");

        assert!(h.manager.evaluate(&h.cancel).await.published, "first publish");
        h.clock.advance(chrono::Duration::seconds(1));
        assert!(!h.manager.evaluate(&h.cancel).await.published, "no change");

        busy(&h.manager, "f0");
        h.clock.advance(chrono::Duration::seconds(1));
        assert!(h.manager.evaluate(&h.cancel).await.published, "changed");

        h.clock.advance(chrono::Duration::seconds(30));
        assert!(!h.manager.evaluate(&h.cancel).await.published);
        h.clock.advance(chrono::Duration::seconds(30));
        assert!(h.manager.evaluate(&h.cancel).await.published, "heartbeat");

        h.manager.get_current_concurrency("f1");
        h.clock.advance(chrono::Duration::seconds(1));
        assert!(
            h.manager.evaluate(&h.cancel).await.published,
            "function set changed"
        );
    }

    #[tokio::test]
    async fn publish_threshold() {
        let h = harness(ConcurrencyOptions::default().with_publish_threshold(2));
        h.manager.get_current_concurrency("f0");
        h.manager.evaluate(&h.cancel).await;

        busy(&h.manager, "f0");
        let evaluation = h.manager.evaluate(&h.cancel).await;
        assert_eq!(evaluation.snapshot.function_concurrency("f0"), Some(2));
        assert!(!evaluation.published, "within threshold");

        busy(&h.manager, "f0");
        h.manager.evaluate(&h.cancel).await;
        busy(&h.manager, "f0");
        assert!(h.manager.evaluate(&h.cancel).await.published, "4 - 1 > 2");
    }

    #[tokio::test]
    async fn failed_writes_are_retried() {
        let h = harness(ConcurrencyOptions::default());
        h.manager.get_current_concurrency("f0");
        h.service
            .inject_upload_failure(StorageError::Transient("busy".into()))
            .await;

        assert!(!h.manager.evaluate(&h.cancel).await.published);
        assert_eq!(h.manager.last_published().await, None);

        assert!(h.manager.evaluate(&h.cancel).await.published, "retried without a change");
        assert!(h.manager.last_published().await.is_some());
    }

    #[tokio::test]
    async fn timestamps_never_go_backwards() {
        let h = harness(ConcurrencyOptions::default());
        h.manager.get_current_concurrency("f0");
        let first = h.manager.evaluate(&h.cancel).await;

        h.clock.advance(chrono::Duration::seconds(-30));
        h.manager.get_current_concurrency("f1");
        let second = h.manager.evaluate(&h.cancel).await;

        assert!(second.published);
        assert_eq!(second.snapshot.timestamp, first.snapshot.timestamp);
    }

    #[tokio::test]
    async fn timestamps_never_go_behind_the_previous_run() {
        let h = harness(ConcurrencyOptions::default());
        let previous =
            HostConcurrencySnapshot::new(4, start() + chrono::Duration::seconds(60))
                .with_function("f0", 5);
        h.repository.write(&previous, &h.cancel).await.unwrap();

        // This host's clock is now behind the one that wrote the previous snapshot.
        let evaluation = h.manager.evaluate(&h.cancel).await;

        assert!(evaluation.published);
        assert_eq!(evaluation.snapshot.timestamp, previous.timestamp);
        let stored = h.repository.read(&h.cancel).await.unwrap().unwrap();
        assert_eq!(stored.timestamp, previous.timestamp);
        assert_eq!(stored.function_concurrency("f0"), Some(5));
    }

    #[tokio::test]
    async fn host_id_failure_skips_persistence_until_resolved() {
        let h = harness_with(
            ConcurrencyOptions::default(),
            Arc::new(FlakyHostIdProvider {
                failures: AtomicUsize::new(1),
            }),
        );
        let previous = HostConcurrencySnapshot::new(4, start()).with_function("f0", 5);
        put_status(&h.service, &previous.to_json().unwrap()).await;
        let uploads = h.service.upload_count().await;

        let first = h.manager.evaluate(&h.cancel).await;
        assert!(!first.published);
        assert_eq!(h.manager.phase("f0"), None, "not seeded yet");
        assert_eq!(h.service.upload_count().await, uploads);

        let second = h.manager.evaluate(&h.cancel).await;
        assert!(second.published);
        assert_eq!(h.manager.get_current_concurrency("f0"), 5);
    }

    #[tokio::test]
    async fn corrupt_snapshot_starts_warming() {
        let h = harness(ConcurrencyOptions::default());
        h.manager.get_current_concurrency("f0");
        put_status(&h.service, "{\"NumberOfCores\":").await;

        let evaluation = h.manager.evaluate(&h.cancel).await;

        assert!(evaluation.published);
        assert_eq!(h.manager.phase("f0"), Some(Phase::Warming));
        assert_eq!(h.manager.get_current_concurrency("f0"), 1);
        let stored = h.repository.read(&h.cancel).await.unwrap().unwrap();
        assert_eq!(stored.function_concurrency("f0"), Some(1));
    }

    #[tokio::test]
    async fn read_failure_starts_fresh() {
        let h = harness(ConcurrencyOptions::default());
        h.manager.get_current_concurrency("f0");
        let previous = HostConcurrencySnapshot::new(4, start()).with_function("f0", 8);
        put_status(&h.service, &previous.to_json().unwrap()).await;
        for _ in 0..2 {
            h.service
                .inject_download_failure(StorageError::Transient("timeout".into()))
                .await;
        }

        let evaluation = h.manager.evaluate(&h.cancel).await;
        assert!(evaluation.published, "publishes anyway");
        assert_eq!(h.manager.get_current_concurrency("f0"), 1);
        assert_eq!(h.manager.phase("f0"), Some(Phase::Warming));

        // Started fresh, so the read isn't attempted again.
        h.manager.evaluate(&h.cancel).await;
        assert!(
            h.service
                .container(HOSTS_CONTAINER_NAME)
                .download_text(STATUS_PATH)
                .await
                .is_err(),
            "second fault should be left over"
        );
        assert_eq!(h.manager.get_current_concurrency("f0"), 1);
    }

    #[tokio::test]
    async fn resumes_from_previous_snapshot() {
        let h = harness(ConcurrencyOptions::default().with_function_limits("small", 1, 3));
        let previous = HostConcurrencySnapshot::new(2, start())
            .with_function("f0", 5)
            .with_function("small", 10)
            .with_function("paused", 0);
        h.repository.write(&previous, &h.cancel).await.unwrap();

        h.manager.evaluate(&h.cancel).await;

        // Scaled from 2 cores to 4.
        assert_eq!(h.manager.get_current_concurrency("f0"), 10);
        assert_eq!(h.manager.get_current_concurrency("small"), 3);
        assert_eq!(h.manager.get_current_concurrency("paused"), 1);
    }

    #[tokio::test]
    async fn ignores_stale_snapshot() {
        let h = harness(
            ConcurrencyOptions::default().with_snapshot_max_age(Duration::from_secs(60)),
        );
        let previous = HostConcurrencySnapshot::new(4, start()).with_function("f0", 5);
        h.repository.write(&previous, &h.cancel).await.unwrap();
        h.clock.advance(chrono::Duration::seconds(61));

        h.manager.evaluate(&h.cancel).await;

        assert_eq!(h.manager.get_current_concurrency("f0"), 1);
    }

    #[tokio::test]
    async fn seeds_only_warming_functions() {
        let h = harness(ConcurrencyOptions::default());
        let previous = HostConcurrencySnapshot::new(4, start()).with_function("f0", 8);
        h.repository.write(&previous, &h.cancel).await.unwrap();

        busy(&h.manager, "f0");
        h.manager.evaluate(&h.cancel).await;

        // Seeded to 8 before the window was evaluated.
        assert_eq!(h.manager.get_current_concurrency("f0"), 8);
    }

    #[tokio::test]
    async fn persistence_disabled() {
        let h = harness(ConcurrencyOptions::default().with_snapshot_persistence(false));
        let previous = HostConcurrencySnapshot::new(4, start()).with_function("f0", 8);
        h.repository.write(&previous, &h.cancel).await.unwrap();
        let uploads = h.service.upload_count().await;

        let evaluation = h.manager.evaluate(&h.cancel).await;

        assert!(!evaluation.published);
        assert_eq!(h.manager.get_current_concurrency("f0"), 1);
        assert_eq!(h.service.upload_count().await, uploads);
    }

    #[tokio::test]
    async fn pause_and_resume() {
        let h = harness(ConcurrencyOptions::default());
        busy(&h.manager, "f0");
        h.manager.evaluate(&h.cancel).await;
        assert_eq!(h.manager.get_current_concurrency("f0"), 2);

        h.manager.pause("f0");
        assert_eq!(h.manager.get_current_concurrency("f0"), 0);
        let evaluation = h.manager.evaluate(&h.cancel).await;
        assert_eq!(evaluation.snapshot.function_concurrency("f0"), Some(0));
        assert!(evaluation.published);

        h.manager.resume("f0");
        assert_eq!(h.manager.get_current_concurrency("f0"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn run_until_cancelled() {
        let h = harness(ConcurrencyOptions::default());
        let manager = Arc::new(h.manager);
        manager.get_current_concurrency("f0");

        let handle = manager.spawn(h.cancel.clone());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(manager.last_published().await.is_some(), "evaluated on start");

        busy(&manager, "f0");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(manager.get_current_concurrency("f0"), 2);

        h.cancel.cancel();
        handle.await.unwrap();
    }
}
