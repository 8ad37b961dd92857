use std::{
    error, fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use credence_clock::{Clock, DurationSecs, System, UnixTime};
use tokio::task::JoinHandle;

use crate::{
    backoff::{ErrorBackoff, ErrorBackoffConfig},
    config::CacheConfig,
    error::{FetchError, ResourceError},
    health::{HealthProbe, HealthStatus},
    jitter::JitterSource,
    outage::OutageCache,
    rate_limit::RateLimiter,
    retry::Retrier,
};

/// A freshly fetched value and the time at which it stops being valid
#[derive(Debug)]
pub struct Fetched<T> {
    /// The fetched value
    pub value: T,
    /// When the value stops being valid, if the value itself says so
    pub expires_at: Option<UnixTime>,
}

impl<T> Fetched<T> {
    /// A value with no intrinsic expiry
    pub fn new(value: T) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    /// A value that stops being valid at `expires_at`
    pub fn expiring_at(value: T, expires_at: UnixTime) -> Self {
        Self {
            value,
            expires_at: Some(expires_at),
        }
    }
}

/// A source of values for a [`CachedResource`]
#[async_trait]
pub trait Fetch: Send + Sync + 'static {
    /// The type of value fetched
    type Output: Send + Sync + 'static;

    /// Fetches a fresh value from the authority
    async fn fetch(&self) -> Result<Fetched<Self::Output>, FetchError>;
}

#[async_trait]
impl<F: Fetch> Fetch for Arc<F> {
    type Output = F::Output;

    async fn fetch(&self) -> Result<Fetched<Self::Output>, FetchError> {
        (**self).fetch().await
    }
}

/// A cached value along with its lifetime information
#[derive(Debug)]
pub struct CachedEntry<T> {
    value: Arc<T>,
    fetched_at: UnixTime,
    expires_at: UnixTime,
    refresh_at: UnixTime,
}

impl<T> CachedEntry<T> {
    /// The cached value
    #[inline]
    pub fn value(&self) -> &Arc<T> {
        &self.value
    }

    /// When the value was fetched
    #[inline]
    pub fn fetched_at(&self) -> UnixTime {
        self.fetched_at
    }

    /// When the value stops being served
    #[inline]
    pub fn expires_at(&self) -> UnixTime {
        self.expires_at
    }

    /// When a background refresh of the value should start
    #[inline]
    pub fn refresh_at(&self) -> UnixTime {
        self.refresh_at
    }

    /// Whether the value may be served as of `now`
    #[inline]
    pub fn is_valid_at(&self, now: UnixTime) -> bool {
        now < self.expires_at
    }

    /// Whether the value should be refreshed as of `now`
    #[inline]
    pub fn needs_refresh_at(&self, now: UnixTime) -> bool {
        now >= self.refresh_at
    }
}

/// Holds off read-triggered refreshes after one fails
#[derive(Debug)]
struct Deferral {
    backoff: ErrorBackoff,
    not_before: Option<UnixTime>,
}

impl Deferral {
    fn is_deferred_at(&self, now: UnixTime) -> bool {
        self.not_before.map_or(false, |t| now < t)
    }

    fn defer(&mut self, now: UnixTime) -> UnixTime {
        let not_before = self.backoff.failed_at(now);
        self.not_before = Some(not_before);
        not_before
    }

    fn clear(&mut self) {
        self.backoff.succeeded();
        self.not_before = None;
    }
}

struct Inner<F: Fetch, C> {
    name: String,
    fetcher: F,
    config: CacheConfig,
    clock: C,
    entry: ArcSwapOption<CachedEntry<F::Output>>,
    outage: Option<OutageCache<F::Output>>,
    retrier: Retrier,
    limiter: Option<RateLimiter>,
    single_flight: tokio::sync::Mutex<()>,
    attempts: AtomicU64,
    last_failure: parking_lot::Mutex<Option<FetchError>>,
    health: parking_lot::Mutex<Option<HealthStatus>>,
    background: parking_lot::Mutex<Option<JoinHandle<()>>>,
    deferral: parking_lot::Mutex<Deferral>,
    watcher: parking_lot::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// A value fetched from a remote authority and cached until it expires
///
/// Reads of a valid value are lock-free. Once the value is due for refresh, a
/// single background refresh is started while readers continue to receive the
/// current value. Once the value has expired, readers wait on a single shared
/// refresh, so that concurrent readers cause at most one fetch.
///
/// A failed refresh never discards a still-valid value. If no valid value
/// remains, the outage cache (when configured) covers `TemporarilyUnavailable`
/// and `Transport` failures.
pub struct CachedResource<F: Fetch, C = System> {
    inner: Arc<Inner<F, C>>,
}

impl<F: Fetch, C> Clone for CachedResource<F, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: Fetch, C> fmt::Debug for CachedResource<F, C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let entry = self.inner.entry.load();
        f.debug_struct("CachedResource")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .field("fetched_at", &entry.as_ref().map(|e| e.fetched_at))
            .field("expires_at", &entry.as_ref().map(|e| e.expires_at))
            .field("refresh_at", &entry.as_ref().map(|e| e.refresh_at))
            .finish()
    }
}

impl<F: Fetch> CachedResource<F> {
    /// Constructs a new, empty cached resource using the system clock
    pub fn new(name: impl Into<String>, fetcher: F, config: CacheConfig) -> Self {
        Self::with_clock(name, fetcher, config, System)
    }
}

impl<F, C> CachedResource<F, C>
where
    F: Fetch,
    C: Clock + Send + Sync + 'static,
{
    /// Constructs a new, empty cached resource using the given clock
    pub fn with_clock(name: impl Into<String>, fetcher: F, config: CacheConfig, clock: C) -> Self {
        let outage = config.outage_ttl().map(OutageCache::new);
        let limiter = config.rate_limit().map(RateLimiter::from_config);
        let retrier = Retrier::new(config.retry().clone());
        let deferral = Deferral {
            backoff: ErrorBackoff::new(config.refresh_backoff().clone()),
            not_before: None,
        };

        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                fetcher,
                config,
                clock,
                entry: ArcSwapOption::empty(),
                outage,
                retrier,
                limiter,
                single_flight: tokio::sync::Mutex::new(()),
                attempts: AtomicU64::new(0),
                last_failure: parking_lot::Mutex::new(None),
                health: parking_lot::Mutex::new(None),
                background: parking_lot::Mutex::new(None),
                deferral: parking_lot::Mutex::new(deferral),
                watcher: parking_lot::Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The name used to identify this resource in logs
    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The cache configuration
    #[inline]
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// The underlying fetcher
    #[inline]
    pub fn fetcher(&self) -> &F {
        &self.inner.fetcher
    }

    /// The current entry, if any, without performing any I/O
    ///
    /// The entry may be expired.
    pub fn entry(&self) -> Option<Arc<CachedEntry<F::Output>>> {
        self.inner.entry.load_full()
    }

    /// The current value, if any, without performing any I/O
    ///
    /// The value may be expired.
    pub fn peek(&self) -> Option<Arc<F::Output>> {
        self.entry().map(|e| Arc::clone(&e.value))
    }

    /// Performs the initial fetch if the resource is configured to be eager
    pub async fn start(&self) -> Result<(), ResourceError> {
        if self.inner.config.is_eager() {
            tracing::debug!(resource = %self.inner.name, "eagerly fetching resource");
            self.get(true).await?;
        }
        Ok(())
    }

    /// Gets the current value, fetching it if required
    ///
    /// With `force_refresh`, the value is fetched even when the current value is
    /// still valid. Concurrent callers share one fetch.
    pub async fn get(&self, force_refresh: bool) -> Result<Arc<F::Output>, ResourceError> {
        let observed = self.inner.attempts.load(Ordering::Acquire);

        if !force_refresh {
            let now = self.inner.clock.now();
            if let Some(entry) = self.inner.entry.load_full() {
                if entry.is_valid_at(now) {
                    if entry.needs_refresh_at(now) {
                        self.spawn_background_refresh(now);
                    }
                    tracing::trace!(resource = %self.inner.name, "serving cached value");
                    return Ok(Arc::clone(&entry.value));
                }
            }
        }

        let _guard = self.inner.single_flight.lock().await;
        let now = self.inner.clock.now();

        if self.inner.attempts.load(Ordering::Acquire) != observed {
            let last_failure = self.inner.last_failure.lock().clone();
            match last_failure {
                None => {
                    if let Some(entry) = self.inner.entry.load_full() {
                        tracing::trace!(
                            resource = %self.inner.name,
                            "refreshed by concurrent caller"
                        );
                        return Ok(Arc::clone(&entry.value));
                    }
                }
                Some(err) => {
                    tracing::trace!(
                        resource = %self.inner.name,
                        "concurrent refresh failed, reusing its outcome"
                    );
                    return self.fallback(ResourceError::Unavailable(err), now);
                }
            }
        }

        match self.refresh_locked(now).await {
            Ok(value) => Ok(value),
            Err(err) => self.fallback(err, self.inner.clock.now()),
        }
    }

    /// Fetches and installs a new value
    ///
    /// Must be called while holding the single-flight lock. Errors are returned
    /// without consulting any fallback.
    async fn refresh_locked(&self, now: UnixTime) -> Result<Arc<F::Output>, ResourceError> {
        let inner = &self.inner;

        if inner.entry.load().is_some() {
            if let Some(limiter) = &inner.limiter {
                if !limiter.try_acquire_at(now) {
                    tracing::debug!(resource = %inner.name, "refresh denied by rate limiter");
                    return Err(ResourceError::RateLimited);
                }
            }
        }

        tracing::debug!(resource = %inner.name, "refreshing resource");
        let timeout = inner.config.refresh_timeout();
        let result = tokio::time::timeout(timeout, inner.retrier.run(|| inner.fetcher.fetch()))
            .await
            .unwrap_or_else(|_| Err(FetchError::timeout(timeout)));

        let now = inner.clock.now();
        match result {
            Ok(fetched) => Ok(self.install(fetched, now)),
            Err(err) => {
                self.record_failure(&err, now);
                Err(ResourceError::Unavailable(err))
            }
        }
    }

    fn install(&self, fetched: Fetched<F::Output>, now: UnixTime) -> Arc<F::Output> {
        let inner = &self.inner;
        let schedule = inner.config.schedule(now, fetched.expires_at);
        let value = Arc::new(fetched.value);

        inner.entry.store(Some(Arc::new(CachedEntry {
            value: Arc::clone(&value),
            fetched_at: now,
            expires_at: schedule.expires_at,
            refresh_at: schedule.refresh_at,
        })));

        if let Some(outage) = &inner.outage {
            outage.store(Arc::clone(&value), now);
        }

        *inner.last_failure.lock() = None;
        inner.deferral.lock().clear();
        *inner.health.lock() = Some(HealthStatus::healthy(now));
        inner.attempts.fetch_add(1, Ordering::AcqRel);

        tracing::info!(
            resource = %inner.name,
            expires_at = schedule.expires_at.0,
            refresh_at = schedule.refresh_at.0,
            "resource refreshed"
        );

        value
    }

    fn record_failure(&self, err: &FetchError, now: UnixTime) {
        let inner = &self.inner;
        *inner.last_failure.lock() = Some(err.clone());
        *inner.health.lock() = Some(HealthStatus::unhealthy(now));
        inner.attempts.fetch_add(1, Ordering::AcqRel);
    }

    fn fallback(
        &self,
        err: ResourceError,
        now: UnixTime,
    ) -> Result<Arc<F::Output>, ResourceError> {
        let inner = &self.inner;

        if let Some(entry) = inner.entry.load_full() {
            if entry.is_valid_at(now) {
                tracing::warn!(
                    resource = %inner.name,
                    error = (&err as &dyn error::Error),
                    expires_at = entry.expires_at.0,
                    "refresh failed, serving current value"
                );
                return Ok(Arc::clone(&entry.value));
            }
        }

        let outage_allowed = match &err {
            ResourceError::Unavailable(fetch) => fetch.is_outage_cacheable(),
            ResourceError::RateLimited => true,
        };

        if outage_allowed {
            if let Some(value) = inner.outage.as_ref().and_then(|o| o.get(now)) {
                tracing::warn!(
                    resource = %inner.name,
                    error = (&err as &dyn error::Error),
                    "refresh failed, serving outage value"
                );
                return Ok(value);
            }
        }

        tracing::warn!(
            resource = %inner.name,
            error = (&err as &dyn error::Error),
            "refresh failed and no usable value is cached"
        );
        Err(err)
    }

    fn spawn_background_refresh(&self, now: UnixTime) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }

        if self.inner.deferral.lock().is_deferred_at(now) {
            tracing::trace!(resource = %self.inner.name, "background refresh deferred");
            return;
        }

        let mut slot = self.inner.background.lock();
        if slot.as_ref().map_or(false, |task| !task.is_finished()) {
            return;
        }

        tracing::debug!(resource = %self.inner.name, "starting background refresh");
        let this = self.clone();
        *slot = Some(tokio::spawn(async move { this.background_refresh().await }));
    }

    async fn background_refresh(&self) {
        let _guard = match self.inner.single_flight.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::trace!(resource = %self.inner.name, "refresh already in flight");
                return;
            }
        };

        let now = self.inner.clock.now();
        if let Some(entry) = self.inner.entry.load_full() {
            if entry.is_valid_at(now) && !entry.needs_refresh_at(now) {
                return;
            }
        }

        if let Err(err) = self.refresh_locked(now).await {
            let not_before = self.inner.deferral.lock().defer(self.inner.clock.now());
            tracing::warn!(
                resource = %self.inner.name,
                error = (&err as &dyn error::Error),
                not_before = not_before.0,
                "background refresh failed"
            );
        }
    }

    /// Spawns a task which proactively refreshes the value whenever it is due
    ///
    /// `jitter_source` picks the refresh time within each value's refresh window,
    /// so that multiple instances don't stampede the authority at the same time.
    /// Failed refreshes are retried with the given backoff. Any previously spawned
    /// watcher is replaced. The task stops once the resource is closed or dropped.
    pub fn spawn_watcher<J>(&self, jitter_source: J, backoff_config: ErrorBackoffConfig)
    where
        J: JitterSource + Send + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(forever_refresh(weak, jitter_source, backoff_config));

        if let Some(previous) = self.inner.watcher.lock().replace(task) {
            previous.abort();
        }
    }

    /// Cancels any background refresh and watcher
    ///
    /// Cached values remain readable, and foreground refreshes continue to work.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);

        if let Some(task) = self.inner.background.lock().take() {
            task.abort();
        }
        if let Some(task) = self.inner.watcher.lock().take() {
            task.abort();
        }

        tracing::debug!(resource = %self.inner.name, "resource closed");
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// The last recorded health, or whether a valid value is held if no fetch was attempted
    pub fn health_status(&self) -> HealthStatus {
        let now = self.inner.clock.now();
        match *self.inner.health.lock() {
            Some(status) => status,
            None => HealthStatus {
                timestamp: now,
                success: self
                    .inner
                    .entry
                    .load()
                    .as_ref()
                    .map_or(false, |e| e.is_valid_at(now)),
            },
        }
    }
}

#[async_trait]
impl<F, C> HealthProbe for CachedResource<F, C>
where
    F: Fetch,
    C: Clock + Send + Sync + 'static,
{
    async fn check(&self, refresh: bool) -> HealthStatus {
        let status = self.health_status();
        if status.success || !refresh {
            return status;
        }

        if let Err(err) = self.get(true).await {
            tracing::debug!(
                resource = %self.inner.name,
                error = (&err as &dyn error::Error),
                "health refresh failed"
            );
        }
        self.health_status()
    }
}

enum Delay {
    UntilTime(UnixTime),
    ForDuration(Duration),
}

async fn forever_refresh<F, C, J>(
    resource: Weak<Inner<F, C>>,
    mut jitter_source: J,
    backoff_config: ErrorBackoffConfig,
) where
    F: Fetch,
    C: Clock + Send + Sync + 'static,
    J: JitterSource,
{
    // The timer does not advance while a host is suspended, so long sleeps
    // are broken into heartbeats that re-check the clock.
    const HEARTBEAT: DurationSecs = DurationSecs(30);

    let mut backoff = ErrorBackoff::new(backoff_config);

    // The entry the current delay was computed from. Once it has been replaced by
    // another caller, the new entry is scheduled instead of being refreshed early.
    let mut scheduled = resource.upgrade().and_then(|inner| inner.entry.load_full());
    let mut delay = match &scheduled {
        Some(entry) => {
            Delay::UntilTime(jitter_source.refresh_point(entry.fetched_at, entry.refresh_at))
        }
        None => Delay::ForDuration(Duration::ZERO),
    };

    loop {
        match delay {
            Delay::ForDuration(d) => tokio::time::sleep(d).await,
            Delay::UntilTime(t) => loop {
                let now = match resource.upgrade() {
                    Some(inner) => inner.clock.now(),
                    None => return,
                };

                if now >= t {
                    tracing::trace!("resource due for refresh");
                    break;
                }

                let until_due = t - now;
                let sleep = until_due.min(HEARTBEAT);
                tracing::trace!(
                    delay = sleep.0,
                    until_due = until_due.0,
                    "resource not yet due, sleeping…"
                );
                tokio::time::sleep(sleep.into()).await;
            },
        }

        let this = match resource.upgrade() {
            Some(inner) => CachedResource { inner },
            None => {
                tracing::info!("resource dropped, halting refreshes");
                return;
            }
        };

        let result = {
            let _guard = this.inner.single_flight.lock().await;
            let now = this.inner.clock.now();
            match (this.inner.entry.load_full(), &scheduled) {
                (Some(current), Some(seen))
                    if !Arc::ptr_eq(&current, seen) && current.is_valid_at(now) =>
                {
                    tracing::trace!(resource = %this.inner.name, "refreshed by another caller");
                    Ok(())
                }
                _ => this.refresh_locked(now).await.map(|_| ()),
            }
        };

        delay = match result {
            Ok(()) => {
                backoff.succeeded();
                scheduled = this.entry();
                match &scheduled {
                    Some(entry) => {
                        tracing::debug!(
                            resource = %this.inner.name,
                            refresh_at = entry.refresh_at.0,
                            "waiting for resource to become due"
                        );
                        Delay::UntilTime(
                            jitter_source.refresh_point(entry.fetched_at, entry.refresh_at),
                        )
                    }
                    None => Delay::ForDuration(backoff.failed()),
                }
            }
            Err(error) => {
                let delay = backoff.failed();
                tracing::warn!(
                    resource = %this.inner.name,
                    error = (&error as &dyn error::Error),
                    delay_ms = delay.as_millis() as u64,
                    "error refreshing resource, will retry"
                );
                Delay::ForDuration(delay)
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicU32, Ordering},
    };

    use credence_clock::TestClock;
    use tokio::time::Instant;

    use super::*;
    use crate::{
        config::RetryConfig, error::ErrorKind, jitter::NullJitter, rate_limit::RateLimitConfig,
    };

    type Scripted = Result<(u32, Option<DurationSecs>), u16>;

    /// Replays scripted outcomes; the last outcome repeats once the script runs dry
    struct ScriptedFetch {
        clock: TestClock,
        script: parking_lot::Mutex<VecDeque<Scripted>>,
        latency: parking_lot::Mutex<VecDeque<Duration>>,
        calls: AtomicU32,
    }

    impl ScriptedFetch {
        fn new(clock: &TestClock, script: impl IntoIterator<Item = Scripted>) -> Arc<Self> {
            Arc::new(Self {
                clock: clock.clone(),
                script: parking_lot::Mutex::new(script.into_iter().collect()),
                latency: parking_lot::Mutex::new(VecDeque::new()),
                calls: AtomicU32::new(0),
            })
        }

        fn with_latency(self: Arc<Self>, latency: impl IntoIterator<Item = Duration>) -> Arc<Self> {
            *self.latency.lock() = latency.into_iter().collect();
            self
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetch for ScriptedFetch {
        type Output = u32;

        async fn fetch(&self) -> Result<Fetched<u32>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let latency = self.latency.lock().pop_front();
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }

            let outcome = {
                let mut script = self.script.lock();
                if script.len() > 1 {
                    script.pop_front()
                } else {
                    script.front().cloned()
                }
            };

            match outcome {
                Some(Ok((value, Some(lifetime)))) => {
                    Ok(Fetched::expiring_at(value, self.clock.now() + lifetime))
                }
                Some(Ok((value, None))) => Ok(Fetched::new(value)),
                Some(Err(status)) => Err(FetchError::from_status(status, "scripted failure")),
                None => Err(FetchError::new(ErrorKind::Malformed, "script exhausted")),
            }
        }
    }

    fn ok(value: u32, lifetime: u64) -> Scripted {
        Ok((value, Some(DurationSecs(lifetime))))
    }

    fn no_retries() -> CacheConfig {
        CacheConfig::default().with_retry(RetryConfig::never())
    }

    async fn wait_for_calls(fetcher: &ScriptedFetch, calls: u32) {
        while fetcher.calls() < calls {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_readers_share_one_fetch() {
        let clock = TestClock::new(UnixTime(1_000));
        let fetcher = ScriptedFetch::new(&clock, [ok(7, 60)])
            .with_latency([Duration::from_millis(100)]);
        let resource = CachedResource::with_clock("test", fetcher.clone(), no_retries(), clock);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let resource = resource.clone();
                tokio::spawn(async move { resource.get(false).await })
            })
            .collect();

        let mut values = Vec::new();
        for task in tasks {
            values.push(task.await.unwrap().unwrap());
        }

        assert_eq!(fetcher.calls(), 1);
        assert!(values.iter().all(|v| Arc::ptr_eq(v, &values[0])));
        assert_eq!(*values[0], 7);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_readers_share_one_failure() {
        let clock = TestClock::new(UnixTime(1_000));
        let fetcher =
            ScriptedFetch::new(&clock, [Err(400)]).with_latency([Duration::from_millis(100)]);
        let resource = CachedResource::with_clock("test", fetcher.clone(), no_retries(), clock);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let resource = resource.clone();
                tokio::spawn(async move { resource.get(false).await })
            })
            .collect();

        for task in tasks {
            assert!(task.await.unwrap().is_err());
        }
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn valid_values_are_served_without_fetching() {
        let clock = TestClock::new(UnixTime(1_000));
        let fetcher = ScriptedFetch::new(&clock, [ok(1, 60), ok(2, 60)]);
        let resource =
            CachedResource::with_clock("test", fetcher.clone(), no_retries(), clock.clone());

        assert_eq!(*resource.get(false).await.unwrap(), 1);
        clock.advance(DurationSecs(59));
        assert_eq!(*resource.get(false).await.unwrap(), 1);
        assert_eq!(fetcher.calls(), 1);

        assert_eq!(*resource.get(true).await.unwrap(), 2);
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_refresh_never_overwrites_newer_value() {
        let clock = TestClock::new(UnixTime(1_000));
        let fetcher = ScriptedFetch::new(&clock, [ok(1, 60), ok(2, 60)])
            .with_latency([Duration::from_secs(5), Duration::ZERO]);
        let config = no_retries().with_refresh_timeout(Duration::from_secs(1));
        let resource = CachedResource::with_clock("test", fetcher.clone(), config, clock);

        let err = resource.get(false).await.unwrap_err();
        assert_eq!(
            err.fetch_error().map(FetchError::kind),
            Some(ErrorKind::Transport)
        );

        assert_eq!(*resource.get(false).await.unwrap(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(resource.peek().as_deref(), Some(&1));
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn preemptive_refresh_then_blocking_refresh_after_expiry() {
        let clock = TestClock::new(UnixTime(0));
        let fetcher = ScriptedFetch::new(&clock, [ok(1, 60), Err(503), ok(2, 60)]);
        let config = no_retries()
            .with_minimum_time_to_live(DurationSecs(30))
            .with_preemptive_margin(DurationSecs(10));
        let resource =
            CachedResource::with_clock("token", fetcher.clone(), config, clock.clone());

        assert_eq!(*resource.get(false).await.unwrap(), 1);
        assert_eq!(resource.entry().unwrap().refresh_at(), UnixTime(50));

        clock.set(UnixTime(51));
        assert_eq!(*resource.get(false).await.unwrap(), 1);
        wait_for_calls(&fetcher, 2).await;
        tokio::task::yield_now().await;
        assert_eq!(resource.peek().as_deref(), Some(&1));
        assert!(!resource.health_status().success);

        clock.set(UnixTime(61));
        assert_eq!(*resource.get(false).await.unwrap(), 2);
        assert_eq!(fetcher.calls(), 3);
        assert!(resource.health_status().success);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_background_refresh_defers_the_next_one() {
        let clock = TestClock::new(UnixTime(0));
        let fetcher = ScriptedFetch::new(&clock, [ok(1, 60), Err(503)]);
        let config = no_retries()
            .with_preemptive_margin(DurationSecs(10))
            .with_refresh_backoff(ErrorBackoffConfig::new(
                Duration::from_secs(1),
                Duration::from_secs(10),
                2,
            ));
        let resource =
            CachedResource::with_clock("keys", fetcher.clone(), config, clock.clone());

        resource.get(false).await.unwrap();

        clock.set(UnixTime(51));
        for _ in 0..200 {
            assert_eq!(*resource.get(false).await.unwrap(), 1);
            tokio::task::yield_now().await;
        }
        assert_eq!(fetcher.calls(), 2);

        clock.set(UnixTime(52));
        resource.get(false).await.unwrap();
        wait_for_calls(&fetcher, 3).await;

        clock.set(UnixTime(53));
        for _ in 0..50 {
            resource.get(false).await.unwrap();
            tokio::task::yield_now().await;
        }
        assert_eq!(fetcher.calls(), 3);

        clock.set(UnixTime(54));
        resource.get(false).await.unwrap();
        wait_for_calls(&fetcher, 4).await;
    }

    #[tokio::test(start_paused = true)]
    async fn successful_refresh_clears_the_deferral() {
        let clock = TestClock::new(UnixTime(0));
        let fetcher = ScriptedFetch::new(&clock, [ok(1, 60), Err(503), ok(2, 60), Err(503)]);
        let config = no_retries()
            .with_preemptive_margin(DurationSecs(10))
            .with_refresh_backoff(ErrorBackoffConfig::fixed(Duration::from_secs(300)));
        let resource =
            CachedResource::with_clock("keys", fetcher.clone(), config, clock.clone());

        resource.get(false).await.unwrap();

        clock.set(UnixTime(51));
        resource.get(false).await.unwrap();
        wait_for_calls(&fetcher, 2).await;

        assert_eq!(*resource.get(true).await.unwrap(), 2);
        assert_eq!(fetcher.calls(), 3);

        clock.set(UnixTime(101));
        resource.get(false).await.unwrap();
        wait_for_calls(&fetcher, 4).await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_keeps_serving_valid_value() {
        let clock = TestClock::new(UnixTime(0));
        let fetcher = ScriptedFetch::new(&clock, [ok(1, 60), Err(400)]);
        let resource = CachedResource::with_clock("test", fetcher.clone(), no_retries(), clock);

        resource.get(false).await.unwrap();
        assert_eq!(*resource.get(true).await.unwrap(), 1);
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn outage_value_covers_outages_within_ttl() {
        let clock = TestClock::new(UnixTime(0));
        let fetcher = ScriptedFetch::new(&clock, [ok(1, 10), Err(503)]);
        let config = no_retries().with_outage_ttl(DurationSecs(100));
        let resource =
            CachedResource::with_clock("keys", fetcher.clone(), config, clock.clone());

        resource.get(false).await.unwrap();

        clock.set(UnixTime(50));
        assert_eq!(*resource.get(false).await.unwrap(), 1);

        clock.set(UnixTime(100));
        let err = resource.get(false).await.unwrap_err();
        assert!(matches!(err, ResourceError::Unavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_are_not_masked_by_outage_value() {
        let clock = TestClock::new(UnixTime(0));
        let fetcher = ScriptedFetch::new(&clock, [ok(1, 10), Err(401)]);
        let config = no_retries().with_outage_ttl(DurationSecs(100));
        let resource = CachedResource::with_clock("keys", fetcher, config, clock.clone());

        resource.get(false).await.unwrap();

        clock.set(UnixTime(20));
        let err = resource.get(false).await.unwrap_err();
        assert_eq!(
            err.fetch_error().map(FetchError::kind),
            Some(ErrorKind::Client)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_recover_from_transient_unavailability() {
        let clock = TestClock::new(UnixTime(0));
        let fetcher = ScriptedFetch::new(&clock, [Err(503), Err(503), Err(503), ok(9, 60)]);
        let config = CacheConfig::default().with_retry(RetryConfig::new(
            3,
            ErrorBackoffConfig::fixed(Duration::from_millis(10)),
        ));
        let resource = CachedResource::with_clock("keys", fetcher.clone(), config, clock);

        assert_eq!(*resource.get(false).await.unwrap(), 9);
        assert_eq!(fetcher.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_refreshes_fall_back() {
        let clock = TestClock::new(UnixTime(0));
        let fetcher = ScriptedFetch::new(&clock, [ok(1, 10), ok(2, 10), ok(3, 10)]);
        let config = no_retries()
            .with_rate_limit(RateLimitConfig::per_day(1))
            .with_outage_ttl(DurationSecs(3_600));
        let resource =
            CachedResource::with_clock("keys", fetcher.clone(), config, clock.clone());

        assert_eq!(*resource.get(false).await.unwrap(), 1);

        clock.set(UnixTime(20));
        assert_eq!(*resource.get(false).await.unwrap(), 2);

        clock.set(UnixTime(40));
        assert_eq!(*resource.get(false).await.unwrap(), 2);
        assert_eq!(fetcher.calls(), 2);

        clock.set(UnixTime(10_000));
        assert!(matches!(
            resource.get(false).await,
            Err(ResourceError::RateLimited)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn eager_start_fetches_immediately() {
        let clock = TestClock::new(UnixTime(0));
        let fetcher = ScriptedFetch::new(&clock, [ok(1, 60)]);
        let lazy = CachedResource::with_clock("lazy", fetcher.clone(), no_retries(), clock.clone());
        lazy.start().await.unwrap();
        assert_eq!(fetcher.calls(), 0);

        let eager = CachedResource::with_clock(
            "eager",
            fetcher.clone(),
            no_retries().with_eager_fetch(true),
            clock,
        );
        eager.start().await.unwrap();
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(eager.peek().as_deref(), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn health_check_refreshes_unhealthy_resource() {
        let clock = TestClock::new(UnixTime(0));
        let fetcher = ScriptedFetch::new(&clock, [Err(503), ok(1, 60)]);
        let resource = CachedResource::with_clock("keys", fetcher.clone(), no_retries(), clock);

        assert!(!resource.check(false).await.success);
        assert!(resource.get(false).await.is_err());
        assert!(!resource.check(false).await.success);

        assert!(resource.check(true).await.success);
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_refreshes_when_due_and_stops_on_close() {
        let clock = TestClock::new(UnixTime(0));
        let fetcher = ScriptedFetch::new(&clock, [ok(1, 60), ok(2, 60), ok(3, 60)]);
        let config = no_retries().with_preemptive_margin(DurationSecs(10));
        let resource =
            CachedResource::with_clock("keys", fetcher.clone(), config, clock.clone());

        resource.get(false).await.unwrap();
        resource.spawn_watcher(NullJitter, ErrorBackoffConfig::default());

        let start = Instant::now();
        clock.set(UnixTime(50));
        while fetcher.calls() < 2 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert!(start.elapsed() < Duration::from_secs(120));
        }
        assert_eq!(resource.peek().as_deref(), Some(&2));

        resource.close();
        clock.set(UnixTime(1_000));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fetcher.calls(), 2);
    }

    /// Refreshes a fixed amount before the value is due
    struct EarlyBy(DurationSecs);

    impl JitterSource for EarlyBy {
        fn refresh_point(&mut self, fetched_at: UnixTime, refresh_at: UnixTime) -> UnixTime {
            (refresh_at - self.0).max(fetched_at)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_refreshes_once_at_the_jittered_point() {
        let clock = TestClock::new(UnixTime(0));
        let fetcher = ScriptedFetch::new(&clock, [ok(1, 60), ok(2, 60), ok(3, 60)]);
        let config = no_retries().with_preemptive_margin(DurationSecs(10));
        let resource =
            CachedResource::with_clock("keys", fetcher.clone(), config, clock.clone());

        resource.get(false).await.unwrap();
        resource.spawn_watcher(EarlyBy(DurationSecs(5)), ErrorBackoffConfig::default());

        clock.set(UnixTime(44));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fetcher.calls(), 1);

        clock.set(UnixTime(45));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(resource.entry().unwrap().refresh_at(), UnixTime(95));

        resource.close();
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_reschedules_values_refreshed_by_others() {
        let clock = TestClock::new(UnixTime(0));
        let fetcher = ScriptedFetch::new(&clock, [ok(1, 60), ok(2, 60), ok(3, 60)]);
        let config = no_retries().with_preemptive_margin(DurationSecs(10));
        let resource =
            CachedResource::with_clock("keys", fetcher.clone(), config, clock.clone());

        resource.get(false).await.unwrap();
        resource.spawn_watcher(EarlyBy(DurationSecs(5)), ErrorBackoffConfig::default());
        tokio::time::sleep(Duration::from_secs(1)).await;

        clock.set(UnixTime(40));
        assert_eq!(*resource.get(true).await.unwrap(), 2);

        clock.set(UnixTime(45));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fetcher.calls(), 2);

        clock.set(UnixTime(85));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fetcher.calls(), 3);

        resource.close();
    }
}
