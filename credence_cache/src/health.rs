//! Health reporting for cached resources

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use credence_clock::{Clock, System, UnixTime};
use tokio::{
    task::JoinSet,
    time::{timeout_at, Instant},
};

/// The health of a resource as of a point in time
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HealthStatus {
    /// When the status was determined
    pub timestamp: UnixTime,
    /// Whether the resource is healthy
    pub success: bool,
}

impl HealthStatus {
    /// A healthy status as of `timestamp`
    #[inline]
    pub fn healthy(timestamp: UnixTime) -> Self {
        Self {
            timestamp,
            success: true,
        }
    }

    /// An unhealthy status as of `timestamp`
    #[inline]
    pub fn unhealthy(timestamp: UnixTime) -> Self {
        Self {
            timestamp,
            success: false,
        }
    }
}

/// Something that can report its health
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Reports the current health
    ///
    /// Without `refresh`, the last known status is reported and no I/O is
    /// performed. With `refresh`, an unhealthy probe may attempt to recover
    /// before reporting.
    async fn check(&self, refresh: bool) -> HealthStatus;
}

#[async_trait]
impl<P: HealthProbe + ?Sized> HealthProbe for Arc<P> {
    async fn check(&self, refresh: bool) -> HealthStatus {
        (**self).check(refresh).await
    }
}

/// Aggregates the health of several probes
///
/// The aggregate is healthy only when every probe is healthy. When a refresh
/// is requested, every unhealthy probe is refreshed in parallel, and probes
/// that have not answered within `max_delay` are abandoned and counted as
/// unhealthy. Abandoned refreshes are cancelled, as are all outstanding
/// refreshes if the check itself is dropped.
pub struct HealthAggregator<C = System> {
    probes: Vec<(String, Arc<dyn HealthProbe>)>,
    max_delay: Duration,
    clock: C,
}

impl<C: fmt::Debug> fmt::Debug for HealthAggregator<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HealthAggregator")
            .field(
                "probes",
                &self.probes.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            )
            .field("max_delay", &self.max_delay)
            .field("clock", &self.clock)
            .finish()
    }
}

impl HealthAggregator {
    /// Constructs an aggregator with no probes
    pub fn new(max_delay: Duration) -> Self {
        Self::with_clock(max_delay, System)
    }
}

impl<C: Clock> HealthAggregator<C> {
    /// Constructs an aggregator with no probes using the given clock
    pub fn with_clock(max_delay: Duration, clock: C) -> Self {
        Self {
            probes: Vec::new(),
            max_delay,
            clock,
        }
    }

    /// Adds a named probe
    pub fn with_probe(mut self, name: impl Into<String>, probe: Arc<dyn HealthProbe>) -> Self {
        self.probes.push((name.into(), probe));
        self
    }

    /// The number of registered probes
    pub fn len(&self) -> usize {
        self.probes.len()
    }

    /// Whether no probes have been registered
    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    async fn check_all(&self, refresh: bool) -> HealthStatus {
        if let [(_, probe)] = self.probes.as_slice() {
            return probe.check(refresh).await;
        }

        let mut unhealthy = Vec::new();
        for (name, probe) in &self.probes {
            if !probe.check(false).await.success {
                unhealthy.push((name, probe));
            }
        }

        if unhealthy.is_empty() {
            return HealthStatus::healthy(self.clock.now());
        }

        if !refresh {
            tracing::debug!(unhealthy = unhealthy.len(), "resources unhealthy");
            return HealthStatus::unhealthy(self.clock.now());
        }

        let deadline = Instant::now() + self.max_delay;
        let mut refreshes = JoinSet::new();
        for (name, probe) in unhealthy {
            let name = name.clone();
            let probe = Arc::clone(probe);
            refreshes.spawn(async move { (name, probe.check(true).await) });
        }

        let mut success = true;
        loop {
            let next = timeout_at(deadline, refreshes.join_next()).await;
            match next {
                Ok(None) => break,
                Ok(Some(Ok((name, status)))) => {
                    if !status.success {
                        tracing::debug!(probe = %name, "resource still unhealthy after refresh");
                        success = false;
                    }
                }
                Ok(Some(Err(err))) => {
                    if err.is_panic() {
                        tracing::error!("health refresh panicked");
                    }
                    success = false;
                }
                Err(_) => {
                    tracing::warn!(
                        outstanding = refreshes.len(),
                        max_delay_ms = self.max_delay.as_millis() as u64,
                        "health refreshes did not complete in time"
                    );
                    refreshes.abort_all();
                    success = false;
                    break;
                }
            }
        }

        HealthStatus {
            timestamp: self.clock.now(),
            success,
        }
    }
}

#[async_trait]
impl<C: Clock + Send + Sync> HealthProbe for HealthAggregator<C> {
    async fn check(&self, refresh: bool) -> HealthStatus {
        self.check_all(refresh).await
    }
}
