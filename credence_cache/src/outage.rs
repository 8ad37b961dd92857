//! Last-known-good values kept to ride out authority outages

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use credence_clock::{DurationSecs, UnixTime};

#[derive(Debug)]
struct OutageEntry<T> {
    value: Arc<T>,
    stored_at: UnixTime,
}

/// Holds the most recent successfully fetched value for a bounded time
///
/// The value is overwritten on every successful fetch and is only consulted
/// when a live fetch fails with an outage-class error.
#[derive(Debug)]
pub struct OutageCache<T> {
    entry: ArcSwapOption<OutageEntry<T>>,
    ttl: DurationSecs,
}

impl<T> OutageCache<T> {
    /// Constructs an empty outage cache whose values remain usable for `ttl`
    pub fn new(ttl: DurationSecs) -> Self {
        Self {
            entry: ArcSwapOption::empty(),
            ttl,
        }
    }

    /// How long a stored value remains usable
    #[inline]
    pub fn ttl(&self) -> DurationSecs {
        self.ttl
    }

    /// Records a successfully fetched value
    pub fn store(&self, value: Arc<T>, now: UnixTime) {
        self.entry.store(Some(Arc::new(OutageEntry {
            value,
            stored_at: now,
        })));
    }

    /// Gets the stored value if it is still within its time to live
    pub fn get(&self, now: UnixTime) -> Option<Arc<T>> {
        let guard = self.entry.load();
        let entry = guard.as_ref()?;

        if now - entry.stored_at < self.ttl {
            Some(Arc::clone(&entry.value))
        } else {
            tracing::debug!(
                stored_at = entry.stored_at.0,
                ttl = self.ttl.0,
                "outage value too old to serve"
            );
            None
        }
    }

    #[cfg(test)]
    fn clear(&self) {
        self.entry.store(None);
    }
}
