use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::trace;

/// What the in-flight fetch for a cache slot concluded. Followers use this to
/// decide between re-reading the cache, fetching uncached, or failing fast.
#[derive(Debug, Clone)]
pub(crate) enum FetchOutcome {
    /// The leader stored (or revalidated) an entry; re-lookup will hit.
    Cached,
    /// The response was not cacheable; each waiter fetches for itself.
    Uncacheable,
    /// The fetch failed; waiters share the failure instead of piling on.
    Failed(String),
}

pub(crate) enum Flight {
    Leader(FlightGuard),
    Follower(watch::Receiver<Option<FetchOutcome>>),
}

type Registry = Arc<Mutex<HashMap<String, watch::Receiver<Option<FetchOutcome>>>>>;

/// De-duplicates concurrent origin fetches per variant key: the first caller
/// becomes the leader, everyone else waits for its published outcome.
#[derive(Clone, Default)]
pub(crate) struct FlightRegistry {
    inner: Registry,
}

impl FlightRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn join(&self, variant_key: &str) -> Flight {
        let mut guard = self.inner.lock();
        if let Some(rx) = guard.get(variant_key) {
            trace!("joining in-flight fetch for {variant_key}");
            return Flight::Follower(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        guard.insert(variant_key.to_string(), rx);
        Flight::Leader(FlightGuard {
            variant_key: variant_key.to_string(),
            registry: self.inner.clone(),
            tx,
            published: false,
        })
    }
}

/// Held by the flight leader. Publishing removes the flight from the registry
/// first, so requests arriving after the outcome start a fresh flight instead
/// of consuming a stale one.
pub(crate) struct FlightGuard {
    variant_key: String,
    registry: Registry,
    tx: watch::Sender<Option<FetchOutcome>>,
    published: bool,
}

impl FlightGuard {
    pub(crate) fn publish(mut self, outcome: FetchOutcome) {
        self.registry.lock().remove(&self.variant_key);
        self.tx.send_replace(Some(outcome));
        self.published = true;
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        self.registry.lock().remove(&self.variant_key);
        self.tx
            .send_replace(Some(FetchOutcome::Failed("fetch abandoned".to_string())));
    }
}

/// Waits for the leader's outcome. A dropped leader publishes a failure from
/// its Drop impl, so this only errors if the runtime tears down mid-wait.
pub(crate) async fn await_outcome(
    mut rx: watch::Receiver<Option<FetchOutcome>>,
) -> FetchOutcome {
    loop {
        if let Some(outcome) = rx.borrow_and_update().clone() {
            return outcome;
        }
        if rx.changed().await.is_err() {
            return FetchOutcome::Failed("fetch abandoned".to_string());
        }
    }
}
