//! Layered concurrency guards.
//!
//! A guard is a bounded counter in the counter store. The worker takes the
//! user and model guards and checks the queue guard, in that order, and gives
//! back exactly what it holds. The queue permit is counted at admission and
//! belongs to the task until a delivery settles it. Counters carry a TTL so a
//! crashed holder cannot leak a permit forever.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::domain::{GuardKey, GuardSubject, WorkerErrorCode};
use crate::error::StoreError;
use crate::ports::{BoundedIncr, CounterStore};

/// Who counted a guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hold {
    /// Incremented on acquire, decremented on every release.
    Taken,
    /// Incremented at admission. Acquire only checks the bound; the permit
    /// is given back once the delivery settles the task.
    Admitted,
}

/// One guard to take, with its capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardRequest {
    pub key: GuardKey,
    pub max: u64,
    pub hold: Hold,
}

impl GuardRequest {
    pub fn take(key: GuardKey, max: u64) -> Self {
        Self {
            key,
            max,
            hold: Hold::Taken,
        }
    }

    pub fn admitted(key: GuardKey, max: u64) -> Self {
        Self {
            key,
            max,
            hold: Hold::Admitted,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GuardError {
    #[error("{} guard at capacity ({key})", .key.label())]
    AtCapacity { key: GuardKey, retry_after: Duration },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl GuardError {
    pub fn code(&self) -> WorkerErrorCode {
        match self {
            GuardError::AtCapacity { key, .. } => match key.subject {
                GuardSubject::User(_) => WorkerErrorCode::ConcurrencyLocked,
                GuardSubject::Model { .. } => WorkerErrorCode::ModelConcurrency,
                GuardSubject::Queue(_) => WorkerErrorCode::QueueBackpressure,
            },
            GuardError::Store(_) => WorkerErrorCode::InternalError,
        }
    }
}

#[derive(Debug, Clone)]
struct Held {
    key: GuardKey,
    hold: Hold,
}

/// Guards currently held by one delivery.
///
/// Dropping a set that still holds taken guards (the delivery future was
/// cancelled) releases them on a spawned task. Admitted permits stay with the
/// task, which the queue will deliver again.
#[must_use = "held guards must be released"]
pub struct GuardSet {
    counters: Arc<dyn CounterStore>,
    held: Vec<Held>,
}

impl std::fmt::Debug for GuardSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardSet").field("held", &self.held).finish()
    }
}

impl GuardSet {
    /// Take every guard in order. On the first failure the guards already
    /// taken are given back and nothing stays held.
    pub async fn acquire(
        counters: Arc<dyn CounterStore>,
        requests: &[GuardRequest],
        ttl: Duration,
        retry_after: Duration,
    ) -> Result<Self, GuardError> {
        let mut set = GuardSet {
            counters,
            held: Vec::with_capacity(requests.len()),
        };

        for request in requests {
            match set.check(request, ttl).await {
                Ok(true) => set.held.push(Held {
                    key: request.key.clone(),
                    hold: request.hold,
                }),
                Ok(false) => {
                    set.release_taken().await;
                    return Err(GuardError::AtCapacity {
                        key: request.key.clone(),
                        retry_after,
                    });
                }
                Err(err) => {
                    set.release_taken().await;
                    return Err(GuardError::Store(err));
                }
            }
        }
        Ok(set)
    }

    /// `Ok(true)` when the guard is now held.
    async fn check(&self, request: &GuardRequest, ttl: Duration) -> Result<bool, StoreError> {
        let key = request.key.counter_key();
        match request.hold {
            Hold::Taken => match self.counters.incr_bounded(&key, request.max, ttl).await? {
                BoundedIncr::Acquired { value } => {
                    debug!(guard = %request.key, value, "guard acquired");
                    Ok(true)
                }
                BoundedIncr::AtCapacity { value, .. } => {
                    debug!(guard = %request.key, value, max = request.max, "guard at capacity");
                    Ok(false)
                }
            },
            Hold::Admitted => {
                let value = self.counters.get(&key).await?;
                if value > request.max {
                    debug!(guard = %request.key, value, max = request.max, "admitted guard over capacity");
                    return Ok(false);
                }
                Ok(true)
            }
        }
    }

    /// The delivery settled its task: give back every held guard, admitted
    /// permits included. Returns how many were released cleanly.
    pub async fn release(&mut self) -> usize {
        let keys = self.held.drain(..).map(|held| held.key).collect();
        release_keys(self.counters.as_ref(), keys).await
    }

    /// The task will be delivered again: give back the taken guards and
    /// leave admitted permits counted.
    pub async fn release_taken(&mut self) -> usize {
        let keys = take_counted(&mut self.held);
        release_keys(self.counters.as_ref(), keys).await
    }
}

impl Drop for GuardSet {
    fn drop(&mut self) {
        let keys = take_counted(&mut self.held);
        if keys.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(held = keys.len(), "guards dropped outside a runtime, left to expire");
            return;
        };
        warn!(held = keys.len(), "delivery cancelled with guards held, releasing");
        let counters = Arc::clone(&self.counters);
        runtime.spawn(async move {
            release_keys(counters.as_ref(), keys).await;
        });
    }
}

fn take_counted(held: &mut Vec<Held>) -> Vec<GuardKey> {
    held.drain(..)
        .filter(|held| held.hold == Hold::Taken)
        .map(|held| held.key)
        .collect()
}

/// Model first, then queue, then user. A failed release is logged and does
/// not stop the others.
async fn release_keys(counters: &dyn CounterStore, mut keys: Vec<GuardKey>) -> usize {
    keys.sort_by_key(|key| release_rank(&key.subject));

    let mut released = 0;
    for key in keys {
        match counters.decr(&key.counter_key()).await {
            Ok(_) => released += 1,
            Err(err) => warn!(guard = %key, error = %err, "guard release failed"),
        }
    }
    released
}

fn release_rank(subject: &GuardSubject) -> u8 {
    match subject {
        GuardSubject::Model { .. } => 0,
        GuardSubject::Queue(_) => 1,
        GuardSubject::User(_) => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecutionKind, Tier};
    use crate::impls::InMemoryCounterStore;
    use crate::ports::{Clock, ManualClock};
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;

    const TTL: Duration = Duration::from_secs(300);
    const RETRY: Duration = Duration::from_secs(3);

    const QUEUE_KEY: &str = "pending:free-text";

    fn requests() -> Vec<GuardRequest> {
        vec![
            GuardRequest::take(GuardKey::user("u1", ExecutionKind::Stream), 1),
            GuardRequest::take(GuardKey::model("text-lite", Tier::Free, ExecutionKind::Stream), 1),
            GuardRequest::admitted(GuardKey::queue("free-text", ExecutionKind::Stream), 1),
        ]
    }

    /// A store where admission already counted the task's queue permit.
    async fn admitted_store() -> InMemoryCounterStore {
        let store = store();
        store.incr_bounded(QUEUE_KEY, 1, TTL).await.unwrap();
        store
    }

    fn store() -> InMemoryCounterStore {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        InMemoryCounterStore::new(clock)
    }

    async fn values(store: &InMemoryCounterStore) -> Vec<u64> {
        let mut out = Vec::new();
        for request in requests() {
            out.push(store.get(&request.key.counter_key()).await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn acquire_then_release_restores_counters() {
        let store = admitted_store().await;
        let mut set = GuardSet::acquire(Arc::new(store.clone()), &requests(), TTL, RETRY)
            .await
            .unwrap();
        assert_eq!(values(&store).await, vec![1, 1, 1]);

        assert_eq!(set.release().await, 3);
        assert_eq!(values(&store).await, vec![0, 0, 0]);
        assert_eq!(set.release().await, 0);
    }

    #[tokio::test]
    async fn failure_midway_releases_what_was_taken() {
        let store = admitted_store().await;
        store.incr_bounded("guard:model:text-lite:free", 1, TTL).await.unwrap();

        let err = GuardSet::acquire(Arc::new(store.clone()), &requests(), TTL, RETRY)
            .await
            .unwrap_err();

        assert_eq!(err.code(), WorkerErrorCode::ModelConcurrency);
        assert!(matches!(err, GuardError::AtCapacity { retry_after, .. } if retry_after == RETRY));
        assert_eq!(values(&store).await, vec![0, 1, 1]);
    }

    #[tokio::test]
    async fn over_capacity_queue_is_backpressure_and_keeps_the_permit() {
        let store = admitted_store().await;
        store.incr_bounded(QUEUE_KEY, 5, TTL).await.unwrap();

        let err = GuardSet::acquire(Arc::new(store.clone()), &requests(), TTL, RETRY)
            .await
            .unwrap_err();

        assert_eq!(err.code(), WorkerErrorCode::QueueBackpressure);
        assert_eq!(values(&store).await, vec![0, 0, 2]);
    }

    #[tokio::test]
    async fn release_taken_leaves_the_admitted_permit() {
        let store = admitted_store().await;
        let mut set = GuardSet::acquire(Arc::new(store.clone()), &requests(), TTL, RETRY)
            .await
            .unwrap();

        assert_eq!(set.release_taken().await, 2);
        assert_eq!(values(&store).await, vec![0, 0, 1]);
        assert_eq!(set.release().await, 0);
    }

    #[tokio::test]
    async fn dropped_set_gives_back_taken_guards() {
        let store = admitted_store().await;
        let set = GuardSet::acquire(Arc::new(store.clone()), &requests(), TTL, RETRY)
            .await
            .unwrap();
        assert_eq!(values(&store).await, vec![1, 1, 1]);

        drop(set);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(values(&store).await, vec![0, 0, 1]);
    }

    /// Records decrements in order; fails the first one.
    #[derive(Default)]
    struct FlakyRelease {
        decrements: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CounterStore for FlakyRelease {
        async fn incr_bounded(&self, _: &str, _: u64, _: Duration) -> Result<BoundedIncr, StoreError> {
            Ok(BoundedIncr::Acquired { value: 1 })
        }

        async fn decr(&self, key: &str) -> Result<u64, StoreError> {
            let mut seen = self.decrements.lock();
            seen.push(key.to_string());
            if seen.len() == 1 {
                return Err(StoreError::Unavailable("down".into()));
            }
            Ok(0)
        }

        async fn get(&self, _: &str) -> Result<u64, StoreError> {
            Ok(0)
        }

        async fn incr_window(&self, _: &str, _: Duration) -> Result<crate::ports::WindowCount, StoreError> {
            unreachable!()
        }

        async fn acquire_lock(&self, _: &str, _: &str, _: Duration) -> Result<crate::ports::LockOutcome, StoreError> {
            unreachable!()
        }

        async fn release_lock(&self, _: &str, _: &str) -> Result<bool, StoreError> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn release_order_is_model_queue_user_and_survives_errors() {
        let store = Arc::new(FlakyRelease::default());
        let mut set = GuardSet::acquire(store.clone(), &requests(), TTL, RETRY)
            .await
            .unwrap();

        assert_eq!(set.release().await, 2);
        assert_eq!(
            *store.decrements.lock(),
            vec![
                "guard:model:text-lite:free".to_string(),
                "pending:free-text".to_string(),
                "guard:user:u1:stream".to_string(),
            ]
        );
    }
}
