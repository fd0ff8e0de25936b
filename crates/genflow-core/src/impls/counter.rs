//! In-memory CounterStore with lazy TTL expiry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::StoreError;
use crate::ports::{BoundedIncr, Clock, CounterStore, LockOutcome, WindowCount};

#[derive(Debug, Clone)]
struct Slot {
    value: u64,
    expires_at: i64,
}

#[derive(Debug, Clone)]
struct LockSlot {
    holder: String,
    expires_at: i64,
}

#[derive(Default)]
struct State {
    counters: HashMap<String, Slot>,
    locks: HashMap<String, LockSlot>,
}

impl State {
    fn live_counter(&mut self, key: &str, now: i64) -> Option<&mut Slot> {
        if self.counters.get(key).is_some_and(|s| s.expires_at <= now) {
            self.counters.remove(key);
        }
        self.counters.get_mut(key)
    }

    fn live_lock(&mut self, key: &str, now: i64) -> Option<&LockSlot> {
        if self.locks.get(key).is_some_and(|l| l.expires_at <= now) {
            self.locks.remove(key);
        }
        self.locks.get(key)
    }
}

#[derive(Clone)]
pub struct InMemoryCounterStore {
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<State>>,
}

impl InMemoryCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Arc::new(Mutex::new(State::default())),
        }
    }
}

fn ttl_millis(ttl: Duration) -> i64 {
    ttl.as_millis().min(i64::MAX as u128) as i64
}

fn remaining(expires_at: i64, now: i64) -> Duration {
    Duration::from_millis((expires_at - now).max(0) as u64)
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn incr_bounded(
        &self,
        key: &str,
        max: u64,
        ttl: Duration,
    ) -> Result<BoundedIncr, StoreError> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        let expires_at = now + ttl_millis(ttl);

        match state.live_counter(key, now) {
            Some(slot) if slot.value >= max => Ok(BoundedIncr::AtCapacity {
                value: slot.value,
                retry_after: remaining(slot.expires_at, now),
            }),
            Some(slot) => {
                slot.value += 1;
                slot.expires_at = expires_at;
                Ok(BoundedIncr::Acquired { value: slot.value })
            }
            None if max == 0 => Ok(BoundedIncr::AtCapacity {
                value: 0,
                retry_after: ttl,
            }),
            None => {
                state
                    .counters
                    .insert(key.to_string(), Slot { value: 1, expires_at });
                Ok(BoundedIncr::Acquired { value: 1 })
            }
        }
    }

    async fn decr(&self, key: &str) -> Result<u64, StoreError> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        let Some(slot) = state.live_counter(key, now) else {
            return Ok(0);
        };
        slot.value = slot.value.saturating_sub(1);
        let value = slot.value;
        if value == 0 {
            state.counters.remove(key);
        }
        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<u64, StoreError> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        Ok(state.live_counter(key, now).map_or(0, |s| s.value))
    }

    async fn incr_window(&self, key: &str, ttl: Duration) -> Result<WindowCount, StoreError> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();

        if let Some(slot) = state.live_counter(key, now) {
            slot.value += 1;
            return Ok(WindowCount {
                count: slot.value,
                remaining: remaining(slot.expires_at, now),
            });
        }

        let expires_at = now + ttl_millis(ttl);
        state
            .counters
            .insert(key.to_string(), Slot { value: 1, expires_at });
        Ok(WindowCount {
            count: 1,
            remaining: ttl,
        })
    }

    async fn acquire_lock(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<LockOutcome, StoreError> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();

        if let Some(existing) = state.live_lock(key, now) {
            return Ok(LockOutcome::Held {
                holder: existing.holder.clone(),
            });
        }

        state.locks.insert(
            key.to_string(),
            LockSlot {
                holder: holder.to_string(),
                expires_at: now + ttl_millis(ttl),
            },
        );
        Ok(LockOutcome::Acquired)
    }

    async fn release_lock(&self, key: &str, holder: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();

        let owned = state
            .live_lock(key, now)
            .is_some_and(|existing| existing.holder == holder);
        if owned {
            state.locks.remove(key);
        }
        Ok(owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::ManualClock;
    use chrono::{TimeZone, Utc};

    fn store() -> (InMemoryCounterStore, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        (InMemoryCounterStore::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn bounded_incr_stops_at_max() {
        let (store, _) = store();
        let ttl = Duration::from_secs(60);

        assert_eq!(
            store.incr_bounded("k", 2, ttl).await.unwrap(),
            BoundedIncr::Acquired { value: 1 }
        );
        assert_eq!(
            store.incr_bounded("k", 2, ttl).await.unwrap(),
            BoundedIncr::Acquired { value: 2 }
        );
        let third = store.incr_bounded("k", 2, ttl).await.unwrap();
        assert!(matches!(third, BoundedIncr::AtCapacity { value: 2, .. }));
        assert_eq!(store.get("k").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn zero_max_never_acquires() {
        let (store, _) = store();
        let result = store
            .incr_bounded("k", 0, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!result.is_acquired());
        assert_eq!(store.get("k").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn counters_expire_with_clock() {
        let (store, clock) = store();
        store
            .incr_bounded("k", 5, Duration::from_secs(10))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(11));

        assert_eq!(store.get("k").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn decr_floors_at_zero() {
        let (store, _) = store();
        store
            .incr_bounded("k", 5, Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(store.decr("k").await.unwrap(), 0);
        assert_eq!(store.decr("k").await.unwrap(), 0);
        assert_eq!(store.get("k").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn window_keeps_its_opening_ttl() {
        let (store, clock) = store();
        let ttl = Duration::from_secs(60);

        let first = store.incr_window("w", ttl).await.unwrap();
        clock.advance(Duration::from_secs(20));
        let second = store.incr_window("w", ttl).await.unwrap();

        assert_eq!(first.count, 1);
        assert_eq!(second.count, 2);
        assert_eq!(second.remaining, Duration::from_secs(40));

        clock.advance(Duration::from_secs(41));
        assert_eq!(store.incr_window("w", ttl).await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn lock_reports_holder_and_releases_only_for_owner() {
        let (store, _) = store();
        let ttl = Duration::from_secs(30);

        assert_eq!(
            store.acquire_lock("l", "a", ttl).await.unwrap(),
            LockOutcome::Acquired
        );
        assert_eq!(
            store.acquire_lock("l", "b", ttl).await.unwrap(),
            LockOutcome::Held { holder: "a".into() }
        );
        assert!(!store.release_lock("l", "b").await.unwrap());
        assert!(store.release_lock("l", "a").await.unwrap());
        assert_eq!(
            store.acquire_lock("l", "b", ttl).await.unwrap(),
            LockOutcome::Acquired
        );
    }

    #[tokio::test]
    async fn expired_lock_can_be_taken_over() {
        let (store, clock) = store();
        store
            .acquire_lock("l", "a", Duration::from_secs(5))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(6));

        assert_eq!(
            store
                .acquire_lock("l", "b", Duration::from_secs(5))
                .await
                .unwrap(),
            LockOutcome::Acquired
        );
    }
}
