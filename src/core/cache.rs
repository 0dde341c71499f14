//! In-memory rate table with per-key refresh tracking.
//!
//! A key moves through `Empty -> Pending -> Fresh -> Stale -> Refreshing -> Fresh`.
//! Only the holder of a [`RefreshGuard`] may write a key, and there is at most one
//! guard per key at a time. Dropping a guard without committing releases the claim.

use crate::core::currency::PairKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Source of "now" in seconds since the epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheEntry {
    /// Quote units per one base unit.
    pub value: f64,
    /// Seconds since the epoch of the last fresh fetch.
    pub timestamp: i64,
    pub refreshing: bool,
}

type Outcome = Option<Result<f64, String>>;

enum Slot {
    /// First fetch for the key is in flight and there is no value yet.
    Pending(watch::Receiver<Outcome>),
    Ready(CacheEntry),
}

/// Result of looking up a key directly.
pub enum Lookup {
    Fresh(f64),
    /// Stale and someone else is already refreshing it.
    Refreshing(f64),
    /// Stale; the caller now owns the refresh.
    Claimed(RefreshGuard),
    /// The first fetch is in flight elsewhere.
    Pending(PendingRate),
    Empty,
}

/// Result of asking for the right to write a key.
pub enum Claim {
    Owner(RefreshGuard),
    Wait(PendingRate),
    /// Someone filled the key in the meantime (possibly with a stale, refreshing value).
    Cached(f64),
}

#[derive(Clone)]
pub struct RateTable {
    inner: Arc<Mutex<HashMap<PairKey, Slot>>>,
    freshness: i64,
    clock: Arc<dyn Clock>,
}

impl RateTable {
    pub fn new(freshness: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            freshness: i64::try_from(freshness.as_secs()).unwrap_or(i64::MAX),
            clock,
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<PairKey, Slot>> {
        // Critical sections never panic half way through a mutation
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_fresh(&self, entry: &CacheEntry, now: i64) -> bool {
        now - entry.timestamp < self.freshness
    }

    /// Looks up `key`, claiming the refresh if the entry is stale and unclaimed.
    pub fn lookup(&self, key: &PairKey) -> Lookup {
        let now = self.clock.now();
        let mut slots = self.slots();
        match slots.get_mut(key) {
            None => {
                debug!(%key, "Cache MISS");
                Lookup::Empty
            }
            Some(Slot::Pending(rx)) => {
                debug!(%key, "Cache PENDING");
                Lookup::Pending(PendingRate { rx: rx.clone() })
            }
            Some(Slot::Ready(entry)) => {
                if self.is_fresh(entry, now) {
                    debug!(%key, "Cache HIT");
                    Lookup::Fresh(entry.value)
                } else if entry.refreshing {
                    debug!(%key, "Cache STALE, refresh already in flight");
                    Lookup::Refreshing(entry.value)
                } else {
                    debug!(%key, "Cache STALE, claiming refresh");
                    entry.refreshing = true;
                    Lookup::Claimed(RefreshGuard::new(self.clone(), key.clone(), None))
                }
            }
        }
    }

    /// Returns the value for `key` only if it is fresh. Never claims.
    pub fn fresh(&self, key: &PairKey) -> Option<f64> {
        let now = self.clock.now();
        match self.slots().get(key) {
            Some(Slot::Ready(entry)) if self.is_fresh(entry, now) => Some(entry.value),
            _ => None,
        }
    }

    /// Asks for the exclusive right to write `key`.
    pub fn claim(&self, key: &PairKey) -> Claim {
        let now = self.clock.now();
        let mut slots = self.slots();
        match slots.get_mut(key) {
            None => {
                let (tx, rx) = watch::channel(None);
                slots.insert(key.clone(), Slot::Pending(rx));
                debug!(%key, "Cache CLAIM first fetch");
                Claim::Owner(RefreshGuard::new(self.clone(), key.clone(), Some(tx)))
            }
            Some(Slot::Pending(rx)) => Claim::Wait(PendingRate { rx: rx.clone() }),
            Some(Slot::Ready(entry)) => {
                if self.is_fresh(entry, now) || entry.refreshing {
                    Claim::Cached(entry.value)
                } else {
                    entry.refreshing = true;
                    debug!(%key, "Cache CLAIM refresh");
                    Claim::Owner(RefreshGuard::new(self.clone(), key.clone(), None))
                }
            }
        }
    }

    /// Snapshot of a ready entry, if any.
    pub fn get(&self, key: &PairKey) -> Option<CacheEntry> {
        match self.slots().get(key) {
            Some(Slot::Ready(entry)) => Some(*entry),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.slots()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn store(&self, key: &PairKey, value: f64) {
        let timestamp = self.clock.now();
        let mut slots = self.slots();
        match slots.get_mut(key) {
            Some(Slot::Ready(entry)) => {
                entry.value = value;
                entry.timestamp = timestamp;
                entry.refreshing = false;
            }
            _ => {
                slots.insert(
                    key.clone(),
                    Slot::Ready(CacheEntry {
                        value,
                        timestamp,
                        refreshing: false,
                    }),
                );
            }
        }
        debug!(%key, value, "Cache PUT");
    }

    fn release(&self, key: &PairKey) {
        let mut slots = self.slots();
        match slots.get_mut(key) {
            Some(Slot::Ready(entry)) => entry.refreshing = false,
            Some(Slot::Pending(_)) => {
                slots.remove(key);
            }
            None => {}
        }
        debug!(%key, "Cache RELEASE");
    }
}

/// Exclusive right to write one key.
pub struct RefreshGuard {
    table: RateTable,
    key: PairKey,
    notify: Option<watch::Sender<Outcome>>,
    done: bool,
}

impl RefreshGuard {
    fn new(table: RateTable, key: PairKey, notify: Option<watch::Sender<Outcome>>) -> Self {
        Self {
            table,
            key,
            notify,
            done: false,
        }
    }

    pub fn key(&self) -> &PairKey {
        &self.key
    }

    /// Stores a freshly fetched value and wakes anyone waiting on the key.
    pub fn commit(mut self, value: f64) {
        self.table.store(&self.key, value);
        if let Some(tx) = self.notify.take() {
            tx.send_replace(Some(Ok(value)));
        }
        self.done = true;
    }

    /// Hands `value` to anyone waiting on the key without caching it.
    pub fn release_with(mut self, value: f64) {
        if let Some(tx) = self.notify.take() {
            tx.send_replace(Some(Ok(value)));
        }
    }

    /// Hands `error` to anyone waiting on the key and releases it.
    pub fn fail(mut self, error: &str) {
        if let Some(tx) = self.notify.take() {
            tx.send_replace(Some(Err(error.to_string())));
        }
    }
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        if !self.done {
            self.table.release(&self.key);
        }
    }
}

/// Handle to a first fetch running elsewhere.
pub struct PendingRate {
    rx: watch::Receiver<Outcome>,
}

impl PendingRate {
    /// Waits for the owner's outcome. `None` means the owner was dropped before
    /// publishing one and the key is free to claim again.
    pub async fn wait(mut self) -> Option<Result<f64, String>> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::currency::Currency;
    use std::sync::atomic::{AtomicI64, Ordering};

    pub struct ManualClock(AtomicI64);

    impl Clock for ManualClock {
        fn now(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn key(base: &str, quote: &str) -> PairKey {
        PairKey::new(
            Currency::Symbol(base.to_string()),
            Currency::Symbol(quote.to_string()),
        )
    }

    fn table() -> (RateTable, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock(AtomicI64::new(1_000)));
        (
            RateTable::new(Duration::from_secs(900), clock.clone()),
            clock,
        )
    }

    fn owner(claim: Claim) -> RefreshGuard {
        match claim {
            Claim::Owner(guard) => guard,
            _ => panic!("Expected to own the claim"),
        }
    }

    #[test]
    fn test_claim_commit_then_fresh() {
        let (table, _) = table();
        let k = key("a", "b");

        assert!(matches!(table.lookup(&k), Lookup::Empty));
        owner(table.claim(&k)).commit(2.5);

        assert!(matches!(table.lookup(&k), Lookup::Fresh(v) if v == 2.5));
        assert_eq!(table.fresh(&k), Some(2.5));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_stale_entry_is_claimed_once() {
        let (table, clock) = table();
        let k = key("a", "b");
        owner(table.claim(&k)).commit(2.0);

        clock.0.fetch_add(900, Ordering::SeqCst);
        assert_eq!(table.fresh(&k), None);

        let guard = match table.lookup(&k) {
            Lookup::Claimed(guard) => guard,
            _ => panic!("Expected stale entry to be claimed"),
        };
        assert!(table.get(&k).unwrap().refreshing);

        // Second caller gets the stale value instead of a second claim
        assert!(matches!(table.lookup(&k), Lookup::Refreshing(v) if v == 2.0));
        assert!(matches!(table.claim(&k), Claim::Cached(v) if v == 2.0));

        guard.commit(3.0);
        let entry = table.get(&k).unwrap();
        assert_eq!(entry.value, 3.0);
        assert_eq!(entry.timestamp, 1_900);
        assert!(!entry.refreshing);
    }

    #[test]
    fn test_dropped_guard_releases_refresh() {
        let (table, clock) = table();
        let k = key("a", "b");
        owner(table.claim(&k)).commit(2.0);
        clock.0.fetch_add(1_000, Ordering::SeqCst);

        drop(table.lookup(&k));
        let entry = table.get(&k).unwrap();
        assert!(!entry.refreshing);
        assert_eq!(entry.value, 2.0);

        // Claimable again
        assert!(matches!(table.lookup(&k), Lookup::Claimed(_)));
    }

    #[test]
    fn test_dropped_first_claim_leaves_key_empty() {
        let (table, _) = table();
        let k = key("a", "b");

        owner(table.claim(&k)).fail("boom");
        assert!(matches!(table.lookup(&k), Lookup::Empty));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_pending_waiter_receives_committed_value() {
        let (table, _) = table();
        let k = key("a", "b");

        let guard = owner(table.claim(&k));
        let waiter = match table.claim(&k) {
            Claim::Wait(pending) => pending,
            _ => panic!("Expected to wait on the first fetch"),
        };

        let handle = tokio::spawn(waiter.wait());
        guard.commit(4.0);
        assert_eq!(handle.await.unwrap(), Some(Ok(4.0)));
    }

    #[tokio::test]
    async fn test_pending_waiter_receives_failure() {
        let (table, _) = table();
        let k = key("a", "b");

        let guard = owner(table.claim(&k));
        let waiter = match table.lookup(&k) {
            Lookup::Pending(pending) => pending,
            _ => panic!("Expected a pending lookup"),
        };

        guard.fail("upstream down");
        assert_eq!(waiter.wait().await, Some(Err("upstream down".to_string())));
    }

    #[tokio::test]
    async fn test_pending_waiter_sees_abandoned_fetch() {
        let (table, _) = table();
        let k = key("a", "b");

        let guard = owner(table.claim(&k));
        let waiter = match table.claim(&k) {
            Claim::Wait(pending) => pending,
            _ => panic!("Expected to wait on the first fetch"),
        };

        drop(guard);
        assert_eq!(waiter.wait().await, None);
        assert!(matches!(table.claim(&k), Claim::Owner(_)));
    }
}
