use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Keyed concurrency ledger. Two instances exist at runtime, one keyed by
/// user id and one by account id. Each key owns a semaphore sized to the
/// key's budget plus observable inflight/waiting counters.
pub struct SlotLedger {
    slot_type: &'static str,
    entries: Mutex<HashMap<i64, Arc<SlotEntry>>>,
}

#[derive(Debug)]
struct SlotEntry {
    semaphore: Arc<Semaphore>,
    inflight: AtomicU32,
    waiting: AtomicU32,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SlotError {
    Timeout,
    Closed,
}

impl std::fmt::Display for SlotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotError::Timeout => write!(f, "slot wait timed out"),
            SlotError::Closed => write!(f, "slot ledger closed"),
        }
    }
}

impl SlotLedger {
    pub fn new(slot_type: &'static str) -> Self {
        Self {
            slot_type,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn slot_type(&self) -> &'static str {
        self.slot_type
    }

    fn entry(&self, key: i64, max_concurrency: u32) -> Arc<SlotEntry> {
        let mut entries = self.entries.lock().expect("slot ledger poisoned");
        entries
            .entry(key)
            .or_insert_with(|| {
                Arc::new(SlotEntry {
                    semaphore: Arc::new(Semaphore::new(max_concurrency as usize)),
                    inflight: AtomicU32::new(0),
                    waiting: AtomicU32::new(0),
                })
            })
            .clone()
    }

    /// Atomic check-and-increment of the waiting counter. Returns `None`
    /// when the queue is already at `max_waiting`; otherwise the returned
    /// token decrements the counter when dropped.
    pub fn increment_waiting(&self, key: i64, max_waiting: u32, max_concurrency: u32) -> Option<WaitToken> {
        let entry = self.entry(key, max_concurrency);
        let mut current = entry.waiting.load(Ordering::Acquire);
        loop {
            if current >= max_waiting {
                return None;
            }
            match entry.waiting.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(WaitToken { entry }),
                Err(observed) => current = observed,
            }
        }
    }

    /// Wait for a free slot up to `timeout`. Dropping the returned permit
    /// (on any exit path, including client disconnect dropping the request
    /// future) releases the slot and wakes one waiter.
    pub async fn acquire(
        &self,
        key: i64,
        max_concurrency: u32,
        timeout: Duration,
    ) -> Result<SlotPermit, SlotError> {
        let entry = self.entry(key, max_concurrency);
        let semaphore = entry.semaphore.clone();
        match tokio::time::timeout(timeout, semaphore.acquire_owned()).await {
            Err(_) => Err(SlotError::Timeout),
            Ok(Err(_)) => Err(SlotError::Closed),
            Ok(Ok(permit)) => Ok(SlotPermit::new(permit, entry)),
        }
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self, key: i64, max_concurrency: u32) -> Option<SlotPermit> {
        let entry = self.entry(key, max_concurrency);
        let semaphore = entry.semaphore.clone();
        match semaphore.try_acquire_owned() {
            Ok(permit) => Some(SlotPermit::new(permit, entry)),
            Err(_) => None,
        }
    }

    pub fn inflight_of(&self, key: i64) -> u32 {
        let entries = self.entries.lock().expect("slot ledger poisoned");
        entries
            .get(&key)
            .map(|entry| entry.inflight.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn waiting_of(&self, key: i64) -> u32 {
        let entries = self.entries.lock().expect("slot ledger poisoned");
        entries
            .get(&key)
            .map(|entry| entry.waiting.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Batch inflight snapshot for load-aware selection.
    pub fn snapshot(&self, keys: impl IntoIterator<Item = i64>) -> HashMap<i64, u32> {
        let entries = self.entries.lock().expect("slot ledger poisoned");
        keys.into_iter()
            .map(|key| {
                let inflight = entries
                    .get(&key)
                    .map(|entry| entry.inflight.load(Ordering::Acquire))
                    .unwrap_or(0);
                (key, inflight)
            })
            .collect()
    }
}

/// Decrements the waiting counter exactly once, on drop.
pub struct WaitToken {
    entry: Arc<SlotEntry>,
}

impl Drop for WaitToken {
    fn drop(&mut self) {
        self.entry.waiting.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Held slot. Releasing is drop-based and therefore runs exactly once on
/// every exit path, including panic unwinding and cancelled futures.
#[derive(Debug)]
pub struct SlotPermit {
    _permit: OwnedSemaphorePermit,
    entry: Arc<SlotEntry>,
}

impl SlotPermit {
    fn new(permit: OwnedSemaphorePermit, entry: Arc<SlotEntry>) -> Self {
        entry.inflight.fetch_add(1, Ordering::AcqRel);
        Self {
            _permit: permit,
            entry,
        }
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.entry.inflight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inflight_never_exceeds_budget() {
        let ledger = SlotLedger::new("account");
        let first = ledger.try_acquire(1, 2).expect("first slot");
        let second = ledger.try_acquire(1, 2).expect("second slot");
        assert_eq!(ledger.inflight_of(1), 2);
        assert!(ledger.try_acquire(1, 2).is_none());

        drop(first);
        assert_eq!(ledger.inflight_of(1), 1);
        let third = ledger.try_acquire(1, 2).expect("freed slot");
        drop(second);
        drop(third);
        assert_eq!(ledger.inflight_of(1), 0);
    }

    #[tokio::test]
    async fn waiting_counter_is_bounded_at_increment() {
        let ledger = SlotLedger::new("user");
        let a = ledger.increment_waiting(7, 2, 1).expect("first wait");
        let b = ledger.increment_waiting(7, 2, 1).expect("second wait");
        assert_eq!(ledger.waiting_of(7), 2);
        assert!(ledger.increment_waiting(7, 2, 1).is_none());

        drop(a);
        assert_eq!(ledger.waiting_of(7), 1);
        let c = ledger.increment_waiting(7, 2, 1).expect("freed wait");
        drop(b);
        drop(c);
        assert_eq!(ledger.waiting_of(7), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_when_budget_is_held() {
        let ledger = SlotLedger::new("account");
        let held = ledger.try_acquire(3, 1).expect("slot");
        let err = ledger
            .acquire(3, 1, Duration::from_millis(50))
            .await
            .expect_err("should time out");
        assert_eq!(err, SlotError::Timeout);
        drop(held);
    }

    #[tokio::test]
    async fn acquire_wakes_waiter_after_release() {
        let ledger = Arc::new(SlotLedger::new("account"));
        let held = ledger.try_acquire(5, 1).expect("slot");

        let waiter = {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.acquire(5, 1, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        drop(held);

        let permit = waiter.await.expect("join").expect("acquired");
        assert_eq!(ledger.inflight_of(5), 1);
        drop(permit);
        assert_eq!(ledger.inflight_of(5), 0);
    }

    #[tokio::test]
    async fn dropping_a_cancelled_acquire_releases_nothing() {
        let ledger = SlotLedger::new("user");
        let held = ledger.try_acquire(9, 1).expect("slot");
        {
            let pending = ledger.acquire(9, 1, Duration::from_secs(5));
            drop(pending);
        }
        assert_eq!(ledger.inflight_of(9), 1);
        drop(held);
        assert_eq!(ledger.inflight_of(9), 0);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let ledger = SlotLedger::new("account");
        let _a = ledger.try_acquire(1, 1).expect("slot");
        assert!(ledger.try_acquire(2, 1).is_some());
        assert_eq!(ledger.snapshot([1, 2, 3]).get(&3), Some(&0));
    }
}
