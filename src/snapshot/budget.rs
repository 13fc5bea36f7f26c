//! Process-wide write budget
//!
//! Bounds the bytes written to snapshot files but not yet forced to stable
//! storage, summed over every target sharing the budget. Writers take budget
//! before appending a chunk and only the sync path gives it back, so a slow
//! disk throttles snapshot producers instead of growing dirty page cache.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Semaphore;

/// Counting budget of unsynced bytes
#[derive(Debug)]
pub struct WriteBudget {
    capacity: u32,
    permits: Semaphore,
    /// Bytes admitted without permits (header writes, oversized chunks)
    overdraft: AtomicU64,
}

impl WriteBudget {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            permits: Semaphore::new(capacity as usize),
            overdraft: AtomicU64::new(0),
        }
    }

    /// Take `bytes` of budget, waiting until enough has been released
    ///
    /// A request larger than the whole budget waits for the full capacity and
    /// records the remainder as overdraft.
    pub async fn acquire(&self, bytes: u64) {
        let covered = bytes.min(self.capacity as u64) as u32;
        let excess = bytes - covered as u64;

        if covered > 0 {
            match self.permits.acquire_many(covered).await {
                Ok(permit) => permit.forget(),
                // The semaphore is never closed
                Err(_) => {
                    self.overdraft.fetch_add(covered as u64, Ordering::SeqCst);
                }
            }
        }
        if excess > 0 {
            self.overdraft.fetch_add(excess, Ordering::SeqCst);
        }
    }

    /// Take `bytes` of budget without waiting, going into overdraft if needed
    pub fn admit(&self, bytes: u64) {
        let covered = bytes.min(self.capacity as u64) as u32;

        match self.permits.try_acquire_many(covered) {
            Ok(permit) => {
                permit.forget();
                let excess = bytes - covered as u64;
                if excess > 0 {
                    self.overdraft.fetch_add(excess, Ordering::SeqCst);
                }
            }
            Err(_) => {
                self.overdraft.fetch_add(bytes, Ordering::SeqCst);
            }
        }
    }

    /// Return `bytes` of budget, paying down any overdraft first
    pub fn release(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }

        let prior = self
            .overdraft
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |owed| {
                Some(owed - owed.min(bytes))
            })
            .unwrap_or(0);
        let repaid = prior.min(bytes);

        let permits = (bytes - repaid).min(self.capacity as u64 - self.available());
        if permits > 0 {
            self.permits.add_permits(permits as usize);
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Budget currently available to writers
    pub fn available(&self) -> u64 {
        self.permits.available_permits() as u64
    }

    /// Bytes currently held by writes that have not been synced
    pub fn in_use(&self) -> u64 {
        self.capacity as u64 - self.available() + self.overdraft.load(Ordering::SeqCst)
    }

    pub fn overdraft(&self) -> u64 {
        self.overdraft.load(Ordering::SeqCst)
    }
}

impl Default for WriteBudget {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_WRITE_BUDGET_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let budget = WriteBudget::new(1000);

        budget.acquire(300).await;
        budget.acquire(200).await;
        assert_eq!(budget.in_use(), 500);
        assert_eq!(budget.available(), 500);

        budget.release(500);
        assert_eq!(budget.in_use(), 0);
        assert_eq!(budget.available(), 1000);
    }

    #[tokio::test]
    async fn test_acquire_blocks_until_release() {
        let budget = Arc::new(WriteBudget::new(100));
        budget.acquire(80).await;

        let waiter = {
            let budget = Arc::clone(&budget);
            tokio::spawn(async move { budget.acquire(50).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        budget.release(80);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(budget.in_use(), 50);
    }

    #[tokio::test]
    async fn test_admit_goes_into_overdraft() {
        let budget = WriteBudget::new(100);
        budget.acquire(100).await;

        budget.admit(40);
        assert_eq!(budget.overdraft(), 40);
        assert_eq!(budget.in_use(), 140);

        // Overdraft is paid down before permits come back
        budget.release(40);
        assert_eq!(budget.overdraft(), 0);
        assert_eq!(budget.available(), 0);

        budget.release(100);
        assert_eq!(budget.available(), 100);
        assert_eq!(budget.in_use(), 0);
    }

    #[tokio::test]
    async fn test_admit_uses_permits_when_available() {
        let budget = WriteBudget::new(100);
        budget.admit(30);
        assert_eq!(budget.overdraft(), 0);
        assert_eq!(budget.available(), 70);
        budget.release(30);
        assert_eq!(budget.available(), 100);
    }

    #[tokio::test]
    async fn test_oversized_request_does_not_deadlock() {
        let budget = WriteBudget::new(100);

        tokio::time::timeout(Duration::from_secs(5), budget.acquire(250))
            .await
            .unwrap();
        assert_eq!(budget.in_use(), 250);
        assert_eq!(budget.overdraft(), 150);

        budget.release(250);
        assert_eq!(budget.in_use(), 0);
        assert_eq!(budget.available(), 100);
    }

    #[tokio::test]
    async fn test_release_never_exceeds_capacity() {
        let budget = WriteBudget::new(100);
        budget.release(500);
        assert_eq!(budget.available(), 100);
        assert_eq!(budget.in_use(), 0);
    }
}
