//! Process-wide bound on simultaneously active paginated fetches
//!
//! Backed by `tokio::sync::Semaphore`, which wakes waiters in FIFO order.
//! A permit is released when the returned `GatePermit` is dropped.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("gate acquisition cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

/// Scoped slot; dropping it frees the slot for the longest waiter
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyGate {
    /// `limit` of zero is raised to one
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Wait for a free slot, or return `Cancelled` as soon as `cancel` fires
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<GatePermit, GateError> {
        if cancel.is_cancelled() {
            return Err(GateError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GateError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => Ok(GatePermit { _permit: permit }),
                // Only reachable if the semaphore is closed, which this type never does
                Err(_) => Err(GateError::Cancelled),
            },
        }
    }
}

impl Default for ConcurrencyGate {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_CONCURRENCY_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_never_exceeds_limit() {
        let gate = ConcurrencyGate::new(2);
        let cancel = CancellationToken::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            let cancel = cancel.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire(&cancel).await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_waiters_are_served_in_order() {
        let gate = ConcurrencyGate::new(1);
        let cancel = CancellationToken::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let held = gate.acquire(&cancel).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..4 {
            let gate = gate.clone();
            let cancel = cancel.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire(&cancel).await.unwrap();
                order.lock().unwrap().push(i);
            }));
            // Let each waiter enqueue before the next one
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_cancel_unblocks_waiters() {
        let gate = ConcurrencyGate::new(1);
        let cancel = CancellationToken::new();
        let _held = gate.acquire(&cancel).await.unwrap();

        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.acquire(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(5)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter did not unblock")
            .unwrap();
        assert_eq!(result.unwrap_err(), GateError::Cancelled);
    }
}
