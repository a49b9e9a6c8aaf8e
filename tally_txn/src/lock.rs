//! Row-level exclusive locks.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex as RowMutex, OwnedMutexGuard};
use tracing::trace;

/// Transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(pub u64);

/// Row lock acquisition failure.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another transaction held the row longer than the wait budget.
    #[error("txn {txn:?} waited {waited:?} for row lock on {resource}")]
    Timeout {
        /// Waiting transaction.
        txn: TxnId,
        /// Resource id of the contended row.
        resource: String,
        /// Time spent waiting before giving up.
        waited: Duration,
    },
}

/// Exclusive row locks owned by one transaction. Dropping the value
/// releases every lock it holds.
#[derive(Default)]
pub struct HeldLocks {
    guards: HashMap<String, OwnedMutexGuard<()>>,
}

impl HeldLocks {
    /// Whether the resource is already locked by the owner.
    pub fn holds(&self, res: &str) -> bool {
        self.guards.contains_key(res)
    }

    /// Number of rows currently locked.
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    /// Whether no row is locked.
    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }
}

/// Row-level exclusive lock table. A lock is keyed by resource id and may
/// refer to a row that does not exist yet, so a locking read on a missing
/// row still serializes the writers that follow it.
#[derive(Default)]
pub struct LockManager {
    table: Mutex<HashMap<String, Arc<RowMutex<()>>>>, // resource-id -> slot
}

impl LockManager {
    /// Acquire the exclusive lock on `res` for `txn`, waiting at most `wait`.
    /// Re-locking a row the transaction already holds is a no-op.
    pub async fn lock_row(
        &self,
        txn: TxnId,
        held: &mut HeldLocks,
        res: &str,
        wait: Duration,
    ) -> Result<(), LockError> {
        if held.holds(res) {
            return Ok(());
        }
        let slot = {
            let mut tbl = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            tbl.entry(res.to_string()).or_default().clone()
        };
        match tokio::time::timeout(wait, slot.lock_owned()).await {
            Ok(guard) => {
                trace!(?txn, resource = res, "row lock granted");
                held.guards.insert(res.to_string(), guard);
                Ok(())
            }
            Err(_) => Err(LockError::Timeout {
                txn,
                resource: res.to_string(),
                waited: wait,
            }),
        }
    }

    /// Release all locks in `held`, returning how many were released.
    pub fn release_all(&self, held: HeldLocks) -> usize {
        let released = held.len();
        drop(held);
        let mut tbl = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        // Slots referenced only by the table have no holder and no waiter.
        tbl.retain(|_, slot| Arc::strong_count(slot) > 1);
        released
    }

    /// Number of rows with a live lock slot.
    pub fn tracked(&self) -> usize {
        self.table.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    const WAIT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn relock_is_reentrant() {
        let lm = LockManager::default();
        let mut held = HeldLocks::default();
        lm.lock_row(TxnId(1), &mut held, "r1", WAIT).await.unwrap();
        lm.lock_row(TxnId(1), &mut held, "r1", WAIT).await.unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(lm.release_all(held), 1);
        assert_eq!(lm.tracked(), 0);
    }

    #[tokio::test]
    async fn contended_lock_times_out() {
        let lm = LockManager::default();
        let mut t1 = HeldLocks::default();
        let mut t2 = HeldLocks::default();
        lm.lock_row(TxnId(1), &mut t1, "r1", WAIT).await.unwrap();
        let err = lm
            .lock_row(TxnId(2), &mut t2, "r1", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { txn: TxnId(2), .. }));
        // Other rows stay available.
        lm.lock_row(TxnId(2), &mut t2, "r2", WAIT).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn waiter_proceeds_after_release() {
        let lm = Arc::new(LockManager::default());
        let mut t1 = HeldLocks::default();
        lm.lock_row(TxnId(1), &mut t1, "r1", WAIT).await.unwrap();

        let granted = Arc::new(AtomicBool::new(false));
        let waiter = {
            let lm = lm.clone();
            let granted = granted.clone();
            tokio::spawn(async move {
                let mut t2 = HeldLocks::default();
                lm.lock_row(TxnId(2), &mut t2, "r1", WAIT).await.unwrap();
                granted.store(true, Ordering::SeqCst);
                lm.release_all(t2);
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!granted.load(Ordering::SeqCst));
        lm.release_all(t1);
        waiter.await.unwrap();
        assert!(granted.load(Ordering::SeqCst));
        assert_eq!(lm.tracked(), 0);
    }
}
