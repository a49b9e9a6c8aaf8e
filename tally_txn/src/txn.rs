//! Transaction lifecycle.
use crate::gtm::Gtm;
use crate::lock::{HeldLocks, LockError, LockManager, TxnId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Transaction status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnStatus {
    /// Active running.
    Active,
    /// Committed.
    Committed,
    /// Aborted.
    Aborted,
}

/// An open transaction: its id plus the row locks it has taken.
pub struct TxnHandle {
    id: TxnId,
    locks: HeldLocks,
}

impl TxnHandle {
    /// Transaction id.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Number of row locks held.
    pub fn locked_rows(&self) -> usize {
        self.locks.len()
    }
}

/// Transaction manager: allocates ids, grants row locks, tracks which
/// transactions are still open.
pub struct TxnManager {
    gtm: Gtm,
    lock_mgr: Arc<LockManager>,
    active: Mutex<HashSet<TxnId>>,
    lock_timeout: Duration,
    committed: AtomicU64,
    aborted: AtomicU64,
}

impl Default for TxnManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl TxnManager {
    /// Create a manager whose locking reads give up after `lock_timeout`.
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            gtm: Gtm::default(),
            lock_mgr: Arc::new(LockManager::default()),
            active: Mutex::new(HashSet::new()),
            lock_timeout,
            committed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
        }
    }

    /// Begin a new transaction.
    pub fn begin(&self) -> TxnHandle {
        let id = self.gtm.alloc_txn();
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
        TxnHandle {
            id,
            locks: HeldLocks::default(),
        }
    }

    /// Acquire the exclusive lock on a row, held until the transaction ends.
    pub async fn lock_row(&self, txn: &mut TxnHandle, res: &str) -> Result<(), LockError> {
        self.lock_mgr
            .lock_row(txn.id, &mut txn.locks, res, self.lock_timeout)
            .await
    }

    /// End the transaction with `status`, releasing its locks.
    pub fn finish(&self, txn: TxnHandle, status: TxnStatus) {
        let TxnHandle { id, locks } = txn;
        let released = self.lock_mgr.release_all(locks);
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        match status {
            TxnStatus::Committed => self.committed.fetch_add(1, Ordering::Relaxed),
            _ => self.aborted.fetch_add(1, Ordering::Relaxed),
        };
        debug!(?id, ?status, released, "transaction finished");
    }

    /// Status of `txn`; finished transactions are not retained, so only
    /// `Active` or `None` is reported.
    pub fn status(&self, txn: TxnId) -> Option<TxnStatus> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&txn)
            .then_some(TxnStatus::Active)
    }

    /// Count of (committed, aborted) transactions since creation.
    pub fn outcomes(&self) -> (u64, u64) {
        (
            self.committed.load(Ordering::Relaxed),
            self.aborted.load(Ordering::Relaxed),
        )
    }

    /// Lock wait budget.
    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn begin_lock_commit_flow() {
        let tm = TxnManager::default();
        let mut txn = tm.begin();
        let id = txn.id();
        assert_eq!(tm.status(id), Some(TxnStatus::Active));
        tm.lock_row(&mut txn, "shares/0/60/user=a").await.unwrap();
        assert_eq!(txn.locked_rows(), 1);
        tm.finish(txn, TxnStatus::Committed);
        assert_eq!(tm.status(id), None);
        assert_eq!(tm.outcomes(), (1, 0));
    }

    #[tokio::test]
    async fn abort_releases_locks_for_next_txn() {
        let tm = TxnManager::new(Duration::from_millis(50));
        let mut first = tm.begin();
        tm.lock_row(&mut first, "row").await.unwrap();
        let mut second = tm.begin();
        assert!(tm.lock_row(&mut second, "row").await.is_err());
        tm.finish(first, TxnStatus::Aborted);
        tm.lock_row(&mut second, "row").await.unwrap();
        tm.finish(second, TxnStatus::Committed);
        assert_eq!(tm.outcomes(), (1, 1));
    }
}
