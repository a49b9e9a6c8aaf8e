//! Transaction id allocation.
use std::sync::atomic::{AtomicU64, Ordering};

use crate::lock::TxnId;

/// Global Transaction Manager issuing monotonic transaction ids.
#[derive(Debug)]
pub struct Gtm {
    counter: AtomicU64,
}

impl Default for Gtm {
    fn default() -> Self {
        Self {
            counter: AtomicU64::new(1),
        }
    }
}

impl Gtm {
    /// Allocate a new monotonically increasing raw id.
    #[inline]
    pub fn alloc(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocate the id of a new transaction.
    #[inline]
    pub fn alloc_txn(&self) -> TxnId {
        TxnId(self.alloc())
    }
}
