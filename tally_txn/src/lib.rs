//! TallyDB transaction layer primitives: id allocation, row locks and
//! transaction bookkeeping for the slice store.
#![deny(missing_docs)]

pub mod gtm;
pub mod lock;
pub mod txn;

pub use gtm::Gtm;
pub use lock::{HeldLocks, LockError, LockManager, TxnId};
pub use txn::{TxnHandle, TxnManager, TxnStatus};
