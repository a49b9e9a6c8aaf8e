//! TallyDB storage layer: time bucketing, identity keys, and the
//! transactional slice store the rollup engine runs on.
#![deny(missing_docs)]

pub mod bucket;
pub mod engine;
pub mod key;
pub mod memory;

pub use bucket::{floor_time, window_bounds, BucketError, Level, Stamp, StampForm, Timestamp, WindowSpec};
pub use engine::{Result, RowFilter, RowKey, SliceRow, SliceStore, SliceTxn, StorageError};
pub use key::{FieldValue, IdentityKey};
pub use memory::{MemoryStore, MemoryTxn, StoreConfig};
