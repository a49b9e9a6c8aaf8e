//! Multi-resolution rollup engine for pool statistics.
//!
//! Samples land in the finest level of a series kind through [`ingest`],
//! age upward through coarser levels via [`compact`], and are read back
//! at whatever resolution covers the requested range via [`query`].
//! [`Slicer`] wraps those operations in store transactions.
#![deny(missing_docs)]

pub mod clock;
pub mod compact;
pub mod config;
pub mod error;
pub mod ingest;
pub mod query;
pub mod series;
pub mod slicer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use compact::{compact, CompactionReport};
pub use config::{LevelConfig, SeriesConfig, SeriesFile, SeriesRegistry};
pub use error::{Result, SliceError};
pub use ingest::{record, RecordOutcome};
pub use query::{plan_level, query, Point, QueryRequest, QueryResult, SeriesPoints};
pub use series::{Combine, DeviceStat, SeriesKind, SHARE_TYPES};
pub use slicer::Slicer;
