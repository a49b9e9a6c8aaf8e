//! Store boundary: row keys, filters, and the transactional store traits.
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::bucket::Timestamp;
use crate::key::{FieldValue, IdentityKey};
use tally_txn::{LockError, TxnId};

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Insert of a row whose primary identity already exists.
    #[error("unique violation on row {0}")]
    UniqueViolation(String),
    /// Update or delete of a row that does not exist.
    #[error("row not found: {0}")]
    NotFound(String),
    /// Locking read gave up waiting.
    #[error(transparent)]
    Lock(#[from] LockError),
    /// IO or other underlying error.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Primary identity of a slice row. Ordering is series, level, bucket
/// start, identity, so a range over one series and level comes back in
/// ascending bucket order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RowKey {
    /// Series kind name.
    pub series: String,
    /// Level index, 0 = finest.
    pub level: usize,
    /// Epoch-aligned bucket start.
    pub bucket_start: Timestamp,
    /// Identity fields.
    pub identity: IdentityKey,
}

impl RowKey {
    /// Build a row key.
    pub fn new(series: &str, level: usize, bucket_start: Timestamp, identity: IdentityKey) -> Self {
        Self {
            series: series.to_string(),
            level,
            bucket_start,
            identity,
        }
    }

    /// Smallest key of `(series, level)` at `bucket_start`; every stored
    /// row with that bucket start sorts at or after it.
    pub fn lower_bound(series: &str, level: usize, bucket_start: Timestamp) -> Self {
        Self::new(series, level, bucket_start, IdentityKey::default())
    }

    /// Resource id used for row locks. Names and values are quoted, so
    /// distinct keys never share an id.
    pub fn resource_id(&self) -> String {
        format!("{:?}/{}/{}/{:?}", self.series, self.level, self.bucket_start, self.identity)
    }
}

/// One stored bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SliceRow {
    /// Primary identity.
    pub key: RowKey,
    /// Accumulated value.
    pub value: f64,
}

/// Predicate for range reads.
#[derive(Debug, Clone, Default)]
pub struct RowFilter {
    /// Series kind name.
    pub series: String,
    /// Levels to read.
    pub levels: Vec<usize>,
    /// Allowed values per identity field; absent or empty sets match anything.
    pub identity: BTreeMap<String, BTreeSet<FieldValue>>,
    /// Inclusive lower bound on bucket start.
    pub lower: Option<Timestamp>,
    /// Inclusive upper bound on bucket start.
    pub upper: Option<Timestamp>,
}

impl RowFilter {
    /// Whether a row key satisfies the predicate.
    pub fn matches(&self, key: &RowKey) -> bool {
        key.series == self.series
            && self.levels.contains(&key.level)
            && self.lower.map_or(true, |lo| key.bucket_start >= lo)
            && self.upper.map_or(true, |hi| key.bucket_start <= hi)
            && self.identity.iter().all(|(field, allowed)| {
                allowed.is_empty() || key.identity.get(field).is_some_and(|v| allowed.contains(v))
            })
    }
}

/// Transactional slice store: the boundary the rollup engine needs from
/// persistence.
#[async_trait::async_trait]
pub trait SliceStore: Send + Sync {
    /// Transaction type handed out by `begin`.
    type Txn: SliceTxn;

    /// Open a transaction.
    async fn begin(&self) -> Result<Self::Txn>;
}

/// One open transaction against a slice store. Writes become visible to
/// other transactions on `commit`; row locks are held until the
/// transaction ends.
#[async_trait::async_trait]
pub trait SliceTxn: Send {
    /// Transaction id.
    fn id(&self) -> TxnId;

    /// Locking read: take the row's exclusive lock (waiting for any other
    /// holder to finish), then read it. Locks a missing row too.
    async fn get_for_update(&mut self, key: &RowKey) -> Result<Option<f64>>;

    /// Insert a new row; fails with `UniqueViolation` if it exists, either
    /// now or at commit time.
    async fn insert(&mut self, key: RowKey, value: f64) -> Result<()>;

    /// Overwrite an existing row's value.
    async fn update(&mut self, key: &RowKey, value: f64) -> Result<()>;

    /// Delete an existing row.
    async fn delete(&mut self, key: &RowKey) -> Result<()>;

    /// All rows of `(series, level)` with `bucket_start < cutoff`, in
    /// ascending bucket order.
    async fn scan_before(&mut self, series: &str, level: usize, cutoff: Timestamp) -> Result<Vec<SliceRow>>;

    /// Rows matching `filter`.
    async fn select(&mut self, filter: &RowFilter) -> Result<Vec<SliceRow>>;

    /// Make the transaction's writes durable and release its locks.
    async fn commit(self) -> Result<()>;

    /// Discard the transaction's writes and release its locks.
    async fn rollback(self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(level: usize, start: Timestamp, user: &str, algo: &str) -> RowKey {
        RowKey::new("shares", level, start, IdentityKey::new([("user", user), ("algo", algo)]))
    }

    #[test]
    fn keys_order_by_bucket_then_identity() {
        let mut keys = vec![key(0, 120, "a", "x"), key(0, 60, "b", "x"), key(0, 60, "a", "x")];
        keys.sort();
        let starts: Vec<_> = keys.iter().map(|k| (k.bucket_start, k.identity.to_string())).collect();
        assert_eq!(
            starts,
            vec![
                (60, "user=a,algo=x".to_string()),
                (60, "user=b,algo=x".to_string()),
                (120, "user=a,algo=x".to_string()),
            ]
        );
        assert!(RowKey::lower_bound("shares", 0, 60) < keys[0]);
    }

    #[test]
    fn resource_ids_keep_separators_apart() {
        let joined = RowKey::new("shares", 0, 60, IdentityKey::new([("user", "a,algo=x")]));
        let split = key(0, 60, "a", "x");
        assert_eq!(joined.identity.to_string(), split.identity.to_string());
        assert_ne!(joined.resource_id(), split.resource_id());
        assert_eq!(split.resource_id(), key(0, 60, "a", "x").resource_id());
    }

    #[test]
    fn filter_matches_sets_and_bounds() {
        let mut filter = RowFilter {
            series: "shares".into(),
            levels: vec![0],
            lower: Some(60),
            upper: Some(120),
            ..Default::default()
        };
        filter
            .identity
            .insert("user".into(), [FieldValue::from("a")].into_iter().collect());
        filter.identity.insert("algo".into(), BTreeSet::new());

        assert!(filter.matches(&key(0, 60, "a", "x")));
        assert!(filter.matches(&key(0, 120, "a", "y")));
        assert!(!filter.matches(&key(0, 180, "a", "x")));
        assert!(!filter.matches(&key(0, 60, "b", "x")));
        assert!(!filter.matches(&key(1, 60, "a", "x")));
    }
}
