//! In-memory slice store with read-committed visibility and row locks.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Deserialize;
use tally_txn::{TxnHandle, TxnId, TxnManager, TxnStatus};
use tracing::debug;

use crate::bucket::Timestamp;
use crate::engine::{Result, RowFilter, RowKey, SliceRow, SliceStore, SliceTxn, StorageError};

/// Memory store settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Longest a locking read waits for another transaction, in milliseconds.
    pub lock_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5_000,
        }
    }
}

impl StoreConfig {
    /// Lock wait budget.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

struct Inner {
    rows: RwLock<BTreeMap<RowKey, f64>>,
    txns: TxnManager,
}

/// Shared in-memory slice store. Clones share the same rows.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new(config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                rows: RwLock::new(BTreeMap::new()),
                txns: TxnManager::new(config.lock_timeout()),
            }),
        }
    }

    /// Committed rows, in key order.
    pub fn snapshot(&self) -> Vec<SliceRow> {
        self.inner
            .rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, value)| SliceRow {
                key: key.clone(),
                value: *value,
            })
            .collect()
    }

    /// Number of committed rows.
    pub fn len(&self) -> usize {
        self.inner.rows.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no row is committed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Transaction manager backing this store.
    pub fn txns(&self) -> &TxnManager {
        &self.inner.txns
    }
}

#[async_trait::async_trait]
impl SliceStore for MemoryStore {
    type Txn = MemoryTxn;

    async fn begin(&self) -> Result<MemoryTxn> {
        Ok(MemoryTxn {
            handle: Some(self.inner.txns.begin()),
            store: self.inner.clone(),
            writes: BTreeMap::new(),
        })
    }
}

/// Pending change to one row.
#[derive(Debug, Clone, Copy)]
enum Write {
    Insert(f64),
    Update(f64),
    Delete,
}

/// Transaction over a `MemoryStore`. Writes are buffered and applied
/// atomically on commit; dropping the value without committing aborts.
pub struct MemoryTxn {
    store: Arc<Inner>,
    handle: Option<TxnHandle>,
    writes: BTreeMap<RowKey, Write>,
}

impl MemoryTxn {
    fn committed(&self, key: &RowKey) -> Option<f64> {
        self.store
            .rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }

    /// Value as seen by this transaction: own writes over committed rows.
    fn visible(&self, key: &RowKey) -> Option<f64> {
        match self.writes.get(key) {
            Some(Write::Insert(v)) | Some(Write::Update(v)) => Some(*v),
            Some(Write::Delete) => None,
            None => self.committed(key),
        }
    }

    async fn lock(&mut self, key: &RowKey) -> Result<()> {
        let handle = self.handle.as_mut().ok_or_else(closed)?;
        self.store.txns.lock_row(handle, &key.resource_id()).await?;
        Ok(())
    }

    /// Committed rows in `[lo, hi)` with this transaction's writes applied.
    fn read_range(&self, lo: &RowKey, hi: &RowKey) -> BTreeMap<RowKey, f64> {
        let range = (Bound::Included(lo), Bound::Excluded(hi));
        let mut view: BTreeMap<RowKey, f64> = self
            .store
            .rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .range::<RowKey, _>(range)
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        for (k, w) in self.writes.range::<RowKey, _>(range) {
            match w {
                Write::Insert(v) | Write::Update(v) => {
                    view.insert(k.clone(), *v);
                }
                Write::Delete => {
                    view.remove(k);
                }
            }
        }
        view
    }

    fn end(&mut self, status: TxnStatus) {
        if let Some(handle) = self.handle.take() {
            self.store.txns.finish(handle, status);
        }
    }
}

fn closed() -> StorageError {
    StorageError::Other("transaction already finished".into())
}

fn rows_of(view: BTreeMap<RowKey, f64>) -> Vec<SliceRow> {
    view.into_iter().map(|(key, value)| SliceRow { key, value }).collect()
}

#[async_trait::async_trait]
impl SliceTxn for MemoryTxn {
    fn id(&self) -> TxnId {
        self.handle.as_ref().map(TxnHandle::id).unwrap_or(TxnId(0))
    }

    async fn get_for_update(&mut self, key: &RowKey) -> Result<Option<f64>> {
        self.lock(key).await?;
        Ok(self.visible(key))
    }

    async fn insert(&mut self, key: RowKey, value: f64) -> Result<()> {
        if self.visible(&key).is_some() {
            return Err(StorageError::UniqueViolation(key.resource_id()));
        }
        // Re-inserting a row deleted earlier in this txn nets out to an update.
        let write = match self.writes.get(&key) {
            Some(Write::Delete) => Write::Update(value),
            _ => Write::Insert(value),
        };
        self.writes.insert(key, write);
        Ok(())
    }

    async fn update(&mut self, key: &RowKey, value: f64) -> Result<()> {
        self.lock(key).await?;
        if self.visible(key).is_none() {
            return Err(StorageError::NotFound(key.resource_id()));
        }
        let write = match self.writes.get(key) {
            Some(Write::Insert(_)) => Write::Insert(value),
            _ => Write::Update(value),
        };
        self.writes.insert(key.clone(), write);
        Ok(())
    }

    async fn delete(&mut self, key: &RowKey) -> Result<()> {
        self.lock(key).await?;
        if self.visible(key).is_none() {
            return Err(StorageError::NotFound(key.resource_id()));
        }
        if let Some(Write::Insert(_)) = self.writes.get(key) {
            self.writes.remove(key);
        } else {
            self.writes.insert(key.clone(), Write::Delete);
        }
        Ok(())
    }

    async fn scan_before(&mut self, series: &str, level: usize, cutoff: Timestamp) -> Result<Vec<SliceRow>> {
        let lo = RowKey::lower_bound(series, level, Timestamp::MIN);
        let hi = RowKey::lower_bound(series, level, cutoff);
        Ok(rows_of(self.read_range(&lo, &hi)))
    }

    async fn select(&mut self, filter: &RowFilter) -> Result<Vec<SliceRow>> {
        let mut out = Vec::new();
        for &level in &filter.levels {
            let lo = RowKey::lower_bound(&filter.series, level, filter.lower.unwrap_or(Timestamp::MIN));
            let hi = match filter.upper {
                Some(upper) if upper < Timestamp::MAX => RowKey::lower_bound(&filter.series, level, upper + 1),
                _ => RowKey::lower_bound(&filter.series, level + 1, Timestamp::MIN),
            };
            if lo >= hi {
                continue;
            }
            out.extend(
                rows_of(self.read_range(&lo, &hi))
                    .into_iter()
                    .filter(|row| filter.matches(&row.key)),
            );
        }
        Ok(out)
    }

    async fn commit(mut self) -> Result<()> {
        let writes = std::mem::take(&mut self.writes);
        let outcome = {
            let mut rows = self.store.rows.write().unwrap_or_else(PoisonError::into_inner);
            let clash = writes
                .iter()
                .find(|(k, w)| matches!(w, Write::Insert(_)) && rows.contains_key(*k))
                .map(|(k, _)| k.resource_id());
            match clash {
                Some(res) => Err(StorageError::UniqueViolation(res)),
                None => {
                    for (k, w) in &writes {
                        match w {
                            Write::Insert(v) | Write::Update(v) => {
                                rows.insert(k.clone(), *v);
                            }
                            Write::Delete => {
                                rows.remove(k);
                            }
                        }
                    }
                    Ok(())
                }
            }
        };
        match &outcome {
            Ok(()) => {
                debug!(txn = ?self.id(), writes = writes.len(), "commit");
                self.end(TxnStatus::Committed);
            }
            Err(e) => {
                debug!(txn = ?self.id(), error = %e, "commit rejected");
                self.end(TxnStatus::Aborted);
            }
        }
        outcome
    }

    async fn rollback(mut self) -> Result<()> {
        self.writes.clear();
        self.end(TxnStatus::Aborted);
        Ok(())
    }
}

impl Drop for MemoryTxn {
    fn drop(&mut self) {
        self.end(TxnStatus::Aborted);
    }
}
