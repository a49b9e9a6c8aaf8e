//! Transaction-owning facade over the engine functions.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tally_metrics::COMPACTION_SECS;
use tally_storage::{IdentityKey, SliceStore, SliceTxn, Stamp};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::compact::{compact, CompactionReport};
use crate::config::SeriesRegistry;
use crate::error::Result;
use crate::ingest::{record, RecordOutcome};
use crate::query::{query, QueryRequest, QueryResult};
use crate::series::SeriesKind;

type GuardMap = HashMap<(String, usize), Arc<AsyncMutex<()>>>;

/// Store, clock and series registry bundled together. Every call runs in
/// its own transaction, committed on success and rolled back on error.
pub struct Slicer<S: SliceStore> {
    store: S,
    clock: Arc<dyn Clock>,
    registry: SeriesRegistry,
    compaction_guards: Mutex<GuardMap>,
}

impl<S: SliceStore> Slicer<S> {
    /// Create a slicer.
    pub fn new(store: S, clock: Arc<dyn Clock>, registry: SeriesRegistry) -> Self {
        Self {
            store,
            clock,
            registry,
            compaction_guards: Mutex::new(HashMap::new()),
        }
    }

    /// Underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Registered series kinds.
    pub fn registry(&self) -> &SeriesRegistry {
        &self.registry
    }

    /// Look up a series kind.
    pub fn series(&self, name: &str) -> Result<Arc<SeriesKind>> {
        self.registry.get(name)
    }

    /// Clock reading used for retention and planning.
    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// Record one sample into `series`.
    pub async fn record(&self, series: &str, identity: IdentityKey, value: f64, at: impl Into<Stamp>) -> Result<RecordOutcome> {
        let kind = self.series(series)?;
        let at = at.into();
        let mut txn = self.store.begin().await?;
        let res = record(&mut txn, &kind, identity, value, at).await;
        finish(txn, res).await
    }

    /// Compact one level of `series` into the next, using the series'
    /// `delete_sources` setting. Calls for the same series and level
    /// wait for each other.
    pub async fn compact(&self, series: &str, level: usize) -> Result<CompactionReport> {
        let kind = self.series(series)?;
        let guard = self.guard(kind.name(), level);
        let _held = guard.lock().await;

        let started = Instant::now();
        let mut txn = self.store.begin().await?;
        let res = compact(&mut txn, &kind, level, self.clock.now(), kind.delete_sources()).await;
        let res = finish(txn, res).await;
        COMPACTION_SECS.observe(started.elapsed().as_secs_f64());
        res
    }

    /// Compact every level of `series` except the coarsest, finest first,
    /// one transaction per level.
    pub async fn compact_all(&self, series: &str) -> Result<Vec<CompactionReport>> {
        let kind = self.series(series)?;
        let mut reports = Vec::with_capacity(kind.coarsest());
        for level in 0..kind.coarsest() {
            reports.push(self.compact(series, level).await?);
        }
        let scanned: usize = reports.iter().map(|r| r.scanned).sum();
        info!(series, levels = reports.len(), scanned, "compacted series");
        Ok(reports)
    }

    /// Run a span query against `series`.
    pub async fn query(&self, series: &str, req: &QueryRequest) -> Result<QueryResult> {
        let kind = self.series(series)?;
        let mut txn = self.store.begin().await?;
        let res = query(&mut txn, &kind, req, self.clock.now()).await;
        finish(txn, res).await
    }

    fn guard(&self, series: &str, level: usize) -> Arc<AsyncMutex<()>> {
        self.compaction_guards
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((series.to_string(), level))
            .or_default()
            .clone()
    }
}

async fn finish<T: SliceTxn, R>(txn: T, res: Result<R>) -> Result<R> {
    match res {
        Ok(value) => {
            txn.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = txn.rollback().await {
                warn!(error = %rollback, "rollback failed");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::SliceError;
    use tally_storage::{MemoryStore, StorageError};

    fn key(user: &str) -> IdentityKey {
        IdentityKey::new([("user", user), ("worker", "w"), ("algo", "sha256"), ("share_type", "acc")])
    }

    fn slicer(clock: Arc<ManualClock>) -> Slicer<MemoryStore> {
        Slicer::new(MemoryStore::default(), clock, SeriesRegistry::builtin())
    }

    #[tokio::test]
    async fn record_compact_query_roundtrip() {
        let clock = Arc::new(ManualClock::new(0));
        let s = slicer(clock.clone());
        s.record("shares", key("a"), 3.0, 30_i64).await.unwrap();
        s.record("shares", key("a"), 4.0, 45_i64).await.unwrap();

        let reports = s.compact_all("shares").await.unwrap();
        assert!(reports.iter().all(CompactionReport::is_noop));

        clock.advance(2 * 3_600);
        let reports = s.compact_all("shares").await.unwrap();
        assert_eq!(reports[0].scanned, 1);
        assert!(reports[1].is_noop());

        let result = s
            .query("shares", &QueryRequest::new().between(Some(0), None))
            .await
            .unwrap();
        assert_eq!(result.level, 1);
        assert_eq!(result.get(&key("a")).unwrap()[0].value, 7.0);
    }

    #[tokio::test]
    async fn errors_roll_back() {
        let s = slicer(Arc::new(ManualClock::new(0)));
        assert!(matches!(
            s.record("nope", key("a"), 1.0, 0_i64).await,
            Err(SliceError::InvalidArgument(_))
        ));
        assert!(matches!(s.compact("shares", 2).await, Err(SliceError::Config(_))));
        assert!(s.store().is_empty());
        assert_eq!(s.store().txns().outcomes(), (0, 1));
    }

    #[tokio::test]
    async fn lock_timeout_is_retryable() {
        let store = MemoryStore::new(tally_storage::StoreConfig { lock_timeout_ms: 20 });
        let s = Slicer::new(store.clone(), Arc::new(ManualClock::new(0)), SeriesRegistry::builtin());
        s.record("shares", key("a"), 1.0, 0_i64).await.unwrap();

        let kind = s.series("shares").unwrap();
        let mut holder = store.begin().await.unwrap();
        record(&mut holder, &kind, key("a"), 1.0, 0_i64).await.unwrap();

        let err = s.record("shares", key("a"), 1.0, 0_i64).await.unwrap_err();
        assert!(matches!(err, SliceError::Storage(StorageError::Lock(_))));
        assert!(err.is_retryable());
        holder.commit().await.unwrap();
        assert_eq!(store.snapshot()[0].value, 2.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_compactions_do_not_double_count() {
        let clock = Arc::new(ManualClock::new(0));
        let s = Arc::new(slicer(clock.clone()));
        for minute in 0..30_i64 {
            s.record("shares", key("a"), 1.0, minute * 60).await.unwrap();
        }
        clock.set(5 * 3_600);
        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let s = s.clone();
                tokio::spawn(async move { s.compact("shares", 0).await.unwrap() })
            })
            .collect();
        let mut scanned = 0;
        for t in tasks {
            scanned += t.await.unwrap().scanned;
        }
        assert_eq!(scanned, 30);
        let total: f64 = s.store().snapshot().iter().map(|r| r.value).sum();
        assert_eq!(total, 30.0);
    }
}
