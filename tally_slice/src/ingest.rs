//! Ingestion path: additive writes into the finest level.

use tally_metrics::SAMPLES_RECORDED;
use tally_storage::{IdentityKey, RowKey, SliceTxn, Stamp};
use tracing::trace;

use crate::error::{Result, SliceError};
use crate::series::SeriesKind;

/// What `record` did to the bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecordOutcome {
    /// New bucket row created with the sample value.
    Inserted {
        /// Bucket start.
        bucket_start: i64,
    },
    /// Existing bucket combined with the sample.
    Updated {
        /// Bucket start.
        bucket_start: i64,
        /// Value after combining.
        value: f64,
    },
}

/// Add one sample to the finest level of `kind`.
///
/// The bucket row is read with a locking read, so concurrent calls for the
/// same identity and bucket serialize on the row and never lose an update.
/// A unique violation still surfacing at insert or commit is returned to
/// the caller, who retries the whole transaction.
pub async fn record<T: SliceTxn>(
    txn: &mut T,
    kind: &SeriesKind,
    identity: IdentityKey,
    value: f64,
    at: impl Into<Stamp>,
) -> Result<RecordOutcome> {
    if !value.is_finite() {
        return Err(SliceError::InvalidArgument(format!("sample value {value} is not finite")));
    }
    kind.check_key(&identity)?;
    let finest = kind.level(0)?;
    let bucket_start = finest.floor(at.into().epoch());
    let key = RowKey::new(kind.name(), 0, bucket_start, identity);

    let outcome = match txn.get_for_update(&key).await? {
        Some(existing) => {
            let merged = kind.combine().merge(existing, value);
            txn.update(&key, merged).await?;
            RecordOutcome::Updated {
                bucket_start,
                value: merged,
            }
        }
        None => {
            txn.insert(key, value).await?;
            RecordOutcome::Inserted { bucket_start }
        }
    };
    trace!(series = kind.name(), bucket_start, ?outcome, "sample recorded");
    SAMPLES_RECORDED.with_label_values(&[kind.name()]).inc();
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_storage::{MemoryStore, SliceStore};

    fn alice() -> IdentityKey {
        IdentityKey::new([("user", "alice"), ("worker", "rig1"), ("algo", "scrypt"), ("share_type", "acc")])
    }

    #[tokio::test]
    async fn same_bucket_values_accumulate() {
        let store = MemoryStore::default();
        let kind = SeriesKind::shares();
        let mut txn = store.begin().await.unwrap();
        let first = record(&mut txn, &kind, alice(), 3.0, 30_i64).await.unwrap();
        let second = record(&mut txn, &kind, alice(), 4.0, 45_i64).await.unwrap();
        txn.commit().await.unwrap();

        assert_eq!(first, RecordOutcome::Inserted { bucket_start: 0 });
        assert_eq!(
            second,
            RecordOutcome::Updated {
                bucket_start: 0,
                value: 7.0
            }
        );
        let rows = store.snapshot();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key.level, 0);
        assert_eq!(rows[0].value, 7.0);
    }

    #[tokio::test]
    async fn average_series_merges_pairwise() {
        let store = MemoryStore::default();
        let kind = SeriesKind::device();
        let key = IdentityKey::new([
            ("user", tally_storage::FieldValue::from("alice")),
            ("worker", "rig1".into()),
            ("device", 0_i64.into()),
            ("stat", crate::series::DeviceStat::Temperature.into()),
        ]);
        let mut txn = store.begin().await.unwrap();
        record(&mut txn, &kind, key.clone(), 60.0, 61_i64).await.unwrap();
        record(&mut txn, &kind, key, 70.0, 119_i64).await.unwrap();
        txn.commit().await.unwrap();
        let rows = store.snapshot();
        assert_eq!(rows[0].key.bucket_start, 60);
        assert_eq!(rows[0].value, 65.0);
    }

    #[tokio::test]
    async fn rejects_foreign_keys_and_nan() {
        let store = MemoryStore::default();
        let kind = SeriesKind::shares();
        let mut txn = store.begin().await.unwrap();
        let bad = IdentityKey::new([("user", "alice")]);
        assert!(matches!(
            record(&mut txn, &kind, bad, 1.0, 0_i64).await,
            Err(SliceError::InvalidArgument(_))
        ));
        assert!(matches!(
            record(&mut txn, &kind, alice(), f64::NAN, 0_i64).await,
            Err(SliceError::InvalidArgument(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_records_never_lose_updates() {
        let store = MemoryStore::default();
        let kind = std::sync::Arc::new(SeriesKind::shares());
        let mut tasks = Vec::new();
        for i in 1..=20 {
            let store = store.clone();
            let kind = kind.clone();
            tasks.push(tokio::spawn(async move {
                let mut txn = store.begin().await.unwrap();
                record(&mut txn, &kind, alice(), i as f64, 960_i64 + i).await.unwrap();
                tokio::task::yield_now().await;
                txn.commit().await.unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        let rows = store.snapshot();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, (1..=20).sum::<i64>() as f64);
    }
}
