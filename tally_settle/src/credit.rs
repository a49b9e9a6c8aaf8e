//! Per-user share credit over a settlement period.
use std::collections::BTreeMap;

use tally_slice::{QueryRequest, Slicer};
use tally_storage::{FieldValue, SliceStore, Timestamp};
use tracing::debug;

use crate::error::Result;

/// Series holding share counts.
pub const SHARES_SERIES: &str = "shares";

/// Sum of accepted shares per user with bucket starts in
/// `[lower, upper]`. An empty `users` slice means every user.
///
/// Every level is read, so a share is counted once wherever compaction
/// has moved it. Buckets that straddle `lower` at a coarse level count
/// in full.
pub async fn credit_for_period<S: SliceStore>(
    slicer: &Slicer<S>,
    users: &[&str],
    lower: Timestamp,
    upper: Timestamp,
) -> Result<BTreeMap<String, f64>> {
    let kind = slicer.series(SHARES_SERIES)?;
    let req = QueryRequest::new()
        .filter("user", users.iter().copied())
        .filter("share_type", ["acc"])
        .between(Some(lower), Some(upper))
        .at_level(kind.coarsest())
        .cross_level(true);
    let result = slicer.query(SHARES_SERIES, &req).await?;

    let mut credit: BTreeMap<String, f64> = BTreeMap::new();
    for series in &result.series {
        let Some(FieldValue::Str(user)) = series.key.get("user") else {
            continue;
        };
        let total: f64 = series.points.iter().map(|p| p.value).sum();
        *credit.entry(user.clone()).or_default() += total;
    }
    debug!(lower, upper, users = credit.len(), "credit computed");
    Ok(credit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tally_slice::{ManualClock, SeriesRegistry};
    use tally_storage::{IdentityKey, MemoryStore};

    fn key(user: &str, worker: &str, share_type: &str) -> IdentityKey {
        IdentityKey::new([("user", user), ("worker", worker), ("algo", "scrypt"), ("share_type", share_type)])
    }

    #[tokio::test]
    async fn sums_accepted_shares_across_levels() {
        let clock = Arc::new(ManualClock::new(0));
        let slicer = Slicer::new(MemoryStore::default(), clock.clone(), SeriesRegistry::builtin());
        slicer.record("shares", key("alice", "a1", "acc"), 10.0, 0_i64).await.unwrap();
        slicer.record("shares", key("alice", "a2", "acc"), 5.0, 60_i64).await.unwrap();
        slicer.record("shares", key("alice", "a1", "stale"), 99.0, 60_i64).await.unwrap();
        slicer.record("shares", key("bob", "b1", "acc"), 7.0, 120_i64).await.unwrap();

        clock.set(3 * 3_600);
        slicer.compact("shares", 0).await.unwrap();
        slicer.record("shares", key("alice", "a1", "acc"), 1.0, 3 * 3_600_i64).await.unwrap();
        slicer.record("shares", key("bob", "b1", "acc"), 2.0, 100 * 3_600_i64).await.unwrap();

        let all = credit_for_period(&slicer, &[], 0, 4 * 3_600).await.unwrap();
        assert_eq!(all.get("alice"), Some(&16.0));
        assert_eq!(all.get("bob"), Some(&7.0));

        let only_bob = credit_for_period(&slicer, &["bob"], 0, 4 * 3_600).await.unwrap();
        assert_eq!(only_bob.len(), 1);

        let none = credit_for_period(&slicer, &["carol"], 0, 4 * 3_600).await.unwrap();
        assert!(none.is_empty());
    }
}
