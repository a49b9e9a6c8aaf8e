//! Compaction: fold aged rows of one level into the next coarser level.
//!
//! Rows older than a level's retention window are scanned in ascending
//! bucket order. Consecutive rows that map to the same coarse bucket are
//! grouped by identity; when the scan crosses into the next coarse bucket
//! the groups are combined, upserted into the coarser level and (when the
//! series deletes sources) removed. The ordering of the scan is what makes
//! a single pass enough.
//!
//! Each source row is re-read under its row lock before it is folded, so a
//! sample committed into an eligible bucket after the scan still lands in
//! the coarse row instead of being deleted with it.
//!
//! Run one `compact` per transaction, and never two at once on the same
//! series and level: both would read the same rows and apply them twice.

use std::collections::BTreeMap;

use serde::Serialize;
use tally_metrics::{COARSE_UPSERTS, ROWS_COMPACTED};
use tally_storage::{IdentityKey, RowKey, SliceRow, SliceTxn, Timestamp};
use tracing::{debug, info, instrument};

use crate::error::{Result, SliceError};
use crate::series::SeriesKind;

/// Counters for one compaction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    /// Level compacted.
    pub level: usize,
    /// Eligible rows read.
    pub scanned: usize,
    /// Coarse buckets flushed.
    pub buckets: usize,
    /// Coarse rows created.
    pub inserted: usize,
    /// Coarse rows combined into.
    pub updated: usize,
    /// Source rows removed.
    pub deleted: usize,
}

impl CompactionReport {
    /// Whether the pass touched nothing.
    pub fn is_noop(&self) -> bool {
        self.scanned == 0
    }
}

struct Flush<'a> {
    kind: &'a SeriesKind,
    target_level: usize,
    delete_sources: bool,
    groups: BTreeMap<IdentityKey, Vec<SliceRow>>,
}

impl Flush<'_> {
    /// Write every pending group into coarse bucket `bucket_start`.
    async fn run<T: SliceTxn>(&mut self, txn: &mut T, bucket_start: Timestamp, report: &mut CompactionReport) -> Result<()> {
        let groups = std::mem::take(&mut self.groups);
        let group_count = groups.len();
        for (identity, rows) in groups {
            // The scan is unlocked; lock each source and fold what it holds now.
            let mut sources = Vec::with_capacity(rows.len());
            let mut values = Vec::with_capacity(rows.len());
            for row in rows {
                if let Some(value) = txn.get_for_update(&row.key).await? {
                    values.push(value);
                    sources.push(row.key);
                }
            }
            if values.is_empty() {
                continue;
            }
            let combined = self.kind.combine().fold(&values);
            let target = RowKey::new(self.kind.name(), self.target_level, bucket_start, identity);
            match txn.get_for_update(&target).await? {
                Some(existing) => {
                    // Kept sources already hold the whole bucket; merging again would count them twice.
                    let value = if self.delete_sources {
                        self.kind.combine().merge(existing, combined)
                    } else {
                        combined
                    };
                    txn.update(&target, value).await?;
                    report.updated += 1;
                }
                None => {
                    txn.insert(target, combined).await?;
                    report.inserted += 1;
                }
            }
            if self.delete_sources {
                for key in &sources {
                    txn.delete(key).await?;
                    report.deleted += 1;
                }
            }
        }
        report.buckets += 1;
        debug!(
            series = self.kind.name(),
            level = self.target_level,
            bucket_start,
            groups = group_count,
            "flushed coarse bucket"
        );
        Ok(())
    }
}

/// Push every row of `level` that has aged out of its window into
/// `level + 1`.
///
/// `now` decides which rows are old enough. Fails with a configuration
/// error on the coarsest level, which has nowhere to go.
#[instrument(skip(txn, kind), fields(series = kind.name()))]
pub async fn compact<T: SliceTxn>(
    txn: &mut T,
    kind: &SeriesKind,
    level: usize,
    now: Timestamp,
    delete_sources: bool,
) -> Result<CompactionReport> {
    let fine = kind.level(level)?;
    if level >= kind.coarsest() {
        return Err(SliceError::Config(format!(
            "series {}: level {level} is the coarsest and cannot be compacted",
            kind.name()
        )));
    }
    let coarse = kind.level(level + 1)?;
    let cutoff = fine.recent_cutoff(now);

    let mut report = CompactionReport {
        level,
        ..Default::default()
    };
    let mut flush = Flush {
        kind,
        target_level: level + 1,
        delete_sources,
        groups: BTreeMap::new(),
    };
    let mut current: Option<Timestamp> = None;

    for row in txn.scan_before(kind.name(), level, cutoff).await? {
        report.scanned += 1;
        let slot = coarse.floor(row.key.bucket_start);
        match current {
            Some(open) if open != slot => {
                flush.run(txn, open, &mut report).await?;
                current = Some(slot);
            }
            None => current = Some(slot),
            Some(_) => {}
        }
        flush.groups.entry(row.key.identity.clone()).or_default().push(row);
    }
    if let Some(open) = current {
        flush.run(txn, open, &mut report).await?;
    }

    if !report.is_noop() {
        let level_label = (level + 1).to_string();
        ROWS_COMPACTED
            .with_label_values(&[kind.name(), &level_label])
            .inc_by(report.scanned as u64);
        COARSE_UPSERTS
            .with_label_values(&[kind.name(), &level_label])
            .inc_by((report.inserted + report.updated) as u64);
    }
    info!(
        series = kind.name(),
        level,
        cutoff,
        scanned = report.scanned,
        buckets = report.buckets,
        deleted = report.deleted,
        "compaction pass finished"
    );
    Ok(report)
}
