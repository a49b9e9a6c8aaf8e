//! Span-aware reads.
//!
//! Each level only keeps rows younger than its window, so the planner
//! picks the finest level whose window still reaches back to `lower`.
//! A request without `lower` reads the coarsest level, which is the only
//! one guaranteed to cover everything.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tally_metrics::QUERIES_TOTAL;
use tally_storage::{FieldValue, IdentityKey, RowFilter, SliceTxn, Timestamp};
use tracing::{debug, instrument};

use crate::error::{Result, SliceError};
use crate::series::SeriesKind;

/// A span read over one series kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRequest {
    /// Allowed values per identity field. Empty lists match anything.
    pub filters: BTreeMap<String, Vec<FieldValue>>,
    /// Inclusive lower bound on bucket start.
    pub lower: Option<Timestamp>,
    /// Inclusive upper bound on bucket start.
    pub upper: Option<Timestamp>,
    /// Read this level instead of planning one.
    pub level: Option<usize>,
    /// Also read every finer level and re-bucket its rows onto the chosen
    /// level.
    pub cross_level: bool,
}

impl QueryRequest {
    /// Empty request: everything at the coarsest level.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict `field` to `values`.
    pub fn filter<I, V>(mut self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<FieldValue>,
    {
        self.filters
            .entry(field.to_string())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Set the time range; either side may be open.
    pub fn between(mut self, lower: Option<Timestamp>, upper: Option<Timestamp>) -> Self {
        self.lower = lower;
        self.upper = upper;
        self
    }

    /// Pin the level.
    pub fn at_level(mut self, level: usize) -> Self {
        self.level = Some(level);
        self
    }

    /// Merge finer levels into the result.
    pub fn cross_level(mut self, on: bool) -> Self {
        self.cross_level = on;
        self
    }
}

/// One bucket of a result series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Point {
    /// Bucket start.
    pub bucket_start: Timestamp,
    /// Value.
    pub value: f64,
}

/// Ordered buckets for one identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesPoints {
    /// Identity.
    pub key: IdentityKey,
    /// Points in ascending bucket order.
    pub points: Vec<Point>,
}

/// Query answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    /// Level that was read.
    pub level: usize,
    /// One entry per identity, in identity order.
    pub series: Vec<SeriesPoints>,
}

impl QueryResult {
    /// Points for `key`, if any row matched it.
    pub fn get(&self, key: &IdentityKey) -> Option<&[Point]> {
        self.series
            .iter()
            .find(|s| &s.key == key)
            .map(|s| s.points.as_slice())
    }

    /// Whether no rows matched.
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

/// Level the planner reads for a request starting at `lower`.
pub fn plan_level(kind: &SeriesKind, lower: Option<Timestamp>, now: Timestamp) -> usize {
    let Some(lower) = lower else {
        return kind.coarsest();
    };
    let age = now.saturating_sub(lower);
    kind.levels()
        .iter()
        .position(|level| level.window_secs() > age)
        .unwrap_or_else(|| kind.coarsest())
}

/// Read a span of `kind` and group it by identity.
#[instrument(skip(txn, kind, req), fields(series = kind.name()))]
pub async fn query<T: SliceTxn>(txn: &mut T, kind: &SeriesKind, req: &QueryRequest, now: Timestamp) -> Result<QueryResult> {
    for field in req.filters.keys() {
        if !kind.key_fields().iter().any(|f| f == field) {
            return Err(SliceError::InvalidArgument(format!(
                "series {} has no field {field}",
                kind.name()
            )));
        }
    }
    let level_idx = match req.level {
        Some(explicit) => {
            kind.level(explicit)
                .map_err(|_| SliceError::InvalidArgument(format!("series {} has no level {explicit}", kind.name())))?;
            explicit
        }
        None => plan_level(kind, req.lower, now),
    };
    let level = kind.level(level_idx)?;
    let levels = if req.cross_level {
        (0..=level_idx).collect()
    } else {
        vec![level_idx]
    };
    let filter = RowFilter {
        series: kind.name().to_string(),
        levels,
        identity: req
            .filters
            .iter()
            .map(|(field, values)| (field.clone(), values.iter().cloned().collect::<BTreeSet<_>>()))
            .collect(),
        lower: req.lower,
        upper: req.upper,
    };

    let rows = txn.select(&filter).await?;
    let scanned = rows.len();
    let mut grouped: BTreeMap<IdentityKey, BTreeMap<Timestamp, f64>> = BTreeMap::new();
    for row in rows {
        let bucket = level.floor(row.key.bucket_start);
        grouped
            .entry(row.key.identity)
            .or_default()
            .entry(bucket)
            .and_modify(|v| *v = kind.combine().merge(*v, row.value))
            .or_insert(row.value);
    }
    QUERIES_TOTAL.inc();
    debug!(level = level_idx, scanned, identities = grouped.len(), "query served");

    Ok(QueryResult {
        level: level_idx,
        series: grouped
            .into_iter()
            .map(|(key, buckets)| SeriesPoints {
                key,
                points: buckets
                    .into_iter()
                    .map(|(bucket_start, value)| Point { bucket_start, value })
                    .collect(),
            })
            .collect(),
    })
}
