#![deny(missing_docs)]
#![doc = "Offline driver for the tally rollup engine: replay sample files, compact, query."]

use std::collections::BTreeMap;
use std::io::BufRead;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tally_slice::{plan_level, CompactionReport, ManualClock, QueryRequest, QueryResult, SeriesFile, Slicer};
use tally_storage::{FieldValue, MemoryStore, Timestamp};
use tracing::{info, warn};

/// Attempts per sample when the store reports a retryable conflict.
const RECORD_ATTEMPTS: usize = 3;

/// Returns `true` if the library is properly linked and functioning.
///
/// # Examples
///
/// ```
/// assert_eq!(tallyd::health_check(), true);
/// ```
pub fn health_check() -> bool {
    true
}

/// One line of a JSONL sample file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Sample {
    /// Series kind.
    pub series: String,
    /// Identity fields by name.
    pub key: BTreeMap<String, FieldValue>,
    /// Sample value.
    pub value: f64,
    /// Epoch seconds.
    pub at: Timestamp,
}

/// Read JSONL samples; blank lines are skipped.
pub fn parse_samples<R: BufRead>(reader: R) -> Result<Vec<Sample>> {
    let mut samples = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let sample = serde_json::from_str(&line).with_context(|| format!("sample line {}", idx + 1))?;
        samples.push(sample);
    }
    Ok(samples)
}

/// What a replay should do after ingesting.
#[derive(Debug, Clone, Default)]
pub struct ReplayOptions {
    /// Series to query.
    pub series: String,
    /// Compact every series before querying.
    pub compact: bool,
    /// Query from `now - lower_secs`.
    pub lower_secs: Option<i64>,
    /// Pin the query level.
    pub level: Option<usize>,
    /// Merge finer levels into the query.
    pub cross_level: bool,
    /// Clock reading; defaults to the newest sample.
    pub now: Option<Timestamp>,
}

/// Outcome of a replay.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    /// Samples ingested.
    pub recorded: usize,
    /// Compaction passes run, per series.
    pub compactions: BTreeMap<String, Vec<CompactionReport>>,
    /// Query answer.
    pub result: QueryResult,
}

/// Ingest `samples` into a fresh memory store, optionally compact, then
/// query `opts.series`.
pub async fn replay(config: &SeriesFile, samples: &[Sample], opts: &ReplayOptions) -> Result<ReplayReport> {
    let registry = config.registry()?;
    let clock = Arc::new(ManualClock::new(0));
    let slicer = Slicer::new(MemoryStore::new(config.store.clone()), clock.clone(), registry);

    for sample in samples {
        let kind = slicer.series(&sample.series)?;
        let identity = kind.key_from_map(sample.key.clone())?;
        let mut attempt = 1;
        loop {
            match slicer.record(&sample.series, identity.clone(), sample.value, sample.at).await {
                Ok(_) => break,
                Err(e) if e.is_retryable() && attempt < RECORD_ATTEMPTS => {
                    warn!(error = %e, attempt, "retrying sample");
                    attempt += 1;
                }
                Err(e) => return Err(e).with_context(|| format!("recording sample at {}", sample.at)),
            }
        }
    }

    let now = opts
        .now
        .or_else(|| samples.iter().map(|s| s.at).max())
        .unwrap_or_default();
    clock.set(now);

    let mut compactions = BTreeMap::new();
    if opts.compact {
        let names: Vec<String> = slicer.registry().names().map(str::to_string).collect();
        for name in names {
            let reports = slicer.compact_all(&name).await?;
            compactions.insert(name, reports);
        }
    }

    let mut req = QueryRequest::new()
        .between(opts.lower_secs.map(|secs| now.saturating_sub(secs)), None)
        .cross_level(opts.cross_level);
    req.level = opts.level;
    let result = slicer.query(&opts.series, &req).await?;
    info!(recorded = samples.len(), now, level = result.level, "replay finished");

    Ok(ReplayReport {
        recorded: samples.len(),
        compactions,
        result,
    })
}

/// Level the planner would read for `series` with a range starting
/// `lower_secs` before `now`.
pub fn plan(config: &SeriesFile, series: &str, lower_secs: Option<i64>, now: Timestamp) -> Result<usize> {
    let kind = config.registry()?.get(series)?;
    Ok(plan_level(&kind, lower_secs.map(|secs| now.saturating_sub(secs)), now))
}
