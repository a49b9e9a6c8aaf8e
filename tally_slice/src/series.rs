//! Series kind definitions.
//!
//! A series kind fixes the identity fields, the combine function and the
//! ordered resolution levels. The engine functions take it as a plain
//! value; nothing is looked up from global state.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use tally_storage::{FieldValue, IdentityKey, Level};

use crate::error::{Result, SliceError};

/// Share outcome classes recorded in the `shares` series.
pub const SHARE_TYPES: [&str; 4] = ["acc", "low", "dup", "stale"];

/// How values are merged, both when the same bucket is written twice and
/// when fine buckets roll up into a coarse one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Combine {
    /// Additive counters (share counts).
    Sum,
    /// Unweighted mean of the inputs (telemetry). Merging an existing mean
    /// with a new one does not weight by sample count.
    Average,
}

impl Combine {
    /// Combine a non-empty list of values. An empty list yields 0.
    pub fn fold(self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        let sum: f64 = values.iter().sum();
        match self {
            Combine::Sum => sum,
            Combine::Average => sum / values.len() as f64,
        }
    }

    /// Combine an already stored value with an incoming one.
    pub fn merge(self, existing: f64, incoming: f64) -> f64 {
        self.fold(&[existing, incoming])
    }
}

/// Telemetry stat codes stored in the `device` series' `stat` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStat {
    /// Device hash rate.
    Hashrate,
    /// Device temperature.
    Temperature,
}

impl DeviceStat {
    /// Stored code.
    pub fn code(self) -> i64 {
        match self {
            DeviceStat::Hashrate => 0,
            DeviceStat::Temperature => 1,
        }
    }

    /// Decode a stored code.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(DeviceStat::Hashrate),
            1 => Some(DeviceStat::Temperature),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceStat::Hashrate => "hashrate",
            DeviceStat::Temperature => "temperature",
        })
    }
}

impl From<DeviceStat> for FieldValue {
    fn from(stat: DeviceStat) -> Self {
        FieldValue::Int(stat.code())
    }
}

/// Definition of one kind of rolled-up series.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesKind {
    name: String,
    key_fields: Vec<String>,
    combine: Combine,
    levels: Vec<Level>,
    delete_sources: bool,
}

impl SeriesKind {
    /// Validate and build a series kind. Levels go finest first; each
    /// coarser bucket width must be a whole multiple of the finer one so
    /// fine buckets never straddle a coarse boundary.
    pub fn new<I, S>(name: &str, key_fields: I, combine: Combine, levels: Vec<Level>) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let key_fields: Vec<String> = key_fields.into_iter().map(Into::into).collect();
        if name.is_empty() {
            return Err(SliceError::Config("series name is empty".into()));
        }
        if key_fields.is_empty() {
            return Err(SliceError::Config(format!("series {name}: no identity fields")));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = key_fields.iter().find(|f| !seen.insert(f.as_str())) {
            return Err(SliceError::Config(format!("series {name}: duplicate field {dup}")));
        }
        if levels.is_empty() {
            return Err(SliceError::Config(format!("series {name}: no levels")));
        }
        for (i, pair) in levels.windows(2).enumerate() {
            let (fine, coarse) = (pair[0], pair[1]);
            if coarse.width_secs() % fine.width_secs() != 0 {
                return Err(SliceError::Config(format!(
                    "series {name}: level {} width {}s is not a multiple of level {i} width {}s",
                    i + 1,
                    coarse.width_secs(),
                    fine.width_secs()
                )));
            }
            if coarse.window() < fine.window() {
                return Err(SliceError::Config(format!(
                    "series {name}: level {} window shorter than level {i}",
                    i + 1
                )));
            }
        }
        Ok(Self {
            name: name.to_string(),
            key_fields,
            combine,
            levels,
            delete_sources: true,
        })
    }

    /// Keep (`false`) or delete (`true`, default) fine rows once compacted.
    pub fn with_delete_sources(mut self, delete: bool) -> Self {
        self.delete_sources = delete;
        self
    }

    /// Accepted/rejected share counts, summed.
    pub fn shares() -> Self {
        Self::new("shares", ["user", "worker", "algo", "share_type"], Combine::Sum, default_levels())
            .expect("built-in shares series is valid")
    }

    /// Device telemetry (hash rate, temperature), averaged.
    pub fn device() -> Self {
        Self::new("device", ["user", "worker", "device", "stat"], Combine::Average, default_levels())
            .expect("built-in device series is valid")
    }

    /// Series name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity field names in key order.
    pub fn key_fields(&self) -> &[String] {
        &self.key_fields
    }

    /// Combine function.
    pub fn combine(&self) -> Combine {
        self.combine
    }

    /// Levels, finest first.
    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    /// Whether compaction deletes the rows it folds.
    pub fn delete_sources(&self) -> bool {
        self.delete_sources
    }

    /// Index of the coarsest level.
    pub fn coarsest(&self) -> usize {
        self.levels.len() - 1
    }

    /// Level `index`, or a configuration error if there is none.
    pub fn level(&self, index: usize) -> Result<&Level> {
        self.levels.get(index).ok_or_else(|| {
            SliceError::Config(format!(
                "series {} has {} levels, no level {index}",
                self.name,
                self.levels.len()
            ))
        })
    }

    /// Check that `key` carries exactly this series' fields, in order.
    pub fn check_key(&self, key: &IdentityKey) -> Result<()> {
        if key.names().eq(self.key_fields.iter().map(String::as_str)) {
            Ok(())
        } else {
            Err(SliceError::InvalidArgument(format!(
                "key {key} does not match fields [{}] of series {}",
                self.key_fields.join(", "),
                self.name
            )))
        }
    }

    /// Build a key from named values, ordering them by the series' fields.
    /// Missing or extra fields are rejected.
    pub fn key_from_map(&self, mut values: BTreeMap<String, FieldValue>) -> Result<IdentityKey> {
        let mut fields = Vec::with_capacity(self.key_fields.len());
        for name in &self.key_fields {
            let value = values.remove(name).ok_or_else(|| {
                SliceError::InvalidArgument(format!("series {}: missing field {name}", self.name))
            })?;
            fields.push((name.clone(), value));
        }
        if let Some(extra) = values.keys().next() {
            return Err(SliceError::InvalidArgument(format!(
                "series {}: unknown field {extra}",
                self.name
            )));
        }
        Ok(IdentityKey::new(fields))
    }
}

/// Levels shared by the built-in series: 1h of minutes, 1d of 5 minutes,
/// 30d of hours.
pub fn default_levels() -> Vec<Level> {
    [(3_600, 60), (86_400, 300), (30 * 86_400, 3_600)]
        .into_iter()
        .map(|(window, width)| Level::from_secs(window, width).expect("built-in level is valid"))
        .collect()
}
