//! Series definitions loaded from YAML.
//!
//! ```yaml
//! series:
//!   - name: shares
//!     keys: [user, worker, algo, share_type]
//!     combine: sum
//!     levels:
//!       - { window_secs: 3600, bucket_secs: 60 }
//!       - { window_secs: 86400, bucket_secs: 300 }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tally_storage::{Level, StoreConfig};

use crate::error::{Result, SliceError};
use crate::series::{Combine, SeriesKind};

/// One level as written in the config file.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LevelConfig {
    /// Retention window in seconds.
    pub window_secs: u64,
    /// Bucket width in seconds.
    pub bucket_secs: u64,
}

/// One series kind as written in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct SeriesConfig {
    /// Series name.
    pub name: String,
    /// Identity field names.
    pub keys: Vec<String>,
    /// Combine function.
    pub combine: Combine,
    /// Levels, finest first.
    pub levels: Vec<LevelConfig>,
    /// Whether compaction deletes folded rows.
    #[serde(default = "default_delete_sources")]
    pub delete_sources: bool,
}

fn default_delete_sources() -> bool {
    true
}

impl SeriesConfig {
    /// Validate into a series kind.
    pub fn build(&self) -> Result<SeriesKind> {
        let levels = self
            .levels
            .iter()
            .map(|l| Level::from_secs(l.window_secs, l.bucket_secs))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(SeriesKind::new(&self.name, self.keys.iter().cloned(), self.combine, levels)?
            .with_delete_sources(self.delete_sources))
    }
}

/// Top-level config file.
#[derive(Debug, Clone, Deserialize)]
pub struct SeriesFile {
    /// Store settings.
    #[serde(default)]
    pub store: StoreConfig,
    /// Series kinds.
    pub series: Vec<SeriesConfig>,
}

impl SeriesFile {
    /// Parse YAML text.
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Read and parse a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_yaml(&fs::read_to_string(path)?)
    }

    /// Build the registry of every series in the file.
    pub fn registry(&self) -> Result<SeriesRegistry> {
        let mut registry = SeriesRegistry::default();
        for cfg in &self.series {
            registry.register(cfg.build()?)?;
        }
        Ok(registry)
    }
}

/// Series kinds by name.
#[derive(Debug, Clone, Default)]
pub struct SeriesRegistry {
    kinds: BTreeMap<String, Arc<SeriesKind>>,
}

impl SeriesRegistry {
    /// The `shares` and `device` series.
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        for kind in [SeriesKind::shares(), SeriesKind::device()] {
            registry.kinds.insert(kind.name().to_string(), Arc::new(kind));
        }
        registry
    }

    /// Add a series kind; names must be unique.
    pub fn register(&mut self, kind: SeriesKind) -> Result<()> {
        if self.kinds.contains_key(kind.name()) {
            return Err(SliceError::Config(format!("series {} defined twice", kind.name())));
        }
        self.kinds.insert(kind.name().to_string(), Arc::new(kind));
        Ok(())
    }

    /// Look up a series kind.
    pub fn get(&self, name: &str) -> Result<Arc<SeriesKind>> {
        self.kinds
            .get(name)
            .cloned()
            .ok_or_else(|| SliceError::InvalidArgument(format!("unknown series {name}")))
    }

    /// Registered names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }
}
