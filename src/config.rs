//! Unified configuration for the TIDE engine.
//!
//! This module controls which query languages are emitted, the per-target
//! settings each emitter needs (index patterns, event categories), batch
//! parallelism and the scoring weights.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::emit::Target;
use crate::error::{Result, TideError};
use crate::rule::LogSource;
use crate::scoring::ScoringConfig;

/// Parallel batch compilation settings.
///
/// Rules are independent, so a batch may be spread across the rayon pool.
/// Small batches are compiled sequentially; the pool hand-off costs more
/// than the work.
///
/// # Examples
///
/// ```rust
/// use tide_engine::config::ParallelConfig;
///
/// let config = ParallelConfig {
///     enabled: true,
///     min_batch_size: 64,
/// };
/// assert!(config.should_parallelize(128));
/// assert!(!config.should_parallelize(8));
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Enable rayon-based parallel compilation.
    ///
    /// **Default**: true
    pub enabled: bool,

    /// Minimum number of rules in a batch before parallelism kicks in.
    ///
    /// **Default**: 16
    pub min_batch_size: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_batch_size: 16,
        }
    }
}

impl ParallelConfig {
    pub fn should_parallelize(&self, batch_len: usize) -> bool {
        self.enabled && batch_len >= self.min_batch_size
    }
}

/// Built-in log-source category to EQL event category table.
const DEFAULT_EQL_CATEGORIES: &[(&str, &str)] = &[
    ("process_creation", "process"),
    ("process_termination", "process"),
    ("network_connection", "network"),
    ("firewall", "network"),
    ("file_event", "file"),
    ("file_change", "file"),
    ("file_delete", "file"),
    ("file_rename", "file"),
    ("registry_add", "registry"),
    ("registry_delete", "registry"),
    ("registry_event", "registry"),
    ("registry_set", "registry"),
    ("dns_query", "dns"),
    ("dns", "dns"),
    ("image_load", "library"),
];

/// Complete engine configuration.
///
/// Every field has a default, so a YAML file only needs the keys it wants to
/// change:
///
/// ```yaml
/// targets: [lucene, esql]
/// esql_index: "winlogbeat-*"
/// parallel:
///   min_batch_size: 64
/// ```
///
/// # Examples
///
/// ```rust
/// use tide_engine::{EngineConfig, Target};
///
/// let config = EngineConfig::new()
///     .with_targets(vec![Target::Lucene, Target::Esql])
///     .with_esql_index("winlogbeat-*")
///     .with_parallel(false);
///
/// assert_eq!(config.targets.len(), 2);
/// assert!(!config.parallel.enabled);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Enabled targets, in emission order.
    ///
    /// **Default**: all four
    pub targets: Vec<Target>,

    /// Index pattern for `FROM` in ES|QL output.
    ///
    /// **Default**: `logs-*`
    pub esql_index: String,

    /// Optional `index=` restriction for Splunk output.
    pub splunk_index: Option<String>,

    /// Overrides of the log-source category to EQL event category table.
    pub eql_category_map: BTreeMap<String, String>,

    pub parallel: ParallelConfig,

    pub scoring: ScoringConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            targets: Target::ALL.to_vec(),
            esql_index: "logs-*".to_string(),
            splunk_index: None,
            eql_category_map: BTreeMap::new(),
            parallel: ParallelConfig::default(),
            scoring: ScoringConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a YAML configuration document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_yaml::from_str(yaml).map_err(|e| TideError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.targets.is_empty() {
            return Err(TideError::Config("at least one target must be enabled".to_string()));
        }
        if self.esql_index.trim().is_empty() {
            return Err(TideError::Config("esql_index must not be empty".to_string()));
        }
        Ok(())
    }

    /// EQL event category for a rule's log source.
    ///
    /// Configured overrides win over the built-in table; unknown categories
    /// fall back to `any`.
    pub fn eql_category(&self, logsource: &LogSource) -> String {
        let Some(category) = logsource.category.as_deref() else {
            return "any".to_string();
        };
        let category = category.to_ascii_lowercase();
        if let Some(mapped) = self.eql_category_map.get(&category) {
            return mapped.clone();
        }
        DEFAULT_EQL_CATEGORIES
            .iter()
            .find(|(from, _)| *from == category)
            .map(|(_, to)| to.to_string())
            .unwrap_or_else(|| {
                if category.starts_with("registry_") {
                    "registry".to_string()
                } else {
                    "any".to_string()
                }
            })
    }

    // Builder methods

    /// Set the enabled targets.
    pub fn with_targets(mut self, targets: Vec<Target>) -> Self {
        self.targets = targets;
        self
    }

    /// Set the ES|QL index pattern.
    pub fn with_esql_index(mut self, index: impl Into<String>) -> Self {
        self.esql_index = index.into();
        self
    }

    /// Restrict Splunk output to one index.
    pub fn with_splunk_index(mut self, index: impl Into<String>) -> Self {
        self.splunk_index = Some(index.into());
        self
    }

    /// Map a log-source category to an EQL event category.
    pub fn with_eql_category(mut self, category: impl Into<String>, event_category: impl Into<String>) -> Self {
        self.eql_category_map
            .insert(category.into().to_ascii_lowercase(), event_category.into());
        self
    }

    /// Enable or disable parallel batch compilation.
    pub fn with_parallel(mut self, enable: bool) -> Self {
        self.parallel.enabled = enable;
        self
    }

    /// Set the minimum batch size for parallel compilation.
    pub fn with_min_batch_size(mut self, min_size: usize) -> Self {
        self.parallel.min_batch_size = min_size;
        self
    }

    /// Replace the scoring weights.
    pub fn with_scoring(mut self, scoring: ScoringConfig) -> Self {
        self.scoring = scoring;
        self
    }
}
