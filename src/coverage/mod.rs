//! Taxonomy coverage aggregation.
//!
//! A technique is covered when at least one enabled rule claims that exact
//! id. Credit never rolls up from a sub-technique to its parent or down from
//! a parent to its children.
//!
//! # Examples
//!
//! ```rust
//! use tide_engine::coverage::{compute_coverage, RuleCoverageRecord, Taxonomy};
//!
//! let mut taxonomy = Taxonomy::new();
//! taxonomy.add_tactic("TA0005", "Defense Evasion", "defense-evasion")?;
//! taxonomy.add_technique("T1055", "Process Injection", &["TA0005"])?;
//! taxonomy.add_subtechnique("T1055.001", "DLL Injection", "T1055")?;
//!
//! let records = vec![RuleCoverageRecord::new("rule-1", ["T1055.001"])];
//! let result = compute_coverage(&taxonomy, &records, None);
//!
//! assert_eq!(result.covered, 1);
//! assert_eq!(result.tactics[0].gaps, vec!["T1055"]);
//! # Ok::<(), tide_engine::TideError>(())
//! ```

pub mod actors;
pub mod taxonomy;

pub use actors::{
    actor_coverage, build_heatmap, load_actors, load_actors_file, threat_landscape, ActorCoverage, CoverageStatus,
    HeatmapCell, HeatmapColumn, HeatmapData, ThreatActor, ThreatLandscape,
};
pub use taxonomy::{TacticNode, Taxonomy, TechniqueNode};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::compiler::CompiledRule;
use crate::error::{Result, TideError};
use taxonomy::normalize_id;

/// Space a record belongs to when it names none.
pub const DEFAULT_SPACE: &str = "default";

fn enabled_by_default() -> bool {
    true
}

/// A rule's technique claims together with its enablement status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCoverageRecord {
    pub rule_id: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub space: Option<String>,
    #[serde(default)]
    pub techniques: Vec<String>,
}

impl RuleCoverageRecord {
    pub fn new<I, S>(rule_id: &str, techniques: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            rule_id: rule_id.to_string(),
            enabled: true,
            space: None,
            techniques: techniques.into_iter().map(|t| t.as_ref().to_string()).collect(),
        }
    }

    /// Record for a compiled rule, enabled in the default space.
    pub fn from_compiled(compiled: &CompiledRule) -> Self {
        Self::new(&compiled.rule.id, &compiled.rule.techniques)
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_space(mut self, space: impl Into<String>) -> Self {
        self.space = Some(space.into());
        self
    }

    pub fn space_name(&self) -> &str {
        self.space.as_deref().unwrap_or(DEFAULT_SPACE)
    }

    /// Normalised, de-duplicated technique ids.
    pub fn technique_ids(&self) -> BTreeSet<String> {
        self.techniques
            .iter()
            .map(|t| normalize_id(t))
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// Load a YAML or JSON list of records.
    pub fn load_all(text: &str) -> Result<Vec<Self>> {
        serde_yaml::from_str(text).map_err(|e| TideError::Yaml(e.to_string()))
    }

    pub fn load_file(path: impl AsRef<Path>) -> Result<Vec<Self>> {
        let text = std::fs::read_to_string(path)?;
        Self::load_all(&text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TacticCoverage {
    pub tactic_id: String,
    pub name: String,
    pub shortname: String,
    pub covered: usize,
    pub total: usize,
    pub percentage: f64,
    /// Uncovered technique ids in taxonomy order.
    pub gaps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct CoverageResult {
    pub tactics: Vec<TacticCoverage>,
    pub covered: usize,
    pub total: usize,
    pub percentage: f64,
    pub covered_techniques: BTreeSet<String>,
    /// Enabled rules claiming each covered technique.
    pub technique_rule_counts: BTreeMap<String, usize>,
    /// Claimed ids that are not in the taxonomy.
    pub unknown_techniques: BTreeSet<String>,
    pub contributing_rules: usize,
}

impl CoverageResult {
    pub fn tactic(&self, key: &str) -> Option<&TacticCoverage> {
        self.tactics
            .iter()
            .find(|t| t.tactic_id.eq_ignore_ascii_case(key) || t.shortname.eq_ignore_ascii_case(key))
    }

    pub fn is_covered(&self, technique: &str) -> bool {
        self.covered_techniques.contains(&normalize_id(technique))
    }
}

fn percentage(covered: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        covered as f64 / total as f64 * 100.0
    }
}

/// Compute coverage for the enabled records, optionally restricted to one
/// space.
pub fn compute_coverage(taxonomy: &Taxonomy, records: &[RuleCoverageRecord], space: Option<&str>) -> CoverageResult {
    let mut result = CoverageResult::default();

    for record in records {
        if !record.enabled || space.is_some_and(|s| record.space_name() != s) {
            continue;
        }
        let mut contributed = false;
        for technique in record.technique_ids() {
            if taxonomy.technique_idx(&technique).is_some() {
                *result.technique_rule_counts.entry(technique.clone()).or_default() += 1;
                result.covered_techniques.insert(technique);
                contributed = true;
            } else {
                result.unknown_techniques.insert(technique);
            }
        }
        if contributed {
            result.contributing_rules += 1;
        }
    }

    for tactic in taxonomy.tactics() {
        let mut covered = 0;
        let mut gaps = Vec::new();
        for &idx in &tactic.techniques {
            let id = &taxonomy.technique_at(idx).id;
            if result.covered_techniques.contains(id) {
                covered += 1;
            } else {
                gaps.push(id.clone());
            }
        }
        let total = tactic.techniques.len();
        result.tactics.push(TacticCoverage {
            tactic_id: tactic.id.clone(),
            name: tactic.name.clone(),
            shortname: tactic.shortname.clone(),
            covered,
            total,
            percentage: percentage(covered, total),
            gaps,
        });
    }

    result.total = taxonomy.technique_count();
    result.covered = result.covered_techniques.len();
    result.percentage = percentage(result.covered, result.total);
    result
}

/// Immutable pair of taxonomy and rule records that coverage is computed
/// from. Publishers replace whole snapshots; readers never see a partial
/// update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoverageSnapshot {
    pub taxonomy: Taxonomy,
    pub records: Vec<RuleCoverageRecord>,
}

impl CoverageSnapshot {
    pub fn new(taxonomy: Taxonomy, records: Vec<RuleCoverageRecord>) -> Self {
        Self { taxonomy, records }
    }

    pub fn compute(&self, space: Option<&str>) -> CoverageResult {
        compute_coverage(&self.taxonomy, &self.records, space)
    }
}
