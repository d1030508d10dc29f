//! Threat-actor coverage, heatmap and landscape summaries.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use super::taxonomy::{normalize_id, Taxonomy};
use crate::error::{Result, TideError};

/// Column name for techniques with no tactic in the taxonomy.
const OTHER_COLUMN: &str = "other";
const TOP_UNCOVERED: usize = 10;

/// A threat actor and the techniques threat intel attributes to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatActor {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub techniques: Vec<String>,
}

impl ThreatActor {
    pub fn new<I, S>(name: &str, techniques: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            name: name.to_string(),
            aliases: Vec::new(),
            origin: None,
            techniques: techniques.into_iter().map(|t| t.as_ref().to_string()).collect(),
        }
    }

    pub fn with_origin(mut self, origin: &str) -> Self {
        self.origin = Some(origin.to_string());
        self
    }

    pub fn technique_set(&self) -> BTreeSet<String> {
        self.techniques
            .iter()
            .map(|t| normalize_id(t))
            .filter(|t| !t.is_empty())
            .collect()
    }
}

/// Load a YAML or JSON list of actors.
pub fn load_actors(text: &str) -> Result<Vec<ThreatActor>> {
    serde_yaml::from_str(text).map_err(|e| TideError::Yaml(e.to_string()))
}

pub fn load_actors_file(path: impl AsRef<Path>) -> Result<Vec<ThreatActor>> {
    let text = std::fs::read_to_string(path)?;
    load_actors(&text)
}

/// `|actor ∩ covered| / |actor|`, or `None` when the actor has no techniques.
///
/// # Examples
///
/// ```rust
/// use std::collections::BTreeSet;
/// use tide_engine::coverage::actor_coverage;
///
/// let actor: BTreeSet<String> = ["T1003", "T1059"].iter().map(|s| s.to_string()).collect();
/// let covered: BTreeSet<String> = ["T1059"].iter().map(|s| s.to_string()).collect();
/// assert_eq!(actor_coverage(&actor, &covered), Some(0.5));
/// assert_eq!(actor_coverage(&BTreeSet::new(), &covered), None);
/// ```
pub fn actor_coverage(actor: &BTreeSet<String>, covered: &BTreeSet<String>) -> Option<f64> {
    if actor.is_empty() {
        return None;
    }
    Some(actor.intersection(covered).count() as f64 / actor.len() as f64)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActorCoverage {
    pub actor: String,
    pub covered: usize,
    pub total: usize,
    /// `None` when the actor has no known techniques.
    pub ratio: Option<f64>,
    pub missing: Vec<String>,
}

impl ActorCoverage {
    pub fn compute(actor: &ThreatActor, covered: &BTreeSet<String>) -> Self {
        let techniques = actor.technique_set();
        Self {
            actor: actor.name.clone(),
            covered: techniques.intersection(covered).count(),
            total: techniques.len(),
            ratio: actor_coverage(&techniques, covered),
            missing: techniques.difference(covered).cloned().collect(),
        }
    }
}

/// Heatmap cell status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverageStatus {
    /// Used by a selected actor and not covered.
    Gap,
    /// Used by a selected actor and covered.
    Covered,
    /// Covered but not used by any selected actor.
    Defense,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatmapCell {
    pub technique_id: String,
    pub name: Option<String>,
    pub status: CoverageStatus,
    /// Selected actors using the technique.
    pub actor_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatmapColumn {
    pub tactic: String,
    pub cells: Vec<HeatmapCell>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatmapData {
    /// Non-empty columns in taxonomy order, with `other` last.
    pub columns: Vec<HeatmapColumn>,
    pub total: usize,
    pub gap_count: usize,
    pub covered_count: usize,
    pub defense_count: usize,
    /// Truncated percentage of actor-used techniques that are covered.
    pub coverage_pct: u32,
}

/// Build the actor/coverage heatmap. `show_defense` adds covered techniques
/// none of the actors use.
pub fn build_heatmap(
    taxonomy: &Taxonomy,
    actors: &[ThreatActor],
    covered: &BTreeSet<String>,
    show_defense: bool,
) -> HeatmapData {
    let mut usage: BTreeMap<String, usize> = BTreeMap::new();
    for actor in actors {
        for technique in actor.technique_set() {
            *usage.entry(technique).or_default() += 1;
        }
    }

    let mut displayed: BTreeSet<&String> = usage.keys().collect();
    if show_defense {
        displayed.extend(covered.iter());
    }

    let mut columns: Vec<(String, Vec<HeatmapCell>)> = taxonomy
        .tactics()
        .iter()
        .map(|t| (t.shortname.clone(), Vec::new()))
        .collect();
    columns.push((OTHER_COLUMN.to_string(), Vec::new()));
    let other = columns.len() - 1;

    for technique in displayed {
        let actor_count = usage.get(technique).copied().unwrap_or(0);
        let status = match (actor_count > 0, covered.contains(technique)) {
            (true, false) => CoverageStatus::Gap,
            (true, true) => CoverageStatus::Covered,
            _ => CoverageStatus::Defense,
        };
        let node = taxonomy.technique(technique);
        let column = node
            .and_then(|n| n.tactics.first().copied())
            .unwrap_or(other);
        columns[column].1.push(HeatmapCell {
            technique_id: technique.clone(),
            name: node.map(|n| n.name.clone()),
            status,
            actor_count,
        });
    }

    let gap_count = usage.keys().filter(|t| !covered.contains(*t)).count();
    let covered_count = usage.len() - gap_count;
    let defense_count = if show_defense {
        covered.iter().filter(|t| !usage.contains_key(*t)).count()
    } else {
        0
    };
    let coverage_pct = if usage.is_empty() {
        0
    } else {
        (covered_count * 100 / usage.len()) as u32
    };

    HeatmapData {
        columns: columns
            .into_iter()
            .filter(|(_, cells)| !cells.is_empty())
            .map(|(tactic, cells)| HeatmapColumn { tactic, cells })
            .collect(),
        total: usage.len(),
        gap_count,
        covered_count,
        defense_count,
        coverage_pct,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TechniqueFrequency {
    pub technique_id: String,
    pub actor_count: usize,
}

/// Aggregate view of all tracked actors against the covered set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreatLandscape {
    pub total_actors: usize,
    /// Sum of every actor's technique count.
    pub total_techniques: usize,
    pub unique_techniques: usize,
    pub avg_techniques_per_actor: f64,
    pub covered_techniques: usize,
    pub uncovered_techniques: usize,
    /// Share of unique actor techniques that are covered, one decimal.
    pub global_coverage_pct: f64,
    pub top_uncovered: Vec<TechniqueFrequency>,
    pub fully_covered_actors: usize,
    pub partially_covered_actors: usize,
    pub uncovered_actors: usize,
    pub origin_breakdown: BTreeMap<String, usize>,
}

pub fn threat_landscape(actors: &[ThreatActor], covered: &BTreeSet<String>) -> ThreatLandscape {
    let mut frequency: BTreeMap<String, usize> = BTreeMap::new();
    let mut origins: BTreeMap<String, usize> = BTreeMap::new();
    let (mut fully, mut partially, mut none) = (0, 0, 0);
    let mut total_techniques = 0;

    for actor in actors {
        let techniques = actor.technique_set();
        total_techniques += techniques.len();
        let hits = techniques.intersection(covered).count();
        match hits {
            0 => none += 1,
            n if n == techniques.len() => fully += 1,
            _ => partially += 1,
        }
        for technique in techniques {
            *frequency.entry(technique).or_default() += 1;
        }
        let origin = actor
            .origin
            .as_deref()
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .unwrap_or("unknown");
        *origins.entry(origin.to_string()).or_default() += 1;
    }

    let unique = frequency.len();
    let covered_count = frequency.keys().filter(|t| covered.contains(*t)).count();

    let mut uncovered: Vec<TechniqueFrequency> = frequency
        .iter()
        .filter(|(t, _)| !covered.contains(*t))
        .map(|(t, count)| TechniqueFrequency {
            technique_id: t.clone(),
            actor_count: *count,
        })
        .collect();
    uncovered.sort_by(|a, b| {
        b.actor_count
            .cmp(&a.actor_count)
            .then_with(|| a.technique_id.cmp(&b.technique_id))
    });
    uncovered.truncate(TOP_UNCOVERED);

    let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };

    ThreatLandscape {
        total_actors: actors.len(),
        total_techniques,
        unique_techniques: unique,
        avg_techniques_per_actor: (ratio(total_techniques, actors.len()) * 10.0).round() / 10.0,
        covered_techniques: covered_count,
        uncovered_techniques: unique - covered_count,
        global_coverage_pct: (ratio(covered_count, unique) * 1000.0).round() / 10.0,
        top_uncovered: uncovered,
        fully_covered_actors: fully,
        partially_covered_actors: partially,
        uncovered_actors: none,
        origin_breakdown: origins,
    }
}
