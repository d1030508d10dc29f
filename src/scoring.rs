//! Rule health scoring.
//!
//! A [`HealthScore`] combines a quality component (how well the rule maps,
//! compiles and searches) with a metadata component (five completeness
//! checks), each worth up to 50 points. Scoring takes the timestamp as an
//! argument, so the same compiled rule always yields the same score.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::compiler::{CompiledRule, FieldKind};
use crate::emit::Target;
use crate::rule::Level;

const COMPONENT_CAP: f64 = 50.0;

/// Weights and penalties used by [`score`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Points for a fully mapped field set.
    pub mapping_weight: f64,
    /// Points for a field set made entirely of keyword fields.
    pub field_type_weight: f64,
    /// Starting points of the search-cost component.
    pub search_cost_budget: f64,
    /// Deducted per predicate that needs a leading wildcard scan.
    pub leading_wildcard_penalty: f64,
    /// Deducted per full-text or text-field predicate.
    pub field_type_penalty: f64,
    /// Points per satisfied metadata check.
    pub meta_check_points: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            mapping_weight: 20.0,
            field_type_weight: 11.0,
            search_cost_budget: 10.0,
            leading_wildcard_penalty: 3.0,
            field_type_penalty: 2.0,
            meta_check_points: 10.0,
        }
    }
}

/// Score bracket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Grade {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl Grade {
    pub fn from_total(total: f64) -> Self {
        if total >= 80.0 {
            Grade::Excellent
        } else if total >= 70.0 {
            Grade::Good
        } else if total >= 50.0 {
            Grade::Fair
        } else {
            Grade::Poor
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Grade::Excellent => "excellent",
            Grade::Good => "good",
            Grade::Fair => "fair",
            Grade::Poor => "poor",
        }
    }
}

/// Per-component points behind a score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub mapping: f64,
    pub field_type: f64,
    pub language: f64,
    pub search_cost: f64,
    pub leading_wildcards: usize,
    pub costly_predicates: usize,
    /// Names of the metadata checks that failed.
    pub missing_meta: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthScore {
    pub quality: f64,
    pub meta: f64,
    pub total: f64,
    pub computed_at: DateTime<Utc>,
    pub breakdown: ScoreBreakdown,
}

impl HealthScore {
    pub fn grade(&self) -> Grade {
        Grade::from_total(self.total)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Score a compiled rule.
///
/// # Examples
///
/// ```rust
/// use chrono::Utc;
/// use tide_engine::scoring::{score, ScoringConfig};
/// use tide_engine::Compiler;
///
/// let compiled = Compiler::new().compile_rule(
///     "title: t\nlogsource: {product: windows}\ndetection: {s: {EventID: 1}, condition: s}",
/// )?;
/// let health = score(&compiled, Utc::now(), &ScoringConfig::default());
/// assert_eq!(health.meta, 0.0);
/// assert!(health.total <= 50.0);
/// # Ok::<(), tide_engine::TideError>(())
/// ```
pub fn score(compiled: &CompiledRule, now: DateTime<Utc>, config: &ScoringConfig) -> HealthScore {
    let fields = &compiled.fields;

    let (mapping_ratio, type_ratio) = if fields.is_empty() {
        (1.0, 1.0)
    } else {
        let total = fields.len() as f64;
        let weights: f64 = fields
            .fields
            .values()
            .map(|f| f.kind.map_or(0.0, FieldKind::weight))
            .sum();
        (fields.mapped_count() as f64 / total, weights / total)
    };
    let mapping = config.mapping_weight * mapping_ratio;
    let field_type = config.field_type_weight * type_ratio;

    let compiled_targets = compiled.compiled_targets();
    let language = compiled_targets
        .iter()
        .map(|target| {
            let (detection, performance) = target.language_profile();
            detection * 0.6 + performance * 0.4
        })
        .fold(0.0, f64::max);

    let predicates = compiled.expr.predicates();
    let leading_wildcards = predicates.iter().filter(|p| p.has_leading_wildcard()).count();
    let costly_predicates = predicates
        .iter()
        .filter(|p| match &p.field {
            None => true,
            Some(field) => fields.kind_of_target(field) == Some(FieldKind::Text),
        })
        .count();
    let search_cost = if compiled_targets.is_empty() {
        0.0
    } else {
        (config.search_cost_budget
            - config.leading_wildcard_penalty * leading_wildcards as f64
            - config.field_type_penalty * costly_predicates as f64)
            .max(0.0)
    };

    let quality = (mapping + field_type + language + search_cost).clamp(0.0, COMPONENT_CAP);

    let rule = &compiled.rule;
    let non_empty = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.trim().is_empty());
    let checks = [
        ("investigation_guide", non_empty(&rule.note)),
        ("timestamp_override", non_empty(&rule.timestamp_override)),
        ("techniques", !rule.techniques.is_empty()),
        ("author", non_empty(&rule.author)),
        ("highlighted_fields", !rule.fields.is_empty()),
    ];
    let passed = checks.iter().filter(|(_, ok)| *ok).count();
    let meta = (config.meta_check_points * passed as f64).min(COMPONENT_CAP);
    let missing_meta = checks
        .iter()
        .filter(|(_, ok)| !ok)
        .map(|(name, _)| name.to_string())
        .collect();

    HealthScore {
        quality: round2(quality),
        meta: round2(meta),
        total: round2(quality + meta),
        computed_at: now,
        breakdown: ScoreBreakdown {
            mapping: round2(mapping),
            field_type: round2(field_type),
            language: round2(language),
            search_cost: round2(search_cost),
            leading_wildcards,
            costly_predicates,
            missing_meta,
        },
    }
}

/// A score together with the rule attributes metrics are grouped by.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredRule {
    pub rule_id: String,
    pub level: Level,
    pub enabled: bool,
    pub space: Option<String>,
    /// First target the rule compiled for.
    pub language: Option<Target>,
    pub score: HealthScore,
}

impl ScoredRule {
    pub fn new(compiled: &CompiledRule, score: HealthScore) -> Self {
        Self {
            rule_id: compiled.rule.id.clone(),
            level: compiled.rule.level,
            enabled: true,
            space: None,
            language: compiled.compiled_targets().first().copied(),
            score,
        }
    }

    pub fn with_status(mut self, enabled: bool, space: Option<String>) -> Self {
        self.enabled = enabled;
        self.space = space;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScoreBucket {
    pub count: usize,
    pub average_score: f64,
}

/// Aggregate health over a set of scored rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuleHealthMetrics {
    pub total_rules: usize,
    pub enabled_rules: usize,
    pub disabled_rules: usize,
    pub average_score: f64,
    pub min_score: f64,
    pub max_score: f64,
    /// Rules scoring below 50.
    pub low_quality_count: usize,
    /// Rules scoring 80 or more.
    pub high_quality_count: usize,
    pub grades: BTreeMap<Grade, usize>,
    pub by_space: BTreeMap<String, ScoreBucket>,
    pub by_severity: BTreeMap<String, ScoreBucket>,
    pub by_language: BTreeMap<String, ScoreBucket>,
}

impl RuleHealthMetrics {
    pub fn from_rules(rules: &[ScoredRule]) -> Self {
        if rules.is_empty() {
            return Self::default();
        }

        let totals: Vec<f64> = rules.iter().map(|r| r.score.total).collect();
        let mut metrics = Self {
            total_rules: rules.len(),
            enabled_rules: rules.iter().filter(|r| r.enabled).count(),
            disabled_rules: rules.iter().filter(|r| !r.enabled).count(),
            average_score: round2(totals.iter().sum::<f64>() / totals.len() as f64),
            min_score: totals.iter().copied().fold(f64::INFINITY, f64::min),
            max_score: totals.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            low_quality_count: totals.iter().filter(|t| **t < 50.0).count(),
            high_quality_count: totals.iter().filter(|t| **t >= 80.0).count(),
            ..Self::default()
        };

        let mut spaces: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut severities: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut languages: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for rule in rules {
            let total = rule.score.total;
            *metrics.grades.entry(rule.score.grade()).or_default() += 1;
            spaces
                .entry(rule.space.clone().unwrap_or_else(|| "default".to_string()))
                .or_default()
                .push(total);
            severities.entry(rule.level.to_string()).or_default().push(total);
            languages
                .entry(rule.language.map_or_else(|| "none".to_string(), |t| t.to_string()))
                .or_default()
                .push(total);
        }

        let buckets = |groups: BTreeMap<String, Vec<f64>>| {
            groups
                .into_iter()
                .map(|(key, scores)| {
                    let bucket = ScoreBucket {
                        count: scores.len(),
                        average_score: round2(scores.iter().sum::<f64>() / scores.len() as f64),
                    };
                    (key, bucket)
                })
                .collect()
        };
        metrics.by_space = buckets(spaces);
        metrics.by_severity = buckets(severities);
        metrics.by_language = buckets(languages);
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{Compiler, FieldMappingPipeline, LogSourceMatch};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn ecs() -> FieldMappingPipeline {
        FieldMappingPipeline::new("ecs")
            .with_entry(LogSourceMatch::default(), "EventID", "event.code", FieldKind::Keyword)
            .with_entry(LogSourceMatch::default(), "CommandLine", "process.command_line", FieldKind::Text)
    }

    fn compile(pipeline: FieldMappingPipeline, yaml: &str) -> CompiledRule {
        Compiler::with_pipeline(pipeline).compile_rule(yaml).unwrap()
    }

    #[test]
    fn test_bare_rule_scores_quality_only() {
        let compiled = compile(
            ecs(),
            "title: t\nlogsource: {product: windows}\ndetection: {sel1: {EventID: 4688}, condition: sel1}",
        );
        let health = score(&compiled, now(), &ScoringConfig::default());

        assert_eq!(health.breakdown.mapping, 20.0);
        assert_eq!(health.breakdown.field_type, 11.0);
        assert_eq!(health.breakdown.language, 8.8);
        assert_eq!(health.breakdown.search_cost, 10.0);
        assert_eq!(health.quality, 49.8);
        assert_eq!(health.meta, 0.0);
        assert_eq!(health.breakdown.missing_meta.len(), 5);
        assert!(health.total <= 50.0);
        assert_eq!(health.computed_at, now());
    }

    #[test]
    fn test_unmapped_fields_reduce_quality() {
        let yaml = "title: t\nlogsource: {product: windows}\ndetection: {sel: {EventID: 1, User: x}, condition: sel}";
        let health = score(&compile(ecs(), yaml), now(), &ScoringConfig::default());
        assert_eq!(health.breakdown.mapping, 10.0);
        assert_eq!(health.breakdown.field_type, 5.5);
    }

    #[test]
    fn test_search_cost_penalties() {
        let yaml = "title: t\nlogsource: {product: windows}\ndetection: {sel: {CommandLine|contains: evil}, condition: sel}";
        let health = score(&compile(ecs(), yaml), now(), &ScoringConfig::default());
        assert_eq!(health.breakdown.leading_wildcards, 1);
        assert_eq!(health.breakdown.costly_predicates, 1);
        assert_eq!(health.breakdown.search_cost, 5.0);
    }

    #[test]
    fn test_full_metadata() {
        let yaml = r#"
title: Full
author: Detection Team
note: Check the parent process.
timestamp_override: event.ingested
fields: [CommandLine]
tags: [attack.execution, attack.t1059.001]
logsource: {product: windows}
detection:
    sel: {EventID: 1}
    condition: sel
"#;
        let health = score(&compile(ecs(), yaml), now(), &ScoringConfig::default());
        assert_eq!(health.meta, 50.0);
        assert!(health.breakdown.missing_meta.is_empty());
        assert_eq!(health.total, 99.8);
        assert_eq!(health.grade(), Grade::Excellent);
    }

    #[test]
    fn test_score_is_pure() {
        let compiled = compile(
            ecs(),
            "title: t\nlogsource: {product: windows}\ndetection: {sel: {CommandLine: x}, condition: sel}",
        );
        let config = ScoringConfig::default();
        assert_eq!(score(&compiled, now(), &config), score(&compiled, now(), &config));
    }

    #[test]
    fn test_grades() {
        assert_eq!(Grade::from_total(80.0), Grade::Excellent);
        assert_eq!(Grade::from_total(79.99), Grade::Good);
        assert_eq!(Grade::from_total(50.0), Grade::Fair);
        assert_eq!(Grade::from_total(49.0), Grade::Poor);
    }

    #[test]
    fn test_metrics_aggregation() {
        let compiled = compile(
            ecs(),
            "title: t\nlevel: high\nlogsource: {product: windows}\ndetection: {sel: {EventID: 1}, condition: sel}",
        );
        let health = score(&compiled, now(), &ScoringConfig::default());
        let rules = vec![
            ScoredRule::new(&compiled, health.clone()).with_status(true, Some("soc".to_string())),
            ScoredRule::new(&compiled, health).with_status(false, None),
        ];

        let metrics = RuleHealthMetrics::from_rules(&rules);
        assert_eq!(metrics.total_rules, 2);
        assert_eq!(metrics.enabled_rules, 1);
        assert_eq!(metrics.disabled_rules, 1);
        assert_eq!(metrics.low_quality_count, 2);
        assert_eq!(metrics.grades.get(&Grade::Poor), Some(&2));
        assert_eq!(metrics.by_space["soc"].count, 1);
        assert_eq!(metrics.by_space["default"].count, 1);
        assert_eq!(metrics.by_severity["high"].average_score, 49.8);
        assert_eq!(metrics.by_language["lucene"].count, 2);
    }

    #[test]
    fn test_empty_metrics() {
        assert_eq!(RuleHealthMetrics::from_rules(&[]), RuleHealthMetrics::default());
    }
}
