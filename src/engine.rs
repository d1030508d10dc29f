//! Batch compilation engine.
//!
//! The [`Engine`] runs parse → resolve → compile → emit → score for every
//! rule of a batch and publishes coverage snapshots. Rules are independent:
//! one rule's failure becomes diagnostics and never aborts the others.

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::compiler::document::slugify;
use crate::compiler::{CompiledRule, Compiler, FieldMappingPipeline};
use crate::config::EngineConfig;
use crate::coverage::{CoverageResult, CoverageSnapshot, RuleCoverageRecord, Taxonomy};
use crate::error::Diagnostic;
use crate::scoring::{score, RuleHealthMetrics, ScoredRule};

/// One rule of a batch with its enablement status.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSource {
    pub text: String,
    pub enabled: bool,
    pub space: Option<String>,
}

impl RuleSource {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            enabled: true,
            space: None,
        }
    }

    pub fn with_status(mut self, enabled: bool, space: Option<String>) -> Self {
        self.enabled = enabled;
        self.space = space;
        self
    }
}

/// Outcome for one rule of a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleReport {
    /// Position in the input batch.
    pub index: usize,
    pub rule_id: String,
    pub enabled: bool,
    pub space: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compiled: Option<CompiledRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<ScoredRule>,
    pub diagnostics: Vec<Diagnostic>,
}

impl RuleReport {
    pub fn is_compiled(&self) -> bool {
        self.compiled.is_some()
    }
}

/// Results of a batch, in input order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub rules: Vec<RuleReport>,
    pub metrics: RuleHealthMetrics,
}

impl BatchReport {
    /// Every diagnostic of the batch, in input order.
    pub fn diagnostics(&self) -> Vec<&Diagnostic> {
        self.rules.iter().flat_map(|r| r.diagnostics.iter()).collect()
    }

    pub fn compiled_count(&self) -> usize {
        self.rules.iter().filter(|r| r.is_compiled()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.rules.len() - self.compiled_count()
    }

    /// Coverage records for the compiled rules.
    pub fn coverage_records(&self) -> Vec<RuleCoverageRecord> {
        self.rules
            .iter()
            .filter_map(|report| {
                let compiled = report.compiled.as_ref()?;
                let mut record = RuleCoverageRecord::from_compiled(compiled).with_enabled(report.enabled);
                record.space = report.space.clone();
                Some(record)
            })
            .collect()
    }
}

/// Best-effort identity for a rule that may not parse.
fn fallback_rule_id(text: &str, index: usize) -> String {
    let doc: Option<serde_yaml::Value> = serde_yaml::from_str(text).ok();
    let field = |key: &str| {
        doc.as_ref()
            .and_then(|d| d.get(key))
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    field("id")
        .or_else(|| field("title").map(|t| slugify(&t)))
        .unwrap_or_else(|| format!("rule-{index}"))
}

/// Batch compiler and coverage snapshot holder.
///
/// # Examples
///
/// ```rust
/// use tide_engine::Engine;
///
/// let engine = Engine::default();
/// let report = engine.compile_batch(&[
///     "title: ok\nlogsource: {product: windows}\ndetection: {s: {EventID: 1}, condition: s}",
///     "title: broken\nlogsource: {product: windows}\ndetection: {s: {EventID: 1}, condition: missing}",
/// ]);
///
/// assert_eq!(report.compiled_count(), 1);
/// assert_eq!(report.rules[1].rule_id, "broken");
/// ```
#[derive(Debug, Default)]
pub struct Engine {
    compiler: Compiler,
    snapshot: RwLock<Arc<CoverageSnapshot>>,
}

impl Engine {
    pub fn new(config: EngineConfig, pipeline: FieldMappingPipeline) -> Self {
        Self::with_compiler(Compiler::with_pipeline(pipeline).with_config(config))
    }

    pub fn with_compiler(compiler: Compiler) -> Self {
        Self {
            compiler,
            snapshot: RwLock::new(Arc::new(CoverageSnapshot::default())),
        }
    }

    pub fn compiler(&self) -> &Compiler {
        &self.compiler
    }

    /// Compile a batch of enabled rules, scoring at the current time.
    pub fn compile_batch(&self, rules: &[&str]) -> BatchReport {
        let sources: Vec<RuleSource> = rules.iter().map(|text| RuleSource::new(*text)).collect();
        self.compile_sources(&sources, Utc::now())
    }

    /// Compile a batch, scoring at `now`. Results keep input order.
    pub fn compile_sources(&self, sources: &[RuleSource], now: DateTime<Utc>) -> BatchReport {
        let config = self.compiler.config();
        let parallel = config.parallel.should_parallelize(sources.len());

        let rules: Vec<RuleReport> = if parallel {
            let mut rules: Vec<RuleReport> = sources
                .par_iter()
                .enumerate()
                .map(|(index, source)| self.compile_one(index, source, now))
                .collect();
            rules.sort_by_key(|r| r.index);
            rules
        } else {
            sources
                .iter()
                .enumerate()
                .map(|(index, source)| self.compile_one(index, source, now))
                .collect()
        };

        let scored: Vec<ScoredRule> = rules.iter().filter_map(|r| r.score.clone()).collect();
        let report = BatchReport {
            metrics: RuleHealthMetrics::from_rules(&scored),
            rules,
        };
        info!(
            rules = sources.len(),
            compiled = report.compiled_count(),
            failed = report.failed_count(),
            parallel,
            "compiled batch"
        );
        report
    }

    fn compile_one(&self, index: usize, source: &RuleSource, now: DateTime<Utc>) -> RuleReport {
        match self.compiler.compile_rule(&source.text) {
            Ok(compiled) => {
                let health = score(&compiled, now, &self.compiler.config().scoring);
                debug!(rule = %compiled.rule.id, total = health.total, "scored rule");
                let scored = ScoredRule::new(&compiled, health).with_status(source.enabled, source.space.clone());
                RuleReport {
                    index,
                    rule_id: compiled.rule.id.clone(),
                    enabled: source.enabled,
                    space: source.space.clone(),
                    diagnostics: compiled.diagnostics(),
                    score: Some(scored),
                    compiled: Some(compiled),
                }
            }
            Err(error) => {
                let rule_id = fallback_rule_id(&source.text, index);
                debug!(rule = %rule_id, %error, "rule failed to compile");
                RuleReport {
                    index,
                    diagnostics: vec![Diagnostic::from_error(&rule_id, &error)],
                    rule_id,
                    enabled: source.enabled,
                    space: source.space.clone(),
                    compiled: None,
                    score: None,
                }
            }
        }
    }

    /// Replace the coverage snapshot. Readers holding the previous snapshot
    /// keep a consistent view.
    pub fn publish_snapshot(&self, snapshot: CoverageSnapshot) {
        let snapshot = Arc::new(snapshot);
        info!(
            techniques = snapshot.taxonomy.technique_count(),
            records = snapshot.records.len(),
            "published coverage snapshot"
        );
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *guard = snapshot;
    }

    /// Publish a snapshot built from a batch's compiled rules.
    pub fn publish_batch(&self, taxonomy: Taxonomy, report: &BatchReport) {
        self.publish_snapshot(CoverageSnapshot::new(taxonomy, report.coverage_records()));
    }

    pub fn snapshot(&self) -> Arc<CoverageSnapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Coverage over the current snapshot.
    pub fn coverage(&self, space: Option<&str>) -> CoverageResult {
        self.snapshot().compute(space)
    }
}
