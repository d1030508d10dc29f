//! Detection rule compiler.
//!
//! This module turns Sigma-style YAML rules into the language-neutral
//! [`Expr`] tree and, from there, into query text for every enabled target.
//!
//! The compiler is organized into several sub-modules:
//! - [`document`] - YAML rule parsing into a [`RuleDocument`]
//! - [`parser`] - Tokenization and parsing of condition expressions
//! - [`modifiers`] - Field modifier validation and value encoding
//! - [`field_mapping`] - Log-source specific field rewrites
//! - [`codegen`] - Expression tree generation from parsed conditions
//!
//! # Examples
//!
//! Basic usage:
//! ```rust
//! use tide_engine::{Compiler, Target};
//!
//! let compiler = Compiler::new();
//! let rule_yaml = r#"
//! title: Windows Login Event
//! logsource:
//!     category: authentication
//! detection:
//!     selection:
//!         EventID: 4624
//!         LogonType: 2
//!     condition: selection
//! "#;
//!
//! let compiled = compiler.compile_rule(rule_yaml)?;
//! assert_eq!(compiled.query(Target::Lucene), Some("EventID:4624 AND LogonType:2"));
//! # Ok::<(), tide_engine::TideError>(())
//! ```
//!
//! With a field mapping pipeline:
//! ```rust
//! use tide_engine::compiler::{FieldKind, FieldMappingPipeline, LogSourceMatch};
//! use tide_engine::{Compiler, Target};
//!
//! let pipeline = FieldMappingPipeline::new("ecs").with_entry(
//!     LogSourceMatch::default(),
//!     "EventID",
//!     "event.code",
//!     FieldKind::Keyword,
//! );
//! let compiler = Compiler::with_pipeline(pipeline);
//! let compiled = compiler.compile_rule(
//!     "title: t\nlogsource: {product: windows}\ndetection: {s: {EventID: 1}, condition: s}",
//! )?;
//! assert_eq!(compiled.query(Target::Lucene), Some("event.code:1"));
//! # Ok::<(), tide_engine::TideError>(())
//! ```

pub mod codegen;
pub mod document;
pub mod field_mapping;
pub mod modifiers;
pub mod parser;

pub use document::{parse_rule, parse_rule_value};
pub use field_mapping::{
    FieldKind, FieldMappingPipeline, LogSourceMatch, MappingEntry, ResolvedField, ResolvedFieldSet,
};

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::emit::{self, Target};
use crate::error::{Diagnostic, Result};
use crate::ir::Expr;
use crate::rule::RuleDocument;

/// Emission result for one target.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TargetOutput {
    Emitted { query: String },
    Failed { construct: String, message: String },
}

impl TargetOutput {
    pub fn query(&self) -> Option<&str> {
        match self {
            TargetOutput::Emitted { query } => Some(query),
            TargetOutput::Failed { .. } => None,
        }
    }

    pub fn is_emitted(&self) -> bool {
        matches!(self, TargetOutput::Emitted { .. })
    }
}

/// A rule compiled for every enabled target.
///
/// Target failures are recorded per target; they never prevent the other
/// targets from being emitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledRule {
    pub rule: RuleDocument,
    pub expr: Expr,
    pub fields: ResolvedFieldSet,
    pub outputs: BTreeMap<Target, TargetOutput>,
    /// Mapping resolution warnings.
    pub warnings: Vec<Diagnostic>,
}

impl CompiledRule {
    /// Emitted query text for `target`, if it compiled.
    pub fn query(&self, target: Target) -> Option<&str> {
        self.outputs.get(&target).and_then(TargetOutput::query)
    }

    /// Targets that produced query text, in target order.
    pub fn compiled_targets(&self) -> Vec<Target> {
        self.outputs
            .iter()
            .filter(|(_, output)| output.is_emitted())
            .map(|(target, _)| *target)
            .collect()
    }

    /// Warnings plus one diagnostic per failed target.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        let mut diagnostics = self.warnings.clone();
        for (target, output) in &self.outputs {
            if let TargetOutput::Failed { construct, message } = output {
                diagnostics.push(Diagnostic {
                    rule_id: self.rule.id.clone(),
                    kind: crate::error::DiagnosticKind::UnsupportedConstructError,
                    construct: construct.clone(),
                    message: message.clone(),
                    target: Some(*target),
                });
            }
        }
        diagnostics
    }
}

/// The rule compiler.
///
/// Holds the read-only inputs shared by every compilation: the field mapping
/// pipeline and the engine configuration. Compiling never mutates the
/// compiler, so one instance can serve a whole parallel batch.
///
/// # Examples
///
/// ```rust
/// use tide_engine::{Compiler, EngineConfig, Target};
///
/// let compiler = Compiler::new().with_config(EngineConfig::new().with_targets(vec![Target::Eql]));
/// assert_eq!(compiler.config().targets, vec![Target::Eql]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Compiler {
    pipeline: FieldMappingPipeline,
    config: EngineConfig,
}

impl Compiler {
    /// Create a compiler with no field mappings and default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a compiler with a field mapping pipeline.
    pub fn with_pipeline(pipeline: FieldMappingPipeline) -> Self {
        Self {
            pipeline,
            config: EngineConfig::default(),
        }
    }

    /// Replace the configuration, builder style.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn pipeline(&self) -> &FieldMappingPipeline {
        &self.pipeline
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Parse and compile a YAML rule.
    pub fn compile_rule(&self, rule_yaml: &str) -> Result<CompiledRule> {
        let document = parse_rule(rule_yaml)?;
        self.compile_document(document)
    }

    /// Compile an already-parsed rule.
    ///
    /// Parse and expression errors are returned; emission errors are recorded
    /// per target in [`CompiledRule::outputs`].
    pub fn compile_document(&self, document: RuleDocument) -> Result<CompiledRule> {
        let fields = self.pipeline.resolve(&document, &document.logsource);

        let warnings: Vec<Diagnostic> = fields
            .unmapped()
            .into_iter()
            .map(|field| {
                warn!(rule = %document.id, field, "unmapped field");
                Diagnostic::unmapped_field(&document.id, field)
            })
            .collect();

        let expr = self.compile_expression(&document, &fields)?;

        let mut outputs = BTreeMap::new();
        for &target in &self.config.targets {
            let output = match emit::emit(target, &expr, &document, &self.config) {
                Ok(query) => {
                    debug!(rule = %document.id, %target, "emitted query");
                    TargetOutput::Emitted { query }
                }
                Err(error) => {
                    warn!(rule = %document.id, %target, %error, "emission failed");
                    TargetOutput::Failed {
                        construct: error.construct(),
                        message: error.to_string(),
                    }
                }
            };
            outputs.insert(target, output);
        }

        Ok(CompiledRule {
            rule: document,
            expr,
            fields,
            outputs,
            warnings,
        })
    }

    /// Build the expression tree for a parsed rule and resolved field set.
    pub fn compile_expression(&self, document: &RuleDocument, fields: &ResolvedFieldSet) -> Result<Expr> {
        codegen::generate_expression(document, fields)
    }
}
