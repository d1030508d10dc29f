//! # TIDE Detection Engine
//!
//! Compiles Sigma-style YAML detection rules into query text for several
//! search back ends (Lucene, Splunk SPL, EQL and ES|QL), scores each rule's
//! health, and measures how well a rule set covers an ATT&CK-style taxonomy.
//!
//! ## Quick Start
//!
//! ### Compiling a rule
//!
//! ```rust
//! use tide_engine::{Compiler, Target};
//!
//! let compiler = Compiler::new();
//! let rule_yaml = r#"
//! title: Encoded PowerShell
//! logsource:
//!     product: windows
//!     category: process_creation
//! detection:
//!     selection:
//!         Image|endswith: '\powershell.exe'
//!         CommandLine|contains: ' -enc '
//!     condition: selection
//! "#;
//!
//! let compiled = compiler.compile_rule(rule_yaml)?;
//! assert_eq!(compiled.compiled_targets().len(), 4);
//! assert!(compiled.query(Target::Eql).unwrap().starts_with("process where "));
//! # Ok::<(), tide_engine::TideError>(())
//! ```
//!
//! ### Batch compilation and coverage
//!
//! ```rust
//! use tide_engine::coverage::Taxonomy;
//! use tide_engine::Engine;
//!
//! let mut taxonomy = Taxonomy::new();
//! taxonomy.add_tactic("TA0002", "Execution", "execution")?;
//! taxonomy.add_technique("T1059", "Command and Scripting Interpreter", &["TA0002"])?;
//! taxonomy.add_technique("T1204", "User Execution", &["TA0002"])?;
//!
//! let engine = Engine::default();
//! let report = engine.compile_batch(&[
//!     "title: a\ntags: [attack.t1059]\nlogsource: {product: windows}\ndetection: {s: {EventID: 1}, condition: s}",
//! ]);
//! engine.publish_batch(taxonomy, &report);
//!
//! let coverage = engine.coverage(None);
//! assert_eq!(coverage.percentage, 50.0);
//! # Ok::<(), tide_engine::TideError>(())
//! ```

pub mod compiler;
pub mod config;
pub mod coverage;
pub mod emit;
pub mod engine;
pub mod error;
pub mod eval;
pub mod ir;
pub mod rule;
pub mod scoring;

// Compiler and configuration
pub use compiler::{CompiledRule, Compiler, FieldMappingPipeline, TargetOutput};
pub use config::{EngineConfig, ParallelConfig};

// Emission
pub use emit::{Emitter, Target};

// Batch engine
pub use engine::{BatchReport, Engine, RuleReport, RuleSource};

// Core types and errors
pub use error::{Diagnostic, DiagnosticKind, Result, TideError};
pub use ir::{Expr, Operator, Predicate, Value, WildString};
pub use rule::{Level, LogSource, RuleDocument, RuleStatus};

// Health and coverage
pub use coverage::{compute_coverage, CoverageResult, CoverageSnapshot, RuleCoverageRecord, Taxonomy};
pub use scoring::{score, Grade, HealthScore, RuleHealthMetrics, ScoredRule, ScoringConfig};
