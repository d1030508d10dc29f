use std::path::{Path, PathBuf};
use std::process;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use tide_engine::coverage::{build_heatmap, load_actors_file, threat_landscape, RuleCoverageRecord, Taxonomy};
use tide_engine::{CoverageSnapshot, Engine, EngineConfig, FieldMappingPipeline, RuleSource, Target};

#[derive(Parser)]
#[command(
    name = "tide",
    about = "Detection rule compiler and coverage calculator",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile rules to target query languages and score them
    Compile {
        /// Rule files or directories of *.yml / *.yaml rules
        #[arg(required = true)]
        rules: Vec<PathBuf>,

        /// Engine config file
        #[arg(long, short = 'c', env = "TIDE_CONFIG")]
        config: Option<PathBuf>,

        /// Field mapping pipeline files, merged in order
        #[arg(long, short = 'p')]
        pipeline: Vec<PathBuf>,

        /// Restrict output to these targets (lucene, splunk, eql, esql)
        #[arg(long, short = 't')]
        target: Vec<String>,

        /// Exit with status 1 when any rule fails to compile
        #[arg(long)]
        strict: bool,
    },

    /// Compute taxonomy coverage for a rule set
    Coverage {
        /// Taxonomy file (YAML or JSON)
        #[arg(long)]
        taxonomy: PathBuf,

        /// Coverage records file (YAML or JSON)
        #[arg(long)]
        rules: Option<PathBuf>,

        /// Rule documents or directories; their technique tags are added as records
        documents: Vec<PathBuf>,

        /// Threat actor file for heatmap and landscape output
        #[arg(long)]
        actors: Option<PathBuf>,

        /// Only count rules in this space
        #[arg(long)]
        space: Option<String>,

        /// Include covered techniques no actor uses in the heatmap
        #[arg(long)]
        show_defense: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Compile {
            rules,
            config,
            pipeline,
            target,
            strict,
        } => cmd_compile(&rules, config.as_deref(), &pipeline, &target, strict),
        Commands::Coverage {
            taxonomy,
            rules,
            documents,
            actors,
            space,
            show_defense,
        } => cmd_coverage(
            &taxonomy,
            rules.as_deref(),
            &documents,
            actors.as_deref(),
            space.as_deref(),
            show_defense,
        ),
    };

    match result {
        Ok(exit_code) => process::exit(exit_code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            process::exit(2);
        }
    }
}

/// Expand directories into their rule files, sorted for stable output.
fn rule_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut found = Vec::new();
            for ext in ["yml", "yaml"] {
                let pattern = path.join("**").join(format!("*.{ext}"));
                let pattern = pattern.to_string_lossy();
                for entry in glob::glob(&pattern).with_context(|| format!("bad rule path {}", path.display()))? {
                    found.push(entry?);
                }
            }
            found.sort();
            files.extend(found);
        } else {
            files.push(path.clone());
        }
    }
    Ok(files)
}

fn load_sources(paths: &[PathBuf]) -> Result<Vec<RuleSource>> {
    rule_files(paths)?
        .into_iter()
        .map(|file| {
            debug!(file = %file.display(), "reading rule");
            std::fs::read_to_string(&file)
                .map(RuleSource::new)
                .with_context(|| format!("failed to read {}", file.display()))
        })
        .collect()
}

fn build_engine(config: Option<&Path>, pipelines: &[PathBuf], targets: &[String]) -> Result<Engine> {
    let mut config = match config {
        Some(path) => EngineConfig::from_file(path).with_context(|| format!("failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if !targets.is_empty() {
        let targets = targets
            .iter()
            .map(|t| t.parse::<Target>())
            .collect::<Result<Vec<_>, _>>()?;
        config = config.with_targets(targets);
    }

    let pipelines = pipelines
        .iter()
        .map(|path| {
            FieldMappingPipeline::from_file(path).with_context(|| format!("failed to load pipeline {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Engine::new(config, FieldMappingPipeline::merge(pipelines)))
}

fn cmd_compile(
    rules: &[PathBuf],
    config: Option<&Path>,
    pipelines: &[PathBuf],
    targets: &[String],
    strict: bool,
) -> Result<i32> {
    let engine = build_engine(config, pipelines, targets)?;
    let sources = load_sources(rules)?;
    if sources.is_empty() {
        bail!("no rule files found");
    }

    let report = engine.compile_sources(&sources, chrono::Utc::now());
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(if strict && report.failed_count() > 0 { 1 } else { 0 })
}

fn cmd_coverage(
    taxonomy: &Path,
    records: Option<&Path>,
    documents: &[PathBuf],
    actors: Option<&Path>,
    space: Option<&str>,
    show_defense: bool,
) -> Result<i32> {
    let taxonomy =
        Taxonomy::from_file(taxonomy).with_context(|| format!("failed to load taxonomy {}", taxonomy.display()))?;

    let mut all_records = match records {
        Some(path) => {
            RuleCoverageRecord::load_file(path).with_context(|| format!("failed to load records {}", path.display()))?
        }
        None => Vec::new(),
    };
    let engine = Engine::default();
    if !documents.is_empty() {
        let report = engine.compile_sources(&load_sources(documents)?, chrono::Utc::now());
        all_records.extend(report.coverage_records());
    }
    info!(records = all_records.len(), "computing coverage");

    engine.publish_snapshot(CoverageSnapshot::new(taxonomy, all_records));
    let snapshot = engine.snapshot();
    let coverage = snapshot.compute(space);

    let output = match actors {
        Some(path) => {
            let actors =
                load_actors_file(path).with_context(|| format!("failed to load actors {}", path.display()))?;
            let heatmap = build_heatmap(&snapshot.taxonomy, &actors, &coverage.covered_techniques, show_defense);
            let landscape = threat_landscape(&actors, &coverage.covered_techniques);
            json!({ "coverage": coverage, "heatmap": heatmap, "landscape": landscape })
        }
        None => json!({ "coverage": coverage }),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(0)
}
