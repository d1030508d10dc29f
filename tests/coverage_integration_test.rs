//! Integration tests for scoring and taxonomy coverage.

use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;
use std::io::Write;
use tide_engine::compiler::{FieldKind, LogSourceMatch};
use tide_engine::coverage::{
    actor_coverage, build_heatmap, load_actors, threat_landscape, CoverageStatus, ThreatActor,
};
use tide_engine::engine::RuleSource;
use tide_engine::{
    compute_coverage, score, Compiler, Engine, EngineConfig, FieldMappingPipeline, RuleCoverageRecord,
    ScoringConfig, Taxonomy,
};

const TAXONOMY: &str = r#"
tactics:
  - id: TA0002
    name: Execution
    techniques:
      - id: T1059
        name: Command and Scripting Interpreter
        subtechniques:
          - {id: T1059.001, name: PowerShell}
          - {id: T1059.003, name: Windows Command Shell}
      - id: T1204
        name: User Execution
  - id: TA0005
    name: Defense Evasion
    shortname: defense-evasion
    techniques:
      - id: T1055
        name: Process Injection
        subtechniques:
          - {id: T1055.001, name: Dynamic-link Library Injection}
  - id: TA0006
    name: Credential Access
    techniques:
      - id: T1003
        name: OS Credential Dumping
"#;

fn taxonomy() -> Taxonomy {
    Taxonomy::from_yaml(TAXONOMY).unwrap()
}

#[test]
fn test_scenario_a_bare_rule_scores_quality_only() {
    let pipeline = FieldMappingPipeline::new("ecs").with_entry(
        LogSourceMatch::default(),
        "EventID",
        "event.code",
        FieldKind::Keyword,
    );
    let compiled = Compiler::with_pipeline(pipeline)
        .compile_rule("title: A\nlogsource: {product: windows}\ndetection:\n    sel1: {EventID: 4688}\n    condition: sel1\n")
        .unwrap();

    let health = score(&compiled, Utc::now(), &ScoringConfig::default());
    assert_eq!(health.breakdown.mapping, 20.0);
    assert_eq!(health.meta, 0.0);
    assert_eq!(health.breakdown.missing_meta.len(), 5);
    assert!(health.total <= 50.0);
    assert_eq!(health.total, health.quality);
}

#[test]
fn test_scenario_b_subtechnique_is_independent() {
    let records = vec![RuleCoverageRecord::new("r1", ["T1055", "T1055.001"])];
    let result = compute_coverage(&taxonomy(), &records, None);
    assert!(result.is_covered("T1055"));
    assert!(result.is_covered("T1055.001"));

    let only_sub = vec![RuleCoverageRecord::new("r1", ["T1055.001"])];
    let result = compute_coverage(&taxonomy(), &only_sub, None);
    assert!(result.is_covered("T1055.001"));
    assert!(!result.is_covered("T1055"));
    assert_eq!(result.tactic("defense-evasion").unwrap().gaps, vec!["T1055".to_string()]);
}

#[test]
fn test_scenario_c_actor_coverage() {
    let actor = ["T1003", "T1059"].map(String::from).into_iter().collect();
    let covered = ["T1059"].map(String::from).into_iter().collect();
    assert_eq!(actor_coverage(&actor, &covered), Some(0.5));
    assert_eq!(actor_coverage(&Default::default(), &covered), None);
}

#[test]
fn test_taxonomy_counts() {
    let taxonomy = taxonomy();
    assert_eq!(taxonomy.technique_count(), 7);

    let result = compute_coverage(&taxonomy, &[RuleCoverageRecord::new("r", ["t1059.003"])], None);
    let execution = result.tactic("execution").unwrap();
    assert_eq!((execution.covered, execution.total), (1, 4));
    assert_eq!(execution.percentage, 25.0);
    assert_eq!(result.tactic("TA0006").unwrap().percentage, 0.0);
}

#[test]
fn test_coverage_monotonicity() {
    let taxonomy = taxonomy();
    let mut records = vec![
        RuleCoverageRecord::new("r1", ["T1059"]),
        RuleCoverageRecord::new("r2", ["T1059.001", "T1003"]).with_enabled(false),
        RuleCoverageRecord::new("r3", ["T1204", "T1059"]).with_enabled(false),
        RuleCoverageRecord::new("r4", ["T9999"]).with_enabled(false),
    ];

    for i in 1..records.len() {
        let before = compute_coverage(&taxonomy, &records, None);
        records[i].enabled = true;
        let after = compute_coverage(&taxonomy, &records, None);

        assert!(after.percentage >= before.percentage);
        for (b, a) in before.tactics.iter().zip(&after.tactics) {
            assert!(a.percentage >= b.percentage, "{} decreased", a.tactic_id);
        }
    }

    for i in 0..records.len() {
        let before = compute_coverage(&taxonomy, &records, None);
        records[i].enabled = false;
        let after = compute_coverage(&taxonomy, &records, None);
        assert!(after.percentage <= before.percentage);
        for (b, a) in before.tactics.iter().zip(&after.tactics) {
            assert!(a.percentage <= b.percentage, "{} increased", a.tactic_id);
        }
    }
    assert_eq!(compute_coverage(&taxonomy, &records, None).covered, 0);
}

#[test]
fn test_engine_snapshot_with_spaces() {
    let rule = |title: &str, tag: &str| {
        format!("title: {title}\ntags: [{tag}]\nlogsource: {{product: windows}}\ndetection: {{s: {{EventID: 1}}, condition: s}}")
    };
    let sources = vec![
        RuleSource::new(rule("a", "attack.t1059")),
        RuleSource::new(rule("b", "attack.t1003")).with_status(true, Some("soc".to_string())),
        RuleSource::new(rule("c", "attack.t1204")).with_status(false, None),
    ];

    let engine = Engine::new(EngineConfig::default(), FieldMappingPipeline::default());
    let report = engine.compile_sources(&sources, Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
    engine.publish_batch(taxonomy(), &report);

    let all = engine.coverage(None);
    assert_eq!(all.covered_techniques.iter().collect::<Vec<_>>(), vec!["T1003", "T1059"]);

    let soc = engine.coverage(Some("soc"));
    assert_eq!(soc.covered_techniques.iter().collect::<Vec<_>>(), vec!["T1003"]);

    assert_eq!(report.metrics.enabled_rules, 2);
    assert_eq!(report.metrics.disabled_rules, 1);
}

#[test]
fn test_actor_heatmap_and_landscape() {
    let actors = load_actors(
        r#"
- name: APT-A
  origin: north
  techniques: [T1059, T1003]
- name: APT-B
  techniques: [t1059, T1204]
- name: Dormant
  techniques: []
"#,
    )
    .unwrap();
    let covered = ["T1059", "T1055"].map(String::from).into_iter().collect();

    let heatmap = build_heatmap(&taxonomy(), &actors, &covered, true);
    assert_eq!(heatmap.covered_count, 1);
    assert_eq!(heatmap.gap_count, 2);
    assert_eq!(heatmap.defense_count, 1);
    assert_eq!(heatmap.coverage_pct, 33);

    let columns: Vec<_> = heatmap.columns.iter().map(|c| c.tactic.as_str()).collect();
    assert_eq!(columns, vec!["execution", "defense-evasion", "credential-access"]);
    let evasion = &heatmap.columns[1].cells[0];
    assert_eq!(evasion.status, CoverageStatus::Defense);

    let landscape = threat_landscape(&actors, &covered);
    assert_eq!(landscape.total_actors, 3);
    assert_eq!(landscape.unique_techniques, 3);
    assert_eq!(landscape.top_uncovered[0].actor_count, 1);
    assert_eq!(landscape.uncovered_actors, 1);
    assert_eq!(landscape.partially_covered_actors, 2);
    assert_eq!(landscape.origin_breakdown["unknown"], 2);

    let apt = ThreatActor::new("solo", ["T1059"]);
    assert_eq!(actor_coverage(&apt.technique_set(), &covered), Some(1.0));
}

#[test]
fn test_taxonomy_and_records_from_files() {
    let mut taxonomy_file = tempfile::NamedTempFile::new().unwrap();
    taxonomy_file.write_all(TAXONOMY.as_bytes()).unwrap();
    let mut records_file = tempfile::NamedTempFile::new().unwrap();
    write!(
        records_file,
        r#"[{{"rule_id": "a", "techniques": ["T1003"]}}, {{"rule_id": "b", "enabled": false, "techniques": ["T1204"]}}]"#
    )
    .unwrap();

    let taxonomy = Taxonomy::from_file(taxonomy_file.path()).unwrap();
    let records = RuleCoverageRecord::load_file(records_file.path()).unwrap();
    let result = compute_coverage(&taxonomy, &records, None);
    assert_eq!(result.covered, 1);
    assert_eq!(result.tactic("credential-access").unwrap().percentage, 100.0);
}

#[test]
fn test_invalid_taxonomy_is_rejected() {
    let foreign_child = "tactics:\n  - id: TA1\n    name: X\n    techniques:\n      - id: T1\n        subtechniques: [{id: T2.001, name: a}]\n";
    assert!(Taxonomy::from_yaml(foreign_child).is_err());

    let mut taxonomy = Taxonomy::new();
    taxonomy.add_tactic("TA1", "X", "x").unwrap();
    assert!(taxonomy.add_technique("T2", "b", &["TA9"]).is_err());
    assert!(taxonomy.add_subtechnique("T3.001", "c", "T3").is_err());
}
