//! Field mapping pipelines for rewriting generic field names.
//!
//! This module provides the [`FieldMappingPipeline`] which rewrites the generic
//! field names a rule uses (`Image`, `CommandLine`) into the names and types
//! of a concrete log schema, selected by the rule's log source.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TideError};
use crate::rule::{LogSource, RuleDocument};

/// Storage type of a target field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    #[default]
    Keyword,
    Text,
    Date,
    Numeric,
}

impl FieldKind {
    /// Fitness weight of the type for exact and wildcard matching.
    pub fn weight(self) -> f64 {
        match self {
            FieldKind::Keyword => 1.0,
            FieldKind::Date => 0.8,
            FieldKind::Text | FieldKind::Numeric => 0.5,
        }
    }
}

/// Log-source constraint of a mapping entry. Absent attributes match anything.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSourceMatch {
    pub product: Option<String>,
    pub category: Option<String>,
    pub service: Option<String>,
}

impl LogSourceMatch {
    /// Number of constrained attributes if every one of them matches.
    pub fn specificity(&self, source: &LogSource) -> Option<u8> {
        let mut score = 0;
        for (want, have) in [
            (&self.product, &source.product),
            (&self.category, &source.category),
            (&self.service, &source.service),
        ] {
            if let Some(want) = want {
                match have {
                    Some(have) if have.eq_ignore_ascii_case(want) => score += 1,
                    _ => return None,
                }
            }
        }
        Some(score)
    }
}

/// One rewrite rule: `(log source, generic field) -> (target field, kind)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingEntry {
    #[serde(default)]
    pub logsource: LogSourceMatch,
    pub field: String,
    pub target: String,
    #[serde(default)]
    pub kind: FieldKind,
}

/// Ordered list of mapping entries.
///
/// # Examples
///
/// ```rust
/// use tide_engine::compiler::{FieldKind, FieldMappingPipeline};
/// use tide_engine::LogSource;
///
/// let pipeline = FieldMappingPipeline::from_yaml(r#"
/// name: ecs
/// entries:
///   - logsource: {product: windows}
///     field: Image
///     target: process.executable
///   - field: CommandLine
///     target: process.command_line
///     kind: text
/// "#)?;
///
/// let source = LogSource::new(Some("windows"), Some("process_creation"), None);
/// let fields = ["Image", "CommandLine", "User"].map(String::from);
/// let resolved = pipeline.resolve_fields(fields.iter(), &source);
///
/// assert_eq!(resolved.target_name("Image"), "process.executable");
/// assert_eq!(resolved.get("CommandLine").and_then(|f| f.kind), Some(FieldKind::Text));
/// assert_eq!(resolved.unmapped(), vec!["User"]);
/// # Ok::<(), tide_engine::TideError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FieldMappingPipeline {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub entries: Vec<MappingEntry>,
}

impl FieldMappingPipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            entries: Vec::new(),
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let pipeline: FieldMappingPipeline = serde_yaml::from_str(yaml)?;
        for entry in &pipeline.entries {
            if entry.field.trim().is_empty() || entry.target.trim().is_empty() {
                return Err(TideError::Config(format!(
                    "pipeline '{}' has an entry without field or target",
                    pipeline.name
                )));
            }
        }
        Ok(pipeline)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Flatten several pipelines by ascending priority, keeping load order
    /// between equal priorities.
    pub fn merge(mut pipelines: Vec<FieldMappingPipeline>) -> Self {
        pipelines.sort_by_key(|p| p.priority);
        let name = pipelines
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>()
            .join("+");
        let entries = pipelines.into_iter().flat_map(|p| p.entries).collect();
        Self {
            name,
            priority: 0,
            entries,
        }
    }

    /// Append an entry, builder style.
    pub fn with_entry(
        mut self,
        logsource: LogSourceMatch,
        field: &str,
        target: &str,
        kind: FieldKind,
    ) -> Self {
        self.entries.push(MappingEntry {
            logsource,
            field: field.to_string(),
            target: target.to_string(),
            kind,
        });
        self
    }

    /// Resolve every field referenced by `document` for `logsource`.
    pub fn resolve(&self, document: &RuleDocument, logsource: &LogSource) -> ResolvedFieldSet {
        let fields = document.referenced_fields();
        self.resolve_fields(fields.iter(), logsource)
    }

    /// Resolve an arbitrary set of generic field names.
    ///
    /// The most specific matching entry wins; among equally specific entries
    /// the first in pipeline order wins.
    pub fn resolve_fields<'a>(
        &self,
        fields: impl IntoIterator<Item = &'a String>,
        logsource: &LogSource,
    ) -> ResolvedFieldSet {
        let mut resolved = BTreeMap::new();

        for field in fields {
            let mut best: Option<(u8, &MappingEntry)> = None;
            for entry in self.entries.iter().filter(|e| &e.field == field) {
                if let Some(score) = entry.logsource.specificity(logsource) {
                    if best.map_or(true, |(s, _)| score > s) {
                        best = Some((score, entry));
                    }
                }
            }

            let resolved_field = match best {
                Some((_, entry)) => ResolvedField {
                    target: entry.target.clone(),
                    kind: Some(entry.kind),
                    unmapped: false,
                },
                None => ResolvedField {
                    target: field.clone(),
                    kind: None,
                    unmapped: true,
                },
            };
            resolved.insert(field.clone(), resolved_field);
        }

        ResolvedFieldSet { fields: resolved }
    }
}

/// Outcome of resolving one generic field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedField {
    pub target: String,
    /// `None` when the field is unmapped.
    pub kind: Option<FieldKind>,
    pub unmapped: bool,
}

/// Resolved names and kinds for all fields of one rule.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ResolvedFieldSet {
    pub fields: BTreeMap<String, ResolvedField>,
}

impl ResolvedFieldSet {
    pub fn get(&self, field: &str) -> Option<&ResolvedField> {
        self.fields.get(field)
    }

    /// Target name for `field`, or the field itself if it was never resolved.
    pub fn target_name<'a>(&'a self, field: &'a str) -> &'a str {
        self.fields
            .get(field)
            .map(|f| f.target.as_str())
            .unwrap_or(field)
    }

    /// Kind of a field by its target name.
    pub fn kind_of_target(&self, target: &str) -> Option<FieldKind> {
        self.fields
            .values()
            .find(|f| f.target == target)
            .and_then(|f| f.kind)
    }

    pub fn unmapped(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(_, f)| f.unmapped)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn mapped_count(&self) -> usize {
        self.fields.values().filter(|f| !f.unmapped).count()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn windows_process() -> LogSource {
        LogSource::new(Some("windows"), Some("process_creation"), None)
    }

    fn constraint(product: Option<&str>, category: Option<&str>) -> LogSourceMatch {
        LogSourceMatch {
            product: product.map(str::to_string),
            category: category.map(str::to_string),
            service: None,
        }
    }

    #[test]
    fn test_specificity() {
        let source = windows_process();
        assert_eq!(LogSourceMatch::default().specificity(&source), Some(0));
        assert_eq!(constraint(Some("windows"), None).specificity(&source), Some(1));
        assert_eq!(
            constraint(Some("Windows"), Some("process_creation")).specificity(&source),
            Some(2)
        );
        assert_eq!(constraint(Some("linux"), None).specificity(&source), None);

        let with_service = LogSourceMatch {
            service: Some("sysmon".to_string()),
            ..Default::default()
        };
        assert_eq!(with_service.specificity(&source), None);
    }

    #[test]
    fn test_most_specific_entry_wins() {
        let pipeline = FieldMappingPipeline::new("test")
            .with_entry(LogSourceMatch::default(), "Image", "generic.image", FieldKind::Keyword)
            .with_entry(
                constraint(Some("windows"), Some("process_creation")),
                "Image",
                "process.executable",
                FieldKind::Keyword,
            )
            .with_entry(constraint(Some("windows"), None), "Image", "winlog.image", FieldKind::Text);

        let fields = vec!["Image".to_string()];
        let resolved = pipeline.resolve_fields(fields.iter(), &windows_process());
        assert_eq!(resolved.target_name("Image"), "process.executable");

        let linux = LogSource::new(Some("linux"), None, None);
        let resolved = pipeline.resolve_fields(fields.iter(), &linux);
        assert_eq!(resolved.target_name("Image"), "generic.image");
    }

    #[test]
    fn test_first_match_wins_on_tie() {
        let pipeline = FieldMappingPipeline::new("test")
            .with_entry(LogSourceMatch::default(), "User", "user.name", FieldKind::Keyword)
            .with_entry(LogSourceMatch::default(), "User", "winlog.user", FieldKind::Keyword);

        let fields = vec!["User".to_string()];
        let resolved = pipeline.resolve_fields(fields.iter(), &windows_process());
        assert_eq!(resolved.target_name("User"), "user.name");
    }

    #[test]
    fn test_unmapped_fields_pass_through() {
        let pipeline = FieldMappingPipeline::new("empty");
        let fields = vec!["EventID".to_string()];
        let resolved = pipeline.resolve_fields(fields.iter(), &windows_process());

        let field = resolved.get("EventID").unwrap();
        assert!(field.unmapped);
        assert_eq!(field.target, "EventID");
        assert_eq!(resolved.unmapped(), vec!["EventID"]);
        assert_eq!(resolved.mapped_count(), 0);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let pipeline = FieldMappingPipeline::new("p")
            .with_entry(LogSourceMatch::default(), "b", "B", FieldKind::Text)
            .with_entry(LogSourceMatch::default(), "a", "A", FieldKind::Keyword);
        let fields = vec!["b".to_string(), "a".to_string(), "c".to_string()];

        let first = pipeline.resolve_fields(fields.iter(), &windows_process());
        let second = pipeline.resolve_fields(fields.iter().rev(), &windows_process());
        assert_eq!(first, second);
        assert_eq!(first.kind_of_target("B"), Some(FieldKind::Text));
    }

    #[test]
    fn test_merge_orders_by_priority() {
        let low = FieldMappingPipeline {
            name: "low".to_string(),
            priority: 10,
            entries: vec![MappingEntry {
                logsource: LogSourceMatch::default(),
                field: "User".to_string(),
                target: "low.user".to_string(),
                kind: FieldKind::Keyword,
            }],
        };
        let high = FieldMappingPipeline {
            name: "high".to_string(),
            priority: 1,
            entries: vec![MappingEntry {
                logsource: LogSourceMatch::default(),
                field: "User".to_string(),
                target: "high.user".to_string(),
                kind: FieldKind::Keyword,
            }],
        };

        let merged = FieldMappingPipeline::merge(vec![low, high]);
        assert_eq!(merged.name, "high+low");
        let fields = vec!["User".to_string()];
        let resolved = merged.resolve_fields(fields.iter(), &windows_process());
        assert_eq!(resolved.target_name("User"), "high.user");
    }

    #[test]
    fn test_from_yaml_rejects_incomplete_entries() {
        let result = FieldMappingPipeline::from_yaml("name: bad\nentries:\n  - field: User\n    target: ''\n");
        assert!(matches!(result, Err(TideError::Config(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "name: sysmon\npriority: 5\nentries:\n  - logsource: {{service: sysmon}}\n    field: EventID\n    target: event.code\n    kind: numeric"
        )
        .unwrap();

        let pipeline = FieldMappingPipeline::from_file(file.path()).unwrap();
        assert_eq!(pipeline.priority, 5);
        assert_eq!(pipeline.entries[0].kind, FieldKind::Numeric);
        assert_eq!(
            pipeline.entries[0].logsource.service.as_deref(),
            Some("sysmon")
        );
    }
}
