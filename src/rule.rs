//! Canonical rule model produced by the rule parser.
//!
//! A [`RuleDocument`] is the validated, loosely-typed view of a detection rule:
//! selections still carry raw modifier strings and scalar values. The
//! compiler turns it into the closed [`Expr`](crate::ir::Expr) tree.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::compiler::parser::{AggregationClause, ConditionAst};

/// Lifecycle status of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    #[default]
    Experimental,
    Stable,
    Deprecated,
}

impl RuleStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "experimental" | "test" => Some(RuleStatus::Experimental),
            "stable" => Some(RuleStatus::Stable),
            "deprecated" | "unsupported" => Some(RuleStatus::Deprecated),
            _ => None,
        }
    }
}

/// Severity level of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Informational,
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Level {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "informational" | "info" => Some(Level::Informational),
            "low" => Some(Level::Low),
            "medium" => Some(Level::Medium),
            "high" => Some(Level::High),
            "critical" => Some(Level::Critical),
            _ => None,
        }
    }

    /// Risk score used when the rule is promoted to a SIEM.
    pub fn risk_score(self) -> u8 {
        match self {
            Level::Critical => 99,
            Level::High => 73,
            Level::Medium => 47,
            Level::Low | Level::Informational => 21,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Informational => "informational",
            Level::Low => "low",
            Level::Medium => "medium",
            Level::High => "high",
            Level::Critical => "critical",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Product/category/service triple describing where events come from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize)]
pub struct LogSource {
    pub product: Option<String>,
    pub category: Option<String>,
    pub service: Option<String>,
}

impl LogSource {
    pub fn new(product: Option<&str>, category: Option<&str>, service: Option<&str>) -> Self {
        Self {
            product: product.map(str::to_string),
            category: category.map(str::to_string),
            service: service.map(str::to_string),
        }
    }
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let part = |p: &Option<String>| p.clone().unwrap_or_else(|| "*".to_string());
        write!(
            f,
            "{}/{}/{}",
            part(&self.product),
            part(&self.category),
            part(&self.service)
        )
    }
}

/// A scalar value as written in the rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RuleValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl RuleValue {
    /// Textual form used by encoding modifiers.
    pub fn as_text(&self) -> Option<String> {
        match self {
            RuleValue::String(s) => Some(s.clone()),
            RuleValue::Int(i) => Some(i.to_string()),
            RuleValue::Float(f) => Some(f.to_string()),
            RuleValue::Bool(b) => Some(b.to_string()),
            RuleValue::Null => None,
        }
    }
}

/// One `field|modifier|...: value(s)` entry of a selection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionItem {
    pub field: String,
    pub modifiers: Vec<String>,
    pub values: Vec<RuleValue>,
}

impl DetectionItem {
    /// Split a selection key such as `CommandLine|contains|all`.
    pub fn from_key(key: &str, values: Vec<RuleValue>) -> Self {
        let mut parts = key.split('|');
        let field = parts.next().unwrap_or_default().trim().to_string();
        let modifiers = parts.map(|m| m.trim().to_string()).collect();
        Self {
            field,
            modifiers,
            values,
        }
    }
}

/// A named selection in its original shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Selection {
    /// A single mapping: items are AND-combined.
    Fields(Vec<DetectionItem>),
    /// A list of mappings: each group is AND-combined, groups are OR-combined.
    AnyOf(Vec<Vec<DetectionItem>>),
    /// A list of bare search terms, OR-combined.
    Keywords(Vec<RuleValue>),
}

impl Selection {
    pub fn items(&self) -> Vec<&DetectionItem> {
        match self {
            Selection::Fields(items) => items.iter().collect(),
            Selection::AnyOf(groups) => groups.iter().flatten().collect(),
            Selection::Keywords(_) => Vec::new(),
        }
    }
}

/// One condition expression of the detection block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Condition {
    pub source: String,
    #[serde(skip)]
    pub ast: ConditionAst,
    #[serde(skip)]
    pub aggregation: Option<AggregationClause>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub selections: BTreeMap<String, Selection>,
    pub conditions: Vec<Condition>,
    pub timeframe: Option<String>,
}

/// Canonical detection rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleDocument {
    pub id: String,
    pub title: String,
    pub status: RuleStatus,
    pub level: Level,
    pub logsource: LogSource,
    pub detection: Detection,
    pub description: Option<String>,
    pub references: Vec<String>,
    pub false_positives: Vec<String>,
    /// Investigation guide.
    pub note: Option<String>,
    pub author: Option<String>,
    pub tags: Vec<String>,
    /// Claimed ATT&CK technique ids, normalised to `T1234[.001]`.
    pub techniques: Vec<String>,
    /// ATT&CK tactic slugs from `attack.<tactic>` tags.
    pub tactics: Vec<String>,
    /// Output (highlighted) fields.
    pub fields: Vec<String>,
    pub timestamp_override: Option<String>,
}

impl RuleDocument {
    /// Every generic field name referenced by selections and aggregations.
    pub fn referenced_fields(&self) -> BTreeSet<String> {
        let mut fields: BTreeSet<String> = self
            .detection
            .selections
            .values()
            .flat_map(|s| s.items())
            .map(|item| item.field.clone())
            .filter(|f| !f.is_empty())
            .collect();

        for condition in &self.detection.conditions {
            if let Some(aggregation) = &condition.aggregation {
                fields.extend(aggregation.fields());
            }
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_aliases() {
        assert_eq!(RuleStatus::parse("test"), Some(RuleStatus::Experimental));
        assert_eq!(RuleStatus::parse("Stable"), Some(RuleStatus::Stable));
        assert_eq!(RuleStatus::parse("unsupported"), Some(RuleStatus::Deprecated));
        assert_eq!(RuleStatus::parse("bogus"), None);
    }

    #[test]
    fn test_level_risk_score() {
        assert_eq!(Level::Critical.risk_score(), 99);
        assert_eq!(Level::High.risk_score(), 73);
        assert_eq!(Level::Medium.risk_score(), 47);
        assert_eq!(Level::Informational.risk_score(), 21);
        assert!(Level::High > Level::Low);
    }

    #[test]
    fn test_detection_item_from_key() {
        let item = DetectionItem::from_key(
            "CommandLine|contains|all",
            vec![RuleValue::String("a".to_string())],
        );
        assert_eq!(item.field, "CommandLine");
        assert_eq!(item.modifiers, vec!["contains", "all"]);

        let bare = DetectionItem::from_key("EventID", vec![RuleValue::Int(1)]);
        assert!(bare.modifiers.is_empty());
    }

    #[test]
    fn test_logsource_display() {
        let source = LogSource::new(Some("windows"), Some("process_creation"), None);
        assert_eq!(source.to_string(), "windows/process_creation/*");
    }
}
