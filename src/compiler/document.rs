//! YAML rule documents into the canonical [`RuleDocument`] model.
//!
//! Structural problems (missing keys, wrong shapes) are reported as
//! [`TideError::MissingField`] / [`TideError::InvalidValue`]; condition
//! problems come straight from the condition parser.

use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_yaml::{Mapping, Value};

use super::parser;
use crate::error::{Result, TideError};
use crate::rule::{
    Condition, Detection, DetectionItem, Level, LogSource, RuleDocument, RuleStatus, RuleValue,
    Selection,
};

static TECHNIQUE_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^attack\.t(\d+(?:\.\d+)?)$").expect("valid technique tag regex"));
static TACTIC_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^attack\.([a-z][a-z_-]+)$").expect("valid tactic tag regex"));

/// Parse a rule from YAML text.
///
/// # Examples
///
/// ```rust
/// use tide_engine::compiler::parse_rule;
///
/// let rule = parse_rule(r#"
/// title: Whoami Execution
/// logsource:
///     category: process_creation
///     product: windows
/// detection:
///     selection:
///         Image|endswith: '\whoami.exe'
///     condition: selection
/// tags:
///     - attack.discovery
///     - attack.t1033
/// "#)?;
///
/// assert_eq!(rule.id, "whoami-execution");
/// assert_eq!(rule.techniques, vec!["T1033"]);
/// assert_eq!(rule.tactics, vec!["discovery"]);
/// # Ok::<(), tide_engine::TideError>(())
/// ```
pub fn parse_rule(yaml: &str) -> Result<RuleDocument> {
    let doc: Value = serde_yaml::from_str(yaml)?;
    parse_rule_value(&doc)
}

/// Parse a rule from an already-loaded YAML value.
pub fn parse_rule_value(doc: &Value) -> Result<RuleDocument> {
    let map = doc
        .as_mapping()
        .ok_or_else(|| TideError::invalid("document", "expected a mapping at the top level"))?;

    let title = optional_string(map, "title")?
        .ok_or_else(|| TideError::MissingField("title".to_string()))?;

    let id = match optional_string(map, "id")? {
        Some(id) => id,
        None => slugify(&title),
    };

    let status = match optional_string(map, "status")? {
        Some(s) => RuleStatus::parse(&s)
            .ok_or_else(|| TideError::invalid("status", format!("unknown status '{s}'")))?,
        None => RuleStatus::default(),
    };

    let level = match optional_string(map, "level")? {
        Some(s) => {
            Level::parse(&s).ok_or_else(|| TideError::invalid("level", format!("unknown level '{s}'")))?
        }
        None => Level::default(),
    };

    let logsource = parse_logsource(
        map.get("logsource")
            .ok_or_else(|| TideError::MissingField("logsource".to_string()))?,
    )?;

    let detection = parse_detection(
        map.get("detection")
            .ok_or_else(|| TideError::MissingField("detection".to_string()))?,
    )?;

    let tags = string_list(map, "tags")?;
    let (techniques, tactics) = classify_tags(&tags);

    Ok(RuleDocument {
        id,
        title,
        status,
        level,
        logsource,
        detection,
        description: optional_string(map, "description")?,
        references: string_list(map, "references")?,
        false_positives: string_list(map, "falsepositives")?,
        note: optional_string(map, "note")?,
        author: optional_string(map, "author")?,
        tags,
        techniques,
        tactics,
        fields: string_list(map, "fields")?,
        timestamp_override: optional_string(map, "timestamp_override")?,
    })
}

/// Lower-case slug used as the stable id of rules without one.
pub(crate) fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    for c in title.chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

fn classify_tags(tags: &[String]) -> (Vec<String>, Vec<String>) {
    let mut techniques = Vec::new();
    let mut tactics = Vec::new();

    for tag in tags {
        let tag = tag.trim();
        if let Some(caps) = TECHNIQUE_TAG.captures(tag) {
            let id = format!("T{}", &caps[1]);
            if !techniques.contains(&id) {
                techniques.push(id);
            }
        } else if let Some(caps) = TACTIC_TAG.captures(tag) {
            let slug = caps[1].to_ascii_lowercase().replace('_', "-");
            if !tactics.contains(&slug) {
                tactics.push(slug);
            }
        }
    }

    (techniques, tactics)
}

fn optional_string(map: &Mapping, key: &str) -> Result<Option<String>> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
        }
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err(TideError::invalid(key, "expected a string")),
    }
}

fn string_list(map: &Mapping, key: &str) -> Result<Vec<String>> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s.clone()]),
        Some(Value::Sequence(seq)) => seq
            .iter()
            .map(|v| match v {
                Value::String(s) => Ok(s.clone()),
                Value::Number(n) => Ok(n.to_string()),
                _ => Err(TideError::invalid(key, "expected a list of strings")),
            })
            .collect(),
        Some(_) => Err(TideError::invalid(key, "expected a list of strings")),
    }
}

fn parse_logsource(value: &Value) -> Result<LogSource> {
    let map = value
        .as_mapping()
        .ok_or_else(|| TideError::invalid("logsource", "expected a mapping"))?;
    let product = optional_string(map, "product")?;
    let category = optional_string(map, "category")?;
    let service = optional_string(map, "service")?;
    Ok(LogSource {
        product,
        category,
        service,
    })
}

fn parse_detection(value: &Value) -> Result<Detection> {
    let map = value
        .as_mapping()
        .ok_or_else(|| TideError::invalid("detection", "expected a mapping"))?;

    let mut selections = BTreeMap::new();
    let mut condition_value = None;
    let mut timeframe = None;

    for (key, value) in map {
        let key = key
            .as_str()
            .ok_or_else(|| TideError::invalid("detection", "selection names must be strings"))?;
        match key {
            "condition" => condition_value = Some(value),
            "timeframe" => timeframe = value.as_str().map(str::to_string),
            name => {
                selections.insert(name.to_string(), parse_selection(name, value)?);
            }
        }
    }

    let sources: Vec<String> = match condition_value {
        None | Some(Value::Null) => {
            return Err(TideError::MissingField("detection.condition".to_string()))
        }
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Sequence(seq)) => seq
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| TideError::invalid("condition", "expected a list of strings"))
            })
            .collect::<Result<_>>()?,
        Some(_) => return Err(TideError::invalid("condition", "expected a string")),
    };
    if sources.is_empty() {
        return Err(TideError::MissingField("detection.condition".to_string()));
    }

    let names: BTreeSet<String> = selections.keys().cloned().collect();
    let conditions = sources
        .into_iter()
        .map(|source| {
            let (ast, aggregation) = parser::parse_condition(&source, &names)?;
            Ok(Condition {
                source,
                ast,
                aggregation,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Detection {
        selections,
        conditions,
        timeframe,
    })
}

fn parse_selection(name: &str, value: &Value) -> Result<Selection> {
    match value {
        Value::Mapping(map) => {
            let items = parse_items(name, map)?;
            Ok(Selection::Fields(items))
        }
        Value::Sequence(seq) if seq.is_empty() => {
            Err(TideError::invalid(name, "selection must not be empty"))
        }
        Value::Sequence(seq) if seq.iter().all(Value::is_mapping) => {
            let groups = seq
                .iter()
                .filter_map(Value::as_mapping)
                .map(|map| parse_items(name, map))
                .collect::<Result<Vec<_>>>()?;
            Ok(Selection::AnyOf(groups))
        }
        Value::Sequence(seq) => {
            let keywords = seq
                .iter()
                .map(|v| scalar(name, v))
                .collect::<Result<Vec<_>>>()?;
            Ok(Selection::Keywords(keywords))
        }
        Value::String(_) | Value::Number(_) => Ok(Selection::Keywords(vec![scalar(name, value)?])),
        _ => Err(TideError::invalid(name, "unsupported selection shape")),
    }
}

fn parse_items(name: &str, map: &Mapping) -> Result<Vec<DetectionItem>> {
    if map.is_empty() {
        return Err(TideError::invalid(name, "selection must not be empty"));
    }

    map.iter()
        .map(|(key, value)| {
            let key = key
                .as_str()
                .ok_or_else(|| TideError::invalid(name, "field names must be strings"))?;
            let values = match value {
                Value::Sequence(seq) => {
                    if seq.is_empty() {
                        return Err(TideError::invalid(key, "value list must not be empty"));
                    }
                    seq.iter().map(|v| scalar(key, v)).collect::<Result<Vec<_>>>()?
                }
                other => vec![scalar(key, other)?],
            };
            Ok(DetectionItem::from_key(key, values))
        })
        .collect()
}

fn scalar(context: &str, value: &Value) -> Result<RuleValue> {
    match value {
        Value::String(s) => Ok(RuleValue::String(s.clone())),
        Value::Bool(b) => Ok(RuleValue::Bool(*b)),
        Value::Null => Ok(RuleValue::Null),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(RuleValue::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(RuleValue::Float(f))
            } else {
                Err(TideError::invalid(context, "invalid number format"))
            }
        }
        _ => Err(TideError::invalid(context, "expected a scalar value")),
    }
}
