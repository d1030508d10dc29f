//! Reference evaluator for the expression IR.
//!
//! Evaluates an [`Expr`] directly against JSON events. Emitted queries are
//! checked against it: an emitted query and the IR it came from must agree
//! on every sample event.
//!
//! Field lookup tries the literal key first (`"process.name": ...`), then a
//! dotted path through nested objects. Arrays match when any element does.
//! A `null` value is treated as absent.

use regex::{Regex, RegexBuilder};
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet};

use crate::emit::{is_exists, shape};
use crate::error::{Result, TideError};
use crate::ir::{Aggregation, AggregationFunction, Comparator, Expr, Operator, Predicate, StrPart, Value, WildString};

/// Evaluate a boolean expression against one event.
///
/// Aggregations need a window of events; use [`evaluate_window`].
///
/// # Examples
///
/// ```rust
/// use serde_json::json;
/// use tide_engine::eval::matches;
/// use tide_engine::ir::{Expr, Operator, Predicate, Value};
///
/// let expr = Expr::Predicate(Predicate::new("EventID", Operator::Equals, vec![Value::Int(4688)]));
/// assert!(matches(&expr, &json!({"EventID": 4688}))?);
/// assert!(matches(&expr, &json!({"EventID": "4688"}))?);
/// assert!(!matches(&expr, &json!({"EventID": 1}))?);
/// # Ok::<(), tide_engine::TideError>(())
/// ```
pub fn matches(expr: &Expr, event: &Json) -> Result<bool> {
    match expr {
        Expr::Predicate(predicate) => predicate_matches(predicate, event),
        Expr::And(children) => {
            for child in children {
                if !matches(child, event)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Expr::Or(children) => {
            for child in children {
                if matches(child, event)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Expr::Not(child) => Ok(!matches(child, event)?),
        Expr::Aggregation(_) => Err(TideError::unsupported("aggregation", "eval")),
    }
}

/// Evaluate an expression over a window of events.
///
/// A plain boolean expression fires when any event matches. An aggregation
/// fires when any group of matching events satisfies the threshold. The
/// whole slice is one time window.
pub fn evaluate_window(expr: &Expr, events: &[Json]) -> Result<bool> {
    match expr {
        Expr::Aggregation(aggregation) => aggregation_fires(aggregation, events),
        other => {
            for event in events {
                if matches(other, event)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

fn aggregation_fires(aggregation: &Aggregation, events: &[Json]) -> Result<bool> {
    let mut groups: BTreeMap<Vec<String>, Vec<&Json>> = BTreeMap::new();
    for event in events {
        if matches(&aggregation.inner, event)? {
            let key = aggregation
                .group_by
                .iter()
                .map(|field| lookup(event, field).map(render).unwrap_or_default())
                .collect();
            groups.entry(key).or_default().push(event);
        }
    }

    let threshold = aggregation.threshold as f64;
    Ok(groups.values().any(|group| {
        aggregate(&aggregation.function, group)
            .map(|value| aggregation.comparator.compare(value, threshold))
            .unwrap_or(false)
    }))
}

fn aggregate(function: &AggregationFunction, group: &[&Json]) -> Option<f64> {
    let numbers = |field: &str| -> Vec<f64> {
        group
            .iter()
            .filter_map(|event| lookup(event, field))
            .filter_map(as_number)
            .collect()
    };

    match function {
        AggregationFunction::Count(None) => Some(group.len() as f64),
        AggregationFunction::Count(Some(field)) => {
            let distinct: BTreeSet<String> = group
                .iter()
                .filter_map(|event| lookup(event, field))
                .map(render)
                .collect();
            Some(distinct.len() as f64)
        }
        AggregationFunction::Min(field) => numbers(field).into_iter().reduce(f64::min),
        AggregationFunction::Max(field) => numbers(field).into_iter().reduce(f64::max),
        AggregationFunction::Sum(field) => {
            let values = numbers(field);
            (!values.is_empty()).then(|| values.iter().sum())
        }
        AggregationFunction::Avg(field) => {
            let values = numbers(field);
            (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
        }
    }
}

fn predicate_matches(predicate: &Predicate, event: &Json) -> Result<bool> {
    let matched = match &predicate.field {
        None => {
            let mut found = false;
            for value in &predicate.values {
                let pattern = value_regex(value, Operator::Contains, predicate.case_sensitive)?;
                if any_string(event, &|s| pattern.is_match(s)) {
                    found = true;
                    break;
                }
            }
            found
        }
        Some(field) => match lookup(event, field) {
            None => false,
            Some(_) if is_exists(predicate) => true,
            Some(actual) => field_matches(predicate, actual)?,
        },
    };
    Ok(matched != predicate.negate)
}

fn field_matches(predicate: &Predicate, actual: &Json) -> Result<bool> {
    if let Json::Array(items) = actual {
        for item in items {
            if field_matches(predicate, item)? {
                return Ok(true);
            }
        }
        return Ok(false);
    }

    match predicate.operator {
        Operator::Range(comparator) => {
            let bound = predicate
                .values
                .first()
                .and_then(Value::as_number)
                .ok_or_else(|| TideError::invalid("range", "range bound must be numeric"))?;
            Ok(as_number(actual).is_some_and(|n| comparator.compare(n, bound)))
        }
        Operator::InList => {
            for value in &predicate.values {
                if value_matches(value, Operator::Equals, predicate.case_sensitive, actual)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        operator => {
            for value in &predicate.values {
                if value_matches(value, operator, predicate.case_sensitive, actual)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

fn value_matches(expected: &Value, operator: Operator, case_sensitive: bool, actual: &Json) -> Result<bool> {
    match expected {
        Value::Int(_) | Value::Float(_) if operator == Operator::Equals => {
            let expected = expected.as_number().unwrap_or(f64::NAN);
            Ok(as_number(actual).is_some_and(|n| Comparator::Eq.compare(n, expected)))
        }
        Value::Bool(b) => Ok(match actual {
            Json::Bool(a) => a == b,
            Json::String(s) => s.eq_ignore_ascii_case(&b.to_string()),
            _ => false,
        }),
        _ => {
            let Some(text) = scalar_text(actual) else {
                return Ok(false);
            };
            Ok(value_regex(expected, operator, case_sensitive)?.is_match(&text))
        }
    }
}

/// Anchored regex equivalent of a predicate value under `operator`.
fn value_regex(value: &Value, operator: Operator, case_sensitive: bool) -> Result<Regex> {
    let source = match value {
        Value::Pattern(source) => source.clone(),
        Value::Str(s) => wildcard_regex(&shape(s, operator)),
        Value::Int(_) | Value::Float(_) | Value::Bool(_) => {
            let text = value.to_string();
            wildcard_regex(&shape(&WildString::plain(&text), operator))
        }
    };
    RegexBuilder::new(&source)
        .case_insensitive(!case_sensitive)
        .build()
        .map_err(|e| TideError::invalid("regex", e.to_string()))
}

fn wildcard_regex(value: &WildString) -> String {
    let mut out = String::from("(?s)^");
    for part in &value.parts {
        match part {
            StrPart::Plain(s) => out.push_str(&regex::escape(s)),
            StrPart::AnyChars => out.push_str(".*"),
            StrPart::OneChar => out.push('.'),
        }
    }
    out.push('$');
    out
}

/// Look up a field by literal key, then by dotted path. `null` is absent.
fn lookup<'a>(event: &'a Json, path: &str) -> Option<&'a Json> {
    let found = match event.get(path) {
        Some(value) => Some(value),
        None => path
            .split('.')
            .try_fold(event, |current, part| current.get(part)),
    };
    found.filter(|value| !value.is_null())
}

fn scalar_text(value: &Json) -> Option<String> {
    match value {
        Json::String(s) => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        Json::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn render(value: &Json) -> String {
    scalar_text(value).unwrap_or_else(|| value.to_string())
}

fn as_number(value: &Json) -> Option<f64> {
    match value {
        Json::Number(n) => n.as_f64(),
        Json::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn any_string(value: &Json, test: &dyn Fn(&str) -> bool) -> bool {
    match value {
        Json::String(s) => test(s),
        Json::Number(n) => test(&n.to_string()),
        Json::Array(items) => items.iter().any(|item| any_string(item, test)),
        Json::Object(map) => map.values().any(|item| any_string(item, test)),
        _ => false,
    }
}
