//! Splunk search-language emitter.
//!
//! Splunk's `OR` binds tighter than its implicit/explicit `AND`, so every
//! nested compound is parenthesised.

use super::{glob_pattern, is_exists, is_simple_field, join, negate, quote, shape, Emitter, Grouping, Target};
use crate::error::{Result, TideError};
use crate::ir::{Aggregation, AggregationFunction, Comparator, Expr, Operator, Predicate, Value};

/// Emits Splunk SPL search text.
#[derive(Debug, Clone, Default)]
pub struct SplunkEmitter {
    index: Option<String>,
}

impl SplunkEmitter {
    pub fn new(index: Option<String>) -> Self {
        Self { index }
    }

    fn field(name: &str) -> String {
        if is_simple_field(name) {
            name.to_string()
        } else {
            quote(name)
        }
    }

    fn string(&self, value: &Value, operator: Operator, case_sensitive: bool) -> Result<String> {
        match value {
            Value::Str(s) => {
                let pattern = quote(&glob_pattern(&shape(s, operator), Target::Splunk, false)?);
                Ok(if case_sensitive {
                    format!("CASE({pattern})")
                } else {
                    pattern
                })
            }
            Value::Int(i) => Ok(i.to_string()),
            Value::Float(f) => Ok(f.to_string()),
            Value::Bool(b) => Ok(quote(&b.to_string())),
            Value::Pattern(_) => Err(TideError::unsupported("regex predicate", Target::Splunk)),
        }
    }

    fn function(function: &AggregationFunction) -> String {
        match function {
            AggregationFunction::Count(None) => "count".to_string(),
            AggregationFunction::Count(Some(field)) => format!("dc({})", Self::field(field)),
            other => format!(
                "{}({})",
                other.name(),
                Self::field(other.field().unwrap_or_default())
            ),
        }
    }
}

impl Emitter for SplunkEmitter {
    fn target(&self) -> Target {
        Target::Splunk
    }

    fn predicate(&self, predicate: &Predicate) -> Result<String> {
        let text = match &predicate.field {
            None => {
                let terms = predicate
                    .values
                    .iter()
                    .map(|v| self.string(v, Operator::Contains, predicate.case_sensitive))
                    .collect::<Result<Vec<_>>>()?;
                if terms.len() == 1 {
                    terms.join("")
                } else {
                    format!("({})", terms.join(" OR "))
                }
            }
            Some(name) => {
                let field = Self::field(name);
                match (predicate.operator, predicate.values.as_slice()) {
                    _ if is_exists(predicate) => format!("{field}=*"),
                    (Operator::Regex, _) => {
                        return Err(TideError::unsupported("regex predicate", Target::Splunk))
                    }
                    (Operator::Range(comparator), [bound]) => {
                        let n = bound
                            .as_number()
                            .ok_or_else(|| TideError::unsupported("non-numeric range bound", Target::Splunk))?;
                        let op = match comparator {
                            Comparator::Eq => "=",
                            other => other.symbol(),
                        };
                        format!("{field}{op}{n}")
                    }
                    (Operator::InList, values) if !predicate.case_sensitive => {
                        let terms = values
                            .iter()
                            .map(|v| self.string(v, Operator::Equals, false))
                            .collect::<Result<Vec<_>>>()?;
                        format!("{field} IN ({})", terms.join(", "))
                    }
                    (operator, [value]) => {
                        format!("{field}={}", self.string(value, operator, predicate.case_sensitive)?)
                    }
                    (operator, values) => {
                        let operator = if operator == Operator::InList {
                            Operator::Equals
                        } else {
                            operator
                        };
                        let terms = values
                            .iter()
                            .map(|v| Ok(format!("{field}={}", self.string(v, operator, predicate.case_sensitive)?)))
                            .collect::<Result<Vec<_>>>()?;
                        format!("({})", terms.join(" OR "))
                    }
                }
            }
        };

        Ok(if predicate.negate {
            format!("NOT {text}")
        } else {
            text
        })
    }

    fn and(&self, children: &[Expr]) -> Result<String> {
        join(self, children, " AND ", true, Grouping::Every)
    }

    fn or(&self, children: &[Expr]) -> Result<String> {
        join(self, children, " OR ", false, Grouping::Every)
    }

    fn not(&self, child: &Expr) -> Result<String> {
        negate(self, child, "NOT")
    }

    fn aggregation(&self, aggregation: &Aggregation) -> Result<String> {
        if aggregation.inner.has_aggregation() {
            return Err(TideError::unsupported("nested aggregation", Target::Splunk));
        }
        let mut text = self.expr(&aggregation.inner)?;

        let mut group_by: Vec<String> = aggregation.group_by.iter().map(|f| Self::field(f)).collect();
        if let Some(window) = &aggregation.time_window {
            text.push_str(&format!(" | bin _time span={window}"));
            group_by.insert(0, "_time".to_string());
        }

        text.push_str(&format!(" | stats {} as value", Self::function(&aggregation.function)));
        if !group_by.is_empty() {
            text.push_str(&format!(" by {}", group_by.join(", ")));
        }
        text.push_str(&format!(
            " | where value {} {}",
            aggregation.comparator.symbol(),
            aggregation.threshold
        ));
        Ok(text)
    }

    fn emit(&self, expr: &Expr) -> Result<String> {
        let body = self.expr(expr)?;
        Ok(match &self.index {
            Some(index) => {
                let body = if matches!(expr, Expr::Or(_)) {
                    format!("({body})")
                } else {
                    body
                };
                format!("index={index} {body}")
            }
            None => body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::WildString;

    fn p(field: &str, op: Operator, values: Vec<Value>) -> Expr {
        Expr::Predicate(Predicate::new(field, op, values))
    }

    fn s(text: &str) -> Value {
        Value::Str(WildString::parse(text))
    }

    #[test]
    fn test_predicates() {
        let e = SplunkEmitter::default();
        assert_eq!(e.emit(&p("EventCode", Operator::Equals, vec![Value::Int(4688)])).unwrap(), "EventCode=4688");
        assert_eq!(
            e.emit(&p("CommandLine", Operator::Contains, vec![s("-enc")])).unwrap(),
            "CommandLine=\"*-enc*\""
        );
        assert_eq!(
            e.emit(&p("Image", Operator::EndsWith, vec![s("\\cmd.exe")])).unwrap(),
            "Image=\"*\\\\cmd.exe\""
        );
        assert_eq!(
            e.emit(&p("User", Operator::InList, vec![s("a"), s("b")])).unwrap(),
            "User IN (\"a\", \"b\")"
        );
        assert_eq!(
            e.emit(&p("bytes", Operator::Range(Comparator::Gt), vec![Value::Int(10)])).unwrap(),
            "bytes>10"
        );
    }

    #[test]
    fn test_case_sensitive() {
        let e = SplunkEmitter::default();
        let expr = Expr::Predicate(Predicate::new("User", Operator::Equals, vec![s("Admin")]).cased(true));
        assert_eq!(e.emit(&expr).unwrap(), "User=CASE(\"Admin\")");
    }

    #[test]
    fn test_every_compound_grouped() {
        let e = SplunkEmitter::default();
        let expr = Expr::Or(vec![
            Expr::And(vec![
                p("a", Operator::Equals, vec![Value::Int(1)]),
                p("b", Operator::Equals, vec![Value::Int(2)]),
            ]),
            p("c", Operator::Equals, vec![Value::Int(3)]),
        ]);
        assert_eq!(e.emit(&expr).unwrap(), "(a=1 AND b=2) OR c=3");
    }

    #[test]
    fn test_unsupported_constructs() {
        let e = SplunkEmitter::default();
        let re = p("x", Operator::Regex, vec![Value::Pattern("a+".to_string())]);
        assert_eq!(
            e.emit(&re).unwrap_err(),
            TideError::UnsupportedConstruct {
                construct: "regex predicate".to_string(),
                target: "splunk".to_string()
            }
        );
        let single = p("x", Operator::Equals, vec![s("ab?")]);
        assert!(e.emit(&single).is_err());
    }

    #[test]
    fn test_aggregation() {
        let e = SplunkEmitter::new(Some("wineventlog".to_string()));
        let expr = Expr::Aggregation(Aggregation {
            inner: Box::new(p("EventCode", Operator::Equals, vec![Value::Int(4625)])),
            function: AggregationFunction::Count(None),
            group_by: vec!["TargetUserName".to_string()],
            comparator: Comparator::Gt,
            threshold: 5,
            time_window: Some("5m".to_string()),
        });
        assert_eq!(
            e.emit(&expr).unwrap(),
            "index=wineventlog EventCode=4625 | bin _time span=5m | stats count as value by _time, TargetUserName | where value > 5"
        );
    }

    #[test]
    fn test_exists() {
        let e = SplunkEmitter::default();
        let expr = Expr::Predicate(
            Predicate::new("ParentImage", Operator::Equals, vec![Value::Str(WildString::any())]).negated(),
        );
        assert_eq!(e.emit(&expr).unwrap(), "NOT ParentImage=*");
    }
}
