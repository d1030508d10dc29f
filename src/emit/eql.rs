//! Elastic event query language emitter.

use super::{backtick_field, glob_pattern, is_exists, join, negate, quote, shape, Emitter, Grouping, Target};
use crate::error::{Result, TideError};
use crate::ir::{Aggregation, Comparator, Expr, Operator, Predicate, Value, WildString};

/// Emits `<category> where <condition>` queries.
#[derive(Debug, Clone)]
pub struct EqlEmitter {
    category: String,
}

impl Default for EqlEmitter {
    fn default() -> Self {
        Self::new("any")
    }
}

impl EqlEmitter {
    pub fn new(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
        }
    }

    fn pattern(value: &WildString) -> Result<String> {
        Ok(quote(&glob_pattern(value, Target::Eql, false)?))
    }

    fn literal(value: &Value) -> Result<String> {
        match value {
            Value::Str(s) => Self::pattern(s),
            Value::Int(i) => Ok(i.to_string()),
            Value::Float(f) => Ok(f.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Pattern(_) => Err(TideError::unsupported("regex value outside regex predicate", Target::Eql)),
        }
    }

    fn single(field: &str, operator: Operator, value: &Value, cased: bool) -> Result<String> {
        match value {
            Value::Str(s) => {
                let shaped = shape(s, operator);
                let text = Self::pattern(&shaped)?;
                Ok(match (shaped.has_wildcards(), cased) {
                    (true, true) => format!("{field} like {text}"),
                    (true, false) => format!("{field} like~ {text}"),
                    (false, true) => format!("{field} == {text}"),
                    (false, false) => format!("{field} : {text}"),
                })
            }
            other => Ok(format!("{field} == {}", Self::literal(other)?)),
        }
    }

    fn list(field: &str, values: &[Value], cased: bool) -> Result<String> {
        let terms = values.iter().map(Self::literal).collect::<Result<Vec<_>>>()?;
        let strings = values.iter().all(|v| matches!(v, Value::Str(_)));
        let wildcards = values
            .iter()
            .any(|v| matches!(v, Value::Str(s) if s.has_wildcards()));
        let op = match (strings, wildcards, cased) {
            (true, true, true) => "like",
            (true, true, false) => "like~",
            (true, false, false) => "in~",
            _ => "in",
        };
        Ok(format!("{field} {op} ({})", terms.join(", ")))
    }
}

impl Emitter for EqlEmitter {
    fn target(&self) -> Target {
        Target::Eql
    }

    fn predicate(&self, predicate: &Predicate) -> Result<String> {
        let Some(name) = &predicate.field else {
            return Err(TideError::unsupported("keyword search", Target::Eql));
        };
        let field = backtick_field(name);

        if is_exists(predicate) {
            let op = if predicate.negate { "==" } else { "!=" };
            return Ok(format!("{field} {op} null"));
        }

        let cased = predicate.case_sensitive;
        let text = match (predicate.operator, predicate.values.as_slice()) {
            (Operator::Regex, [Value::Pattern(source)]) => {
                if source.starts_with("(?") {
                    return Err(TideError::unsupported("regex flags", Target::Eql));
                }
                let op = if cased { "regex" } else { "regex~" };
                format!("{field} {op} {}", quote(source))
            }
            (Operator::Range(comparator), [bound]) => {
                let n = bound
                    .as_number()
                    .ok_or_else(|| TideError::unsupported("non-numeric range bound", Target::Eql))?;
                let op = match comparator {
                    Comparator::Eq => "==",
                    other => other.symbol(),
                };
                format!("{field} {op} {n}")
            }
            (Operator::Regex | Operator::Range(_), _) => {
                return Err(TideError::unsupported("multi-valued predicate", Target::Eql))
            }
            (Operator::InList, values) => Self::list(&field, values, cased)?,
            (operator, [value]) => Self::single(&field, operator, value, cased)?,
            (operator, values) => {
                let shaped: Vec<Value> = values
                    .iter()
                    .map(|v| match v {
                        Value::Str(s) => Value::Str(shape(s, operator)),
                        other => other.clone(),
                    })
                    .collect();
                Self::list(&field, &shaped, cased)?
            }
        };

        Ok(if predicate.negate {
            format!("not {text}")
        } else {
            text
        })
    }

    fn and(&self, children: &[Expr]) -> Result<String> {
        join(self, children, " and ", true, Grouping::OrInAnd)
    }

    fn or(&self, children: &[Expr]) -> Result<String> {
        join(self, children, " or ", false, Grouping::OrInAnd)
    }

    fn not(&self, child: &Expr) -> Result<String> {
        negate(self, child, "not")
    }

    fn aggregation(&self, _aggregation: &Aggregation) -> Result<String> {
        Err(TideError::unsupported("aggregation", Target::Eql))
    }

    fn emit(&self, expr: &Expr) -> Result<String> {
        Ok(format!("{} where {}", self.category, self.expr(expr)?))
    }
}
