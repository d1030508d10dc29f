//! ES|QL emitter.
//!
//! Queries take the form `FROM <index> | WHERE <condition>`; aggregations
//! append a `STATS ... BY` stage and a threshold filter.

use super::{backtick_field, is_exists, join, negate, quote, shape, Emitter, Grouping, Target};
use crate::error::{Result, TideError};
use crate::ir::{Aggregation, AggregationFunction, Expr, Operator, Predicate, StrPart, Value, WildString};

/// Emits piped ES|QL queries against a fixed index pattern.
#[derive(Debug, Clone)]
pub struct EsqlEmitter {
    index: String,
}

impl Default for EsqlEmitter {
    fn default() -> Self {
        Self::new("logs-*")
    }
}

impl EsqlEmitter {
    pub fn new(index: impl Into<String>) -> Self {
        Self { index: index.into() }
    }

    fn string(field: &str, value: &WildString, cased: bool) -> Result<String> {
        let value = if cased { value.clone() } else { value.to_lowercase() };
        let subject = if cased {
            field.to_string()
        } else {
            format!("TO_LOWER({field})")
        };
        Ok(if value.has_wildcards() {
            format!("{subject} LIKE {}", quote(&like_pattern(&value)))
        } else {
            format!("{subject} == {}", quote(&value.literal()))
        })
    }

    fn literal(value: &Value) -> Result<String> {
        match value {
            Value::Int(i) => Ok(i.to_string()),
            Value::Float(f) => Ok(f.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Str(s) => Ok(quote(&s.literal())),
            Value::Pattern(_) => Err(TideError::unsupported("regex value outside regex predicate", Target::Esql)),
        }
    }

    fn single(field: &str, operator: Operator, value: &Value, cased: bool) -> Result<String> {
        match value {
            Value::Str(s) => Self::string(field, &shape(s, operator), cased),
            other => Ok(format!("{field} == {}", Self::literal(other)?)),
        }
    }

    fn function(function: &AggregationFunction) -> String {
        match function {
            AggregationFunction::Count(None) => "COUNT(*)".to_string(),
            AggregationFunction::Count(Some(field)) => format!("COUNT_DISTINCT({})", backtick_field(field)),
            other => format!(
                "{}({})",
                other.name().to_uppercase(),
                backtick_field(other.field().unwrap_or_default())
            ),
        }
    }
}

impl Emitter for EsqlEmitter {
    fn target(&self) -> Target {
        Target::Esql
    }

    fn predicate(&self, predicate: &Predicate) -> Result<String> {
        let Some(name) = &predicate.field else {
            return Err(TideError::unsupported("keyword search", Target::Esql));
        };
        let field = backtick_field(name);

        if is_exists(predicate) {
            let op = if predicate.negate { "IS NULL" } else { "IS NOT NULL" };
            return Ok(format!("{field} {op}"));
        }

        let cased = predicate.case_sensitive;
        let text = match (predicate.operator, predicate.values.as_slice()) {
            (Operator::Regex, [Value::Pattern(source)]) => {
                if !cased {
                    return Err(TideError::unsupported("case-insensitive regex", Target::Esql));
                }
                if source.starts_with("(?") {
                    return Err(TideError::unsupported("regex flags", Target::Esql));
                }
                format!("{field} RLIKE {}", quote(source))
            }
            (Operator::Range(comparator), [bound]) => {
                let n = bound
                    .as_number()
                    .ok_or_else(|| TideError::unsupported("non-numeric range bound", Target::Esql))?;
                format!("{field} {} {n}", comparator.symbol())
            }
            (Operator::Regex | Operator::Range(_), _) => {
                return Err(TideError::unsupported("multi-valued predicate", Target::Esql))
            }
            (Operator::InList, values)
                if !values.iter().any(|v| matches!(v, Value::Str(s) if s.has_wildcards())) =>
            {
                let strings = values.iter().any(|v| matches!(v, Value::Str(_)));
                let (subject, values): (String, Vec<Value>) = if strings && !cased {
                    (
                        format!("TO_LOWER({field})"),
                        values
                            .iter()
                            .map(|v| match v {
                                Value::Str(s) => Value::Str(s.to_lowercase()),
                                other => other.clone(),
                            })
                            .collect(),
                    )
                } else {
                    (field.clone(), values.to_vec())
                };
                let terms = values.iter().map(Self::literal).collect::<Result<Vec<_>>>()?;
                format!("{subject} IN ({})", terms.join(", "))
            }
            (operator, [value]) => Self::single(&field, operator, value, cased)?,
            (operator, values) => {
                let operator = if operator == Operator::InList {
                    Operator::Equals
                } else {
                    operator
                };
                let terms = values
                    .iter()
                    .map(|v| Self::single(&field, operator, v, cased))
                    .collect::<Result<Vec<_>>>()?;
                format!("({})", terms.join(" OR "))
            }
        };

        Ok(if predicate.negate {
            format!("NOT ({text})")
        } else {
            text
        })
    }

    fn and(&self, children: &[Expr]) -> Result<String> {
        join(self, children, " AND ", true, Grouping::OrInAnd)
    }

    fn or(&self, children: &[Expr]) -> Result<String> {
        join(self, children, " OR ", false, Grouping::OrInAnd)
    }

    fn not(&self, child: &Expr) -> Result<String> {
        negate(self, child, "NOT")
    }

    fn aggregation(&self, aggregation: &Aggregation) -> Result<String> {
        if aggregation.inner.has_aggregation() {
            return Err(TideError::unsupported("nested aggregation", Target::Esql));
        }
        let mut text = format!(
            "{} | STATS value = {}",
            self.expr(&aggregation.inner)?,
            Self::function(&aggregation.function)
        );
        let mut group_by: Vec<String> = aggregation.group_by.iter().map(|f| backtick_field(f)).collect();
        if let Some(window) = &aggregation.time_window {
            group_by.insert(0, format!("bucket = BUCKET(@timestamp, {})", window_interval(window)?));
        }
        if !group_by.is_empty() {
            text.push_str(&format!(" BY {}", group_by.join(", ")));
        }
        text.push_str(&format!(
            " | WHERE value {} {}",
            aggregation.comparator.symbol(),
            aggregation.threshold
        ));
        Ok(text)
    }

    fn emit(&self, expr: &Expr) -> Result<String> {
        Ok(format!("FROM {} | WHERE {}", self.index, self.expr(expr)?))
    }
}

/// Render a wildcard string as a `LIKE` pattern. `LIKE` treats `\` as its
/// own escape character, so literal backslashes and wildcard characters are
/// escaped before the string is quoted.
fn like_pattern(value: &WildString) -> String {
    let mut out = String::new();
    for part in &value.parts {
        match part {
            StrPart::Plain(s) => {
                for c in s.chars() {
                    if matches!(c, '\\' | '*' | '?') {
                        out.push('\\');
                    }
                    out.push(c);
                }
            }
            StrPart::AnyChars => out.push('*'),
            StrPart::OneChar => out.push('?'),
        }
    }
    out
}

/// Convert a `5m`-style window into an ES|QL time span literal.
fn window_interval(window: &str) -> Result<String> {
    let window = window.trim();
    let split = window
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(window.len());
    let (amount, unit) = window.split_at(split);
    let unit = match unit {
        "s" => "seconds",
        "m" => "minutes",
        "h" => "hours",
        "d" => "days",
        _ => return Err(TideError::invalid("timeframe", format!("unrecognised window '{window}'"))),
    };
    if amount.is_empty() {
        return Err(TideError::invalid("timeframe", format!("unrecognised window '{window}'")));
    }
    Ok(format!("{amount} {unit}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Comparator;

    fn p(field: &str, op: Operator, values: Vec<Value>) -> Expr {
        Expr::Predicate(Predicate::new(field, op, values))
    }

    fn s(text: &str) -> Value {
        Value::Str(WildString::parse(text))
    }

    #[test]
    fn test_case_insensitive_strings() {
        let e = EsqlEmitter::default();
        assert_eq!(
            e.emit(&p("process.name", Operator::Equals, vec![s("CMD.exe")])).unwrap(),
            "FROM logs-* | WHERE TO_LOWER(process.name) == \"cmd.exe\""
        );
        assert_eq!(
            e.emit(&p("process.command_line", Operator::StartsWith, vec![s("Powershell")])).unwrap(),
            "FROM logs-* | WHERE TO_LOWER(process.command_line) LIKE \"powershell*\""
        );
    }

    #[test]
    fn test_cased_and_lists() {
        let e = EsqlEmitter::new("winlogbeat-*");
        let cased = Expr::Predicate(Predicate::new("user.name", Operator::Equals, vec![s("Admin")]).cased(true));
        assert_eq!(e.emit(&cased).unwrap(), "FROM winlogbeat-* | WHERE user.name == \"Admin\"");
        assert_eq!(
            e.emit(&p("event.code", Operator::InList, vec![Value::Int(4624), Value::Int(4625)])).unwrap(),
            "FROM winlogbeat-* | WHERE event.code IN (4624, 4625)"
        );
        assert_eq!(
            e.emit(&p("file.name", Operator::InList, vec![s("a*"), s("B")])).unwrap(),
            "FROM winlogbeat-* | WHERE (TO_LOWER(file.name) LIKE \"a*\" OR TO_LOWER(file.name) == \"b\")"
        );
    }

    #[test]
    fn test_exists_and_negation() {
        let e = EsqlEmitter::default();
        let exists = p("process.parent.name", Operator::Equals, vec![Value::Str(WildString::any())]);
        assert_eq!(e.emit(&exists).unwrap(), "FROM logs-* | WHERE process.parent.name IS NOT NULL");

        let expr = Expr::And(vec![
            p("a", Operator::Equals, vec![Value::Int(1)]),
            Expr::not(Expr::Or(vec![
                p("b", Operator::Equals, vec![Value::Int(2)]),
                p("c", Operator::Equals, vec![Value::Int(3)]),
            ])),
        ]);
        assert_eq!(e.emit(&expr).unwrap(), "FROM logs-* | WHERE a == 1 AND NOT (b == 2 OR c == 3)");
    }

    #[test]
    fn test_aggregation() {
        let e = EsqlEmitter::default();
        let expr = Expr::Aggregation(Aggregation {
            inner: Box::new(p("event.code", Operator::Equals, vec![Value::Int(4625)])),
            function: AggregationFunction::Count(Some("user.name".to_string())),
            group_by: vec!["source.ip".to_string()],
            comparator: Comparator::Gte,
            threshold: 10,
            time_window: Some("15m".to_string()),
        });
        assert_eq!(
            e.emit(&expr).unwrap(),
            "FROM logs-* | WHERE event.code == 4625 | STATS value = COUNT_DISTINCT(user.name) BY bucket = BUCKET(@timestamp, 15 minutes), source.ip | WHERE value >= 10"
        );
    }

    #[test]
    fn test_regex_restrictions() {
        let e = EsqlEmitter::default();
        let insensitive = p("url", Operator::Regex, vec![Value::Pattern("a.*".to_string())]);
        assert_eq!(e.emit(&insensitive).unwrap_err().construct(), "case-insensitive regex");
        let cased = Expr::Predicate(
            Predicate::new("url", Operator::Regex, vec![Value::Pattern("a.*".to_string())]).cased(true),
        );
        assert_eq!(e.emit(&cased).unwrap(), "FROM logs-* | WHERE url RLIKE \"a.*\"");
    }

    #[test]
    fn test_keyword_unsupported() {
        let keyword = Expr::Predicate(Predicate::keyword(vec![s("mimikatz")]));
        assert!(matches!(
            EsqlEmitter::default().emit(&keyword),
            Err(TideError::UnsupportedConstruct { .. })
        ));
    }

    #[test]
    fn test_like_escapes_backslashes() {
        let e = EsqlEmitter::default();
        let expr = Expr::And(vec![
            p("Image", Operator::EndsWith, vec![s("\\cmd.exe")]),
            p("Path", Operator::StartsWith, vec![s("C:\\Windows\\")]),
        ]);
        assert_eq!(
            e.emit(&expr).unwrap(),
            r#"FROM logs-* | WHERE TO_LOWER(Image) LIKE "*\\\\cmd.exe" AND TO_LOWER(Path) LIKE "c:\\\\windows\\\\*""#
        );
        assert_eq!(
            e.emit(&p("Path", Operator::Equals, vec![s("C:\\Windows\\")])).unwrap(),
            r#"FROM logs-* | WHERE TO_LOWER(Path) == "c:\\windows\\""#
        );
    }

    #[test]
    fn test_like_escapes_literal_wildcards() {
        let e = EsqlEmitter::default();
        assert_eq!(
            e.emit(&p("CommandLine", Operator::Contains, vec![s("a\\*b\\?")])).unwrap(),
            r#"FROM logs-* | WHERE TO_LOWER(CommandLine) LIKE "*a\\*b\\?*""#
        );
        assert_eq!(
            e.emit(&p("CommandLine", Operator::Equals, vec![s("a\\*b")])).unwrap(),
            r#"FROM logs-* | WHERE TO_LOWER(CommandLine) == "a*b""#
        );
        assert_eq!(
            e.emit(&p("file.name", Operator::Equals, vec![s("report?.doc")])).unwrap(),
            r#"FROM logs-* | WHERE TO_LOWER(file.name) LIKE "report?.doc""#
        );
    }

    #[test]
    fn test_window_interval() {
        assert_eq!(window_interval("30s").unwrap(), "30 seconds");
        assert_eq!(window_interval("1d").unwrap(), "1 days");
        assert!(window_interval("soon").is_err());
    }
}
