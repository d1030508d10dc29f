//! Lucene keyword-query emitter.

use super::{is_exists, is_negation, join, negate, shape, Emitter, Grouping, Target};
use crate::error::{Result, TideError};
use crate::ir::{Aggregation, Comparator, Expr, Operator, Predicate, StrPart, Value, WildString};

/// Characters with syntactic meaning in the Lucene query grammar.
const RESERVED: &[char] = &[
    '+', '-', '=', '&', '|', '>', '<', '!', '(', ')', '{', '}', '[', ']', '^', '"', '~', '*', '?',
    ':', '\\', '/',
];

/// Emits Lucene query-string syntax (`field:value AND NOT other:value`).
#[derive(Debug, Clone, Copy, Default)]
pub struct LuceneEmitter;

/// Backslash-escape reserved characters and whitespace.
pub(crate) fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if RESERVED.contains(&c) || c.is_whitespace() {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn term(value: &WildString) -> String {
    let mut out = String::new();
    for part in &value.parts {
        match part {
            StrPart::Plain(s) => out.push_str(&escape(s)),
            StrPart::AnyChars => out.push('*'),
            StrPart::OneChar => out.push('?'),
        }
    }
    if out.is_empty() {
        "\"\"".to_string()
    } else {
        out
    }
}

fn literal(value: &Value, operator: Operator) -> Result<String> {
    match value {
        Value::Str(s) => Ok(term(&shape(s, operator))),
        Value::Int(i) => Ok(escape(&i.to_string())),
        Value::Float(f) => Ok(escape(&f.to_string())),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Pattern(_) => Err(TideError::unsupported("regex value outside regex predicate", Target::Lucene)),
    }
}

fn number(value: &Value) -> Result<String> {
    value
        .as_number()
        .map(|n| escape(&n.to_string()))
        .ok_or_else(|| TideError::unsupported("non-numeric range bound", Target::Lucene))
}

impl Emitter for LuceneEmitter {
    fn target(&self) -> Target {
        Target::Lucene
    }

    fn predicate(&self, predicate: &Predicate) -> Result<String> {
        let text = match &predicate.field {
            None => {
                let terms = predicate
                    .values
                    .iter()
                    .map(|v| literal(v, Operator::Contains))
                    .collect::<Result<Vec<_>>>()?;
                if terms.len() == 1 {
                    terms.join("")
                } else {
                    format!("({})", terms.join(" OR "))
                }
            }
            Some(field) => {
                let field = escape(field);
                match (predicate.operator, predicate.values.as_slice()) {
                    _ if is_exists(predicate) => format!("_exists_:{field}"),
                    (Operator::Regex, [Value::Pattern(source)]) => {
                        if !predicate.case_sensitive {
                            return Err(TideError::unsupported("case-insensitive regex", Target::Lucene));
                        }
                        if source.starts_with("(?") {
                            return Err(TideError::unsupported("regex flags", Target::Lucene));
                        }
                        format!("{field}:/{}/", source.replace('/', "\\/"))
                    }
                    (Operator::Range(comparator), [bound]) => {
                        let n = number(bound)?;
                        let range = match comparator {
                            Comparator::Gt => format!("{{{n} TO *}}"),
                            Comparator::Gte => format!("[{n} TO *]"),
                            Comparator::Lt => format!("{{* TO {n}}}"),
                            Comparator::Lte => format!("[* TO {n}]"),
                            Comparator::Eq => n,
                        };
                        format!("{field}:{range}")
                    }
                    (Operator::InList, values) => {
                        let terms = values
                            .iter()
                            .map(|v| literal(v, Operator::Equals))
                            .collect::<Result<Vec<_>>>()?;
                        format!("{field}:({})", terms.join(" OR "))
                    }
                    (Operator::Regex | Operator::Range(_), _) => {
                        return Err(TideError::unsupported("multi-valued predicate", Target::Lucene))
                    }
                    (operator, [value]) => format!("{field}:{}", literal(value, operator)?),
                    (_, values) => {
                        let terms = values
                            .iter()
                            .map(|v| literal(v, predicate.operator))
                            .collect::<Result<Vec<_>>>()?;
                        format!("{field}:({})", terms.join(" OR "))
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
        join(self, children, " AND ", true, Grouping::EveryAndNegatedDisjuncts)
    }

    fn or(&self, children: &[Expr]) -> Result<String> {
        join(self, children, " OR ", false, Grouping::EveryAndNegatedDisjuncts)
    }

    fn not(&self, child: &Expr) -> Result<String> {
        if is_negation(child) {
            return Ok(format!("NOT ({})", self.expr(child)?));
        }
        negate(self, child, "NOT")
    }

    fn aggregation(&self, _aggregation: &Aggregation) -> Result<String> {
        Err(TideError::unsupported("aggregation", Target::Lucene))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::AggregationFunction;

    fn p(field: &str, op: Operator, values: Vec<Value>) -> Expr {
        Expr::Predicate(Predicate::new(field, op, values))
    }

    fn s(text: &str) -> Value {
        Value::Str(WildString::parse(text))
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("C:\\Windows\\cmd.exe"), "C\\:\\\\Windows\\\\cmd.exe");
        assert_eq!(escape("a b"), "a\\ b");
        assert_eq!(escape("-5"), "\\-5");
    }

    #[test]
    fn test_basic_predicates() {
        let e = LuceneEmitter;
        assert_eq!(e.emit(&p("EventID", Operator::Equals, vec![Value::Int(4688)])).unwrap(), "EventID:4688");
        assert_eq!(
            e.emit(&p("process.name", Operator::Contains, vec![s("mimi")])).unwrap(),
            "process.name:*mimi*"
        );
        assert_eq!(
            e.emit(&p("Image", Operator::EndsWith, vec![s("\\cmd.exe")])).unwrap(),
            "Image:*\\\\cmd.exe"
        );
        assert_eq!(
            e.emit(&p("User", Operator::InList, vec![s("a b"), s("c")])).unwrap(),
            "User:(a\\ b OR c)"
        );
        assert_eq!(e.emit(&p("x", Operator::Equals, vec![s("")])).unwrap(), "x:\"\"");
    }

    #[test]
    fn test_exists_and_negation() {
        let e = LuceneEmitter;
        let missing = Expr::Predicate(
            Predicate::new("ParentImage", Operator::Equals, vec![Value::Str(WildString::any())]).negated(),
        );
        assert_eq!(e.emit(&missing).unwrap(), "NOT _exists_:ParentImage");

        let either = Expr::Or(vec![p("EventID", Operator::Equals, vec![Value::Int(1)]), missing.clone()]);
        assert_eq!(e.emit(&either).unwrap(), "EventID:1 OR (NOT _exists_:ParentImage)");
        assert_eq!(e.emit(&Expr::not(missing)).unwrap(), "NOT (NOT _exists_:ParentImage)");
    }

    #[test]
    fn test_negated_disjuncts_are_grouped() {
        let e = LuceneEmitter;
        let expr = Expr::Or(vec![
            p("EventID", Operator::Equals, vec![Value::Int(1)]),
            Expr::not(p("User", Operator::Equals, vec![s("SYSTEM")])),
        ]);
        assert_eq!(e.emit(&expr).unwrap(), "EventID:1 OR (NOT User:SYSTEM)");

        let conjunction = Expr::And(vec![
            p("EventID", Operator::Equals, vec![Value::Int(1)]),
            Expr::not(p("User", Operator::Equals, vec![s("SYSTEM")])),
        ]);
        assert_eq!(e.emit(&conjunction).unwrap(), "EventID:1 AND NOT User:SYSTEM");

        let nested = Expr::Or(vec![
            Expr::not(Expr::And(vec![
                p("a", Operator::Equals, vec![Value::Int(1)]),
                p("b", Operator::Equals, vec![Value::Int(2)]),
            ])),
            p("c", Operator::Equals, vec![Value::Int(3)]),
        ]);
        assert_eq!(e.emit(&nested).unwrap(), "(NOT (a:1 AND b:2)) OR c:3");
    }

    #[test]
    fn test_regex_and_ranges() {
        let e = LuceneEmitter;
        let re = Expr::Predicate(
            Predicate::new("url", Operator::Regex, vec![Value::Pattern("a/b.*".to_string())]).cased(true),
        );
        assert_eq!(e.emit(&re).unwrap(), "url:/a\\/b.*/");

        let insensitive = p("url", Operator::Regex, vec![Value::Pattern("x".to_string())]);
        assert!(matches!(
            e.emit(&insensitive),
            Err(TideError::UnsupportedConstruct { .. })
        ));

        assert_eq!(
            e.emit(&p("bytes", Operator::Range(Comparator::Gte), vec![Value::Int(100)])).unwrap(),
            "bytes:[100 TO *]"
        );
        assert_eq!(
            e.emit(&p("bytes", Operator::Range(Comparator::Lt), vec![Value::Int(5)])).unwrap(),
            "bytes:{* TO 5}"
        );
    }

    #[test]
    fn test_grouping() {
        let e = LuceneEmitter;
        let expr = Expr::And(vec![
            p("a", Operator::Equals, vec![Value::Int(1)]),
            Expr::Or(vec![
                p("b", Operator::Equals, vec![Value::Int(2)]),
                p("c", Operator::Equals, vec![Value::Int(3)]),
            ]),
            Expr::not(Expr::And(vec![
                p("d", Operator::Equals, vec![Value::Int(4)]),
                p("e", Operator::Equals, vec![Value::Int(5)]),
            ])),
        ]);
        assert_eq!(e.emit(&expr).unwrap(), "a:1 AND (b:2 OR c:3) AND NOT (d:4 AND e:5)");
    }

    #[test]
    fn test_keyword_search() {
        let e = LuceneEmitter;
        let expr = Expr::Predicate(Predicate::keyword(vec![s("sekurlsa::logonpasswords")]));
        assert_eq!(e.emit(&expr).unwrap(), "*sekurlsa\\:\\:logonpasswords*");
    }

    #[test]
    fn test_aggregation_unsupported() {
        let expr = Expr::Aggregation(Aggregation {
            inner: Box::new(p("a", Operator::Equals, vec![Value::Int(1)])),
            function: AggregationFunction::Count(None),
            group_by: vec![],
            comparator: Comparator::Gt,
            threshold: 1,
            time_window: None,
        });
        assert_eq!(
            LuceneEmitter.emit(&expr).unwrap_err(),
            TideError::UnsupportedConstruct {
                construct: "aggregation".to_string(),
                target: "lucene".to_string()
            }
        );
    }
}
