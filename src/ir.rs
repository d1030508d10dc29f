//! Language-neutral expression IR.
//!
//! The compiler resolves the rule grammar's loose value shapes once, into the
//! closed [`Expr`] tree below. Emitters and the evaluator only ever read it.

use serde::Serialize;
use std::fmt;

/// Comparison used by range predicates and aggregation thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Comparator {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

impl Comparator {
    pub fn parse(symbol: &str) -> Option<Self> {
        match symbol {
            ">" => Some(Comparator::Gt),
            ">=" => Some(Comparator::Gte),
            "<" => Some(Comparator::Lt),
            "<=" => Some(Comparator::Lte),
            "=" | "==" => Some(Comparator::Eq),
            _ => None,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Comparator::Gt => ">",
            Comparator::Gte => ">=",
            Comparator::Lt => "<",
            Comparator::Lte => "<=",
            Comparator::Eq => "==",
        }
    }

    pub fn compare(self, left: f64, right: f64) -> bool {
        match self {
            Comparator::Gt => left > right,
            Comparator::Gte => left >= right,
            Comparator::Lt => left < right,
            Comparator::Lte => left <= right,
            Comparator::Eq => left == right,
        }
    }
}

/// One piece of a wildcard-aware string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum StrPart {
    Plain(String),
    /// `*`
    AnyChars,
    /// `?`
    OneChar,
}

/// A string value in which `*` and `?` are wildcards unless escaped with `\`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct WildString {
    pub parts: Vec<StrPart>,
}

impl WildString {
    /// Parse rule text. A backslash only escapes `*`, `?` and itself; before
    /// any other character it is kept literally (Windows paths).
    pub fn parse(text: &str) -> Self {
        let mut out = WildString { parts: Vec::new() };
        let mut acc = String::new();
        let mut escaped = false;

        for c in text.chars() {
            if escaped {
                if !matches!(c, '*' | '?' | '\\') {
                    acc.push('\\');
                }
                acc.push(c);
                escaped = false;
                continue;
            }
            match c {
                '\\' => escaped = true,
                '*' | '?' => {
                    if !acc.is_empty() {
                        out.parts.push(StrPart::Plain(std::mem::take(&mut acc)));
                    }
                    out.parts.push(if c == '*' {
                        StrPart::AnyChars
                    } else {
                        StrPart::OneChar
                    });
                }
                _ => acc.push(c),
            }
        }
        if escaped {
            acc.push('\\');
        }
        if !acc.is_empty() {
            out.parts.push(StrPart::Plain(acc));
        }
        out
    }

    /// A string with no wildcards at all.
    pub fn plain(text: &str) -> Self {
        let parts = if text.is_empty() {
            Vec::new()
        } else {
            vec![StrPart::Plain(text.to_string())]
        };
        WildString { parts }
    }

    pub fn any() -> Self {
        WildString {
            parts: vec![StrPart::AnyChars],
        }
    }

    pub fn is_plain(&self) -> bool {
        self.parts.iter().all(|p| matches!(p, StrPart::Plain(_)))
    }

    pub fn has_wildcards(&self) -> bool {
        !self.is_plain()
    }

    pub fn starts_with_wildcard(&self) -> bool {
        matches!(self.parts.first(), Some(StrPart::AnyChars | StrPart::OneChar))
    }

    pub fn has_single_wildcard(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, StrPart::OneChar))
    }

    /// Literal text with wildcards dropped.
    pub fn literal(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                StrPart::Plain(s) => Some(s.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Wrap with `*` on either side, merging adjacent wildcards.
    pub fn wrapped(&self, leading: bool, trailing: bool) -> Self {
        let mut parts = Vec::with_capacity(self.parts.len() + 2);
        if leading && self.parts.first() != Some(&StrPart::AnyChars) {
            parts.push(StrPart::AnyChars);
        }
        parts.extend(self.parts.iter().cloned());
        if trailing && parts.last() != Some(&StrPart::AnyChars) {
            parts.push(StrPart::AnyChars);
        }
        WildString { parts }
    }

    pub fn to_lowercase(&self) -> Self {
        WildString {
            parts: self
                .parts
                .iter()
                .map(|p| match p {
                    StrPart::Plain(s) => StrPart::Plain(s.to_lowercase()),
                    other => other.clone(),
                })
                .collect(),
        }
    }
}

impl fmt::Display for WildString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for part in &self.parts {
            match part {
                StrPart::Plain(s) => {
                    for c in s.chars() {
                        if matches!(c, '*' | '?') {
                            write!(f, "\\")?;
                        }
                        write!(f, "{c}")?;
                    }
                }
                StrPart::AnyChars => write!(f, "*")?,
                StrPart::OneChar => write!(f, "?")?,
            }
        }
        Ok(())
    }
}

/// A literal value in a predicate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Value {
    Str(WildString),
    /// Regular expression source, never wildcard-parsed.
    Pattern(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Value {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Str(s) if s.is_plain() => s.literal().trim().parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "\"{s}\""),
            Value::Pattern(p) => write!(f, "/{p}/"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// Predicate operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Operator {
    Equals,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
    /// Field equals any of the listed values.
    InList,
    Range(Comparator),
}

impl Operator {
    pub fn name(self) -> &'static str {
        match self {
            Operator::Equals => "equals",
            Operator::Contains => "contains",
            Operator::StartsWith => "startswith",
            Operator::EndsWith => "endswith",
            Operator::Regex => "regex",
            Operator::InList => "in",
            Operator::Range(_) => "range",
        }
    }
}

/// Field-level test. `field == None` is a full-text keyword search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Predicate {
    pub field: Option<String>,
    pub operator: Operator,
    pub values: Vec<Value>,
    pub negate: bool,
    pub case_sensitive: bool,
}

impl Predicate {
    pub fn new(field: &str, operator: Operator, values: Vec<Value>) -> Self {
        Self {
            field: Some(field.to_string()),
            operator,
            values,
            negate: false,
            case_sensitive: false,
        }
    }

    pub fn keyword(values: Vec<Value>) -> Self {
        Self {
            field: None,
            operator: Operator::Contains,
            values,
            negate: false,
            case_sensitive: false,
        }
    }

    pub fn negated(mut self) -> Self {
        self.negate = !self.negate;
        self
    }

    pub fn cased(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    /// True when matching needs an unanchored scan at the start of the value.
    pub fn has_leading_wildcard(&self) -> bool {
        match self.operator {
            Operator::Contains | Operator::EndsWith => true,
            Operator::Equals | Operator::StartsWith | Operator::InList => self
                .values
                .iter()
                .any(|v| matches!(v, Value::Str(s) if s.starts_with_wildcard() && s.parts.len() > 1)),
            Operator::Regex => self
                .values
                .iter()
                .any(|v| matches!(v, Value::Pattern(p) if !p.starts_with('^'))),
            Operator::Range(_) => false,
        }
    }
}

/// Aggregation function over matching events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum AggregationFunction {
    Count(Option<String>),
    Min(String),
    Max(String),
    Avg(String),
    Sum(String),
}

impl AggregationFunction {
    pub fn name(&self) -> &'static str {
        match self {
            AggregationFunction::Count(_) => "count",
            AggregationFunction::Min(_) => "min",
            AggregationFunction::Max(_) => "max",
            AggregationFunction::Avg(_) => "avg",
            AggregationFunction::Sum(_) => "sum",
        }
    }

    pub fn field(&self) -> Option<&str> {
        match self {
            AggregationFunction::Count(field) => field.as_deref(),
            AggregationFunction::Min(f)
            | AggregationFunction::Max(f)
            | AggregationFunction::Avg(f)
            | AggregationFunction::Sum(f) => Some(f),
        }
    }

    pub(crate) fn with_field(&self, field: Option<String>) -> Self {
        match (self, field) {
            (AggregationFunction::Count(_), f) => AggregationFunction::Count(f),
            (AggregationFunction::Min(_), Some(f)) => AggregationFunction::Min(f),
            (AggregationFunction::Max(_), Some(f)) => AggregationFunction::Max(f),
            (AggregationFunction::Avg(_), Some(f)) => AggregationFunction::Avg(f),
            (AggregationFunction::Sum(_), Some(f)) => AggregationFunction::Sum(f),
            (other, None) => other.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Aggregation {
    pub inner: Box<Expr>,
    pub function: AggregationFunction,
    pub group_by: Vec<String>,
    pub comparator: Comparator,
    pub threshold: i64,
    pub time_window: Option<String>,
}

/// Expression tree node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Expr {
    Predicate(Predicate),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    Aggregation(Aggregation),
}

impl Expr {
    /// Build an And, collapsing single-child groups.
    pub fn and(mut children: Vec<Expr>) -> Expr {
        if children.len() == 1 {
            children.remove(0)
        } else {
            Expr::And(children)
        }
    }

    /// Build an Or, collapsing single-child groups.
    pub fn or(mut children: Vec<Expr>) -> Expr {
        if children.len() == 1 {
            children.remove(0)
        } else {
            Expr::Or(children)
        }
    }

    pub fn not(child: Expr) -> Expr {
        Expr::Not(Box::new(child))
    }

    /// All predicates in depth-first order.
    pub fn predicates(&self) -> Vec<&Predicate> {
        let mut out = Vec::new();
        self.collect_predicates(&mut out);
        out
    }

    fn collect_predicates<'a>(&'a self, out: &mut Vec<&'a Predicate>) {
        match self {
            Expr::Predicate(p) => out.push(p),
            Expr::And(children) | Expr::Or(children) => {
                for child in children {
                    child.collect_predicates(out);
                }
            }
            Expr::Not(child) => child.collect_predicates(out),
            Expr::Aggregation(agg) => agg.inner.collect_predicates(out),
        }
    }

    pub fn has_aggregation(&self) -> bool {
        match self {
            Expr::Aggregation(_) => true,
            Expr::Predicate(_) => false,
            Expr::And(children) | Expr::Or(children) => children.iter().any(Expr::has_aggregation),
            Expr::Not(child) => child.has_aggregation(),
        }
    }

    pub fn depth(&self) -> usize {
        match self {
            Expr::Predicate(_) => 1,
            Expr::And(children) | Expr::Or(children) => {
                1 + children.iter().map(Expr::depth).max().unwrap_or(0)
            }
            Expr::Not(child) => 1 + child.depth(),
            Expr::Aggregation(agg) => 1 + agg.inner.depth(),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negate {
            write!(f, "!")?;
        }
        let field = self.field.as_deref().unwrap_or("*");
        let op = match self.operator {
            Operator::Range(c) => c.symbol().to_string(),
            other => other.name().to_string(),
        };
        let values: Vec<String> = self.values.iter().map(|v| v.to_string()).collect();
        write!(f, "{field} {op} [{}]", values.join(", "))?;
        if self.case_sensitive {
            write!(f, " cased")?;
        }
        Ok(())
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |f: &mut fmt::Formatter<'_>, name: &str, children: &[Expr]| {
            write!(f, "{name}(")?;
            for (i, child) in children.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{child}")?;
            }
            write!(f, ")")
        };
        match self {
            Expr::Predicate(p) => write!(f, "{p}"),
            Expr::And(children) => join(f, "And", children),
            Expr::Or(children) => join(f, "Or", children),
            Expr::Not(child) => write!(f, "Not({child})"),
            Expr::Aggregation(agg) => write!(
                f,
                "Aggregation({}, {}({}) by [{}] {} {})",
                agg.inner,
                agg.function.name(),
                agg.function.field().unwrap_or(""),
                agg.group_by.join(", "),
                agg.comparator.symbol(),
                agg.threshold
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildstring_parse_wildcards() {
        let s = WildString::parse("*\\cmd.exe");
        assert_eq!(
            s.parts,
            vec![StrPart::AnyChars, StrPart::Plain("\\cmd.exe".to_string())]
        );
        assert!(s.starts_with_wildcard());
    }

    #[test]
    fn test_wildstring_escapes() {
        let s = WildString::parse("a\\*b\\?c\\\\d");
        assert_eq!(s.parts, vec![StrPart::Plain("a*b?c\\d".to_string())]);
        assert!(s.is_plain());
    }

    #[test]
    fn test_wildstring_single_char() {
        let s = WildString::parse("ab?");
        assert!(s.has_single_wildcard());
        assert_eq!(s.literal(), "ab");
    }

    #[test]
    fn test_wildstring_wrapped_merges_wildcards() {
        let s = WildString::parse("*evil*").wrapped(true, true);
        assert_eq!(s.parts.len(), 3);
        let t = WildString::plain("evil").wrapped(true, false);
        assert_eq!(t.to_string(), "*evil");
    }

    #[test]
    fn test_wildstring_display_escapes_literals() {
        let s = WildString::plain("what?");
        assert_eq!(s.to_string(), "what\\?");
    }

    #[test]
    fn test_expr_builders_collapse() {
        let p = Expr::Predicate(Predicate::new("a", Operator::Equals, vec![Value::Int(1)]));
        assert_eq!(Expr::and(vec![p.clone()]), p);
        assert!(matches!(Expr::or(vec![p.clone(), p.clone()]), Expr::Or(ref c) if c.len() == 2));
    }

    #[test]
    fn test_leading_wildcard_detection() {
        let contains = Predicate::new("a", Operator::Contains, vec![Value::Str(WildString::plain("x"))]);
        assert!(contains.has_leading_wildcard());
        let prefix = Predicate::new("a", Operator::StartsWith, vec![Value::Str(WildString::plain("x"))]);
        assert!(!prefix.has_leading_wildcard());
        let exists = Predicate::new("a", Operator::Equals, vec![Value::Str(WildString::any())]);
        assert!(!exists.has_leading_wildcard());
    }

    #[test]
    fn test_expr_display() {
        let expr = Expr::And(vec![
            Expr::Predicate(Predicate::new("EventID", Operator::Equals, vec![Value::Int(4688)])),
            Expr::not(Expr::Predicate(Predicate::new(
                "User",
                Operator::Equals,
                vec![Value::Str(WildString::plain("SYSTEM"))],
            ))),
        ]);
        assert_eq!(
            expr.to_string(),
            "And(EventID equals [4688], Not(User equals [\"SYSTEM\"]))"
        );
        assert_eq!(expr.depth(), 3);
        assert_eq!(expr.predicates().len(), 2);
    }
}
