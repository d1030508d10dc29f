//! Query-language emitters.
//!
//! Each supported [`Target`] has one emitter implementing [`Emitter`], which
//! visits every IR node kind. Emitters are pure: the same expression always
//! serializes to the same text.

pub mod eql;
pub mod esql;
pub mod lucene;
pub mod splunk;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::{Result, TideError};
use crate::ir::{Aggregation, Expr, Operator, Predicate, StrPart, Value, WildString};
use crate::rule::RuleDocument;

pub use eql::EqlEmitter;
pub use esql::EsqlEmitter;
pub use lucene::LuceneEmitter;
pub use splunk::SplunkEmitter;

/// Target query language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    /// Lucene keyword query.
    Lucene,
    /// Splunk text search.
    Splunk,
    /// Elastic event query language.
    Eql,
    /// Elastic piped analytics (ES|QL).
    Esql,
}

impl Target {
    pub const ALL: [Target; 4] = [Target::Lucene, Target::Splunk, Target::Eql, Target::Esql];

    pub fn as_str(self) -> &'static str {
        match self {
            Target::Lucene => "lucene",
            Target::Splunk => "splunk",
            Target::Eql => "eql",
            Target::Esql => "esql",
        }
    }

    /// `(detection capability, performance)` ratings on a 0-10 scale.
    pub fn language_profile(self) -> (f64, f64) {
        match self {
            Target::Lucene => (6.0, 9.0),
            Target::Splunk => (8.0, 8.0),
            Target::Eql => (10.0, 7.0),
            Target::Esql => (9.0, 7.0),
        }
    }

    pub fn supports_aggregation(self) -> bool {
        matches!(self, Target::Splunk | Target::Esql)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Target {
    type Err = TideError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lucene" | "kuery" => Ok(Target::Lucene),
            "splunk" | "spl" => Ok(Target::Splunk),
            "eql" => Ok(Target::Eql),
            "esql" | "es|ql" => Ok(Target::Esql),
            other => Err(TideError::invalid("target", format!("unknown target '{other}'"))),
        }
    }
}

/// Visitor contract shared by all emitters.
pub trait Emitter {
    fn target(&self) -> Target;

    fn predicate(&self, predicate: &Predicate) -> Result<String>;

    fn and(&self, children: &[Expr]) -> Result<String>;

    fn or(&self, children: &[Expr]) -> Result<String>;

    fn not(&self, child: &Expr) -> Result<String>;

    fn aggregation(&self, aggregation: &Aggregation) -> Result<String>;

    fn expr(&self, expr: &Expr) -> Result<String> {
        match expr {
            Expr::Predicate(p) => self.predicate(p),
            Expr::And(children) => self.and(children),
            Expr::Or(children) => self.or(children),
            Expr::Not(child) => self.not(child),
            Expr::Aggregation(agg) => self.aggregation(agg),
        }
    }

    /// Complete query text, including any target preamble.
    fn emit(&self, expr: &Expr) -> Result<String> {
        self.expr(expr)
    }
}

/// Emit `expr` for `target` using the rule's log source and engine settings.
pub fn emit(target: Target, expr: &Expr, rule: &RuleDocument, config: &EngineConfig) -> Result<String> {
    match target {
        Target::Lucene => LuceneEmitter.emit(expr),
        Target::Splunk => SplunkEmitter::new(config.splunk_index.clone()).emit(expr),
        Target::Eql => EqlEmitter::new(config.eql_category(&rule.logsource)).emit(expr),
        Target::Esql => EsqlEmitter::new(config.esql_index.clone()).emit(expr),
    }
}

/// Parenthesisation policy for nested boolean nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Grouping {
    /// Group an Or nested in an And, and any compound operand of Not.
    OrInAnd,
    /// Group every nested compound node.
    Every,
    /// Group every nested compound node and every negated operand of Or.
    /// Needed where a bare `a OR NOT b` reads as `a AND NOT b`.
    EveryAndNegatedDisjuncts,
}

fn is_compound(expr: &Expr) -> bool {
    matches!(expr, Expr::And(_) | Expr::Or(_))
}

/// True for a Not node or a negated predicate.
pub(crate) fn is_negation(expr: &Expr) -> bool {
    match expr {
        Expr::Not(_) => true,
        Expr::Predicate(p) => p.negate,
        _ => false,
    }
}

/// Join already-visited children with `op`, adding parentheses per `grouping`.
pub(crate) fn join<E: Emitter + ?Sized>(
    emitter: &E,
    children: &[Expr],
    op: &str,
    conjunction: bool,
    grouping: Grouping,
) -> Result<String> {
    let mut parts = Vec::with_capacity(children.len());
    for child in children {
        if child.has_aggregation() {
            return Err(TideError::unsupported("nested aggregation", emitter.target()));
        }
        let text = emitter.expr(child)?;
        let wrap = match grouping {
            Grouping::Every => is_compound(child),
            Grouping::EveryAndNegatedDisjuncts => {
                is_compound(child) || (!conjunction && is_negation(child))
            }
            Grouping::OrInAnd => conjunction && matches!(child, Expr::Or(_)),
        };
        parts.push(if wrap { format!("({text})") } else { text });
    }
    Ok(parts.join(op))
}

/// Prefix `keyword` to the visited child, grouping compound operands.
pub(crate) fn negate<E: Emitter + ?Sized>(emitter: &E, child: &Expr, keyword: &str) -> Result<String> {
    if child.has_aggregation() {
        return Err(TideError::unsupported("nested aggregation", emitter.target()));
    }
    let text = emitter.expr(child)?;
    if is_compound(child) {
        Ok(format!("{keyword} ({text})"))
    } else {
        Ok(format!("{keyword} {text}"))
    }
}

/// Escape a string for a double-quoted literal with backslash escapes.
pub(crate) fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// True when a field name can be written bare (dotted identifiers only).
pub(crate) fn is_simple_field(field: &str) -> bool {
    let mut chars = field.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '@' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '@'))
        && !field.ends_with('.')
}

/// Backtick-quote a field name unless it is simple.
pub(crate) fn backtick_field(field: &str) -> String {
    if is_simple_field(field) {
        field.to_string()
    } else {
        format!("`{}`", field.replace('`', "``"))
    }
}

/// Apply the implicit wildcards of substring operators.
pub(crate) fn shape(value: &WildString, operator: Operator) -> WildString {
    match operator {
        Operator::Contains => value.wrapped(true, true),
        Operator::StartsWith => value.wrapped(false, true),
        Operator::EndsWith => value.wrapped(true, false),
        _ => value.clone(),
    }
}

/// True for the `field: *` existence form.
pub(crate) fn is_exists(predicate: &Predicate) -> bool {
    predicate.operator == Operator::Equals
        && matches!(predicate.values.as_slice(), [Value::Str(s)] if *s == WildString::any())
}

/// Render a wildcard string as a glob pattern using `*` and `?`, failing
/// when the target cannot express the string.
pub(crate) fn glob_pattern(value: &WildString, target: Target, single_char: bool) -> Result<String> {
    let mut out = String::new();
    for part in &value.parts {
        match part {
            StrPart::Plain(s) => {
                if s.contains(['*', '?']) {
                    return Err(TideError::unsupported("escaped wildcard", target));
                }
                out.push_str(s);
            }
            StrPart::AnyChars => out.push('*'),
            StrPart::OneChar if single_char => out.push('?'),
            StrPart::OneChar => {
                return Err(TideError::unsupported("single-character wildcard", target))
            }
        }
    }
    Ok(out)
}
