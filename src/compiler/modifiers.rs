//! Field modifier handling.
//!
//! Modifiers on a selection key (`CommandLine|contains|all`) select the
//! predicate operator and transform the listed values before they reach the
//! IR. Encoding modifiers are applied at compile time so emitters only ever
//! see literal text.

use base64::{engine::general_purpose, Engine as _};
use regex::Regex;

use crate::error::{Result, TideError};
use crate::ir::{Comparator, Operator, Value, WildString};
use crate::rule::RuleValue;

/// `-`, `/`, en dash, em dash and horizontal bar.
const WINDASH_CHARS: [char; 5] = ['-', '/', '\u{2013}', '\u{2014}', '\u{2015}'];

/// 5^6 variants per value is already more than any backend accepts in one clause.
const MAX_WINDASH_DASHES: usize = 6;

/// Parsed modifier chain of one detection item.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModifierSet {
    pub operator: Option<Operator>,
    pub all: bool,
    pub cased: bool,
    pub base64: bool,
    pub base64offset: bool,
    pub windash: bool,
    pub exists: bool,
    pub regex_insensitive: bool,
    pub regex_multiline: bool,
    pub regex_dotall: bool,
}

impl ModifierSet {
    /// Parse a modifier chain. Unknown modifiers fail with
    /// [`TideError::UnsupportedModifier`] naming the modifier.
    pub fn parse(field: &str, modifiers: &[String]) -> Result<Self> {
        let mut set = ModifierSet::default();

        for modifier in modifiers {
            let operator = match modifier.to_ascii_lowercase().as_str() {
                "contains" => Some(Operator::Contains),
                "startswith" => Some(Operator::StartsWith),
                "endswith" => Some(Operator::EndsWith),
                "re" => Some(Operator::Regex),
                "gt" => Some(Operator::Range(Comparator::Gt)),
                "gte" => Some(Operator::Range(Comparator::Gte)),
                "lt" => Some(Operator::Range(Comparator::Lt)),
                "lte" => Some(Operator::Range(Comparator::Lte)),
                "all" => {
                    set.all = true;
                    None
                }
                "cased" => {
                    set.cased = true;
                    None
                }
                "base64" => {
                    set.base64 = true;
                    None
                }
                "base64offset" => {
                    set.base64offset = true;
                    None
                }
                "windash" => {
                    set.windash = true;
                    None
                }
                "exists" => {
                    set.exists = true;
                    None
                }
                "i" => {
                    set.regex_insensitive = true;
                    None
                }
                "m" => {
                    set.regex_multiline = true;
                    None
                }
                "s" => {
                    set.regex_dotall = true;
                    None
                }
                _ => return Err(TideError::UnsupportedModifier(modifier.clone())),
            };

            if let Some(op) = operator {
                if let Some(previous) = set.operator {
                    return Err(TideError::invalid(
                        field,
                        format!("conflicting modifiers '{}' and '{modifier}'", previous.name()),
                    ));
                }
                set.operator = Some(op);
            }
        }

        let flags = set.regex_insensitive || set.regex_multiline || set.regex_dotall;
        if flags && set.operator != Some(Operator::Regex) {
            return Err(TideError::invalid(field, "regex flags require the 're' modifier"));
        }
        if set.base64 && set.base64offset {
            return Err(TideError::invalid(field, "'base64' and 'base64offset' are exclusive"));
        }

        Ok(set)
    }

    /// Effective operator; `base64offset` implies a substring match.
    pub fn operator(&self) -> Operator {
        match self.operator {
            Some(op) => op,
            None if self.base64offset => Operator::Contains,
            None => Operator::Equals,
        }
    }

    /// Case sensitivity flag for the resulting predicates. Regular
    /// expressions are case-sensitive unless `|i` is present.
    pub fn case_sensitive(&self) -> bool {
        match self.operator() {
            Operator::Regex => !self.regex_insensitive,
            _ => self.cased,
        }
    }

    /// Transform one rule value into its IR variants. Encoding modifiers may
    /// produce several alternatives for a single input value.
    pub fn expand(&self, field: &str, value: &RuleValue) -> Result<Vec<Value>> {
        let operator = self.operator();

        if operator == Operator::Regex {
            let pattern = value
                .as_text()
                .ok_or_else(|| TideError::invalid(field, "regular expression must not be null"))?;
            return Ok(vec![Value::Pattern(self.regex_source(field, &pattern)?)]);
        }

        if let Operator::Range(_) = operator {
            return match value {
                RuleValue::Int(i) => Ok(vec![Value::Int(*i)]),
                RuleValue::Float(f) => Ok(vec![Value::Float(*f)]),
                RuleValue::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(|f| vec![Value::Float(f)])
                    .map_err(|_| TideError::invalid(field, format!("'{s}' is not numeric"))),
                _ => Err(TideError::invalid(field, "range comparisons need a number")),
            };
        }

        if self.base64 || self.base64offset || self.windash {
            let text = value
                .as_text()
                .ok_or_else(|| TideError::invalid(field, "encoding modifiers need a value"))?;
            return self.encode(field, &text);
        }

        Ok(vec![match value {
            RuleValue::String(s) => Value::Str(WildString::parse(s)),
            RuleValue::Int(i) if operator == Operator::Equals => Value::Int(*i),
            RuleValue::Float(f) if operator == Operator::Equals => Value::Float(*f),
            RuleValue::Bool(b) if operator == Operator::Equals => Value::Bool(*b),
            RuleValue::Null => {
                return Err(TideError::invalid(field, "null needs a plain field match"))
            }
            other => Value::Str(WildString::plain(&other.as_text().unwrap_or_default())),
        }])
    }

    fn encode(&self, field: &str, text: &str) -> Result<Vec<Value>> {
        let variants = if self.windash {
            expand_windash(field, text)?
                .iter()
                .map(|v| WildString::parse(v))
                .collect()
        } else {
            vec![WildString::parse(text)]
        };

        if !(self.base64 || self.base64offset) {
            return Ok(variants.into_iter().map(Value::Str).collect());
        }

        let mut out = Vec::new();
        for variant in variants {
            if variant.has_wildcards() {
                return Err(TideError::invalid(field, "wildcards cannot be base64 encoded"));
            }
            let plain = variant.literal();
            if self.base64offset {
                out.extend(
                    base64_offset_patterns(plain.as_bytes())
                        .into_iter()
                        .map(|p| Value::Str(WildString::plain(&p))),
                );
            } else {
                let encoded = general_purpose::STANDARD.encode(plain.as_bytes());
                out.push(Value::Str(WildString::plain(&encoded)));
            }
        }
        Ok(out)
    }

    /// Validate the pattern and fold `m`/`s` flags into an inline group.
    fn regex_source(&self, field: &str, pattern: &str) -> Result<String> {
        let mut flags = String::new();
        if self.regex_multiline {
            flags.push('m');
        }
        if self.regex_dotall {
            flags.push('s');
        }
        let source = if flags.is_empty() {
            pattern.to_string()
        } else {
            format!("(?{flags}){pattern}")
        };

        Regex::new(&source)
            .map_err(|e| TideError::invalid(field, format!("invalid regular expression: {e}")))?;
        Ok(source)
    }
}

/// Base64 encodings of `value` at the three byte alignments, trimmed to the
/// characters that do not depend on surrounding data.
pub(crate) fn base64_offset_patterns(value: &[u8]) -> Vec<String> {
    const START: [usize; 3] = [0, 2, 3];
    const END_TRIM: [usize; 3] = [0, 3, 2];

    let mut patterns = Vec::with_capacity(3);
    for offset in 0..3usize {
        let mut padded = vec![b' '; offset];
        padded.extend_from_slice(value);

        let encoded = general_purpose::STANDARD.encode(&padded);
        let start = START[offset];
        let end = encoded
            .len()
            .saturating_sub(END_TRIM[(value.len() + offset) % 3]);

        if start < end {
            patterns.push(encoded[start..end].to_string());
        }
    }

    patterns
}

/// Every combination of dash replacements in `input`.
pub(crate) fn expand_windash(field: &str, input: &str) -> Result<Vec<String>> {
    let dash_positions: Vec<usize> = input
        .char_indices()
        .filter(|(_, c)| *c == '-' || *c == '/')
        .map(|(i, _)| i)
        .collect();

    if dash_positions.is_empty() {
        return Ok(vec![input.to_string()]);
    }

    let n = dash_positions.len();
    if n > MAX_WINDASH_DASHES {
        return Err(TideError::invalid(
            field,
            format!("windash value has {n} dashes, at most {MAX_WINDASH_DASHES} are supported"),
        ));
    }

    let total = WINDASH_CHARS.len().pow(n as u32);
    let mut variants = Vec::with_capacity(total);
    for combo in 0..total {
        let mut variant = input.to_string();
        let mut idx = combo;
        for &pos in dash_positions.iter().rev() {
            let replacement = WINDASH_CHARS[idx % WINDASH_CHARS.len()];
            variant.replace_range(pos..pos + 1, replacement.encode_utf8(&mut [0u8; 4]));
            idx /= WINDASH_CHARS.len();
        }
        variants.push(variant);
    }

    Ok(variants)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mods(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_operator_modifiers() {
        let set = ModifierSet::parse("f", &mods(&["contains", "all"])).unwrap();
        assert_eq!(set.operator(), Operator::Contains);
        assert!(set.all);

        let set = ModifierSet::parse("f", &[]).unwrap();
        assert_eq!(set.operator(), Operator::Equals);

        let set = ModifierSet::parse("f", &mods(&["gte"])).unwrap();
        assert_eq!(set.operator(), Operator::Range(Comparator::Gte));
    }

    #[test]
    fn test_unknown_modifier_named() {
        let err = ModifierSet::parse("f", &mods(&["contains", "utf16"])).unwrap_err();
        assert_eq!(err, TideError::UnsupportedModifier("utf16".to_string()));
    }

    #[test]
    fn test_conflicting_operators() {
        let err = ModifierSet::parse("f", &mods(&["contains", "endswith"])).unwrap_err();
        assert!(matches!(err, TideError::InvalidValue { .. }));
    }

    #[test]
    fn test_regex_flags() {
        let set = ModifierSet::parse("f", &mods(&["re", "i", "m"])).unwrap();
        assert!(!set.case_sensitive());
        let values = set.expand("f", &RuleValue::String("^a.b$".to_string())).unwrap();
        assert_eq!(values, vec![Value::Pattern("(?m)^a.b$".to_string())]);

        let plain = ModifierSet::parse("f", &mods(&["re"])).unwrap();
        assert!(plain.case_sensitive());

        assert!(ModifierSet::parse("f", &mods(&["i"])).is_err());
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let set = ModifierSet::parse("f", &mods(&["re"])).unwrap();
        assert!(set.expand("f", &RuleValue::String("(unclosed".to_string())).is_err());
    }

    #[test]
    fn test_base64_encoding() {
        let set = ModifierSet::parse("f", &mods(&["base64"])).unwrap();
        let values = set.expand("f", &RuleValue::String("hello".to_string())).unwrap();
        assert_eq!(values, vec![Value::Str(WildString::plain("aGVsbG8="))]);
    }

    #[test]
    fn test_base64offset_patterns() {
        let set = ModifierSet::parse("f", &mods(&["base64offset", "contains"])).unwrap();
        assert_eq!(set.operator(), Operator::Contains);
        let values = set
            .expand("f", &RuleValue::String("http://".to_string()))
            .unwrap();
        let texts: Vec<String> = values
            .iter()
            .map(|v| match v {
                Value::Str(s) => s.literal(),
                other => panic!("unexpected value {other:?}"),
            })
            .collect();
        assert_eq!(texts, vec!["aHR0cDovL", "h0dHA6Ly", "odHRwOi8v"]);
    }

    #[test]
    fn test_windash_expansion() {
        let variants = expand_windash("f", " -enc ").unwrap();
        assert_eq!(variants.len(), 5);
        assert!(variants.contains(&" /enc ".to_string()));
        assert!(variants.contains(&" \u{2014}enc ".to_string()));

        let none = expand_windash("f", "plain").unwrap();
        assert_eq!(none, vec!["plain"]);

        assert!(expand_windash("f", "-a-b-c-d-e-f-g").is_err());
    }

    #[test]
    fn test_range_values_numeric() {
        let set = ModifierSet::parse("f", &mods(&["gt"])).unwrap();
        assert_eq!(set.expand("f", &RuleValue::Int(5)).unwrap(), vec![Value::Int(5)]);
        assert_eq!(
            set.expand("f", &RuleValue::String("2.5".to_string())).unwrap(),
            vec![Value::Float(2.5)]
        );
        assert!(set.expand("f", &RuleValue::String("many".to_string())).is_err());
    }

    #[test]
    fn test_numbers_become_text_for_substring_ops() {
        let set = ModifierSet::parse("f", &mods(&["contains"])).unwrap();
        assert_eq!(
            set.expand("f", &RuleValue::Int(42)).unwrap(),
            vec![Value::Str(WildString::plain("42"))]
        );
    }
}
