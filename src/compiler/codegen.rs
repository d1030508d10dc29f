//! Expression generation from parsed conditions.
//!
//! This module lowers a rule's condition ASTs and selections into the
//! closed [`Expr`] tree, resolving field names through a
//! [`ResolvedFieldSet`] and expanding quantifiers over selection names.

use std::collections::BTreeMap;

use glob::Pattern;

use super::field_mapping::ResolvedFieldSet;
use super::modifiers::ModifierSet;
use super::parser::{AggregationClause, ConditionAst, Quantifier, QuantifierTarget};
use crate::error::{Result, TideError};
use crate::ir::{Aggregation, Expr, Operator, Predicate, Value, WildString};
use crate::rule::{DetectionItem, RuleDocument, RuleValue, Selection};

/// Build the expression tree for a whole rule. Several conditions are
/// OR-combined.
pub(crate) fn generate_expression(document: &RuleDocument, fields: &ResolvedFieldSet) -> Result<Expr> {
    let generator = ExprGenerator {
        selections: &document.detection.selections,
        fields,
    };

    let mut branches = Vec::with_capacity(document.detection.conditions.len());
    for condition in &document.detection.conditions {
        let expr = generator.condition(&condition.ast)?;
        let expr = match &condition.aggregation {
            Some(clause) => generator.aggregation(expr, clause, document.detection.timeframe.clone()),
            None => expr,
        };
        branches.push(expr);
    }

    if branches.is_empty() {
        return Err(TideError::MissingField("detection.condition".to_string()));
    }
    Ok(Expr::or(branches))
}

struct ExprGenerator<'a> {
    selections: &'a BTreeMap<String, Selection>,
    fields: &'a ResolvedFieldSet,
}

impl ExprGenerator<'_> {
    fn condition(&self, ast: &ConditionAst) -> Result<Expr> {
        match ast {
            ConditionAst::Identifier(name) => self.selection(name),
            ConditionAst::And(left, right) => {
                let mut children = Vec::new();
                self.flatten(left, true, &mut children)?;
                self.flatten(right, true, &mut children)?;
                Ok(Expr::and(children))
            }
            ConditionAst::Or(left, right) => {
                let mut children = Vec::new();
                self.flatten(left, false, &mut children)?;
                self.flatten(right, false, &mut children)?;
                Ok(Expr::or(children))
            }
            ConditionAst::Not(operand) => Ok(Expr::not(self.condition(operand)?)),
            ConditionAst::Quantified(quantifier, target) => self.quantified(*quantifier, target),
            ConditionAst::Empty => Err(TideError::syntax("", "empty condition")),
        }
    }

    /// Collapse chains of the same binary operator into one n-ary node.
    /// The parser builds chains left-deep, so the left spine is walked
    /// iteratively.
    fn flatten(&self, ast: &ConditionAst, conjunction: bool, out: &mut Vec<Expr>) -> Result<()> {
        let mut rights = Vec::new();
        let mut node = ast;
        while let (ConditionAst::And(left, right), true) | (ConditionAst::Or(left, right), false) =
            (node, conjunction)
        {
            rights.push(right.as_ref());
            node = left.as_ref();
        }
        out.push(self.condition(node)?);
        for right in rights.into_iter().rev() {
            self.flatten(right, conjunction, out)?;
        }
        Ok(())
    }

    fn quantified(&self, quantifier: Quantifier, target: &QuantifierTarget) -> Result<Expr> {
        let names: Vec<&String> = match target {
            QuantifierTarget::Them => self
                .selections
                .keys()
                .filter(|name| !name.starts_with('_'))
                .collect(),
            QuantifierTarget::Pattern(pattern) => {
                let glob = Pattern::new(pattern)
                    .map_err(|e| TideError::syntax(pattern.clone(), e.msg))?;
                self.selections
                    .keys()
                    .filter(|name| glob.matches(name))
                    .collect()
            }
        };

        if names.is_empty() {
            let pattern = match target {
                QuantifierTarget::Them => "them".to_string(),
                QuantifierTarget::Pattern(p) => p.clone(),
            };
            return Err(TideError::EmptyPatternMatch(pattern));
        }

        let branches = names
            .into_iter()
            .map(|name| self.selection(name))
            .collect::<Result<Vec<_>>>()?;

        Ok(match quantifier {
            Quantifier::Any => Expr::or(branches),
            Quantifier::All => Expr::and(branches),
        })
    }

    fn selection(&self, name: &str) -> Result<Expr> {
        let selection = self
            .selections
            .get(name)
            .ok_or_else(|| TideError::UndefinedSelection(name.to_string()))?;

        match selection {
            Selection::Fields(items) => self.item_group(items),
            Selection::AnyOf(groups) => {
                let branches = groups
                    .iter()
                    .map(|items| self.item_group(items))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Expr::or(branches))
            }
            Selection::Keywords(values) => {
                let branches = values
                    .iter()
                    .map(|v| keyword(name, v))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Expr::or(branches))
            }
        }
    }

    fn item_group(&self, items: &[DetectionItem]) -> Result<Expr> {
        let children = items
            .iter()
            .map(|item| self.item(item))
            .collect::<Result<Vec<_>>>()?;
        Ok(Expr::and(children))
    }

    fn item(&self, item: &DetectionItem) -> Result<Expr> {
        let modifiers = ModifierSet::parse(&item.field, &item.modifiers)?;

        if item.field.is_empty() {
            let branches = item
                .values
                .iter()
                .map(|v| keyword(&item.field, v))
                .collect::<Result<Vec<_>>>()?;
            return Ok(if modifiers.all {
                Expr::and(branches)
            } else {
                Expr::or(branches)
            });
        }

        let target = self.fields.target_name(&item.field);

        if modifiers.exists {
            return match item.values.as_slice() {
                [RuleValue::Bool(true)] => Ok(Expr::Predicate(exists(target))),
                [RuleValue::Bool(false)] => Ok(Expr::Predicate(exists(target).negated())),
                _ => Err(TideError::invalid(&item.field, "'exists' takes true or false")),
            };
        }

        let mut branches = Vec::new();
        let mut groups = Vec::new();
        for value in &item.values {
            if *value == RuleValue::Null {
                branches.push(Expr::Predicate(exists(target).negated()));
            } else {
                groups.push(modifiers.expand(&item.field, value)?);
            }
        }

        let operator = modifiers.operator();
        let case_sensitive = modifiers.case_sensitive();
        let build = |values: Vec<Value>| -> Expr {
            if operator == Operator::Equals && values.len() > 1 {
                return Expr::Predicate(
                    Predicate::new(target, Operator::InList, values).cased(case_sensitive),
                );
            }
            Expr::or(
                values
                    .into_iter()
                    .map(|v| Expr::Predicate(Predicate::new(target, operator, vec![v]).cased(case_sensitive)))
                    .collect(),
            )
        };

        if !groups.is_empty() {
            if modifiers.all {
                let children = groups.into_iter().map(build).collect();
                branches.push(Expr::and(children));
            } else {
                branches.push(build(groups.into_iter().flatten().collect()));
            }
        }

        Ok(Expr::or(branches))
    }

    fn aggregation(&self, inner: Expr, clause: &AggregationClause, time_window: Option<String>) -> Expr {
        let field = clause
            .function
            .field()
            .map(|f| self.fields.target_name(f).to_string());
        Expr::Aggregation(Aggregation {
            inner: Box::new(inner),
            function: clause.function.with_field(field),
            group_by: clause
                .group_by
                .iter()
                .map(|f| self.fields.target_name(f).to_string())
                .collect(),
            comparator: clause.comparator,
            threshold: clause.threshold,
            time_window,
        })
    }
}

fn exists(field: &str) -> Predicate {
    Predicate::new(field, Operator::Equals, vec![Value::Str(WildString::any())])
}

fn keyword(context: &str, value: &RuleValue) -> Result<Expr> {
    let text = value
        .as_text()
        .ok_or_else(|| TideError::invalid(context, "keyword values must not be null"))?;
    Ok(Expr::Predicate(Predicate::keyword(vec![Value::Str(
        WildString::parse(&text),
    )])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::document::parse_rule;
    use crate::compiler::field_mapping::{FieldKind, FieldMappingPipeline, LogSourceMatch};
    use crate::ir::Comparator;

    fn compile(yaml: &str) -> Result<Expr> {
        let rule = parse_rule(yaml)?;
        let fields = FieldMappingPipeline::default().resolve(&rule, &rule.logsource);
        generate_expression(&rule, &fields)
    }

    fn rule(detection: &str) -> String {
        format!("title: t\nlogsource: {{product: windows}}\ndetection:\n{detection}")
    }

    fn pred(field: &str, op: Operator, values: Vec<Value>) -> Expr {
        Expr::Predicate(Predicate::new(field, op, values))
    }

    fn s(text: &str) -> Value {
        Value::Str(WildString::parse(text))
    }

    #[test]
    fn test_selection_and_not() {
        let expr = compile(&rule(
            "  selection1: {EventID: 4688}\n  selection2: {User: SYSTEM}\n  condition: selection1 and not selection2\n",
        ))
        .unwrap();
        assert_eq!(
            expr,
            Expr::And(vec![
                pred("EventID", Operator::Equals, vec![Value::Int(4688)]),
                Expr::not(pred("User", Operator::Equals, vec![s("SYSTEM")])),
            ])
        );
    }

    #[test]
    fn test_fields_and_lists() {
        let expr = compile(&rule(
            "  sel:\n    Image|endswith: ['\\cmd.exe', '\\powershell.exe']\n    User: [a, b]\n  condition: sel\n",
        ))
        .unwrap();
        assert_eq!(
            expr,
            Expr::And(vec![
                Expr::Or(vec![
                    pred("Image", Operator::EndsWith, vec![s("\\cmd.exe")]),
                    pred("Image", Operator::EndsWith, vec![s("\\powershell.exe")]),
                ]),
                pred("User", Operator::InList, vec![s("a"), s("b")]),
            ])
        );
    }

    #[test]
    fn test_contains_all() {
        let expr = compile(&rule(
            "  sel:\n    CommandLine|contains|all: [' -w hidden', ' -enc ']\n  condition: sel\n",
        ))
        .unwrap();
        assert!(matches!(expr, Expr::And(ref c) if c.len() == 2));
    }

    #[test]
    fn test_list_of_maps_is_or() {
        let expr = compile(&rule(
            "  sel:\n    - {a: 1, b: 2}\n    - {c: 3}\n  condition: sel\n",
        ))
        .unwrap();
        match expr {
            Expr::Or(children) => {
                assert_eq!(children.len(), 2);
                assert!(matches!(children[0], Expr::And(ref c) if c.len() == 2));
            }
            other => panic!("Expected Or, got {other}"),
        }
    }

    #[test]
    fn test_quantifier_expansion() {
        let yaml = rule(
            "  selection_a: {a: 1}\n  selection_b: {b: 2}\n  selection_c: {c: 3}\n  filter: {d: 4}\n  condition: 1 of selection_*\n",
        );
        match compile(&yaml).unwrap() {
            Expr::Or(children) => {
                assert_eq!(children.len(), 3);
                assert_eq!(children[0], pred("a", Operator::Equals, vec![Value::Int(1)]));
            }
            other => panic!("Expected Or, got {other}"),
        }

        let all = rule("  sel_a: {a: 1}\n  sel_b: {b: 2}\n  condition: all of sel_*\n");
        assert!(matches!(compile(&all).unwrap(), Expr::And(ref c) if c.len() == 2));
    }

    #[test]
    fn test_single_match_collapses() {
        let yaml = rule("  selection_a: {a: 1}\n  condition: 1 of selection_*\n");
        assert_eq!(
            compile(&yaml).unwrap(),
            pred("a", Operator::Equals, vec![Value::Int(1)])
        );
    }

    #[test]
    fn test_empty_pattern_match() {
        let yaml = rule("  selection: {a: 1}\n  condition: 1 of filter_*\n");
        assert_eq!(
            compile(&yaml).unwrap_err(),
            TideError::EmptyPatternMatch("filter_*".to_string())
        );

        let hidden = rule("  _private: {a: 1}\n  condition: all of them\n");
        assert_eq!(
            compile(&hidden).unwrap_err(),
            TideError::EmptyPatternMatch("them".to_string())
        );
    }

    #[test]
    fn test_them_skips_underscore() {
        let yaml = rule("  sel: {a: 1}\n  _helper: {b: 2}\n  condition: 1 of them\n");
        assert_eq!(
            compile(&yaml).unwrap(),
            pred("a", Operator::Equals, vec![Value::Int(1)])
        );
    }

    #[test]
    fn test_unsupported_modifier() {
        let yaml = rule("  sel:\n    CommandLine|utf16le: x\n  condition: sel\n");
        assert_eq!(
            compile(&yaml).unwrap_err(),
            TideError::UnsupportedModifier("utf16le".to_string())
        );
    }

    #[test]
    fn test_null_and_exists() {
        let yaml = rule(
            "  sel:\n    a: null\n    b|exists: true\n    c|exists: false\n  condition: sel\n",
        );
        let expr = compile(&yaml).unwrap();
        let predicates = expr.predicates();
        assert_eq!(predicates.len(), 3);
        assert!(predicates[0].negate);
        assert!(!predicates[1].negate);
        assert!(predicates[2].negate);
        assert_eq!(predicates[1].values, vec![Value::Str(WildString::any())]);
    }

    #[test]
    fn test_keywords() {
        let yaml = rule("  keywords: ['mimikatz', 'sekurlsa']\n  condition: keywords\n");
        match compile(&yaml).unwrap() {
            Expr::Or(children) => {
                assert_eq!(children.len(), 2);
                assert!(matches!(&children[0], Expr::Predicate(p) if p.field.is_none()));
            }
            other => panic!("Expected Or, got {other}"),
        }
    }

    #[test]
    fn test_nested_boolean_flattening() {
        let yaml = rule("  a: {x: 1}\n  b: {y: 2}\n  c: {z: 3}\n  condition: a or b or c\n");
        assert!(matches!(compile(&yaml).unwrap(), Expr::Or(ref c) if c.len() == 3));
    }

    #[test]
    fn test_field_mapping_applied() {
        let rule_doc = parse_rule(&rule(
            "  sel: {Image|endswith: '\\cmd.exe'}\n  condition: sel | count() by User > 3\n",
        ))
        .unwrap();
        let pipeline = FieldMappingPipeline::new("ecs")
            .with_entry(LogSourceMatch::default(), "Image", "process.executable", FieldKind::Keyword)
            .with_entry(LogSourceMatch::default(), "User", "user.name", FieldKind::Keyword);
        let fields = pipeline.resolve(&rule_doc, &rule_doc.logsource);

        match generate_expression(&rule_doc, &fields).unwrap() {
            Expr::Aggregation(agg) => {
                assert_eq!(agg.group_by, vec!["user.name"]);
                assert_eq!(agg.comparator, Comparator::Gt);
                assert_eq!(agg.threshold, 3);
                assert_eq!(
                    agg.inner.predicates()[0].field.as_deref(),
                    Some("process.executable")
                );
            }
            other => panic!("Expected aggregation, got {other}"),
        }
    }

    #[test]
    fn test_cased_flag() {
        let yaml = rule("  sel: {User|cased: Admin}\n  condition: sel\n");
        assert!(compile(&yaml).unwrap().predicates()[0].case_sensitive);
    }
}
