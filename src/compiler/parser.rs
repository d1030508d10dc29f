//! Condition expression parsing.
//!
//! This module provides tokenization and parsing of rule condition strings
//! into a [`ConditionAst`], plus the trailing `| count() by X > N` aggregation
//! clause.

use crate::error::{Result, TideError};
use crate::ir::{AggregationFunction, Comparator};
use std::collections::BTreeSet;

/// Tokens in a condition expression.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Identifier(String),
    Wildcard(String),
    And,
    Or,
    Not,
    LeftParen,
    RightParen,
    Of,
    Them,
    All,
    Any,
    Number(u64),
    Pipe,
    Comma,
    By,
    Compare(Comparator),
}

impl Token {
    fn text(&self) -> String {
        match self {
            Token::Identifier(s) | Token::Wildcard(s) => s.clone(),
            Token::And => "and".to_string(),
            Token::Or => "or".to_string(),
            Token::Not => "not".to_string(),
            Token::LeftParen => "(".to_string(),
            Token::RightParen => ")".to_string(),
            Token::Of => "of".to_string(),
            Token::Them => "them".to_string(),
            Token::All => "all".to_string(),
            Token::Any => "any".to_string(),
            Token::Number(n) => n.to_string(),
            Token::Pipe => "|".to_string(),
            Token::Comma => ",".to_string(),
            Token::By => "by".to_string(),
            Token::Compare(c) => c.symbol().to_string(),
        }
    }
}

/// Quantifier of an `N of X` expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantifier {
    Any,
    All,
}

/// What a quantifier ranges over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuantifierTarget {
    /// Every selection whose name does not start with `_`.
    Them,
    /// A selection name or a glob over selection names.
    Pattern(String),
}

/// AST for condition expressions.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ConditionAst {
    Identifier(String),
    And(Box<ConditionAst>, Box<ConditionAst>),
    Or(Box<ConditionAst>, Box<ConditionAst>),
    Not(Box<ConditionAst>),
    Quantified(Quantifier, QuantifierTarget),
    /// Placeholder for a condition that has not been parsed.
    #[default]
    Empty,
}

/// Aggregation clause following the boolean part of a condition.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationClause {
    pub function: AggregationFunction,
    pub group_by: Vec<String>,
    pub comparator: Comparator,
    pub threshold: i64,
}

impl AggregationClause {
    /// Fields referenced by the clause.
    pub fn fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = self.function.field().map(str::to_string).into_iter().collect();
        fields.extend(self.group_by.iter().cloned());
        fields
    }
}

/// Deepest accepted nesting of parentheses and `not`.
pub const MAX_NESTING: usize = 64;

/// Longest accepted condition, in tokens.
pub const MAX_CONDITION_TOKENS: usize = 4096;

/// Recursive descent parser for conditions.
pub(crate) struct ConditionParser<'a> {
    tokens: &'a [Token],
    position: usize,
    depth: usize,
    selection_names: &'a BTreeSet<String>,
}

impl<'a> ConditionParser<'a> {
    pub(crate) fn new(tokens: &'a [Token], selection_names: &'a BTreeSet<String>) -> Self {
        Self {
            tokens,
            position: 0,
            depth: 0,
            selection_names,
        }
    }

    fn current_token(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.current_token().cloned();
        self.position += 1;
        token
    }

    fn unexpected(&self, message: &str) -> TideError {
        let token = self
            .current_token()
            .map(Token::text)
            .unwrap_or_else(|| "<end>".to_string());
        TideError::syntax(token, message)
    }

    /// Parse OR expressions (lowest precedence).
    pub(crate) fn parse_or_expression(&mut self) -> Result<ConditionAst> {
        let mut left = self.parse_and_expression()?;

        while let Some(Token::Or) = self.current_token() {
            self.advance();
            let right = self.parse_and_expression()?;
            left = ConditionAst::Or(Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    /// Parse AND expressions (medium precedence).
    fn parse_and_expression(&mut self) -> Result<ConditionAst> {
        let mut left = self.parse_not_expression()?;

        while let Some(Token::And) = self.current_token() {
            self.advance();
            let right = self.parse_not_expression()?;
            left = ConditionAst::And(Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    /// Parse NOT expressions (highest precedence). Every `not` and every
    /// parenthesised group passes through here, so nesting is bounded here.
    fn parse_not_expression(&mut self) -> Result<ConditionAst> {
        if self.depth >= MAX_NESTING {
            return Err(self.unexpected("condition nested too deeply"));
        }
        self.depth += 1;
        let result = if let Some(Token::Not) = self.current_token() {
            self.advance();
            self.parse_not_expression().map(|operand| ConditionAst::Not(Box::new(operand)))
        } else {
            self.parse_primary()
        };
        self.depth -= 1;
        result
    }

    fn parse_primary(&mut self) -> Result<ConditionAst> {
        match self.current_token() {
            Some(Token::LeftParen) => {
                self.advance();
                let expr = self.parse_or_expression()?;
                if let Some(Token::RightParen) = self.current_token() {
                    self.advance();
                    Ok(expr)
                } else {
                    Err(self.unexpected("expected closing parenthesis"))
                }
            }
            Some(Token::Identifier(name)) => {
                let name = name.clone();
                if self.selection_names.contains(&name) {
                    self.advance();
                    Ok(ConditionAst::Identifier(name))
                } else {
                    Err(TideError::UndefinedSelection(name))
                }
            }
            Some(Token::Number(n)) => {
                if *n != 1 {
                    return Err(self.unexpected("only '1 of' quantifiers are supported"));
                }
                self.advance();
                self.parse_quantifier(Quantifier::Any)
            }
            Some(Token::Any) => {
                self.advance();
                self.parse_quantifier(Quantifier::Any)
            }
            Some(Token::All) => {
                self.advance();
                self.parse_quantifier(Quantifier::All)
            }
            Some(Token::Wildcard(_)) => Err(self.unexpected("wildcard patterns need a quantifier")),
            _ => Err(self.unexpected("unexpected token in condition")),
        }
    }

    fn parse_quantifier(&mut self, quantifier: Quantifier) -> Result<ConditionAst> {
        if self.current_token() != Some(&Token::Of) {
            return Err(self.unexpected("expected 'of' after quantifier"));
        }
        self.advance();

        let target = match self.current_token() {
            Some(Token::Them) => QuantifierTarget::Them,
            Some(Token::Wildcard(pattern)) => QuantifierTarget::Pattern(pattern.clone()),
            Some(Token::Identifier(name)) => {
                if !self.selection_names.contains(name) {
                    return Err(TideError::UndefinedSelection(name.clone()));
                }
                QuantifierTarget::Pattern(name.clone())
            }
            _ => return Err(self.unexpected("expected 'them' or pattern after 'of'")),
        };
        self.advance();
        Ok(ConditionAst::Quantified(quantifier, target))
    }

    /// Parse `func([field]) [by f1, f2] <op> N` after the pipe.
    fn parse_aggregation(&mut self) -> Result<AggregationClause> {
        let name = match self.advance() {
            Some(Token::Identifier(name)) => name.to_ascii_lowercase(),
            Some(other) => return Err(TideError::syntax(other.text(), "expected aggregation function")),
            None => return Err(TideError::syntax("|", "expected aggregation function")),
        };

        if name == "near" {
            return Err(TideError::unsupported("near aggregation", "ir"));
        }

        if self.advance() != Some(Token::LeftParen) {
            return Err(TideError::syntax(name, "expected '(' after aggregation function"));
        }
        let field = match self.current_token() {
            Some(Token::Identifier(f)) => {
                let f = f.clone();
                self.advance();
                Some(f)
            }
            _ => None,
        };
        if self.current_token() != Some(&Token::RightParen) {
            return Err(self.unexpected("expected ')' to close aggregation function"));
        }
        self.advance();

        let function = match (name.as_str(), field) {
            ("count", field) => AggregationFunction::Count(field),
            ("min", Some(f)) => AggregationFunction::Min(f),
            ("max", Some(f)) => AggregationFunction::Max(f),
            ("avg", Some(f)) => AggregationFunction::Avg(f),
            ("sum", Some(f)) => AggregationFunction::Sum(f),
            (other, _) => {
                return Err(TideError::syntax(
                    other,
                    "unknown aggregation function or missing field",
                ))
            }
        };

        let mut group_by = Vec::new();
        if self.current_token() == Some(&Token::By) {
            self.advance();
            loop {
                match self.advance() {
                    Some(Token::Identifier(f)) => group_by.push(f),
                    _ => return Err(TideError::syntax("by", "expected group-by field")),
                }
                if self.current_token() == Some(&Token::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }

        let comparator = match self.advance() {
            Some(Token::Compare(c)) => c,
            _ => return Err(TideError::syntax(function.name(), "expected comparison operator")),
        };
        let threshold = match self.advance() {
            Some(Token::Number(n)) => i64::try_from(n)
                .map_err(|_| TideError::syntax(n.to_string(), "threshold out of range"))?,
            _ => return Err(TideError::syntax(comparator.symbol(), "expected numeric threshold")),
        };

        Ok(AggregationClause {
            function,
            group_by,
            comparator,
            threshold,
        })
    }
}

/// Tokenize a condition string.
pub(crate) fn tokenize_condition(condition: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = condition.chars().peekable();

    while let Some(&ch) = chars.peek() {
        match ch {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                tokens.push(Token::LeftParen);
                chars.next();
            }
            ')' => {
                tokens.push(Token::RightParen);
                chars.next();
            }
            '|' => {
                tokens.push(Token::Pipe);
                chars.next();
            }
            ',' => {
                tokens.push(Token::Comma);
                chars.next();
            }
            '>' | '<' | '=' => {
                let mut symbol = String::new();
                symbol.push(ch);
                chars.next();
                if chars.peek() == Some(&'=') {
                    symbol.push('=');
                    chars.next();
                }
                let comparator = Comparator::parse(&symbol)
                    .ok_or_else(|| TideError::syntax(symbol.clone(), "unknown comparison operator"))?;
                tokens.push(Token::Compare(comparator));
            }
            '0'..='9' => {
                let mut number_str = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_digit() {
                        number_str.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let number = number_str
                    .parse::<u64>()
                    .map_err(|_| TideError::syntax(number_str.clone(), "number out of range"))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() || c == '_' || c == '*' || c == '?' => {
                let mut identifier = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_alphanumeric() || matches!(ch, '_' | '*' | '?' | '.' | '-') {
                        identifier.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }

                match identifier.to_ascii_lowercase().as_str() {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    "not" => tokens.push(Token::Not),
                    "of" => tokens.push(Token::Of),
                    "them" => tokens.push(Token::Them),
                    "all" => tokens.push(Token::All),
                    "any" => tokens.push(Token::Any),
                    "by" => tokens.push(Token::By),
                    _ => {
                        if identifier.contains(['*', '?']) {
                            tokens.push(Token::Wildcard(identifier));
                        } else {
                            tokens.push(Token::Identifier(identifier));
                        }
                    }
                }
            }
            _ => {
                return Err(TideError::syntax(
                    ch.to_string(),
                    "unexpected character in condition",
                ));
            }
        }
    }

    Ok(tokens)
}

/// Parse a full condition string into its boolean AST and optional
/// aggregation clause, validating selection references.
pub fn parse_condition(
    condition: &str,
    selection_names: &BTreeSet<String>,
) -> Result<(ConditionAst, Option<AggregationClause>)> {
    let tokens = tokenize_condition(condition)?;
    if tokens.is_empty() {
        return Err(TideError::syntax("", "empty condition"));
    }
    if tokens.len() > MAX_CONDITION_TOKENS {
        return Err(TideError::syntax(
            tokens[MAX_CONDITION_TOKENS].text(),
            "condition too long",
        ));
    }

    let mut parser = ConditionParser::new(&tokens, selection_names);
    let ast = parser.parse_or_expression()?;

    let aggregation = match parser.current_token() {
        None => None,
        Some(Token::Pipe) => {
            parser.advance();
            Some(parser.parse_aggregation()?)
        }
        Some(_) => return Err(parser.unexpected("unexpected trailing token")),
    };

    if parser.current_token().is_some() {
        return Err(parser.unexpected("unexpected trailing token"));
    }

    Ok((ast, aggregation))
}
