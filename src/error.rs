//! Error and diagnostic types for the TIDE engine.
//!
//! Every failure a rule can produce is a [`TideError`]. Batch callers never see
//! these as hard failures: the engine folds them into [`Diagnostic`] records
//! keyed by rule id (and target, for emission errors).

use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::emit::Target;

pub type Result<T> = std::result::Result<T, TideError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TideError {
    #[error("YAML parsing error: {0}")]
    Yaml(String),
    #[error("JSON parsing error: {0}")]
    Json(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
    #[error("Syntax error at '{token}': {message}")]
    Syntax { token: String, message: String },
    #[error("Undefined selection: {0}")]
    UndefinedSelection(String),
    #[error("No selections match pattern '{0}'")]
    EmptyPatternMatch(String),
    #[error("Unsupported modifier: {0}")]
    UnsupportedModifier(String),
    #[error("Unsupported construct '{construct}' for target {target}")]
    UnsupportedConstruct { construct: String, target: String },
    #[error("Invalid taxonomy: {0}")]
    InvalidTaxonomy(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl TideError {
    pub(crate) fn syntax(token: impl Into<String>, message: impl Into<String>) -> Self {
        TideError::Syntax {
            token: token.into(),
            message: message.into(),
        }
    }

    pub(crate) fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        TideError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub(crate) fn unsupported(construct: impl Into<String>, target: impl fmt::Display) -> Self {
        TideError::UnsupportedConstruct {
            construct: construct.into(),
            target: target.to_string(),
        }
    }

    /// Classify this error for reviewer-facing diagnostics.
    pub fn kind(&self) -> DiagnosticKind {
        match self {
            TideError::Syntax { .. } => DiagnosticKind::SyntaxError,
            TideError::UndefinedSelection(_) => DiagnosticKind::UndefinedSelectionError,
            TideError::EmptyPatternMatch(_) => DiagnosticKind::EmptyPatternMatchError,
            TideError::UnsupportedModifier(_) => DiagnosticKind::UnsupportedModifierError,
            TideError::UnsupportedConstruct { .. } => DiagnosticKind::UnsupportedConstructError,
            TideError::InvalidTaxonomy(_) => DiagnosticKind::TaxonomyError,
            TideError::Yaml(_)
            | TideError::Json(_)
            | TideError::Io(_)
            | TideError::MissingField(_)
            | TideError::InvalidValue { .. }
            | TideError::Config(_) => DiagnosticKind::ParseError,
        }
    }

    /// The offending token, name or construct, when the error carries one.
    pub fn construct(&self) -> String {
        match self {
            TideError::Syntax { token, .. } => token.clone(),
            TideError::UndefinedSelection(name) => name.clone(),
            TideError::EmptyPatternMatch(pattern) => pattern.clone(),
            TideError::UnsupportedModifier(modifier) => modifier.clone(),
            TideError::UnsupportedConstruct { construct, .. } => construct.clone(),
            TideError::MissingField(key) => key.clone(),
            TideError::InvalidValue { field, .. } => field.clone(),
            _ => String::new(),
        }
    }
}

impl From<std::io::Error> for TideError {
    fn from(err: std::io::Error) -> Self {
        TideError::Io(err.to_string())
    }
}

impl From<serde_yaml::Error> for TideError {
    fn from(err: serde_yaml::Error) -> Self {
        TideError::Yaml(err.to_string())
    }
}

impl From<serde_json::Error> for TideError {
    fn from(err: serde_json::Error) -> Self {
        TideError::Json(err.to_string())
    }
}

/// Kind of a reviewer-facing diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DiagnosticKind {
    ParseError,
    SyntaxError,
    UndefinedSelectionError,
    EmptyPatternMatchError,
    UnsupportedModifierError,
    UnsupportedConstructError,
    MappingResolutionWarning,
    TaxonomyError,
}

impl DiagnosticKind {
    /// Warnings never block compilation.
    pub fn is_warning(self) -> bool {
        matches!(self, DiagnosticKind::MappingResolutionWarning)
    }
}

/// A structured compiler diagnostic: error kind, offending rule and construct.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub rule_id: String,
    pub kind: DiagnosticKind,
    pub construct: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<Target>,
}

impl Diagnostic {
    pub fn from_error(rule_id: &str, error: &TideError) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            kind: error.kind(),
            construct: error.construct(),
            message: error.to_string(),
            target: None,
        }
    }

    pub fn for_target(rule_id: &str, target: Target, error: &TideError) -> Self {
        Self {
            target: Some(target),
            ..Self::from_error(rule_id, error)
        }
    }

    pub fn unmapped_field(rule_id: &str, field: &str) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            kind: DiagnosticKind::MappingResolutionWarning,
            construct: field.to_string(),
            message: format!("Field '{field}' has no mapping for this log source"),
            target: None,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target {
            Some(target) => write!(f, "[{}] {} ({}): {}", self.rule_id, target, self.construct, self.message),
            None => write!(f, "[{}] {}: {}", self.rule_id, self.construct, self.message),
        }
    }
}
