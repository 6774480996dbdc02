//! Severity levels, rule events and execution errors
//!
//! Findings (events emitted by matched rules) and execution errors (fact or
//! plugin failures) are kept in separate channels so a run summary can tell
//! them apart.

use crate::plugin::PluginError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity level shared by plugin failures and rule events
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational, does not affect run success
    #[default]
    Warning,
    /// Should fail a gate, other analysis continues
    Error,
    /// The whole run should be treated as failed
    Fatal,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
            Severity::Fatal => write!(f, "fatal"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "warning" | "warn" => Ok(Severity::Warning),
            "error" | "err" => Ok(Severity::Error),
            "fatal" | "fatality" => Ok(Severity::Fatal),
            _ => Err(format!("Unknown severity: {}", s)),
        }
    }
}

/// Event emitted by a fully matched rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleEvent {
    /// Name of the rule that matched
    pub rule_name: String,
    /// Event type from the rule document
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event parameters from the rule document
    #[serde(default)]
    pub params: Value,
    /// Severity derived from the rule and event configuration
    pub severity: Severity,
}

impl RuleEvent {
    pub fn new(rule_name: &str, event_type: &str, params: Value, severity: Severity) -> Self {
        Self {
            rule_name: rule_name.to_string(),
            event_type: event_type.to_string(),
            params,
            severity,
        }
    }

    /// Message carried in the event params, if any
    pub fn message(&self) -> Option<&str> {
        self.params.get("message").and_then(Value::as_str)
    }
}

/// A fact or plugin failure observed while evaluating rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionError {
    /// Rule being evaluated when the failure surfaced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_name: Option<String>,
    /// Fact whose resolution failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fact: Option<String>,
    /// File (or global pseudo-file) being analyzed
    pub file_path: String,
    /// The translated plugin failure
    pub error: PluginError,
}

impl ExecutionError {
    pub fn new(file_path: &str, error: PluginError) -> Self {
        Self {
            rule_name: None,
            fact: None,
            file_path: file_path.to_string(),
            error,
        }
    }

    pub fn with_rule(mut self, rule_name: &str) -> Self {
        self.rule_name = Some(rule_name.to_string());
        self
    }

    pub fn with_fact(mut self, fact: &str) -> Self {
        self.fact = Some(fact.to_string());
        self
    }

    pub fn level(&self) -> Severity {
        self.error.level
    }

    pub fn is_fatal(&self) -> bool {
        self.error.level == Severity::Fatal
    }
}
