//! Rule documents
//!
//! A rule is a condition tree plus the event emitted when the tree matches.
//! Rule documents are JSON (or YAML) values, loaded from disk or from any
//! other source that yields the same shape.
//!
//! ```json
//! {
//!   "name": "no-hardcoded-secrets",
//!   "conditions": {
//!     "all": [
//!       {
//!         "fact": "fileData",
//!         "params": { "checkPattern": "password\\s*=" },
//!         "operator": "fileContains",
//!         "value": true
//!       }
//!     ]
//!   },
//!   "event": { "type": "warning", "params": { "message": "Hardcoded secret" } }
//! }
//! ```

use crate::diagnostic::Severity;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Error loading rule documents
#[derive(Debug, Error)]
pub enum RuleLoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error in {file}: {message}")]
    Parse { file: String, message: String },

    #[error("Invalid rule: {0}")]
    Invalid(String),
}

/// A leaf condition: resolve a fact, then apply an operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Fact to resolve
    pub fact: String,

    /// Operator applied to `(fact value, value)`
    pub operator: String,

    /// Expected value handed to the operator
    #[serde(default)]
    pub value: Value,

    /// Narrow the fact value before applying the operator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Parameters passed to the fact
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,

    /// Store the narrowed fact value as a runtime fact under this name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_fact: Option<String>,
}

impl Condition {
    pub fn new(fact: &str, operator: &str, value: Value) -> Self {
        Self {
            fact: fact.to_string(),
            operator: operator.to_string(),
            value,
            path: None,
            params: Value::Null,
            result_fact: None,
        }
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_result_fact(mut self, name: &str) -> Self {
        self.result_fact = Some(name.to_string());
        self
    }
}

/// Boolean tree of conditions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionTree {
    /// Every child must match
    All { all: Vec<ConditionTree> },
    /// At least one child must match
    Any { any: Vec<ConditionTree> },
    /// The child must not match
    Not { not: Box<ConditionTree> },
    /// Fact/operator comparison
    Leaf(Condition),
}

impl ConditionTree {
    pub fn all(children: Vec<ConditionTree>) -> Self {
        ConditionTree::All { all: children }
    }

    pub fn any(children: Vec<ConditionTree>) -> Self {
        ConditionTree::Any { any: children }
    }

    pub fn not(child: ConditionTree) -> Self {
        ConditionTree::Not {
            not: Box::new(child),
        }
    }

    /// Leaf conditions in depth-first order
    pub fn leaves(&self) -> Vec<&Condition> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Condition>) {
        match self {
            ConditionTree::All { all: children } | ConditionTree::Any { any: children } => {
                for child in children {
                    child.collect_leaves(out);
                }
            }
            ConditionTree::Not { not } => not.collect_leaves(out),
            ConditionTree::Leaf(condition) => out.push(condition),
        }
    }
}

impl From<Condition> for ConditionTree {
    fn from(condition: Condition) -> Self {
        ConditionTree::Leaf(condition)
    }
}

/// Event emitted when a rule matches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventConfig {
    /// Event type (e.g., "warning", "fatality")
    #[serde(rename = "type")]
    pub event_type: String,

    /// Free-form parameters (message, details, ...)
    #[serde(default)]
    pub params: Value,
}

/// What happens when a leaf condition cannot be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorBehavior {
    /// Skip the rule; the failure only shows up as an execution error
    #[default]
    Swallow,
    /// Also emit a finding at the failure's severity
    Record,
    /// Record, then stop evaluating the remaining rules for this context
    Escalate,
}

impl fmt::Display for ErrorBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorBehavior::Swallow => write!(f, "swallow"),
            ErrorBehavior::Record => write!(f, "record"),
            ErrorBehavior::Escalate => write!(f, "escalate"),
        }
    }
}

/// Evaluation context a rule runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleScope {
    /// Once per file
    File,
    /// Once per run
    Global,
}

/// A rule document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConfig {
    /// Unique rule name
    pub name: String,

    /// Condition tree
    pub conditions: ConditionTree,

    /// Event emitted on match
    pub event: EventConfig,

    /// Handling of failed leaf conditions
    #[serde(default)]
    pub error_behavior: ErrorBehavior,

    /// Explicit event severity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,

    /// Explicit scope; derived from the name when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<RuleScope>,

    /// Whether the rule runs at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Extended description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_true() -> bool {
    true
}

impl RuleConfig {
    pub fn new(name: &str, conditions: ConditionTree, event_type: &str) -> Self {
        Self {
            name: name.to_string(),
            conditions,
            event: EventConfig {
                event_type: event_type.to_string(),
                params: Value::Null,
            },
            error_behavior: ErrorBehavior::default(),
            severity: None,
            scope: None,
            enabled: true,
            description: None,
        }
    }

    pub fn with_event_params(mut self, params: Value) -> Self {
        self.event.params = params;
        self
    }

    pub fn with_error_behavior(mut self, behavior: ErrorBehavior) -> Self {
        self.error_behavior = behavior;
        self
    }

    pub fn with_scope(mut self, scope: RuleScope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// Effective scope: explicit, else `-global` name suffix, else file
    pub fn scope(&self) -> RuleScope {
        match self.scope {
            Some(scope) => scope,
            None if self.name.ends_with("-global") => RuleScope::Global,
            None => RuleScope::File,
        }
    }

    pub fn is_global(&self) -> bool {
        self.scope() == RuleScope::Global
    }

    /// Severity derived from the rule and event configuration
    pub fn event_severity(&self) -> Severity {
        if let Some(severity) = self.severity {
            return severity;
        }
        self.event
            .params
            .get("level")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .or_else(|| self.event.event_type.parse().ok())
            .unwrap_or_default()
    }

    /// Names of the facts this rule references
    pub fn referenced_facts(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .conditions
            .leaves()
            .iter()
            .map(|c| c.fact.as_str())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Names of the operators this rule references
    pub fn referenced_operators(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .conditions
            .leaves()
            .iter()
            .map(|c| c.operator.as_str())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    fn validate(&self) -> Result<(), RuleLoadError> {
        if self.name.trim().is_empty() {
            return Err(RuleLoadError::Invalid("rule name must not be empty".to_string()));
        }
        if self.event.event_type.trim().is_empty() {
            return Err(RuleLoadError::Invalid(format!(
                "rule '{}' has an empty event type",
                self.name
            )));
        }
        Ok(())
    }

    /// Load a rule document (one rule or an array of rules)
    pub fn load(path: &Path) -> Result<Vec<RuleConfig>, RuleLoadError> {
        let content = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        parse_rules(&content, ext).map_err(|message| RuleLoadError::Parse {
            file: path.display().to_string(),
            message,
        })?
        .into_iter()
        .map(|rule| rule.validate().map(|_| rule))
        .collect()
    }
}

/// A rule document may hold a single rule or a list
#[derive(Deserialize)]
#[serde(untagged)]
enum RuleDocument {
    Many(Vec<RuleConfig>),
    One(Box<RuleConfig>),
}

/// Parse rule document text in the given format ("json", "yaml", "yml")
pub fn parse_rules(content: &str, format: &str) -> Result<Vec<RuleConfig>, String> {
    let document: RuleDocument = match format {
        "yaml" | "yml" => serde_yaml::from_str(content).map_err(|e| e.to_string())?,
        "json" => serde_json::from_str(content).map_err(|e| e.to_string())?,
        other => return Err(format!("Unknown rule file format: {}", other)),
    };

    Ok(match document {
        RuleDocument::Many(rules) => rules,
        RuleDocument::One(rule) => vec![*rule],
    })
}

/// Load every rule document in a directory, sorted by file name.
///
/// Rules sharing a name are merged: the last one loaded replaces the
/// earlier definition in place.
pub fn load_rules_from_dir(dir: &Path) -> Result<Vec<RuleConfig>, RuleLoadError> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if matches!(ext, "json" | "yaml" | "yml") && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    let mut rules = Vec::new();
    for path in paths {
        rules.extend(RuleConfig::load(&path)?);
    }
    Ok(merge_rules(rules))
}

/// Merge rules by name, later definitions replacing earlier ones in place
pub fn merge_rules(rules: Vec<RuleConfig>) -> Vec<RuleConfig> {
    let mut merged: Vec<RuleConfig> = Vec::with_capacity(rules.len());
    for rule in rules {
        match merged.iter_mut().find(|r| r.name == rule.name) {
            Some(existing) => {
                log::warn!("Rule '{}' defined more than once; last definition wins", rule.name);
                *existing = rule;
            }
            None => merged.push(rule),
        }
    }
    merged
}
