//! Plugin capability set
//!
//! A plugin bundles facts, operators, sample rules, invocable functions and
//! an optional error translation hook. Every capability is optional: the
//! trait's default methods report "not provided".

use crate::diagnostic::Severity;
use crate::fact::{Fact, Operator};
use crate::rule::RuleConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// A callable a plugin exposes to [`crate::registry::PluginRegistry::invoke`]
pub type PluginFunction = Arc<dyn Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync>;

/// Translates a raw plugin fault into a [`PluginError`]
pub type ErrorHook = Arc<dyn Fn(&anyhow::Error) -> PluginError + Send + Sync>;

/// Outcome of one guarded plugin invocation
pub type PluginResult = Result<Value, PluginError>;

/// A translated plugin failure
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{level}: {message}")]
pub struct PluginError {
    /// Human-readable description
    pub message: String,
    /// Severity of the failure
    pub level: Severity,
    /// Extra structured context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl PluginError {
    pub fn new(level: Severity, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level,
            details: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(Severity::Fatal, message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Plugin trait: the capability set a host loads into the registry
pub trait Plugin: Send + Sync {
    /// Plugin name (e.g., "builtin", "react-patterns")
    fn name(&self) -> &str;

    /// Plugin version
    fn version(&self) -> &str;

    /// Human-readable description
    fn description(&self) -> &str {
        ""
    }

    /// Facts contributed by this plugin
    fn facts(&self) -> Vec<Fact> {
        Vec::new()
    }

    /// Operators contributed by this plugin
    fn operators(&self) -> Vec<Operator> {
        Vec::new()
    }

    /// Example rules showing how the plugin's facts and operators are used
    fn sample_rules(&self) -> Vec<RuleConfig> {
        Vec::new()
    }

    /// Functions reachable through the registry's guarded `invoke`
    fn functions(&self) -> HashMap<String, PluginFunction> {
        HashMap::new()
    }

    /// Identity of this plugin's behavior, part of the result cache key.
    ///
    /// Plugins whose facts can change without a version bump should
    /// include whatever drives them.
    fn fingerprint(&self) -> String {
        format!("{}@{}", self.name(), self.version())
    }

    /// Translate a fault raised by one of this plugin's callables.
    ///
    /// `None` means the plugin has no hook and the registry applies its
    /// default translation (`Fatal`).
    fn on_error(&self, _fault: &anyhow::Error) -> Option<PluginError> {
        None
    }
}

/// A plugin assembled in code from closures
pub struct StaticPlugin {
    name: String,
    version: String,
    description: String,
    facts: Vec<Fact>,
    operators: Vec<Operator>,
    sample_rules: Vec<RuleConfig>,
    functions: HashMap<String, PluginFunction>,
    error_hook: Option<ErrorHook>,
}

impl StaticPlugin {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            description: String::new(),
            facts: Vec::new(),
            operators: Vec::new(),
            sample_rules: Vec::new(),
            functions: HashMap::new(),
            error_hook: None,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_fact(mut self, fact: Fact) -> Self {
        self.facts.push(fact);
        self
    }

    pub fn with_operator(mut self, operator: Operator) -> Self {
        self.operators.push(operator);
        self
    }

    pub fn with_sample_rule(mut self, rule: RuleConfig) -> Self {
        self.sample_rules.push(rule);
        self
    }

    pub fn with_function<F>(mut self, name: &str, function: F) -> Self
    where
        F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(function));
        self
    }

    pub fn with_error_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&anyhow::Error) -> PluginError + Send + Sync + 'static,
    {
        self.error_hook = Some(Arc::new(hook));
        self
    }
}

impl Plugin for StaticPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn facts(&self) -> Vec<Fact> {
        self.facts.clone()
    }

    fn operators(&self) -> Vec<Operator> {
        self.operators.clone()
    }

    fn sample_rules(&self) -> Vec<RuleConfig> {
        self.sample_rules.clone()
    }

    fn functions(&self) -> HashMap<String, PluginFunction> {
        self.functions.clone()
    }

    fn on_error(&self, fault: &anyhow::Error) -> Option<PluginError> {
        self.error_hook.as_ref().map(|hook| hook(fault))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plugin_error_display() {
        let err = PluginError::error("fact exploded");
        assert_eq!(format!("{}", err), "error: fact exploded");
    }

    #[test]
    fn test_plugin_error_details_roundtrip_json() {
        let err = PluginError::fatal("bad").with_details(json!({"fact": "fileData"}));
        let text = serde_json::to_string(&err).unwrap();
        let back: PluginError = serde_json::from_str(&text).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_static_plugin_capabilities() {
        let plugin = StaticPlugin::new("demo", "1.2.3")
            .with_description("demo plugin")
            .with_fact(Fact::new("one", |_, _| Ok(json!(1))))
            .with_operator(Operator::new("always", |_, _| true))
            .with_function("echo", |args| Ok(args.first().cloned().unwrap_or_default()));

        assert_eq!(plugin.name(), "demo");
        assert_eq!(plugin.version(), "1.2.3");
        assert_eq!(plugin.facts().len(), 1);
        assert_eq!(plugin.operators().len(), 1);
        assert!(plugin.functions().contains_key("echo"));
        assert!(plugin.sample_rules().is_empty());
    }

    #[test]
    fn test_missing_error_hook_reports_none() {
        let plugin = StaticPlugin::new("demo", "1.0.0");
        assert!(plugin.on_error(&anyhow::anyhow!("oops")).is_none());
    }

    #[test]
    fn test_error_hook_translates_fault() {
        let plugin = StaticPlugin::new("demo", "1.0.0")
            .with_error_hook(|e| PluginError::warning(format!("handled: {}", e)));
        let translated = plugin.on_error(&anyhow::anyhow!("oops")).unwrap();
        assert_eq!(translated.level, Severity::Warning);
        assert_eq!(translated.message, "handled: oops");
    }
}
