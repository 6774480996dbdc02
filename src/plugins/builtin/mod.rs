//! Built-in plugin: file facts, comparison operators and pattern helpers

mod facts;
mod operators;

pub use facts::GLOBAL_FILE_METADATA;

use crate::fact::{Fact, Operator};
use crate::pattern::{compile_patterns, find_matches};
use crate::plugin::{Plugin, PluginFunction};
use crate::rule::{Condition, ConditionTree, RuleConfig};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Plugin name of the built-in plugin
pub const BUILTIN_PLUGIN: &str = "builtin";

/// Facts and operators every run starts with
pub struct BuiltinPlugin {
    version: String,
}

impl Default for BuiltinPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl BuiltinPlugin {
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl Plugin for BuiltinPlugin {
    fn name(&self) -> &str {
        BUILTIN_PLUGIN
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn description(&self) -> &str {
        "File data facts and standard comparison operators"
    }

    fn facts(&self) -> Vec<Fact> {
        facts::facts()
    }

    fn operators(&self) -> Vec<Operator> {
        operators::operators()
    }

    fn sample_rules(&self) -> Vec<RuleConfig> {
        vec![RuleConfig::new(
            "sensitiveLogging-iterative",
            ConditionTree::all(vec![ConditionTree::Leaf(
                Condition::new("fileData", "fileContains", json!(true)).with_params(json!({
                    "checkPattern": ["(?i)password\\s*[:=]", "(?i)api[_-]?key\\s*[:=]"]
                })),
            )]),
            "warning",
        )
        .with_event_params(json!({
            "message": "Possible hard-coded credential"
        }))]
    }

    fn functions(&self) -> HashMap<String, PluginFunction> {
        let mut functions: HashMap<String, PluginFunction> = HashMap::new();
        functions.insert("matchPatterns".to_string(), Arc::new(match_patterns));

        let version = self.version.clone();
        functions.insert(
            "version".to_string(),
            Arc::new(move |_: &[Value]| Ok::<_, anyhow::Error>(json!(version))),
        );
        functions
    }
}

/// `matchPatterns(content, patterns)` -> pattern matches
fn match_patterns(args: &[Value]) -> anyhow::Result<Value> {
    let content = args
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("matchPatterns expects content as its first argument"))?;
    let patterns = compile_patterns(args.get(1).unwrap_or(&Value::Null))?;
    Ok(serde_json::to_value(find_matches(content, &patterns))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::almanac::{Almanac, FileData};
    use crate::diagnostic::Severity;
    use crate::engine::RuleEngine;
    use crate::registry::PluginRegistry;

    fn registry() -> crate::registry::RegistryHandle {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(BuiltinPlugin::new()));
        registry.into_handle()
    }

    #[test]
    fn test_catalogue() {
        let registry = registry();
        assert!(registry.has_fact("fileData"));
        assert!(registry.has_fact("fileList"));
        assert!(registry.has_operator("fileContains"));
        assert_eq!(registry.operators().count(), 12);
    }

    #[test]
    fn test_invoke_functions() {
        let registry = registry();
        let matches = registry
            .invoke(
                BUILTIN_PLUGIN,
                "matchPatterns",
                &[json!("a\nneedle here"), json!("needle")],
            )
            .unwrap();
        assert_eq!(matches[0]["line"], 2);

        assert_eq!(
            registry.invoke(BUILTIN_PLUGIN, "version", &[]).unwrap(),
            json!(env!("CARGO_PKG_VERSION"))
        );
    }

    #[test]
    fn test_invoke_bad_arguments_is_fatal() {
        let registry = registry();
        let err = registry
            .invoke(BUILTIN_PLUGIN, "matchPatterns", &[json!(1)])
            .unwrap_err();
        assert_eq!(err.level, Severity::Fatal);

        // later invocations are unaffected
        assert!(registry.invoke(BUILTIN_PLUGIN, "version", &[]).is_ok());
    }

    #[test]
    fn test_sample_rule_runs() {
        let registry = registry();
        let rules = registry.sample_rules();
        let engine = RuleEngine::new(Arc::clone(&registry));
        let global = Arc::new(Almanac::global(Arc::clone(&registry)));

        let leaky = Almanac::for_file(
            Arc::clone(&registry),
            FileData::new("config.js", "const password = 'hunter2';"),
            Arc::clone(&global),
        );
        let clean = Almanac::for_file(
            Arc::clone(&registry),
            FileData::new("index.js", "export default 1;"),
            global,
        );

        assert_eq!(engine.run(&rules, &leaky).events.len(), 1);
        assert!(engine.run(&rules, &clean).events.is_empty());
    }
}
