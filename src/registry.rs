//! Plugin registry
//!
//! Aggregates every loaded plugin into one fact/operator catalogue and owns
//! the guarded invocation boundary: a plugin callable that returns an error
//! or panics never unwinds past this module, it comes back as a
//! [`PluginError`].
//!
//! Registration happens once at startup; the finished registry is shared
//! read-only through a [`RegistryHandle`].
//!
//! # Duplicate names
//!
//! When two plugins contribute a fact or operator with the same name, the
//! last registration wins. The catalogue keeps the slot (and therefore the
//! registration order used for priority tie-breaks) of the first
//! registration, with the newer definition in it.

use crate::almanac::Almanac;
use crate::diagnostic::Severity;
use crate::fact::{Fact, Operator};
use crate::plugin::{Plugin, PluginError, PluginFunction, PluginResult};
use crate::rule::RuleConfig;
use log::{error, info, warn};
use serde_json::{json, Value};
use std::any::Any;
use std::cell::Cell;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Shared, read-only handle to a fully registered registry
pub type RegistryHandle = Arc<PluginRegistry>;

/// A fact together with the plugin that contributed it
#[derive(Clone)]
pub struct RegisteredFact {
    pub fact: Fact,
    pub plugin: Arc<dyn Plugin>,
    /// Position in the catalogue (registration order)
    pub order: usize,
}

/// An operator together with the plugin that contributed it
#[derive(Clone)]
pub struct RegisteredOperator {
    pub operator: Operator,
    pub plugin: Arc<dyn Plugin>,
}

/// Process-wide aggregator of loaded plugins
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
    facts: Vec<RegisteredFact>,
    fact_index: HashMap<String, usize>,
    operators: Vec<RegisteredOperator>,
    operator_index: HashMap<String, usize>,
    functions: HashMap<String, HashMap<String, PluginFunction>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin, merging its capabilities into the catalogue
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        if self.plugins.iter().any(|p| p.name() == plugin.name()) {
            warn!(
                "Plugin '{}' registered more than once; capabilities are merged",
                plugin.name()
            );
        }

        let facts = plugin.facts();
        let operators = plugin.operators();
        let sample_rules = plugin.sample_rules().len();

        info!(
            "Registered plugin {} v{}: {} facts, {} operators, {} sample rules",
            plugin.name(),
            plugin.version(),
            facts.len(),
            operators.len(),
            sample_rules
        );

        for fact in facts {
            self.insert_fact(fact, &plugin);
        }
        for operator in operators {
            self.insert_operator(operator, &plugin);
        }

        self.functions
            .entry(plugin.name().to_string())
            .or_default()
            .extend(plugin.functions());

        self.plugins.push(plugin);
    }

    fn insert_fact(&mut self, fact: Fact, plugin: &Arc<dyn Plugin>) {
        match self.fact_index.get(fact.name()) {
            Some(&idx) => {
                warn!(
                    "Fact '{}' from plugin '{}' replaces the definition from '{}'",
                    fact.name(),
                    plugin.name(),
                    self.facts[idx].plugin.name()
                );
                self.facts[idx].fact = fact;
                self.facts[idx].plugin = Arc::clone(plugin);
            }
            None => {
                let order = self.facts.len();
                self.fact_index.insert(fact.name().to_string(), order);
                self.facts.push(RegisteredFact {
                    fact,
                    plugin: Arc::clone(plugin),
                    order,
                });
            }
        }
    }

    fn insert_operator(&mut self, operator: Operator, plugin: &Arc<dyn Plugin>) {
        match self.operator_index.get(operator.name()) {
            Some(&idx) => {
                warn!(
                    "Operator '{}' from plugin '{}' replaces the definition from '{}'",
                    operator.name(),
                    plugin.name(),
                    self.operators[idx].plugin.name()
                );
                self.operators[idx] = RegisteredOperator {
                    operator,
                    plugin: Arc::clone(plugin),
                };
            }
            None => {
                self.operator_index
                    .insert(operator.name().to_string(), self.operators.len());
                self.operators.push(RegisteredOperator {
                    operator,
                    plugin: Arc::clone(plugin),
                });
            }
        }
    }

    /// Freeze the registry into a shareable handle
    pub fn into_handle(self) -> RegistryHandle {
        Arc::new(self)
    }

    /// Registered plugins, in registration order
    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    pub fn plugin(&self, name: &str) -> Option<&Arc<dyn Plugin>> {
        self.plugins.iter().rev().find(|p| p.name() == name)
    }

    /// Merged fact catalogue, in registration order
    pub fn facts(&self) -> impl Iterator<Item = &Fact> {
        self.facts.iter().map(|f| &f.fact)
    }

    /// Merged operator catalogue, in registration order
    pub fn operators(&self) -> impl Iterator<Item = &Operator> {
        self.operators.iter().map(|o| &o.operator)
    }

    pub fn fact(&self, name: &str) -> Option<&RegisteredFact> {
        self.fact_index.get(name).map(|&idx| &self.facts[idx])
    }

    pub fn operator(&self, name: &str) -> Option<&RegisteredOperator> {
        self.operator_index.get(name).map(|&idx| &self.operators[idx])
    }

    pub fn has_fact(&self, name: &str) -> bool {
        self.fact_index.contains_key(name)
    }

    pub fn has_operator(&self, name: &str) -> bool {
        self.operator_index.contains_key(name)
    }

    /// Sample rules of every plugin, in registration order
    pub fn sample_rules(&self) -> Vec<RuleConfig> {
        self.plugins.iter().flat_map(|p| p.sample_rules()).collect()
    }

    /// Catalogue identity for result caching: plugin fingerprints, and
    /// which plugin serves each fact and operator
    pub fn fingerprint(&self) -> Value {
        json!({
            "plugins": self.plugins.iter().map(|p| p.fingerprint()).collect::<Vec<_>>(),
            "facts": self
                .facts
                .iter()
                .map(|f| json!([f.fact.name(), f.fact.kind(), f.fact.priority(), f.plugin.name()]))
                .collect::<Vec<_>>(),
            "operators": self
                .operators
                .iter()
                .map(|o| json!([o.operator.name(), o.plugin.name()]))
                .collect::<Vec<_>>(),
        })
    }

    /// Call a function a plugin registered by name, inside a guarded frame
    pub fn invoke(&self, plugin_name: &str, function_name: &str, args: &[Value]) -> PluginResult {
        let Some(plugin) = self.plugin(plugin_name) else {
            return Err(PluginError::fatal(format!(
                "Plugin '{}' is not registered",
                plugin_name
            )));
        };

        let Some(function) = self
            .functions
            .get(plugin_name)
            .and_then(|fns| fns.get(function_name))
        else {
            return Err(PluginError::fatal(format!(
                "Plugin '{}' has no function '{}'",
                plugin_name, function_name
            )));
        };

        guarded(plugin.as_ref(), function_name, || function(args))
    }

    /// Compute a fact through the guarded invocation path
    pub fn compute_fact(&self, name: &str, params: &Value, almanac: &Almanac) -> PluginResult {
        let Some(registered) = self.fact(name) else {
            return Err(PluginError::fatal(format!("Unknown fact '{}'", name)));
        };

        guarded(registered.plugin.as_ref(), name, || {
            registered.fact.compute(params, almanac)
        })
    }

    /// Apply an operator; a panicking operator is reported like a failing fact
    pub fn apply_operator(
        &self,
        name: &str,
        fact_value: &Value,
        expected: &Value,
    ) -> Result<bool, PluginError> {
        let Some(registered) = self.operator(name) else {
            return Err(PluginError::fatal(format!("Unknown operator '{}'", name)));
        };

        guarded(registered.plugin.as_ref(), name, || {
            Ok(Value::Bool(registered.operator.evaluate(fact_value, expected)))
        })
        .map(|v| v.as_bool().unwrap_or(false))
    }
}

thread_local! {
    static PLUGIN_CALL_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Whether the current thread is running plugin code inside a guarded frame.
///
/// Panic hooks use this to tell a plugin fault, which comes back as a
/// [`PluginError`], from a panic in the host.
pub fn in_plugin_call() -> bool {
    PLUGIN_CALL_DEPTH.with(|depth| depth.get() > 0)
}

struct PluginCallScope;

impl PluginCallScope {
    fn enter() -> Self {
        PLUGIN_CALL_DEPTH.with(|depth| depth.set(depth.get() + 1));
        PluginCallScope
    }
}

impl Drop for PluginCallScope {
    fn drop(&mut self) {
        PLUGIN_CALL_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Run a plugin callable, converting errors and panics into a [`PluginError`]
fn guarded<F>(plugin: &dyn Plugin, function_name: &str, call: F) -> PluginResult
where
    F: FnOnce() -> anyhow::Result<Value>,
{
    let outcome = {
        let _scope = PluginCallScope::enter();
        panic::catch_unwind(AssertUnwindSafe(call))
    };
    let fault = match outcome {
        Ok(Ok(value)) => return Ok(value),
        Ok(Err(fault)) => fault,
        Err(payload) => anyhow::anyhow!("panicked: {}", panic_message(payload.as_ref())),
    };

    // The hook is plugin code too.
    let translated = {
        let _scope = PluginCallScope::enter();
        panic::catch_unwind(AssertUnwindSafe(|| plugin.on_error(&fault)))
            .ok()
            .flatten()
    };

    let plugin_error = translated.unwrap_or_else(|| {
        PluginError::fatal(format!(
            "Plugin '{}' failed in '{}': {}",
            plugin.name(),
            function_name,
            fault
        ))
        .with_details(json!({
            "plugin": plugin.name(),
            "function": function_name,
        }))
    });

    match plugin_error.level {
        Severity::Fatal => error!("{}", plugin_error.message),
        _ => warn!("{}", plugin_error.message),
    }

    Err(plugin_error)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
