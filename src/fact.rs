//! Fact and operator definitions
//!
//! A fact is a named computation whose value rule conditions inspect; an
//! operator is a named predicate comparing a fact value with the value a
//! condition expects. Both are contributed by plugins.

use crate::almanac::Almanac;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Computation behind a fact: `(params, almanac) -> value`
pub type FactFn = Arc<dyn Fn(&Value, &Almanac) -> anyhow::Result<Value> + Send + Sync>;

/// Predicate behind an operator: `(fact value, expected value) -> bool`
pub type OperatorFn = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;

/// Scope a fact is computed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactKind {
    /// Computed once per run against the whole repository
    Global,
    /// Computed once per file, with that file as the implicit parameter
    #[default]
    Iterative,
}

impl fmt::Display for FactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactKind::Global => write!(f, "global"),
            FactKind::Iterative => write!(f, "iterative"),
        }
    }
}

impl std::str::FromStr for FactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "global" => Ok(FactKind::Global),
            "iterative" | "file" => Ok(FactKind::Iterative),
            _ => Err(format!("Unknown fact kind: {}", s)),
        }
    }
}

/// A named computation producing a value for rule conditions
#[derive(Clone)]
pub struct Fact {
    name: String,
    kind: FactKind,
    /// Lower runs first
    priority: i32,
    compute: FactFn,
}

impl Fact {
    /// Create an iterative fact with default priority
    pub fn new<F>(name: &str, compute: F) -> Self
    where
        F: Fn(&Value, &Almanac) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            kind: FactKind::Iterative,
            priority: Self::DEFAULT_PRIORITY,
            compute: Arc::new(compute),
        }
    }

    pub const DEFAULT_PRIORITY: i32 = 100;

    pub fn with_kind(mut self, kind: FactKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn global(self) -> Self {
        self.with_kind(FactKind::Global)
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FactKind {
        self.kind
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Run the computation unguarded. Callers outside the registry should go
    /// through [`crate::registry::PluginRegistry`] instead.
    pub(crate) fn compute(&self, params: &Value, almanac: &Almanac) -> anyhow::Result<Value> {
        (self.compute)(params, almanac)
    }
}

impl fmt::Debug for Fact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fact")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// A named boolean predicate
#[derive(Clone)]
pub struct Operator {
    name: String,
    evaluate: OperatorFn,
}

impl Operator {
    pub fn new<F>(name: &str, evaluate: F) -> Self
    where
        F: Fn(&Value, &Value) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            evaluate: Arc::new(evaluate),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn evaluate(&self, fact_value: &Value, expected: &Value) -> bool {
        (self.evaluate)(fact_value, expected)
    }
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operator")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
