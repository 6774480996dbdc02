//! Rule evaluation engine
//!
//! Walks each rule's condition tree depth-first against one almanac.
//! `all` stops at the first false child, `any` at the first true child.
//! Siblings are visited in fact-priority order (lower first, registration
//! order on ties) so expensive shared prerequisites are resolved once and
//! early.
//!
//! A leaf whose fact or operator fails makes the rule `Failed`, which is
//! distinct from `NotMatched`; the rule's [`ErrorBehavior`] decides what
//! else happens. One rule failing never stops other rules unless the rule
//! asks to escalate, and escalation only stops the current context.

use crate::almanac::Almanac;
use crate::diagnostic::{ExecutionError, RuleEvent, Severity};
use crate::plugin::PluginError;
use crate::registry::RegistryHandle;
use crate::rule::{Condition, ConditionTree, ErrorBehavior, RuleConfig};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Per-rule timing statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleTiming {
    /// Rule name
    pub rule_name: String,
    /// Total time spent on this rule
    pub total_time: Duration,
    /// Number of times the rule was evaluated
    pub evaluation_count: usize,
    /// Number of matches found
    pub match_count: usize,
}

impl RuleTiming {
    pub fn new(rule_name: &str) -> Self {
        Self {
            rule_name: rule_name.to_string(),
            ..Default::default()
        }
    }

    /// Average time per evaluation
    pub fn avg_time(&self) -> Duration {
        if self.evaluation_count > 0 {
            self.total_time / self.evaluation_count as u32
        } else {
            Duration::ZERO
        }
    }

    pub fn merge(&mut self, other: &RuleTiming) {
        self.total_time += other.total_time;
        self.evaluation_count += other.evaluation_count;
        self.match_count += other.match_count;
    }
}

/// A leaf that could not be resolved
#[derive(Debug, Clone, PartialEq)]
pub struct LeafFailure {
    pub fact: String,
    pub error: PluginError,
}

/// Final state of one rule
#[derive(Debug, Clone, PartialEq)]
pub enum RuleOutcome {
    Matched,
    NotMatched,
    Failed(LeafFailure),
}

enum NodeOutcome {
    True,
    False,
    Failed(LeafFailure),
}

/// Events and execution errors produced for one evaluation context
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResult {
    /// File path, or the global pseudo-path
    pub file_path: String,
    /// Events of matched rules, in rule order
    pub events: Vec<RuleEvent>,
    /// Fact and plugin failures
    pub errors: Vec<ExecutionError>,
    /// Rules that were evaluated
    pub rules_evaluated: usize,
    /// An escalating rule stopped evaluation early
    #[serde(default)]
    pub aborted: bool,
    /// Timing per rule name
    #[serde(skip)]
    pub timings: HashMap<String, RuleTiming>,
}

// timings vary between runs and are not persisted
impl PartialEq for FileResult {
    fn eq(&self, other: &Self) -> bool {
        self.file_path == other.file_path
            && self.events == other.events
            && self.errors == other.errors
            && self.rules_evaluated == other.rules_evaluated
            && self.aborted == other.aborted
    }
}

impl FileResult {
    pub fn new(file_path: &str) -> Self {
        Self {
            file_path: file_path.to_string(),
            ..Default::default()
        }
    }

    pub fn has_fatal(&self) -> bool {
        self.errors.iter().any(ExecutionError::is_fatal)
            || self.events.iter().any(|e| e.severity == Severity::Fatal)
    }
}

/// Evaluates rule condition trees through an almanac
pub struct RuleEngine {
    registry: RegistryHandle,
    severity_overrides: HashMap<String, Severity>,
}

impl RuleEngine {
    pub fn new(registry: RegistryHandle) -> Self {
        Self {
            registry,
            severity_overrides: HashMap::new(),
        }
    }

    /// Override the event severity of rules by name
    pub fn with_severity_overrides(mut self, overrides: HashMap<String, Severity>) -> Self {
        self.severity_overrides = overrides;
        self
    }

    /// Evaluate rules in order against one almanac
    pub fn run<'a, I>(&self, rules: I, almanac: &Almanac) -> FileResult
    where
        I: IntoIterator<Item = &'a RuleConfig>,
    {
        let file_path = almanac.file().file_path.clone();
        let mut result = FileResult::new(&file_path);

        for rule in rules {
            if !rule.enabled {
                continue;
            }

            let start = Instant::now();
            let outcome = self.evaluate_rule(rule, almanac);
            let elapsed = start.elapsed();
            result.rules_evaluated += 1;

            let timing = result
                .timings
                .entry(rule.name.clone())
                .or_insert_with(|| RuleTiming::new(&rule.name));
            timing.total_time += elapsed;
            timing.evaluation_count += 1;

            match outcome {
                RuleOutcome::Matched => {
                    timing.match_count += 1;
                    result.events.push(RuleEvent::new(
                        &rule.name,
                        &rule.event.event_type,
                        rule.event.params.clone(),
                        self.severity_for(rule),
                    ));
                }
                RuleOutcome::NotMatched => {}
                RuleOutcome::Failed(failure) => {
                    result.errors.push(
                        ExecutionError::new(&file_path, failure.error.clone())
                            .with_rule(&rule.name)
                            .with_fact(&failure.fact),
                    );

                    match rule.error_behavior {
                        ErrorBehavior::Swallow => {
                            debug!(
                                "Rule '{}' skipped on {}: {}",
                                rule.name, file_path, failure.error
                            );
                        }
                        ErrorBehavior::Record => {
                            result.events.push(failure_event(rule, &failure));
                        }
                        ErrorBehavior::Escalate => {
                            result.events.push(failure_event(rule, &failure));
                            result.aborted = true;
                            debug!(
                                "Rule '{}' escalated on {}; remaining rules skipped",
                                rule.name, file_path
                            );
                            break;
                        }
                    }
                }
            }
        }

        result
    }

    /// Severity for a matched rule: config override, else rule/event config
    pub fn severity_for(&self, rule: &RuleConfig) -> Severity {
        self.severity_overrides
            .get(&rule.name)
            .copied()
            .unwrap_or_else(|| rule.event_severity())
    }

    /// Evaluate one rule's condition tree
    pub fn evaluate_rule(&self, rule: &RuleConfig, almanac: &Almanac) -> RuleOutcome {
        match self.evaluate_node(&rule.conditions, almanac) {
            NodeOutcome::True => RuleOutcome::Matched,
            NodeOutcome::False => RuleOutcome::NotMatched,
            NodeOutcome::Failed(failure) => RuleOutcome::Failed(failure),
        }
    }

    fn evaluate_node(&self, node: &ConditionTree, almanac: &Almanac) -> NodeOutcome {
        match node {
            ConditionTree::All { all } => {
                for child in self.prioritized(all) {
                    match self.evaluate_node(child, almanac) {
                        NodeOutcome::True => {}
                        other => return other,
                    }
                }
                NodeOutcome::True
            }
            ConditionTree::Any { any } => {
                let mut failure = None;
                for child in self.prioritized(any) {
                    match self.evaluate_node(child, almanac) {
                        NodeOutcome::True => return NodeOutcome::True,
                        NodeOutcome::False => {}
                        NodeOutcome::Failed(f) => {
                            failure.get_or_insert(f);
                        }
                    }
                }
                match failure {
                    Some(f) => NodeOutcome::Failed(f),
                    None => NodeOutcome::False,
                }
            }
            ConditionTree::Not { not } => match self.evaluate_node(not, almanac) {
                NodeOutcome::True => NodeOutcome::False,
                NodeOutcome::False => NodeOutcome::True,
                failed => failed,
            },
            ConditionTree::Leaf(condition) => self.evaluate_leaf(condition, almanac),
        }
    }

    fn evaluate_leaf(&self, condition: &Condition, almanac: &Almanac) -> NodeOutcome {
        let value = match almanac.fact_value(&condition.fact, &condition.params) {
            Ok(value) => value,
            Err(error) => {
                return NodeOutcome::Failed(LeafFailure {
                    fact: condition.fact.clone(),
                    error,
                })
            }
        };

        let value = match &condition.path {
            Some(path) => select_path(&value, path).unwrap_or(Value::Null),
            None => value,
        };

        if let Some(name) = &condition.result_fact {
            almanac.add_runtime_fact(name, value.clone());
        }

        match self
            .registry
            .apply_operator(&condition.operator, &value, &condition.value)
        {
            Ok(true) => NodeOutcome::True,
            Ok(false) => NodeOutcome::False,
            Err(error) => NodeOutcome::Failed(LeafFailure {
                fact: condition.fact.clone(),
                error,
            }),
        }
    }

    /// Children ordered by their cheapest fact priority; stable on ties
    fn prioritized<'a>(&self, children: &'a [ConditionTree]) -> Vec<&'a ConditionTree> {
        let mut ordered: Vec<&ConditionTree> = children.iter().collect();
        ordered.sort_by_key(|child| self.priority_key(child));
        ordered
    }

    fn priority_key(&self, node: &ConditionTree) -> (i32, usize) {
        node.leaves()
            .iter()
            .map(|leaf| match self.registry.fact(&leaf.fact) {
                Some(registered) => (registered.fact.priority(), registered.order),
                // runtime facts come from earlier siblings
                None => (i32::MAX, usize::MAX),
            })
            .min()
            .unwrap_or((i32::MAX, usize::MAX))
    }
}

fn failure_event(rule: &RuleConfig, failure: &LeafFailure) -> RuleEvent {
    RuleEvent::new(
        &rule.name,
        &failure.error.level.to_string(),
        json!({
            "message": failure.error.message,
            "fact": failure.fact,
            "details": failure.error.details,
            "executionError": true,
        }),
        failure.error.level,
    )
}

/// Narrow a value with a JSON pointer (`/a/0`) or a JSONPath subset
/// (`$.a[0]`, `$['a']`, `a.b`).
pub fn select_path(value: &Value, path: &str) -> Option<Value> {
    let path = path.trim();
    if path.is_empty() || path == "$" {
        return Some(value.clone());
    }
    if path.starts_with('/') {
        return value.pointer(path).cloned();
    }
    let pointer = json_path_to_pointer(path)?;
    value.pointer(&pointer).cloned()
}

fn json_path_to_pointer(path: &str) -> Option<String> {
    let rest = path.strip_prefix('$').unwrap_or(path);
    let chars: Vec<char> = rest.chars().collect();
    let mut pointer = String::new();
    let mut i = 0;

    while i < chars.len() {
        let segment: String = match chars[i] {
            '.' => {
                i += 1;
                let start = i;
                while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
                    i += 1;
                }
                chars[start..i].iter().collect()
            }
            '[' => {
                i += 1;
                let quote = chars.get(i).copied().filter(|c| *c == '\'' || *c == '"');
                let segment = if let Some(q) = quote {
                    i += 1;
                    let start = i;
                    while i < chars.len() && chars[i] != q {
                        i += 1;
                    }
                    let s: String = chars[start..i].iter().collect();
                    i += 1;
                    s
                } else {
                    let start = i;
                    while i < chars.len() && chars[i] != ']' {
                        i += 1;
                    }
                    chars[start..i].iter().collect::<String>().trim().to_string()
                };
                if chars.get(i) != Some(&']') {
                    return None;
                }
                i += 1;
                segment
            }
            _ if i == 0 => {
                let start = i;
                while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
                    i += 1;
                }
                chars[start..i].iter().collect()
            }
            _ => return None,
        };

        if segment.is_empty() {
            return None;
        }
        pointer.push('/');
        pointer.push_str(&segment.replace('~', "~0").replace('/', "~1"));
    }

    Some(pointer)
}
