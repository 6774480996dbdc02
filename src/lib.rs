//! Fidelity - framework adherence analysis engine
//!
//! Plugins contribute facts (named, memoized computations over a file or the
//! whole repository) and operators (comparisons). Rules combine them into
//! `all` / `any` / `not` condition trees and emit events when they match.
//!
//! # Architecture
//!
//! ```text
//! CLI -> Analyzer -> RuleEngine -> Almanac -> PluginRegistry -> Plugin
//!           |
//!           +-> FileAnalysisCache (incremental reruns)
//! ```
//!
//! A plugin failure never aborts a run on its own: every plugin call goes
//! through the registry, which turns panics and errors into a
//! [`PluginError`] with a severity level. Rules decide whether such failures
//! are swallowed, recorded as events or escalated.
//!
//! # Manifest plugins
//!
//! Pattern facts and rules can be declared without Rust code
//! (e.g. `.fidelity/plugins/logging.yaml`):
//!
//! ```yaml
//! plugin:
//!   name: logging
//!   version: "1.0.0"
//!
//! facts:
//!   - name: consoleLogCalls
//!     patterns: ["console\\.log\\("]
//!
//! rules:
//!   - name: no-console-log
//!     conditions:
//!       all:
//!         - fact: consoleLogCalls
//!           path: $.count
//!           operator: greaterThan
//!           value: 0
//!     event:
//!       type: warning
//!       params:
//!         message: "console.log left in code"
//! ```

pub mod almanac;
pub mod analyzer;
pub mod cache;
pub mod cleanup;
pub mod config;
pub mod diagnostic;
pub mod engine;
pub mod fact;
pub mod pattern;
pub mod plugin;
pub mod plugin_manager;
pub mod registry;
pub mod report;
pub mod rule;

// Re-export main types
pub use almanac::{Almanac, FileData, GLOBAL_FILE_PATH};
pub use analyzer::{AnalysisResult, Analyzer};
pub use cache::{CacheStats, FileAnalysisCache};
pub use cleanup::{perform_startup_cleanup, CleanupOptions, CleanupReport};
pub use config::Config;
pub use diagnostic::{ExecutionError, RuleEvent, Severity};
pub use engine::{FileResult, RuleEngine, RuleTiming};
pub use fact::{Fact, FactKind, Operator};
pub use plugin::{Plugin, PluginError, PluginResult, StaticPlugin};
pub use plugin_manager::{ManifestPlugin, PluginManager};
pub use registry::{PluginRegistry, RegistryHandle};
pub use rule::{Condition, ConditionTree, ErrorBehavior, RuleConfig, RuleScope};

// Built-in plugins
pub mod plugins {
    pub mod builtin;
}
