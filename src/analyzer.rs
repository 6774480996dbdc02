//! Run orchestration
//!
//! Evaluates global rules once against the repository-wide almanac, then
//! file rules for every file on a rayon pool. Per-file almanacs share the
//! global almanac, so `Global` facts are computed once per run. With a
//! cache attached only changed files reach the rule engine.

use crate::almanac::{Almanac, FileData};
use crate::cache::FileAnalysisCache;
use crate::config::{hash_config, Config};
use crate::diagnostic::{ExecutionError, Severity};
use crate::engine::{FileResult, RuleEngine, RuleTiming};
use crate::fact::FactKind;
use crate::plugin::PluginError;
use crate::plugins::builtin::GLOBAL_FILE_METADATA;
use crate::registry::RegistryHandle;
use crate::rule::RuleConfig;
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of one analysis run
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    /// Global rule results
    pub global: FileResult,

    /// Per-file results, in input order
    pub files: Vec<FileResult>,

    /// Files evaluated by the rule engine
    pub files_analyzed: usize,

    /// Files whose results came from the cache
    pub files_from_cache: usize,

    /// Findings by severity
    pub warning_count: usize,
    pub error_count: usize,
    pub fatal_count: usize,

    /// Execution errors (fact and plugin failures)
    pub execution_error_count: usize,
    pub fatal_execution_error_count: usize,

    /// Processing duration in milliseconds
    pub duration_ms: u64,

    #[serde(skip)]
    pub duration: Duration,

    /// Per-rule timing statistics
    #[serde(skip)]
    pub rule_timings: HashMap<String, RuleTiming>,
}

impl AnalysisResult {
    /// Global and per-file results
    pub fn results(&self) -> impl Iterator<Item = &FileResult> {
        std::iter::once(&self.global).chain(self.files.iter())
    }

    pub fn finding_count(&self) -> usize {
        self.warning_count + self.error_count + self.fatal_count
    }

    /// A fatal finding or a fatal execution error
    pub fn has_fatal(&self) -> bool {
        self.fatal_count > 0 || self.fatal_execution_error_count > 0
    }

    pub fn has_errors(&self) -> bool {
        self.error_count > 0
            || self
                .results()
                .flat_map(|r| r.errors.iter())
                .any(|e| e.level() == Severity::Error)
    }

    /// Get exit code (0 = clean, 1 = errors, 2 = fatal)
    pub fn exit_code(&self) -> i32 {
        if self.has_fatal() {
            2
        } else if self.has_errors() {
            1
        } else {
            0
        }
    }

    /// Get rule timings sorted by total time (descending)
    pub fn sorted_timings(&self) -> Vec<&RuleTiming> {
        let mut timings: Vec<_> = self.rule_timings.values().collect();
        timings.sort_by(|a, b| b.total_time.cmp(&a.total_time));
        timings
    }

    fn absorb(&mut self, result: &FileResult) {
        for event in &result.events {
            match event.severity {
                Severity::Warning => self.warning_count += 1,
                Severity::Error => self.error_count += 1,
                Severity::Fatal => self.fatal_count += 1,
            }
        }
        self.execution_error_count += result.errors.len();
        self.fatal_execution_error_count += result.errors.iter().filter(|e| e.is_fatal()).count();

        for (name, timing) in &result.timings {
            self.rule_timings
                .entry(name.clone())
                .or_insert_with(|| RuleTiming::new(name))
                .merge(timing);
        }
    }
}

/// Drives the rule engine over a set of files
pub struct Analyzer {
    config: Config,
    registry: RegistryHandle,
    engine: RuleEngine,
    global_rules: Vec<RuleConfig>,
    file_rules: Vec<RuleConfig>,
    config_hash: String,
    reads_file_set: bool,
    cache: Option<Arc<FileAnalysisCache>>,
}

impl Analyzer {
    /// Create an analyzer; rules disabled by config are dropped here
    pub fn new(config: Config, registry: RegistryHandle, rules: Vec<RuleConfig>) -> Self {
        let rules: Vec<RuleConfig> = rules
            .into_iter()
            .filter(|r| r.enabled && config.is_rule_enabled(&r.name))
            .collect();

        for rule in &rules {
            for operator in rule.referenced_operators() {
                if !registry.has_operator(operator) {
                    warn!("Rule '{}' uses unknown operator '{}'", rule.name, operator);
                }
            }
        }

        let config_hash = hash_config(&(&config, &rules, registry.fingerprint()));
        let (global_rules, file_rules): (Vec<_>, Vec<_>) =
            rules.into_iter().partition(RuleConfig::is_global);

        // Global facts see every file of the run, so file results that use
        // them are only reusable for the same file set
        let reads_file_set = file_rules
            .iter()
            .flat_map(RuleConfig::referenced_facts)
            .any(|name| {
                name == GLOBAL_FILE_METADATA
                    || registry
                        .fact(name)
                        .is_some_and(|f| f.fact.kind() == FactKind::Global)
            });

        let engine = RuleEngine::new(Arc::clone(&registry))
            .with_severity_overrides(config.rules.severity.clone().into_iter().collect());

        debug!(
            "Analyzer ready: {} global rules, {} file rules",
            global_rules.len(),
            file_rules.len()
        );

        Self {
            config,
            registry,
            engine,
            global_rules,
            file_rules,
            config_hash,
            reads_file_set,
            cache: None,
        }
    }

    /// Attach an incremental cache. Entries written under another
    /// configuration or plugin catalogue are dropped on the next run.
    pub fn with_cache(mut self, cache: Arc<FileAnalysisCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Cache key of a run over `metadata`
    fn cache_hash(&self, metadata: &Value) -> String {
        if self.reads_file_set {
            hash_config(&(&self.config_hash, metadata))
        } else {
            self.config_hash.clone()
        }
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    /// Rules this analyzer evaluates
    pub fn rules(&self) -> impl Iterator<Item = &RuleConfig> {
        self.global_rules.iter().chain(self.file_rules.iter())
    }

    /// Analyze `files`
    pub fn analyze(&self, files: &[PathBuf]) -> AnalysisResult {
        let start = Instant::now();

        let metadata = file_metadata(files);
        let global = Arc::new(Almanac::global(Arc::clone(&self.registry)));
        global.add_runtime_fact(GLOBAL_FILE_METADATA, metadata.clone());
        let global_result = self.engine.run(&self.global_rules, &global);

        // Cached results for unchanged files; everything else is evaluated
        let mut cached: HashMap<usize, FileResult> = HashMap::new();
        if let Some(cache) = &self.cache {
            cache.set_config_hash(&self.cache_hash(&metadata));
            let changed: HashSet<PathBuf> = cache.get_changed_files(files).into_iter().collect();
            for (index, path) in files.iter().enumerate() {
                if changed.contains(path) {
                    continue;
                }
                if let Some(result) = cache.get_cached_result(path) {
                    cached.insert(index, result);
                }
            }
        }

        let pending: Vec<(usize, &PathBuf)> = files
            .iter()
            .enumerate()
            .filter(|(index, _)| !cached.contains_key(index))
            .collect();

        let evaluate = |(index, path): &(usize, &PathBuf)| (*index, self.analyze_file(path, &global));
        let evaluated: Vec<(usize, FileResult)> = match self.pool() {
            Some(pool) => pool.install(|| pending.par_iter().map(evaluate).collect()),
            None => pending.iter().map(evaluate).collect(),
        };

        if let Some(cache) = &self.cache {
            for (index, result) in &evaluated {
                // failures may be transient, so only clean results are reused
                let reusable = result.errors.is_empty().then(|| result.clone());
                cache.update_file_cache(&files[*index], reusable);
            }
            cache.flush();
        }

        let mut result = AnalysisResult {
            files_analyzed: evaluated.len(),
            files_from_cache: cached.len(),
            ..Default::default()
        };

        let mut by_index: HashMap<usize, FileResult> = evaluated.into_iter().collect();
        by_index.extend(cached);
        let mut ordered: Vec<(usize, FileResult)> = by_index.into_iter().collect();
        ordered.sort_by_key(|(index, _)| *index);

        result.absorb(&global_result);
        result.global = global_result;
        for (_, file_result) in ordered {
            result.absorb(&file_result);
            result.files.push(file_result);
        }

        result.duration = start.elapsed();
        result.duration_ms = result.duration.as_millis() as u64;

        info!(
            "Analyzed {} files ({} from cache): {} findings, {} execution errors in {:?}",
            files.len(),
            result.files_from_cache,
            result.finding_count(),
            result.execution_error_count,
            result.duration
        );
        result
    }

    /// Evaluate file rules against one file
    pub fn analyze_file(&self, path: &Path, global: &Arc<Almanac>) -> FileResult {
        let file = match FileData::load(path) {
            Ok(file) => file,
            Err(e) => {
                let mut result = FileResult::new(&path.to_string_lossy());
                result.errors.push(ExecutionError::new(
                    &result.file_path,
                    PluginError::error(format!("Failed to read file: {}", e)),
                ));
                return result;
            }
        };

        let rules = self
            .file_rules
            .iter()
            .filter(|r| !self.config.should_ignore_rule_for_file(&r.name, path));

        let almanac = Almanac::for_file(Arc::clone(&self.registry), file, Arc::clone(global));
        self.engine.run(rules, &almanac)
    }

    fn pool(&self) -> Option<rayon::ThreadPool> {
        if !self.config.engine.parallel {
            return None;
        }
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.engine.effective_jobs())
            .build()
            .map_err(|e| warn!("Falling back to sequential analysis: {}", e))
            .ok()
    }
}

fn file_metadata(files: &[PathBuf]) -> Value {
    files
        .iter()
        .map(|path| {
            let path = path.to_string_lossy();
            let data = FileData::new(&path, "");
            json!({ "fileName": data.file_name, "filePath": data.file_path })
        })
        .collect()
}
