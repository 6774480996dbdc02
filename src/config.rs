//! Configuration
//!
//! Reads configuration from:
//! - `.fidelityrc.yaml` / `.fidelityrc.json` / `fidelity.yaml` (project-level)
//! - the same names in the home directory (user-level)

use crate::cache::CACHE_FILE_NAME;
use crate::diagnostic::Severity;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid glob pattern: {0}")]
    Glob(#[from] globset::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Config file names, in lookup order
pub const CONFIG_FILE_NAMES: [&str; 5] = [
    ".fidelityrc.yaml",
    ".fidelityrc.yml",
    ".fidelityrc.json",
    "fidelity.yaml",
    "fidelity.json",
];

/// Engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Enable parallel processing
    pub parallel: bool,

    /// Number of parallel jobs (0 = auto-detect)
    pub jobs: usize,

    /// Enable the incremental result cache
    pub cache: bool,

    /// Hours a cache entry survives without being read or written
    pub cache_ttl_hours: u64,

    /// Directory holding result reports and the cache document
    pub results_dir: PathBuf,

    /// Historical result reports kept by startup cleanup
    pub max_result_files: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            jobs: 0,
            cache: true,
            cache_ttl_hours: 24,
            results_dir: PathBuf::from(".xfiResults"),
            max_result_files: 10,
        }
    }
}

impl EngineConfig {
    /// Worker count, resolving 0 to the number of CPUs
    pub fn effective_jobs(&self) -> usize {
        if !self.parallel {
            1
        } else if self.jobs == 0 {
            num_cpus::get()
        } else {
            self.jobs
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_hours * 60 * 60)
    }

    /// Location of the cache document
    pub fn cache_file(&self) -> PathBuf {
        self.results_dir.join(CACHE_FILE_NAME)
    }
}

/// File handling settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    /// Include patterns
    pub include: Vec<String>,

    /// Exclude patterns
    pub exclude: Vec<String>,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            include: vec!["**/*".to_string()],
            exclude: vec![
                "**/node_modules/**".to_string(),
                "**/target/**".to_string(),
                "**/.git/**".to_string(),
                "**/.xfiResults/**".to_string(),
            ],
        }
    }
}

impl FilesConfig {
    /// Compile include/exclude patterns into a matcher
    pub fn matcher(&self) -> Result<FileMatcher, ConfigError> {
        Ok(FileMatcher {
            include: build_globset(&self.include)?,
            exclude: build_globset(&self.exclude)?,
        })
    }
}

/// Compiled include/exclude globs
#[derive(Debug, Clone)]
pub struct FileMatcher {
    include: GlobSet,
    exclude: GlobSet,
}

impl FileMatcher {
    pub fn is_match(&self, path: &Path) -> bool {
        let path = path.strip_prefix("./").unwrap_or(path);
        !self.exclude.is_match(path) && (self.include.is_empty() || self.include.is_match(path))
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, ConfigError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Rule configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Directories of rule documents
    pub dirs: Vec<PathBuf>,

    /// Disabled rules
    pub disabled: Vec<String>,

    /// Enabled rules (empty = all)
    pub enabled: Vec<String>,

    /// Severity overrides (rule name -> severity)
    pub severity: BTreeMap<String, Severity>,

    /// Per-file rule ignores (glob pattern -> rule names or "all")
    pub per_file: BTreeMap<String, Vec<String>>,
}

/// Manifest plugin settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Extra manifest search paths, searched before the defaults
    pub paths: Vec<PathBuf>,

    /// Plugin names not to load
    pub disabled: Vec<String>,
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Extend from other configuration files
    pub extends: Vec<String>,

    /// Engine settings
    pub engine: EngineConfig,

    /// File handling settings
    pub files: FilesConfig,

    /// Rule configuration
    pub rules: RulesConfig,

    /// Manifest plugin settings
    pub plugins: PluginsConfig,
}

impl Config {
    /// Create default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::load_with_depth(path, 0)
    }

    /// Load with recursion depth limit (to prevent infinite loops)
    fn load_with_depth(path: &Path, depth: usize) -> Result<Self, ConfigError> {
        const MAX_DEPTH: usize = 10;
        if depth >= MAX_DEPTH {
            return Err(ConfigError::Invalid(
                "Maximum config inheritance depth exceeded".to_string(),
            ));
        }

        let content = std::fs::read_to_string(path)?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let mut config: Self = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&content)?,
            "json" => serde_json::from_str(&content)?,
            _ => {
                return Err(ConfigError::Invalid(format!(
                    "Unknown config file format: {}",
                    ext
                )))
            }
        };

        let base_dir = path.parent().unwrap_or(Path::new("."));
        config.resolve_paths(base_dir);

        if !config.extends.is_empty() {
            let mut base_config = Self::default();

            for extend in &config.extends.clone() {
                let extend_path = if Path::new(extend).is_absolute() {
                    PathBuf::from(extend)
                } else {
                    base_dir.join(extend)
                };
                base_config.merge(Self::load_with_depth(&extend_path, depth + 1)?);
            }

            base_config.merge(config);
            config = base_config;
        }

        Ok(config)
    }

    /// Make rule and plugin directories relative to the config file
    fn resolve_paths(&mut self, base_dir: &Path) {
        for dir in self.rules.dirs.iter_mut().chain(self.plugins.paths.iter_mut()) {
            if dir.is_relative() {
                *dir = base_dir.join(&*dir);
            }
        }
    }

    /// Merge another config into this one (other takes precedence)
    pub fn merge(&mut self, other: Self) {
        let defaults = EngineConfig::default();

        if other.engine.jobs != 0 {
            self.engine.jobs = other.engine.jobs;
        }
        self.engine.parallel = other.engine.parallel;
        self.engine.cache = other.engine.cache;
        if other.engine.cache_ttl_hours != defaults.cache_ttl_hours {
            self.engine.cache_ttl_hours = other.engine.cache_ttl_hours;
        }
        if other.engine.results_dir != defaults.results_dir {
            self.engine.results_dir = other.engine.results_dir;
        }
        if other.engine.max_result_files != defaults.max_result_files {
            self.engine.max_result_files = other.engine.max_result_files;
        }

        if other.files != FilesConfig::default() {
            self.files.include = other.files.include;
            self.files.exclude.extend(other.files.exclude);
        }

        self.rules.dirs.extend(other.rules.dirs);
        self.rules.disabled.extend(other.rules.disabled);
        if !other.rules.enabled.is_empty() {
            self.rules.enabled = other.rules.enabled;
        }
        self.rules.severity.extend(other.rules.severity);
        for (pattern, rules) in other.rules.per_file {
            self.rules.per_file.entry(pattern).or_default().extend(rules);
        }

        self.plugins.paths.extend(other.plugins.paths);
        self.plugins.disabled.extend(other.plugins.disabled);
    }

    /// Load configuration from default locations
    pub fn load_default() -> Result<Self, ConfigError> {
        // Check current directory
        for name in &CONFIG_FILE_NAMES {
            let path = PathBuf::from(name);
            if path.exists() {
                return Self::load(&path);
            }
        }

        // Check home directory
        if let Some(home) = dirs::home_dir() {
            for name in &CONFIG_FILE_NAMES {
                let path = home.join(name);
                if path.exists() {
                    return Self::load(&path);
                }
            }
        }

        Ok(Self::default())
    }

    /// Merge CLI arguments into configuration
    pub fn merge_cli(
        &mut self,
        jobs: Option<usize>,
        cache: Option<bool>,
        rules_dirs: Vec<PathBuf>,
        plugin_dirs: Vec<PathBuf>,
        max_result_files: Option<usize>,
    ) {
        if let Some(j) = jobs {
            self.engine.jobs = j;
        }
        if let Some(c) = cache {
            self.engine.cache = c;
        }
        self.rules.dirs.extend(rules_dirs);
        self.plugins.paths.extend(plugin_dirs);
        if let Some(max) = max_result_files {
            self.engine.max_result_files = max;
        }
    }

    /// Check if a rule is enabled
    pub fn is_rule_enabled(&self, rule_name: &str) -> bool {
        if self.rules.disabled.iter().any(|r| r == rule_name) {
            return false;
        }

        if !self.rules.enabled.is_empty() {
            return self.rules.enabled.iter().any(|r| r == rule_name);
        }

        true
    }

    /// Get severity override for a rule
    pub fn get_severity_override(&self, rule_name: &str) -> Option<Severity> {
        self.rules.severity.get(rule_name).copied()
    }

    /// Check if a rule should be ignored for a file
    pub fn should_ignore_rule_for_file(&self, rule_name: &str, file_path: &Path) -> bool {
        let file_str = file_path.to_string_lossy();

        for (pattern, rules) in &self.rules.per_file {
            if let Ok(glob) = Glob::new(pattern) {
                let matcher = glob.compile_matcher();
                if matcher.is_match(file_str.as_ref())
                    && rules.iter().any(|r| r == "all" || r == rule_name)
                {
                    return true;
                }
            }
        }

        false
    }
}

/// Hash a config for cache invalidation
pub fn hash_config(config: &impl Serialize) -> String {
    use sha2::{Digest, Sha256};

    let json = serde_json::to_string(config).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    format!("{:x}", hasher.finalize())
}
