//! Fidelity CLI - framework adherence analysis
//!
//! Evaluates rules from the built-in plugin, manifest plugins and rule
//! directories against a set of files.

use clap::Parser;
use colored::Colorize;
use fidelity::cache::FileAnalysisCache;
use fidelity::cleanup::{perform_startup_cleanup, CleanupOptions};
use fidelity::config::{Config, FileMatcher};
use fidelity::plugin_manager::PluginManager;
use fidelity::plugins::builtin::BuiltinPlugin;
use fidelity::registry::{in_plugin_call, PluginRegistry, RegistryHandle};
use fidelity::report;
use fidelity::rule::{load_rules_from_dir, merge_rules, RuleConfig};
use fidelity::Analyzer;
use glob::glob;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "fidelity",
    version,
    about = "Framework adherence analysis",
    long_about = "Evaluates declarative rules over facts computed from a codebase and reports findings."
)]
struct Cli {
    /// Files, directories or glob patterns to analyze
    #[arg(default_value = ".")]
    paths: Vec<String>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Rule document directory (repeatable)
    #[arg(long)]
    rules_dir: Vec<PathBuf>,

    /// Manifest plugin directory (repeatable)
    #[arg(long)]
    plugins_dir: Vec<PathBuf>,

    /// Number of parallel jobs (0 = auto)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Disable the incremental result cache
    #[arg(long)]
    no_cache: bool,

    /// Drop all cached results before analyzing
    #[arg(long)]
    clear_cache: bool,

    /// Show cache statistics after the run
    #[arg(long)]
    cache_stats: bool,

    /// Report which old result files would be removed without deleting them
    #[arg(long)]
    dry_run_cleanup: bool,

    /// Historical result files to keep
    #[arg(long)]
    max_results: Option<usize>,

    /// List available facts and exit
    #[arg(long)]
    list_facts: bool,

    /// List available operators and exit
    #[arg(long)]
    list_operators: bool,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Show per-rule timing statistics
    #[arg(long)]
    timing: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Exit with 0 even if errors are found
    #[arg(long)]
    exit_zero: bool,
}

fn main() {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    // Plugin panics are recovered and reported as execution errors; keep
    // the default stderr dump for everything else
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        if in_plugin_call() {
            log::debug!("Recovered plugin panic: {}", info);
        } else {
            default_hook(info);
        }
    }));

    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path).unwrap_or_else(|e| {
            eprintln!("{}: Failed to load config: {}", "error".red().bold(), e);
            std::process::exit(1);
        })
    } else {
        Config::load_default().unwrap_or_else(|e| {
            eprintln!("{}: Ignoring config: {}", "warning".yellow(), e);
            Config::default()
        })
    };

    config.merge_cli(
        cli.jobs,
        cli.no_cache.then_some(false),
        cli.rules_dir.clone(),
        cli.plugins_dir.clone(),
        cli.max_results,
    );

    // Housekeeping before anything writes new results
    let cleanup = perform_startup_cleanup(
        &config.engine.results_dir,
        &CleanupOptions::default()
            .with_max_files(config.engine.max_result_files)
            .dry_run(cli.dry_run_cleanup),
    );
    if cleanup.dry_run {
        for path in &cleanup.deleted {
            eprintln!("Would remove {}", path.display());
        }
    } else if cli.verbose && !cleanup.deleted.is_empty() {
        eprintln!("Removed {} old result files", cleanup.deleted.len());
    }
    for (path, e) in &cleanup.failed {
        eprintln!(
            "{}: Failed to remove {}: {}",
            "warning".yellow(),
            path.display(),
            e
        );
    }

    let registry = build_registry(&config, cli.verbose);

    if cli.list_facts || cli.list_operators {
        if cli.list_facts {
            print_facts(&registry);
        }
        if cli.list_operators {
            print_operators(&registry);
        }
        return;
    }

    let rules = load_rules(&config, &registry, cli.verbose);
    if rules.is_empty() {
        eprintln!("{}: No rules to evaluate", "error".red().bold());
        std::process::exit(1);
    }

    // Expand paths and glob patterns
    let matcher = config.files.matcher().unwrap_or_else(|e| {
        eprintln!("{}: Invalid file patterns: {}", "error".red().bold(), e);
        std::process::exit(1);
    });
    let files = collect_files(&cli.paths, &matcher).unwrap_or_else(|e| {
        eprintln!("{}: {}", "error".red().bold(), e);
        std::process::exit(1);
    });

    if files.is_empty() {
        eprintln!("{}: No files found to analyze", "error".red().bold());
        std::process::exit(1);
    }

    if cli.verbose {
        eprintln!(
            "Analyzing {} files with {} rules...",
            files.len(),
            rules.len()
        );
    }

    let cache_path = config.engine.cache_file();
    if cli.clear_cache {
        FileAnalysisCache::load(&cache_path, None).clear_cache();
        if cli.verbose {
            eprintln!("Cleared cache: {}", cache_path.display());
        }
    }

    let cache = config.engine.cache.then(|| {
        if cli.verbose {
            eprintln!("Using cache: {}", cache_path.display());
        }
        Arc::new(FileAnalysisCache::load(
            &cache_path,
            Some(config.engine.cache_ttl()),
        ))
    });

    let results_dir = config.engine.results_dir.clone();
    let mut analyzer = Analyzer::new(config, registry, rules);
    if let Some(cache) = &cache {
        analyzer = analyzer.with_cache(Arc::clone(cache));
    }

    let result = analyzer.analyze(&files);

    // Output results
    if cli.json {
        match report::format_json(&result) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("{}: Failed to serialize result: {}", "error".red().bold(), e);
                std::process::exit(1);
            }
        }
    } else {
        print!("{}", report::format_text(&result, !cli.no_color));
    }

    if cli.timing {
        eprintln!();
        eprintln!("{}", report::format_timings(&result));
    }

    if cli.cache_stats {
        match &cache {
            Some(cache) => {
                let stats = cache.get_cache_stats();
                eprintln!();
                eprintln!(
                    "Cache: {} entries ({} with results, {} events), {} hits, {} misses ({:.1}% hit rate)",
                    stats.total_entries,
                    stats.entries_with_results,
                    stats.total_events,
                    stats.hits,
                    stats.misses,
                    stats.hit_rate()
                );
            }
            None => eprintln!("Cache disabled"),
        }
    }

    match report::write_result(&results_dir, &result) {
        Ok(path) => {
            if cli.verbose {
                eprintln!("Wrote {}", path.display());
            }
        }
        Err(e) => eprintln!(
            "{}: Failed to write result to {}: {}",
            "warning".yellow(),
            results_dir.display(),
            e
        ),
    }

    let exit_code = if cli.exit_zero { 0 } else { result.exit_code() };
    std::process::exit(exit_code);
}

/// Built-in plugin first, then manifest plugins not disabled by config
fn build_registry(config: &Config, verbose: bool) -> RegistryHandle {
    let mut registry = PluginRegistry::new();
    registry.register(Arc::new(BuiltinPlugin::new()));

    let mut plugin_manager = PluginManager::new();
    for path in config.plugins.paths.iter().rev() {
        plugin_manager.add_search_path(path.clone());
    }

    for result in plugin_manager.load_all() {
        match result {
            Ok(name) => {
                if verbose {
                    eprintln!("Loaded plugin: {}", name.cyan());
                }
            }
            Err(e) => eprintln!("{}: {}", "warning".yellow(), e),
        }
    }

    for plugin in plugin_manager.all_plugins() {
        if config.plugins.disabled.iter().any(|d| d == plugin.name()) {
            if verbose {
                eprintln!("Skipping disabled plugin: {}", plugin.name());
            }
            continue;
        }
        registry.register(plugin);
    }

    registry.into_handle()
}

/// Rules from the configured directories, or the plugins' sample rules
/// when none are configured
fn load_rules(config: &Config, registry: &RegistryHandle, verbose: bool) -> Vec<RuleConfig> {
    let mut rules = Vec::new();
    for dir in &config.rules.dirs {
        match load_rules_from_dir(dir) {
            Ok(loaded) => {
                if verbose {
                    eprintln!("Loaded {} rules from {}", loaded.len(), dir.display());
                }
                rules.extend(loaded);
            }
            Err(e) => eprintln!(
                "{}: Failed to load rules from {}: {}",
                "warning".yellow().bold(),
                dir.display(),
                e
            ),
        }
    }

    if rules.is_empty() {
        rules = registry.sample_rules();
        if verbose {
            eprintln!("Using {} sample rules from plugins", rules.len());
        }
    }

    merge_rules(rules)
}

/// Expand files, directories and glob patterns into a sorted file list.
///
/// Files named explicitly are always kept; expanded entries must pass
/// the include/exclude patterns.
fn collect_files(inputs: &[String], matcher: &FileMatcher) -> Result<Vec<PathBuf>, String> {
    let mut files = BTreeSet::new();

    for input in inputs {
        let path = Path::new(input);
        if path.is_file() {
            files.insert(path.to_path_buf());
            continue;
        }

        let pattern = if path.is_dir() {
            format!("{}/**/*", glob::Pattern::escape(input.trim_end_matches('/')))
        } else {
            input.clone()
        };

        let entries = glob(&pattern).map_err(|e| format!("Invalid pattern '{}': {}", input, e))?;
        for entry in entries.flatten() {
            if entry.is_file() && matcher.is_match(&entry) {
                files.insert(entry);
            }
        }
    }

    Ok(files.into_iter().collect())
}

fn print_facts(registry: &PluginRegistry) {
    println!("{}", "Facts:".bold());
    let mut facts: Vec<_> = registry.facts().collect();
    facts.sort_by_key(|f| (f.priority(), f.name().to_string()));
    for fact in facts {
        let plugin = registry
            .fact(fact.name())
            .map(|r| r.plugin.name())
            .unwrap_or("-");
        println!(
            "  {:<32} {:<10} priority {:<5} {}",
            fact.name().cyan(),
            fact.kind().to_string(),
            fact.priority(),
            plugin.dimmed()
        );
    }
}

fn print_operators(registry: &PluginRegistry) {
    println!("{}", "Operators:".bold());
    let mut operators: Vec<_> = registry.operators().map(|o| o.name()).collect();
    operators.sort_unstable();
    for name in operators {
        let plugin = registry
            .operator(name)
            .map(|r| r.plugin.name())
            .unwrap_or("-");
        println!("  {:<32} {}", name.cyan(), plugin.dimmed());
    }
}
