//! End-to-end runs through the public API

use fidelity::cache::FileAnalysisCache;
use fidelity::cleanup::{perform_startup_cleanup, CleanupOptions};
use fidelity::plugin_manager::PluginManager;
use fidelity::plugins::builtin::BuiltinPlugin;
use fidelity::report::write_result;
use fidelity::rule::load_rules_from_dir;
use fidelity::{
    Analyzer, Config, Fact, PluginError, PluginRegistry, RegistryHandle, Severity, StaticPlugin,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const LOGGING_RULE: &str = r#"{
    "name": "sensitiveLogging-iterative",
    "conditions": {
        "all": [
            {
                "fact": "fileData",
                "operator": "fileContains",
                "value": true,
                "params": { "checkPattern": ["console\\.log\\(.*password"] }
            }
        ]
    },
    "event": {
        "type": "warning",
        "params": { "message": "Password written to the console" }
    }
}"#;

fn builtin_registry() -> RegistryHandle {
    let mut registry = PluginRegistry::new();
    registry.register(Arc::new(BuiltinPlugin::new()));
    registry.into_handle()
}

fn write_project(root: &Path) -> Vec<PathBuf> {
    let src = root.join("src");
    fs::create_dir_all(&src).unwrap();
    let login = src.join("login.js");
    let util = src.join("util.js");
    fs::write(&login, "function login(password) {\n  console.log('pw', password);\n}\n").unwrap();
    fs::write(&util, "export const add = (a, b) => a + b;\n").unwrap();
    vec![login, util]
}

#[test]
fn test_rule_directory_end_to_end() {
    let temp = TempDir::new().unwrap();
    let files = write_project(temp.path());
    let rules_dir = temp.path().join("rules");
    fs::create_dir_all(&rules_dir).unwrap();
    fs::write(rules_dir.join("logging.json"), LOGGING_RULE).unwrap();

    let rules = load_rules_from_dir(&rules_dir).unwrap();
    let cache_file = temp.path().join(".xfiResults").join("fileCache.json");
    let cache = Arc::new(FileAnalysisCache::load(&cache_file, None));
    let analyzer = Analyzer::new(Config::new(), builtin_registry(), rules.clone())
        .with_cache(Arc::clone(&cache));

    let first = analyzer.analyze(&files);
    assert_eq!(first.files_analyzed, 2);
    assert_eq!(first.warning_count, 1);
    assert_eq!(first.files[0].events.len(), 1);
    assert_eq!(first.files[0].events[0].rule_name, "sensitiveLogging-iterative");
    assert_eq!(
        first.files[0].events[0].message(),
        Some("Password written to the console")
    );
    assert!(first.files[1].events.is_empty());
    assert_eq!(first.exit_code(), 0);
    assert!(cache_file.exists());

    // A fresh process reading the persisted cache
    let reloaded = Arc::new(FileAnalysisCache::load(&cache_file, None));
    let analyzer = Analyzer::new(Config::new(), builtin_registry(), rules).with_cache(reloaded);
    let second = analyzer.analyze(&files);
    assert_eq!(second.files_analyzed, 0);
    assert_eq!(second.files_from_cache, 2);
    assert_eq!(second.files[0].events, first.files[0].events);

    let report = write_result(&temp.path().join(".xfiResults"), &second).unwrap();
    let document: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(report).unwrap()).unwrap();
    assert_eq!(document["warningCount"], 1);
    assert_eq!(document["filesFromCache"], 2);
}

#[test]
fn test_edited_file_is_reanalyzed() {
    let temp = TempDir::new().unwrap();
    let files = write_project(temp.path());
    let rules_dir = temp.path().join("rules");
    fs::create_dir_all(&rules_dir).unwrap();
    fs::write(rules_dir.join("logging.json"), LOGGING_RULE).unwrap();
    let rules = load_rules_from_dir(&rules_dir).unwrap();

    let cache = Arc::new(FileAnalysisCache::load(&temp.path().join("cache.json"), None));
    let analyzer =
        Analyzer::new(Config::new(), builtin_registry(), rules).with_cache(Arc::clone(&cache));
    analyzer.analyze(&files);

    fs::write(&files[1], "console.log(password);\n").unwrap();
    let result = analyzer.analyze(&files);

    assert_eq!(result.files_analyzed, 1);
    assert_eq!(result.files_from_cache, 1);
    assert_eq!(result.warning_count, 2);
}

#[test]
fn test_manifest_plugin_rules() {
    let temp = TempDir::new().unwrap();
    let files = write_project(temp.path());
    let plugins_dir = temp.path().join("plugins");
    fs::create_dir_all(&plugins_dir).unwrap();
    fs::write(
        plugins_dir.join("arrow-style.yaml"),
        r#"
plugin:
  name: arrow-style
  version: "0.2.0"
facts:
  - name: arrowFunctions
    patterns: ["=>"]
rules:
  - name: prefer-function-declarations
    conditions:
      all:
        - fact: arrowFunctions
          path: $.count
          operator: greaterThan
          value: 0
    event:
      type: error
      params:
        message: "Arrow function found"
"#,
    )
    .unwrap();

    let mut manager = PluginManager::with_search_paths(vec![plugins_dir]);
    let loaded: Vec<String> = manager.load_all().into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(loaded, vec!["arrow-style".to_string()]);

    let mut registry = PluginRegistry::new();
    registry.register(Arc::new(BuiltinPlugin::new()));
    for plugin in manager.all_plugins() {
        registry.register(plugin);
    }
    let registry = registry.into_handle();
    assert!(registry.has_fact("arrowFunctions"));

    let rules = registry.sample_rules();
    let result = Analyzer::new(Config::new(), registry, rules).analyze(&files);

    // the builtin sample rule does not match; the manifest rule matches util.js
    assert!(result.files[0].events.is_empty());
    assert_eq!(result.files[1].events.len(), 1);
    assert_eq!(result.files[1].events[0].severity, Severity::Error);
    assert_eq!(result.exit_code(), 1);
}

#[test]
fn test_plugin_faults_are_isolated() {
    let mut registry = PluginRegistry::new();
    registry.register(Arc::new(
        StaticPlugin::new("unguarded", "1.0.0")
            .with_function("explode", |_| Err(anyhow::anyhow!("kaboom")))
            .with_function("ok", |_| Ok(json!("fine"))),
    ));
    registry.register(Arc::new(
        StaticPlugin::new("guarded", "1.0.0")
            .with_function("panics", |_| panic!("index out of range"))
            .with_error_hook(|fault| {
                PluginError::warning(format!("handled: {}", fault))
                    .with_details(json!({ "retry": false }))
            }),
    ));

    // No hook: the default translation is fatal and names the plugin
    let err = registry.invoke("unguarded", "explode", &[]).unwrap_err();
    assert_eq!(err.level, Severity::Fatal);
    assert!(err.message.contains("unguarded"));
    assert!(err.message.contains("kaboom"));

    // The hook's translation is returned as-is
    let err = registry.invoke("guarded", "panics", &[]).unwrap_err();
    assert_eq!(err.level, Severity::Warning);
    assert!(err.message.starts_with("handled: "));
    assert_eq!(err.details, Some(json!({ "retry": false })));

    // Earlier faults leave the registry usable
    assert_eq!(registry.invoke("unguarded", "ok", &[]).unwrap(), json!("fine"));
}

#[test]
fn test_failing_fact_does_not_stop_other_files() {
    let temp = TempDir::new().unwrap();
    let files = write_project(temp.path());

    let mut registry = PluginRegistry::new();
    registry.register(Arc::new(BuiltinPlugin::new()));
    registry.register(Arc::new(StaticPlugin::new("ast", "1.0.0").with_fact(Fact::new(
        "functionCount",
        |_, almanac| {
            if almanac.file().file_name == "login.js" {
                Err(anyhow::anyhow!("unexpected token"))
            } else {
                Ok(json!(1))
            }
        },
    ))));
    let registry = registry.into_handle();

    let rule: fidelity::RuleConfig = serde_json::from_value(json!({
        "name": "has-functions",
        "conditions": { "all": [{ "fact": "functionCount", "operator": "greaterThan", "value": 0 }] },
        "event": { "type": "warning", "params": { "message": "functions found" } }
    }))
    .unwrap();

    let result = Analyzer::new(Config::new(), registry, vec![rule]).analyze(&files);
    assert!(result.files[0].events.is_empty());
    assert_eq!(result.files[0].errors.len(), 1);
    assert_eq!(result.files[1].events.len(), 1);
    assert_eq!(result.execution_error_count, 1);
}

#[test]
fn test_startup_cleanup_keeps_newest_results() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path();
    for i in 0..15u64 {
        let path = dir.join(format!("XFI_RESULT-{}.json", 1_700_000_000_000 + i));
        fs::write(&path, "{}").unwrap();
        let mtime = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000 + i);
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();
    }
    fs::write(dir.join("XFI_RESULT.json"), "{}").unwrap();
    fs::write(dir.join("fileCache.json"), "{}").unwrap();
    fs::write(dir.join("run.log"), "").unwrap();

    let report = perform_startup_cleanup(dir, &CleanupOptions::default());
    assert_eq!(report.candidates, 15);
    assert_eq!(report.deleted.len(), 5);
    assert_eq!(report.kept.len(), 10);

    for i in 0..5u64 {
        assert!(!dir.join(format!("XFI_RESULT-{}.json", 1_700_000_000_000 + i)).exists());
    }
    for i in 5..15u64 {
        assert!(dir.join(format!("XFI_RESULT-{}.json", 1_700_000_000_000 + i)).exists());
    }
    assert!(dir.join("XFI_RESULT.json").exists());
    assert!(dir.join("fileCache.json").exists());
    assert!(dir.join("run.log").exists());
}
