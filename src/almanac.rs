//! Per-context fact memoization
//!
//! One almanac exists per evaluation context: the global context of a run,
//! or a single file. It memoizes fact values by `(fact name, params)` and
//! coalesces concurrent lookups of the same key into one computation.
//!
//! File almanacs hold a handle to the run's global almanac; facts declared
//! [`FactKind::Global`] are always resolved there, so they are computed once
//! per run no matter how many files ask for them.

use crate::fact::FactKind;
use crate::plugin::{PluginError, PluginResult};
use crate::registry::RegistryHandle;
use dashmap::DashMap;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::{self, ThreadId};

/// Pseudo file path of the global evaluation context
pub const GLOBAL_FILE_PATH: &str = "REPO_GLOBAL_CHECK";

/// The file an almanac evaluates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    pub file_name: String,
    pub file_path: String,
    pub file_content: String,
}

impl FileData {
    pub fn new(file_path: &str, file_content: &str) -> Self {
        let file_name = Path::new(file_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| file_path.to_string());

        Self {
            file_name,
            file_path: file_path.to_string(),
            file_content: file_content.to_string(),
        }
    }

    /// Read a file from disk
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::new(&path.to_string_lossy(), &content))
    }

    /// Data of the global (whole repository) context
    pub fn global() -> Self {
        Self {
            file_name: GLOBAL_FILE_PATH.to_string(),
            file_path: GLOBAL_FILE_PATH.to_string(),
            file_content: String::new(),
        }
    }

    pub fn is_global(&self) -> bool {
        self.file_path == GLOBAL_FILE_PATH
    }
}

type FactKey = (String, String);
type Slot = Arc<OnceLock<PluginResult>>;

/// Which thread computes each key and which key each blocked thread awaits
#[derive(Default)]
struct WaitGraph {
    owners: HashMap<FactKey, ThreadId>,
    waiting: HashMap<ThreadId, FactKey>,
}

impl WaitGraph {
    /// Whether `thread` waiting on `key` would close a cycle
    fn would_cycle(&self, thread: ThreadId, key: &FactKey) -> bool {
        let mut next = key;
        for _ in 0..=self.owners.len() {
            let Some(owner) = self.owners.get(next) else {
                return false;
            };
            if *owner == thread {
                return true;
            }
            match self.waiting.get(owner) {
                Some(awaited) => next = awaited,
                None => return false,
            }
        }
        false
    }
}

/// Memoization and fact-injection surface for one evaluation context
pub struct Almanac {
    registry: RegistryHandle,
    file: FileData,
    global: Option<Arc<Almanac>>,
    memo: DashMap<FactKey, Slot>,
    graph: Mutex<WaitGraph>,
    computations: AtomicUsize,
}

impl Almanac {
    /// Almanac for the global context of a run
    pub fn global(registry: RegistryHandle) -> Self {
        Self::new(registry, FileData::global(), None)
    }

    /// Almanac for one file; `global` serves the run's global facts
    pub fn for_file(registry: RegistryHandle, file: FileData, global: Arc<Almanac>) -> Self {
        Self::new(registry, file, Some(global))
    }

    pub fn new(registry: RegistryHandle, file: FileData, global: Option<Arc<Almanac>>) -> Self {
        Self {
            registry,
            file,
            global,
            memo: DashMap::new(),
            graph: Mutex::default(),
            computations: AtomicUsize::new(0),
        }
    }

    /// The file this almanac evaluates
    pub fn file(&self) -> &FileData {
        &self.file
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    /// Resolve a fact value, computing it at most once per key.
    ///
    /// Concurrent callers asking for a key that is being computed block until
    /// the first computation finishes and share its result. Failures are
    /// memoized like values.
    pub fn fact_value(&self, name: &str, params: &Value) -> PluginResult {
        let key = fact_key(name, params);

        if let Some(slot) = self.memo.get(&key).map(|s| Arc::clone(&s)) {
            return self.resolve(slot, key, params);
        }

        if let Some(global) = &self.global {
            let is_global = self
                .registry
                .fact(name)
                .is_some_and(|f| f.fact.kind() == FactKind::Global);
            if is_global {
                return global.fact_value(name, params);
            }
        }

        let slot = Arc::clone(&self.memo.entry(key.clone()).or_default());
        self.resolve(slot, key, params)
    }

    fn resolve(&self, slot: Slot, key: FactKey, params: &Value) -> PluginResult {
        if let Some(result) = slot.get() {
            return result.clone();
        }

        // A fact that ends up waiting on itself, directly or through other
        // threads' computations, fails instead of blocking forever
        let current = thread::current().id();
        {
            let mut graph = self.graph();
            if graph.would_cycle(current, &key) {
                return Err(PluginError::fatal(format!(
                    "Circular dependency while computing fact '{}'",
                    key.0
                )));
            }
            graph.waiting.insert(current, key.clone());
        }

        let result = slot
            .get_or_init(|| {
                {
                    let mut graph = self.graph();
                    graph.waiting.remove(&current);
                    graph.owners.insert(key.clone(), current);
                }
                self.computations.fetch_add(1, Ordering::SeqCst);
                debug!("Computing fact '{}' for {}", key.0, self.file.file_path);
                let result = self.registry.compute_fact(&key.0, params, self);
                self.graph().owners.remove(&key);
                result
            })
            .clone();

        self.graph().waiting.remove(&current);
        result
    }

    fn graph(&self) -> MutexGuard<'_, WaitGraph> {
        self.graph.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Inject a value directly into the memo table, bypassing the registry.
    ///
    /// The store is append-only: returns `false` and keeps the existing
    /// value when the name is already present.
    pub fn add_runtime_fact(&self, name: &str, value: Value) -> bool {
        let key = fact_key(name, &Value::Null);
        let mut inserted = false;
        self.memo.entry(key).or_insert_with(|| {
            inserted = true;
            Arc::new(OnceLock::from(Ok(value)))
        });
        if !inserted {
            debug!("Runtime fact '{}' already present; keeping the first value", name);
        }
        inserted
    }

    /// Number of fact computations this almanac has started
    pub fn computations(&self) -> usize {
        self.computations.load(Ordering::SeqCst)
    }

    /// Number of memoized keys
    pub fn cached_count(&self) -> usize {
        self.memo.len()
    }
}

fn fact_key(name: &str, params: &Value) -> FactKey {
    // serde_json maps are ordered by key, so this is a canonical signature
    let signature = serde_json::to_string(params).unwrap_or_default();
    (name.to_string(), signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::Severity;
    use crate::fact::Fact;
    use crate::plugin::StaticPlugin;
    use crate::registry::PluginRegistry;
    use serde_json::json;
    use std::time::Duration;

    fn counted_registry(counter: Arc<AtomicUsize>, delay: Duration) -> RegistryHandle {
        let global_counter = Arc::clone(&counter);
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(
            StaticPlugin::new("test", "1.0.0")
                .with_fact(Fact::new("counted", move |params, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(delay);
                    Ok(json!({ "params": params.clone() }))
                }))
                .with_fact(
                    Fact::new("repoWide", move |_, _| {
                        global_counter.fetch_add(1, Ordering::SeqCst);
                        Ok(json!("repo"))
                    })
                    .global(),
                )
                .with_fact(Fact::new("fileName", |_, almanac| {
                    Ok(json!(almanac.file().file_name))
                }))
                .with_fact(Fact::new("failing", |_, _| Err(anyhow::anyhow!("no data"))))
                .with_fact(Fact::new("selfReferencing", |params, almanac| {
                    almanac.fact_value("selfReferencing", params).map_err(anyhow::Error::new)
                })),
        ));
        registry.into_handle()
    }

    #[test]
    fn test_memoizes_per_key() {
        let counter = Arc::new(AtomicUsize::new(0));
        let almanac = Almanac::global(counted_registry(Arc::clone(&counter), Duration::ZERO));

        let first = almanac.fact_value("counted", &json!({"a": 1})).unwrap();
        let second = almanac.fact_value("counted", &json!({"a": 1})).unwrap();
        assert_eq!(first, second);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        almanac.fact_value("counted", &json!({"a": 2})).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(almanac.computations(), 2);
    }

    #[test]
    fn test_param_key_order_does_not_matter() {
        let counter = Arc::new(AtomicUsize::new(0));
        let almanac = Almanac::global(counted_registry(Arc::clone(&counter), Duration::ZERO));

        almanac.fact_value("counted", &json!({"a": 1, "b": 2})).unwrap();
        almanac.fact_value("counted", &json!({"b": 2, "a": 1})).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_lookups_are_single_flight() {
        let counter = Arc::new(AtomicUsize::new(0));
        let almanac = Arc::new(Almanac::global(counted_registry(
            Arc::clone(&counter),
            Duration::from_millis(50),
        )));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let almanac = Arc::clone(&almanac);
                thread::spawn(move || almanac.fact_value("counted", &Value::Null))
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failures_are_memoized() {
        let counter = Arc::new(AtomicUsize::new(0));
        let almanac = Almanac::global(counted_registry(counter, Duration::ZERO));

        let err = almanac.fact_value("failing", &Value::Null).unwrap_err();
        assert_eq!(err.level, Severity::Fatal);
        assert!(almanac.fact_value("failing", &Value::Null).is_err());
        assert_eq!(almanac.computations(), 1);
    }

    #[test]
    fn test_unknown_fact_is_fatal() {
        let counter = Arc::new(AtomicUsize::new(0));
        let almanac = Almanac::global(counted_registry(counter, Duration::ZERO));
        let err = almanac.fact_value("nope", &Value::Null).unwrap_err();
        assert_eq!(err.level, Severity::Fatal);
    }

    #[test]
    fn test_runtime_fact_bypasses_registry() {
        let counter = Arc::new(AtomicUsize::new(0));
        let almanac = Almanac::global(counted_registry(counter, Duration::ZERO));

        assert!(almanac.add_runtime_fact("derived", json!([1, 2, 3])));
        assert_eq!(almanac.fact_value("derived", &Value::Null), Ok(json!([1, 2, 3])));

        // append-only
        assert!(!almanac.add_runtime_fact("derived", json!("other")));
        assert_eq!(almanac.fact_value("derived", &Value::Null), Ok(json!([1, 2, 3])));
        assert_eq!(almanac.computations(), 0);
    }

    #[test]
    fn test_global_facts_computed_once_across_files() {
        let counter = Arc::new(AtomicUsize::new(0));
        let registry = counted_registry(Arc::clone(&counter), Duration::ZERO);
        let global = Arc::new(Almanac::global(Arc::clone(&registry)));

        let a = Almanac::for_file(
            Arc::clone(&registry),
            FileData::new("src/a.rs", "a"),
            Arc::clone(&global),
        );
        let b = Almanac::for_file(
            Arc::clone(&registry),
            FileData::new("src/b.rs", "b"),
            Arc::clone(&global),
        );

        a.fact_value("repoWide", &Value::Null).unwrap();
        b.fact_value("repoWide", &Value::Null).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(global.computations(), 1);
        assert_eq!(a.computations(), 0);
    }

    #[test]
    fn test_iterative_facts_see_their_file() {
        let counter = Arc::new(AtomicUsize::new(0));
        let registry = counted_registry(counter, Duration::ZERO);
        let global = Arc::new(Almanac::global(Arc::clone(&registry)));
        let almanac = Almanac::for_file(registry, FileData::new("src/lib.rs", ""), global);

        assert_eq!(almanac.fact_value("fileName", &Value::Null), Ok(json!("lib.rs")));
    }

    #[test]
    fn test_circular_fact_is_reported() {
        let counter = Arc::new(AtomicUsize::new(0));
        let almanac = Almanac::global(counted_registry(counter, Duration::ZERO));
        let err = almanac.fact_value("selfReferencing", &Value::Null).unwrap_err();
        assert_eq!(err.level, Severity::Fatal);
    }

    #[test]
    fn test_cycle_across_threads_fails_instead_of_hanging() {
        use std::sync::{mpsc, Barrier};

        let barrier = Arc::new(Barrier::new(2));
        let (ping_barrier, pong_barrier) = (Arc::clone(&barrier), barrier);
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(
            StaticPlugin::new("mutual", "1.0.0")
                .with_fact(Fact::new("ping", move |_, almanac| {
                    ping_barrier.wait();
                    Ok(almanac.fact_value("pong", &Value::Null)?)
                }))
                .with_fact(Fact::new("pong", move |_, almanac| {
                    pong_barrier.wait();
                    Ok(almanac.fact_value("ping", &Value::Null)?)
                })),
        ));
        let almanac = Arc::new(Almanac::global(registry.into_handle()));

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let handles: Vec<_> = ["ping", "pong"]
                .into_iter()
                .map(|name| {
                    let almanac = Arc::clone(&almanac);
                    thread::spawn(move || almanac.fact_value(name, &Value::Null))
                })
                .collect();
            let results: Vec<PluginResult> =
                handles.into_iter().map(|h| h.join().unwrap()).collect();
            tx.send(results).unwrap();
        });

        let results = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("mutually dependent facts deadlocked");
        assert!(results.iter().all(Result::is_err));
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .any(|e| e.message.contains("Circular dependency")));
    }

    #[test]
    fn test_file_data() {
        let data = FileData::new("dir/file.txt", "hello");
        assert_eq!(data.file_name, "file.txt");
        assert!(!data.is_global());
        assert!(FileData::global().is_global());
    }
}
