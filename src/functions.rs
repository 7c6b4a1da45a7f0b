//! Custom function registry and per-environment catalog.
//!
//! The engine only needs a flat name → callable mapping. Building that
//! mapping from user-authored script sources is the caller's job; the
//! [`FunctionCatalog`] merely caches the result per
//! `(environment, script)` and rebuilds an entry when its source
//! digest changes.

use indexmap::IndexMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Arguments of a function call: positional values followed by
/// `key=value` pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    pub positional: Vec<Value>,
    pub named: IndexMap<String, Value>,
}

impl CallArgs {
    pub fn positional(values: Vec<Value>) -> Self {
        Self {
            positional: values,
            named: IndexMap::new(),
        }
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }
}

/// A callable exposed to `${name(args)}` tokens.
pub type CustomFn =
    Arc<dyn Fn(&CallArgs) -> anyhow::Result<Value> + Send + Sync>;

/// Flat name → callable mapping.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    version: u64,
    functions: HashMap<String, CustomFn>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionRegistry")
            .field("version", &self.version)
            .field("functions", &names)
            .finish()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Register `func` under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, func: F) -> &mut Self
    where
        F: Fn(&CallArgs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(func));
        self
    }

    pub fn get(&self, name: &str) -> Option<&CustomFn> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Copy every function of `other` into this registry. Entries of
    /// `other` win on name clashes.
    pub fn merge(&mut self, other: &FunctionRegistry) {
        for (name, func) in &other.functions {
            self.functions.insert(name.clone(), Arc::clone(func));
        }
        self.version = self.version.max(other.version);
    }
}

struct CatalogEntry {
    digest: String,
    registry: Arc<FunctionRegistry>,
}

/// Cache of registries keyed by `(environment, script name)`.
#[derive(Default)]
pub struct FunctionCatalog {
    entries: RwLock<HashMap<(String, String), CatalogEntry>>,
    builds: RwLock<u64>,
}

impl FunctionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the registry for `(env, script)`, calling `build` only
    /// when no entry exists or the source digest changed.
    pub fn get_or_build<B>(
        &self,
        env: &str,
        script: &str,
        source: &str,
        build: B,
    ) -> anyhow::Result<Arc<FunctionRegistry>>
    where
        B: FnOnce(&str) -> anyhow::Result<FunctionRegistry>,
    {
        let key = (env.to_string(), script.to_string());
        let digest = source_digest(source);

        if let Some(entry) = self.read_entries().get(&key) {
            if entry.digest == digest {
                return Ok(Arc::clone(&entry.registry));
            }
        }

        debug!(env, script, "Rebuilding function registry");
        let version = self.next_build();
        let registry = Arc::new(build(source)?.with_version(version));
        self.write_entries().insert(
            key,
            CatalogEntry {
                digest,
                registry: Arc::clone(&registry),
            },
        );
        Ok(registry)
    }

    /// Drop the cached registry of `(env, script)`.
    pub fn invalidate(&self, env: &str, script: &str) -> bool {
        self.write_entries()
            .remove(&(env.to_string(), script.to_string()))
            .is_some()
    }

    /// Merge every cached script registry of `env` into one.
    pub fn registry_for(&self, env: &str) -> FunctionRegistry {
        let entries = self.read_entries();
        let mut scripts: Vec<(&String, &CatalogEntry)> = entries
            .iter()
            .filter(|((e, _), _)| e == env)
            .map(|((_, script), entry)| (script, entry))
            .collect();
        scripts.sort_by(|a, b| a.0.cmp(b.0));

        let mut merged = FunctionRegistry::new();
        for (_, entry) in scripts {
            merged.merge(&entry.registry);
        }
        merged
    }

    fn next_build(&self) -> u64 {
        let mut builds = self
            .builds
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *builds += 1;
        *builds
    }

    fn read_entries(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<(String, String), CatalogEntry>>
    {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_entries(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<(String, String), CatalogEntry>>
    {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn source_digest(source: &str) -> String {
    let digest = Sha256::digest(source.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn upper_registry(_source: &str) -> anyhow::Result<FunctionRegistry> {
        let mut registry = FunctionRegistry::new();
        registry.register("upper", |args: &CallArgs| {
            let s = args
                .get(0)
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow::anyhow!("upper expects a string"))?;
            Ok(Value::String(s.to_uppercase()))
        });
        Ok(registry)
    }

    #[test]
    fn test_register_and_call() {
        let registry = upper_registry("").unwrap();
        let func = registry.get("upper").unwrap();
        let out = func(&CallArgs::positional(vec![json!("abc")])).unwrap();
        assert_eq!(out, json!("ABC"));
        assert!(func(&CallArgs::default()).is_err());
    }

    #[test]
    fn test_catalog_rebuilds_only_on_source_change() {
        let catalog = FunctionCatalog::new();
        let builds = AtomicUsize::new(0);
        let build = |src: &str| {
            builds.fetch_add(1, Ordering::SeqCst);
            upper_registry(src)
        };

        let first = catalog.get_or_build("test", "util", "v1", build).unwrap();
        let again = catalog.get_or_build("test", "util", "v1", build).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        let changed = catalog.get_or_build("test", "util", "v2", build).unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert!(changed.version() > first.version());

        assert!(catalog.invalidate("test", "util"));
        catalog.get_or_build("test", "util", "v2", build).unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_registry_for_merges_scripts_of_one_env() {
        let catalog = FunctionCatalog::new();
        catalog
            .get_or_build("test", "a", "", upper_registry)
            .unwrap();
        catalog
            .get_or_build("test", "b", "", |_| {
                let mut r = FunctionRegistry::new();
                r.register("one", |_: &CallArgs| Ok(json!(1)));
                Ok(r)
            })
            .unwrap();
        catalog
            .get_or_build("prod", "c", "", |_| {
                let mut r = FunctionRegistry::new();
                r.register("prod_only", |_: &CallArgs| Ok(Value::Null));
                Ok(r)
            })
            .unwrap();

        let merged = catalog.registry_for("test");
        assert!(merged.contains("upper"));
        assert!(merged.contains("one"));
        assert!(!merged.contains("prod_only"));
        assert_eq!(merged.len(), 2);
    }
}
