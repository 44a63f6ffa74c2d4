//! Namespaced key/value memory shared by checks within one run
//!
//! Every operation takes the single store lock, so mutations are serialized
//! and immediately visible to subsequent readers. The store is owned by the
//! runner and handed to providers and expressions as an `Arc`.

use crate::error::{EngineError, EngineResult, ErrorCode};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

pub const DEFAULT_NAMESPACE: &str = "default";

type Namespaces = BTreeMap<String, BTreeMap<String, Value>>;

#[derive(Debug)]
pub struct MemoryStore {
    default_namespace: String,
    data: Mutex<Namespaces>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl MemoryStore {
    pub fn new(default_namespace: impl Into<String>) -> Self {
        Self {
            default_namespace: default_namespace.into(),
            data: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    fn lock(&self) -> MutexGuard<'_, Namespaces> {
        // A panic while holding the lock leaves the map itself intact
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ns<'a>(&'a self, namespace: Option<&'a str>) -> &'a str {
        namespace.unwrap_or(&self.default_namespace)
    }

    pub fn get(&self, key: &str, namespace: Option<&str>) -> Option<Value> {
        self.lock()
            .get(self.ns(namespace))
            .and_then(|table| table.get(key))
            .cloned()
    }

    pub fn has(&self, key: &str, namespace: Option<&str>) -> bool {
        self.lock()
            .get(self.ns(namespace))
            .is_some_and(|table| table.contains_key(key))
    }

    pub fn set(&self, key: &str, value: Value, namespace: Option<&str>) {
        let ns = self.ns(namespace).to_string();
        self.lock()
            .entry(ns)
            .or_default()
            .insert(key.to_string(), value);
    }

    /// Keys of a namespace in sorted order
    pub fn list(&self, namespace: Option<&str>) -> Vec<String> {
        self.lock()
            .get(self.ns(namespace))
            .map(|table| table.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Add `amount` to a numeric value, treating a missing key as zero
    pub fn increment(&self, key: &str, amount: f64, namespace: Option<&str>) -> EngineResult<Value> {
        let ns = self.ns(namespace).to_string();
        let mut data = self.lock();
        let table = data.entry(ns.clone()).or_default();
        let current = match table.get(key) {
            None | Some(Value::Null) => 0.0,
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            Some(other) => {
                return Err(EngineError::memory(
                    ErrorCode::MEMORY_NOT_NUMERIC,
                    format!("cannot increment non-numeric value {} in namespace '{}'", other, ns),
                    Some(key.to_string()),
                ))
            }
        };
        let next = crate::expression::value::number(current + amount);
        table.insert(key.to_string(), next.clone());
        Ok(next)
    }

    /// Append to an array, creating it if missing; a scalar becomes `[old, new]`
    pub fn append(&self, key: &str, value: Value, namespace: Option<&str>) -> Value {
        let ns = self.ns(namespace).to_string();
        let mut data = self.lock();
        let table = data.entry(ns).or_default();
        let next = match table.remove(key) {
            None | Some(Value::Null) => Value::Array(vec![value]),
            Some(Value::Array(mut items)) => {
                items.push(value);
                Value::Array(items)
            }
            Some(old) => Value::Array(vec![old, value]),
        };
        table.insert(key.to_string(), next.clone());
        next
    }

    pub fn delete(&self, key: &str, namespace: Option<&str>) -> bool {
        self.lock()
            .get_mut(self.ns(namespace))
            .is_some_and(|table| table.remove(key).is_some())
    }

    /// Clear one namespace, or every namespace when `None`
    pub fn clear(&self, namespace: Option<&str>) {
        let mut data = self.lock();
        match namespace {
            Some(ns) => {
                data.remove(ns);
            }
            None => data.clear(),
        }
    }

    pub fn get_all(&self, namespace: Option<&str>) -> Map<String, Value> {
        self.lock()
            .get(self.ns(namespace))
            .map(|table| table.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    /// Every namespace as a nested JSON object
    pub fn to_json(&self) -> Value {
        let data = self.lock();
        let namespaces = data
            .iter()
            .map(|(ns, table)| {
                let entries = table.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                (ns.clone(), Value::Object(entries))
            })
            .collect();
        Value::Object(namespaces)
    }

    /// Merge a persisted file into the store; a missing file is not an error
    pub async fn load_file(&self, path: &Path) -> EngineResult<usize> {
        if !path.exists() {
            debug!("Memory file {} does not exist yet", path.display());
            return Ok(0);
        }
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            EngineError::memory(
                ErrorCode::MEMORY_PERSISTENCE,
                format!("failed to read memory file {}", path.display()),
                None,
            )
            .with_context(e)
        })?;
        let parsed: Namespaces = serde_json::from_str(&content).map_err(|e| {
            EngineError::memory(
                ErrorCode::MEMORY_PERSISTENCE,
                format!("invalid memory file {}", path.display()),
                None,
            )
            .with_context(e)
        })?;

        let mut data = self.lock();
        let mut loaded = 0;
        for (ns, table) in parsed {
            loaded += table.len();
            data.entry(ns).or_default().extend(table);
        }
        debug!("Loaded {} memory entries from {}", loaded, path.display());
        Ok(loaded)
    }

    pub async fn save_file(&self, path: &Path) -> EngineResult<()> {
        let content = serde_json::to_string_pretty(&self.to_json()).map_err(|e| {
            EngineError::memory(ErrorCode::MEMORY_PERSISTENCE, "failed to serialize memory", None)
                .with_context(e)
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                EngineError::memory(
                    ErrorCode::MEMORY_PERSISTENCE,
                    format!("failed to create {}", parent.display()),
                    None,
                )
                .with_context(e)
            })?;
        }
        tokio::fs::write(path, content).await.map_err(|e| {
            EngineError::memory(
                ErrorCode::MEMORY_PERSISTENCE,
                format!("failed to write memory file {}", path.display()),
                None,
            )
            .with_context(e)
        })?;
        debug!("Saved memory to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_set_get_namespaces() {
        let store = MemoryStore::default();
        store.set("k", json!(1), None);
        store.set("k", json!(2), Some("other"));
        assert_eq!(store.get("k", None), Some(json!(1)));
        assert_eq!(store.get("k", Some("other")), Some(json!(2)));
        assert!(store.has("k", Some("default")));
        assert!(!store.has("missing", None));
    }

    #[test]
    fn test_increment() {
        let store = MemoryStore::default();
        assert_eq!(store.increment("n", 1.0, None).unwrap(), json!(1));
        assert_eq!(store.increment("n", 2.5, None).unwrap(), json!(3.5));

        store.set("s", json!("text"), None);
        let err = store.increment("s", 1.0, None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MEMORY_NOT_NUMERIC);
    }

    #[test]
    fn test_append_semantics() {
        let store = MemoryStore::default();
        assert_eq!(store.append("a", json!(1), None), json!([1]));
        assert_eq!(store.append("a", json!(2), None), json!([1, 2]));

        store.set("scalar", json!("old"), None);
        assert_eq!(store.append("scalar", json!("new"), None), json!(["old", "new"]));
    }

    #[test]
    fn test_list_delete_clear() {
        let store = MemoryStore::new("ns");
        store.set("b", json!(1), None);
        store.set("a", json!(1), None);
        assert_eq!(store.list(None), vec!["a", "b"]);
        assert!(store.delete("a", None));
        assert!(!store.delete("a", None));
        store.clear(Some("ns"));
        assert!(store.list(None).is_empty());
    }

    #[test]
    fn test_concurrent_increments_are_serialized() {
        let store = Arc::new(MemoryStore::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        store.increment("hits", 1.0, None).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.get("hits", None), Some(json!(800)));
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/memory.json");

        let store = MemoryStore::default();
        store.set("seen", json!(["x"]), None);
        store.set("count", json!(3), Some("stats"));
        store.save_file(&path).await.unwrap();

        let restored = MemoryStore::default();
        assert_eq!(restored.load_file(&path).await.unwrap(), 2);
        assert_eq!(restored.get("count", Some("stats")), Some(json!(3)));
        assert_eq!(restored.get_all(None), store.get_all(None));
    }

    #[tokio::test]
    async fn test_missing_file_loads_nothing() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::default();
        assert_eq!(store.load_file(&dir.path().join("absent.json")).await.unwrap(), 0);
    }
}
