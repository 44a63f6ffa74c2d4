use crate::memory::MemoryStore;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Bindings visible to one expression evaluation
#[derive(Debug, Clone, Default)]
pub struct EvalScope {
    bindings: Map<String, Value>,
    memory: Option<Arc<MemoryStore>>,
}

impl EvalScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.bindings.insert(name.into(), value);
        self
    }

    pub fn with_memory(mut self, memory: Arc<MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.bindings.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    pub fn memory(&self) -> Option<&MemoryStore> {
        self.memory.as_deref()
    }

    pub fn bindings(&self) -> &Map<String, Value> {
        &self.bindings
    }
}
