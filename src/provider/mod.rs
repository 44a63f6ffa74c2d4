//! Check providers: the single seam between scheduling and real work
//!
//! The engine only ever calls [`CheckProvider::execute`]. Providers are looked
//! up by the check's `type` string in a [`ProviderRegistry`].

mod command;
mod log;
mod memory;
mod noop;

pub use command::CommandProvider;
pub use log::LogProvider;
pub use memory::MemoryProvider;
pub use noop::NoopProvider;

use crate::config::{CheckSpec, EngineConfig};
use crate::error::{EngineError, EngineResult, ErrorCode};
use crate::expression::EvalScope;
use crate::journal::Scope;
use crate::memory::MemoryStore;
use crate::types::CheckResult;
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Run-time information handed to a provider alongside its check
#[derive(Debug, Clone)]
pub struct ProviderContext {
    pub session_id: String,
    pub scope: Scope,
    pub event: Option<String>,
    pub attempt: u32,
    pub memory: Arc<MemoryStore>,
    /// Expression bindings for this dispatch (`outputs`, `pr`, `env`, ...)
    pub bindings: Map<String, Value>,
}

impl ProviderContext {
    pub fn eval_scope(&self) -> EvalScope {
        let mut scope = EvalScope::new().with_memory(Arc::clone(&self.memory));
        for (name, value) in &self.bindings {
            scope.set(name.clone(), value.clone());
        }
        scope
    }

    /// Values available to `exec` and `message` templates
    pub fn template_values(&self) -> Value {
        let mut values = self.bindings.clone();
        values.insert("memory".to_string(), Value::Object(self.memory.get_all(None)));
        Value::Object(values)
    }

    /// Render a tera template against [`Self::template_values`]
    pub fn render(&self, template: &str) -> Result<String> {
        let context = tera::Context::from_serialize(self.template_values())
            .context("Failed to build template context")?;
        let mut tera = tera::Tera::default();
        tera.autoescape_on(vec![]);
        tera.render_str(template, &context)
            .with_context(|| format!("Failed to render template: {}", template))
    }
}

#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub check: CheckSpec,
    /// Latest visible result of each dependency, keyed by check id
    pub dependency_results: BTreeMap<String, CheckResult>,
    pub context: ProviderContext,
}

#[async_trait]
pub trait CheckProvider: Send + Sync {
    /// Registry key matched against `CheckSpec::provider`
    fn name(&self) -> &str;

    /// Validate provider options before the run starts
    fn validate(&self, _check: &CheckSpec) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, request: &ProviderRequest) -> Result<CheckResult>;
}

/// Parse the check's free-form options into a typed struct
pub(crate) fn options<T: serde::de::DeserializeOwned>(check: &CheckSpec) -> Result<T> {
    serde_json::from_value(Value::Object(check.options.clone()))
        .with_context(|| format!("Invalid options for check '{}'", check.id))
}

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn CheckProvider>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `noop`, `log`, `command` and `memory`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(NoopProvider);
        registry.register(LogProvider);
        registry.register(CommandProvider::new());
        registry.register(MemoryProvider::new());
        registry
    }

    /// Register a provider, replacing any with the same name
    pub fn register(&mut self, provider: impl CheckProvider + 'static) {
        let provider: Arc<dyn CheckProvider> = Arc::new(provider);
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CheckProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run each provider's option validation for the checks that use it
    pub fn validate_checks(&self, config: &EngineConfig) -> EngineResult<()> {
        for check in config.checks.values() {
            let provider = self.get(&check.provider).ok_or_else(|| {
                EngineError::config_with_code(
                    ErrorCode::CONFIG_UNKNOWN_PROVIDER,
                    format!("unknown provider type '{}'", check.provider),
                )
                .for_check(check.id.clone())
            })?;
            provider.validate(check).map_err(|e| {
                EngineError::config_with_code(ErrorCode::CONFIG_INVALID_VALUE, format!("{:#}", e))
                    .for_check(check.id.clone())
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn request(check: CheckSpec) -> ProviderRequest {
        let mut bindings = Map::new();
        bindings.insert("outputs".into(), serde_json::json!({"fetch": {"count": 2}}));
        bindings.insert("pr".into(), serde_json::json!({"number": 7}));
        ProviderRequest {
            check,
            dependency_results: BTreeMap::new(),
            context: ProviderContext {
                session_id: "test".into(),
                scope: Scope::root(),
                event: Some("manual".into()),
                attempt: 1,
                memory: Arc::new(MemoryStore::default()),
                bindings,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_names() {
        let registry = ProviderRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["command", "log", "memory", "noop"]);
        assert!(registry.get("noop").is_some());
        assert!(registry.get("http").is_none());
    }

    #[test]
    fn test_validate_checks_reports_bad_options() {
        let registry = ProviderRegistry::with_builtins();
        let config = EngineConfig::default().with_check(CheckSpec::new("run").with_provider("command"));
        let err = registry.validate_checks(&config).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CONFIG_INVALID_VALUE);
    }

    #[test]
    fn test_render_template() {
        let request = test_support::request(CheckSpec::new("x"));
        request.context.memory.set("seen", json!(3), None);
        let rendered = request
            .context
            .render("pr {{ pr.number }} count {{ outputs.fetch.count }} seen {{ memory.seen }}")
            .unwrap();
        assert_eq!(rendered, "pr 7 count 2 seen 3");
    }
}
