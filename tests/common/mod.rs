//! Common test utilities and helpers

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use checkflow::config::{ConfigFormat, ConfigLoader, EngineConfig};
use checkflow::engine::{RunOptions, RunOutcome, StateMachineRunner};
use checkflow::provider::{CheckProvider, ProviderRegistry, ProviderRequest};
use checkflow::types::{CheckResult, Issue, Severity};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Provider driven entirely by check options
///
/// - `output`: value returned as the result output
/// - `fail_on_item`: returns an error issue when the current forEach item equals this value
#[derive(Clone, Default)]
pub struct ScriptedProvider {
    calls: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times the provider ran `check_id`
    pub fn calls(&self, check_id: &str) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.get(check_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

#[async_trait]
impl CheckProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, request: &ProviderRequest) -> Result<CheckResult> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(request.check.id.clone()).or_default() += 1;
        }

        let item = request
            .context
            .bindings
            .get("forEach")
            .and_then(|f| f.get("item"))
            .cloned()
            .unwrap_or(Value::Null);

        let mut result = CheckResult {
            output: request.check.options.get("output").cloned(),
            ..Default::default()
        };
        if let Some(target) = request.check.options.get("fail_on_item") {
            if *target == item {
                result.issues.push(Issue::new(
                    format!("{}/item_failed", request.check.id),
                    format!("item {} failed", item),
                    Severity::Error,
                ));
            }
        }
        Ok(result)
    }
}

/// Builtin providers plus the scripted one
pub fn registry(scripted: &ScriptedProvider) -> ProviderRegistry {
    let mut registry = ProviderRegistry::with_builtins();
    registry.register(scripted.clone());
    registry
}

/// Parse a YAML config the way the loader does for files
pub fn yaml_config(content: &str) -> EngineConfig {
    ConfigLoader::parse(content, ConfigFormat::Yaml).expect("test config should parse")
}

pub async fn run_yaml(content: &str) -> (RunOutcome, ScriptedProvider) {
    run_yaml_with(content, RunOptions::default()).await
}

pub async fn run_yaml_with(content: &str, options: RunOptions) -> (RunOutcome, ScriptedProvider) {
    let scripted = ScriptedProvider::new();
    let outcome = StateMachineRunner::new(yaml_config(content), registry(&scripted))
        .with_options(options)
        .run()
        .await;
    (outcome, scripted)
}
