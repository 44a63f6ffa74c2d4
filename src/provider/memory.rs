use super::{options, CheckProvider, ProviderRequest};
use crate::config::CheckSpec;
use crate::expression::ExpressionEngine;
use crate::types::CheckResult;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Operation {
    Get,
    Set,
    Append,
    Increment,
    Delete,
    Clear,
    List,
    GetAll,
}

impl Operation {
    fn needs_key(self) -> bool {
        !matches!(self, Operation::Clear | Operation::List | Operation::GetAll)
    }
}

#[derive(Debug, Deserialize)]
struct MemoryOptions {
    operation: Operation,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    value_js: Option<String>,
    #[serde(default)]
    namespace: Option<String>,
}

/// Reads and writes the run's memory store; the output is the resulting value
#[derive(Debug, Default)]
pub struct MemoryProvider {
    expressions: ExpressionEngine,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn value(&self, opts: &MemoryOptions, request: &ProviderRequest) -> Result<Value> {
        if let Some(expr) = opts.value_js.as_deref() {
            return self
                .expressions
                .evaluate(expr, &request.context.eval_scope())
                .map_err(|e| anyhow!("value_js failed: {}", e));
        }
        Ok(opts.value.clone().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl CheckProvider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    fn validate(&self, check: &CheckSpec) -> Result<()> {
        let opts: MemoryOptions = options(check)?;
        if opts.operation.needs_key() && opts.key.is_none() {
            return Err(anyhow!("memory operation {:?} requires a key", opts.operation));
        }
        if let Some(expr) = opts.value_js.as_deref() {
            self.expressions
                .compile(expr)
                .map_err(|e| anyhow!("invalid value_js: {}", e))?;
        }
        Ok(())
    }

    async fn execute(&self, request: &ProviderRequest) -> Result<CheckResult> {
        let opts: MemoryOptions = options(&request.check)?;
        let memory = &request.context.memory;
        let ns = opts.namespace.as_deref();
        let key = opts.key.clone().unwrap_or_default();

        let output = match opts.operation {
            Operation::Get => memory.get(&key, ns).unwrap_or(Value::Null),
            Operation::Set => {
                let value = self.value(&opts, request)?;
                memory.set(&key, value.clone(), ns);
                value
            }
            Operation::Append => memory.append(&key, self.value(&opts, request)?, ns),
            Operation::Increment => {
                let amount = match self.value(&opts, request)? {
                    Value::Null => 1.0,
                    Value::Number(n) => n.as_f64().unwrap_or(1.0),
                    other => return Err(anyhow!("increment amount must be numeric, got {}", other)),
                };
                memory.increment(&key, amount, ns)?
            }
            Operation::Delete => Value::Bool(memory.delete(&key, ns)),
            Operation::Clear => {
                memory.clear(Some(ns.unwrap_or(memory.default_namespace())));
                Value::Null
            }
            Operation::List => memory.list(ns).into_iter().map(Value::String).collect(),
            Operation::GetAll => Value::Object(memory.get_all(ns)),
        };
        Ok(CheckResult::with_output(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::test_support::request;
    use serde_json::json;

    fn check(operation: &str) -> CheckSpec {
        CheckSpec::new("mem")
            .with_provider("memory")
            .with_option("operation", json!(operation))
            .with_option("key", json!("k"))
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let provider = MemoryProvider::new();
        let req = request(check("set").with_option("value", json!({"a": 1})));
        provider.execute(&req).await.unwrap();

        let mut get = request(check("get"));
        get.context.memory = req.context.memory.clone();
        let result = provider.execute(&get).await.unwrap();
        assert_eq!(result.output, Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_value_js_sees_outputs() {
        let provider = MemoryProvider::new();
        let req = request(check("set").with_option("value_js", json!("outputs.fetch.count * 10")));
        let result = provider.execute(&req).await.unwrap();
        assert_eq!(result.output, Some(json!(20)));
        assert_eq!(req.context.memory.get("k", None), Some(json!(20)));
    }

    #[tokio::test]
    async fn test_increment_and_append() {
        let provider = MemoryProvider::new();
        let req = request(check("increment"));
        provider.execute(&req).await.unwrap();
        let result = provider.execute(&req).await.unwrap();
        assert_eq!(result.output, Some(json!(2)));

        let append = request(check("append").with_option("value", json!("x")));
        let result = provider.execute(&append).await.unwrap();
        assert_eq!(result.output, Some(json!(["x"])));
    }

    #[tokio::test]
    async fn test_increment_non_numeric_fails() {
        let provider = MemoryProvider::new();
        let req = request(check("increment"));
        req.context.memory.set("k", json!("text"), None);
        assert!(provider.execute(&req).await.is_err());
    }

    #[test]
    fn test_validate_requires_key() {
        let provider = MemoryProvider::new();
        let no_key = CheckSpec::new("m")
            .with_provider("memory")
            .with_option("operation", json!("get"));
        assert!(provider.validate(&no_key).is_err());

        let list = CheckSpec::new("m")
            .with_provider("memory")
            .with_option("operation", json!("list"));
        assert!(provider.validate(&list).is_ok());
        assert!(provider.validate(&check("teleport")).is_err());
    }
}
