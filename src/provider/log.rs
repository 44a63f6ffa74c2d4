use super::{options, CheckProvider, ProviderRequest};
use crate::config::CheckSpec;
use crate::types::CheckResult;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

#[derive(Debug, Deserialize)]
struct LogOptions {
    message: String,
    #[serde(default)]
    level: LogLevel,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// Renders `message` through tera and emits it as a tracing event
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProvider;

#[async_trait]
impl CheckProvider for LogProvider {
    fn name(&self) -> &str {
        "log"
    }

    fn validate(&self, check: &CheckSpec) -> Result<()> {
        options::<LogOptions>(check).map(|_| ())
    }

    async fn execute(&self, request: &ProviderRequest) -> Result<CheckResult> {
        let opts: LogOptions = options(&request.check)?;
        let message = request.context.render(&opts.message)?;
        let check = &request.check.id;
        match opts.level {
            LogLevel::Debug => debug!(check = %check, "{}", message),
            LogLevel::Info => info!(check = %check, "{}", message),
            LogLevel::Warn => warn!(check = %check, "{}", message),
            LogLevel::Error => error!(check = %check, "{}", message),
        }
        Ok(CheckResult::with_output(Value::String(message)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::test_support::request;
    use serde_json::json;

    #[tokio::test]
    async fn test_renders_message() {
        let check = CheckSpec::new("announce")
            .with_provider("log")
            .with_option("message", json!("PR #{{ pr.number }}"))
            .with_option("level", json!("warn"));
        let result = LogProvider.execute(&request(check)).await.unwrap();
        assert_eq!(result.output, Some(json!("PR #7")));
    }

    #[test]
    fn test_message_is_required() {
        assert!(LogProvider.validate(&CheckSpec::new("x")).is_err());
    }
}
