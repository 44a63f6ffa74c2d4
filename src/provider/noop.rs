use super::{CheckProvider, ProviderRequest};
use crate::types::CheckResult;
use anyhow::Result;
use async_trait::async_trait;

/// Does nothing; echoes the optional `output` option as its output
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProvider;

#[async_trait]
impl CheckProvider for NoopProvider {
    fn name(&self) -> &str {
        "noop"
    }

    async fn execute(&self, request: &ProviderRequest) -> Result<CheckResult> {
        Ok(CheckResult {
            output: request.check.options.get("output").cloned(),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CheckSpec;
    use crate::provider::test_support::request;
    use serde_json::json;

    #[tokio::test]
    async fn test_echoes_output_option() {
        let check = CheckSpec::new("items").with_option("output", json!([1, 2, 3]));
        let result = NoopProvider.execute(&request(check)).await.unwrap();
        assert_eq!(result.output, Some(json!([1, 2, 3])));
        assert!(result.issues.is_empty());

        let empty = NoopProvider.execute(&request(CheckSpec::new("x"))).await.unwrap();
        assert_eq!(empty, CheckResult::default());
    }
}
