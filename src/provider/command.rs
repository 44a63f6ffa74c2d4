//! Shell command provider
//!
//! Renders `exec` through tera, runs it with `sh -c`, and parses stdout as
//! JSON when possible. A JSON object carrying an `issues` array contributes
//! those issues to the result.

use super::{options, CheckProvider, ProviderRequest};
use crate::config::CheckSpec;
use crate::expression::ExpressionEngine;
use crate::types::{CheckResult, Issue};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct CommandOptions {
    exec: String,
    #[serde(default, with = "humantime_serde")]
    timeout: Option<Duration>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    transform_js: Option<String>,
    #[serde(default)]
    cwd: Option<String>,
}

#[derive(Debug, Default)]
pub struct CommandProvider {
    expressions: ExpressionEngine,
}

impl CommandProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_stdout(stdout: &str) -> Value {
        let trimmed = stdout.trim();
        serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
    }

    fn extract_issues(output: &Value) -> Vec<Issue> {
        output
            .get("issues")
            .cloned()
            .and_then(|issues| serde_json::from_value::<Vec<Issue>>(issues).ok())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CheckProvider for CommandProvider {
    fn name(&self) -> &str {
        "command"
    }

    fn validate(&self, check: &CheckSpec) -> Result<()> {
        let opts: CommandOptions = options(check)?;
        if opts.exec.trim().is_empty() {
            return Err(anyhow!("command check '{}' has an empty exec", check.id));
        }
        if let Some(transform) = opts.transform_js.as_deref() {
            self.expressions
                .compile(transform)
                .map_err(|e| anyhow!("invalid transform_js: {}", e))?;
        }
        Ok(())
    }

    async fn execute(&self, request: &ProviderRequest) -> Result<CheckResult> {
        let opts: CommandOptions = options(&request.check)?;
        let command_line = request.context.render(&opts.exec)?;
        debug!("Running command for {}: {}", request.check.id, command_line);

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&command_line)
            .envs(&opts.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &opts.cwd {
            command.current_dir(cwd);
        }

        let timeout = opts.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| anyhow!("command timed out after {}ms", timeout.as_millis()))?
            .with_context(|| format!("Failed to spawn command: {}", command_line))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Ok(CheckResult {
                output: Some(Self::parse_stdout(&stdout)),
                error: Some(format!("command exited with {}: {}", code, stderr.trim())),
                ..Default::default()
            });
        }

        let mut parsed = Self::parse_stdout(&stdout);
        if let Some(transform) = opts.transform_js.as_deref() {
            let scope = request.context.eval_scope().with("output", parsed);
            parsed = self
                .expressions
                .evaluate(transform, &scope)
                .map_err(|e| anyhow!("transform_js failed: {}", e))?;
        }

        Ok(CheckResult {
            issues: Self::extract_issues(&parsed),
            output: Some(parsed),
            error: None,
        })
    }
}
