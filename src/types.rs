//! Result and issue types shared by providers, routing and the journal

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Issue severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }

    /// Severity at or above `error`
    pub fn is_blocking(&self) -> bool {
        *self >= Severity::Error
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single finding reported by a check or synthesized by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub rule_id: String,
    pub message: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl Issue {
    pub fn new(rule_id: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            rule_id: rule_id.into(),
            message: message.into(),
            severity,
            file: None,
            line: None,
            category: None,
        }
    }

    /// Issue produced by the engine itself rather than a provider
    pub fn system(rule_id: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            category: Some("system".to_string()),
            ..Self::new(rule_id, message, severity)
        }
    }

    pub fn with_location(mut self, file: impl Into<String>, line: Option<u32>) -> Self {
        self.file = Some(file.into());
        self.line = line;
        self
    }
}

/// Output of one provider invocation: `{issues[], output?, error?}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CheckResult {
    pub fn with_output(output: Value) -> Self {
        Self {
            output: Some(output),
            ..Default::default()
        }
    }

    pub fn from_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn has_blocking_issue(&self) -> bool {
        self.issues.iter().any(|i| i.severity.is_blocking())
    }

    pub fn counts(&self) -> IssueCounts {
        IssueCounts::from_issues(&self.issues)
    }
}

/// Aggregate issue counters exposed to expressions and statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueCounts {
    pub critical: usize,
    pub error: usize,
    pub warning: usize,
    pub info: usize,
    pub total: usize,
}

impl IssueCounts {
    pub fn from_issues(issues: &[Issue]) -> Self {
        let mut counts = Self::default();
        for issue in issues {
            counts.add(issue.severity);
        }
        counts
    }

    pub fn add(&mut self, severity: Severity) {
        match severity {
            Severity::Critical => self.critical += 1,
            Severity::Error => self.error += 1,
            Severity::Warning => self.warning += 1,
            Severity::Info => self.info += 1,
        }
        self.total += 1;
    }

    pub fn merge(&mut self, other: &IssueCounts) {
        self.critical += other.critical;
        self.error += other.error;
        self.warning += other.warning;
        self.info += other.info;
        self.total += other.total;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Error);
        assert!(Severity::Error > Severity::Warning);
        assert!(Severity::Error.is_blocking());
        assert!(!Severity::Warning.is_blocking());
    }

    #[test]
    fn test_issue_counts() {
        let result = CheckResult {
            issues: vec![
                Issue::new("a", "x", Severity::Error),
                Issue::new("b", "y", Severity::Warning),
                Issue::new("c", "z", Severity::Warning),
            ],
            ..Default::default()
        };
        let counts = result.counts();
        assert_eq!(counts.error, 1);
        assert_eq!(counts.warning, 2);
        assert_eq!(counts.total, 3);
        assert!(result.has_blocking_issue());
    }

    #[test]
    fn test_check_result_deserializes_partial_json() {
        let result: CheckResult = serde_json::from_value(json!({
            "issues": [{"rule_id": "r", "message": "m", "severity": "critical"}]
        }))
        .unwrap();
        assert_eq!(result.issues[0].severity, Severity::Critical);
        assert!(result.output.is_none());
        assert!(!result.is_error());
    }
}
