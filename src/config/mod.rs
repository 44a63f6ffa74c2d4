//! Engine configuration
//!
//! The engine consumes an already validated [`EngineConfig`]. Loading from
//! disk lives in [`loader`] and structural validation in [`validator`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub mod check;
pub mod loader;
pub mod retry;
pub mod validator;

pub use check::{CheckSpec, FanoutMode, RoutingAction, SessionReuse, Transition};
pub use loader::{ConfigFormat, ConfigLoader};
pub use retry::{BackoffConfig, BackoffMode, RetryPolicy};
pub use validator::validate_config;

/// Default ceiling on routing-triggered forward runs per engine run
pub const DEFAULT_MAX_LOOPS: u32 = 10;

/// Default number of concurrent dispatches within a level
pub const DEFAULT_MAX_PARALLELISM: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_max_loops", alias = "maxLoops")]
    pub max_loops: u32,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            max_loops: default_max_loops(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// JSON file loaded at start and written on completion
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Write the journal snapshot here when the run finishes
    #[serde(default)]
    pub snapshot: Option<PathBuf>,
}

/// Validated in-memory configuration of one pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub checks: BTreeMap<String, CheckSpec>,

    /// Global failure predicate evaluated against every check result
    #[serde(default, alias = "failIf")]
    pub fail_if: Option<String>,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default = "default_max_parallelism", alias = "maxParallelism")]
    pub max_parallelism: usize,

    #[serde(default, alias = "failFast")]
    pub fail_fast: bool,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub journal: JournalConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            checks: BTreeMap::new(),
            fail_if: None,
            routing: RoutingConfig::default(),
            max_parallelism: default_max_parallelism(),
            fail_fast: false,
            memory: MemoryConfig::default(),
            journal: JournalConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Copy each map key into its check's `id`
    pub fn normalize(&mut self) {
        for (id, check) in self.checks.iter_mut() {
            check.id = id.clone();
        }
        if self.max_parallelism == 0 {
            self.max_parallelism = 1;
        }
    }

    pub fn check(&self, id: &str) -> Option<&CheckSpec> {
        self.checks.get(id)
    }

    /// Insert a check keyed by its id
    pub fn with_check(mut self, check: CheckSpec) -> Self {
        self.checks.insert(check.id.clone(), check);
        self
    }

    /// Apply `CHECKFLOW_*` environment overrides
    pub fn merge_env_vars(&mut self) {
        if let Some(n) = env_parse::<usize>("CHECKFLOW_MAX_PARALLELISM") {
            self.max_parallelism = n.max(1);
        }
        if let Some(b) = env_parse::<bool>("CHECKFLOW_FAIL_FAST") {
            self.fail_fast = b;
        }
        if let Some(n) = env_parse::<u32>("CHECKFLOW_MAX_LOOPS") {
            self.routing.max_loops = n;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn default_max_loops() -> u32 {
    DEFAULT_MAX_LOOPS
}

fn default_max_parallelism() -> usize {
    DEFAULT_MAX_PARALLELISM
}

fn default_namespace() -> String {
    "default".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.routing.max_loops, 10);
        assert_eq!(config.max_parallelism, DEFAULT_MAX_PARALLELISM);
        assert!(!config.fail_fast);
        assert_eq!(config.memory.namespace, "default");
    }

    #[test]
    fn test_normalize_copies_ids() {
        let yaml = r#"
checks:
  lint:
    type: noop
  test:
    depends_on: [lint]
max_parallelism: 0
"#;
        let mut config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        config.normalize();
        assert_eq!(config.checks["lint"].id, "lint");
        assert_eq!(config.checks["test"].provider, "noop");
        assert_eq!(config.max_parallelism, 1);
    }
}
