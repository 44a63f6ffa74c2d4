use super::EngineConfig;
use crate::error::{EngineError, EngineResult, ErrorCode};
use std::path::Path;
use tokio::fs;
use tracing::debug;

/// Serialization format of a configuration file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

impl ConfigFormat {
    /// Pick the format from a file extension, defaulting to YAML
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => ConfigFormat::Json,
            Some("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Yaml,
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Read, parse and normalize a config file, then apply env overrides
    pub async fn load(path: &Path) -> EngineResult<EngineConfig> {
        if !path.exists() {
            return Err(EngineError::config_with_code(
                ErrorCode::CONFIG_NOT_FOUND,
                format!("config file {} does not exist", path.display()),
            ));
        }

        let content = fs::read_to_string(path).await.map_err(|e| {
            EngineError::config_with_code(
                ErrorCode::CONFIG_NOT_FOUND,
                format!("cannot read {}", path.display()),
            )
            .with_source(e)
        })?;

        let mut config = Self::parse(&content, ConfigFormat::from_path(path))?;
        config.merge_env_vars();
        debug!(
            "Loaded {} checks from {}",
            config.checks.len(),
            path.display()
        );
        Ok(config)
    }

    /// Parse config text without touching the environment
    pub fn parse(content: &str, format: ConfigFormat) -> EngineResult<EngineConfig> {
        let parse_error = |e: Box<dyn std::error::Error + Send + Sync>| {
            EngineError::config_with_code(
                ErrorCode::CONFIG_PARSE_ERROR,
                format!("invalid {:?} configuration: {}", format, e),
            )
        };

        let mut config: EngineConfig = match format {
            ConfigFormat::Yaml => serde_yaml::from_str(content).map_err(|e| parse_error(e.into()))?,
            ConfigFormat::Json => serde_json::from_str(content).map_err(|e| parse_error(e.into()))?,
            ConfigFormat::Toml => toml::from_str(content).map_err(|e| parse_error(e.into()))?,
        };
        config.normalize();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(ConfigFormat::from_path(Path::new("a.json")), ConfigFormat::Json);
        assert_eq!(ConfigFormat::from_path(Path::new("a.toml")), ConfigFormat::Toml);
        assert_eq!(ConfigFormat::from_path(Path::new("a.yml")), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path(Path::new("noext")), ConfigFormat::Yaml);
    }

    #[test]
    fn test_parse_json_and_toml() {
        let json = r#"{"checks": {"a": {"type": "log", "message": "hi"}}, "fail_fast": true}"#;
        let config = ConfigLoader::parse(json, ConfigFormat::Json).unwrap();
        assert!(config.fail_fast);
        assert_eq!(config.checks["a"].id, "a");

        let toml_text = r#"
max_parallelism = 2

[checks.build]
type = "command"
exec = "make"
"#;
        let config = ConfigLoader::parse(toml_text, ConfigFormat::Toml).unwrap();
        assert_eq!(config.max_parallelism, 2);
        assert_eq!(config.checks["build"].option_str("exec"), Some("make"));
    }

    #[test]
    fn test_parse_error_has_code() {
        let err = ConfigLoader::parse("checks: [1, 2", ConfigFormat::Yaml).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CONFIG_PARSE_ERROR);
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "checks:\n  one:\n    type: noop\n").unwrap();
        let config = ConfigLoader::load(file.path()).await.unwrap();
        assert!(config.checks.contains_key("one"));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = ConfigLoader::load(Path::new("/definitely/not/here.yaml"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CONFIG_NOT_FOUND);
    }
}
