//! Structural validation run during `Init`

use super::{CheckSpec, EngineConfig, SessionReuse};
use crate::error::{EngineError, EngineResult, ErrorCode};

/// Validate references between checks and against the provider registry
///
/// Cycles are detected separately by the graph resolver.
pub fn validate_config(config: &EngineConfig, providers: &[String]) -> EngineResult<()> {
    for (key, check) in &config.checks {
        if key != &check.id {
            return Err(EngineError::config_with_code(
                ErrorCode::CONFIG_INVALID_VALUE,
                format!("check keyed '{}' carries id '{}'", key, check.id),
            )
            .for_check(key.clone()));
        }
        validate_check(config, check, providers)?;
    }
    Ok(())
}

fn validate_check(
    config: &EngineConfig,
    check: &CheckSpec,
    providers: &[String],
) -> EngineResult<()> {
    if !providers.iter().any(|p| p == &check.provider) {
        return Err(EngineError::config_with_code(
            ErrorCode::CONFIG_UNKNOWN_PROVIDER,
            format!(
                "unknown provider type '{}' (available: {})",
                check.provider,
                providers.join(", ")
            ),
        )
        .for_check(check.id.clone()));
    }

    for dep in check.dependency_ids() {
        if dep == check.id {
            return Err(EngineError::cycle(vec![check.id.clone(), check.id.clone()]));
        }
        if !config.checks.contains_key(&dep) {
            return Err(EngineError::unknown_dependency(&check.id, &dep));
        }
    }

    for (_, action) in check.routing_actions() {
        for target in action.static_targets() {
            if !config.checks.contains_key(target) {
                return Err(EngineError::unknown_routing_target(&check.id, target));
            }
        }
    }

    if let Some(SessionReuse::Check(owner)) = &check.reuse_session {
        if !config.checks.contains_key(owner) {
            return Err(EngineError::config_with_code(
                ErrorCode::CONFIG_INVALID_VALUE,
                format!("reuse_session names unknown check '{owner}'"),
            )
            .for_check(check.id.clone()));
        }
    }

    if let Some(SessionReuse::Flag(true)) = &check.reuse_session {
        if check.depends_on.is_empty() {
            return Err(EngineError::config_with_code(
                ErrorCode::CONFIG_INVALID_VALUE,
                "reuse_session: true requires at least one dependency",
            )
            .for_check(check.id.clone()));
        }
    }

    Ok(())
}
