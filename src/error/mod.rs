use std::fmt::Display;
use std::path::PathBuf;
use thiserror::Error;

pub mod codes;

pub use codes::{describe_error_code, ErrorCode};

/// The unified error type for the orchestration engine
///
/// Only fatal conditions surface as `EngineError`. Gate failures, contract
/// violations, check failures and routing budget exhaustion are recorded on
/// dispatch records and results instead.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("[E{code:04}] Configuration error: {message}")]
    Config {
        code: u16,
        message: String,
        check: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Dependency cycle detected: {}", members.join(" -> "))]
    CycleDetected { code: u16, members: Vec<String> },

    #[error("[E{code:04}] Expression error: {message}")]
    Expression {
        code: u16,
        message: String,
        expression: Option<String>,
    },

    #[error("[E{code:04}] Memory error: {message}")]
    Memory {
        code: u16,
        message: String,
        key: Option<String>,
    },

    #[error("[E{code:04}] Provider error: {message}")]
    Provider {
        code: u16,
        message: String,
        provider: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Journal error: {message}")]
    Journal {
        code: u16,
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] {message}")]
    Internal { code: u16, message: String },
}

impl EngineError {
    /// Create a configuration error with default code
    pub fn config(message: impl Into<String>) -> Self {
        Self::config_with_code(ErrorCode::CONFIG_GENERIC, message)
    }

    /// Create a configuration error with specific code
    pub fn config_with_code(code: u16, message: impl Into<String>) -> Self {
        Self::Config {
            code,
            message: message.into(),
            check: None,
            source: None,
        }
    }

    /// Create a dependency cycle error listing the members in traversal order
    pub fn cycle(members: Vec<String>) -> Self {
        Self::CycleDetected {
            code: ErrorCode::CONFIG_CYCLE_DETECTED,
            members,
        }
    }

    pub fn unknown_dependency(check: &str, dependency: &str) -> Self {
        Self::Config {
            code: ErrorCode::CONFIG_UNKNOWN_DEPENDENCY,
            message: format!("check '{check}' depends on unknown check '{dependency}'"),
            check: Some(check.to_string()),
            source: None,
        }
    }

    pub fn unknown_routing_target(check: &str, target: &str) -> Self {
        Self::Config {
            code: ErrorCode::CONFIG_UNKNOWN_ROUTING_TARGET,
            message: format!("check '{check}' routes to unknown check '{target}'"),
            check: Some(check.to_string()),
            source: None,
        }
    }

    /// Create an expression error
    pub fn expression(code: u16, message: impl Into<String>, expression: Option<String>) -> Self {
        Self::Expression {
            code,
            message: message.into(),
            expression,
        }
    }

    /// Create a memory store error
    pub fn memory(code: u16, message: impl Into<String>, key: Option<String>) -> Self {
        Self::Memory {
            code,
            message: message.into(),
            key,
        }
    }

    /// Create a provider error with default code
    pub fn provider(message: impl Into<String>, provider: Option<String>) -> Self {
        Self::Provider {
            code: ErrorCode::PROVIDER_GENERIC,
            message: message.into(),
            provider,
            source: None,
        }
    }

    /// Create a journal error with specific code and path
    pub fn journal(code: u16, message: impl Into<String>, path: Option<PathBuf>) -> Self {
        Self::Journal {
            code,
            message: message.into(),
            path,
            source: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            code: ErrorCode::INTERNAL_GENERIC,
            message: message.into(),
        }
    }

    /// Attach the check a configuration error belongs to
    pub fn for_check(mut self, id: impl Into<String>) -> Self {
        if let Self::Config { check, .. } = &mut self {
            *check = Some(id.into());
        }
        self
    }

    /// Add a source error to this error
    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        match &mut self {
            Self::Config { source: src, .. }
            | Self::Provider { source: src, .. }
            | Self::Journal { source: src, .. } => {
                *src = Some(source.into());
            }
            _ => {}
        }
        self
    }

    /// Add context to the error message
    pub fn with_context(mut self, context: impl Display) -> Self {
        match &mut self {
            Self::Config { message, .. }
            | Self::Expression { message, .. }
            | Self::Memory { message, .. }
            | Self::Provider { message, .. }
            | Self::Journal { message, .. }
            | Self::Internal { message, .. } => {
                *message = format!("{}: {}", message, context);
            }
            Self::CycleDetected { .. } => {}
        }
        self
    }

    /// Get the error code
    pub fn code(&self) -> u16 {
        match self {
            Self::Config { code, .. }
            | Self::CycleDetected { code, .. }
            | Self::Expression { code, .. }
            | Self::Memory { code, .. }
            | Self::Provider { code, .. }
            | Self::Journal { code, .. }
            | Self::Internal { code, .. } => *code,
        }
    }

    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } | Self::CycleDetected { .. } => 2,
            Self::Expression { .. } => 3,
            Self::Memory { .. } => 4,
            Self::Provider { .. } => 5,
            Self::Journal { .. } => 6,
            Self::Internal { .. } => 1,
        }
    }

    /// Whether this error belongs to the ConfigError class (fatal at Init)
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. } | Self::CycleDetected { .. })
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            Self::Config {
                message,
                check: Some(check),
                ..
            } => format!("Configuration problem in '{}': {}", check, message),
            Self::Config { message, .. } => format!("Configuration problem: {}", message),
            Self::CycleDetected { members, .. } => format!(
                "The checks {} depend on each other in a cycle",
                members.join(", ")
            ),
            Self::Journal {
                message,
                path: Some(p),
                ..
            } => format!("Journal error at {}: {}", p.display(), message),
            other => other.to_string(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests;
