use thiserror::Error;

/// Failure while compiling or evaluating a sandboxed expression
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("syntax error at {position}: {message}")]
    Syntax { message: String, position: usize },

    #[error("{0} is not defined")]
    Reference(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("'{0}' is not allowed in expressions")]
    Forbidden(String),

    #[error("expression exceeded its evaluation budget")]
    Budget,

    #[error("memory error: {0}")]
    Memory(String),
}

impl EvalError {
    pub fn syntax(message: impl Into<String>, position: usize) -> Self {
        Self::Syntax {
            message: message.into(),
            position,
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::Type(message.into())
    }

    /// Malformed source, as opposed to a failure against a concrete context
    pub fn is_syntax(&self) -> bool {
        matches!(self, Self::Syntax { .. })
    }
}

pub type EvalResult<T> = Result<T, EvalError>;
