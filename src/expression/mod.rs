//! Sandboxed expression evaluation for gates, contracts and routing
//!
//! Provides a small JavaScript-flavoured language supporting:
//! - Literals, arrays, objects, member access with `?.`, indexing and calls
//! - Arithmetic, comparison (`==`, `===`, ...), logical and `??` operators
//! - Ternaries, `const`/`let` declarations and `return` in multi-line bodies
//! - Arrow functions passed to allow-listed helpers (`any`, `filter`, ...)
//! - A memory accessor (`memory.get`, `memory.increment`, ...)
//!
//! Source is tokenized, parsed, validated against a deny-list and cached.
//! Evaluation runs over `serde_json::Value` with a step budget; nothing in the
//! language reaches the host.

pub mod ast;
mod builtins;
pub mod error;
pub mod evaluator;
pub mod parser;
pub mod scope;
pub mod tokenizer;
pub mod validator;
pub mod value;

pub use builtins::permission_rank;
pub use error::{EvalError, EvalResult};
pub use evaluator::{Evaluator, DEFAULT_STEP_BUDGET};
pub use parser::ExpressionParser;
pub use scope::EvalScope;
pub use value::truthy;

use ast::Program;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Compiles and evaluates expressions, caching programs by source text
#[derive(Debug)]
pub struct ExpressionEngine {
    parser: ExpressionParser,
    step_budget: usize,
    cache: Mutex<HashMap<String, Arc<Program>>>,
}

impl Default for ExpressionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpressionEngine {
    pub fn new() -> Self {
        Self {
            parser: ExpressionParser::new(),
            step_budget: DEFAULT_STEP_BUDGET,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_step_budget(mut self, step_budget: usize) -> Self {
        self.step_budget = step_budget;
        self
    }

    /// Parse and validate, reusing a cached program when available
    pub fn compile(&self, source: &str) -> EvalResult<Arc<Program>> {
        if let Some(program) = self.cache_lock().get(source) {
            return Ok(Arc::clone(program));
        }

        let program = self.parser.parse(source)?;
        validator::validate_program(&program)?;
        let program = Arc::new(program);

        self.cache_lock()
            .insert(source.to_string(), Arc::clone(&program));
        Ok(program)
    }

    pub fn evaluate(&self, source: &str, scope: &EvalScope) -> EvalResult<Value> {
        let program = self.compile(source)?;
        Evaluator::with_budget(scope, self.step_budget).run(&program)
    }

    /// Evaluate and coerce the result with JavaScript truthiness
    pub fn evaluate_bool(&self, source: &str, scope: &EvalScope) -> EvalResult<bool> {
        self.evaluate(source, scope).map(|v| truthy(&v))
    }

    pub fn cached_programs(&self) -> usize {
        self.cache_lock().len()
    }

    fn cache_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Program>>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
