//! # checkflow
//!
//! Orchestrates a configurable graph of checks: dependency-ordered waves,
//! conditional gates, per-item fan-out and declarative `goto`/`run` routing,
//! all on top of a versioned result journal.
//!
//! ## Usage
//!
//! ```bash
//! checkflow run checks.yaml [--check id] [--tag t] [--event pr_opened] [--json]
//! checkflow validate checks.yaml
//! checkflow inspect snapshot.json [--check id]
//! ```
//!
//! ## Modules
//!
//! - `config` - Check definitions, loading and validation
//! - `engine` - The state machine runner that plans and dispatches levels
//! - `error` - Coded engine errors
//! - `expression` - Sandboxed expression language used by gates and routing
//! - `graph` - Dependency graph and wave computation
//! - `journal` - Append-only result journal with scoped views
//! - `memory` - Namespaced key/value store shared by one run
//! - `provider` - Provider trait, registry and built-in providers
//! - `routing` - `on_success` / `on_fail` / `on_finish` evaluation
//! - `types` - Issues and check results
pub mod config;
pub mod engine;
pub mod error;
pub mod expression;
pub mod graph;
pub mod journal;
pub mod memory;
pub mod provider;
pub mod routing;
pub mod types;
