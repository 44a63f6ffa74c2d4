//! Allow-listed functions, namespaces and methods
//!
//! Anything not named here is a type error at call time.

use super::error::{EvalError, EvalResult};
use super::evaluator::{Arg, Evaluator, Lambda};
use super::value::{number, strict_equals, to_js_string, to_number, truthy, type_name};
use crate::memory::MemoryStore;
use serde_json::Value;
use tracing::debug;

const NAMESPACES: &[&str] = &["JSON", "Math", "Object", "Array", "memory"];

/// GitHub author associations, most privileged first
const PERMISSION_RANKS: &[(&str, u8)] = &[
    ("OWNER", 6),
    ("MEMBER", 5),
    ("COLLABORATOR", 4),
    ("CONTRIBUTOR", 3),
    ("FIRST_TIME_CONTRIBUTOR", 2),
    ("FIRST_TIMER", 1),
    ("NONE", 0),
];

pub fn permission_rank(association: &str) -> u8 {
    let upper = association.to_ascii_uppercase();
    PERMISSION_RANKS
        .iter()
        .find(|(name, _)| *name == upper)
        .map(|(_, rank)| *rank)
        .unwrap_or(0)
}

fn arg(args: &[Arg<'_>], i: usize) -> Value {
    args.get(i).map(Arg::value).unwrap_or(Value::Null)
}

fn lambda_arg<'p>(args: &[Arg<'p>], i: usize, function: &str) -> EvalResult<Lambda<'p>> {
    args.get(i).and_then(Arg::lambda).ok_or_else(|| {
        EvalError::type_error(format!("{} expects an arrow function argument", function))
    })
}

fn array_arg(value: Value, function: &str) -> EvalResult<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        other => Err(EvalError::type_error(format!(
            "{} expects an array but got {}",
            function,
            type_name(&other)
        ))),
    }
}

fn opt_str(value: &Value) -> Option<&str> {
    value.as_str()
}

/// Case-insensitive substring test for strings, membership for arrays
fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| strict_equals(item, needle)),
        Value::Null => false,
        other => to_js_string(other)
            .to_lowercase()
            .contains(&to_js_string(needle).to_lowercase()),
    }
}

fn length(value: &Value) -> usize {
    match value {
        Value::Array(items) => items.len(),
        Value::String(s) => s.chars().count(),
        Value::Object(map) => map.len(),
        _ => 0,
    }
}

fn file_name(file: &Value) -> Option<String> {
    match file {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map
            .get("filename")
            .or_else(|| map.get("path"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

/// Clamp a JS-style slice bound against a length
fn slice_bound(value: &Value, len: usize, default: usize) -> usize {
    if value.is_null() {
        return default;
    }
    let n = to_number(value);
    if n.is_nan() {
        return 0;
    }
    if n < 0.0 {
        len.saturating_sub((-n) as usize)
    } else {
        (n as usize).min(len)
    }
}

impl Evaluator<'_> {
    pub(super) fn is_namespace(&self, name: &str) -> bool {
        NAMESPACES.contains(&name) && self.scope.get(name).is_none()
    }

    fn files(&self, args: &[Arg<'_>], arity: usize) -> (Vec<Value>, Vec<Value>) {
        // hasFileMatching(pattern) reads the `files` binding; hasFileMatching(files, pattern) does not
        if args.len() > arity {
            let files = match arg(args, 0) {
                Value::Array(items) => items,
                _ => Vec::new(),
            };
            (files, args[1..].iter().map(Arg::value).collect())
        } else {
            let files = match self.scope.get("files") {
                Some(Value::Array(items)) => items.clone(),
                _ => Vec::new(),
            };
            (files, args.iter().map(Arg::value).collect())
        }
    }

    fn author_association(&self) -> String {
        self.scope
            .get("pr")
            .and_then(|pr| pr.get("authorAssociation"))
            .and_then(Value::as_str)
            .unwrap_or("NONE")
            .to_string()
    }

    fn has_min_permission(&self, level: &str) -> bool {
        permission_rank(&self.author_association()) >= permission_rank(level)
    }

    fn predicate_count(&mut self, items: &[Value], predicate: Lambda<'_>) -> EvalResult<usize> {
        let mut count = 0;
        for (i, item) in items.iter().enumerate() {
            if truthy(&self.call_lambda(predicate, &[item.clone(), Value::from(i)])?) {
                count += 1;
            }
        }
        Ok(count)
    }

    pub(super) fn call_function(&mut self, name: &str, args: Vec<Arg<'_>>) -> EvalResult<Value> {
        let result = match name {
            "contains" => Value::Bool(contains(&arg(&args, 0), &arg(&args, 1))),
            "startsWith" => Value::Bool(
                to_js_string(&arg(&args, 0)).starts_with(&to_js_string(&arg(&args, 1))),
            ),
            "endsWith" => Value::Bool(
                to_js_string(&arg(&args, 0)).ends_with(&to_js_string(&arg(&args, 1))),
            ),
            "length" => Value::from(length(&arg(&args, 0))),
            "matches" => {
                let pattern = to_js_string(&arg(&args, 1));
                let re = regex::Regex::new(&pattern).map_err(|e| {
                    EvalError::type_error(format!("invalid regular expression '{}': {}", pattern, e))
                })?;
                Value::Bool(re.is_match(&to_js_string(&arg(&args, 0))))
            }
            "hasIssue" | "countIssues" => {
                let issues = array_arg(arg(&args, 0), name)?;
                let field = to_js_string(&arg(&args, 1));
                let expected = arg(&args, 2);
                let count = issues
                    .iter()
                    .filter(|issue| {
                        issue
                            .get(&field)
                            .is_some_and(|v| super::value::loose_equals(v, &expected))
                    })
                    .count();
                if name == "hasIssue" {
                    Value::Bool(count > 0)
                } else {
                    Value::from(count)
                }
            }
            "hasFileMatching" => {
                let (files, rest) = self.files(&args, 1);
                let pattern = rest.first().map(to_js_string).unwrap_or_default();
                let glob = glob::Pattern::new(&pattern).map_err(|e| {
                    EvalError::type_error(format!("invalid glob '{}': {}", pattern, e))
                })?;
                Value::Bool(
                    files
                        .iter()
                        .filter_map(file_name)
                        .any(|f| glob.matches(&f) || f.contains(&pattern)),
                )
            }
            "hasFileWith" => {
                let (files, rest) = self.files(&args, 1);
                let needle = rest.first().map(to_js_string).unwrap_or_default();
                Value::Bool(files.iter().filter_map(file_name).any(|f| f.contains(&needle)))
            }
            "any" | "all" | "none" | "count" => {
                let items = array_arg(arg(&args, 0), name)?;
                if name == "count" && args.len() < 2 {
                    return Ok(Value::from(items.len()));
                }
                let predicate = lambda_arg(&args, 1, name)?;
                let matched = self.predicate_count(&items, predicate)?;
                match name {
                    "any" => Value::Bool(matched > 0),
                    "all" => Value::Bool(matched == items.len()),
                    "none" => Value::Bool(matched == 0),
                    _ => Value::from(matched),
                }
            }
            "always" => Value::Bool(true),
            "success" | "failure" => {
                let failed = self.scope.get("error").is_some_and(truthy);
                Value::Bool(if name == "success" { !failed } else { failed })
            }
            "log" => {
                let parts: Vec<String> = args.iter().map(|a| to_js_string(&a.value())).collect();
                debug!("expression log: {}", parts.join(" "));
                Value::Null
            }
            "hasMinPermission" => {
                Value::Bool(self.has_min_permission(&to_js_string(&arg(&args, 0))))
            }
            "isOwner" => Value::Bool(self.has_min_permission("OWNER")),
            "isMember" => Value::Bool(self.has_min_permission("MEMBER")),
            "isCollaborator" => Value::Bool(self.has_min_permission("COLLABORATOR")),
            "isContributor" => Value::Bool(self.has_min_permission("CONTRIBUTOR")),
            "isFirstTimer" => {
                let association = self.author_association().to_ascii_uppercase();
                Value::Bool(association == "FIRST_TIME_CONTRIBUTOR" || association == "FIRST_TIMER")
            }
            other => return Err(EvalError::Reference(other.to_string())),
        };
        Ok(result)
    }

    pub(super) fn call_namespace(
        &mut self,
        namespace: &str,
        function: &str,
        args: Vec<Arg<'_>>,
    ) -> EvalResult<Value> {
        let value = arg(&args, 0);
        let result = match (namespace, function) {
            ("JSON", "stringify") => {
                let pretty = !arg(&args, 2).is_null();
                let rendered = if pretty {
                    serde_json::to_string_pretty(&value)
                } else {
                    serde_json::to_string(&value)
                };
                Value::String(rendered.map_err(|e| EvalError::type_error(e.to_string()))?)
            }
            ("JSON", "parse") => serde_json::from_str(&to_js_string(&value))
                .map_err(|e| EvalError::type_error(format!("JSON.parse: {}", e)))?,
            ("Array", "isArray") => Value::Bool(value.is_array()),
            ("Object", "keys") => match value {
                Value::Object(map) => map.keys().cloned().map(Value::String).collect(),
                Value::Array(items) => (0..items.len()).map(|i| Value::String(i.to_string())).collect(),
                _ => Value::Array(Vec::new()),
            },
            ("Object", "values") => match value {
                Value::Object(map) => map.values().cloned().collect(),
                Value::Array(items) => Value::Array(items),
                _ => Value::Array(Vec::new()),
            },
            ("Object", "entries") => match value {
                Value::Object(map) => map
                    .into_iter()
                    .map(|(k, v)| Value::Array(vec![Value::String(k), v]))
                    .collect(),
                _ => Value::Array(Vec::new()),
            },
            ("Math", "min") | ("Math", "max") => {
                let numbers = args.iter().map(|a| to_number(&a.value()));
                let folded = if function == "min" {
                    numbers.fold(f64::INFINITY, f64::min)
                } else {
                    numbers.fold(f64::NEG_INFINITY, f64::max)
                };
                number(folded)
            }
            ("Math", "abs") => number(to_number(&value).abs()),
            ("Math", "floor") => number(to_number(&value).floor()),
            ("Math", "ceil") => number(to_number(&value).ceil()),
            ("Math", "round") => number((to_number(&value) + 0.5).floor()),
            ("memory", _) => return self.call_memory(function, &args),
            _ => {
                return Err(EvalError::type_error(format!(
                    "{}.{} is not a function",
                    namespace, function
                )))
            }
        };
        Ok(result)
    }

    fn call_memory(&mut self, function: &str, args: &[Arg<'_>]) -> EvalResult<Value> {
        let memory: &MemoryStore = self
            .scope
            .memory()
            .ok_or_else(|| EvalError::Memory("memory store is not available".to_string()))?;
        let key = to_js_string(&arg(args, 0));
        let ns_at = |i: usize| args.get(i).map(Arg::value).filter(|v| !v.is_null());
        let result = match function {
            "get" => {
                let ns = ns_at(1);
                memory.get(&key, ns.as_ref().and_then(opt_str)).unwrap_or(Value::Null)
            }
            "has" => {
                let ns = ns_at(1);
                Value::Bool(memory.has(&key, ns.as_ref().and_then(opt_str)))
            }
            "set" => {
                let value = arg(args, 1);
                let ns = ns_at(2);
                memory.set(&key, value.clone(), ns.as_ref().and_then(opt_str));
                value
            }
            "append" => {
                let ns = ns_at(2);
                memory.append(&key, arg(args, 1), ns.as_ref().and_then(opt_str))
            }
            "increment" => {
                let amount = match arg(args, 1) {
                    Value::Null => 1.0,
                    other => to_number(&other),
                };
                let ns = ns_at(2);
                memory
                    .increment(&key, amount, ns.as_ref().and_then(opt_str))
                    .map_err(|e| EvalError::Memory(e.to_string()))?
            }
            "delete" => {
                let ns = ns_at(1);
                Value::Bool(memory.delete(&key, ns.as_ref().and_then(opt_str)))
            }
            "list" => {
                let ns = ns_at(0);
                memory
                    .list(ns.as_ref().and_then(opt_str))
                    .into_iter()
                    .map(Value::String)
                    .collect()
            }
            "getAll" => {
                let ns = ns_at(0);
                Value::Object(memory.get_all(ns.as_ref().and_then(opt_str)))
            }
            other => {
                return Err(EvalError::type_error(format!(
                    "memory.{} is not a function",
                    other
                )))
            }
        };
        Ok(result)
    }

    pub(super) fn call_method(
        &mut self,
        receiver: Value,
        method: &str,
        args: Vec<Arg<'_>>,
    ) -> EvalResult<Value> {
        match receiver {
            Value::String(s) => string_method(&s, method, &args),
            Value::Array(items) => self.array_method(items, method, &args),
            other => Err(EvalError::type_error(format!(
                "{} has no method '{}'",
                type_name(&other),
                method
            ))),
        }
    }

    fn array_method(&mut self, items: Vec<Value>, method: &str, args: &[Arg<'_>]) -> EvalResult<Value> {
        let result = match method {
            "includes" => Value::Bool(items.iter().any(|item| strict_equals(item, &arg(args, 0)))),
            "indexOf" => {
                let needle = arg(args, 0);
                number(
                    items
                        .iter()
                        .position(|item| strict_equals(item, &needle))
                        .map(|i| i as f64)
                        .unwrap_or(-1.0),
                )
            }
            "join" => {
                let separator = match arg(args, 0) {
                    Value::Null => ",".to_string(),
                    other => to_js_string(&other),
                };
                Value::String(
                    items
                        .iter()
                        .map(|item| match item {
                            Value::Null => String::new(),
                            other => to_js_string(other),
                        })
                        .collect::<Vec<_>>()
                        .join(&separator),
                )
            }
            "slice" => {
                let len = items.len();
                let start = slice_bound(&arg(args, 0), len, 0);
                let end = slice_bound(&arg(args, 1), len, len);
                Value::Array(if start < end { items[start..end].to_vec() } else { Vec::new() })
            }
            "concat" => {
                let mut out = items;
                for a in args {
                    match a.value() {
                        Value::Array(more) => out.extend(more),
                        other => out.push(other),
                    }
                }
                Value::Array(out)
            }
            "some" | "every" => {
                let predicate = lambda_arg(args, 0, method)?;
                let matched = self.predicate_count(&items, predicate)?;
                Value::Bool(if method == "some" {
                    matched > 0
                } else {
                    matched == items.len()
                })
            }
            "filter" => {
                let predicate = lambda_arg(args, 0, method)?;
                let mut kept = Vec::new();
                for (i, item) in items.into_iter().enumerate() {
                    if truthy(&self.call_lambda(predicate, &[item.clone(), Value::from(i)])?) {
                        kept.push(item);
                    }
                }
                Value::Array(kept)
            }
            "map" => {
                let mapper = lambda_arg(args, 0, method)?;
                let mut mapped = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    mapped.push(self.call_lambda(mapper, &[item, Value::from(i)])?);
                }
                Value::Array(mapped)
            }
            "find" => {
                let predicate = lambda_arg(args, 0, method)?;
                for (i, item) in items.into_iter().enumerate() {
                    if truthy(&self.call_lambda(predicate, &[item.clone(), Value::from(i)])?) {
                        return Ok(item);
                    }
                }
                Value::Null
            }
            other => {
                return Err(EvalError::type_error(format!(
                    "array has no method '{}'",
                    other
                )))
            }
        };
        Ok(result)
    }
}

fn string_method(s: &str, method: &str, args: &[Arg<'_>]) -> EvalResult<Value> {
    let first = to_js_string(&arg(args, 0));
    let result = match method {
        "includes" => Value::Bool(s.contains(&first)),
        "startsWith" => Value::Bool(s.starts_with(&first)),
        "endsWith" => Value::Bool(s.ends_with(&first)),
        "indexOf" => number(
            s.find(&first)
                .map(|byte| s[..byte].chars().count() as f64)
                .unwrap_or(-1.0),
        ),
        "toLowerCase" => Value::String(s.to_lowercase()),
        "toUpperCase" => Value::String(s.to_uppercase()),
        "trim" => Value::String(s.trim().to_string()),
        "split" => {
            let parts: Vec<Value> = if first.is_empty() {
                s.chars().map(|c| Value::String(c.to_string())).collect()
            } else {
                s.split(first.as_str()).map(|p| Value::String(p.to_string())).collect()
            };
            Value::Array(parts)
        }
        "slice" => {
            let chars: Vec<char> = s.chars().collect();
            let len = chars.len();
            let start = slice_bound(&arg(args, 0), len, 0);
            let end = slice_bound(&arg(args, 1), len, len);
            Value::String(if start < end {
                chars[start..end].iter().collect()
            } else {
                String::new()
            })
        }
        "concat" => Value::String(
            std::iter::once(s.to_string())
                .chain(args.iter().map(|a| to_js_string(&a.value())))
                .collect(),
        ),
        other => {
            return Err(EvalError::type_error(format!(
                "string has no method '{}'",
                other
            )))
        }
    };
    Ok(result)
}
