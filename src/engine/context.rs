//! Expression bindings for one dispatch
//!
//! Gates see the journal as of dispatch time; contracts and routing see it as
//! of completion time plus the check's own result.

use crate::config::{CheckSpec, EngineConfig};
use crate::journal::{ContextView, Scope};
use crate::types::{CheckResult, IssueCounts};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

pub const DEFAULT_EVENT: &str = "manual";

/// The triggering event and repository metadata of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventContext {
    #[serde(default = "default_event_name")]
    pub name: String,
    #[serde(default)]
    pub pr: Value,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default, alias = "baseBranch")]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Raw event payload, exposed as `event.payload`
    #[serde(default)]
    pub payload: Value,
}

impl Default for EventContext {
    fn default() -> Self {
        Self {
            name: default_event_name(),
            pr: Value::Null,
            files: Vec::new(),
            branch: None,
            base_branch: None,
            env: BTreeMap::new(),
            payload: Value::Null,
        }
    }
}

impl EventContext {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

fn default_event_name() -> String {
    DEFAULT_EVENT.to_string()
}

/// Items a forEach output fans out over: arrays as-is, null as none, anything else wrapped
pub fn for_each_items(output: Option<&Value>) -> Vec<Value> {
    match output {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(other) => vec![other.clone()],
    }
}

/// Per-dispatch facts the bindings depend on
#[derive(Debug, Clone, Copy)]
pub struct DispatchFacts<'a> {
    pub scope: &'a Scope,
    /// Effective event, after any `goto_event` override
    pub event: Option<&'a str>,
    pub attempt: u32,
    pub loop_count: u32,
}

pub struct BindingsBuilder<'a> {
    config: &'a EngineConfig,
    event: &'a EventContext,
}

impl<'a> BindingsBuilder<'a> {
    pub fn new(config: &'a EngineConfig, event: &'a EventContext) -> Self {
        Self { config, event }
    }

    pub fn build(
        &self,
        check: &CheckSpec,
        view: &ContextView<'_>,
        facts: DispatchFacts<'_>,
        result: Option<&CheckResult>,
    ) -> Map<String, Value> {
        let mut bindings = Map::new();

        let (outputs, history) = self.outputs(view);
        bindings.insert("outputs".into(), Value::Object(outputs));
        bindings.insert("outputsHistory".into(), Value::Object(history.clone()));
        bindings.insert("outputs_history".into(), Value::Object(history));

        let output = result.and_then(|r| r.output.clone()).unwrap_or(Value::Null);
        let issues = result
            .map(|r| serde_json::to_value(&r.issues).unwrap_or(Value::Array(Vec::new())))
            .unwrap_or(Value::Array(Vec::new()));
        let error = result
            .and_then(|r| r.error.clone())
            .map(Value::String)
            .unwrap_or(Value::Null);
        bindings.insert("output".into(), output);
        bindings.insert("issues".into(), issues);
        bindings.insert("error".into(), error);

        let counts = result.map(CheckResult::counts).unwrap_or_default();
        let mut metadata = counters(&counts);
        for (key, value) in counters(&counts) {
            bindings.insert(key, value);
        }
        metadata.insert("checkName".into(), json!(check.id));

        let event_name = facts.event.unwrap_or(&self.event.name);
        metadata.insert("event".into(), json!(event_name));
        bindings.insert("metadata".into(), Value::Object(metadata));
        self.insert_event(&mut bindings, event_name);

        bindings.insert("checkName".into(), json!(check.id));
        bindings.insert(
            "step".into(),
            json!({
                "id": check.id,
                "type": check.provider,
                "tags": check.tags,
                "group": check.group,
            }),
        );
        bindings.insert("attempt".into(), json!(facts.attempt));
        bindings.insert("loop".into(), json!(facts.loop_count));
        bindings.insert("forEach".into(), for_each_binding(view, facts.scope));
        bindings
    }

    fn outputs(&self, view: &ContextView<'_>) -> (Map<String, Value>, Map<String, Value>) {
        let mut outputs = Map::new();
        let mut history = Map::new();
        for id in view.check_ids() {
            let latest = view
                .get(&id)
                .and_then(|e| e.result.output)
                .unwrap_or(Value::Null);
            outputs.insert(id.clone(), latest);

            let is_for_each = self.config.check(&id).is_some_and(|c| c.for_each);
            if is_for_each {
                let raw = view
                    .get_raw(&id)
                    .and_then(|e| e.result.output)
                    .unwrap_or(Value::Null);
                outputs.insert(format!("{}-raw", id), raw);
            }

            // Per-item entries of a fan-out are views of the aggregate, not runs
            let runs: Vec<Value> = view
                .get_history(&id)
                .into_iter()
                .filter(|e| e.scope.segments().last().map_or(true, |s| s.check_id != id))
                .map(|e| e.result.output.unwrap_or(Value::Null))
                .collect();
            history.insert(id, Value::Array(runs));
        }
        (outputs, history)
    }

    fn insert_event(&self, bindings: &mut Map<String, Value>, event_name: &str) {
        let event = self.event;
        bindings.insert(
            "event".into(),
            json!({"name": event_name, "payload": event.payload}),
        );
        bindings.insert("pr".into(), event.pr.clone());
        bindings.insert("files".into(), json!(event.files));
        bindings.insert("filesChanged".into(), json!(event.files));
        bindings.insert("filesCount".into(), json!(event.files.len()));
        bindings.insert("branch".into(), json!(event.branch));
        bindings.insert("baseBranch".into(), json!(event.base_branch));
        bindings.insert("env".into(), json!(event.env));
    }
}

fn counters(counts: &IssueCounts) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("criticalIssues".into(), json!(counts.critical));
    map.insert("errorIssues".into(), json!(counts.error));
    map.insert("warningIssues".into(), json!(counts.warning));
    map.insert("infoIssues".into(), json!(counts.info));
    map.insert("totalIssues".into(), json!(counts.total));
    map
}

/// `{index, total, item, parent}` for the innermost fan-out of `scope`, or null
fn for_each_binding(view: &ContextView<'_>, scope: &Scope) -> Value {
    let Some(segment) = scope.segments().last() else {
        return Value::Null;
    };
    let item = view
        .get(&segment.check_id)
        .filter(|e| &e.scope == scope)
        .and_then(|e| e.result.output)
        .unwrap_or(Value::Null);
    let total = view
        .get_raw(&segment.check_id)
        .map(|e| for_each_items(e.result.output.as_ref()).len())
        .unwrap_or(0);
    json!({
        "index": segment.index,
        "total": total,
        "item": item,
        "parent": segment.check_id,
    })
}
