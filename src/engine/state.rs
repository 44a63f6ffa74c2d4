//! Engine states, dispatch records and the mutable run state
//!
//! Only the runner mutates [`RunState`]; dispatch lanes report back through a
//! channel instead of touching it.

use crate::journal::Scope;
use crate::routing::{LoopBudget, RouteKind};
use crate::types::Issue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Init,
    PlanReady,
    WavePlanning,
    LevelDispatch,
    Completed,
    Error,
}

impl EngineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, EngineState::Completed | EngineState::Error)
    }

    /// Whether the machine may move from `self` to `next`
    pub fn can_transition_to(self, next: EngineState) -> bool {
        use EngineState::*;
        match (self, next) {
            (_, Error) => !self.is_terminal(),
            (Init, PlanReady)
            | (PlanReady, WavePlanning)
            | (WavePlanning, LevelDispatch)
            | (WavePlanning, Completed)
            | (LevelDispatch, WavePlanning) => true,
            _ => false,
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Init => "init",
            EngineState::PlanReady => "plan_ready",
            EngineState::WavePlanning => "wave_planning",
            EngineState::LevelDispatch => "level_dispatch",
            EngineState::Completed => "completed",
            EngineState::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

/// What replaced a dispatch record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Supersession {
    /// A later attempt of the same dispatch
    Retry,
    /// A routing re-run or later dispatch at the same scope
    Rerun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    IfCondition,
    Assume,
    DependencyFailed,
    ForEachEmpty,
    FailFast,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SkipReason::IfCondition => "if_condition",
            SkipReason::Assume => "assume",
            SkipReason::DependencyFailed => "dependency_failed",
            SkipReason::ForEachEmpty => "for_each_empty",
            SkipReason::FailFast => "fail_fast",
        };
        f.write_str(name)
    }
}

/// One attempt at running a check in a scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub check_id: String,
    pub scope: Scope,
    pub attempt: u32,
    pub status: DispatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: u64,
    /// Set once a retry or a later dispatch at the same scope replaces this record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<Supersession>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default)]
    pub issue_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_id: Option<u64>,
    /// Item count of a successful forEach dispatch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<usize>,
}

impl DispatchRecord {
    pub fn new(check_id: impl Into<String>, scope: Scope, event: Option<String>) -> Self {
        Self {
            check_id: check_id.into(),
            scope,
            attempt: 1,
            status: DispatchStatus::Pending,
            skip_reason: None,
            started_at: None,
            finished_at: None,
            duration_ms: 0,
            superseded_by: None,
            event,
            issue_count: 0,
            commit_id: None,
            items: None,
        }
    }

    pub fn skipped(check_id: impl Into<String>, scope: Scope, event: Option<String>, reason: SkipReason) -> Self {
        let now = Utc::now();
        Self {
            status: DispatchStatus::Skipped,
            skip_reason: Some(reason),
            started_at: Some(now),
            finished_at: Some(now),
            ..Self::new(check_id, scope, event)
        }
    }

    /// Not replaced by a retry or a re-run
    pub fn is_live(&self) -> bool {
        self.superseded_by.is_none()
    }

    /// Failed attempt whose provider call was retried; never committed
    pub fn is_retried(&self) -> bool {
        self.superseded_by == Some(Supersession::Retry)
    }

    /// The provider was actually invoked
    pub fn is_execution(&self) -> bool {
        matches!(self.status, DispatchStatus::Success | DispatchStatus::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            DispatchStatus::Success | DispatchStatus::Failed | DispatchStatus::Skipped
        )
    }
}

/// Where a queued level came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LevelOrigin {
    Main,
    Forward {
        origin: String,
        target: String,
        scope: Scope,
    },
}

/// A wave of checks to dispatch under one base scope and event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedLevel {
    pub checks: Vec<String>,
    pub base_scope: Scope,
    pub event: Option<String>,
    pub origin: LevelOrigin,
}

impl PlannedLevel {
    pub fn main(checks: Vec<String>, event: Option<String>) -> Self {
        Self {
            checks,
            base_scope: Scope::root(),
            event,
            origin: LevelOrigin::Main,
        }
    }

    pub fn is_main(&self) -> bool {
        self.origin == LevelOrigin::Main
    }

    pub fn contains(&self, check_id: &str) -> bool {
        self.checks.iter().any(|c| c == check_id)
    }
}

/// A routing decision waiting for the next wave-planning step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRunRequest {
    pub target: String,
    pub kind: RouteKind,
    /// Scope of the dispatch that requested the run
    pub scope: Scope,
    pub event: Option<String>,
    pub origin: String,
}

/// A forEach parent whose `on_finish` waits for its fan-out to drain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredFinish {
    pub check_id: String,
    pub scope: Scope,
    pub event: Option<String>,
}

#[derive(Debug)]
pub struct RunState {
    pub records: BTreeMap<String, Vec<DispatchRecord>>,
    pub loop_budget: LoopBudget,
    pub queue: VecDeque<PlannedLevel>,
    pub forward_requests: Vec<ForwardRunRequest>,
    pub deferred_finishes: Vec<DeferredFinish>,
    /// Issues raised outside any committed result, such as deferred routing
    pub system_issues: Vec<Issue>,
    pub fail_fast_triggered: bool,
}

impl RunState {
    pub fn new(max_loops: u32) -> Self {
        Self {
            records: BTreeMap::new(),
            loop_budget: LoopBudget::new(max_loops),
            queue: VecDeque::new(),
            forward_requests: Vec::new(),
            deferred_finishes: Vec::new(),
            system_issues: Vec::new(),
            fail_fast_triggered: false,
        }
    }

    /// Append a record, superseding earlier terminal records at the same scope
    pub fn push_record(&mut self, record: DispatchRecord) {
        let records = self.records.entry(record.check_id.clone()).or_default();
        for earlier in records
            .iter_mut()
            .filter(|r| r.is_live() && r.is_terminal() && r.scope == record.scope)
        {
            earlier.superseded_by = Some(Supersession::Rerun);
        }
        records.push(record);
    }

    /// Live records of `check_id`, at most one per scope
    pub fn live_records(&self, check_id: &str) -> impl Iterator<Item = &DispatchRecord> {
        self.records_for(check_id).iter().filter(|r| r.is_live())
    }

    pub fn records_for(&self, check_id: &str) -> &[DispatchRecord] {
        self.records
            .get(check_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Latest live terminal record of `check_id` visible at `scope` (exact or ancestor)
    pub fn latest_visible(&self, check_id: &str, scope: &Scope) -> Option<&DispatchRecord> {
        self.records_for(check_id)
            .iter()
            .rev()
            .find(|r| r.is_live() && r.is_terminal() && r.scope.is_ancestor_of(scope))
    }

    /// Whether `check_id` waits in a queued main-plan level
    pub fn pending_in_main_plan(&self, check_id: &str) -> bool {
        self.queue
            .iter()
            .any(|level| level.is_main() && level.contains(check_id))
    }

    /// Whether a queued main-plan level will still dispatch `check_id` at or above `base_scope`
    pub fn queued_in_main_plan(&self, check_id: &str, base_scope: &Scope, event: &Option<String>) -> bool {
        self.queue.iter().any(|level| {
            level.is_main()
                && level.base_scope.is_ancestor_of(base_scope)
                && &level.event == event
                && level.contains(check_id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use EngineState::*;
        assert!(Init.can_transition_to(PlanReady));
        assert!(WavePlanning.can_transition_to(LevelDispatch));
        assert!(LevelDispatch.can_transition_to(WavePlanning));
        assert!(WavePlanning.can_transition_to(Completed));
        assert!(LevelDispatch.can_transition_to(Error));
        assert!(!Init.can_transition_to(LevelDispatch));
        assert!(!Completed.can_transition_to(Error));
        assert!(!LevelDispatch.can_transition_to(Completed));
    }

    #[test]
    fn test_latest_visible_respects_scope_and_supersession() {
        let mut run = RunState::new(10);
        let item = Scope::root().child("list", 0);

        let mut parent = DispatchRecord::new("dep", Scope::root(), None);
        parent.status = DispatchStatus::Success;
        run.push_record(parent);

        let mut attempt = DispatchRecord::new("dep", item.clone(), None);
        attempt.status = DispatchStatus::Running;
        run.push_record(attempt);
        if let Some(record) = run.records.get_mut("dep").and_then(|r| r.last_mut()) {
            record.status = DispatchStatus::Failed;
            record.superseded_by = Some(Supersession::Retry);
        }

        let mut sibling = DispatchRecord::new("dep", Scope::root().child("list", 1), None);
        sibling.status = DispatchStatus::Success;
        run.push_record(sibling);

        let visible = run.latest_visible("dep", &item).unwrap();
        assert_eq!(visible.scope, Scope::root());
        assert!(visible.is_live());
        assert!(run.latest_visible("other", &item).is_none());
    }

    #[test]
    fn test_rerun_supersedes_earlier_record_at_same_scope() {
        let mut run = RunState::new(10);
        let item = Scope::root().child("list", 0);
        for status in [DispatchStatus::Failed, DispatchStatus::Failed, DispatchStatus::Success] {
            let mut record = DispatchRecord::new("fix", Scope::root(), None);
            record.status = status;
            run.push_record(record);
        }
        let mut other_scope = DispatchRecord::new("fix", item, None);
        other_scope.status = DispatchStatus::Success;
        run.push_record(other_scope);

        let records = run.records_for("fix");
        assert_eq!(records[0].superseded_by, Some(Supersession::Rerun));
        assert_eq!(records[1].superseded_by, Some(Supersession::Rerun));
        assert!(records[2].is_live());
        assert!(records[3].is_live());

        let live: Vec<&DispatchRecord> = run.live_records("fix").collect();
        assert_eq!(live.len(), 2);
        assert_eq!(live[0].status, DispatchStatus::Success);
        assert_eq!(
            run.latest_visible("fix", &Scope::root()).map(|r| r.status),
            Some(DispatchStatus::Success)
        );
    }

    #[test]
    fn test_queued_main_level_covers_descendant_scopes() {
        let mut run = RunState::new(10);
        let event = Some("manual".to_string());
        run.queue
            .push_back(PlannedLevel::main(vec!["verify".into()], event.clone()));

        let item = Scope::root().child("list", 2);
        assert!(run.queued_in_main_plan("verify", &item, &event));
        assert!(run.queued_in_main_plan("verify", &Scope::root(), &event));
        assert!(!run.queued_in_main_plan("verify", &item, &Some("push".into())));
        assert!(!run.queued_in_main_plan("fix", &item, &event));
    }

    #[test]
    fn test_skip_reason_display() {
        assert_eq!(SkipReason::ForEachEmpty.to_string(), "for_each_empty");
        assert_eq!(
            serde_json::to_value(SkipReason::IfCondition).unwrap(),
            serde_json::json!("if_condition")
        );
    }
}
