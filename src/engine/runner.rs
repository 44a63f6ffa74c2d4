//! The state machine runner
//!
//! `run` is a loop over [`EngineState`]. Routing back-edges become queued
//! forward levels, so nothing recurses. The runner is the only owner of
//! [`RunState`]; dispatch lanes report through a channel and every outcome is
//! folded in here, in completion order.

use super::context::{for_each_items, BindingsBuilder, DispatchFacts, EventContext};
use super::dispatch::{self, DispatchShared, DispatchUnit, LaneMessage};
use super::events::{EngineEvent, EventBus};
use super::planning::{self, Selection};
use super::state::{
    DeferredFinish, DispatchRecord, DispatchStatus, EngineState, ForwardRunRequest, PlannedLevel, RunState,
    SkipReason, Supersession,
};
use super::stats::ExecutionStatistics;
use crate::config::{validate_config, CheckSpec, EngineConfig};
use crate::error::{EngineError, EngineResult, ErrorCode};
use crate::expression::{EvalScope, ExpressionEngine};
use crate::graph::DependencyGraph;
use crate::journal::{ExecutionJournal, JournalEntry, Scope};
use crate::memory::MemoryStore;
use crate::provider::ProviderRegistry;
use crate::routing::{RouteTarget, RoutingEvaluator};
use crate::types::{CheckResult, Issue};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Per-run choices layered over the loaded configuration
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub selection: Selection,
    pub event: EventContext,
    pub max_parallelism: Option<usize>,
    pub fail_fast: Option<bool>,
    pub max_loops: Option<u32>,
    pub session_id: Option<String>,
}

/// Everything a run produced
#[derive(Debug)]
pub struct RunOutcome {
    pub session_id: String,
    pub state: EngineState,
    pub records: BTreeMap<String, Vec<DispatchRecord>>,
    pub statistics: ExecutionStatistics,
    pub journal: Arc<ExecutionJournal>,
    pub fatal: Option<EngineError>,
    pub events: Vec<EngineEvent>,
    /// Issues not attached to any committed result
    pub issues: Vec<Issue>,
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        self.state == EngineState::Completed
    }

    pub fn records_for(&self, check_id: &str) -> &[DispatchRecord] {
        self.records.get(check_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Provider invocations of `check_id` that were not replaced by a retry
    pub fn run_count(&self, check_id: &str) -> usize {
        self.records_for(check_id)
            .iter()
            .filter(|r| !r.is_retried() && r.is_execution())
            .count()
    }

    pub fn skip_reasons(&self, check_id: &str) -> Vec<SkipReason> {
        self.records_for(check_id)
            .iter()
            .filter_map(|r| r.skip_reason)
            .collect()
    }

    /// Issues of every committed result plus system issues
    pub fn all_issues(&self) -> Vec<Issue> {
        let mut issues: Vec<Issue> = self
            .journal
            .entries()
            .into_iter()
            .flat_map(|e| e.result.issues)
            .collect();
        issues.extend(self.issues.iter().cloned());
        issues
    }

    /// 0 when completed without failures, 1 when a check failed, the error's code when fatal
    pub fn exit_code(&self) -> i32 {
        match &self.fatal {
            Some(e) => e.exit_code(),
            None if self.statistics.failed > 0 => 1,
            None => 0,
        }
    }

    pub fn summary(&self) -> Value {
        json!({
            "session_id": self.session_id,
            "state": self.state,
            "statistics": self.statistics,
            "records": self.records,
            "issues": self.all_issues(),
            "fatal": self.fatal.as_ref().map(|e| e.to_string()),
        })
    }
}

pub struct StateMachineRunner {
    config: Arc<EngineConfig>,
    registry: Arc<ProviderRegistry>,
    expressions: Arc<ExpressionEngine>,
    memory: Arc<MemoryStore>,
    journal: Arc<ExecutionJournal>,
    event: Arc<EventContext>,
    selection: Selection,
    bus: EventBus,
    state: EngineState,
    run: RunState,
    graph: Option<DependencyGraph>,
    plan: BTreeSet<String>,
    current_level: Option<PlannedLevel>,
    fail_fast: Arc<AtomicBool>,
    fatal: Option<EngineError>,
}

impl StateMachineRunner {
    pub fn new(config: EngineConfig, registry: ProviderRegistry) -> Self {
        let session_id = Uuid::new_v4().to_string();
        Self {
            memory: Arc::new(MemoryStore::new(config.memory.namespace.clone())),
            journal: Arc::new(ExecutionJournal::new(session_id)),
            run: RunState::new(config.routing.max_loops),
            config: Arc::new(config),
            registry: Arc::new(registry),
            expressions: Arc::new(ExpressionEngine::new()),
            event: Arc::new(EventContext::default()),
            selection: Selection::default(),
            bus: EventBus::new(),
            state: EngineState::Init,
            graph: None,
            plan: BTreeSet::new(),
            current_level: None,
            fail_fast: Arc::new(AtomicBool::new(false)),
            fatal: None,
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        let config = Arc::make_mut(&mut self.config);
        if let Some(n) = options.max_parallelism {
            config.max_parallelism = n.max(1);
        }
        if let Some(fail_fast) = options.fail_fast {
            config.fail_fast = fail_fast;
        }
        if let Some(max_loops) = options.max_loops {
            config.routing.max_loops = max_loops;
        }
        self.run = RunState::new(config.routing.max_loops);
        if let Some(session_id) = options.session_id {
            self.journal = Arc::new(ExecutionJournal::new(session_id));
        }
        self.event = Arc::new(options.event);
        self.selection = options.selection;
        self
    }

    /// Share a memory store with the caller, e.g. to seed or inspect it
    pub fn with_memory(mut self, memory: Arc<MemoryStore>) -> Self {
        self.memory = memory;
        self
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<EngineEvent> {
        self.bus.subscribe()
    }

    pub fn session_id(&self) -> &str {
        self.journal.session_id()
    }

    pub fn memory(&self) -> Arc<MemoryStore> {
        Arc::clone(&self.memory)
    }

    pub async fn run(mut self) -> RunOutcome {
        let started = Instant::now();
        info!(
            "Starting run {} with {} configured checks (event: {})",
            self.session_id(),
            self.config.checks.len(),
            self.event.name
        );

        while !self.state.is_terminal() {
            let step = match self.state {
                EngineState::Init => self.initialize().await,
                EngineState::PlanReady => self.plan_main(),
                EngineState::WavePlanning => self.plan_wave(),
                EngineState::LevelDispatch => self.dispatch_level().await,
                EngineState::Completed | EngineState::Error => break,
            };
            let mut next = match step {
                Ok(next) => next,
                Err(e) => {
                    error!("Run {} failed in {}: {}", self.session_id(), self.state, e);
                    self.fatal = Some(e);
                    EngineState::Error
                }
            };
            if next == EngineState::Completed {
                if let Err(e) = self.finalize().await {
                    error!("Run {} failed to persist results: {}", self.session_id(), e);
                    self.fatal = Some(e);
                    next = EngineState::Error;
                }
            }
            self.transition(next);
        }

        self.into_outcome(started)
    }

    fn transition(&mut self, next: EngineState) {
        let from = self.state;
        let to = if from.can_transition_to(next) {
            next
        } else {
            error!("Invalid engine transition from {} to {}", from, next);
            self.fatal.get_or_insert_with(|| EngineError::Internal {
                code: ErrorCode::INTERNAL_INVALID_TRANSITION,
                message: format!("invalid transition from {} to {}", from, next),
            });
            EngineState::Error
        };
        debug!("Run {} transitioned from {} to {}", self.session_id(), from, to);
        self.state = to;
        self.bus.emit(EngineEvent::StateChanged {
            from,
            to,
            timestamp: Utc::now(),
        });
    }

    fn graph(&self) -> EngineResult<&DependencyGraph> {
        self.graph
            .as_ref()
            .ok_or_else(|| EngineError::internal("dependency graph used before Init"))
    }

    async fn initialize(&mut self) -> EngineResult<EngineState> {
        validate_config(&self.config, &self.registry.names())?;
        self.registry.validate_checks(&self.config)?;
        self.graph = Some(DependencyGraph::build(&self.config.checks)?);

        if let Some(path) = &self.config.memory.file {
            let loaded = self.memory.load_file(path).await?;
            debug!("Loaded {} memory entries from {}", loaded, path.display());
        }
        Ok(EngineState::PlanReady)
    }

    fn plan_main(&mut self) -> EngineResult<EngineState> {
        let graph = self.graph()?;
        let selected = planning::select_checks(&self.config, graph, &self.selection, &self.event.name)?;
        let waves = graph.compute_waves(&selected);
        info!(
            "Planned {} checks in {} levels for event {}",
            selected.len(),
            waves.len(),
            self.event.name
        );
        for wave in waves {
            self.run
                .queue
                .push_back(PlannedLevel::main(wave, Some(self.event.name.clone())));
        }
        self.plan = selected;
        Ok(EngineState::WavePlanning)
    }

    fn plan_wave(&mut self) -> EngineResult<EngineState> {
        if self.run.fail_fast_triggered {
            info!(
                "Fail-fast triggered; {} queued levels will not run",
                self.run.queue.len()
            );
            self.run.queue.clear();
            self.run.forward_requests.clear();
            return Ok(EngineState::Completed);
        }

        loop {
            self.fire_ready_finishes();
            if !self.run.forward_requests.is_empty() {
                let graph = self
                    .graph
                    .as_ref()
                    .ok_or_else(|| EngineError::internal("dependency graph used before Init"))?;
                let queued = planning::merge_forward_runs(&mut self.run, graph, &mut self.plan)?;
                debug!("Queued {} forward levels", queued);
            }

            match self.run.queue.pop_front() {
                Some(level) => {
                    self.bus.emit(EngineEvent::LevelPlanned {
                        checks: level.checks.clone(),
                        base_scope: level.base_scope.clone(),
                        event: level.event.clone(),
                        forward: !level.is_main(),
                    });
                    self.current_level = Some(level);
                    return Ok(EngineState::LevelDispatch);
                }
                None if self.run.deferred_finishes.is_empty() && self.run.forward_requests.is_empty() => {
                    return Ok(EngineState::Completed);
                }
                None => {}
            }
        }
    }

    async fn dispatch_level(&mut self) -> EngineResult<EngineState> {
        let level = self
            .current_level
            .take()
            .ok_or_else(|| EngineError::internal("no level selected for dispatch"))?;
        let config = Arc::clone(&self.config);
        info!(
            "Dispatching level [{}] at {}",
            level.checks.join(", "),
            level.base_scope
        );

        let mut units = Vec::new();
        for check_id in &level.checks {
            let Some(check) = config.check(check_id) else {
                warn!("Planned check {} is not configured", check_id);
                continue;
            };
            match planning::candidate_scopes(check, &level.base_scope, &self.run, &config) {
                Err(reason) => {
                    self.record_skip(check_id, level.base_scope.clone(), level.event.clone(), reason);
                }
                Ok(scopes) => {
                    for scope in scopes {
                        if planning::dependencies_satisfied(check, &scope, &level.base_scope, &self.run, &config) {
                            units.push(DispatchUnit {
                                check_id: check_id.clone(),
                                scope,
                                event: level.event.clone(),
                            });
                        } else {
                            self.record_skip(check_id, scope, level.event.clone(), SkipReason::DependencyFailed);
                        }
                    }
                }
            }
        }

        if units.is_empty() {
            return Ok(EngineState::WavePlanning);
        }

        let lanes = dispatch::group_into_lanes(&config, units);
        debug!("Level split into {} session lanes", lanes.len());
        let shared = Arc::new(DispatchShared {
            config: Arc::clone(&config),
            registry: Arc::clone(&self.registry),
            expressions: Arc::clone(&self.expressions),
            memory: Arc::clone(&self.memory),
            journal: Arc::clone(&self.journal),
            event: Arc::clone(&self.event),
            fail_fast: Arc::clone(&self.fail_fast),
            loop_count: self.run.loop_budget.count(),
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let driver = dispatch::drive(shared, lanes, config.max_parallelism, tx);
        let consumer = async {
            while let Some(message) = rx.recv().await {
                self.handle_message(message);
            }
        };
        tokio::join!(driver, consumer);

        Ok(EngineState::WavePlanning)
    }

    fn handle_message(&mut self, message: LaneMessage) {
        match message {
            LaneMessage::Started {
                check_id,
                scope,
                event,
                attempt,
                started_at,
            } => {
                let mut record = DispatchRecord::new(check_id.clone(), scope.clone(), event);
                record.attempt = attempt;
                record.status = DispatchStatus::Running;
                record.started_at = Some(started_at);
                self.run.push_record(record);
                self.bus.emit(EngineEvent::CheckStarted {
                    check_id,
                    scope,
                    attempt,
                });
            }
            LaneMessage::Retrying {
                check_id,
                scope,
                attempt,
                error,
                backoff,
            } => {
                warn!(
                    "{} at {} failed on attempt {}: {}; retrying in {:?}",
                    check_id, scope, attempt, error, backoff
                );
                if let Some(record) = self.running_record(&check_id, &scope, attempt) {
                    let finished_at = Utc::now();
                    record.status = DispatchStatus::Failed;
                    record.superseded_by = Some(Supersession::Retry);
                    record.duration_ms = elapsed_ms(record.started_at, finished_at);
                    record.finished_at = Some(finished_at);
                }
                self.bus.emit(EngineEvent::CheckRetrying {
                    check_id,
                    scope,
                    attempt,
                    backoff_ms: backoff.as_millis() as u64,
                });
            }
            LaneMessage::Skipped { unit, reason } => {
                self.record_skip(&unit.check_id, unit.scope, unit.event, reason);
            }
            LaneMessage::Finished {
                unit,
                attempt,
                result,
                started_at,
                finished_at,
            } => self.complete(unit, attempt, result, started_at, finished_at),
        }
    }

    fn running_record(&mut self, check_id: &str, scope: &Scope, attempt: u32) -> Option<&mut DispatchRecord> {
        self.run
            .records
            .get_mut(check_id)?
            .iter_mut()
            .rev()
            .find(|r| &r.scope == scope && r.attempt == attempt && r.status == DispatchStatus::Running)
    }

    fn record_skip(&mut self, check_id: &str, scope: Scope, event: Option<String>, reason: SkipReason) {
        debug!("Skipped {} at {}: {}", check_id, scope, reason);
        self.run
            .push_record(DispatchRecord::skipped(check_id, scope.clone(), event, reason));
        self.bus.emit(EngineEvent::CheckSkipped {
            check_id: check_id.to_string(),
            scope,
            reason,
        });
    }

    fn eval_scope(&self, bindings: Map<String, Value>) -> EvalScope {
        let mut scope = EvalScope::new().with_memory(Arc::clone(&self.memory));
        for (name, value) in bindings {
            scope.set(name, value);
        }
        scope
    }

    fn post_exec_scope(&self, check: &CheckSpec, unit: &DispatchUnit, attempt: u32, result: &CheckResult) -> EvalScope {
        let view = self.journal.view(unit.scope.clone(), None);
        let facts = DispatchFacts {
            scope: &unit.scope,
            event: unit.event.as_deref(),
            attempt,
            loop_count: self.run.loop_budget.count(),
        };
        let bindings = BindingsBuilder::new(&self.config, &self.event).build(check, &view, facts, Some(result));
        self.eval_scope(bindings)
    }

    /// Contracts, routing, then the journal commit and the final record
    fn complete(
        &mut self,
        unit: DispatchUnit,
        attempt: u32,
        mut result: CheckResult,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) {
        let config = Arc::clone(&self.config);
        let expressions = Arc::clone(&self.expressions);
        let Some(check) = config.check(&unit.check_id) else {
            warn!("Result for unconfigured check {} dropped", unit.check_id);
            return;
        };
        let evaluator = RoutingEvaluator::new(&expressions, config.fail_if.as_deref());

        let scope = self.post_exec_scope(check, &unit, attempt, &result);
        let failed = evaluator.apply_contracts(check, &mut result, &scope);
        let items = (check.for_each && !failed).then(|| for_each_items(result.output.as_ref()));

        let defer_finish = check.on_finish.is_some()
            && items.as_ref().is_some_and(|items| !items.is_empty())
            && self.has_planned_dependents(&check.id);

        let scope = self.post_exec_scope(check, &unit, attempt, &result);
        let is_known = |id: &str| config.checks.contains_key(id);
        let mut routing_issues = Vec::new();
        let targets = evaluator.route(check, failed, !defer_finish, &scope, &is_known, &mut routing_issues);
        for target in targets {
            self.schedule(&check.id, &unit.scope, unit.event.clone(), target, &mut routing_issues);
        }
        result.issues.extend(routing_issues);

        let session_id = self.journal.session_id().to_string();
        let committed = self.journal.commit(JournalEntry::new(
            session_id.clone(),
            unit.scope.clone(),
            check.id.clone(),
            result.clone(),
            unit.event.clone(),
        ));
        if let Some(items) = &items {
            for (index, item) in items.iter().enumerate() {
                self.journal.commit(JournalEntry::new(
                    session_id.clone(),
                    unit.scope.child(check.id.clone(), index),
                    check.id.clone(),
                    CheckResult::with_output(item.clone()),
                    unit.event.clone(),
                ));
            }
            debug!("{} fanned out over {} items at {}", check.id, items.len(), unit.scope);
        }

        if defer_finish {
            self.run.deferred_finishes.push(DeferredFinish {
                check_id: check.id.clone(),
                scope: unit.scope.clone(),
                event: unit.event.clone(),
            });
        }

        let status = if failed {
            DispatchStatus::Failed
        } else {
            DispatchStatus::Success
        };
        let duration_ms = elapsed_ms(Some(started_at), finished_at);
        let issue_count = result.issues.len();
        match self.running_record(&check.id, &unit.scope, attempt) {
            Some(record) => {
                record.status = status;
                record.finished_at = Some(finished_at);
                record.duration_ms = duration_ms;
                record.issue_count = issue_count;
                record.commit_id = Some(committed.commit_id);
                record.items = items.as_ref().map(Vec::len);
                record.event = unit.event.clone();
            }
            None => {
                let mut record = DispatchRecord::new(check.id.clone(), unit.scope.clone(), unit.event.clone());
                record.attempt = attempt;
                record.status = status;
                record.started_at = Some(started_at);
                record.finished_at = Some(finished_at);
                record.duration_ms = duration_ms;
                record.issue_count = issue_count;
                record.commit_id = Some(committed.commit_id);
                record.items = items.as_ref().map(Vec::len);
                self.run.push_record(record);
            }
        }

        if failed {
            warn!("{} failed at {} with {} issues", check.id, unit.scope, issue_count);
        } else {
            debug!("{} succeeded at {} (commit #{})", check.id, unit.scope, committed.commit_id);
        }
        self.bus.emit(EngineEvent::CheckCompleted {
            check_id: check.id.clone(),
            scope: unit.scope,
            status,
            attempt,
            duration_ms,
            issue_count,
        });

        if config.fail_fast && failed && result.has_blocking_issue() && !self.run.fail_fast_triggered {
            warn!("Fail-fast: {} failed; remaining dispatches will be skipped", check.id);
            self.run.fail_fast_triggered = true;
            self.fail_fast.store(true, Ordering::SeqCst);
        }
    }

    fn has_planned_dependents(&self, check_id: &str) -> bool {
        self.graph.as_ref().is_some_and(|graph| {
            graph
                .dependents_closure(check_id)
                .iter()
                .any(|d| self.plan.contains(d))
        })
    }

    /// Apply the loop budget to one routing target and queue it as a forward run
    fn schedule(
        &mut self,
        origin: &str,
        scope: &Scope,
        event: Option<String>,
        target: RouteTarget,
        issues: &mut Vec<Issue>,
    ) {
        match self.run.loop_budget.try_schedule(origin, &target) {
            Ok(count) => {
                debug!(
                    "{} {} -> {} scheduled ({}/{})",
                    target.rule,
                    origin,
                    target.target,
                    count,
                    self.run.loop_budget.max_loops()
                );
                self.bus.emit(EngineEvent::ForwardRunRequested {
                    target: target.target.clone(),
                    kind: target.kind,
                    scope: scope.clone(),
                    goto_event: target.goto_event.clone(),
                    origin: origin.to_string(),
                });
                self.run.forward_requests.push(ForwardRunRequest {
                    target: target.target,
                    kind: target.kind,
                    scope: scope.clone(),
                    event: target.goto_event.or(event),
                    origin: origin.to_string(),
                });
            }
            Err(issue) => issues.push(issue),
        }
    }

    /// Fire deferred forEach `on_finish` rules whose dependents are no longer queued
    fn fire_ready_finishes(&mut self) {
        if self.run.deferred_finishes.is_empty() {
            return;
        }
        let Some(graph) = self.graph.as_ref() else {
            return;
        };

        let pending = std::mem::take(&mut self.run.deferred_finishes);
        let (ready, waiting): (Vec<_>, Vec<_>) = pending.into_iter().partition(|finish| {
            let dependents = graph.dependents_closure(&finish.check_id);
            !self
                .run
                .queue
                .iter()
                .any(|level| level.checks.iter().any(|c| dependents.contains(c)))
        });
        self.run.deferred_finishes = waiting;

        let config = Arc::clone(&self.config);
        let expressions = Arc::clone(&self.expressions);
        let evaluator = RoutingEvaluator::new(&expressions, config.fail_if.as_deref());
        for finish in ready {
            let Some(check) = config.check(&finish.check_id) else {
                continue;
            };
            debug!("Running deferred on_finish of {} at {}", check.id, finish.scope);
            let result = self
                .journal
                .view(finish.scope.clone(), None)
                .get(&check.id)
                .map(|entry| entry.result)
                .unwrap_or_default();
            let unit = DispatchUnit {
                check_id: check.id.clone(),
                scope: finish.scope.clone(),
                event: finish.event.clone(),
            };
            let scope = self.post_exec_scope(check, &unit, 1, &result);
            let is_known = |id: &str| config.checks.contains_key(id);
            let mut issues = Vec::new();
            for target in evaluator.finish_targets(check, &scope, &is_known, &mut issues) {
                self.schedule(&check.id, &finish.scope, finish.event.clone(), target, &mut issues);
            }
            self.run.system_issues.extend(issues);
        }
    }

    async fn finalize(&mut self) -> EngineResult<()> {
        if let Some(path) = &self.config.memory.file {
            self.memory.save_file(path).await?;
            debug!("Saved memory to {}", path.display());
        }
        if let Some(path) = &self.config.journal.snapshot {
            self.journal.save_snapshot(path).await?;
            debug!("Saved journal snapshot to {}", path.display());
        }
        Ok(())
    }

    fn into_outcome(self, started: Instant) -> RunOutcome {
        let statistics =
            ExecutionStatistics::collect(&self.config, &self.run, &self.journal, started.elapsed());
        info!(
            "Run {} finished in {}: {} executed, {} succeeded, {} failed, {} skipped",
            self.journal.session_id(),
            self.state,
            statistics.total_executions,
            statistics.successful,
            statistics.failed,
            statistics.skipped
        );
        RunOutcome {
            session_id: self.journal.session_id().to_string(),
            state: self.state,
            records: self.run.records,
            statistics,
            journal: self.journal,
            fatal: self.fatal,
            events: self.bus.into_events(),
            issues: self.run.system_issues,
        }
    }
}

fn elapsed_ms(started_at: Option<DateTime<Utc>>, finished_at: DateTime<Utc>) -> u64 {
    started_at
        .map(|s| (finished_at - s).num_milliseconds().max(0) as u64)
        .unwrap_or(0)
}
