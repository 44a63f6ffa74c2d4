//! Check selection, per-level scope planning and forward-run merging
//!
//! Everything here reads the run state; only [`merge_forward_runs`] changes it,
//! and it is only called from the runner's wave-planning step.

use super::state::{DispatchRecord, DispatchStatus, LevelOrigin, PlannedLevel, RunState, SkipReason};
use crate::config::{CheckSpec, EngineConfig, FanoutMode};
use crate::error::{EngineError, EngineResult, ErrorCode};
use crate::graph::DependencyGraph;
use crate::journal::Scope;
use crate::routing::RouteKind;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::debug;

/// Which checks a run plans and under which event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    /// Explicit check ids; empty selects every check
    pub checks: Vec<String>,
    pub include_tags: Vec<String>,
    pub exclude_tags: Vec<String>,
}

/// Resolve the checks planned for `event`
///
/// Explicit ids pull in their dependency closure. Tag filters then apply, and
/// finally the event trigger filter.
pub fn select_checks(
    config: &EngineConfig,
    graph: &DependencyGraph,
    selection: &Selection,
    event: &str,
) -> EngineResult<BTreeSet<String>> {
    let mut selected = BTreeSet::new();
    if selection.checks.is_empty() {
        selected.extend(config.checks.keys().cloned());
    } else {
        for id in &selection.checks {
            if !config.checks.contains_key(id) {
                return Err(EngineError::config_with_code(
                    ErrorCode::CONFIG_UNKNOWN_CHECK,
                    format!("requested check '{}' is not configured", id),
                ));
            }
            selected.insert(id.clone());
            selected.extend(graph.dependencies_closure(id));
        }
    }

    selected.retain(|id| {
        let Some(check) = config.check(id) else {
            return false;
        };
        let included = selection.include_tags.is_empty()
            || check.tags.iter().any(|t| selection.include_tags.contains(t));
        let excluded = check.tags.iter().any(|t| selection.exclude_tags.contains(t));
        included && !excluded && check.triggered_by(event)
    });
    Ok(selected)
}

/// Latest live terminal record of each scope `check_id` ran in
fn latest_per_scope<'r>(run: &'r RunState, check_id: &str) -> BTreeMap<&'r Scope, &'r DispatchRecord> {
    let mut latest = BTreeMap::new();
    for record in run.records_for(check_id) {
        if record.is_live() && record.is_terminal() {
            latest.insert(&record.scope, record);
        }
    }
    latest
}

/// Scopes `check` should run in under `base`, or the reason it cannot run at all
pub fn candidate_scopes(
    check: &CheckSpec,
    base: &Scope,
    run: &RunState,
    config: &EngineConfig,
) -> Result<Vec<Scope>, SkipReason> {
    let dependencies = check.dependency_ids();
    if dependencies.is_empty() || check.fanout == FanoutMode::Reduce {
        return Ok(vec![base.clone()]);
    }

    let mut scopes = BTreeSet::new();
    let mut empty_fan_out = false;
    for dep in &dependencies {
        let dep_is_for_each = config.check(dep).is_some_and(|c| c.for_each);
        for (scope, record) in latest_per_scope(run, dep) {
            let produced: Vec<Scope> = match record.items {
                Some(items) if dep_is_for_each && record.status == DispatchStatus::Success => {
                    if items == 0 && (base.is_ancestor_of(scope) || scope.is_ancestor_of(base)) {
                        empty_fan_out = true;
                    }
                    (0..items).map(|i| scope.child(dep.clone(), i)).collect()
                }
                _ => vec![scope.clone()],
            };
            for scope in produced {
                if base.is_ancestor_of(&scope) {
                    scopes.insert(scope);
                } else if scope.is_strict_ancestor_of(base) {
                    scopes.insert(base.clone());
                }
            }
        }
    }

    // Keep only the deepest scopes of each branch
    let all: Vec<Scope> = scopes.iter().cloned().collect();
    scopes.retain(|scope| !all.iter().any(|other| scope.is_strict_ancestor_of(other)));

    if scopes.is_empty() {
        return Err(if empty_fan_out {
            SkipReason::ForEachEmpty
        } else {
            SkipReason::DependencyFailed
        });
    }
    Ok(scopes.into_iter().collect())
}

fn record_satisfies(record: &DispatchRecord, config: &EngineConfig) -> bool {
    match record.status {
        DispatchStatus::Success => true,
        DispatchStatus::Failed => config
            .check(&record.check_id)
            .is_some_and(|c| c.continue_on_failure),
        _ => false,
    }
}

/// Every OR-group has a member whose visible result lets `check` run at `scope`
pub fn dependencies_satisfied(
    check: &CheckSpec,
    scope: &Scope,
    base: &Scope,
    run: &RunState,
    config: &EngineConfig,
) -> bool {
    check.dependency_groups().iter().all(|group| {
        group.iter().any(|member| {
            if check.fanout == FanoutMode::Reduce {
                latest_per_scope(run, member)
                    .into_iter()
                    .any(|(s, record)| {
                        (base.is_ancestor_of(s) || s.is_ancestor_of(base))
                            && record_satisfies(record, config)
                    })
            } else {
                run.latest_visible(member, scope)
                    .is_some_and(|record| record_satisfies(record, config))
            }
        })
    })
}

/// Merge pending forward runs into the queue, in arrival order
///
/// Returns how many levels were queued. The plan grows by every requested
/// target so later goto subgraphs include it.
pub fn merge_forward_runs(
    run: &mut RunState,
    graph: &DependencyGraph,
    plan: &mut BTreeSet<String>,
) -> EngineResult<usize> {
    let requests = std::mem::take(&mut run.forward_requests);
    let mut seen = HashSet::new();
    let mut new_levels = Vec::new();

    for request in requests {
        plan.insert(request.target.clone());

        if run.pending_in_main_plan(&request.target) {
            debug!(
                "Forward run of {} from {} dropped: still pending in the main plan",
                request.target, request.origin
            );
            continue;
        }

        let waves = match request.kind {
            RouteKind::Run => vec![vec![request.target.clone()]],
            RouteKind::Goto => graph.subgraph_from(&request.target, plan)?,
        };
        let nodes: HashSet<&str> = waves.iter().flatten().map(String::as_str).collect();
        let base = request
            .scope
            .prefix_while(|segment| !nodes.contains(segment.check_id.as_str()));

        if !seen.insert((request.target.clone(), base.clone(), request.event.clone())) {
            debug!(
                "Duplicate forward run of {} at {} dropped",
                request.target, base
            );
            continue;
        }

        for wave in waves {
            let checks: Vec<String> = wave
                .into_iter()
                .filter(|id| !run.queued_in_main_plan(id, &base, &request.event))
                .collect();
            if checks.is_empty() {
                continue;
            }
            new_levels.push(PlannedLevel {
                checks,
                base_scope: base.clone(),
                event: request.event.clone(),
                origin: LevelOrigin::Forward {
                    origin: request.origin.clone(),
                    target: request.target.clone(),
                    scope: request.scope.clone(),
                },
            });
        }
    }

    let queued = new_levels.len();
    for level in new_levels.into_iter().rev() {
        run.queue.push_front(level);
    }
    Ok(queued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::ForwardRunRequest;

    fn config(specs: Vec<CheckSpec>) -> EngineConfig {
        specs
            .into_iter()
            .fold(EngineConfig::default(), |config, check| config.with_check(check))
    }

    fn record(check: &str, scope: Scope, status: DispatchStatus, items: Option<usize>) -> DispatchRecord {
        let mut record = DispatchRecord::new(check, scope, None);
        record.status = status;
        record.items = items;
        record
    }

    #[test]
    fn test_select_explicit_pulls_dependencies_then_filters() {
        let mut tagged = CheckSpec::new("slow").depends_on(["base"]);
        tagged.tags = vec!["slow".into()];
        let mut manual_only = CheckSpec::new("deploy");
        manual_only.on = vec!["manual".into()];
        let config = config(vec![CheckSpec::new("base"), tagged, manual_only]);
        let graph = DependencyGraph::build(&config.checks).unwrap();

        let explicit = Selection {
            checks: vec!["slow".into()],
            ..Default::default()
        };
        let selected = select_checks(&config, &graph, &explicit, "manual").unwrap();
        assert_eq!(selected.into_iter().collect::<Vec<_>>(), vec!["base", "slow"]);

        let excluded = Selection {
            exclude_tags: vec!["slow".into()],
            ..Default::default()
        };
        let selected = select_checks(&config, &graph, &excluded, "pr_opened").unwrap();
        assert_eq!(selected.into_iter().collect::<Vec<_>>(), vec!["base"]);

        let unknown = Selection {
            checks: vec!["nope".into()],
            ..Default::default()
        };
        let err = select_checks(&config, &graph, &unknown, "manual").unwrap_err();
        assert_eq!(err.code(), ErrorCode::CONFIG_UNKNOWN_CHECK);
    }

    #[test]
    fn test_candidate_scopes_fan_out_and_join() {
        let config = config(vec![
            CheckSpec::new("a").for_each(true),
            CheckSpec::new("b").depends_on(["a"]),
            CheckSpec::new("c").depends_on(["b"]),
        ]);
        let mut run = RunState::new(10);
        run.push_record(record("a", Scope::root(), DispatchStatus::Success, Some(3)));

        let b_scopes = candidate_scopes(&config.checks["b"], &Scope::root(), &run, &config).unwrap();
        assert_eq!(b_scopes.len(), 3);
        assert_eq!(b_scopes[2], Scope::root().child("a", 2));

        for (i, status) in [DispatchStatus::Success, DispatchStatus::Failed, DispatchStatus::Success]
            .into_iter()
            .enumerate()
        {
            run.push_record(record("b", Scope::root().child("a", i), status, None));
        }
        let c_scopes = candidate_scopes(&config.checks["c"], &Scope::root(), &run, &config).unwrap();
        assert_eq!(c_scopes.len(), 3);
        let satisfied: Vec<bool> = c_scopes
            .iter()
            .map(|s| dependencies_satisfied(&config.checks["c"], s, &Scope::root(), &run, &config))
            .collect();
        assert_eq!(satisfied, vec![true, false, true]);
    }

    #[test]
    fn test_empty_fan_out_and_reduce() {
        let mut reduce = CheckSpec::new("summary").depends_on(["a"]);
        reduce.fanout = FanoutMode::Reduce;
        let config = config(vec![
            CheckSpec::new("a").for_each(true),
            CheckSpec::new("b").depends_on(["a"]),
            reduce,
        ]);
        let mut run = RunState::new(10);
        run.push_record(record("a", Scope::root(), DispatchStatus::Success, Some(0)));

        assert_eq!(
            candidate_scopes(&config.checks["b"], &Scope::root(), &run, &config),
            Err(SkipReason::ForEachEmpty)
        );
        let scopes = candidate_scopes(&config.checks["summary"], &Scope::root(), &run, &config).unwrap();
        assert_eq!(scopes, vec![Scope::root()]);
        assert!(dependencies_satisfied(
            &config.checks["summary"],
            &Scope::root(),
            &Scope::root(),
            &run,
            &config
        ));
    }

    #[test]
    fn test_or_group_and_continue_on_failure() {
        let mut tolerant = CheckSpec::new("flaky");
        tolerant.continue_on_failure = true;
        let config = config(vec![
            CheckSpec::new("x"),
            tolerant,
            CheckSpec::new("either").depends_on(["x|flaky"]),
            CheckSpec::new("strict").depends_on(["x"]),
        ]);
        let mut run = RunState::new(10);
        run.push_record(record("x", Scope::root(), DispatchStatus::Skipped, None));
        run.push_record(record("flaky", Scope::root(), DispatchStatus::Failed, None));

        let root = Scope::root();
        assert!(dependencies_satisfied(&config.checks["either"], &root, &root, &run, &config));
        assert!(!dependencies_satisfied(&config.checks["strict"], &root, &root, &run, &config));
    }

    #[test]
    fn test_merge_goto_from_item_scope() {
        let config = config(vec![
            CheckSpec::new("list").for_each(true),
            CheckSpec::new("fix").depends_on(["list"]),
            CheckSpec::new("verify").depends_on(["fix"]),
        ]);
        let graph = DependencyGraph::build(&config.checks).unwrap();
        let mut plan: BTreeSet<String> = config.checks.keys().cloned().collect();
        let mut run = RunState::new(10);
        let item = Scope::root().child("list", 1);
        for _ in 0..2 {
            run.forward_requests.push(ForwardRunRequest {
                target: "fix".into(),
                kind: RouteKind::Goto,
                scope: item.clone(),
                event: Some("manual".into()),
                origin: "verify".into(),
            });
        }

        let queued = merge_forward_runs(&mut run, &graph, &mut plan).unwrap();
        assert_eq!(queued, 2);
        assert_eq!(run.queue[0].checks, vec!["fix"]);
        assert_eq!(run.queue[1].checks, vec!["verify"]);
        assert_eq!(run.queue[0].base_scope, item);
        assert!(run.forward_requests.is_empty());
    }

    #[test]
    fn test_merge_goto_from_item_leaves_queued_dependents_to_main_plan() {
        let config = config(vec![
            CheckSpec::new("list").for_each(true),
            CheckSpec::new("fix").depends_on(["list"]),
            CheckSpec::new("verify").depends_on(["fix"]),
        ]);
        let graph = DependencyGraph::build(&config.checks).unwrap();
        let mut plan: BTreeSet<String> = config.checks.keys().cloned().collect();
        let mut run = RunState::new(10);
        let event = Some("manual".to_string());
        run.queue.push_back(PlannedLevel::main(vec!["verify".into()], event.clone()));
        let item = Scope::root().child("list", 1);
        run.forward_requests.push(ForwardRunRequest {
            target: "fix".into(),
            kind: RouteKind::Goto,
            scope: item.clone(),
            event,
            origin: "fix".into(),
        });

        assert_eq!(merge_forward_runs(&mut run, &graph, &mut plan).unwrap(), 1);
        assert_eq!(run.queue.len(), 2);
        assert_eq!(run.queue[0].checks, vec!["fix"]);
        assert_eq!(run.queue[0].base_scope, item);
        assert!(run.queue[1].is_main());
        assert_eq!(run.queue[1].checks, vec!["verify"]);
    }

    #[test]
    fn test_merge_skips_target_pending_in_main_plan() {
        let config = config(vec![CheckSpec::new("a"), CheckSpec::new("b").depends_on(["a"])]);
        let graph = DependencyGraph::build(&config.checks).unwrap();
        let mut plan: BTreeSet<String> = BTreeSet::new();
        let mut run = RunState::new(10);
        run.queue.push_back(PlannedLevel::main(vec!["b".into()], Some("manual".into())));
        run.forward_requests.push(ForwardRunRequest {
            target: "b".into(),
            kind: RouteKind::Run,
            scope: Scope::root(),
            event: Some("manual".into()),
            origin: "a".into(),
        });

        assert_eq!(merge_forward_runs(&mut run, &graph, &mut plan).unwrap(), 0);
        assert_eq!(run.queue.len(), 1);
        assert!(plan.contains("b"));
    }
}
