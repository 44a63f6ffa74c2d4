//! Level dispatch: session lanes, gates, provider calls and retries
//!
//! The driver holds only shared handles. Every result travels back to the
//! runner as a [`LaneMessage`]; contracts, routing and journal commits happen
//! there, in the order messages arrive.

use super::context::{BindingsBuilder, DispatchFacts, EventContext};
use super::state::SkipReason;
use crate::config::{CheckSpec, EngineConfig, SessionReuse};
use crate::expression::{EvalScope, ExpressionEngine};
use crate::journal::{ExecutionJournal, Scope};
use crate::memory::MemoryStore;
use crate::provider::{ProviderContext, ProviderRegistry, ProviderRequest};
use crate::types::CheckResult;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Handles shared by every lane of one level
#[derive(Debug)]
pub(crate) struct DispatchShared {
    pub config: Arc<EngineConfig>,
    pub registry: Arc<ProviderRegistry>,
    pub expressions: Arc<ExpressionEngine>,
    pub memory: Arc<MemoryStore>,
    pub journal: Arc<ExecutionJournal>,
    pub event: Arc<EventContext>,
    /// Set by the runner once a blocking failure is seen
    pub fail_fast: Arc<AtomicBool>,
    pub loop_count: u32,
}

/// One check at one scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DispatchUnit {
    pub check_id: String,
    pub scope: Scope,
    pub event: Option<String>,
}

#[derive(Debug)]
pub(crate) enum LaneMessage {
    Started {
        check_id: String,
        scope: Scope,
        event: Option<String>,
        attempt: u32,
        started_at: DateTime<Utc>,
    },
    /// The attempt failed and will be retried after `backoff`
    Retrying {
        check_id: String,
        scope: Scope,
        attempt: u32,
        error: String,
        backoff: Duration,
    },
    Finished {
        unit: DispatchUnit,
        attempt: u32,
        result: CheckResult,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    },
    Skipped {
        unit: DispatchUnit,
        reason: SkipReason,
    },
}

/// Check whose session `check` runs in, following `reuse_session` links
pub(crate) fn session_owner(config: &EngineConfig, check: &CheckSpec) -> String {
    let mut current = check;
    let mut visited = HashSet::new();
    while visited.insert(current.id.clone()) {
        let next = match &current.reuse_session {
            Some(SessionReuse::Flag(true)) => current.dependency_groups().first().and_then(|g| g.first().cloned()),
            Some(SessionReuse::Check(owner)) => Some(owner.clone()),
            _ => None,
        };
        match next.as_deref().and_then(|id| config.check(id)) {
            Some(owner) => current = owner,
            None => break,
        }
    }
    current.id.clone()
}

/// Group units into lanes; units sharing a session run one after another
pub(crate) fn group_into_lanes(config: &EngineConfig, units: Vec<DispatchUnit>) -> Vec<Vec<DispatchUnit>> {
    let mut lanes: Vec<Vec<DispatchUnit>> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for unit in units {
        let owner = config
            .check(&unit.check_id)
            .map(|check| session_owner(config, check))
            .unwrap_or_else(|| unit.check_id.clone());
        let key = format!("{}@{}", owner, unit.scope);
        match index.get(&key) {
            Some(&i) => lanes[i].push(unit),
            None => {
                index.insert(key, lanes.len());
                lanes.push(vec![unit]);
            }
        }
    }
    lanes
}

/// Evaluate `if` and `assume` against pre-execution bindings
pub(crate) fn gate_skip_reason(
    expressions: &ExpressionEngine,
    check: &CheckSpec,
    scope: &EvalScope,
) -> Option<SkipReason> {
    if let Some(condition) = check.if_condition.as_deref() {
        match expressions.evaluate_bool(condition, scope) {
            Ok(true) => {}
            Ok(false) => return Some(SkipReason::IfCondition),
            Err(e) if e.is_syntax() => {
                warn!("if of '{}' does not parse, running anyway: {}", check.id, e);
            }
            Err(e) => {
                warn!("if of '{}' failed to evaluate: {}", check.id, e);
                return Some(SkipReason::IfCondition);
            }
        }
    }

    for condition in &check.assume {
        match expressions.evaluate_bool(condition, scope) {
            Ok(true) => {}
            Ok(false) => return Some(SkipReason::Assume),
            Err(e) => {
                warn!("assume of '{}' failed to evaluate: {}", check.id, e);
                return Some(SkipReason::Assume);
            }
        }
    }
    None
}

fn send(tx: &mpsc::UnboundedSender<LaneMessage>, message: LaneMessage) {
    if tx.send(message).is_err() {
        debug!("Dispatch receiver closed; dropping lane message");
    }
}

/// Run every lane, at most `max_parallelism` at a time
pub(crate) async fn drive(
    shared: Arc<DispatchShared>,
    lanes: Vec<Vec<DispatchUnit>>,
    max_parallelism: usize,
    tx: mpsc::UnboundedSender<LaneMessage>,
) {
    stream::iter(lanes)
        .for_each_concurrent(max_parallelism.max(1), |lane| {
            let shared = Arc::clone(&shared);
            let tx = tx.clone();
            async move {
                for unit in lane {
                    run_unit(&shared, unit, &tx).await;
                }
            }
        })
        .await;
    drop(tx);
}

async fn run_unit(shared: &DispatchShared, unit: DispatchUnit, tx: &mpsc::UnboundedSender<LaneMessage>) {
    if shared.fail_fast.load(Ordering::SeqCst) {
        send(
            tx,
            LaneMessage::Skipped {
                unit,
                reason: SkipReason::FailFast,
            },
        );
        return;
    }

    let Some(check) = shared.config.check(&unit.check_id) else {
        let now = Utc::now();
        let error = format!("check '{}' is not configured", unit.check_id);
        send(
            tx,
            LaneMessage::Finished {
                unit,
                attempt: 1,
                result: CheckResult::from_error(error),
                started_at: now,
                finished_at: now,
            },
        );
        return;
    };

    let view = shared.journal.view(unit.scope.clone(), None);
    let facts = DispatchFacts {
        scope: &unit.scope,
        event: unit.event.as_deref(),
        attempt: 1,
        loop_count: shared.loop_count,
    };
    let bindings = BindingsBuilder::new(&shared.config, &shared.event).build(check, &view, facts, None);
    let dependency_results: BTreeMap<String, CheckResult> = check
        .dependency_ids()
        .into_iter()
        .filter_map(|dep| view.get(&dep).map(|entry| (dep, entry.result)))
        .collect();

    let mut request = ProviderRequest {
        check: check.clone(),
        dependency_results,
        context: ProviderContext {
            session_id: shared.journal.session_id().to_string(),
            scope: unit.scope.clone(),
            event: unit.event.clone(),
            attempt: 1,
            memory: Arc::clone(&shared.memory),
            bindings,
        },
    };

    if let Some(reason) = gate_skip_reason(&shared.expressions, check, &request.context.eval_scope()) {
        debug!("Skipping {} at {}: {}", check.id, unit.scope, reason);
        send(tx, LaneMessage::Skipped { unit, reason });
        return;
    }

    let Some(provider) = shared.registry.get(&check.provider) else {
        let now = Utc::now();
        let error = format!("no provider registered for type '{}'", check.provider);
        send(
            tx,
            LaneMessage::Finished {
                unit,
                attempt: 1,
                result: CheckResult::from_error(error),
                started_at: now,
                finished_at: now,
            },
        );
        return;
    };

    let max_attempts = check.retry.as_ref().map_or(1, |policy| policy.max.saturating_add(1));
    let mut attempt = 1;
    loop {
        request.context.attempt = attempt;
        request.context.bindings.insert("attempt".into(), json!(attempt));
        let started_at = Utc::now();
        send(
            tx,
            LaneMessage::Started {
                check_id: check.id.clone(),
                scope: unit.scope.clone(),
                event: unit.event.clone(),
                attempt,
                started_at,
            },
        );

        debug!("Executing {} at {} (attempt {})", check.id, unit.scope, attempt);
        let result = match provider.execute(&request).await {
            Ok(result) => result,
            Err(e) => CheckResult::from_error(format!("{:#}", e)),
        };

        if let (Some(error), Some(policy)) = (result.error.as_ref(), check.retry.as_ref()) {
            if attempt < max_attempts {
                let backoff = policy.delay_for_attempt(attempt);
                send(
                    tx,
                    LaneMessage::Retrying {
                        check_id: check.id.clone(),
                        scope: unit.scope.clone(),
                        attempt,
                        error: error.clone(),
                        backoff,
                    },
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
                continue;
            }
        }

        send(
            tx,
            LaneMessage::Finished {
                unit,
                attempt,
                result,
                started_at,
                finished_at: Utc::now(),
            },
        );
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn unit(check: &str, scope: Scope) -> DispatchUnit {
        DispatchUnit {
            check_id: check.into(),
            scope,
            event: None,
        }
    }

    #[test]
    fn test_session_owner_follows_links() {
        let mut reuse_first = CheckSpec::new("review").depends_on(["open"]);
        reuse_first.reuse_session = Some(SessionReuse::Flag(true));
        let mut reuse_named = CheckSpec::new("followup").depends_on(["review"]);
        reuse_named.reuse_session = Some(SessionReuse::Check("review".into()));
        let config = EngineConfig::default()
            .with_check(CheckSpec::new("open"))
            .with_check(reuse_first)
            .with_check(reuse_named);

        assert_eq!(session_owner(&config, &config.checks["followup"]), "open");
        assert_eq!(session_owner(&config, &config.checks["open"]), "open");
    }

    #[test]
    fn test_lanes_serialize_shared_sessions_only() {
        let mut a = CheckSpec::new("a").depends_on(["s"]);
        a.reuse_session = Some(SessionReuse::Check("s".into()));
        let mut b = CheckSpec::new("b").depends_on(["s"]);
        b.reuse_session = Some(SessionReuse::Check("s".into()));
        let config = EngineConfig::default()
            .with_check(CheckSpec::new("s"))
            .with_check(a)
            .with_check(b)
            .with_check(CheckSpec::new("c"));

        let lanes = group_into_lanes(
            &config,
            vec![
                unit("a", Scope::root()),
                unit("c", Scope::root()),
                unit("b", Scope::root()),
                unit("a", Scope::root().child("s", 0)),
            ],
        );
        let ids: Vec<Vec<&str>> = lanes
            .iter()
            .map(|lane| lane.iter().map(|u| u.check_id.as_str()).collect())
            .collect();
        assert_eq!(ids, vec![vec!["a", "b"], vec!["c"], vec!["a"]]);
    }

    #[test]
    fn test_gates() {
        let engine = ExpressionEngine::new();
        let scope = EvalScope::new().with("branch", json!("main"));

        let syntax_error = CheckSpec::new("x").with_if("branch ===");
        assert_eq!(gate_skip_reason(&engine, &syntax_error, &scope), None);

        let runtime_error = CheckSpec::new("x").with_if("missing.field");
        assert_eq!(
            gate_skip_reason(&engine, &runtime_error, &scope),
            Some(SkipReason::IfCondition)
        );

        let mut assume = CheckSpec::new("x").with_if("branch == 'main'");
        assume.assume = vec!["true".into(), "branch.startsWith('rel')".into()];
        assert_eq!(gate_skip_reason(&engine, &assume, &scope), Some(SkipReason::Assume));

        let mut assume_error = CheckSpec::new("x");
        assume_error.assume = vec!["(".into()];
        assert_eq!(
            gate_skip_reason(&engine, &assume_error, &scope),
            Some(SkipReason::Assume)
        );
    }
}
