//! Post-execution contracts and declarative routing
//!
//! Given a finished result the evaluator decides whether the check failed
//! (provider error, `fail_if`, `guarantee`), then resolves `on_success`,
//! `on_fail` and `on_finish` into forward-run targets. The loop budget is a
//! separate counter owned by the runner and consulted per scheduling attempt.

use crate::config::{CheckSpec, RoutingAction};
use crate::expression::{EvalScope, ExpressionEngine};
use crate::types::{CheckResult, Issue, Severity};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::{debug, warn};

pub const GLOBAL_FAIL_IF_RULE: &str = "global_fail_if";
pub const GUARANTEE_FAILED_RULE: &str = "contract/guarantee_failed";
pub const LOOP_BUDGET_RULE: &str = "routing/loop_budget_exceeded";
pub const UNKNOWN_TARGET_RULE: &str = "routing/unknown_target";

/// `run` schedules the target alone; `goto` re-runs it with its dependents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteKind {
    Run,
    Goto,
}

impl fmt::Display for RouteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteKind::Run => f.write_str("run"),
            RouteKind::Goto => f.write_str("goto"),
        }
    }
}

/// A resolved routing target, before the loop budget is applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub target: String,
    pub kind: RouteKind,
    /// Event override for goto targets
    pub goto_event: Option<String>,
    /// `on_success`, `on_fail` or `on_finish`
    pub rule: &'static str,
}

/// Counter shared by every routing decision of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoopBudget {
    max_loops: u32,
    count: u32,
}

impl LoopBudget {
    pub fn new(max_loops: u32) -> Self {
        Self {
            max_loops,
            count: 0,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn max_loops(&self) -> u32 {
        self.max_loops
    }

    /// Consume one scheduling, or return the issue recorded when exhausted
    pub fn try_schedule(&mut self, origin: &str, route: &RouteTarget) -> Result<u32, Issue> {
        if self.count >= self.max_loops {
            warn!(
                "Routing loop budget of {} exhausted: {} {} -> {} not scheduled",
                self.max_loops, origin, route.kind, route.target
            );
            return Err(Issue::system(
                LOOP_BUDGET_RULE,
                format!(
                    "routing budget of {} exceeded: {} from '{}' to '{}' was not scheduled",
                    self.max_loops, route.kind, origin, route.target
                ),
                Severity::Error,
            ));
        }
        self.count += 1;
        Ok(self.count)
    }
}

pub struct RoutingEvaluator<'a> {
    expressions: &'a ExpressionEngine,
    global_fail_if: Option<&'a str>,
}

impl<'a> RoutingEvaluator<'a> {
    pub fn new(expressions: &'a ExpressionEngine, global_fail_if: Option<&'a str>) -> Self {
        Self {
            expressions,
            global_fail_if,
        }
    }

    /// Apply failure contracts to `result`, appending issues; returns whether the check failed
    pub fn apply_contracts(&self, check: &CheckSpec, result: &mut CheckResult, scope: &EvalScope) -> bool {
        if let Some(error) = result.error.clone() {
            result.issues.push(Issue::system(
                format!("{}/execution_error", check.id),
                error,
                Severity::Error,
            ));
            return true;
        }

        let mut failed = false;
        if let Some(expr) = self.global_fail_if {
            if self.predicate(check, "fail_if", expr, scope, result) == Some(true) {
                result.issues.push(Issue::system(
                    GLOBAL_FAIL_IF_RULE,
                    format!("global fail_if matched: {}", expr),
                    Severity::Error,
                ));
                failed = true;
            }
        }

        // Check-level fail_if runs whether or not the global one matched
        if let Some(expr) = check.fail_if.as_deref() {
            if self.predicate(check, "fail_if", expr, scope, result) == Some(true) {
                result.issues.push(Issue::system(
                    format!("{}_fail_if", check.id),
                    format!("fail_if matched: {}", expr),
                    Severity::Error,
                ));
                failed = true;
            }
        }

        for expr in &check.guarantee {
            if self.predicate(check, "guarantee", expr, scope, result) == Some(false) {
                result.issues.push(Issue::system(
                    GUARANTEE_FAILED_RULE,
                    format!("guarantee of '{}' did not hold: {}", check.id, expr),
                    Severity::Error,
                ));
                failed = true;
            }
        }

        failed
    }

    /// Evaluate a contract predicate; errors become a warning issue and `None`
    fn predicate(
        &self,
        check: &CheckSpec,
        construct: &str,
        expr: &str,
        scope: &EvalScope,
        result: &mut CheckResult,
    ) -> Option<bool> {
        match self.expressions.evaluate_bool(expr, scope) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("{} of '{}' could not be evaluated: {}", construct, check.id, e);
                result.issues.push(Issue::system(
                    format!("{}/expression_error", check.id),
                    format!("{} expression failed: {}", construct, e),
                    Severity::Warning,
                ));
                None
            }
        }
    }

    /// Routing rules to follow after a dispatch; `on_finish` only when `include_finish`
    pub fn route(
        &self,
        check: &CheckSpec,
        failed: bool,
        include_finish: bool,
        scope: &EvalScope,
        is_known: &dyn Fn(&str) -> bool,
        issues: &mut Vec<Issue>,
    ) -> Vec<RouteTarget> {
        let mut targets = Vec::new();
        let primary = if failed {
            check.on_fail.as_ref().map(|a| ("on_fail", a))
        } else {
            check.on_success.as_ref().map(|a| ("on_success", a))
        };
        if let Some((rule, action)) = primary {
            targets.extend(self.resolve(check, rule, action, scope, is_known, issues));
        }
        if include_finish {
            targets.extend(self.finish_targets(check, scope, is_known, issues));
        }
        targets
    }

    pub fn finish_targets(
        &self,
        check: &CheckSpec,
        scope: &EvalScope,
        is_known: &dyn Fn(&str) -> bool,
        issues: &mut Vec<Issue>,
    ) -> Vec<RouteTarget> {
        match check.on_finish.as_ref() {
            Some(action) => self.resolve(check, "on_finish", action, scope, is_known, issues),
            None => Vec::new(),
        }
    }

    /// Resolve one action: `run`, `run_js`, then transitions or `goto_js`/`goto`
    pub fn resolve(
        &self,
        check: &CheckSpec,
        rule: &'static str,
        action: &RoutingAction,
        scope: &EvalScope,
        is_known: &dyn Fn(&str) -> bool,
        issues: &mut Vec<Issue>,
    ) -> Vec<RouteTarget> {
        let mut targets = Vec::new();
        let mut push = |target: String, kind: RouteKind, goto_event: Option<String>, issues: &mut Vec<Issue>| {
            if !is_known(&target) {
                warn!("{} of '{}' names unknown check '{}'", rule, check.id, target);
                issues.push(Issue::system(
                    UNKNOWN_TARGET_RULE,
                    format!("{} of '{}' routes to unknown check '{}'", rule, check.id, target),
                    Severity::Warning,
                ));
                return;
            }
            targets.push(RouteTarget {
                target,
                kind,
                goto_event,
                rule,
            });
        };

        for target in &action.run {
            push(target.clone(), RouteKind::Run, None, issues);
        }

        if let Some(expr) = action.run_js.as_deref() {
            for target in self.dynamic_targets(check, rule, "run_js", expr, scope) {
                push(target, RouteKind::Run, None, issues);
            }
        }

        if let Some((target, goto_event)) = self.goto_target(check, rule, action, scope) {
            push(target, RouteKind::Goto, goto_event, issues);
        }

        targets
    }

    fn goto_target(
        &self,
        check: &CheckSpec,
        rule: &str,
        action: &RoutingAction,
        scope: &EvalScope,
    ) -> Option<(String, Option<String>)> {
        for transition in &action.transitions {
            match self.expressions.evaluate_bool(&transition.when, scope) {
                Ok(true) => {
                    debug!("{} transition of '{}' matched: {}", rule, check.id, transition.when);
                    let event = transition
                        .goto_event
                        .clone()
                        .or_else(|| action.goto_event.clone());
                    return transition.to.clone().map(|to| (to, event));
                }
                Ok(false) => {}
                Err(e) => warn!(
                    "{} transition of '{}' could not be evaluated: {}",
                    rule, check.id, e
                ),
            }
        }

        if let Some(expr) = action.goto_js.as_deref() {
            match self.expressions.evaluate(expr, scope) {
                Ok(Value::String(target)) if !target.is_empty() => {
                    return Some((target, action.goto_event.clone()))
                }
                Ok(Value::Null) => {}
                Ok(other) => {
                    warn!("goto_js of '{}' returned a non-string value: {}", check.id, other);
                    return None;
                }
                Err(e) => {
                    warn!("goto_js of '{}' could not be evaluated: {}", check.id, e);
                    return None;
                }
            }
        }

        action
            .goto
            .clone()
            .map(|target| (target, action.goto_event.clone()))
    }

    fn dynamic_targets(
        &self,
        check: &CheckSpec,
        rule: &str,
        construct: &str,
        expr: &str,
        scope: &EvalScope,
    ) -> Vec<String> {
        match self.expressions.evaluate(expr, scope) {
            Ok(Value::Array(items)) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s),
                    other => {
                        warn!("{} of '{}' produced a non-string target: {}", construct, check.id, other);
                        None
                    }
                })
                .collect(),
            Ok(Value::String(s)) => vec![s],
            Ok(Value::Null) => Vec::new(),
            Ok(other) => {
                warn!("{} {} of '{}' returned {}", rule, construct, check.id, other);
                Vec::new()
            }
            Err(e) => {
                warn!("{} {} of '{}' could not be evaluated: {}", rule, construct, check.id, e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Transition;
    use serde_json::json;

    fn known(id: &str) -> bool {
        ["a", "b", "c", "fix"].contains(&id)
    }

    fn scope(output: Value) -> EvalScope {
        EvalScope::new().with("output", output)
    }

    #[test]
    fn test_global_and_check_fail_if_both_apply() {
        let engine = ExpressionEngine::new();
        let evaluator = RoutingEvaluator::new(&engine, Some("output.errors > 0"));
        let check = CheckSpec::new("lint").with_fail_if("output.errors > 2");
        let mut result = CheckResult::with_output(json!({"errors": 3}));

        assert!(evaluator.apply_contracts(&check, &mut result, &scope(json!({"errors": 3}))));
        let rules: Vec<&str> = result.issues.iter().map(|i| i.rule_id.as_str()).collect();
        assert_eq!(rules, vec!["global_fail_if", "lint_fail_if"]);
    }

    #[test]
    fn test_check_fail_if_without_global_match() {
        let engine = ExpressionEngine::new();
        let evaluator = RoutingEvaluator::new(&engine, Some("false"));
        let check = CheckSpec::new("x").with_fail_if("true");
        let mut result = CheckResult::default();
        assert!(evaluator.apply_contracts(&check, &mut result, &EvalScope::new()));
        assert_eq!(result.issues.len(), 1);
        assert_eq!(result.issues[0].rule_id, "x_fail_if");
    }

    #[test]
    fn test_guarantee_failure() {
        let engine = ExpressionEngine::new();
        let evaluator = RoutingEvaluator::new(&engine, None);
        let mut check = CheckSpec::new("x");
        check.guarantee = vec!["output.ok == true".into()];
        let mut result = CheckResult::with_output(json!({"ok": false}));
        assert!(evaluator.apply_contracts(&check, &mut result, &scope(json!({"ok": false}))));
        assert_eq!(result.issues[0].rule_id, GUARANTEE_FAILED_RULE);
        assert_eq!(result.issues[0].severity, Severity::Error);
    }

    #[test]
    fn test_expression_error_is_not_triggered() {
        let engine = ExpressionEngine::new();
        let evaluator = RoutingEvaluator::new(&engine, None);
        let check = CheckSpec::new("x").with_fail_if("output.missing.deep");
        let mut result = CheckResult::default();
        assert!(!evaluator.apply_contracts(&check, &mut result, &scope(json!({}))));
        assert_eq!(result.issues[0].rule_id, "x/expression_error");
        assert_eq!(result.issues[0].severity, Severity::Warning);
    }

    #[test]
    fn test_provider_error_fails() {
        let engine = ExpressionEngine::new();
        let evaluator = RoutingEvaluator::new(&engine, None);
        let mut result = CheckResult::from_error("boom");
        assert!(evaluator.apply_contracts(&CheckSpec::new("x"), &mut result, &EvalScope::new()));
        assert_eq!(result.issues[0].rule_id, "x/execution_error");
    }

    #[test]
    fn test_route_on_fail_and_finish() {
        let engine = ExpressionEngine::new();
        let evaluator = RoutingEvaluator::new(&engine, None);
        let mut check = CheckSpec::new("a");
        check.on_fail = Some(RoutingAction {
            goto: Some("fix".into()),
            goto_event: Some("retry".into()),
            ..Default::default()
        });
        check.on_success = Some(RoutingAction {
            run: vec!["b".into()],
            ..Default::default()
        });
        check.on_finish = Some(RoutingAction {
            run_js: Some("['c', 'ghost']".into()),
            ..Default::default()
        });

        let mut issues = Vec::new();
        let targets = evaluator.route(&check, true, true, &EvalScope::new(), &known, &mut issues);
        assert_eq!(
            targets,
            vec![
                RouteTarget {
                    target: "fix".into(),
                    kind: RouteKind::Goto,
                    goto_event: Some("retry".into()),
                    rule: "on_fail"
                },
                RouteTarget {
                    target: "c".into(),
                    kind: RouteKind::Run,
                    goto_event: None,
                    rule: "on_finish"
                },
            ]
        );
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].rule_id, UNKNOWN_TARGET_RULE);
    }

    #[test]
    fn test_transitions_take_precedence_over_goto() {
        let engine = ExpressionEngine::new();
        let evaluator = RoutingEvaluator::new(&engine, None);
        let action = RoutingAction {
            goto: Some("a".into()),
            transitions: vec![
                Transition {
                    when: "output.n > 5".into(),
                    to: Some("b".into()),
                    goto_event: None,
                },
                Transition {
                    when: "output.n > 1".into(),
                    to: Some("c".into()),
                    goto_event: None,
                },
            ],
            ..Default::default()
        };
        let check = CheckSpec::new("x");
        let mut issues = Vec::new();

        let targets = evaluator.resolve(&check, "on_success", &action, &scope(json!({"n": 3})), &known, &mut issues);
        assert_eq!(targets[0].target, "c");

        let targets = evaluator.resolve(&check, "on_success", &action, &scope(json!({"n": 0})), &known, &mut issues);
        assert_eq!(targets[0].target, "a");
    }

    #[test]
    fn test_goto_js_error_gives_no_target() {
        let engine = ExpressionEngine::new();
        let evaluator = RoutingEvaluator::new(&engine, None);
        let action = RoutingAction {
            goto_js: Some("output.nope.deeper".into()),
            goto: Some("a".into()),
            ..Default::default()
        };
        let mut issues = Vec::new();
        let targets = evaluator.resolve(
            &CheckSpec::new("x"),
            "on_fail",
            &action,
            &scope(json!({})),
            &known,
            &mut issues,
        );
        assert!(targets.is_empty());
        assert!(issues.is_empty());
    }

    #[test]
    fn test_loop_budget() {
        let mut budget = LoopBudget::new(2);
        let route = RouteTarget {
            target: "a".into(),
            kind: RouteKind::Goto,
            goto_event: None,
            rule: "on_fail",
        };
        assert_eq!(budget.try_schedule("a", &route), Ok(1));
        assert_eq!(budget.try_schedule("a", &route), Ok(2));
        let issue = budget.try_schedule("a", &route).unwrap_err();
        assert_eq!(issue.rule_id, LOOP_BUDGET_RULE);
        assert!(issue.message.contains("goto"));
        assert_eq!(budget.count(), 2);
    }
}
