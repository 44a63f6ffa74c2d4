//! Static configuration of a single check

use super::retry::RetryPolicy;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// How a check relates to fan-out performed by its dependencies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanoutMode {
    /// Run once per item of an upstream forEach
    #[default]
    Map,
    /// Run once at the fan-out's parent scope, seeing the aggregate
    Reduce,
}

/// Session reuse: `true` reuses the first dependency's session, a string
/// names the check whose session is reused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SessionReuse {
    Flag(bool),
    Check(String),
}

/// One declarative transition: the first whose `when` holds becomes the goto target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub when: String,
    /// `None` means "stop here" and suppresses the fallback goto
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub goto_event: Option<String>,
}

/// Routing rule for `on_success`, `on_fail` and `on_finish`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingAction {
    /// Targets scheduled once each
    #[serde(default, deserialize_with = "one_or_many")]
    pub run: Vec<String>,

    /// Expression returning an array of target ids
    #[serde(default)]
    pub run_js: Option<String>,

    /// Single target re-run together with its dependents
    #[serde(default)]
    pub goto: Option<String>,

    #[serde(default)]
    pub goto_js: Option<String>,

    /// Event name the goto target runs under instead of the triggering one
    #[serde(default)]
    pub goto_event: Option<String>,

    #[serde(default)]
    pub transitions: Vec<Transition>,
}

impl RoutingAction {
    pub fn is_empty(&self) -> bool {
        self.run.is_empty()
            && self.run_js.is_none()
            && self.goto.is_none()
            && self.goto_js.is_none()
            && self.transitions.is_empty()
    }

    /// Targets that can be validated before the run starts
    pub fn static_targets(&self) -> impl Iterator<Item = &str> {
        self.run
            .iter()
            .map(String::as_str)
            .chain(self.goto.as_deref())
            .chain(self.transitions.iter().filter_map(|t| t.to.as_deref()))
    }
}

/// Static configuration for one node of the check graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckSpec {
    /// Filled from the map key when loaded from a config file
    #[serde(default)]
    pub id: String,

    /// Provider type key in the registry
    #[serde(rename = "type", default = "default_provider")]
    pub provider: String,

    /// Dependency tokens; `"a|b"` is satisfied by either `a` or `b`
    #[serde(default, alias = "dependsOn", deserialize_with = "one_or_many")]
    pub depends_on: Vec<String>,

    #[serde(default, alias = "forEach")]
    pub for_each: bool,

    #[serde(default)]
    pub fanout: FanoutMode,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub group: Option<String>,

    /// Event names that trigger this check; empty means every event
    #[serde(default, deserialize_with = "one_or_many")]
    pub on: Vec<String>,

    #[serde(rename = "if", default)]
    pub if_condition: Option<String>,

    #[serde(default, deserialize_with = "one_or_many")]
    pub assume: Vec<String>,

    #[serde(default, deserialize_with = "one_or_many")]
    pub guarantee: Vec<String>,

    #[serde(default, alias = "failIf")]
    pub fail_if: Option<String>,

    #[serde(default)]
    pub on_success: Option<RoutingAction>,

    #[serde(default)]
    pub on_fail: Option<RoutingAction>,

    #[serde(default)]
    pub on_finish: Option<RoutingAction>,

    #[serde(default, alias = "continueOnFailure")]
    pub continue_on_failure: bool,

    #[serde(default)]
    pub retry: Option<RetryPolicy>,

    #[serde(default)]
    pub reuse_session: Option<SessionReuse>,

    /// Provider-specific options (`exec`, `message`, `operation`, ...)
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

impl CheckSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: default_provider(),
            ..Default::default()
        }
    }

    /// Dependency OR-groups; every group must be satisfied by one member
    pub fn dependency_groups(&self) -> Vec<Vec<String>> {
        self.depends_on
            .iter()
            .map(|token| {
                token
                    .split('|')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|group| !group.is_empty())
            .collect()
    }

    /// All dependency ids regardless of grouping
    pub fn dependency_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.dependency_groups().into_iter().flatten().collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn routing_actions(&self) -> impl Iterator<Item = (&'static str, &RoutingAction)> {
        [
            ("on_success", self.on_success.as_ref()),
            ("on_fail", self.on_fail.as_ref()),
            ("on_finish", self.on_finish.as_ref()),
        ]
        .into_iter()
        .filter_map(|(name, action)| action.map(|a| (name, a)))
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }

    pub fn triggered_by(&self, event: &str) -> bool {
        self.on.is_empty() || self.on.iter().any(|e| e == event)
    }

    // Builder helpers, mostly used by tests and embedders

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn for_each(mut self, for_each: bool) -> Self {
        self.for_each = for_each;
        self
    }

    pub fn with_if(mut self, condition: impl Into<String>) -> Self {
        self.if_condition = Some(condition.into());
        self
    }

    pub fn with_fail_if(mut self, condition: impl Into<String>) -> Self {
        self.fail_if = Some(condition.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }
}

fn default_provider() -> String {
    "noop".to_string()
}

/// Accept either a single string or a list of strings
pub(crate) fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
        Null(()),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
        OneOrMany::Null(()) => Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_groups_split_on_pipe() {
        let check = CheckSpec::new("c").depends_on(["a|b", "d"]);
        assert_eq!(
            check.dependency_groups(),
            vec![vec!["a".to_string(), "b".to_string()], vec!["d".to_string()]]
        );
        assert_eq!(check.dependency_ids(), vec!["a", "b", "d"]);
    }

    #[test]
    fn test_yaml_accepts_single_string_lists_and_options() {
        let yaml = r#"
type: command
depends_on: fetch
assume: "outputs.fetch != null"
exec: "echo hi"
timeout: 5s
on_fail:
  goto: fetch
"#;
        let check: CheckSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(check.provider, "command");
        assert_eq!(check.depends_on, vec!["fetch"]);
        assert_eq!(check.assume, vec!["outputs.fetch != null"]);
        assert_eq!(check.option_str("exec"), Some("echo hi"));
        assert_eq!(check.option_str("timeout"), Some("5s"));
        assert_eq!(
            check.on_fail.as_ref().and_then(|a| a.goto.as_deref()),
            Some("fetch")
        );
    }

    #[test]
    fn test_static_targets() {
        let action = RoutingAction {
            run: vec!["a".into()],
            goto: Some("b".into()),
            transitions: vec![Transition {
                when: "true".into(),
                to: Some("c".into()),
                goto_event: None,
            }],
            ..Default::default()
        };
        let targets: Vec<&str> = action.static_targets().collect();
        assert_eq!(targets, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_triggered_by() {
        let mut check = CheckSpec::new("x");
        assert!(check.triggered_by("pr_opened"));
        check.on = vec!["manual".into()];
        assert!(!check.triggered_by("pr_opened"));
        assert!(check.triggered_by("manual"));
    }
}
