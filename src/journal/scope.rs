use serde::{Deserialize, Serialize};
use std::fmt;

/// One level of fan-out: the forEach check and the item index
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeSegment {
    pub check_id: String,
    pub index: usize,
}

/// Execution scope as an ordered path of fan-out segments; the root is empty
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(Vec<ScopeSegment>);

impl Scope {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn from_segments(segments: Vec<ScopeSegment>) -> Self {
        Self(segments)
    }

    pub fn segments(&self) -> &[ScopeSegment] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn child(&self, check_id: impl Into<String>, index: usize) -> Self {
        let mut segments = self.0.clone();
        segments.push(ScopeSegment {
            check_id: check_id.into(),
            index,
        });
        Self(segments)
    }

    /// Prefix test; a scope is its own ancestor
    pub fn is_ancestor_of(&self, other: &Scope) -> bool {
        other.0.starts_with(&self.0)
    }

    pub fn is_strict_ancestor_of(&self, other: &Scope) -> bool {
        self.depth() < other.depth() && self.is_ancestor_of(other)
    }

    /// The first `depth` segments
    pub fn truncate(&self, depth: usize) -> Self {
        Self(self.0.iter().take(depth).cloned().collect())
    }

    /// Longest prefix whose segments are all accepted by `keep`
    pub fn prefix_while(&self, mut keep: impl FnMut(&ScopeSegment) -> bool) -> Self {
        Self(self.0.iter().take_while(|s| keep(s)).cloned().collect())
    }

    /// Innermost fan-out item index, if any
    pub fn item_index(&self) -> Option<usize> {
        self.0.last().map(|s| s.index)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("root");
        }
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|s| format!("{}[{}]", s.check_id, s.index))
            .collect();
        f.write_str(&parts.join("/"))
    }
}
