use super::{ExecutionJournal, JournalEntry, Scope};

/// Read view over the journal bounded by a snapshot id
///
/// An entry is visible when it belongs to the view's session, its commit id
/// does not exceed the snapshot, and it matches the event filter if one is set.
#[derive(Debug, Clone)]
pub struct ContextView<'j> {
    journal: &'j ExecutionJournal,
    session_id: String,
    snapshot_id: u64,
    scope: Scope,
    event: Option<String>,
}

impl<'j> ContextView<'j> {
    pub fn new(
        journal: &'j ExecutionJournal,
        session_id: impl Into<String>,
        snapshot_id: u64,
        scope: Scope,
        event: Option<String>,
    ) -> Self {
        Self {
            journal,
            session_id: session_id.into(),
            snapshot_id,
            scope,
            event,
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn snapshot_id(&self) -> u64 {
        self.snapshot_id
    }

    fn is_visible(&self, entry: &JournalEntry) -> bool {
        entry.session_id == self.session_id
            && entry.commit_id <= self.snapshot_id
            && self
                .event
                .as_ref()
                .map_or(true, |event| entry.event.as_ref() == Some(event))
    }

    fn visible_for(&self, check_id: &str) -> Vec<JournalEntry> {
        self.journal
            .read()
            .iter()
            .filter(|e| e.check_id == check_id && self.is_visible(e))
            .cloned()
            .collect()
    }

    /// Most scope-relevant result: exact scope, then nearest ancestor, then latest
    pub fn get(&self, check_id: &str) -> Option<JournalEntry> {
        let visible = self.visible_for(check_id);

        if let Some(exact) = visible.iter().rev().find(|e| e.scope == self.scope) {
            return Some(exact.clone());
        }

        // Entries are in commit order, so max_by_key keeps the latest on ties
        let nearest_ancestor = visible
            .iter()
            .filter(|e| e.scope.is_strict_ancestor_of(&self.scope))
            .max_by_key(|e| (e.scope.depth(), e.commit_id));
        if let Some(entry) = nearest_ancestor {
            return Some(entry.clone());
        }

        visible.into_iter().last()
    }

    /// Shallowest-scoped result; used to reach an aggregate from inside its fan-out
    pub fn get_raw(&self, check_id: &str) -> Option<JournalEntry> {
        self.visible_for(check_id)
            .into_iter()
            .min_by_key(|e| (e.scope.depth(), std::cmp::Reverse(e.commit_id)))
    }

    /// Every visible result in commit order
    pub fn get_history(&self, check_id: &str) -> Vec<JournalEntry> {
        self.visible_for(check_id)
    }

    /// Ids of every check with at least one visible entry, sorted
    pub fn check_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .journal
            .read()
            .iter()
            .filter(|e| self.is_visible(e))
            .map(|e| e.check_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CheckResult;
    use serde_json::{json, Value};

    fn commit(journal: &ExecutionJournal, check: &str, scope: Scope, output: Value) -> u64 {
        journal
            .commit(JournalEntry::new(
                journal.session_id(),
                scope,
                check,
                CheckResult::with_output(output),
                Some("pr_opened".into()),
            ))
            .commit_id
    }

    fn output(entry: Option<JournalEntry>) -> Option<Value> {
        entry.and_then(|e| e.result.output)
    }

    #[test]
    fn test_exact_scope_wins() {
        let journal = ExecutionJournal::new("s");
        let item = Scope::root().child("list", 1);
        commit(&journal, "x", Scope::root(), json!("root"));
        commit(&journal, "x", item.clone(), json!("item"));
        assert_eq!(output(journal.view(item, None).get("x")), Some(json!("item")));
    }

    #[test]
    fn test_nearest_ancestor() {
        let journal = ExecutionJournal::new("s");
        let outer = Scope::root().child("a", 0);
        commit(&journal, "x", Scope::root(), json!("root"));
        commit(&journal, "x", outer.clone(), json!("outer"));
        let view = journal.view(outer.child("b", 2), None);
        assert_eq!(output(view.get("x")), Some(json!("outer")));
    }

    #[test]
    fn test_fallback_to_latest() {
        let journal = ExecutionJournal::new("s");
        commit(&journal, "x", Scope::root().child("a", 0), json!(0));
        commit(&journal, "x", Scope::root().child("a", 1), json!(1));
        let view = journal.view(Scope::root(), None);
        assert_eq!(output(view.get("x")), Some(json!(1)));
    }

    #[test]
    fn test_snapshot_bound() {
        let journal = ExecutionJournal::new("s");
        commit(&journal, "x", Scope::root(), json!("old"));
        let view = journal.view(Scope::root(), None);
        commit(&journal, "x", Scope::root(), json!("new"));
        assert_eq!(output(view.get("x")), Some(json!("old")));
        assert_eq!(view.get_history("x").len(), 1);
    }

    #[test]
    fn test_get_raw_returns_shallowest() {
        let journal = ExecutionJournal::new("s");
        commit(&journal, "list", Scope::root(), json!([1, 2]));
        commit(&journal, "list", Scope::root().child("list", 0), json!(1));
        let view = journal.view(Scope::root().child("list", 0), None);
        assert_eq!(output(view.get("list")), Some(json!(1)));
        assert_eq!(output(view.get_raw("list")), Some(json!([1, 2])));
    }

    #[test]
    fn test_event_and_session_filters() {
        let journal = ExecutionJournal::new("s");
        commit(&journal, "x", Scope::root(), json!(1));
        let snapshot = journal.begin_snapshot();

        let other_event = ContextView::new(&journal, "s", snapshot, Scope::root(), Some("push".into()));
        assert!(other_event.get("x").is_none());

        let same_event =
            ContextView::new(&journal, "s", snapshot, Scope::root(), Some("pr_opened".into()));
        assert!(same_event.get("x").is_some());

        let other_session = ContextView::new(&journal, "t", snapshot, Scope::root(), None);
        assert!(other_session.get("x").is_none());
        assert!(other_session.check_ids().is_empty());
    }
}
