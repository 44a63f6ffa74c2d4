use super::state::{DispatchStatus, RunState, Supersession};
use crate::config::EngineConfig;
use crate::journal::ExecutionJournal;
use crate::types::IssueCounts;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Counters for one configured check
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckStatistics {
    pub check_id: String,
    pub executions: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Attempts replaced by a retry
    pub retries: usize,
    /// Executions later replaced by a routing re-run
    pub reruns: usize,
    pub total_duration_ms: u64,
    pub issues: IssueCounts,
}

/// Aggregate statistics handed to output formatters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStatistics {
    pub total_configured: usize,
    pub total_executions: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    #[serde(with = "humantime_serde")]
    pub total_duration: Duration,
    pub issues: IssueCounts,
    pub per_check: Vec<CheckStatistics>,
    /// Configured checks that never produced a record
    pub not_run: Vec<String>,
}

impl ExecutionStatistics {
    pub fn collect(
        config: &EngineConfig,
        run: &RunState,
        journal: &ExecutionJournal,
        total_duration: Duration,
    ) -> Self {
        let mut per_check: BTreeMap<String, CheckStatistics> = BTreeMap::new();

        for (check_id, records) in &run.records {
            let stats = per_check
                .entry(check_id.clone())
                .or_insert_with(|| CheckStatistics {
                    check_id: check_id.clone(),
                    ..Default::default()
                });
            for record in records {
                match record.superseded_by {
                    Some(Supersession::Retry) => {
                        stats.retries += 1;
                        stats.total_duration_ms += record.duration_ms;
                        continue;
                    }
                    Some(Supersession::Rerun) => {
                        if record.is_execution() {
                            stats.executions += 1;
                            stats.reruns += 1;
                        }
                        stats.total_duration_ms += record.duration_ms;
                        continue;
                    }
                    None => {}
                }
                match record.status {
                    DispatchStatus::Success => stats.successful += 1,
                    DispatchStatus::Failed => stats.failed += 1,
                    DispatchStatus::Skipped => stats.skipped += 1,
                    DispatchStatus::Pending | DispatchStatus::Running => {}
                }
                if record.is_execution() {
                    stats.executions += 1;
                }
                stats.total_duration_ms += record.duration_ms;
            }
        }

        for entry in journal.entries() {
            if let Some(stats) = per_check.get_mut(&entry.check_id) {
                stats.issues.merge(&entry.result.counts());
            }
        }
        let mut issues = IssueCounts::default();
        for stats in per_check.values() {
            issues.merge(&stats.issues);
        }
        issues.merge(&IssueCounts::from_issues(&run.system_issues));

        let not_run = config
            .checks
            .keys()
            .filter(|id| !per_check.contains_key(*id))
            .cloned()
            .collect();

        let per_check: Vec<CheckStatistics> = per_check.into_values().collect();
        Self {
            total_configured: config.checks.len(),
            total_executions: per_check.iter().map(|s| s.executions).sum(),
            successful: per_check.iter().map(|s| s.successful).sum(),
            failed: per_check.iter().map(|s| s.failed).sum(),
            skipped: per_check.iter().map(|s| s.skipped).sum(),
            total_duration,
            issues,
            per_check,
            not_run,
        }
    }

    pub fn check(&self, check_id: &str) -> Option<&CheckStatistics> {
        self.per_check.iter().find(|s| s.check_id == check_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CheckSpec;
    use crate::engine::state::{DispatchRecord, SkipReason};
    use crate::journal::{JournalEntry, Scope};
    use crate::types::{CheckResult, Issue, Severity};

    #[test]
    fn test_collect_counts_live_records() {
        let config = EngineConfig::default()
            .with_check(CheckSpec::new("a"))
            .with_check(CheckSpec::new("b"))
            .with_check(CheckSpec::new("never"));
        let mut run = RunState::new(10);

        let mut retried = DispatchRecord::new("a", Scope::root(), None);
        retried.status = DispatchStatus::Failed;
        retried.superseded_by = Some(Supersession::Retry);
        retried.duration_ms = 5;
        run.push_record(retried);
        let mut ok = DispatchRecord::new("a", Scope::root(), None);
        ok.status = DispatchStatus::Success;
        ok.attempt = 2;
        ok.duration_ms = 7;
        run.push_record(ok);
        run.push_record(DispatchRecord::skipped("b", Scope::root(), None, SkipReason::Assume));

        let journal = ExecutionJournal::new("s");
        journal.commit(JournalEntry::new(
            "s",
            Scope::root(),
            "a",
            CheckResult {
                issues: vec![Issue::new("r", "m", Severity::Warning)],
                ..Default::default()
            },
            None,
        ));

        let stats = ExecutionStatistics::collect(&config, &run, &journal, Duration::from_millis(20));
        assert_eq!(stats.total_configured, 3);
        assert_eq!(stats.total_executions, 1);
        assert_eq!(stats.successful, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.not_run, vec!["never"]);
        let a = stats.check("a").unwrap();
        assert_eq!(a.retries, 1);
        assert_eq!(a.total_duration_ms, 12);
        assert_eq!(stats.issues.warning, 1);
    }

    #[test]
    fn test_collect_counts_reruns_as_executions() {
        let config = EngineConfig::default().with_check(CheckSpec::new("fix"));
        let mut run = RunState::new(10);
        for (status, duration_ms) in [(DispatchStatus::Failed, 3), (DispatchStatus::Success, 4)] {
            let mut record = DispatchRecord::new("fix", Scope::root(), None);
            record.status = status;
            record.duration_ms = duration_ms;
            run.push_record(record);
        }

        let stats = ExecutionStatistics::collect(&config, &run, &ExecutionJournal::new("s"), Duration::ZERO);
        let fix = stats.check("fix").unwrap();
        assert_eq!(fix.executions, 2);
        assert_eq!(fix.reruns, 1);
        assert_eq!(fix.retries, 0);
        assert_eq!(fix.successful, 1);
        assert_eq!(fix.failed, 0);
        assert_eq!(fix.total_duration_ms, 7);
        assert_eq!(stats.total_executions, 2);
    }
}
