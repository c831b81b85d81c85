//! Classifying a company's runs for today.

use chrono::{DateTime, Duration, Utc};

use reportflow_core::{ReportRun, RunId, RunStatus};

/// What today's runs say about a company's daily report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TodayState {
    /// Completed, or a run is making progress.
    Healthy,
    /// No run today at all.
    Missing,
    /// Every run today failed.
    Failed,
    /// Nothing completed and these runs are stuck in PENDING/RUNNING.
    Stuck(Vec<RunId>),
}

impl TodayState {
    pub fn needs_report(&self) -> bool {
        !matches!(self, TodayState::Healthy)
    }
}

/// Assess today's runs for one company.
pub fn assess_today(runs_today: &[ReportRun], now: DateTime<Utc>, stuck_after: Duration) -> TodayState {
    if runs_today.is_empty() {
        return TodayState::Missing;
    }
    if runs_today.iter().any(|r| r.status == RunStatus::Completed) {
        return TodayState::Healthy;
    }

    // A queued retry counts as progress; stuck detection covers PENDING/RUNNING only.
    let progressing = runs_today.iter().any(|r| {
        r.status == RunStatus::Queued || (r.status.is_active() && !r.is_stuck(now, stuck_after))
    });
    if progressing {
        return TodayState::Healthy;
    }

    let stuck: Vec<RunId> = runs_today
        .iter()
        .filter(|r| r.is_stuck(now, stuck_after))
        .map(|r| r.id)
        .collect();
    if stuck.is_empty() {
        TodayState::Failed
    } else {
        TodayState::Stuck(stuck)
    }
}

#[cfg(test)]
mod tests {
    use reportflow_core::CompanyId;

    use super::*;

    fn run(status: RunStatus, age: Duration) -> ReportRun {
        let mut run = ReportRun::pending(CompanyId::new());
        run.status = status;
        run.created_at = Utc::now() - age;
        run
    }

    fn assess(runs: &[ReportRun]) -> TodayState {
        assess_today(runs, Utc::now(), Duration::hours(2))
    }

    #[test]
    fn no_runs_is_missing() {
        assert_eq!(assess(&[]), TodayState::Missing);
    }

    #[test]
    fn completed_wins_over_anything_else() {
        let runs = [
            run(RunStatus::Failed, Duration::minutes(10)),
            run(RunStatus::Completed, Duration::hours(5)),
        ];
        assert_eq!(assess(&runs), TodayState::Healthy);
    }

    #[test]
    fn only_failures_is_failed() {
        let runs = [run(RunStatus::Failed, Duration::minutes(10))];
        assert_eq!(assess(&runs), TodayState::Failed);
        assert!(assess(&runs).needs_report());
    }

    #[test]
    fn old_pending_is_stuck_but_young_pending_is_healthy() {
        let old = run(RunStatus::Running, Duration::hours(3));
        assert_eq!(assess(std::slice::from_ref(&old)), TodayState::Stuck(vec![old.id]));

        let young = run(RunStatus::Pending, Duration::minutes(30));
        assert_eq!(assess(&[old, young]), TodayState::Healthy);
    }

    #[test]
    fn queued_retry_is_progress() {
        let runs = [
            run(RunStatus::Failed, Duration::hours(1)),
            run(RunStatus::Queued, Duration::hours(1)),
        ];
        assert_eq!(assess(&runs), TodayState::Healthy);
    }
}
