//! In-memory repositories for tests/dev.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::RwLock;

use reportflow_core::{Company, CompanyId, ReportRun, RunId, RunStatus};

use super::{CompanyRepository, ReportRunRepository, RepositoryError};

/// Shared in-memory state backing both repositories.
#[derive(Debug, Default)]
pub struct InMemoryDatabase {
    companies: RwLock<HashMap<CompanyId, Company>>,
    runs: RwLock<HashMap<RunId, ReportRun>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub async fn insert_company(&self, company: Company) {
        self.companies.write().await.insert(company.id, company);
    }

    /// Insert a run as-is, keeping its timestamps.
    pub async fn insert_run(&self, run: ReportRun) {
        self.runs.write().await.insert(run.id, run);
    }

    pub async fn runs_for_company(&self, company_id: CompanyId) -> Vec<ReportRun> {
        let runs = self.runs.read().await;
        let mut result: Vec<_> = runs
            .values()
            .filter(|r| r.company_id == company_id)
            .cloned()
            .collect();
        result.sort_by_key(|r| r.created_at);
        result
    }
}

#[async_trait]
impl ReportRunRepository for InMemoryDatabase {
    async fn create(&self, run: ReportRun) -> Result<ReportRun, RepositoryError> {
        self.runs.write().await.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get(&self, id: RunId) -> Result<Option<ReportRun>, RepositoryError> {
        Ok(self.runs.read().await.get(&id).cloned())
    }

    async fn find_for_day(
        &self,
        company_id: CompanyId,
        date: NaiveDate,
        statuses: &[RunStatus],
    ) -> Result<Option<ReportRun>, RepositoryError> {
        let runs = self.runs.read().await;
        Ok(runs
            .values()
            .filter(|r| r.company_id == company_id && r.created_on(date))
            .filter(|r| statuses.is_empty() || statuses.contains(&r.status))
            .max_by_key(|r| (r.created_at, r.id))
            .cloned())
    }

    async fn list_for_day(
        &self,
        company_id: CompanyId,
        date: NaiveDate,
    ) -> Result<Vec<ReportRun>, RepositoryError> {
        let runs = self.runs.read().await;
        let mut result: Vec<_> = runs
            .values()
            .filter(|r| r.company_id == company_id && r.created_on(date))
            .cloned()
            .collect();
        result.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(result)
    }

    async fn latest_for_company(
        &self,
        company_id: CompanyId,
    ) -> Result<Option<ReportRun>, RepositoryError> {
        let runs = self.runs.read().await;
        Ok(runs
            .values()
            .filter(|r| r.company_id == company_id)
            .max_by_key(|r| (r.created_at, r.id))
            .cloned())
    }

    async fn set_job_id(&self, id: RunId, job_id: &str) -> Result<(), RepositoryError> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("report run {id}")))?;
        run.job_id = Some(job_id.to_string());
        Ok(())
    }

    async fn update_status(
        &self,
        id: RunId,
        status: RunStatus,
        step_status: Option<String>,
    ) -> Result<ReportRun, RepositoryError> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("report run {id}")))?;
        run.transition(status, step_status);
        Ok(run.clone())
    }
}

#[async_trait]
impl CompanyRepository for InMemoryDatabase {
    async fn find_with_competitors(
        &self,
        id: CompanyId,
    ) -> Result<Option<Company>, RepositoryError> {
        Ok(self.companies.read().await.get(&id).cloned())
    }

    async fn eligible_for_backup(&self) -> Result<Vec<Company>, RepositoryError> {
        let companies = self.companies.read().await;
        let runs = self.runs.read().await;

        let mut eligible: Vec<_> = companies
            .values()
            .filter(|c| c.owner.is_eligible())
            .filter(|c| {
                runs.values()
                    .any(|r| r.company_id == c.id && r.status == RunStatus::Completed)
            })
            .cloned()
            .collect();
        eligible.sort_by_key(|c| c.id);
        Ok(eligible)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use reportflow_core::{Owner, ReportSchedule, UserId};

    use super::*;

    fn company(status: Option<&str>, is_admin: bool) -> Company {
        Company {
            id: CompanyId::new(),
            name: "Acme".to_string(),
            owner: Owner {
                id: UserId::new(),
                subscription_status: status.map(str::to_string),
                is_admin,
            },
            competitors: Vec::new(),
            schedule: ReportSchedule::Daily,
        }
    }

    fn completed_yesterday(company_id: CompanyId) -> ReportRun {
        let mut run = ReportRun::pending(company_id);
        run.created_at = Utc::now() - Duration::days(1);
        run.transition(RunStatus::Completed, None);
        run
    }

    #[tokio::test]
    async fn find_for_day_filters_status_and_returns_latest() {
        let db = InMemoryDatabase::new();
        let company_id = CompanyId::new();
        let today = Utc::now().date_naive();

        let mut older = ReportRun::pending(company_id);
        older.created_at = Utc::now() - Duration::seconds(5);
        older.status = RunStatus::Failed;
        let newer = ReportRun::pending(company_id);
        db.insert_run(older.clone()).await;
        db.insert_run(newer.clone()).await;

        let any = db.find_for_day(company_id, today, &[]).await.unwrap().unwrap();
        assert_eq!(any.id, newer.id);

        let failed = db
            .find_for_day(company_id, today, &[RunStatus::Failed])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.id, older.id);

        let none = db
            .find_for_day(company_id, today, &[RunStatus::Completed])
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn update_status_stamps_completion() {
        let db = InMemoryDatabase::new();
        let run = db.create(ReportRun::pending(CompanyId::new())).await.unwrap();

        let updated = db
            .update_status(run.id, RunStatus::Failed, Some("boom".to_string()))
            .await
            .unwrap();
        assert_eq!(updated.status, RunStatus::Failed);
        assert_eq!(updated.step_status.as_deref(), Some("boom"));
        assert!(updated.completed_at.is_some());

        let missing = db.update_status(RunId::new(), RunStatus::Failed, None).await;
        assert!(matches!(missing, Err(RepositoryError::NotFound(_))));
    }

    #[tokio::test]
    async fn eligible_for_backup_needs_history_and_eligible_owner() {
        let db = InMemoryDatabase::new();

        let active = company(Some("active"), false);
        let admin = company(None, true);
        let lapsed = company(Some("canceled"), false);
        let fresh = company(Some("active"), false);

        for c in [&active, &admin, &lapsed] {
            db.insert_company(c.clone()).await;
            db.insert_run(completed_yesterday(c.id)).await;
        }
        db.insert_company(fresh.clone()).await;

        let mut expected = vec![active.id, admin.id];
        expected.sort();
        let eligible: Vec<_> = db
            .eligible_for_backup()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(eligible, expected);
    }
}
