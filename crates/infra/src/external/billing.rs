//! Billing pre-check placed before a report job is considered queued.

use async_trait::async_trait;

use reportflow_core::{CompanyId, RunId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BillingError {
    #[error("insufficient budget: {0}")]
    InsufficientBudget(String),
    #[error("billing service unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait BillingService: Send + Sync {
    /// Place a budget hold for one report run.
    async fn start_report_for_billing(
        &self,
        user_id: UserId,
        company_id: CompanyId,
        run_id: RunId,
    ) -> Result<(), BillingError>;
}

/// Accepts every report; used when billing is not wired in.
#[derive(Debug, Default, Clone)]
pub struct AllowAllBilling;

#[async_trait]
impl BillingService for AllowAllBilling {
    async fn start_report_for_billing(
        &self,
        _user_id: UserId,
        _company_id: CompanyId,
        _run_id: RunId,
    ) -> Result<(), BillingError> {
        Ok(())
    }
}
