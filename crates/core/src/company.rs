//! Companies, their owners, and report schedules.

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{CompanyId, UserId};

/// Subscription status string that marks a paying owner.
pub const ACTIVE_SUBSCRIPTION: &str = "active";

/// Owner of a company.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub id: UserId,
    pub subscription_status: Option<String>,
    pub is_admin: bool,
}

impl Owner {
    /// Owners with an active subscription, or admins, get scheduled reports.
    pub fn is_eligible(&self) -> bool {
        self.is_admin || self.subscription_status.as_deref() == Some(ACTIVE_SUBSCRIPTION)
    }
}

/// Competitor tracked alongside a company; loaded with the company for the report job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Competitor {
    pub name: String,
    pub website: Option<String>,
}

/// How often a company wants its report generated.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frequency", rename_all = "snake_case")]
pub enum ReportSchedule {
    #[default]
    Daily,
    Weekly { weekday: Weekday },
    /// Day of month, 1..=28 so every month has it.
    Monthly { day: u32 },
    Paused,
}

impl ReportSchedule {
    pub fn monthly(day: u32) -> DomainResult<Self> {
        if (1..=28).contains(&day) {
            Ok(Self::Monthly { day })
        } else {
            Err(DomainError::validation(format!(
                "monthly schedule day must be within 1..=28, got {day}"
            )))
        }
    }

    /// Whether a report is due on `date`.
    pub fn is_due_on(&self, date: NaiveDate) -> bool {
        match self {
            ReportSchedule::Daily => true,
            ReportSchedule::Weekly { weekday } => date.weekday() == *weekday,
            ReportSchedule::Monthly { day } => date.day() == *day,
            ReportSchedule::Paused => false,
        }
    }
}

/// A tracked company with everything the report job needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub id: CompanyId,
    pub name: String,
    pub owner: Owner,
    pub competitors: Vec<Competitor>,
    pub schedule: ReportSchedule,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(status: Option<&str>, is_admin: bool) -> Owner {
        Owner {
            id: UserId::new(),
            subscription_status: status.map(str::to_string),
            is_admin,
        }
    }

    #[test]
    fn eligibility_requires_active_subscription_or_admin() {
        assert!(owner(Some("active"), false).is_eligible());
        assert!(owner(None, true).is_eligible());
        assert!(owner(Some("canceled"), true).is_eligible());
        assert!(!owner(Some("past_due"), false).is_eligible());
        assert!(!owner(None, false).is_eligible());
    }

    #[test]
    fn schedules_match_their_days() {
        // 2024-03-11 is a Monday.
        let monday = NaiveDate::from_ymd_opt(2024, 3, 11).unwrap();
        assert!(ReportSchedule::Daily.is_due_on(monday));
        assert!(ReportSchedule::Weekly { weekday: Weekday::Mon }.is_due_on(monday));
        assert!(!ReportSchedule::Weekly { weekday: Weekday::Tue }.is_due_on(monday));
        assert!(ReportSchedule::monthly(11).unwrap().is_due_on(monday));
        assert!(!ReportSchedule::Paused.is_due_on(monday));
    }

    #[test]
    fn monthly_rejects_days_missing_from_short_months() {
        assert!(ReportSchedule::monthly(0).is_err());
        assert!(ReportSchedule::monthly(29).is_err());
    }
}
