//! Collaborators owned by other parts of the system, reached through narrow traits.

pub mod alerts;
pub mod billing;
pub mod generator;

pub use alerts::{
    alert_fire_and_forget, AlertError, AlertService, InMemoryAlertService, SystemAlert,
    TracingAlertService,
};
pub use billing::{AllowAllBilling, BillingError, BillingService};
pub use generator::{LoggingReportGenerator, ReportGenerator};
