//! Custom Resource Definitions for the Gramola operator

mod app_service;
mod types;

pub use app_service::{
    Alias, AppService, AppServiceSpec, AppServiceStatus, LastAction, MigrationRun,
    MigrationStatus, ReconcileState, ReconcileStatus,
};
pub use types::{condition_reasons, condition_types, set_condition, Condition, ConditionStatus};
