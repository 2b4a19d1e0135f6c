//! AppService controller
//!
//! Reconciliation follows the Kubernetes controller pattern: every pass
//! re-reads the AppService, converges the managed resources, and records
//! what it saw in the status subresource.

mod app_service;
mod triggers;

pub use app_service::{error_policy, reconcile, Context, DEFAULT_MIGRATION_REQUEUE};
pub use triggers::{
    app_service_for_pod, is_enabled, pod_readiness_fingerprint, pod_triggers_migration,
};
