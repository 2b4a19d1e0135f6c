//! Status bookkeeping and retry backoff for AppService
//!
//! Failures back off exponentially: the first failure after a success waits
//! [`INITIAL_RETRY_DELAY`], every further consecutive failure doubles the
//! previous delay, capped at [`MAX_RETRY_DELAY`]. The previous delay is
//! persisted in `reconcileStatus.retryAfterSeconds` so the sequence survives
//! operator restarts.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use crate::crd::{
    condition_reasons, condition_types, set_condition, AppService, AppServiceStatus, Condition,
    ConditionStatus, LastAction, ReconcileState, ReconcileStatus,
};
use crate::{Error, OPERATOR_NAME};

/// Delay after the first failure following a success
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Upper bound for the failure backoff
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(6 * 60 * 60);
/// Delay used when a status write lost a race
pub const IMMEDIATE_REQUEUE: Duration = Duration::from_secs(1);

/// Terminal outcome of one reconcile pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassOutcome {
    /// Run again after the delay
    Requeue(Duration),
    /// Run again shortly, re-reading fresh state
    RequeueImmediate,
    /// Wait for the next external trigger
    Done,
}

impl From<PassOutcome> for Action {
    fn from(outcome: PassOutcome) -> Self {
        match outcome {
            PassOutcome::Requeue(delay) => Action::requeue(delay),
            PassOutcome::RequeueImmediate => Action::requeue(IMMEDIATE_REQUEUE),
            PassOutcome::Done => Action::await_change(),
        }
    }
}

// =============================================================================
// Backoff
// =============================================================================

/// Delay to request after a failure, given the previously recorded outcome
pub fn next_retry_delay(previous: Option<&ReconcileStatus>) -> Duration {
    match previous {
        Some(ReconcileStatus {
            status: ReconcileState::Failed,
            retry_after_seconds: Some(prev),
            ..
        }) => Duration::from_secs(prev.saturating_mul(2)).min(MAX_RETRY_DELAY),
        _ => INITIAL_RETRY_DELAY,
    }
}

/// `now`, unless that would move `lastUpdate` backwards
fn monotonic(previous: Option<&ReconcileStatus>, now: DateTime<Utc>) -> DateTime<Utc> {
    previous.map_or(now, |p| p.last_update.max(now))
}

/// Record a failed pass on `status` and return the delay to requeue with
pub fn record_failure(status: &mut AppServiceStatus, reason: &str, now: DateTime<Utc>) -> Duration {
    let previous = status.reconcile_status.as_ref();
    let delay = next_retry_delay(previous);
    let last_update = monotonic(previous, now);

    status.reconcile_status = Some(ReconcileStatus {
        status: ReconcileState::Failed,
        last_update,
        reason: reason.to_string(),
        retry_after_seconds: Some(delay.as_secs()),
    });
    set_condition(
        &mut status.conditions,
        Condition::new(
            condition_types::PROMOTED,
            ConditionStatus::False,
            condition_reasons::FAILED,
            reason,
            last_update,
        ),
    );
    delay
}

/// Record a successful pass on `status`.
///
/// `RequeueEvent` means the pass converged but is still waiting on the
/// database, which leaves `Promoted` at Unknown.
pub fn record_success(status: &mut AppServiceStatus, action: LastAction, now: DateTime<Utc>) {
    let last_update = monotonic(status.reconcile_status.as_ref(), now);

    status.reconcile_status = Some(ReconcileStatus {
        status: ReconcileState::True,
        last_update,
        reason: String::new(),
        retry_after_seconds: None,
    });
    status.last_action = Some(action);

    let condition = match action {
        LastAction::RequeueEvent => Condition::new(
            condition_types::PROMOTED,
            ConditionStatus::Unknown,
            condition_reasons::WAITING,
            "waiting for the events database to become ready",
            last_update,
        ),
        LastAction::MigrationStarted | LastAction::NoAction => Condition::new(
            condition_types::PROMOTED,
            ConditionStatus::True,
            condition_reasons::SUCCEEDED,
            "",
            last_update,
        ),
    };
    set_condition(&mut status.conditions, condition);
}

// =============================================================================
// Store
// =============================================================================

/// Reads and writes of the AppService itself
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AppServiceStore: Send + Sync {
    /// Fetch the AppService, `None` when it no longer exists
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<AppService>, Error>;

    /// Replace the object (spec and metadata), guarded by its resourceVersion
    async fn replace(&self, app: &AppService) -> Result<AppService, Error>;

    /// Write the status subresource, guarded by the resourceVersion
    async fn replace_status(&self, app: &AppService) -> Result<AppService, Error>;
}

/// Real store backed by the Kubernetes API
pub struct KubeAppServiceStore {
    client: Client,
}

impl KubeAppServiceStore {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, app: &AppService) -> Result<Api<AppService>, Error> {
        let namespace = app
            .namespace()
            .ok_or_else(|| Error::validation("AppService must be namespaced"))?;
        Ok(Api::namespaced(self.client.clone(), &namespace))
    }
}

#[async_trait]
impl AppServiceStore for KubeAppServiceStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<AppService>, Error> {
        let api: Api<AppService> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| Error::from_kube("AppService", name, e))
    }

    async fn replace(&self, app: &AppService) -> Result<AppService, Error> {
        let name = app.name_any();
        self.api(app)?
            .replace(
                &name,
                &PostParams {
                    field_manager: Some(OPERATOR_NAME.to_string()),
                    ..Default::default()
                },
                app,
            )
            .await
            .map_err(|e| Error::from_kube("AppService", name, e))
    }

    async fn replace_status(&self, app: &AppService) -> Result<AppService, Error> {
        let name = app.name_any();
        // resourceVersion in a merge patch is a precondition: stale writes get 409
        let body = serde_json::json!({
            "metadata": { "resourceVersion": app.resource_version() },
            "status": app.status,
        });
        self.api(app)?
            .patch_status(
                &name,
                &PatchParams {
                    field_manager: Some(OPERATOR_NAME.to_string()),
                    ..Default::default()
                },
                &Patch::Merge(&body),
            )
            .await
            .map_err(|e| Error::from_kube("AppService", name, e))
    }
}
