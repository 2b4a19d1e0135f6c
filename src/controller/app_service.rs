//! AppService reconciliation
//!
//! One pass walks `Fetch → Validate → Initialize → converge(events) →
//! converge(gateway) → converge(frontend) → Migrate → commit`. Every failure
//! after the fetch is written to the status subresource and requeued through
//! the backoff in [`crate::status`]; `error_policy` only sees errors from
//! before there was an object to write to.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::converge::{ensure, Convergence, KubeResourceStore, ResourceStore};
use crate::crd::{AppService, LastAction, MigrationStatus};
use crate::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use crate::migration::{
    self, DatabasePods, KubeDatabasePods, MigrationOutcome, MigrationScript, MigrationSettings,
};
use crate::status::{
    record_failure, record_success, AppServiceStore, KubeAppServiceStore, PassOutcome,
    IMMEDIATE_REQUEUE,
};
use crate::template::TemplateContext;
use crate::topology::{service_groups, ServiceGroup};
use crate::{Error, CONTROLLER_NAME};

/// Default delay before re-checking a database that is not ready yet
pub const DEFAULT_MIGRATION_REQUEUE: Duration = Duration::from_secs(10);

// =============================================================================
// Controller context
// =============================================================================

/// Shared state for all reconcile passes
pub struct Context {
    /// AppService reads and writes
    pub app_services: Arc<dyn AppServiceStore>,
    /// Managed resource CRUD
    pub resources: Arc<dyn ResourceStore>,
    /// Database pod listing and exec
    pub pods: Arc<dyn DatabasePods>,
    /// Event publisher for emitting Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    /// How the migration is executed
    pub migration: MigrationSettings,
    /// Script shipped in the scripts ConfigMap, if one was found on disk
    pub script: Option<MigrationScript>,
    /// Delay before re-checking an unready database
    pub migration_requeue: Duration,
}

impl Context {
    /// Build a context whose stores all talk to the cluster behind `client`
    pub fn from_client(
        client: Client,
        migration: MigrationSettings,
        script: Option<MigrationScript>,
        migration_requeue: Duration,
    ) -> Self {
        Self {
            app_services: Arc::new(KubeAppServiceStore::new(client.clone())),
            resources: Arc::new(KubeResourceStore::new(client.clone())),
            pods: Arc::new(KubeDatabasePods::new(client.clone())),
            events: Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME)),
            migration,
            script,
            migration_requeue,
        }
    }

    /// Create a context for testing with mock stores
    #[cfg(test)]
    pub fn for_testing(
        app_services: Arc<dyn AppServiceStore>,
        resources: Arc<dyn ResourceStore>,
        pods: Arc<dyn DatabasePods>,
    ) -> Self {
        Self {
            app_services,
            resources,
            pods,
            events: Arc::new(crate::events::NoopEventPublisher),
            migration: MigrationSettings::default(),
            script: Some(MigrationScript::new(
                migration::SCRIPT_NAME,
                "CREATE TABLE IF NOT EXISTS events();",
            )),
            migration_requeue: DEFAULT_MIGRATION_REQUEUE,
        }
    }

    async fn publish(
        &self,
        app: &AppService,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.events
            .publish(&app.object_ref(&()), type_, reason, action, note)
            .await;
    }
}

// =============================================================================
// Reconcile
// =============================================================================

/// How a pass that did not fail ended
#[derive(Debug)]
enum Pass {
    /// `spec.initialized` was flipped; the resulting watch event drives the next pass
    Initialized,
    /// Everything converged
    Converged {
        action: LastAction,
        requeue: Option<Duration>,
    },
    /// Persisting the migration result failed; rerun from a fresh read
    StatusWriteFailed,
}

/// Reconcile an AppService
///
/// The object handed in by the controller is only used as a key; the pass
/// works on a fresh read so status writes carry the latest resourceVersion.
#[instrument(skip(app, ctx), fields(app_service = %app.name_any()))]
pub async fn reconcile(app: Arc<AppService>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = app.name_any();
    let Some(namespace) = app.namespace() else {
        error!("AppService is missing namespace");
        return Ok(Action::await_change());
    };

    let Some(mut current) = ctx.app_services.get(&namespace, &name).await? else {
        debug!("AppService no longer exists");
        return Ok(Action::await_change());
    };
    if !current.spec.enabled {
        debug!("AppService is disabled, skipping");
        return Ok(Action::await_change());
    }

    let outcome = match drive(&mut current, &ctx).await {
        Ok(Pass::Initialized) => PassOutcome::Done,
        Ok(Pass::StatusWriteFailed) => PassOutcome::RequeueImmediate,
        Ok(Pass::Converged { action, requeue }) => {
            commit_success(&mut current, &ctx, action, requeue).await
        }
        Err(e) => commit_failure(&mut current, &ctx, &e).await,
    };

    debug!(?outcome, "reconcile pass finished");
    Ok(outcome.into())
}

/// Error policy for the AppService controller
///
/// Only fetch failures end up here; everything else is handled by the
/// status backoff inside the pass.
pub fn error_policy(app: Arc<AppService>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        app_service = %app.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed before status could be recorded"
    );
    Action::requeue(IMMEDIATE_REQUEUE)
}

async fn drive(app: &mut AppService, ctx: &Context) -> Result<Pass, Error> {
    app.spec.validate(&app.name_any())?;

    if !app.spec.initialized {
        app.spec.initialized = true;
        let updated = ctx.app_services.replace(app).await?;
        *app = updated;
        info!("AppService initialized");
        ctx.publish(
            app,
            EventType::Normal,
            reasons::INITIALIZED,
            actions::RECONCILE,
            None,
        )
        .await;
        return Ok(Pass::Initialized);
    }

    let template = TemplateContext::for_app(app, ctx.script.as_ref())?;
    for group in service_groups(&template) {
        converge_group(app, ctx, &group).await?;
    }

    if app.migration_status() == MigrationStatus::Succeeded {
        return Ok(Pass::Converged {
            action: LastAction::NoAction,
            requeue: None,
        });
    }
    migrate(app, ctx).await
}

async fn converge_group(
    app: &AppService,
    ctx: &Context,
    group: &ServiceGroup,
) -> Result<(), Error> {
    for resource in &group.resources {
        let reason = match ensure(ctx.resources.as_ref(), resource).await? {
            Convergence::Created => reasons::RESOURCE_CREATED,
            Convergence::Patched => reasons::RESOURCE_PATCHED,
            Convergence::Unchanged => continue,
        };
        ctx.publish(
            app,
            EventType::Normal,
            reason,
            actions::CONVERGE,
            Some(format!("{} {}", resource.kind(), resource.name())),
        )
        .await;
    }
    debug!(group = %group.name, "service group converged");
    Ok(())
}

async fn migrate(app: &mut AppService, ctx: &Context) -> Result<Pass, Error> {
    let namespace = app.namespace().unwrap_or_default();
    let script = ctx.migration.script_name.clone();

    match migration::run(ctx.pods.as_ref(), &namespace, &ctx.migration).await {
        Ok(MigrationOutcome::NotReady) => {
            info!("events database not ready, migration postponed");
            Ok(Pass::Converged {
                action: LastAction::RequeueEvent,
                requeue: Some(ctx.migration_requeue),
            })
        }
        Ok(MigrationOutcome::Completed { pod, stdout }) => {
            debug!(pod = %pod, stdout = %stdout, "migration output");
            app.status_mut()
                .record_migration(&script, MigrationStatus::Succeeded);
            // Persist right away so a later failure in this pass cannot re-run the script
            match ctx.app_services.replace_status(app).await {
                Ok(updated) => *app = updated,
                Err(e) => {
                    status_write_failed(app, ctx, &e).await;
                    return Ok(Pass::StatusWriteFailed);
                }
            }
            ctx.publish(
                app,
                EventType::Normal,
                reasons::MIGRATION_SUCCEEDED,
                actions::MIGRATE,
                Some(format!("{script} ran in {pod}")),
            )
            .await;
            Ok(Pass::Converged {
                action: LastAction::MigrationStarted,
                requeue: None,
            })
        }
        Err(e) => {
            app.status_mut()
                .record_migration(&script, MigrationStatus::Failed);
            ctx.publish(
                app,
                EventType::Warning,
                reasons::MIGRATION_FAILED,
                actions::MIGRATE,
                Some(e.to_string()),
            )
            .await;
            Err(e)
        }
    }
}

// =============================================================================
// Commit
// =============================================================================

async fn commit_success(
    app: &mut AppService,
    ctx: &Context,
    action: LastAction,
    requeue: Option<Duration>,
) -> PassOutcome {
    record_success(app.status_mut(), action, Utc::now());
    if !write_status(app, ctx).await {
        return PassOutcome::RequeueImmediate;
    }
    info!(last_action = ?action, "AppService reconciled");
    requeue.map_or(PassOutcome::Done, PassOutcome::Requeue)
}

async fn commit_failure(app: &mut AppService, ctx: &Context, err: &Error) -> PassOutcome {
    warn!(error = %err, class = %err.class(), "reconcile pass failed");
    let delay = record_failure(app.status_mut(), &err.to_string(), Utc::now());
    ctx.publish(
        app,
        EventType::Warning,
        reasons::PROCESSING_ERROR,
        actions::RECONCILE,
        Some(err.to_string()),
    )
    .await;

    if !write_status(app, ctx).await {
        return PassOutcome::RequeueImmediate;
    }
    PassOutcome::Requeue(delay)
}

async fn write_status(app: &AppService, ctx: &Context) -> bool {
    match ctx.app_services.replace_status(app).await {
        Ok(_) => true,
        Err(e) => {
            status_write_failed(app, ctx, &e).await;
            false
        }
    }
}

async fn status_write_failed(app: &AppService, ctx: &Context, err: &Error) {
    warn!(error = %err, conflict = err.is_conflict(), "status write failed");
    ctx.publish(
        app,
        EventType::Warning,
        reasons::STATUS_UPDATE_FAILED,
        actions::RECONCILE,
        Some(err.to_string()),
    )
    .await;
}
