//! Kubernetes Event recording for the AppService controller.
//!
//! The reconciler receives an [`EventPublisher`] through its context instead
//! of reaching for a process-wide recorder. Events are fire-and-forget:
//! failures are logged as warnings and never fail a reconcile pass.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "ResourceCreated")
    /// * `action` - What action was taken (e.g. "Converge")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as `controller_name`.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// No-op implementation for tests and dry runs.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Records published reasons in memory so tests can assert on them.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingEventPublisher {
    published: std::sync::Mutex<Vec<(EventType, String)>>,
}

#[cfg(test)]
impl RecordingEventPublisher {
    /// Reasons published so far, in order
    pub fn reasons(&self) -> Vec<String> {
        self.published
            .lock()
            .map(|p| p.iter().map(|(_, r)| r.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of Warning events published so far
    pub fn warnings(&self) -> usize {
        self.published
            .lock()
            .map(|p| p.iter().filter(|(t, _)| *t == EventType::Warning).count())
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        if let Ok(mut published) = self.published.lock() {
            published.push((type_, reason.to_string()));
        }
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// AppService admitted for the first time
    pub const INITIALIZED: &str = "Initialized";
    /// A managed resource was created
    pub const RESOURCE_CREATED: &str = "ResourceCreated";
    /// A drifted managed resource was patched back
    pub const RESOURCE_PATCHED: &str = "ResourcePatched";
    /// The database migration script completed
    pub const MIGRATION_SUCCEEDED: &str = "MigrationSucceeded";
    /// The database migration script reported errors
    pub const MIGRATION_FAILED: &str = "MigrationFailed";
    /// A reconcile pass failed
    pub const PROCESSING_ERROR: &str = "ProcessingError";
    /// The status subresource could not be written
    pub const STATUS_UPDATE_FAILED: &str = "StatusUpdateFailed";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Creating or patching managed resources
    pub const CONVERGE: &str = "Converge";
    /// Running the database migration
    pub const MIGRATE: &str = "Migrate";
}
