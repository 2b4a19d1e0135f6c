//! Watch filters and mappers feeding the AppService controller

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;

use crate::crd::AppService;
use crate::template::INSTANCE_LABEL;
use crate::topology::EVENTS_DATABASE;

/// Disabled AppServices never reach the reconciler
pub fn is_enabled(app: &AppService) -> bool {
    app.spec.enabled
}

/// Whether a pod event may unblock a pending migration
pub fn pod_triggers_migration(pod: &Pod) -> bool {
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    pod.name_any().contains(EVENTS_DATABASE) && matches!(phase, Some("Running" | "Succeeded"))
}

/// Fingerprint of the pod fields that matter for migration.
///
/// Used as a `predicate_filter` so status churn that does not change the
/// phase or any container's readiness is dropped.
pub fn pod_readiness_fingerprint(pod: &Pod) -> Option<u64> {
    let status = pod.status.as_ref()?;
    let mut hasher = DefaultHasher::new();
    status.phase.hash(&mut hasher);
    for container in status.container_statuses.iter().flatten() {
        container.name.hash(&mut hasher);
        container.ready.hash(&mut hasher);
    }
    Some(hasher.finish())
}

/// AppService owning a database pod, found through the instance label
pub fn app_service_for_pod(pod: &Pod) -> Option<ObjectRef<AppService>> {
    let instance = pod.labels().get(INSTANCE_LABEL)?;
    let namespace = pod.namespace()?;
    Some(ObjectRef::new(instance).within(&namespace))
}
