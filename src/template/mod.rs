//! Desired-state generators for the objects an AppService owns
//!
//! Every generator is a pure function of a [`TemplateContext`] plus the
//! names of the objects it refers to. Maps are `BTreeMap`s so two calls
//! with the same inputs serialize to identical bytes, which drift
//! detection relies on.
//!
//! Generators never check that referenced objects exist. The controller
//! converges service groups in dependency order instead.

mod config;
mod network;
mod storage;
mod workload;

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

use crate::crd::AppService;
use crate::migration::MigrationScript;
use crate::Error;

pub use config::{database_secret, scripts_config_map, DatabaseCredentials};
pub use network::{route, service, Route, RoutePort, RouteSpec, RouteTargetReference};
pub use storage::persistent_volume_claim;
pub use workload::{
    database_deployment, events_deployment, node_workload, web_deployment, DatabaseRefs,
    EventsRefs, Upstream, WebWorkload, DATABASE_CONTAINER, DATABASE_PORT, FRONTEND_IMAGE,
    GATEWAY_IMAGE, HTTP_PORT, SCRIPTS_MOUNT_PATH,
};

/// Value of the `app` label on every managed object
pub const APP_LABEL_VALUE: &str = "gramola";
/// Label naming the service a managed object belongs to
pub const COMPONENT_LABEL: &str = "component";
/// Label tying pods back to the owning AppService
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
/// Runtime hint used by the OpenShift console topology view
pub const RUNTIME_LABEL: &str = "app.kubernetes.io/name";

/// Topology edge annotation understood by the OpenShift console
pub const CONNECTS_TO_ANNOTATION: &str = "app.openshift.io/connects-to";
const VCS_REF_ANNOTATION: &str = "app.openshift.io/vcs-ref";
const VCS_URI_ANNOTATION: &str = "app.openshift.io/vcs-uri";
const VCS_REF: &str = "master";
const VCS_URI: &str = "https://github.com/cvicens/gramola";

// =============================================================================
// Labels and annotations
// =============================================================================

/// Labels carried by managed objects.
///
/// The well-known keys are fixed fields. Anything workload-specific goes
/// into `extra`. Patching merges these into the live object, so labels
/// added by users are left alone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppLabels {
    /// Always [`APP_LABEL_VALUE`]
    pub app: String,
    /// Service name, e.g. `events-database`
    pub component: String,
    /// Name of the owning AppService
    pub instance: String,
    /// Additional labels
    pub extra: BTreeMap<String, String>,
}

impl AppLabels {
    /// Labels for `component` owned by the AppService `instance`
    pub fn new(instance: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            app: APP_LABEL_VALUE.to_string(),
            component: component.into(),
            instance: instance.into(),
            extra: BTreeMap::new(),
        }
    }

    /// Add an extra label
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Minimal label set used for selectors, which cannot change after creation
    pub fn selector(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("app".to_string(), self.app.clone()),
            (COMPONENT_LABEL.to_string(), self.component.clone()),
        ])
    }

    /// Full label map
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut labels = self.extra.clone();
        labels.extend(self.selector());
        labels.insert(INSTANCE_LABEL.to_string(), self.instance.clone());
        labels.insert(
            "app.kubernetes.io/part-of".to_string(),
            APP_LABEL_VALUE.to_string(),
        );
        labels
    }
}

/// Annotations for an application workload that talks to `connects_to`
pub fn workload_annotations(connects_to: Option<&str>) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::from([
        (VCS_REF_ANNOTATION.to_string(), VCS_REF.to_string()),
        (VCS_URI_ANNOTATION.to_string(), VCS_URI.to_string()),
    ]);
    if let Some(target) = connects_to {
        annotations.insert(CONNECTS_TO_ANNOTATION.to_string(), target.to_string());
    }
    annotations
}

// =============================================================================
// Template context
// =============================================================================

/// Inputs shared by every generator for one AppService
#[derive(Clone, Debug)]
pub struct TemplateContext {
    /// Name of the owning AppService
    pub instance: String,
    /// Namespace everything is created in
    pub namespace: String,
    /// Controller owner reference pointing at the AppService
    pub owner: OwnerReference,
    /// Migration script shipped in the scripts ConfigMap
    pub script: Option<MigrationScript>,
}

impl TemplateContext {
    /// Build the context for `app`.
    ///
    /// Fails when the AppService has no namespace or uid, which only
    /// happens for objects that were never persisted.
    pub fn for_app(app: &AppService, script: Option<&MigrationScript>) -> Result<Self, Error> {
        let instance = app.name_any();
        let namespace = app.namespace().ok_or_else(|| {
            Error::validation_for_field(&instance, "metadata.namespace", "AppService must be namespaced")
        })?;
        let owner = app.controller_owner_ref(&()).ok_or_else(|| {
            Error::internal_with_context("template", format!("AppService {instance} has no uid"))
        })?;
        Ok(Self {
            instance,
            namespace,
            owner,
            script: script.cloned(),
        })
    }

    /// Labels for a managed object named `component`
    pub fn labels(&self, component: &str) -> AppLabels {
        AppLabels::new(&self.instance, component)
    }

    /// Metadata for a managed object
    pub fn metadata(
        &self,
        name: &str,
        labels: &AppLabels,
        annotations: BTreeMap<String, String>,
    ) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.clone()),
            labels: Some(labels.to_map()),
            annotations: (!annotations.is_empty()).then_some(annotations),
            owner_references: Some(vec![self.owner.clone()]),
            ..Default::default()
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::crd::AppServiceSpec;

    /// A persisted-looking AppService in namespace `gramola`
    pub fn sample_app() -> AppService {
        let mut app = AppService::new("gramola", AppServiceSpec::default());
        app.metadata.namespace = Some("gramola".to_string());
        app.metadata.uid = Some("2d8c1f3e-0000-4000-8000-000000000001".to_string());
        app
    }

    pub fn sample_context() -> TemplateContext {
        let script = MigrationScript::new("events-database-update-0.0.1.sql", "SELECT 1;");
        TemplateContext::for_app(&sample_app(), Some(&script)).expect("context")
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn labels_keep_well_known_keys_over_extras() {
        let labels = AppLabels::new("gramola", "events")
            .with(RUNTIME_LABEL, "java")
            .with("component", "spoofed");

        let map = labels.to_map();
        assert_eq!(map["component"], "events");
        assert_eq!(map["app"], "gramola");
        assert_eq!(map[INSTANCE_LABEL], "gramola");
        assert_eq!(map[RUNTIME_LABEL], "java");
    }

    #[test]
    fn selector_only_contains_stable_keys() {
        let labels = AppLabels::new("gramola", "events").with(RUNTIME_LABEL, "java");
        let selector = labels.selector();

        assert_eq!(selector.len(), 2);
        assert!(!selector.contains_key(RUNTIME_LABEL));
    }

    #[test]
    fn metadata_is_owned_by_the_app_service() {
        let ctx = sample_context();
        let meta = ctx.metadata("events", &ctx.labels("events"), BTreeMap::new());

        let owners = meta.owner_references.expect("owner refs");
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "AppService");
        assert_eq!(owners[0].controller, Some(true));
        assert!(meta.annotations.is_none());
    }

    #[test]
    fn context_requires_a_uid() {
        let mut app = sample_app();
        app.metadata.uid = None;
        assert!(TemplateContext::for_app(&app, None).is_err());
    }

    #[test]
    fn workload_annotations_include_topology_edge() {
        let annotations = workload_annotations(Some("events"));
        assert_eq!(annotations[CONNECTS_TO_ANNOTATION], "events");
        assert_eq!(annotations[VCS_REF_ANNOTATION], "master");
    }
}
