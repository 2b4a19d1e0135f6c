//! Service groups and the managed objects they are made of
//!
//! A service group is the ordered bundle of objects that implements one
//! tier of the application. Groups are recomputed from the AppService on
//! every pass and are never persisted.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret, Service};
use kube::core::{ApiResource, ResourceExt};
use serde_json::{Map, Value};

use crate::template::{
    self, database_deployment, database_secret, events_deployment, node_workload,
    persistent_volume_claim, route, scripts_config_map, service, web_deployment,
    DatabaseCredentials, DatabaseRefs, EventsRefs, Route, TemplateContext, Upstream,
    DATABASE_PORT, FRONTEND_IMAGE, GATEWAY_IMAGE, HTTP_PORT,
};
use crate::Error;

/// Name of the events backend service
pub const EVENTS: &str = "events";
/// Name of the events database service; pods of this component are migration targets
pub const EVENTS_DATABASE: &str = "events-database";
/// Name of the ConfigMap holding the migration scripts
pub const EVENTS_DATABASE_SCRIPTS: &str = "events-database-scripts";
/// Name of the gateway service
pub const GATEWAY: &str = "gateway";
/// Name of the frontend service
pub const FRONTEND: &str = "frontend";

const DATABASE_STORAGE: &str = "512Mi";

/// A desired object the convergence engine can create or patch
#[derive(Clone, Debug, PartialEq)]
pub enum ManagedResource {
    /// Credentials
    Secret(Secret),
    /// Configuration
    ConfigMap(ConfigMap),
    /// Storage
    PersistentVolumeClaim(PersistentVolumeClaim),
    /// Workload
    Deployment(Deployment),
    /// Network entry point
    Service(Service),
    /// External route
    Route(Route),
}

impl ManagedResource {
    /// Kubernetes kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Secret(_) => "Secret",
            Self::ConfigMap(_) => "ConfigMap",
            Self::PersistentVolumeClaim(_) => "PersistentVolumeClaim",
            Self::Deployment(_) => "Deployment",
            Self::Service(_) => "Service",
            Self::Route(_) => "Route",
        }
    }

    /// Object name
    pub fn name(&self) -> String {
        match self {
            Self::Secret(o) => o.name_any(),
            Self::ConfigMap(o) => o.name_any(),
            Self::PersistentVolumeClaim(o) => o.name_any(),
            Self::Deployment(o) => o.name_any(),
            Self::Service(o) => o.name_any(),
            Self::Route(o) => o.name_any(),
        }
    }

    /// Object namespace
    pub fn namespace(&self) -> Option<String> {
        match self {
            Self::Secret(o) => o.namespace(),
            Self::ConfigMap(o) => o.namespace(),
            Self::PersistentVolumeClaim(o) => o.namespace(),
            Self::Deployment(o) => o.namespace(),
            Self::Service(o) => o.namespace(),
            Self::Route(o) => o.namespace(),
        }
    }

    /// API resource used to address this kind dynamically
    pub fn api_resource(&self) -> ApiResource {
        match self {
            Self::Secret(_) => ApiResource::erase::<Secret>(&()),
            Self::ConfigMap(_) => ApiResource::erase::<ConfigMap>(&()),
            Self::PersistentVolumeClaim(_) => ApiResource::erase::<PersistentVolumeClaim>(&()),
            Self::Deployment(_) => ApiResource::erase::<Deployment>(&()),
            Self::Service(_) => ApiResource::erase::<Service>(&()),
            Self::Route(_) => ApiResource::erase::<Route>(&()),
        }
    }

    /// Full manifest including apiVersion and kind
    pub fn to_json(&self) -> Result<Value, Error> {
        let value = match self {
            Self::Secret(o) => serde_json::to_value(o),
            Self::ConfigMap(o) => serde_json::to_value(o),
            Self::PersistentVolumeClaim(o) => serde_json::to_value(o),
            Self::Deployment(o) => serde_json::to_value(o),
            Self::Service(o) => serde_json::to_value(o),
            Self::Route(o) => serde_json::to_value(o),
        };
        value.map_err(|e| Error::serialization_for_kind(self.kind(), e.to_string()))
    }

    /// Merge-patch body covering only the fields the generator owns.
    ///
    /// Selectors and owner references cannot change after creation and are
    /// left out. Of a claim's spec only the storage request can change.
    pub fn owned_fields(&self) -> Result<Value, Error> {
        let full = self.to_json()?;
        let mut patch = Map::new();

        let mut metadata = Map::new();
        for key in ["labels", "annotations"] {
            if let Some(value) = full.get("metadata").and_then(|m| m.get(key)) {
                metadata.insert(key.to_string(), value.clone());
            }
        }
        patch.insert("metadata".to_string(), Value::Object(metadata));

        if let Some(data) = full.get("data") {
            patch.insert("data".to_string(), data.clone());
        }

        if let Some(Value::Object(spec)) = full.get("spec") {
            let mut spec = spec.clone();
            spec.remove("selector");
            if matches!(self, Self::PersistentVolumeClaim(_)) {
                spec.retain(|key, _| key == "resources");
            }
            patch.insert("spec".to_string(), Value::Object(spec));
        }

        Ok(Value::Object(patch))
    }
}

// =============================================================================
// Service groups
// =============================================================================

/// The three tiers, in convergence order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupName {
    /// Events database and backend
    Events,
    /// API gateway in front of events
    Gateway,
    /// Web frontend
    Frontend,
}

impl std::fmt::Display for GroupName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Events => write!(f, "events"),
            Self::Gateway => write!(f, "gateway"),
            Self::Frontend => write!(f, "frontend"),
        }
    }
}

/// Ordered bundle of managed objects for one tier
#[derive(Clone, Debug)]
pub struct ServiceGroup {
    /// Which tier
    pub name: GroupName,
    /// Objects in convergence order
    pub resources: Vec<ManagedResource>,
}

/// All service groups for the AppService described by `ctx`, in order
pub fn service_groups(ctx: &TemplateContext) -> Vec<ServiceGroup> {
    vec![events_group(ctx), gateway_group(ctx), frontend_group(ctx)]
}

/// Database credentials, scripts, storage and workload, then the events backend
pub fn events_group(ctx: &TemplateContext) -> ServiceGroup {
    let secret = database_secret(ctx, EVENTS_DATABASE, &DatabaseCredentials::default());
    let scripts = scripts_config_map(ctx, EVENTS_DATABASE_SCRIPTS, ctx.script.as_ref());
    let claim = persistent_volume_claim(ctx, EVENTS_DATABASE, DATABASE_STORAGE);

    let database = database_deployment(
        ctx,
        EVENTS_DATABASE,
        &DatabaseRefs {
            secret: secret.name_any(),
            scripts: scripts.name_any(),
            claim: claim.name_any(),
        },
    );
    let database_service = service(ctx, EVENTS_DATABASE, &[("postgresql", DATABASE_PORT)]);

    let events = events_deployment(
        ctx,
        EVENTS,
        &EventsRefs {
            secret: secret.name_any(),
            database_service: database_service.name_any(),
            database_port: DATABASE_PORT,
        },
    );
    let events_service = service(ctx, EVENTS, &[("http", HTTP_PORT)]);
    let events_route = route(ctx, EVENTS, &events_service.name_any(), HTTP_PORT);

    ServiceGroup {
        name: GroupName::Events,
        resources: vec![
            ManagedResource::Secret(secret),
            ManagedResource::ConfigMap(scripts),
            ManagedResource::PersistentVolumeClaim(claim),
            ManagedResource::Deployment(database),
            ManagedResource::Service(database_service),
            ManagedResource::Deployment(events),
            ManagedResource::Service(events_service),
            ManagedResource::Route(events_route),
        ],
    }
}

fn node_group(
    ctx: &TemplateContext,
    group: GroupName,
    name: &str,
    image: &str,
    env_prefix: &str,
    upstream: &str,
) -> ServiceGroup {
    let workload = node_workload(
        name,
        image,
        env_prefix,
        &Upstream {
            service: upstream.to_string(),
            port: HTTP_PORT,
        },
    );
    let svc = service(ctx, name, &[("http", HTTP_PORT)]);
    let exposed = route(ctx, name, &svc.name_any(), HTTP_PORT);

    ServiceGroup {
        name: group,
        resources: vec![
            ManagedResource::Deployment(web_deployment(ctx, &workload)),
            ManagedResource::Service(svc),
            ManagedResource::Route(exposed),
        ],
    }
}

/// Gateway calling the events backend
pub fn gateway_group(ctx: &TemplateContext) -> ServiceGroup {
    node_group(ctx, GroupName::Gateway, GATEWAY, GATEWAY_IMAGE, "EVENTS_API", EVENTS)
}

/// Frontend calling the gateway
pub fn frontend_group(ctx: &TemplateContext) -> ServiceGroup {
    node_group(
        ctx,
        GroupName::Frontend,
        FRONTEND,
        FRONTEND_IMAGE,
        "GATEWAY_API",
        GATEWAY,
    )
}

/// Label selector matching the events database pods
pub fn database_pod_selector() -> String {
    format!("{}={}", template::COMPONENT_LABEL, EVENTS_DATABASE)
}
