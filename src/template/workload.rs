//! Deployments for the database and the three application tiers

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource, ExecAction,
    HTTPGetAction, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, SecretKeySelector, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::config::{DATABASE_NAME_KEY, DATABASE_PASSWORD_KEY, DATABASE_USER_KEY};
use super::{workload_annotations, AppLabels, TemplateContext, RUNTIME_LABEL};

/// Database image shipped with OpenShift
pub const DATABASE_IMAGE: &str = "image-registry.openshift-image-registry.svc:5000/openshift/postgresql:10";
/// Name of the database container, checked by the migration readiness filter
pub const DATABASE_CONTAINER: &str = "postgresql";
/// Port PostgreSQL listens on
pub const DATABASE_PORT: i32 = 5432;
/// Where the scripts ConfigMap is mounted in the database container
pub const SCRIPTS_MOUNT_PATH: &str = "/operator/scripts";
const DATA_MOUNT_PATH: &str = "/var/lib/pgsql/data";

/// Events backend image built in-cluster
pub const EVENTS_IMAGE: &str =
    "image-registry.openshift-image-registry.svc:5000/gramola-operator-project/events-s2i";
/// Gateway image
pub const GATEWAY_IMAGE: &str = "quay.io/cvicensa/gramola-gateway:0.0.2";
/// Frontend image
pub const FRONTEND_IMAGE: &str = "quay.io/cvicensa/gramola-frontend:0.0.2";
/// HTTP port every application tier listens on
pub const HTTP_PORT: i32 = 8080;

/// Objects the database Deployment mounts or reads
#[derive(Clone, Debug)]
pub struct DatabaseRefs {
    /// Secret with the database credentials
    pub secret: String,
    /// ConfigMap with the migration scripts
    pub scripts: String,
    /// Claim backing the data directory
    pub claim: String,
}

/// Objects the events Deployment depends on
#[derive(Clone, Debug)]
pub struct EventsRefs {
    /// Secret with the database credentials
    pub secret: String,
    /// Service fronting the database
    pub database_service: String,
    /// Port of that Service
    pub database_port: i32,
}

/// Upstream service an application tier calls
#[derive(Clone, Debug)]
pub struct Upstream {
    /// Service name
    pub service: String,
    /// Service port
    pub port: i32,
}

/// Shape of a stateless HTTP tier
#[derive(Clone, Debug)]
pub struct WebWorkload {
    /// Deployment and container name
    pub name: String,
    /// Container image
    pub image: String,
    /// Value of `app.kubernetes.io/name` (java, nodejs)
    pub runtime: String,
    /// Environment variables, in order
    pub env: Vec<EnvVar>,
    /// Path served for readiness and liveness
    pub probe_path: String,
    /// Memory request
    pub memory_request: String,
    /// Memory limit
    pub memory_limit: String,
    /// Service this tier talks to, drawn as a topology edge
    pub connects_to: Option<String>,
}

fn plain_env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn memory(request: &str, limit: &str) -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(BTreeMap::from([(
            "memory".to_string(),
            Quantity(request.to_string()),
        )])),
        limits: Some(BTreeMap::from([(
            "memory".to_string(),
            Quantity(limit.to_string()),
        )])),
        ..Default::default()
    }
}

fn http_probe(path: &str, initial_delay: i32, failure_threshold: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(HTTP_PORT),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(10),
        success_threshold: Some(1),
        timeout_seconds: Some(1),
        failure_threshold: Some(failure_threshold),
        ..Default::default()
    }
}

fn exec_probe(command: &[&str], initial_delay: i32, timeout: i32) -> Probe {
    Probe {
        exec: Some(ExecAction {
            command: Some(command.iter().map(|c| c.to_string()).collect()),
        }),
        initial_delay_seconds: Some(initial_delay),
        failure_threshold: Some(3),
        timeout_seconds: Some(timeout),
        ..Default::default()
    }
}

fn deployment(
    ctx: &TemplateContext,
    name: &str,
    labels: &AppLabels,
    annotations: BTreeMap<String, String>,
    strategy: &str,
    pod: PodSpec,
) -> Deployment {
    Deployment {
        metadata: ctx.metadata(name, labels, annotations),
        spec: Some(DeploymentSpec {
            selector: LabelSelector {
                match_labels: Some(labels.selector()),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some(strategy.to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.to_map()),
                    ..Default::default()
                }),
                spec: Some(pod),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// PostgreSQL Deployment backed by the claim, with the scripts mounted
pub fn database_deployment(ctx: &TemplateContext, name: &str, refs: &DatabaseRefs) -> Deployment {
    let labels = ctx.labels(name).with(RUNTIME_LABEL, "postgresql");
    let data_volume = format!("{name}-data");
    let scripts_volume = format!("{name}-scripts");

    let container = Container {
        name: DATABASE_CONTAINER.to_string(),
        image: Some(DATABASE_IMAGE.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ports: Some(vec![ContainerPort {
            name: Some("postgresql".to_string()),
            container_port: DATABASE_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: Some(vec![
            secret_env("POSTGRESQL_USER", &refs.secret, DATABASE_USER_KEY),
            secret_env("POSTGRESQL_PASSWORD", &refs.secret, DATABASE_PASSWORD_KEY),
            secret_env("POSTGRESQL_DATABASE", &refs.secret, DATABASE_NAME_KEY),
        ]),
        resources: Some(memory("512Mi", "512Mi")),
        readiness_probe: Some(exec_probe(&["/usr/libexec/check-container"], 5, 1)),
        liveness_probe: Some(exec_probe(
            &["/usr/libexec/check-container", "--live"],
            120,
            10,
        )),
        volume_mounts: Some(vec![
            VolumeMount {
                name: data_volume.clone(),
                mount_path: DATA_MOUNT_PATH.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: scripts_volume.clone(),
                mount_path: SCRIPTS_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    let pod = PodSpec {
        containers: vec![container],
        volumes: Some(vec![
            Volume {
                name: data_volume,
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: refs.claim.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Volume {
                name: scripts_volume,
                config_map: Some(ConfigMapVolumeSource {
                    name: refs.scripts.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    // Recreate: two pods must never share the RWO data volume
    deployment(ctx, name, &labels, BTreeMap::new(), "Recreate", pod)
}

/// Stateless HTTP tier on port 8080
pub fn web_deployment(ctx: &TemplateContext, workload: &WebWorkload) -> Deployment {
    let name = workload.name.as_str();
    let labels = ctx.labels(name).with(RUNTIME_LABEL, workload.runtime.as_str());
    let annotations = workload_annotations(workload.connects_to.as_deref());

    let container = Container {
        name: name.to_string(),
        image: Some(workload.image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ports: Some(vec![ContainerPort {
            name: Some("http".to_string()),
            container_port: HTTP_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: Some(workload.env.clone()),
        resources: Some(memory(&workload.memory_request, &workload.memory_limit)),
        readiness_probe: Some(http_probe(&workload.probe_path, 60, 5)),
        liveness_probe: Some(http_probe(&workload.probe_path, 120, 3)),
        ..Default::default()
    };

    let pod = PodSpec {
        containers: vec![container],
        ..Default::default()
    };

    deployment(ctx, name, &labels, annotations, "RollingUpdate", pod)
}

/// Java events backend reading its database settings from the Secret
pub fn events_deployment(ctx: &TemplateContext, name: &str, refs: &EventsRefs) -> Deployment {
    web_deployment(
        ctx,
        &WebWorkload {
            name: name.to_string(),
            image: EVENTS_IMAGE.to_string(),
            runtime: "java".to_string(),
            env: vec![
                secret_env("DB_USERNAME", &refs.secret, DATABASE_USER_KEY),
                secret_env("DB_PASSWORD", &refs.secret, DATABASE_PASSWORD_KEY),
                secret_env("DB_NAME", &refs.secret, DATABASE_NAME_KEY),
                plain_env("DB_SERVICE_NAME", refs.database_service.as_str()),
                plain_env("DB_SERVICE_PORT", refs.database_port.to_string()),
                plain_env("JAVA_OPTIONS", "-Dspring.profiles.active=openshift"),
            ],
            probe_path: "/api/events".to_string(),
            memory_request: "512Mi".to_string(),
            memory_limit: "512Mi".to_string(),
            connects_to: Some(refs.database_service.clone()),
        },
    )
}

/// Node.js tier (gateway or frontend) calling `upstream`
pub fn node_workload(name: &str, image: &str, env_prefix: &str, upstream: &Upstream) -> WebWorkload {
    WebWorkload {
        name: name.to_string(),
        image: image.to_string(),
        runtime: "nodejs".to_string(),
        env: vec![
            plain_env("NODE_ENV", "production"),
            plain_env(&format!("{env_prefix}_HOST"), upstream.service.as_str()),
            plain_env(&format!("{env_prefix}_PORT"), upstream.port.to_string()),
        ],
        probe_path: "/api/health".to_string(),
        memory_request: "200Mi".to_string(),
        memory_limit: "256Mi".to_string(),
        connects_to: Some(upstream.service.clone()),
    }
}
