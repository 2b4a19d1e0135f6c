//! Services and OpenShift Routes

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

use super::TemplateContext;

/// OpenShift Route, `route.openshift.io/v1`.
///
/// Only the fields the operator sets are modelled. The CRD is installed by
/// OpenShift itself, so no schema is generated.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "route.openshift.io",
    version = "v1",
    kind = "Route",
    namespaced,
    derive = "PartialEq",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    /// Host assigned by the router when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Backend the route sends traffic to
    pub to: RouteTargetReference,

    /// Target port on the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<RoutePort>,
}

/// Backend of a Route
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteTargetReference {
    /// Always "Service"
    pub kind: String,
    /// Service name
    pub name: String,
}

/// Port of a Route backend
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoutePort {
    /// Port number or name on the Service
    pub target_port: IntOrString,
}

/// ClusterIP Service selecting the pods of `name`, one TCP port per entry
pub fn service(ctx: &TemplateContext, name: &str, ports: &[(&str, i32)]) -> Service {
    let labels = ctx.labels(name);

    Service {
        metadata: ctx.metadata(name, &labels, BTreeMap::new()),
        spec: Some(ServiceSpec {
            selector: Some(labels.selector()),
            ports: Some(
                ports
                    .iter()
                    .map(|(port_name, port)| ServicePort {
                        name: Some(port_name.to_string()),
                        port: *port,
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Route exposing `service` on `port`
pub fn route(ctx: &TemplateContext, name: &str, service: &str, port: i32) -> Route {
    let mut route = Route::new(
        name,
        RouteSpec {
            host: None,
            to: RouteTargetReference {
                kind: "Service".to_string(),
                name: service.to_string(),
            },
            port: Some(RoutePort {
                target_port: IntOrString::Int(port),
            }),
        },
    );
    route.metadata = ctx.metadata(name, &ctx.labels(name), BTreeMap::new());
    route
}
