//! Cluster setup shared by the integration tests

use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::runtime::wait::{await_condition, conditions};
use kube::{Client, CustomResourceExt};
use serde_json::json;

use gramola_operator::crd::AppService;

type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const FIELD_MANAGER: &str = "gramola-operator-tests";
const ROUTE_CRD: &str = "routes.route.openshift.io";

/// Connect to the current cluster and make sure both CRDs are established
pub async fn ensure_test_cluster() -> TestResult<Client> {
    let client = Client::try_default().await?;
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    crds.patch(
        AppService::crd_name(),
        &params,
        &Patch::Apply(&AppService::crd()),
    )
    .await?;
    crds.patch(ROUTE_CRD, &params, &Patch::Apply(&route_crd()?))
        .await?;

    for name in [AppService::crd_name(), ROUTE_CRD] {
        tokio::time::timeout(
            Duration::from_secs(30),
            await_condition(crds.clone(), name, conditions::is_crd_established()),
        )
        .await??;
    }
    Ok(client)
}

/// Stand-in for the OpenShift Route CRD on plain clusters
fn route_crd() -> TestResult<CustomResourceDefinition> {
    Ok(serde_json::from_value(json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "CustomResourceDefinition",
        "metadata": { "name": ROUTE_CRD },
        "spec": {
            "group": "route.openshift.io",
            "scope": "Namespaced",
            "names": { "kind": "Route", "plural": "routes", "singular": "route" },
            "versions": [{
                "name": "v1",
                "served": true,
                "storage": true,
                "schema": {
                    "openAPIV3Schema": {
                        "type": "object",
                        "x-kubernetes-preserve-unknown-fields": true
                    }
                }
            }]
        }
    }))?)
}

/// Create `name` if it does not exist yet
pub async fn ensure_namespace(client: &Client, name: &str) -> TestResult<()> {
    let api: Api<Namespace> = Api::all(client.clone());
    let ns: Namespace = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": { "name": name }
    }))?;
    api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(&ns))
        .await?;
    Ok(())
}

/// Delete the namespace; owned objects go with it
pub async fn cleanup_namespace(client: &Client, name: &str) {
    let api: Api<Namespace> = Api::all(client.clone());
    let _ = api.delete(name, &DeleteParams::default()).await;
}
