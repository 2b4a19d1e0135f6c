//! Stories about a single AppService on a real API server

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, PostParams};
use kube::runtime::controller::Action;
use kube::Client;

use gramola_operator::controller::{reconcile, Context};
use gramola_operator::crd::{AppService, AppServiceSpec, LastAction, ReconcileState};
use gramola_operator::migration::{MigrationScript, MigrationSettings, SCRIPT_NAME};

use super::helpers::{cleanup_namespace, ensure_namespace, ensure_test_cluster};

const APP: &str = "gramola";

async fn setup(namespace: &str, spec: AppServiceSpec) -> (Client, Api<AppService>, Arc<Context>) {
    let client = ensure_test_cluster().await.expect("failed to setup cluster");
    ensure_namespace(&client, namespace)
        .await
        .expect("failed to create namespace");

    let api: Api<AppService> = Api::namespaced(client.clone(), namespace);
    api.create(&PostParams::default(), &AppService::new(APP, spec))
        .await
        .expect("failed to create AppService");

    let ctx = Arc::new(Context::from_client(
        client.clone(),
        MigrationSettings::default(),
        Some(MigrationScript::new(SCRIPT_NAME, "SELECT 1;")),
        Duration::from_secs(1),
    ));
    (client, api, ctx)
}

async fn pass(api: &Api<AppService>, ctx: &Arc<Context>) -> Action {
    let app = api.get(APP).await.expect("AppService should exist");
    reconcile(Arc::new(app), ctx.clone())
        .await
        .expect("reconcile should not error")
}

/// Story: a new AppService is initialized, then its whole topology appears
///
/// The database image is not pullable outside OpenShift, so the pass ends
/// waiting on the database rather than migrating.
#[tokio::test]
#[ignore = "requires a cluster - run with: cargo test --test kind -- --ignored"]
async fn story_new_app_service_gets_its_topology() {
    let namespace = "gramola-it-lifecycle";
    let (client, api, ctx) = setup(namespace, AppServiceSpec::default()).await;

    assert_eq!(pass(&api, &ctx).await, Action::await_change());
    let app = api.get(APP).await.expect("get");
    assert!(app.spec.initialized);

    assert_eq!(
        pass(&api, &ctx).await,
        Action::requeue(Duration::from_secs(1))
    );

    let status = api.get(APP).await.expect("get").status.expect("status");
    let reconcile_status = status.reconcile_status.expect("reconcile status");
    assert_eq!(reconcile_status.status, ReconcileState::True);
    assert_eq!(status.last_action, Some(LastAction::RequeueEvent));

    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    for name in ["events-database", "events", "gateway", "frontend"] {
        let deployment = deployments.get(name).await.expect("deployment exists");
        let owner = deployment
            .metadata
            .owner_references
            .and_then(|refs| refs.into_iter().next())
            .expect("owner reference");
        assert_eq!(owner.kind, "AppService");
    }
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    assert!(secrets.get_opt("events-database").await.expect("get").is_some());
    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    let scripts = config_maps
        .get("events-database-scripts")
        .await
        .expect("scripts ConfigMap");
    assert!(scripts.data.expect("data").contains_key(SCRIPT_NAME));

    // A third pass finds everything in place
    assert_eq!(
        pass(&api, &ctx).await,
        Action::requeue(Duration::from_secs(1))
    );

    cleanup_namespace(&client, namespace).await;
}

/// Story: a typo in the alias is reported on the resource
#[tokio::test]
#[ignore = "requires a cluster - run with: cargo test --test kind -- --ignored"]
async fn story_unsupported_alias_is_reported_in_status() {
    let namespace = "gramola-it-alias";
    let spec = AppServiceSpec {
        initialized: true,
        alias: Some("Phonograph".to_string()),
        ..Default::default()
    };
    let (client, api, ctx) = setup(namespace, spec).await;

    assert_eq!(
        pass(&api, &ctx).await,
        Action::requeue(Duration::from_secs(1))
    );
    assert_eq!(
        pass(&api, &ctx).await,
        Action::requeue(Duration::from_secs(2))
    );

    let status = api.get(APP).await.expect("get").status.expect("status");
    let reconcile_status = status.reconcile_status.expect("reconcile status");
    assert_eq!(reconcile_status.status, ReconcileState::Failed);
    assert!(reconcile_status.reason.contains("Phonograph"));

    let deployments: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    assert!(deployments
        .get_opt("events")
        .await
        .expect("list")
        .is_none());

    cleanup_namespace(&client, namespace).await;
}
