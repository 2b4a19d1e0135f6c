//! Gramola operator - keeps Gramola application instances converged

use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::{future, StreamExt, TryStreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::{self, Controller};
use kube::runtime::{predicates, reflector, watcher, WatchStreamExt};
use kube::{Api, Client, CustomResourceExt};
use tracing::{debug, info, warn};

use gramola_operator::config::OperatorConfig;
use gramola_operator::controller::{
    app_service_for_pod, error_policy, is_enabled, pod_readiness_fingerprint,
    pod_triggers_migration, reconcile, Context,
};
use gramola_operator::crd::AppService;
use gramola_operator::kube_utils::create_client;
use gramola_operator::migration::MigrationScript;
use gramola_operator::template::DatabaseCredentials;
use gramola_operator::topology::database_pod_selector;
use gramola_operator::{telemetry, OPERATOR_NAME};

/// Gramola operator - converges the Gramola application from AppService resources
#[derive(Parser, Debug)]
#[command(name = "gramola-operator", version, about, long_about = None)]
struct Cli {
    /// Print the AppService CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    config: OperatorConfig,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the AppService controller (default mode)
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&AppService::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    telemetry::init_logging(cli.config.log_format)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    match cli.command {
        Some(Commands::Run) | None => run_controller(cli.config).await,
    }
}

/// Run the AppService controller until a shutdown signal arrives
async fn run_controller(config: OperatorConfig) -> anyhow::Result<()> {
    let client = create_client(config.kubeconfig.as_deref()).await?;

    if config.install_crd {
        ensure_crd_installed(&client).await?;
    }

    let db_user = DatabaseCredentials::default().user;
    let script = match MigrationScript::load(&config.scripts_dir, &db_user).await {
        Ok(script) => {
            info!(script = %script.name, "loaded migration script");
            Some(script)
        }
        Err(e) => {
            warn!(error = %e, "migration script unavailable, scripts ConfigMap will be empty");
            None
        }
    };

    let (app_services, deployments, pods): (Api<AppService>, Api<Deployment>, Api<Pod>) =
        match config.watch_namespace() {
            Some(ns) => {
                info!(namespace = ns, "watching a single namespace");
                (
                    Api::namespaced(client.clone(), ns),
                    Api::namespaced(client.clone(), ns),
                    Api::namespaced(client.clone(), ns),
                )
            }
            None => {
                info!("watching all namespaces");
                (
                    Api::all(client.clone()),
                    Api::all(client.clone()),
                    Api::all(client.clone()),
                )
            }
        };

    // Only spec changes of enabled AppServices start a pass; status writes do not
    let (reader, writer) = reflector::store();
    let app_stream = reflector(writer, watcher(app_services, watcher::Config::default()))
        .touched_objects()
        .default_backoff()
        .try_filter(|app| future::ready(is_enabled(app)))
        .predicate_filter(predicates::generation);

    // Database pods unblock a pending migration when they become ready
    let pod_stream = watcher(
        pods,
        watcher::Config::default().labels(&database_pod_selector()),
    )
    .touched_objects()
    .default_backoff()
    .try_filter(|pod| future::ready(pod_triggers_migration(pod)))
    .predicate_filter(pod_readiness_fingerprint);

    let ctx = Arc::new(Context::from_client(
        client,
        config.migration_settings(),
        script,
        config.migration_requeue(),
    ));

    info!(concurrency = config.concurrency, "starting AppService controller");
    Controller::for_stream(app_stream, reader)
        .owns(deployments, watcher::Config::default())
        .watches_stream(pod_stream, |pod| app_service_for_pod(&pod))
        .with_config(controller::Config::default().concurrency(config.concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => debug!(app_service = %obj.name, ?action, "reconciled"),
                Err(e) => warn!(error = %e, "controller error"),
            }
        })
        .await;

    info!("AppService controller stopped");
    Ok(())
}

/// Ensure the AppService CRD is installed
///
/// Applied with server-side apply on every start so the installed schema
/// always matches the operator version.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(OPERATOR_NAME).force();

    info!("Installing AppService CRD...");
    crds.patch(AppService::crd_name(), &params, &Patch::Apply(&AppService::crd()))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install AppService CRD: {}", e))?;

    info!("AppService CRD installed/updated");
    Ok(())
}
