//! Operator configuration from flags and environment

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args, ValueEnum};

use crate::migration::MigrationSettings;

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Settings for the controller process
#[derive(Args, Clone, Debug)]
pub struct OperatorConfig {
    /// Only watch this namespace (all namespaces when empty)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    pub namespace: String,

    /// Directory containing `db/<script>`
    #[arg(long, env = "DB_SCRIPTS_BASE_DIR", default_value = "/")]
    pub scripts_dir: PathBuf,

    /// Upper bound for the migration exec
    #[arg(long, env = "EXEC_TIMEOUT_SECS", default_value_t = 30)]
    pub exec_timeout_secs: u64,

    /// Delay before re-checking a database that is not ready yet
    #[arg(long, env = "MIGRATION_REQUEUE_SECS", default_value_t = 10)]
    pub migration_requeue_secs: u64,

    /// Maximum number of AppServices reconciled in parallel
    #[arg(long, env = "RECONCILE_CONCURRENCY", default_value_t = 4)]
    pub concurrency: u16,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Apply the AppService CRD with server-side apply on startup
    #[arg(long, env = "INSTALL_CRD", default_value_t = true, action = ArgAction::Set)]
    pub install_crd: bool,

    /// Path to a kubeconfig; in-cluster or default config otherwise
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,
}

impl OperatorConfig {
    /// Namespace to watch, `None` for the whole cluster
    pub fn watch_namespace(&self) -> Option<&str> {
        let ns = self.namespace.trim();
        (!ns.is_empty()).then_some(ns)
    }

    /// Migration exec settings derived from the flags
    pub fn migration_settings(&self) -> MigrationSettings {
        MigrationSettings {
            timeout: Duration::from_secs(self.exec_timeout_secs),
            ..Default::default()
        }
    }

    /// Requeue delay while waiting on the database
    pub fn migration_requeue(&self) -> Duration {
        Duration::from_secs(self.migration_requeue_secs)
    }
}
