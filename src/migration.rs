//! One-time database migration
//!
//! The events database ships an SQL script in its scripts ConfigMap. Once a
//! database replica is ready the script is run through `psql` inside that
//! replica. The executor itself does not remember anything; the caller
//! guards re-execution with the sticky `migrationStatus` field, and the
//! script is expected to tolerate running more than once.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams, ListParams};
use kube::{Client, ResourceExt};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::template::{DATABASE_CONTAINER, SCRIPTS_MOUNT_PATH};
use crate::topology::database_pod_selector;
use crate::Error;

/// File name of the bundled migration script
pub const SCRIPT_NAME: &str = "events-database-update-0.0.1.sql";
const USERNAME_PLACEHOLDER: &str = "{{DB_USERNAME}}";

/// Migration script shipped to the database through its ConfigMap
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationScript {
    /// File name, also the ConfigMap key
    pub name: String,
    /// SQL body
    pub body: String,
}

impl MigrationScript {
    /// Script with the given name and body
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
        }
    }

    /// Load `<base_dir>/db/<SCRIPT_NAME>` and substitute the database user
    pub async fn load(base_dir: &Path, db_user: &str) -> Result<Self, Error> {
        let path = base_dir.join("db").join(SCRIPT_NAME);
        let raw = tokio::fs::read_to_string(&path).await.map_err(|e| {
            Error::internal_with_context(
                "migration",
                format!("failed to read {}: {}", path.display(), e),
            )
        })?;
        Ok(Self::new(SCRIPT_NAME, raw.replace(USERNAME_PLACEHOLDER, db_user)))
    }
}

/// How the migration is executed
#[derive(Clone, Debug)]
pub struct MigrationSettings {
    /// Script file name inside the scripts mount
    pub script_name: String,
    /// Upper bound for the remote command
    pub timeout: Duration,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            script_name: SCRIPT_NAME.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl MigrationSettings {
    /// Command run inside the database container
    pub fn command(&self) -> Vec<String> {
        vec![
            "/bin/bash".to_string(),
            "-c".to_string(),
            format!(
                "psql -U $POSTGRESQL_USER $POSTGRESQL_DATABASE -f {}/{}",
                SCRIPTS_MOUNT_PATH, self.script_name
            ),
        ]
    }
}

/// Captured output of a remote command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Message of a non-`Success` exit status
    pub failure: Option<String>,
}

/// Result of a migration attempt that did not fail
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// No database replica is ready yet; try again later
    NotReady,
    /// The script ran cleanly
    Completed {
        /// Pod the script ran in
        pod: String,
        /// Captured standard output
        stdout: String,
    },
}

// =============================================================================
// Pod access
// =============================================================================

/// Pod listing and exec, mockable for tests
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatabasePods: Send + Sync {
    /// List pods in `namespace` matching the label `selector`
    async fn list(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error>;

    /// Run `command` in the database container of `pod`
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput, Error>;
}

/// Real implementation over the pods API
pub struct KubeDatabasePods {
    client: Client,
}

impl KubeDatabasePods {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

async fn read_stream<R: AsyncRead + Unpin>(
    pod: &str,
    stream: &str,
    reader: Option<R>,
) -> Result<String, Error> {
    let Some(mut reader) = reader else {
        return Ok(String::new());
    };
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await.map_err(|e| {
        Error::internal_with_context("exec", format!("reading {stream} of {pod} failed: {e}"))
    })?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Failure message of an exec exit status, `None` when it succeeded.
///
/// A session that closes without reporting a status counts as failed, since
/// nothing confirms the command ran to completion.
fn exit_failure(status: Option<Status>) -> Option<String> {
    let Some(status) = status else {
        return Some("exec session ended without an exit status".to_string());
    };
    if status.status.as_deref() == Some("Success") {
        return None;
    }
    Some(
        status
            .message
            .or(status.reason)
            .unwrap_or_else(|| "command exited with a failure status".to_string()),
    )
}

#[async_trait]
impl DatabasePods for KubeDatabasePods {
    async fn list(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| Error::from_kube("Pod", selector, e))?;
        Ok(pods.items)
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = AttachParams::default()
            .container(DATABASE_CONTAINER)
            .stdin(false)
            .stdout(true)
            .stderr(true);

        let mut attached = api
            .exec(pod, command, &params)
            .await
            .map_err(|e| Error::from_kube("Pod", pod, e))?;

        let status = attached.take_status();
        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let (stdout, stderr) = tokio::join!(
            read_stream(pod, "stdout", stdout),
            read_stream(pod, "stderr", stderr)
        );
        let (stdout, stderr) = (stdout?, stderr?);

        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        debug!(pod = %pod, ?status, "exec completed");
        attached.join().await.map_err(|e| {
            Error::internal_with_context("exec", format!("exec session in {pod} failed: {e}"))
        })?;

        Ok(ExecOutput {
            stdout,
            stderr,
            failure: exit_failure(status),
        })
    }
}

// =============================================================================
// Executor
// =============================================================================

/// Whether `pod` is running with its database container ready
pub fn is_ready_database(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .container_statuses
        .as_ref()
        .is_some_and(|statuses| {
            statuses
                .iter()
                .any(|c| c.name == DATABASE_CONTAINER && c.ready)
        })
}

/// Run the migration against the first ready database replica.
///
/// Returns [`MigrationOutcome::NotReady`] when no replica is ready. Error
/// output from the script is a failure even when the exec itself worked,
/// and so is a non-`Success` exit status.
pub async fn run(
    pods: &dyn DatabasePods,
    namespace: &str,
    settings: &MigrationSettings,
) -> Result<MigrationOutcome, Error> {
    let candidates = pods.list(namespace, &database_pod_selector()).await?;
    let Some(target) = candidates.iter().find(|p| is_ready_database(p)) else {
        debug!(candidates = candidates.len(), "no ready database replica yet");
        return Ok(MigrationOutcome::NotReady);
    };
    let pod = target.name_any();

    info!(pod = %pod, script = %settings.script_name, "running database migration");
    let output = tokio::time::timeout(
        settings.timeout,
        pods.exec(namespace, &pod, settings.command()),
    )
    .await
    .map_err(|_| Error::ExecTimeout {
        pod: pod.clone(),
        timeout_secs: settings.timeout.as_secs(),
    })??;

    let stderr = output.stderr.trim();
    if !stderr.is_empty() {
        warn!(pod = %pod, stderr, "migration script reported errors");
        return Err(Error::migration(pod, stderr));
    }
    if let Some(failure) = output.failure {
        warn!(pod = %pod, failure = %failure, "migration command failed");
        return Err(Error::migration(pod, failure));
    }

    Ok(MigrationOutcome::Completed {
        pod,
        stdout: output.stdout,
    })
}
