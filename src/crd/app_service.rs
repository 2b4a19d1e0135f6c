//! AppService Custom Resource Definition
//!
//! An AppService declares one instance of the Gramola application: the
//! events database and backend, the gateway, and the frontend. The
//! controller owns everything it creates on behalf of an AppService.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use crate::Error;

/// Specification for an AppService
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "gramola.redhat.com",
    version = "v1alpha1",
    kind = "AppService",
    plural = "appservices",
    shortname = "as",
    status = "AppServiceStatus",
    namespaced,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.reconcileStatus.status"}"#,
    printcolumn = r#"{"name":"Migration","type":"string","jsonPath":".status.migrationStatus"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AppServiceSpec {
    /// Disabled AppServices are ignored by the controller
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Set by the controller on first admission
    #[serde(default)]
    pub initialized: bool,

    /// Cosmetic flavour of the application (Gramola or Gramophone)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl Default for AppServiceSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            initialized: false,
            alias: None,
        }
    }
}

impl AppServiceSpec {
    /// Parse the alias, treating an empty string the same as unset.
    pub fn parsed_alias(&self) -> Result<Option<Alias>, String> {
        match self.alias.as_deref() {
            None | Some("") => Ok(None),
            Some(raw) => raw.parse().map(Some),
        }
    }

    /// Validate the spec for the AppService called `name`
    pub fn validate(&self, name: &str) -> Result<(), Error> {
        self.parsed_alias()
            .map(|_| ())
            .map_err(|msg| Error::validation_for_field(name, "spec.alias", msg))
    }
}

/// Accepted values of `spec.alias`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Alias {
    /// The default flavour
    Gramola,
    /// Alternative branding
    Gramophone,
}

impl std::str::FromStr for Alias {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Gramola" => Ok(Self::Gramola),
            "Gramophone" => Ok(Self::Gramophone),
            other => Err(format!(
                "alias '{other}' is not supported, expected one of: Gramola, Gramophone"
            )),
        }
    }
}

impl std::fmt::Display for Alias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gramola => write!(f, "Gramola"),
            Self::Gramophone => write!(f, "Gramophone"),
        }
    }
}

// =============================================================================
// Status
// =============================================================================

/// Outcome recorded for the last reconcile pass
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ReconcileState {
    /// The pass converged everything
    True,
    /// The pass completed without converging
    False,
    /// The pass failed
    Failed,
    /// No pass has completed yet
    #[default]
    Unknown,
}

impl std::fmt::Display for ReconcileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Failed => write!(f, "Failed"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Last reconcile outcome
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileStatus {
    /// Outcome of the pass
    pub status: ReconcileState,

    /// When the outcome was recorded; never moves backwards
    pub last_update: DateTime<Utc>,

    /// Error text for failed passes, empty otherwise
    #[serde(default)]
    pub reason: String,

    /// Delay requested after the last failure.
    ///
    /// Serialized as `null` when unset so a merge patch clears it.
    #[serde(default)]
    pub retry_after_seconds: Option<u64>,
}

/// Sticky state of the one-time database migration
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MigrationStatus {
    /// The script ran without error output
    Succeeded,
    /// The last attempt reported errors
    Failed,
    /// Not attempted yet
    #[default]
    Unknown,
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// One entry of the migration audit trail
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRun {
    /// Script that was executed
    pub script_name: String,
    /// Result of that execution
    pub status: MigrationStatus,
}

/// What the last successful pass ended with
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum LastAction {
    /// The migration script was executed in this pass
    MigrationStarted,
    /// The pass asked to be re-run (database not ready yet)
    RequeueEvent,
    /// Nothing beyond convergence happened
    NoAction,
}

/// Status for an AppService
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppServiceStatus {
    /// Outcome of the last reconcile pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconcile_status: Option<ReconcileStatus>,

    /// Sticky migration state
    #[serde(default)]
    pub migration_status: MigrationStatus,

    /// Append-only record of migration attempts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub migration_runs: Vec<MigrationRun>,

    /// What the last successful pass ended with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_action: Option<LastAction>,

    /// Conditions keyed by type
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl AppServiceStatus {
    /// Record a migration attempt for `script`.
    ///
    /// The audit trail always grows. `migration_status` never leaves
    /// `Succeeded` once it got there.
    pub fn record_migration(&mut self, script: &str, outcome: MigrationStatus) {
        self.migration_runs.push(MigrationRun {
            script_name: script.to_string(),
            status: outcome,
        });
        if self.migration_status != MigrationStatus::Succeeded {
            self.migration_status = outcome;
        }
    }
}

impl AppService {
    /// Current migration state, `Unknown` when no status was written yet
    pub fn migration_status(&self) -> MigrationStatus {
        self.status
            .as_ref()
            .map(|s| s.migration_status)
            .unwrap_or_default()
    }

    /// Mutable status, created on first use
    pub fn status_mut(&mut self) -> &mut AppServiceStatus {
        self.status.get_or_insert_with(AppServiceStatus::default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    fn spec_with_alias(alias: Option<&str>) -> AppServiceSpec {
        AppServiceSpec {
            alias: alias.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn unset_and_empty_alias_are_valid() {
        assert!(spec_with_alias(None).validate("gramola").is_ok());
        assert!(spec_with_alias(Some("")).validate("gramola").is_ok());
    }

    #[test]
    fn known_aliases_are_valid() {
        assert_eq!(
            spec_with_alias(Some("Gramola")).parsed_alias(),
            Ok(Some(Alias::Gramola))
        );
        assert_eq!(
            spec_with_alias(Some("Gramophone")).parsed_alias(),
            Ok(Some(Alias::Gramophone))
        );
    }

    #[test]
    fn unknown_alias_is_rejected_with_alias_message() {
        let err = spec_with_alias(Some("Unsupported"))
            .validate("gramola")
            .expect_err("alias should be rejected");

        let msg = err.to_string();
        assert!(msg.contains("alias"), "{msg}");
        assert!(msg.contains("Unsupported"), "{msg}");
    }

    #[test]
    fn spec_defaults_to_enabled_when_field_is_absent() {
        let spec: AppServiceSpec = serde_json::from_str("{}").expect("parse");
        assert!(spec.enabled);
        assert!(!spec.initialized);
    }

    #[test]
    fn invalid_alias_still_deserializes() {
        let spec: AppServiceSpec =
            serde_json::from_str(r#"{"alias":"Unsupported"}"#).expect("parse");
        assert_eq!(spec.alias.as_deref(), Some("Unsupported"));
    }

    #[test]
    fn record_migration_never_regresses_from_succeeded() {
        let mut status = AppServiceStatus::default();
        status.record_migration("v1.sql", MigrationStatus::Failed);
        status.record_migration("v1.sql", MigrationStatus::Succeeded);
        status.record_migration("v1.sql", MigrationStatus::Failed);

        assert_eq!(status.migration_status, MigrationStatus::Succeeded);
        assert_eq!(status.migration_runs.len(), 3);
    }

    #[test]
    fn status_uses_camel_case_wire_names() {
        let mut status = AppServiceStatus {
            last_action: Some(LastAction::MigrationStarted),
            ..Default::default()
        };
        status.record_migration("v1.sql", MigrationStatus::Succeeded);

        let json = serde_json::to_value(&status).expect("serialize");
        assert_eq!(json["migrationStatus"], "Succeeded");
        assert_eq!(json["migrationRuns"][0]["scriptName"], "v1.sql");
        assert_eq!(json["lastAction"], "MigrationStarted");
    }

    #[test]
    fn crd_is_namespaced_with_status_subresource() {
        let crd = AppService::crd();
        assert_eq!(crd.spec.group, "gramola.redhat.com");
        assert_eq!(crd.spec.scope, "Namespaced");
        let version = &crd.spec.versions[0];
        assert!(version
            .subresources
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .is_some());
    }
}
