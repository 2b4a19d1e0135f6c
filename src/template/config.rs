//! Credentials and configuration objects

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::ByteString;

use super::TemplateContext;
use crate::migration::MigrationScript;

/// Secret keys the database and the events service read
pub const DATABASE_NAME_KEY: &str = "database-name";
/// Secret key holding the database user
pub const DATABASE_USER_KEY: &str = "database-user";
/// Secret key holding the database password
pub const DATABASE_PASSWORD_KEY: &str = "database-password";

/// Credentials stored in the events database Secret
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseCredentials {
    /// Database name
    pub database: String,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
}

impl Default for DatabaseCredentials {
    fn default() -> Self {
        Self {
            database: "eventsdb".to_string(),
            user: "luke".to_string(),
            password: "secret".to_string(),
        }
    }
}

/// Opaque Secret holding the database credentials.
///
/// `data` is used rather than `stringData` so the desired object compares
/// directly against what the API server returns.
pub fn database_secret(
    ctx: &TemplateContext,
    name: &str,
    credentials: &DatabaseCredentials,
) -> Secret {
    let data = BTreeMap::from([
        (
            DATABASE_NAME_KEY.to_string(),
            ByteString(credentials.database.clone().into_bytes()),
        ),
        (
            DATABASE_PASSWORD_KEY.to_string(),
            ByteString(credentials.password.clone().into_bytes()),
        ),
        (
            DATABASE_USER_KEY.to_string(),
            ByteString(credentials.user.clone().into_bytes()),
        ),
    ]);

    Secret {
        metadata: ctx.metadata(name, &ctx.labels(name), BTreeMap::new()),
        data: Some(data),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

/// ConfigMap carrying the migration script, keyed by its file name.
///
/// Without a script the ConfigMap is still created so the database
/// Deployment can mount it. It then has no `data` at all, since the API
/// server drops empty maps on write.
pub fn scripts_config_map(
    ctx: &TemplateContext,
    name: &str,
    script: Option<&MigrationScript>,
) -> ConfigMap {
    let data: BTreeMap<String, String> = script
        .map(|s| BTreeMap::from([(s.name.clone(), s.body.clone())]))
        .unwrap_or_default();

    ConfigMap {
        metadata: ctx.metadata(name, &ctx.labels(name), BTreeMap::new()),
        data: (!data.is_empty()).then_some(data),
        ..Default::default()
    }
}
