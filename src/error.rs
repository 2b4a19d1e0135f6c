//! Error types for the Gramola operator
//!
//! Errors are structured with fields to aid debugging in production. Store
//! failures are classified at the boundary where they leave `kube`, so the
//! reconciler can tell "already exists" apart from a write conflict or an
//! object the API server refuses outright.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error that was not classified further (transport, 5xx)
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Create was refused because the object is already present
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Resource kind (e.g. "Deployment")
        kind: String,
        /// Resource name
        name: String,
    },

    /// The object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind
        kind: String,
        /// Resource name
        name: String,
    },

    /// Optimistic concurrency conflict on write
    #[error("conflict writing {kind} {name}: {message}")]
    Conflict {
        /// Resource kind
        kind: String,
        /// Resource name
        name: String,
        /// Message reported by the API server
        message: String,
    },

    /// The API server rejected the object as malformed
    #[error("invalid {kind} {name}: {message}")]
    InvalidSpec {
        /// Resource kind
        kind: String,
        /// Resource name
        name: String,
        /// Message reported by the API server
        message: String,
    },

    /// Validation error for the AppService spec
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the AppService with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.alias")
        field: Option<String>,
    },

    /// The migration script ran but reported errors
    #[error("migration failed in pod {pod}: {message}")]
    Migration {
        /// Pod the script was executed in
        pod: String,
        /// Error output or transport failure description
        message: String,
    },

    /// Remote command did not finish in time
    #[error("exec in pod {pod} timed out after {timeout_secs}s")]
    ExecTimeout {
        /// Pod the command was executed in
        pod: String,
        /// Timeout that elapsed
        timeout_secs: u64,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "exec")
        context: String,
    },
}

/// Coarse failure classes used for status reporting and logging
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// The AppService spec is unacceptable
    Validation,
    /// Network failures, conflicts and other conditions expected to clear up
    TransientStore,
    /// The API server rejected a generated object
    PermanentSpec,
    /// The migration script reported errors
    Migration,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation => write!(f, "Validation"),
            Self::TransientStore => write!(f, "TransientStore"),
            Self::PermanentSpec => write!(f, "PermanentSpec"),
            Self::Migration => write!(f, "Migration"),
        }
    }
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a migration failure for the given pod
    pub fn migration(pod: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Migration {
            pod: pod.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Classify a kube error raised while operating on `kind`/`name`.
    ///
    /// API status codes map onto the store error kinds the convergence
    /// engine and status tracker branch on. Anything else stays a plain
    /// `Kube` error.
    pub fn from_kube(kind: impl Into<String>, name: impl Into<String>, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) => match (ae.code, ae.reason.as_str()) {
                (409, "AlreadyExists") => Self::AlreadyExists {
                    kind: kind.into(),
                    name: name.into(),
                },
                (409, _) => Self::Conflict {
                    kind: kind.into(),
                    name: name.into(),
                    message: ae.message,
                },
                (404, _) => Self::NotFound {
                    kind: kind.into(),
                    name: name.into(),
                },
                (400, _) | (422, _) => Self::InvalidSpec {
                    kind: kind.into(),
                    name: name.into(),
                    message: ae.message,
                },
                _ => Self::Kube {
                    source: kube::Error::Api(ae),
                },
            },
            other => Self::Kube { source: other },
        }
    }

    /// Which failure class this error belongs to
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Validation { .. } => ErrorClass::Validation,
            Error::InvalidSpec { .. } | Error::Serialization { .. } => ErrorClass::PermanentSpec,
            Error::Migration { .. } => ErrorClass::Migration,
            Error::Kube { .. }
            | Error::AlreadyExists { .. }
            | Error::NotFound { .. }
            | Error::Conflict { .. }
            | Error::ExecTimeout { .. }
            | Error::Internal { .. } => ErrorClass::TransientStore,
        }
    }

    /// Check if this error is retryable
    ///
    /// Every failure is retried through the status backoff, but only
    /// transient classes are expected to clear without a spec edit.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Conflict { .. } | Error::ExecTimeout { .. } | Error::Internal { .. } => true,
            Error::AlreadyExists { .. } | Error::NotFound { .. } => true,
            Error::Migration { .. } => true,
            Error::Validation { .. } | Error::InvalidSpec { .. } | Error::Serialization { .. } => {
                false
            }
        }
    }

    /// Whether this error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} from api server"),
            reason: reason.to_string(),
            code,
        })
    }

    // ==========================================================================
    // Story Tests: classifying store responses
    // ==========================================================================

    /// Story: creating a Deployment that is already there is recognized as such
    #[test]
    fn story_create_on_existing_object_is_already_exists() {
        let err = Error::from_kube("Deployment", "events", api_error(409, "AlreadyExists"));

        assert!(matches!(
            err,
            Error::AlreadyExists { ref kind, ref name } if kind == "Deployment" && name == "events"
        ));
        assert_eq!(err.class(), ErrorClass::TransientStore);
    }

    /// Story: a stale resourceVersion on status write surfaces as a conflict
    #[test]
    fn story_stale_write_is_conflict() {
        let err = Error::from_kube("AppService", "gramola", api_error(409, "Conflict"));

        assert!(err.is_conflict());
        assert!(err.is_retryable());
        assert!(err.to_string().contains("gramola"));
    }

    /// Story: a malformed generated object is a permanent spec error
    #[test]
    fn story_unprocessable_object_is_permanent() {
        let err = Error::from_kube("Route", "events", api_error(422, "Invalid"));

        assert_eq!(err.class(), ErrorClass::PermanentSpec);
        assert!(!err.is_retryable());
    }

    #[test]
    fn not_found_maps_to_not_found() {
        let err = Error::from_kube("Secret", "events-database", api_error(404, "NotFound"));
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn server_errors_stay_transient_kube_errors() {
        let err = Error::from_kube("Service", "gateway", api_error(503, "ServiceUnavailable"));

        assert!(matches!(err, Error::Kube { .. }));
        assert!(err.is_retryable());
        assert_eq!(err.class(), ErrorClass::TransientStore);
    }

    #[test]
    fn validation_errors_carry_field_and_class() {
        let err = Error::validation_for_field("gramola", "spec.alias", "alias 'X' is not supported");

        match &err {
            Error::Validation { field, .. } => assert_eq!(field.as_deref(), Some("spec.alias")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.class(), ErrorClass::Validation);
        assert!(err.to_string().contains("alias"));
    }

    #[test]
    fn migration_failures_are_their_own_class() {
        let err = Error::migration("events-database-abc", "ERROR: relation exists");
        assert_eq!(err.class(), ErrorClass::Migration);
        assert_eq!(ErrorClass::Migration.to_string(), "Migration");
    }
}
