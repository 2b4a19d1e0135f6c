//! Create-or-patch convergence of managed objects
//!
//! [`ensure`] makes the store hold an object matching the desired one:
//! create it when absent, patch the generator-owned fields when present and
//! drifted, and leave it alone when it already matches. It never retries;
//! the controller requeues instead.

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::Value;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::topology::ManagedResource;
use crate::{Error, OPERATOR_NAME};

/// What `ensure` did to the store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Convergence {
    /// The object did not exist and was created
    Created,
    /// The object existed with drifted fields and was patched
    Patched,
    /// The object already matched
    Unchanged,
}

impl Convergence {
    /// Whether this call created the object
    pub fn created(self) -> bool {
        matches!(self, Convergence::Created)
    }
}

// =============================================================================
// Store abstraction
// =============================================================================

/// Store operations on managed objects.
///
/// Implementations report store failures through the classified
/// [`Error`] variants, in particular [`Error::AlreadyExists`] on create.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Create the object
    async fn create(&self, desired: &ManagedResource) -> Result<(), Error>;

    /// Fetch the live object with the same kind, namespace and name
    async fn get(&self, desired: &ManagedResource) -> Result<Option<Value>, Error>;

    /// Apply a JSON merge patch to the live object
    async fn patch(&self, desired: &ManagedResource, patch: &Value) -> Result<(), Error>;
}

/// Real store backed by the Kubernetes API
pub struct KubeResourceStore {
    client: Client,
}

impl KubeResourceStore {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, desired: &ManagedResource) -> Result<Api<DynamicObject>, Error> {
        let namespace = desired.namespace().ok_or_else(|| {
            Error::internal_with_context(
                "converge",
                format!("{} {} has no namespace", desired.kind(), desired.name()),
            )
        })?;
        Ok(Api::namespaced_with(
            self.client.clone(),
            &namespace,
            &desired.api_resource(),
        ))
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(OPERATOR_NAME.to_string()),
        ..Default::default()
    }
}

fn patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(OPERATOR_NAME.to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl ResourceStore for KubeResourceStore {
    async fn create(&self, desired: &ManagedResource) -> Result<(), Error> {
        let object: DynamicObject = serde_json::from_value(desired.to_json()?)
            .map_err(|e| Error::serialization_for_kind(desired.kind(), e.to_string()))?;
        self.api(desired)?
            .create(&post_params(), &object)
            .await
            .map_err(|e| Error::from_kube(desired.kind(), desired.name(), e))?;
        Ok(())
    }

    async fn get(&self, desired: &ManagedResource) -> Result<Option<Value>, Error> {
        let current = self
            .api(desired)?
            .get_opt(&desired.name())
            .await
            .map_err(|e| Error::from_kube(desired.kind(), desired.name(), e))?;
        current
            .map(|obj| {
                serde_json::to_value(obj)
                    .map_err(|e| Error::serialization_for_kind(desired.kind(), e.to_string()))
            })
            .transpose()
    }

    async fn patch(&self, desired: &ManagedResource, patch: &Value) -> Result<(), Error> {
        self.api(desired)?
            .patch(&desired.name(), &patch_params(), &Patch::Merge(patch))
            .await
            .map_err(|e| Error::from_kube(desired.kind(), desired.name(), e))?;
        Ok(())
    }
}

// =============================================================================
// Convergence
// =============================================================================

/// Make the store hold `desired`.
///
/// Any store error other than "already exists" is returned unchanged. An
/// object that vanished between the create and the fetch is reported as a
/// conflict, which the next pass resolves by creating it again.
pub async fn ensure(
    store: &dyn ResourceStore,
    desired: &ManagedResource,
) -> Result<Convergence, Error> {
    let kind = desired.kind();
    let name = desired.name();

    match store.create(desired).await {
        Ok(()) => {
            info!(kind, name = %name, "created managed resource");
            return Ok(Convergence::Created);
        }
        Err(Error::AlreadyExists { .. }) => {}
        Err(e) => return Err(e),
    }

    let current = store.get(desired).await?.ok_or_else(|| Error::Conflict {
        kind: kind.to_string(),
        name: name.clone(),
        message: "deleted while converging".to_string(),
    })?;

    let owned = desired.owned_fields()?;
    if contains(&current, &owned) {
        debug!(kind, name = %name, "managed resource up to date");
        return Ok(Convergence::Unchanged);
    }

    store.patch(desired, &owned).await?;
    info!(kind, name = %name, "patched drifted managed resource");
    Ok(Convergence::Patched)
}

/// Whether every field in `desired` is present in `current` with the same value.
///
/// Fields only `current` has (server defaults, status, user labels) are
/// ignored. Arrays must match element by element. An empty desired map
/// matches a missing key, as the API server does not store empty maps.
pub fn contains(current: &Value, desired: &Value) -> bool {
    match (current, desired) {
        (Value::Object(current), Value::Object(desired)) => {
            desired.iter().all(|(key, value)| match current.get(key) {
                Some(existing) => contains(existing, value),
                None => matches!(value, Value::Object(map) if map.is_empty()),
            })
        }
        (Value::Array(current), Value::Array(desired)) => {
            current.len() == desired.len()
                && current.iter().zip(desired).all(|(c, d)| contains(c, d))
        }
        (current, desired) => current == desired,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::test_support::sample_context;
    use crate::topology::{events_group, gateway_group};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// In-memory store keyed by (kind, name) that counts writes
    #[derive(Default)]
    struct FakeStore {
        objects: Mutex<BTreeMap<(String, String), Value>>,
        writes: Mutex<usize>,
    }

    impl FakeStore {
        fn key(desired: &ManagedResource) -> (String, String) {
            (desired.kind().to_string(), desired.name())
        }

        fn writes(&self) -> usize {
            *self.writes.lock().expect("lock")
        }

        fn edit(&self, desired: &ManagedResource, f: impl FnOnce(&mut Value)) {
            let mut objects = self.objects.lock().expect("lock");
            f(objects.get_mut(&Self::key(desired)).expect("object"));
        }
    }

    fn merge(target: &mut Value, patch: &Value) {
        match (target, patch) {
            (Value::Object(t), Value::Object(p)) => {
                for (k, v) in p {
                    merge(t.entry(k.clone()).or_insert(Value::Null), v);
                }
            }
            (t, p) => *t = p.clone(),
        }
    }

    #[async_trait]
    impl ResourceStore for FakeStore {
        async fn create(&self, desired: &ManagedResource) -> Result<(), Error> {
            let mut objects = self.objects.lock().expect("lock");
            let key = Self::key(desired);
            if objects.contains_key(&key) {
                return Err(Error::AlreadyExists {
                    kind: key.0,
                    name: key.1,
                });
            }
            let mut object = desired.to_json()?;
            // what the API server would default
            object["metadata"]["uid"] = json!("server-assigned");
            objects.insert(key, object);
            *self.writes.lock().expect("lock") += 1;
            Ok(())
        }

        async fn get(&self, desired: &ManagedResource) -> Result<Option<Value>, Error> {
            Ok(self
                .objects
                .lock()
                .expect("lock")
                .get(&Self::key(desired))
                .cloned())
        }

        async fn patch(&self, desired: &ManagedResource, patch: &Value) -> Result<(), Error> {
            self.edit(desired, |object| merge(object, patch));
            *self.writes.lock().expect("lock") += 1;
            Ok(())
        }
    }

    fn gateway_deployment() -> ManagedResource {
        gateway_group(&sample_context()).resources[0].clone()
    }

    // =========================================================================
    // Idempotence
    // =========================================================================

    /// Story: repeated ensure calls write only once
    #[tokio::test]
    async fn story_repeated_ensure_writes_once() {
        let store = FakeStore::default();

        for desired in events_group(&sample_context()).resources {
            assert_eq!(ensure(&store, &desired).await.expect("first"), Convergence::Created);
            assert_eq!(ensure(&store, &desired).await.expect("second"), Convergence::Unchanged);
            assert_eq!(ensure(&store, &desired).await.expect("third"), Convergence::Unchanged);
        }

        assert_eq!(store.writes(), 8);
    }

    /// Story: a drifted image is patched back, then left alone
    #[tokio::test]
    async fn story_drift_is_patched_once() {
        let store = FakeStore::default();
        let desired = gateway_deployment();
        ensure(&store, &desired).await.expect("create");

        store.edit(&desired, |object| {
            object["spec"]["template"]["spec"]["containers"][0]["image"] = json!("evil:latest");
        });

        assert_eq!(ensure(&store, &desired).await.expect("patch"), Convergence::Patched);
        assert_eq!(ensure(&store, &desired).await.expect("noop"), Convergence::Unchanged);
        assert_eq!(store.writes(), 2);
    }

    /// Story: a scripts ConfigMap without a script stays converged
    ///
    /// The stored object has no `data` key at all.
    #[tokio::test]
    async fn story_config_map_without_script_is_not_repatched() {
        let mut ctx = sample_context();
        ctx.script = None;
        let desired = events_group(&ctx)
            .resources
            .into_iter()
            .find(|r| r.kind() == "ConfigMap")
            .expect("scripts ConfigMap");

        let store = FakeStore::default();
        assert_eq!(ensure(&store, &desired).await.expect("create"), Convergence::Created);
        store.edit(&desired, |object| {
            if let Some(object) = object.as_object_mut() {
                object.remove("data");
            }
        });

        assert_eq!(ensure(&store, &desired).await.expect("second"), Convergence::Unchanged);
        assert_eq!(ensure(&store, &desired).await.expect("third"), Convergence::Unchanged);
        assert_eq!(store.writes(), 1);
    }

    /// Story: labels added by a user survive convergence
    #[tokio::test]
    async fn story_user_labels_are_not_clobbered() {
        let store = FakeStore::default();
        let desired = gateway_deployment();
        ensure(&store, &desired).await.expect("create");

        store.edit(&desired, |object| {
            object["metadata"]["labels"]["team"] = json!("music");
            object["metadata"]["labels"]["component"] = json!("renamed");
        });

        assert_eq!(ensure(&store, &desired).await.expect("patch"), Convergence::Patched);
        let live = store.get(&desired).await.expect("get").expect("object");
        assert_eq!(live["metadata"]["labels"]["team"], "music");
        assert_eq!(live["metadata"]["labels"]["component"], "gateway");
    }

    // =========================================================================
    // Error propagation (mocked store)
    // =========================================================================

    #[tokio::test]
    async fn create_failures_other_than_already_exists_propagate() {
        let mut store = MockResourceStore::new();
        store.expect_create().returning(|_| {
            Err(Error::InvalidSpec {
                kind: "Deployment".to_string(),
                name: "gateway".to_string(),
                message: "spec.template: Invalid value".to_string(),
            })
        });
        store.expect_get().never();
        store.expect_patch().never();

        let err = ensure(&store, &gateway_deployment()).await.expect_err("should fail");
        assert!(matches!(err, Error::InvalidSpec { .. }));
    }

    #[tokio::test]
    async fn patch_failures_propagate() {
        let mut store = MockResourceStore::new();
        store.expect_create().returning(|r| {
            Err(Error::AlreadyExists {
                kind: r.kind().to_string(),
                name: r.name(),
            })
        });
        store.expect_get().returning(|_| Ok(Some(json!({"metadata": {}}))));
        store.expect_patch().times(1).returning(|r, _| {
            Err(Error::Conflict {
                kind: r.kind().to_string(),
                name: r.name(),
                message: "the object has been modified".to_string(),
            })
        });

        let err = ensure(&store, &gateway_deployment()).await.expect_err("should fail");
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn object_vanishing_after_already_exists_is_a_conflict() {
        let mut store = MockResourceStore::new();
        store.expect_create().returning(|r| {
            Err(Error::AlreadyExists {
                kind: r.kind().to_string(),
                name: r.name(),
            })
        });
        store.expect_get().returning(|_| Ok(None));

        let err = ensure(&store, &gateway_deployment()).await.expect_err("should fail");
        assert!(err.is_conflict());
    }

    // =========================================================================
    // Subset comparison
    // =========================================================================

    #[test]
    fn contains_ignores_server_defaults() {
        let current = json!({"spec": {"ports": [{"port": 80, "protocol": "TCP", "targetPort": 80}]}});
        let desired = json!({"spec": {"ports": [{"port": 80, "protocol": "TCP"}]}});
        assert!(contains(&current, &desired));
    }

    #[test]
    fn contains_detects_changed_and_missing_fields() {
        let current = json!({"data": {"a": "1"}});
        assert!(!contains(&current, &json!({"data": {"a": "2"}})));
        assert!(!contains(&current, &json!({"data": {"b": "1"}})));
    }

    #[test]
    fn empty_desired_map_matches_missing_key() {
        let current = json!({"metadata": {"name": "scripts"}});
        assert!(contains(&current, &json!({"data": {}})));
        assert!(!contains(&current, &json!({"data": {"a": "1"}})));
        assert!(!contains(&current, &json!({"replicas": 1})));
    }

    #[test]
    fn contains_requires_equal_array_lengths() {
        let current = json!({"env": [{"name": "A"}, {"name": "B"}]});
        assert!(!contains(&current, &json!({"env": [{"name": "A"}]})));
    }

    #[test]
    fn created_flag_matches_variant() {
        assert!(Convergence::Created.created());
        assert!(!Convergence::Patched.created());
        assert!(!Convergence::Unchanged.created());
    }
}
