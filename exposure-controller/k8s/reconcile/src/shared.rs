//! Read-merge-write cycles over objects that many contributors write to.

use crate::{store::ObjectStore, Error, Result};
use exposure_controller_core::{retry, Change, Contributor, ExposedPorts, RetryPolicy};
use exposure_controller_k8s_api::{self as k8s, Resource};

/// An object shared by all contributors.
pub(crate) trait SharedResource: Send + Sync {
    type Object: Resource<DynamicType = ()> + Clone + PartialEq + Send + Sync + 'static;

    fn name(&self) -> &str;

    /// Computes the write that replaces `contributor`'s previous
    /// contribution with `desired`, leaving everyone else's untouched.
    fn plan(
        &self,
        current: Option<&Self::Object>,
        contributor: &Contributor,
        desired: &ExposedPorts,
    ) -> Result<Change<Self::Object>>;
}

/// Converges `shared` so that it holds exactly `desired` on behalf of
/// `contributor`. A lost write race restarts from a fresh read.
pub(crate) async fn converge<S: SharedResource>(
    shared: &S,
    store: &dyn ObjectStore<S::Object>,
    policy: RetryPolicy,
    contributor: &Contributor,
    desired: &ExposedPorts,
) -> Result<()> {
    let name = shared.name();
    let kind = &S::Object::kind(&()).to_string();
    retry::on_conflict(policy, Error::is_conflict, || async move {
        let current = store
            .get(name)
            .await
            .map_err(|e| Error::api("get", kind, name, e))?;
        match shared.plan(current.as_ref(), contributor, desired)? {
            Change::Unchanged => {
                tracing::debug!(%kind, %name, %contributor, "Unchanged");
            }
            Change::Create(obj) => {
                store
                    .create(&obj)
                    .await
                    .map_err(|e| Error::api("create", kind, name, e))?;
                tracing::info!(%kind, %name, %contributor, "Created");
            }
            Change::Replace(obj) => {
                store
                    .replace(&obj)
                    .await
                    .map_err(|e| Error::api("replace", kind, name, e))?;
                tracing::info!(%kind, %name, %contributor, "Updated");
            }
            Change::Delete => match store.delete(name).await {
                Ok(()) => tracing::info!(%kind, %name, %contributor, "Deleted"),
                Err(error) if k8s::is_not_found(&error) => {}
                Err(error) => return Err(Error::api("delete", kind, name, error)),
            },
        }
        Ok(())
    })
    .await
}
