use crate::{
    core::Identity,
    k8s::{self, Api, Client, IngressClass, IngressClassSpec, ObjectMeta, PostParams},
};
use anyhow::{Context, Result};

pub(crate) fn ingress_class(name: &str, identity: &Identity) -> IngressClass {
    IngressClass {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(IngressClassSpec {
            controller: Some(identity.controller().to_string()),
            ..Default::default()
        }),
    }
}

/// Creates the IngressClass that generated ingresses refer to. An existing
/// class is left alone.
pub(crate) async fn ensure(client: Client, name: &str, identity: &Identity) -> Result<()> {
    let api = Api::<IngressClass>::all(client);
    if api
        .get_opt(name)
        .await
        .with_context(|| format!("failed to get ingress class {name}"))?
        .is_some()
    {
        tracing::debug!(%name, "Ingress class exists");
        return Ok(());
    }

    match api
        .create(&PostParams::default(), &ingress_class(name, identity))
        .await
    {
        Ok(_) => {
            tracing::info!(%name, controller = %identity.controller(), "Created ingress class");
            Ok(())
        }
        Err(error) if k8s::is_conflict(&error) => Ok(()),
        Err(error) => {
            Err(error).with_context(|| format!("failed to create ingress class {name}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::BackendKind;

    #[test]
    fn class_names_the_backend_controller() {
        let class = ingress_class("k8s-ecosystem-ces-service", &BackendKind::Traefik.identity());
        assert_eq!(
            class.metadata.name.as_deref(),
            Some("k8s-ecosystem-ces-service")
        );
        assert_eq!(
            class.spec.and_then(|s| s.controller).as_deref(),
            Some("traefik.io/ingress-controller")
        );
    }
}
