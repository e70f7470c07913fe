//! Objects that send alternative FQDNs to the primary FQDN.

use crate::Settings;
use exposure_controller_core::AlternativeFqdn;
use exposure_controller_k8s_api::{
    traefik::{Middleware, MiddlewareSpec, RedirectRegex},
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ObjectMeta, ServiceBackendPort,
};
use std::collections::BTreeMap;

/// Builds the ingress that receives requests for the alternative FQDNs.
///
/// Hosts are routed to the static-content backend; the backend's
/// `annotations` turn the route into a redirect. Returns `None` when there is
/// nothing to redirect.
pub fn alternative_fqdn_ingress(
    settings: &Settings,
    alternatives: &[AlternativeFqdn],
    annotations: BTreeMap<String, String>,
) -> Option<Ingress> {
    if alternatives.is_empty() {
        return None;
    }

    let tls = AlternativeFqdn::group_by_certificate(alternatives)
        .into_iter()
        .map(|(secret_name, hosts)| IngressTLS {
            hosts: Some(hosts),
            secret_name,
        })
        .collect();

    let mut hosts = Vec::<&str>::with_capacity(alternatives.len());
    for alt in alternatives {
        if !hosts.contains(&alt.fqdn.as_str()) {
            hosts.push(&alt.fqdn);
        }
    }
    let rules = hosts
        .into_iter()
        .map(|host| IngressRule {
            host: Some(host.to_string()),
            http: Some(HTTPIngressRuleValue {
                paths: vec![HTTPIngressPath {
                    path: Some("/".to_string()),
                    path_type: "Prefix".to_string(),
                    backend: IngressBackend {
                        service: Some(IngressServiceBackend {
                            name: settings.static_content.service.clone(),
                            port: Some(ServiceBackendPort {
                                number: Some(settings.static_content.port),
                                ..Default::default()
                            }),
                        }),
                        ..Default::default()
                    },
                }],
            }),
        })
        .collect();

    Some(Ingress {
        metadata: ObjectMeta {
            name: Some(settings.fqdn_redirect.clone()),
            namespace: Some(settings.namespace.clone()),
            annotations: (!annotations.is_empty()).then_some(annotations),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: Some(settings.ingress_class.clone()),
            tls: Some(tls),
            rules: Some(rules),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Matches any URL on one of the alternative hosts and keeps its path.
pub fn redirect_regex(primary: &str, alternatives: &[AlternativeFqdn]) -> RedirectRegex {
    let mut hosts = Vec::<String>::with_capacity(alternatives.len());
    for alt in alternatives {
        let host = regex::escape(&alt.fqdn);
        if !hosts.contains(&host) {
            hosts.push(host);
        }
    }
    RedirectRegex {
        regex: format!("^https?://({})(.*)", hosts.join("|")),
        replacement: format!("https://{primary}${{2}}"),
        permanent: true,
    }
}

/// Builds the middleware that redirects alternative hosts. Returns `None`
/// when there is nothing to redirect.
pub fn alternative_fqdn_middleware(
    settings: &Settings,
    primary: &str,
    alternatives: &[AlternativeFqdn],
) -> Option<Middleware> {
    if alternatives.is_empty() {
        return None;
    }
    let mut middleware = Middleware::new(
        &settings.fqdn_redirect,
        MiddlewareSpec {
            redirect_regex: Some(redirect_regex(primary, alternatives)),
            ..Default::default()
        },
    );
    middleware.metadata.namespace = Some(settings.namespace.clone());
    Some(middleware)
}
