use super::*;
use exposure_controller_core::AlternativeFqdn;
use maplit::btreemap;
use pretty_assertions::assert_eq;

#[tokio::test(flavor = "current_thread")]
async fn nginx_redirects_with_annotations() {
    let h = Harness::new(BackendKind::Nginx);
    let alternatives = AlternativeFqdn::parse_list("alt1.example.com,alt2.example.com:alt-cert");
    h.reconciler
        .redirect_alternative_fqdns("primary.example.com", &alternatives)
        .await
        .expect("redirect");

    let ingress = h
        .stores
        .ingresses
        .get_now("ces-alternative-fqdn-redirect")
        .expect("redirect ingress");
    assert_eq!(
        ingress.metadata.annotations,
        Some(btreemap! {
            "nginx.ingress.kubernetes.io/permanent-redirect".to_string() =>
                "https://primary.example.com$request_uri".to_string(),
            "nginx.ingress.kubernetes.io/permanent-redirect-code".to_string() => "308".to_string(),
        })
    );
    let tls = ingress.spec.and_then(|s| s.tls).expect("tls");
    assert_eq!(tls.len(), 2);

    // Unchanged input does not write again.
    h.reconciler
        .redirect_alternative_fqdns("primary.example.com", &alternatives)
        .await
        .expect("redirect");
    assert_eq!(h.stores.ingresses.writes(), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn no_alternatives_delete_the_redirect() {
    let h = Harness::new(BackendKind::Nginx);
    // Nothing to delete yet.
    h.reconciler
        .redirect_alternative_fqdns("primary.example.com", &[])
        .await
        .expect("redirect");

    let alternatives = AlternativeFqdn::parse_list("alt1.example.com");
    h.reconciler
        .redirect_alternative_fqdns("primary.example.com", &alternatives)
        .await
        .expect("redirect");
    h.reconciler
        .redirect_alternative_fqdns("primary.example.com", &[])
        .await
        .expect("redirect");
    assert!(h.stores.ingresses.names().is_empty());
}
