use super::*;
use crate::Error;
use exposure_controller_core::{OwnershipAnnotations, EXPOSED_PORTS_ANNOTATION};
use exposure_controller_k8s_api::IntOrString;
use maplit::btreemap;
use pretty_assertions::assert_eq;

fn exposing(name: &str, ports: &str, declared: &[i32]) -> Service {
    service(
        name,
        declared,
        btreemap! { EXPOSED_PORTS_ANNOTATION.to_string() => ports.to_string() },
    )
}

fn lb_port_names(h: &Harness) -> Vec<String> {
    h.stores
        .services
        .get_now("nginx-ingress-exposed")
        .and_then(|svc| svc.spec)
        .and_then(|spec| spec.ports)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|p| p.name)
        .collect()
}

fn policy_ports(h: &Harness) -> Vec<i32> {
    h.stores
        .network_policies
        .get_now("nginx-ingress-exposed")
        .and_then(|np| np.spec)
        .and_then(|spec| spec.ingress)
        .and_then(|rules| rules.into_iter().next())
        .and_then(|rule| rule.ports)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|p| match p.port {
            Some(IntOrString::Int(port)) => Some(port),
            _ => None,
        })
        .collect()
}

fn table(h: &Harness, name: &str) -> BTreeMap<String, String> {
    h.stores
        .config_maps
        .get_now(name)
        .and_then(|cm| cm.data)
        .unwrap_or_default()
}

#[tokio::test(flavor = "current_thread")]
async fn forwards_tcp_and_udp_ports() {
    let h = Harness::new(BackendKind::Nginx);
    let ldap = exposing(
        "ldap",
        r#"[{"protocol":"TCP","port":2222,"targetPort":3333},{"protocol":"UDP","port":3333,"targetPort":4444}]"#,
        &[2222, 3333],
    );
    h.reconciler
        .exposure()
        .upsert(&ldap)
        .await
        .expect("upsert must succeed");

    assert_eq!(
        table(&h, "tcp-services"),
        btreemap! { "2222".to_string() => "ecosystem/ldap:3333".to_string() }
    );
    assert_eq!(
        table(&h, "udp-services"),
        btreemap! { "3333".to_string() => "ecosystem/ldap:4444".to_string() }
    );
    assert_eq!(lb_port_names(&h), vec!["ldap-2222", "ldap-3333-udp"]);
    assert_eq!(policy_ports(&h), vec![2222, 3333]);
}

#[tokio::test(flavor = "current_thread")]
async fn removing_the_last_ports_deletes_the_load_balancer() {
    let h = Harness::new(BackendKind::Nginx);
    let lb = |ports: &[(&str, i32)]| Service {
        metadata: ObjectMeta {
            name: Some("nginx-ingress-exposed".to_string()),
            namespace: Some("ecosystem".to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            ports: Some(
                ports
                    .iter()
                    .map(|(name, port)| ServicePort {
                        name: Some(name.to_string()),
                        protocol: Some("TCP".to_string()),
                        port: *port,
                        target_port: Some(IntOrString::Int(*port)),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    };
    h.stores.services.seed(lb(&[
        ("nginx-ingress-80", 80),
        ("nginx-ingress-443", 443),
        ("scm-2222", 2222),
    ]));

    h.reconciler
        .exposure()
        .remove("ecosystem", "scm")
        .await
        .expect("remove must succeed");
    assert_eq!(lb_port_names(&h), vec!["nginx-ingress-80", "nginx-ingress-443"]);

    h.reconciler
        .exposure()
        .remove("ecosystem", "nginx-ingress")
        .await
        .expect("remove must succeed");
    assert_eq!(h.stores.services.get_now("nginx-ingress-exposed"), None);
}

#[tokio::test(flavor = "current_thread")]
async fn repeated_upserts_write_once() {
    let h = Harness::new(BackendKind::Nginx);
    let scm = exposing(
        "scm",
        r#"[{"protocol":"TCP","port":2222,"targetPort":2222}]"#,
        &[2222],
    );
    h.reconciler.exposure().upsert(&scm).await.expect("upsert");
    let writes = h.writes();
    // One write per shared resource: policy, load balancer and tcp table.
    assert_eq!(writes, 3);

    h.reconciler.exposure().upsert(&scm).await.expect("upsert");
    assert_eq!(h.writes(), writes);
}

#[tokio::test(flavor = "current_thread")]
async fn contributors_are_isolated() {
    let h = Harness::new(BackendKind::Nginx);
    let a = exposing("a", r#"[{"protocol":"TCP","port":22,"targetPort":22}]"#, &[22]);
    let b = exposing("b", r#"[{"protocol":"TCP","port":80,"targetPort":8080}]"#, &[80]);

    h.reconciler.exposure().upsert(&a).await.expect("upsert a");
    h.reconciler.exposure().upsert(&b).await.expect("upsert b");
    h.reconciler.exposure().remove("ecosystem", "a").await.expect("remove a");

    assert_eq!(
        table(&h, "tcp-services"),
        btreemap! { "80".to_string() => "ecosystem/b:8080".to_string() }
    );
    assert_eq!(lb_port_names(&h), vec!["b-80"]);
    assert_eq!(policy_ports(&h), vec![80]);

    let annotations = h
        .stores
        .network_policies
        .get_now("nginx-ingress-exposed")
        .and_then(|np| np.metadata.annotations)
        .unwrap_or_default();
    let owners = OwnershipAnnotations::default();
    assert!(owners.read(&annotations, "a").expect("parse").is_empty());
    assert_eq!(owners.read(&annotations, "b").expect("parse").len(), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn lost_races_are_retried_without_losing_entries() {
    let h = Harness::new(BackendKind::Nginx);
    let a = exposing("a", r#"[{"protocol":"TCP","port":22,"targetPort":22}]"#, &[22]);
    h.reconciler.exposure().upsert(&a).await.expect("upsert a");

    // Another reconciliation adds port 80 just before ours writes.
    h.stores.config_maps.before_next_replace(|cm: &mut ConfigMap| {
        cm.data
            .get_or_insert_with(BTreeMap::new)
            .insert("80".to_string(), "ecosystem/b:8080".to_string());
    });
    let a = exposing(
        "a",
        r#"[{"protocol":"TCP","port":22,"targetPort":22},{"protocol":"TCP","port":23,"targetPort":23}]"#,
        &[22, 23],
    );
    h.reconciler.exposure().upsert(&a).await.expect("upsert a");

    assert_eq!(
        table(&h, "tcp-services"),
        btreemap! {
            "22".to_string() => "ecosystem/a:22".to_string(),
            "23".to_string() => "ecosystem/a:23".to_string(),
            "80".to_string() => "ecosystem/b:8080".to_string(),
        }
    );
}

#[tokio::test(flavor = "current_thread")]
async fn conflicts_beyond_the_retry_budget_fail() {
    let h = Harness::new(BackendKind::Nginx);
    let a = exposing("a", r#"[{"protocol":"TCP","port":22,"targetPort":22}]"#, &[22]);
    h.reconciler.exposure().upsert(&a).await.expect("upsert a");

    for _ in 0..5 {
        h.stores
            .network_policies
            .before_next_replace(|np: &mut NetworkPolicy| {
                np.metadata
                    .labels
                    .get_or_insert_with(BTreeMap::new)
                    .insert("touched".to_string(), "true".to_string());
            });
    }
    let err = h
        .reconciler
        .exposure()
        .remove("ecosystem", "a")
        .await
        .expect_err("must give up");
    assert!(err.is_conflict(), "{err}");
}

#[tokio::test(flavor = "current_thread")]
async fn other_protocols_are_ignored_by_forwarding() {
    let h = Harness::new(BackendKind::Nginx);
    let svc = exposing(
        "sctp",
        r#"[{"protocol":"SCTP","port":9000,"targetPort":9000},{"protocol":"tcp","port":9001,"targetPort":9001}]"#,
        &[9000, 9001],
    );
    h.reconciler.exposure().upsert(&svc).await.expect("upsert");
    assert_eq!(
        table(&h, "tcp-services"),
        btreemap! { "9001".to_string() => "ecosystem/sctp:9001".to_string() }
    );
    assert_eq!(h.stores.config_maps.get_now("udp-services"), None);
    assert_eq!(lb_port_names(&h), vec!["sctp-9001"]);
}

#[tokio::test(flavor = "current_thread")]
async fn invalid_ports_write_nothing() {
    let h = Harness::new(BackendKind::Nginx);
    let svc = exposing(
        "ldap",
        r#"[{"protocol":"TCP","port":636,"targetPort":636}]"#,
        &[389],
    );
    let err = h
        .reconciler
        .exposure()
        .upsert(&svc)
        .await
        .expect_err("undeclared port");
    assert!(matches!(err, Error::UndeclaredPort { port: 636, .. }));
    assert_eq!(h.writes(), 0);
}
