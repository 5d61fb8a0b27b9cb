#![forbid(unsafe_code)]

use std::time::Duration;

use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::api::rbac::v1::ClusterRole;
use kapply_apply::memory::{Call, Verb};
use kapply_apply::{MemoryCluster, SyncOptions, Synchronizer};
use kapply_core::{Action, DecodeCause, Manifest, Outcome, RemoteError, SyncError};
use kapply_kinds::NodeFeatureDiscovery;
use kube::api::ObjectMeta;
use tokio_util::sync::CancellationToken;

fn manifest(origin: &str, yaml: &str) -> Manifest {
    Manifest::new(origin, yaml.as_bytes().to_vec())
}

fn namespace_doc(name: &str) -> String {
    format!("apiVersion: v1\nkind: Namespace\nmetadata:\n  name: {}\n", name)
}

fn calls_for<'a>(calls: &'a [Call], name: &str) -> Vec<&'a Call> {
    calls.iter().filter(|c| c.name == name).collect()
}

fn sync(cluster: &MemoryCluster) -> Synchronizer<MemoryCluster> {
    Synchronizer::new(cluster.clone(), SyncOptions::default())
}

const CLUSTER_ROLE_BAR: &str = r#"
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: bar
  resourceVersion: "3"
rules:
- apiGroups: [""]
  resources: [nodes]
  verbs: [get]
"#;

const NFD: &str = r#"
apiVersion: nfd.openshift.io/v1alpha1
kind: NodeFeatureDiscovery
metadata:
  name: nfd-master-server
  namespace: openshift-nfd
spec:
  operand:
    image: quay.io/openshift/origin-node-feature-discovery:latest
"#;

#[tokio::test]
async fn unknown_kind_makes_no_remote_calls() {
    let cluster = MemoryCluster::new();
    let report = sync(&cluster)
        .run(vec![manifest("widget.yaml", "apiVersion: example.com/v1\nkind: Widget\nmetadata:\n  name: w\n")])
        .await;
    assert_eq!(report.items.len(), 1);
    let item = &report.items[0];
    assert_eq!(item.kind.as_ref().map(|k| k.as_str()), Some("Widget"));
    assert!(matches!(item.result, Err(SyncError::UnknownKind { ref kind }) if kind.as_str() == "Widget"));
    assert!(cluster.calls().is_empty());
}

#[tokio::test]
async fn missing_kind_marker_is_malformed() {
    let cluster = MemoryCluster::new();
    let report = sync(&cluster).run(vec![manifest("nokind.yaml", "apiVersion: v1\nmetadata:\n  name: foo\n")]).await;
    assert!(matches!(report.items[0].result, Err(SyncError::MalformedManifest)));
    assert!(report.items[0].kind.is_none());
    assert!(cluster.calls().is_empty());
}

#[tokio::test]
async fn invalid_document_is_a_decode_error_without_calls() {
    let cluster = MemoryCluster::new();
    let y = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: x\nspec:\n  replicas: many\n";
    let report = sync(&cluster).run(vec![manifest("bad.yaml", y)]).await;
    match &report.items[0].result {
        Err(SyncError::DecodeError { kind, len, .. }) => {
            assert_eq!(kind.as_str(), "Deployment");
            assert_eq!(*len, y.len());
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(cluster.calls().is_empty());
}

#[tokio::test]
async fn absent_namespace_is_created_then_confirmed_with_fresh_token() {
    let cluster = MemoryCluster::new();
    let report = sync(&cluster).run(vec![manifest("ns.yaml", &namespace_doc("foo"))]).await;
    let applied = report.items[0].result.as_ref().expect("applied");
    assert_eq!(applied.actions.as_slice(), &[Action::Created, Action::Updated]);
    assert_eq!(applied.outcome(), Outcome::Created);

    let calls = cluster.calls();
    let verbs: Vec<_> = calls.iter().map(|c| c.verb).collect();
    assert_eq!(verbs, vec![Verb::Get, Verb::Create, Verb::Update]);
    assert_eq!(calls[1].resource_version, None);
    // confirmation update carries the token returned by create
    assert_eq!(calls[2].resource_version.as_deref(), Some("1"));
    let created: Namespace = cluster.object(None, "foo").expect("stored");
    assert_eq!(created.metadata.resource_version.as_deref(), Some("2"));
}

#[tokio::test]
async fn rerun_takes_the_found_branch() {
    let cluster = MemoryCluster::new();
    let s = sync(&cluster);
    let docs = vec![manifest("ns.yaml", &namespace_doc("foo"))];
    s.run(&docs).await;
    cluster.clear_calls();

    let report = s.run(&docs).await;
    let applied = report.items[0].result.as_ref().expect("applied");
    assert_eq!(applied.actions.as_slice(), &[Action::Updated]);
    let calls = cluster.calls();
    assert_eq!(calls.iter().filter(|c| c.verb == Verb::Create).count(), 0);
    let update = calls.iter().find(|c| c.verb == Verb::Update).expect("update call");
    assert_eq!(update.resource_version.as_deref(), Some("2"));
}

#[tokio::test]
async fn update_uses_lookup_token_not_manifest_token() {
    let cluster = MemoryCluster::new();
    cluster
        .seed(ClusterRole {
            metadata: ObjectMeta { name: Some("bar".into()), resource_version: Some("7".into()), ..Default::default() },
            ..Default::default()
        })
        .unwrap();

    let report = sync(&cluster).run(vec![manifest("cr.yaml", CLUSTER_ROLE_BAR)]).await;
    let applied = report.items[0].result.as_ref().expect("applied");
    assert_eq!(applied.outcome(), Outcome::Updated);

    let calls = cluster.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].verb, Verb::Get);
    assert_eq!(calls[1].verb, Verb::Update);
    assert_eq!(calls[1].resource_version.as_deref(), Some("7"));
    let stored: ClusterRole = cluster.object(None, "bar").unwrap();
    assert_eq!(stored.rules.unwrap()[0].verbs, vec!["get".to_string()]);
}

#[tokio::test]
async fn tokens_are_never_shared_between_manifests() {
    let cluster = MemoryCluster::new();
    for (name, rv) in [("a", "11"), ("b", "42")] {
        cluster
            .seed(Namespace {
                metadata: ObjectMeta { name: Some(name.into()), resource_version: Some(rv.into()), ..Default::default() },
                ..Default::default()
            })
            .unwrap();
    }
    let report = sync(&cluster)
        .run(vec![manifest("a.yaml", &namespace_doc("a")), manifest("b.yaml", &namespace_doc("b"))])
        .await;
    assert!(report.is_success());
    let calls = cluster.calls();
    let sent = |name: &str| calls_for(&calls, name).into_iter().find(|c| c.verb == Verb::Update).and_then(|c| c.resource_version.clone());
    assert_eq!(sent("a").as_deref(), Some("11"));
    assert_eq!(sent("b").as_deref(), Some("42"));
}

#[tokio::test]
async fn lookup_failure_does_not_stop_the_batch() {
    let cluster = MemoryCluster::new();
    cluster.fail(Verb::Get, "broken", 500);
    let report = sync(&cluster)
        .run(vec![manifest("broken.yaml", &namespace_doc("broken")), manifest("next.yaml", &namespace_doc("next"))])
        .await;

    assert_eq!(report.items.len(), 2);
    match &report.items[0].result {
        Err(SyncError::LookupFailed { key, source }) => {
            assert_eq!(key.name, "broken");
            assert_eq!(source.status_code(), Some(500));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    let calls = cluster.calls();
    let broken = calls_for(&calls, "broken");
    assert_eq!(broken.len(), 1, "no create/update after a failed lookup");
    assert_eq!(report.items[1].result.as_ref().unwrap().outcome(), Outcome::Created);
    assert_eq!(report.summary().failed, 1);
    assert_eq!(report.failures().count(), 1);
}

#[tokio::test]
async fn create_failure_does_not_fall_through_to_update() {
    let cluster = MemoryCluster::new();
    cluster.fail(Verb::Create, "foo", 403);
    let report = sync(&cluster).run(vec![manifest("ns.yaml", &namespace_doc("foo"))]).await;
    assert!(matches!(report.items[0].result, Err(SyncError::CreateFailed { .. })));
    assert!(cluster.calls().iter().all(|c| c.verb != Verb::Update));
}

#[tokio::test]
async fn update_failure_is_reported() {
    let cluster = MemoryCluster::new();
    cluster.seed(Namespace { metadata: ObjectMeta { name: Some("foo".into()), ..Default::default() }, ..Default::default() }).unwrap();
    cluster.fail(Verb::Update, "foo", 422);
    let report = sync(&cluster).run(vec![manifest("ns.yaml", &namespace_doc("foo"))]).await;
    match &report.items[0].result {
        Err(e @ SyncError::UpdateFailed { .. }) => assert_eq!(e.reason(), "UpdateFailed"),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn confirmation_update_can_be_disabled() {
    let cluster = MemoryCluster::new();
    let opts = SyncOptions { confirm_after_create: false, ..SyncOptions::default() };
    let report = Synchronizer::new(cluster.clone(), opts).run(vec![manifest("ns.yaml", &namespace_doc("foo"))]).await;
    assert_eq!(report.items[0].result.as_ref().unwrap().actions.as_slice(), &[Action::Created]);
    assert_eq!(cluster.calls().len(), 2);
}

#[tokio::test]
async fn namespaced_kind_falls_back_to_default_namespace() {
    let cluster = MemoryCluster::new();
    let opts = SyncOptions { default_namespace: "openshift-nfd-operator".into(), ..SyncOptions::default() };
    let y = "apiVersion: v1\nkind: ServiceAccount\nmetadata:\n  name: nfd-operator\n";
    let report = Synchronizer::new(cluster.clone(), opts).run(vec![manifest("sa.yaml", y)]).await;
    let applied = report.items[0].result.as_ref().unwrap();
    assert_eq!(applied.key.namespace.as_deref(), Some("openshift-nfd-operator"));
    let sa: Option<ServiceAccount> = cluster.object(Some("openshift-nfd-operator"), "nfd-operator");
    assert!(sa.is_some());
    assert!(cluster.calls().iter().all(|c| c.namespace.as_deref() == Some("openshift-nfd-operator")));
}

#[tokio::test]
async fn custom_resource_is_created_without_confirmation_update() {
    let cluster = MemoryCluster::new();
    let report = sync(&cluster).run(vec![manifest("nfd.yaml", NFD)]).await;
    let applied = report.items[0].result.as_ref().unwrap();
    assert_eq!(applied.actions.as_slice(), &[Action::Created]);
    let verbs: Vec<_> = cluster.calls().iter().map(|c| c.verb).collect();
    assert_eq!(verbs, vec![Verb::Get, Verb::Create]);
    let stored: NodeFeatureDiscovery = cluster.object(Some("openshift-nfd"), "nfd-master-server").unwrap();
    assert!(stored.spec.operand.is_some());
}

#[tokio::test]
async fn existing_custom_resource_is_left_unchanged_unless_opted_in() {
    let cluster = MemoryCluster::new();
    let docs = vec![manifest("nfd.yaml", NFD)];
    sync(&cluster).run(&docs).await;
    cluster.clear_calls();

    let report = sync(&cluster).run(&docs).await;
    let applied = report.items[0].result.as_ref().unwrap();
    assert_eq!(applied.outcome(), Outcome::Unchanged);
    assert_eq!(applied.resource_version.as_deref(), Some("1"));
    assert!(cluster.calls().iter().all(|c| c.verb == Verb::Get));

    cluster.clear_calls();
    let opts = SyncOptions { update_custom_resources: true, ..SyncOptions::default() };
    let report = Synchronizer::new(cluster.clone(), opts).run(&docs).await;
    assert_eq!(report.items[0].result.as_ref().unwrap().outcome(), Outcome::Updated);
    let update = cluster.calls().into_iter().find(|c| c.verb == Verb::Update).expect("update");
    assert_eq!(update.resource_version.as_deref(), Some("1"));
}

#[tokio::test]
async fn cancelled_batch_stops_before_issuing_calls() {
    let cluster = MemoryCluster::new();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = sync(&cluster).run_until(vec![manifest("ns.yaml", &namespace_doc("foo"))], &cancel).await;
    assert!(report.cancelled);
    assert!(report.items.is_empty());
    assert!(!report.is_success());
    assert!(cluster.calls().is_empty());
}

#[tokio::test]
async fn mixed_batch_keeps_input_order() {
    let cluster = MemoryCluster::new();
    let report = sync(&cluster)
        .run(vec![
            manifest("1.yaml", "kind: Widget\n"),
            manifest("2.yaml", &namespace_doc("foo")),
            manifest("3.yaml", "garbage without marker"),
            manifest("4.yaml", CLUSTER_ROLE_BAR),
        ])
        .await;
    let statuses: Vec<_> = report.items.iter().map(|i| (i.origin.as_str(), i.status())).collect();
    assert_eq!(statuses, vec![("1.yaml", "UnknownKind"), ("2.yaml", "created"), ("3.yaml", "MalformedManifest"), ("4.yaml", "created")]);
}

const KINDLESS_CRD: &str = r#"
apiVersion: apiextensions.k8s.io/v1
metadata:
  name: nodefeaturediscoveries.nfd.openshift.io
spec:
  group: nfd.openshift.io
  scope: Namespaced
  names:
    kind: NodeFeatureDiscovery
    plural: nodefeaturediscoveries
  versions: []
"#;

const KINDLESS_BINDING: &str = r#"
apiVersion: rbac.authorization.k8s.io/v1
metadata:
  name: b
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: ClusterRole
  name: nfd-operator
subjects:
- kind: ServiceAccount
  name: nfd-operator
  namespace: openshift-nfd
"#;

#[tokio::test]
async fn nested_kind_of_a_kindless_document_is_never_applied() {
    let cluster = MemoryCluster::new();
    let report = sync(&cluster)
        .run(vec![manifest("crd.yaml", KINDLESS_CRD), manifest("crb.yaml", KINDLESS_BINDING)])
        .await;
    for item in &report.items {
        assert!(matches!(item.result, Err(SyncError::MalformedManifest)), "{} => {:?}", item.origin, item.result);
        assert!(item.kind.is_none());
    }
    assert!(cluster.calls().is_empty());
    assert!(cluster.is_empty());
}

#[tokio::test]
async fn custom_resource_with_wrong_api_version_is_not_applied() {
    let cluster = MemoryCluster::new();
    let y = NFD.replace("nfd.openshift.io/v1alpha1", "apps/v1");
    let report = sync(&cluster).run(vec![manifest("nfd.yaml", &y)]).await;
    assert!(matches!(
        report.items[0].result,
        Err(SyncError::DecodeError { source: DecodeCause::TypeMismatch { .. }, .. })
    ));
    assert!(cluster.calls().is_empty());
}

#[tokio::test]
async fn lookup_timeout_is_reported_as_lookup_failure() {
    let cluster = MemoryCluster::new();
    cluster.stall(Verb::Get, "slow", Duration::from_secs(10));
    let report = sync(&cluster)
        .run(vec![manifest("slow.yaml", &namespace_doc("slow")), manifest("next.yaml", &namespace_doc("next"))])
        .await;
    match &report.items[0].result {
        Err(SyncError::LookupFailed { key, source: RemoteError::Timeout(d) }) => {
            assert_eq!(key.name, "slow");
            assert_eq!(*d, Duration::from_secs(10));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(calls_for(&cluster.calls(), "slow").len(), 1);
    assert!(report.items[1].is_ok());
}

#[tokio::test]
async fn create_timeout_is_reported_as_create_failure() {
    let cluster = MemoryCluster::new();
    cluster.stall(Verb::Create, "foo", Duration::from_secs(3));
    let report = sync(&cluster).run(vec![manifest("ns.yaml", &namespace_doc("foo"))]).await;
    assert!(matches!(
        report.items[0].result,
        Err(SyncError::CreateFailed { source: RemoteError::Timeout(_), .. })
    ));
}

#[tokio::test]
async fn empty_namespace_falls_back_to_default() {
    let cluster = MemoryCluster::new();
    let opts = SyncOptions { default_namespace: "openshift-nfd".into(), ..SyncOptions::default() };
    let y = "apiVersion: v1\nkind: ServiceAccount\nmetadata:\n  name: nfd-worker\n  namespace: \"\"\n";
    let report = Synchronizer::new(cluster.clone(), opts).run(vec![manifest("sa.yaml", y)]).await;
    let applied = report.items[0].result.as_ref().unwrap();
    assert_eq!(applied.key.namespace.as_deref(), Some("openshift-nfd"));
    assert!(cluster.calls().iter().all(|c| c.namespace.as_deref() == Some("openshift-nfd")));
    let sa: Option<ServiceAccount> = cluster.object(Some("openshift-nfd"), "nfd-worker");
    assert!(sa.is_some());
}
