//! KubeResourceLister against a live API server.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{ObjectMeta, PostParams};

use cluster_envcheck::{KubeResourceLister, ResourceKind, ResourceLister};

use crate::{ROOT_CA_CONFIG_MAP, SharedTestCluster, TestNamespace};

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires Kubernetes cluster"]
async fn test_listing_follows_continue_tokens() {
    let cluster = SharedTestCluster::get().await;
    let client = cluster.new_client().await;
    let ns = TestNamespace::create_settled(client.clone(), "envcheck-pages").await;
    let api = ns.api::<ConfigMap>();

    for i in 0..7 {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(format!("page-{i}")),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("i".to_string(), i.to_string())])),
            ..Default::default()
        };
        api.create(&PostParams::default(), &cm)
            .await
            .expect("create ConfigMap");
    }

    let lister = KubeResourceLister::new(client).with_page_size(2);
    let kinds = BTreeSet::from([ResourceKind::core("ConfigMap")]);
    let raws = lister
        .list(&kinds, Some(ns.name()))
        .await
        .expect("list ConfigMaps");

    let names: BTreeSet<String> = raws
        .iter()
        .filter_map(|raw| raw.object["metadata"]["name"].as_str().map(String::from))
        .collect();
    assert_eq!(names.len(), 8, "names: {names:?}");
    assert!(names.contains(ROOT_CA_CONFIG_MAP));
    assert!(raws.iter().all(|raw| raw.kind == "ConfigMap"));
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires Kubernetes cluster"]
async fn test_unserved_kind_lists_as_empty() {
    let cluster = SharedTestCluster::get().await;
    let client = cluster.new_client().await;

    let lister = KubeResourceLister::new(client);
    let kinds = BTreeSet::from([ResourceKind::new("envcheck.invalid", "v1", "Widget")
        .with_plural("widgets")]);
    let raws = lister.list(&kinds, None).await.expect("list should not fail");

    assert!(raws.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires Kubernetes cluster"]
async fn test_namespaced_listing_excludes_other_namespaces() {
    let cluster = SharedTestCluster::get().await;
    let client = cluster.new_client().await;
    let ns = TestNamespace::create_settled(client.clone(), "envcheck-scope").await;

    let lister = KubeResourceLister::new(client);
    let kinds = BTreeSet::from([ResourceKind::core("ConfigMap"), ResourceKind::core("Namespace")]);
    let raws = lister
        .list(&kinds, Some(ns.name()))
        .await
        .expect("list resources");

    for raw in raws.iter().filter(|raw| raw.kind == "ConfigMap") {
        assert_eq!(raw.object["metadata"]["namespace"], ns.name());
    }
    // Cluster-scoped kinds are listed cluster-wide even with a namespace set
    assert!(
        raws.iter()
            .any(|raw| raw.kind == "Namespace" && raw.object["metadata"]["name"] == ns.name())
    );
}
