//! End-to-end check scenarios against the mock lister.
//!
//! Each test drives `begin` -> cluster mutation -> `end` and asserts on the
//! resulting report or error.

use std::sync::Arc;
use std::time::Duration;

use cluster_envcheck::check::CheckScope;
use cluster_envcheck::health::Metrics;
use cluster_envcheck::retry::{RetryConfig, RetryStop};
use cluster_envcheck::snapshot::Normalizer;
use cluster_envcheck::{
    CaptureStage, CheckPhase, EnvCheckConfig, EnvironmentCheck, Error, ExclusionPolicy,
    ExclusionRule, ResourceIdentity, ResourceKind,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::common::fixtures::{RawResourceBuilder, config_map, namespace, secret};
use crate::mock_lister::{InjectedFailure, MockLister};

const NS: &str = "ci";

fn quick_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 4,
        base_delay: Duration::from_millis(100),
        multiplier: 2.0,
        max_delay: Duration::from_secs(1),
        deadline: Some(Duration::from_secs(10)),
        jitter: 0.2,
    }
}

fn scope() -> CheckScope {
    CheckScope::new([
        ResourceKind::core("ConfigMap"),
        ResourceKind::core("Secret"),
        ResourceKind::core("Event"),
        ResourceKind::core("Namespace"),
    ])
}

fn check(lister: &Arc<MockLister>) -> EnvironmentCheck {
    EnvironmentCheck::new(lister.clone(), scope(), Normalizer::default(), quick_retry()).unwrap()
}

// ============================================================================
// Leak scenarios
// ============================================================================

#[tokio::test]
async fn test_untouched_environment_reports_nothing() {
    let lister = Arc::new(MockLister::with_objects([
        config_map(NS, "a"),
        secret(NS, "b"),
        namespace(NS),
    ]));
    let check = check(&lister);

    let mut handle = check.begin().await.unwrap();
    let report = check.end(&mut handle, &ExclusionPolicy::empty()).await.unwrap();

    assert!(report.is_empty(), "unexpected report: {report}");
    assert_eq!(report.summary(), "no differences");
}

#[tokio::test]
async fn test_server_side_churn_is_not_a_leak() {
    let settings = RawResourceBuilder::new("ConfigMap", "settings")
        .namespace(NS)
        .spec_field("data", json!({"key": "value"}));
    let lister = Arc::new(MockLister::with_objects([settings.build()]));
    let check = check(&lister);

    let mut handle = check.begin().await.unwrap();
    // Same content, new uid, resourceVersion and last-applied annotation
    lister.replace(
        settings
            .clone()
            .resource_version(99)
            .annotation(
                "kubectl.kubernetes.io/last-applied-configuration",
                "{\"data\":{}}",
            )
            .build(),
    );
    let report = check.end(&mut handle, &ExclusionPolicy::empty()).await.unwrap();

    assert!(report.is_empty(), "unexpected report: {report}");
}

#[tokio::test]
async fn test_created_and_deleted_resources_are_reported() {
    let lister = Arc::new(MockLister::with_objects([
        config_map(NS, "a"),
        config_map(NS, "b"),
    ]));
    let check = check(&lister);

    let mut handle = check.begin().await.unwrap();
    lister.create(config_map(NS, "c"));
    lister.delete("ConfigMap", "b");
    let report = check.end(&mut handle, &ExclusionPolicy::empty()).await.unwrap();

    assert_eq!(report.added, vec![ResourceIdentity::namespaced("ConfigMap", NS, "c")]);
    assert_eq!(report.removed, vec![ResourceIdentity::namespaced("ConfigMap", NS, "b")]);
    assert!(report.changed.is_empty());
    assert_eq!(report.summary(), "1 added, 1 removed");
}

#[tokio::test]
async fn test_modified_resource_reports_field_change() {
    let lister = Arc::new(MockLister::with_objects([config_map(NS, "a")]));
    let check = check(&lister);

    let mut handle = check.begin().await.unwrap();
    lister.replace(
        RawResourceBuilder::new("ConfigMap", "a")
            .namespace(NS)
            .spec_field("data", json!({"key": "tampered"}))
            .build(),
    );
    let report = check.end(&mut handle, &ExclusionPolicy::empty()).await.unwrap();

    assert_eq!(report.changed.len(), 1);
    let change = &report.changed[0];
    assert_eq!(change.identity.name, "a");
    assert_eq!(change.fields.len(), 1);
    assert_eq!(change.fields[0].path, "/data/key");
    assert_eq!(change.fields[0].before, Some(json!("value")));
    assert_eq!(change.fields[0].after, Some(json!("tampered")));
}

#[tokio::test]
async fn test_recreated_resource_with_new_content_is_changed() {
    let lister = Arc::new(MockLister::with_objects([config_map(NS, "a")]));
    let check = check(&lister);

    let mut handle = check.begin().await.unwrap();
    lister.delete("ConfigMap", "a");
    lister.create(
        RawResourceBuilder::new("ConfigMap", "a")
            .namespace(NS)
            .spec_field("data", json!({"key": "value", "extra": "1"}))
            .build(),
    );
    let report = check.end(&mut handle, &ExclusionPolicy::empty()).await.unwrap();

    assert!(report.added.is_empty());
    assert!(report.removed.is_empty());
    assert_eq!(report.changed.len(), 1);
}

#[tokio::test]
async fn test_excluded_resources_are_ignored() {
    let lister = Arc::new(MockLister::with_objects([config_map(NS, "a")]));
    let check = check(&lister);
    let policy = ExclusionPolicy::new([
        ExclusionRule::kind("Event").with_reason("events churn on every reconcile"),
        ExclusionRule::kind("ConfigMap").with_name_pattern("leader-.*"),
    ])
    .unwrap();

    let mut handle = check.begin().await.unwrap();
    lister.create(RawResourceBuilder::new("Event", "a.17f3").namespace(NS).build());
    lister.create(config_map(NS, "leader-lock"));
    lister.create(config_map(NS, "leaked"));
    let report = check.end(&mut handle, &policy).await.unwrap();

    assert_eq!(
        report.added,
        vec![ResourceIdentity::namespaced("ConfigMap", NS, "leaked")]
    );
}

#[tokio::test]
async fn test_leaked_namespace_is_reported_cluster_scoped() {
    let lister = Arc::new(MockLister::with_objects([namespace("default")]));
    let check = check(&lister);

    let mut handle = check.begin().await.unwrap();
    lister.create(namespace("test-run-1234"));
    let report = check.end(&mut handle, &ExclusionPolicy::empty()).await.unwrap();

    assert_eq!(
        report.added,
        vec![ResourceIdentity::cluster_scoped("Namespace", "test-run-1234")]
    );
    assert_eq!(report.added[0].to_string(), "Namespace test-run-1234");
}

#[tokio::test]
async fn test_changed_secret_report_hides_values() {
    let db = RawResourceBuilder::new("Secret", "db")
        .namespace(NS)
        .spec_field("data", json!({"password": "aHVudGVyMg=="}));
    let lister = Arc::new(MockLister::with_objects([db.build()]));
    let check = check(&lister);

    let mut handle = check.begin().await.unwrap();
    lister.replace(
        db.clone()
            .spec_field("data", json!({"password": "czNjcjN0LXByb2Q="}))
            .build(),
    );
    let report = check.end(&mut handle, &ExclusionPolicy::empty()).await.unwrap();

    assert_eq!(report.changed.len(), 1);
    let change = &report.changed[0];
    assert_eq!(change.identity, ResourceIdentity::namespaced("Secret", NS, "db"));
    assert_eq!(change.fields.len(), 1);
    assert_eq!(change.fields[0].path, "/data/password");

    let json = serde_json::to_string(&report).unwrap();
    let text = report.to_string();
    for value in ["aHVudGVyMg==", "czNjcjN0LXByb2Q="] {
        assert!(!json.contains(value), "{value} leaked into {json}");
        assert!(!text.contains(value), "{value} leaked into {text}");
    }
}

#[tokio::test]
async fn test_status_changes_ignored_unless_requested() {
    let ns = RawResourceBuilder::new("Namespace", "work").status(json!({"phase": "Active"}));
    let lister = Arc::new(MockLister::with_objects([ns.build()]));

    let default_check = check(&lister);
    let status_check = EnvironmentCheck::new(
        lister.clone(),
        scope(),
        Normalizer::default().with_status(true),
        quick_retry(),
    )
    .unwrap();

    let mut default_handle = default_check.begin().await.unwrap();
    let mut status_handle = status_check.begin().await.unwrap();
    lister.replace(ns.clone().status(json!({"phase": "Terminating"})).build());

    let report = default_check
        .end(&mut default_handle, &ExclusionPolicy::empty())
        .await
        .unwrap();
    assert!(report.is_empty());

    let report = status_check
        .end(&mut status_handle, &ExclusionPolicy::empty())
        .await
        .unwrap();
    assert_eq!(report.changed.len(), 1);
    assert_eq!(report.changed[0].fields[0].path, "/status/phase");
}

#[tokio::test]
async fn test_namespace_scope_ignores_other_namespaces() {
    let lister = Arc::new(MockLister::with_objects([config_map(NS, "a")]));
    let check = EnvironmentCheck::new(
        lister.clone(),
        scope().in_namespace(NS),
        Normalizer::default(),
        quick_retry(),
    )
    .unwrap();

    let mut handle = check.begin().await.unwrap();
    lister.create(config_map("other-team", "noise"));
    lister.create(config_map(NS, "leak"));
    let report = check.end(&mut handle, &ExclusionPolicy::empty()).await.unwrap();

    assert_eq!(report.added, vec![ResourceIdentity::namespaced("ConfigMap", NS, "leak")]);
}

#[tokio::test]
async fn test_malformed_objects_are_skipped() {
    let lister = Arc::new(MockLister::with_objects([config_map(NS, "a")]));
    let check = check(&lister);

    let mut handle = check.begin().await.unwrap();
    lister.create(cluster_envcheck::RawResource::new(
        "ConfigMap",
        json!({"metadata": {"namespace": NS}}),
    ));
    lister.create(config_map(NS, "b"));
    let report = check.end(&mut handle, &ExclusionPolicy::empty()).await.unwrap();

    assert_eq!(report.added, vec![ResourceIdentity::namespaced("ConfigMap", NS, "b")]);
}

#[tokio::test]
async fn test_run_wraps_a_test_future() {
    let lister = Arc::new(MockLister::with_objects([config_map(NS, "a")]));
    let check = check(&lister);

    let test_lister = lister.clone();
    let (output, report) = check
        .run(&ExclusionPolicy::empty(), async move {
            test_lister.create(secret(NS, "forgotten"));
            "test passed"
        })
        .await
        .unwrap();

    assert_eq!(output, "test passed");
    assert_eq!(report.added, vec![ResourceIdentity::namespaced("Secret", NS, "forgotten")]);
}

#[tokio::test]
async fn test_from_config_applies_scope_and_exclusions() {
    let config = EnvCheckConfig::from_yaml_str(
        r#"
namespace: ci
kinds: [v1/ConfigMap]
exclusions:
  - kind: ConfigMap
    name_pattern: "kube-root-ca\\.crt"
snapshot_retry: fast
"#,
    )
    .unwrap();
    let lister = Arc::new(MockLister::default());
    let check = EnvironmentCheck::from_config(lister.clone(), &config).unwrap();
    assert_eq!(check.scope().namespace.as_deref(), Some(NS));

    let mut handle = check.begin().await.unwrap();
    lister.create(config_map(NS, "kube-root-ca.crt"));
    lister.create(secret(NS, "not-in-scope"));
    let report = check
        .end(&mut handle, &config.exclusion_policy().unwrap())
        .await
        .unwrap();
    assert!(report.is_empty(), "unexpected report: {report}");
}

// ============================================================================
// Failure scenarios
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_flaky_listing_is_retried() {
    let lister = Arc::new(MockLister::with_objects([config_map(NS, "a")]));
    lister.fail_next(2, InjectedFailure::Unavailable);
    let check = check(&lister);

    let mut handle = check.begin().await.unwrap();
    assert_eq!(lister.calls(), 3);
    assert_eq!(handle.before().unwrap().len(), 1);

    lister.fail_next(1, InjectedFailure::Unavailable);
    let report = check.end(&mut handle, &ExclusionPolicy::empty()).await.unwrap();
    assert!(report.is_empty());
    assert_eq!(lister.calls(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_after_capture_fails_the_check() {
    let lister = Arc::new(MockLister::with_objects([config_map(NS, "a")]));
    let check = check(&lister);

    let mut handle = check.begin().await.unwrap();
    lister.delete("ConfigMap", "a");
    lister.fail_always(Some(InjectedFailure::Unavailable));

    let err = check
        .end(&mut handle, &ExclusionPolicy::empty())
        .await
        .unwrap_err();
    match err {
        Error::SnapshotUnavailable { stage, source } => {
            assert_eq!(stage, CaptureStage::After);
            match *source {
                Error::RetriesExhausted {
                    reason, attempts, ..
                } => {
                    assert_eq!(reason, RetryStop::AttemptsExhausted);
                    assert_eq!(attempts, 4);
                }
                other => panic!("unexpected source {other}"),
            }
        }
        other => panic!("expected SnapshotUnavailable, got {other}"),
    }

    // The handle is spent even though no report was produced
    assert_eq!(handle.phase(), CheckPhase::Completed);
    lister.fail_always(None);
    let err = check
        .end(&mut handle, &ExclusionPolicy::empty())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidCheckState { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_unauthorized_is_not_retried() {
    let lister = Arc::new(MockLister::default());
    lister.fail_always(Some(InjectedFailure::Unauthorized));

    let err = check(&lister).begin().await.unwrap_err();
    match err {
        Error::SnapshotUnavailable { stage, source } => {
            assert_eq!(stage, CaptureStage::Before);
            assert!(matches!(
                *source,
                Error::RetriesExhausted {
                    reason: RetryStop::NonRetryable,
                    attempts: 1,
                    ..
                }
            ));
        }
        other => panic!("expected SnapshotUnavailable, got {other}"),
    }
    assert_eq!(lister.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_bounds_capture_time() {
    let lister = Arc::new(MockLister::default());
    lister.fail_always(Some(InjectedFailure::Unavailable));
    let retry = RetryConfig {
        max_attempts: 0,
        base_delay: Duration::from_millis(200),
        multiplier: 2.0,
        max_delay: Duration::from_secs(5),
        deadline: Some(Duration::from_secs(2)),
        jitter: 0.0,
    };
    let check =
        EnvironmentCheck::new(lister.clone(), scope(), Normalizer::default(), retry).unwrap();

    let start = tokio::time::Instant::now();
    let err = check.begin().await.unwrap_err();
    assert!(start.elapsed() <= Duration::from_secs(2));

    let Error::SnapshotUnavailable { source, .. } = err else {
        panic!("expected SnapshotUnavailable");
    };
    assert!(matches!(
        *source,
        Error::RetriesExhausted {
            reason: RetryStop::DeadlineExceeded,
            ..
        }
    ));
    // 200 + 400 + 800 ms of backoff fit in the budget, 1600 ms does not
    assert_eq!(lister.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_aborts_capture() {
    let lister = Arc::new(MockLister::default());
    lister.fail_always(Some(InjectedFailure::Unavailable));
    let token = CancellationToken::new();
    let check = check(&lister).with_cancellation(token.clone());

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });

    let err = check.begin().await.unwrap_err();
    canceller.await.unwrap();
    let Error::SnapshotUnavailable { source, .. } = err else {
        panic!("expected SnapshotUnavailable");
    };
    assert!(matches!(
        *source,
        Error::RetriesExhausted {
            reason: RetryStop::Cancelled,
            attempts: 1,
            ..
        }
    ));
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test]
async fn test_concurrent_checks_are_independent() {
    let lister = Arc::new(MockLister::with_objects([config_map(NS, "base")]));
    let check = check(&lister);

    let mut first = check.begin().await.unwrap();
    lister.create(config_map(NS, "from-first-test"));
    let mut second = check.begin().await.unwrap();
    assert_ne!(first.id(), second.id());
    lister.create(config_map(NS, "from-second-test"));

    let policy = ExclusionPolicy::empty();
    let (first_report, second_report) = tokio::join!(
        check.end(&mut first, &policy),
        check.end(&mut second, &policy),
    );
    let first_report = first_report.unwrap();
    let second_report = second_report.unwrap();

    assert_eq!(first_report.added.len(), 2);
    assert_eq!(
        second_report.added,
        vec![ResourceIdentity::namespaced("ConfigMap", NS, "from-second-test")]
    );
}

#[tokio::test]
async fn test_metrics_are_recorded() {
    let lister = Arc::new(MockLister::with_objects([config_map(NS, "a")]));
    let metrics = Arc::new(Metrics::new());
    let check = check(&lister).with_metrics(metrics.clone());

    let mut handle = check.begin().await.unwrap();
    lister.create(config_map(NS, "b"));
    check.end(&mut handle, &ExclusionPolicy::empty()).await.unwrap();

    let encoded = metrics.encode();
    assert!(encoded.contains("envcheck_snapshots_total{stage=\"before\",outcome=\"success\"} 1"));
    assert!(encoded.contains("envcheck_snapshots_total{stage=\"after\",outcome=\"success\"} 1"));
    assert!(encoded.contains("envcheck_snapshot_resources{stage=\"after\"} 2"));
    assert!(encoded.contains("envcheck_delta_entries_total{category=\"added\"} 1"));
}
