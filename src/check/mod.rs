//! Environment check orchestration.
//!
//! An [`EnvironmentCheck`] captures a before-snapshot, lets the caller run a
//! test, captures an after-snapshot and reports every difference the
//! exclusion policy does not account for. Both captures go through the retry
//! engine; if either cannot be completed the check fails with
//! `SnapshotUnavailable` instead of returning an empty report.
//!
//! ## Lifecycle
//!
//! ```text
//! begin() ──> CheckHandle (Started) ──> end() ──> DeltaReport
//!                                        └─────> handle Completed, single-use
//! ```

pub mod state_machine;

pub use state_machine::{CheckEvent, CheckPhase, CheckStateMachine, TransitionResult};

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::EnvCheckConfig;
use crate::diff::{DeltaReport, ExclusionPolicy, diff};
use crate::error::{Error, Result};
use crate::health::Metrics;
use crate::retry::{self, RetryConfig, RetryPolicy};
use crate::snapshot::{Normalizer, ResourceKind, ResourceLister, ResourceSnapshot};

/// Which side of a check a capture belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureStage {
    Before,
    After,
}

impl CaptureStage {
    /// Lowercase name, used in logs and metric labels
    pub fn as_str(self) -> &'static str {
        match self {
            CaptureStage::Before => "before",
            CaptureStage::After => "after",
        }
    }
}

impl fmt::Display for CaptureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a check lists: a set of kinds, optionally restricted to a namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckScope {
    /// Kinds to snapshot
    pub kinds: BTreeSet<ResourceKind>,
    /// Namespace for namespaced kinds; `None` means cluster-wide
    pub namespace: Option<String>,
}

impl CheckScope {
    /// Scope over the given kinds, cluster-wide.
    pub fn new(kinds: impl IntoIterator<Item = ResourceKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
            namespace: None,
        }
    }

    /// Restrict namespaced kinds to one namespace.
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

/// Token for one in-progress check.
///
/// Created by [`EnvironmentCheck::begin`] in the `Started` phase and consumed
/// logically by [`EnvironmentCheck::end`], after which it is `Completed` and
/// every further use fails with `InvalidCheckState`.
#[derive(Debug)]
pub struct CheckHandle {
    id: String,
    phase: CheckPhase,
    before: Option<ResourceSnapshot>,
}

impl CheckHandle {
    /// Unique check identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> CheckPhase {
        self.phase
    }

    /// The before-snapshot, until the check ends
    pub fn before(&self) -> Option<&ResourceSnapshot> {
        self.before.as_ref()
    }

    fn apply(&mut self, event: CheckEvent) -> Result<()> {
        match CheckStateMachine::new().transition(self.phase, event) {
            TransitionResult::Success { to, description, .. } => {
                debug!(check_id = %self.id, from = %self.phase, to = %to, "{}", description);
                self.phase = to;
                Ok(())
            }
            TransitionResult::InvalidTransition { current, event } => {
                Err(Error::InvalidCheckState {
                    check_id: self.id.clone(),
                    phase: current,
                    event,
                })
            }
        }
    }
}

/// Snapshot-and-diff leak detector.
///
/// Holds no per-check state, so one instance may run any number of
/// concurrent checks.
#[derive(Clone)]
pub struct EnvironmentCheck {
    lister: Arc<dyn ResourceLister>,
    scope: CheckScope,
    normalizer: Normalizer,
    retry: RetryPolicy<Error>,
    metrics: Option<Arc<Metrics>>,
    cancel: CancellationToken,
}

impl EnvironmentCheck {
    /// Create a check over `scope`, retrying captures per `retry`.
    ///
    /// Fails when `retry` is invalid or unbounded, or when two kinds in the
    /// scope share a kind name.
    pub fn new(
        lister: Arc<dyn ResourceLister>,
        scope: CheckScope,
        normalizer: Normalizer,
        retry: RetryConfig,
    ) -> Result<Self> {
        retry.validate()?;
        ResourceKind::ensure_distinct_names(&scope.kinds)?;
        Ok(Self {
            lister,
            scope,
            normalizer,
            retry: RetryPolicy::from_config(retry),
            metrics: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Create a check from validated configuration.
    pub fn from_config(lister: Arc<dyn ResourceLister>, config: &EnvCheckConfig) -> Result<Self> {
        config.validate()?;
        let mut scope = CheckScope::new(config.kinds.iter().cloned());
        scope.namespace = config.namespace.clone();
        let normalizer = Normalizer::new(config.volatile_fields.clone())
            .with_sensitive(config.sensitive_fields.clone())
            .with_status(config.include_status);
        Self::new(lister, scope, normalizer, config.snapshot_retry.resolve())
    }

    /// Record capture and report metrics.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Abort captures when `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// The scope this check lists
    pub fn scope(&self) -> &CheckScope {
        &self.scope
    }

    /// Capture the before-snapshot and start a check.
    pub async fn begin(&self) -> Result<CheckHandle> {
        let mut handle = CheckHandle {
            id: Uuid::new_v4().to_string(),
            phase: CheckPhase::Idle,
            before: None,
        };
        let snapshot = self.capture(CaptureStage::Before, &handle.id).await?;
        handle.before = Some(snapshot);
        handle.apply(CheckEvent::Begin)?;

        info!(
            check_id = %handle.id,
            resources = handle.before.as_ref().map_or(0, ResourceSnapshot::len),
            "Environment check started"
        );
        Ok(handle)
    }

    /// Capture the after-snapshot and report unexpected differences.
    ///
    /// The handle is `Completed` once this returns, whether or not the
    /// after-capture succeeded.
    pub async fn end(&self, handle: &mut CheckHandle, policy: &ExclusionPolicy) -> Result<DeltaReport> {
        handle.apply(CheckEvent::End)?;
        let before = handle.before.take().ok_or_else(|| Error::InvalidCheckState {
            check_id: handle.id.clone(),
            phase: CheckPhase::Started,
            event: CheckEvent::End,
        })?;

        let after = self.capture(CaptureStage::After, &handle.id).await?;
        let report = diff(&before, &after, policy);

        if let Some(metrics) = &self.metrics {
            metrics.record_report(&report);
        }
        info!(
            check_id = %handle.id,
            entries = report.entry_count(),
            summary = %report.summary(),
            "Environment check completed"
        );
        Ok(report)
    }

    /// Run `test` between a before- and an after-capture.
    ///
    /// The test output is returned alongside the report even when the report
    /// is not empty; deciding what a leak means is the caller's job.
    pub async fn run<T>(
        &self,
        policy: &ExclusionPolicy,
        test: impl Future<Output = T>,
    ) -> Result<(T, DeltaReport)> {
        let mut handle = self.begin().await?;
        let output = test.await;
        let report = self.end(&mut handle, policy).await?;
        Ok((output, report))
    }

    /// List and normalize one snapshot under the retry policy.
    async fn capture(&self, stage: CaptureStage, check_id: &str) -> Result<ResourceSnapshot> {
        let operation = format!("capture_{stage}");
        let start = Instant::now();
        let namespace = self.scope.namespace.as_deref();

        let outcome = retry::run(&self.retry, &self.cancel, &operation, || {
            self.lister.list(&self.scope.kinds, namespace)
        })
        .await;

        let attempts = outcome.attempts();
        if let Some(metrics) = &self.metrics {
            metrics.record_retry_attempts(&operation, attempts);
        }

        let raws = match outcome.into_result(&operation) {
            Ok(raws) => raws,
            Err(e) => {
                error!(check_id = %check_id, stage = %stage, error = %e, "Snapshot capture failed");
                if let Some(metrics) = &self.metrics {
                    metrics.record_snapshot_failure(stage, start.elapsed().as_secs_f64());
                }
                return Err(Error::SnapshotUnavailable {
                    stage,
                    source: Box::new(e),
                });
            }
        };

        let snapshot = self.normalizer.snapshot(&raws, Timestamp::now());
        if let Some(metrics) = &self.metrics {
            metrics.record_snapshot(
                stage,
                start.elapsed().as_secs_f64(),
                snapshot.len(),
                snapshot.skipped(),
            );
        }
        info!(
            check_id = %check_id,
            stage = %stage,
            resources = snapshot.len(),
            skipped = snapshot.skipped(),
            attempts,
            "Snapshot captured"
        );
        Ok(snapshot)
    }
}

impl fmt::Debug for EnvironmentCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvironmentCheck")
            .field("scope", &self.scope)
            .field("normalizer", &self.normalizer)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use crate::snapshot::RawResource;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Lister returning a fixed, swappable set of objects.
    #[derive(Default)]
    struct StaticLister {
        objects: Mutex<Vec<RawResource>>,
    }

    impl StaticLister {
        fn set(&self, objects: Vec<RawResource>) {
            *self.objects.lock().unwrap() = objects;
        }
    }

    #[async_trait]
    impl ResourceLister for StaticLister {
        async fn list(
            &self,
            _kinds: &BTreeSet<ResourceKind>,
            _namespace: Option<&str>,
        ) -> Result<Vec<RawResource>> {
            Ok(self.objects.lock().unwrap().clone())
        }
    }

    struct DownLister;

    #[async_trait]
    impl ResourceLister for DownLister {
        async fn list(
            &self,
            _kinds: &BTreeSet<ResourceKind>,
            _namespace: Option<&str>,
        ) -> Result<Vec<RawResource>> {
            Err(Error::api_unavailable("connection refused"))
        }
    }

    fn config_map(name: &str) -> RawResource {
        RawResource::new(
            "ConfigMap",
            json!({"metadata": {"name": name, "namespace": "ns"}, "data": {"k": "v"}}),
        )
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            multiplier: 2.0,
            max_delay: Duration::from_millis(100),
            deadline: None,
            jitter: 0.0,
        }
    }

    fn check(lister: Arc<dyn ResourceLister>) -> EnvironmentCheck {
        EnvironmentCheck::new(
            lister,
            CheckScope::new([ResourceKind::core("ConfigMap")]),
            Normalizer::default(),
            fast_retry(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_begin_end_reports_added() {
        let lister = Arc::new(StaticLister::default());
        lister.set(vec![config_map("a")]);
        let check = check(lister.clone());

        let mut handle = check.begin().await.unwrap();
        assert_eq!(handle.phase(), CheckPhase::Started);
        assert_eq!(handle.before().unwrap().len(), 1);

        lister.set(vec![config_map("a"), config_map("b")]);
        let report = check.end(&mut handle, &ExclusionPolicy::empty()).await.unwrap();
        assert_eq!(report.added.len(), 1);
        assert_eq!(report.added[0].name, "b");
        assert_eq!(handle.phase(), CheckPhase::Completed);
    }

    #[tokio::test]
    async fn test_handle_is_single_use() {
        let lister = Arc::new(StaticLister::default());
        let check = check(lister);
        let mut handle = check.begin().await.unwrap();
        check.end(&mut handle, &ExclusionPolicy::empty()).await.unwrap();

        let err = check
            .end(&mut handle, &ExclusionPolicy::empty())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidCheckState {
                phase: CheckPhase::Completed,
                event: CheckEvent::End,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_api_is_never_an_empty_report() {
        let err = check(Arc::new(DownLister)).begin().await.unwrap_err();
        match err {
            Error::SnapshotUnavailable { stage, source } => {
                assert_eq!(stage, CaptureStage::Before);
                assert!(matches!(*source, Error::RetriesExhausted { attempts: 3, .. }));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_capture_is_unavailable() {
        let token = CancellationToken::new();
        token.cancel();
        let check = check(Arc::new(StaticLister::default())).with_cancellation(token);
        let err = check.begin().await.unwrap_err();
        assert!(matches!(
            err,
            Error::SnapshotUnavailable {
                stage: CaptureStage::Before,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_run_returns_test_output() {
        let lister = Arc::new(StaticLister::default());
        let check = check(lister.clone());
        let (output, report) = check
            .run(&ExclusionPolicy::empty(), async { 7 })
            .await
            .unwrap();
        assert_eq!(output, 7);
        assert!(report.is_empty());
    }

    #[test]
    fn test_unbounded_retry_is_rejected() {
        let unbounded = RetryConfig {
            max_attempts: 0,
            deadline: None,
            ..fast_retry()
        };
        let err = EnvironmentCheck::new(
            Arc::new(DownLister),
            CheckScope::new([ResourceKind::core("ConfigMap")]),
            Normalizer::default(),
            unbounded,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_only_retry_terminates() {
        let deadline_only = RetryConfig {
            max_attempts: 0,
            deadline: Some(Duration::from_secs(1)),
            ..fast_retry()
        };
        let check = EnvironmentCheck::new(
            Arc::new(DownLister),
            CheckScope::new([ResourceKind::core("ConfigMap")]),
            Normalizer::default(),
            deadline_only,
        )
        .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(3600), check.begin())
            .await
            .expect("begin should give up at the deadline");
        assert!(matches!(
            result,
            Err(Error::SnapshotUnavailable {
                stage: CaptureStage::Before,
                ..
            })
        ));
    }

    #[test]
    fn test_colliding_kind_names_are_rejected() {
        let scope = CheckScope::new([
            ResourceKind::core("Event"),
            ResourceKind::new("events.k8s.io", "v1", "Event"),
        ]);
        let err =
            EnvironmentCheck::new(Arc::new(DownLister), scope, Normalizer::default(), fast_retry())
                .unwrap_err();
        assert!(err.to_string().contains("Event"));
    }

    #[test]
    fn test_capture_stage_display() {
        assert_eq!(CaptureStage::Before.to_string(), "before");
        assert_eq!(CaptureStage::After.to_string(), "after");
    }
}
