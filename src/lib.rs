//! cluster-envcheck library crate
//!
//! Detects resources a test leaves behind (or alters) in a Kubernetes
//! cluster. A check snapshots the configured kinds before the test, snapshots
//! them again afterwards and reports every difference that no exclusion rule
//! accounts for.
//!
//! ## Architecture
//!
//! - `snapshot`: listing, normalization and the snapshot data model
//! - `diff`: pure snapshot comparison and exclusion rules
//! - `retry`: bounded backoff used for every cluster API call
//! - `check`: the begin/end orchestrator and its state machine
//! - `config`, `health`, `error`: configuration, metrics/probes, error types
//!
//! ```ignore
//! let lister = Arc::new(KubeResourceLister::new(client));
//! let check = EnvironmentCheck::from_config(lister, &config)?;
//! let (result, report) = check.run(&config.exclusion_policy()?, my_test()).await?;
//! assert!(report.is_empty(), "leaked resources:\n{report}");
//! ```

pub mod check;
pub mod config;
pub mod diff;
pub mod error;
pub mod health;
pub mod retry;
pub mod snapshot;

pub use check::{CaptureStage, CheckHandle, CheckPhase, CheckScope, EnvironmentCheck};
pub use config::EnvCheckConfig;
pub use diff::{DeltaReport, ExclusionPolicy, ExclusionRule, FieldChange, ResourceChange, diff};
pub use error::{Error, Result};
pub use health::{HealthState, Metrics};
pub use retry::{RetryConfig, RetryOutcome, RetryPolicy, RetryPreset, RetryStop, Retryable};
pub use snapshot::{
    KubeResourceLister, RawResource, ResourceIdentity, ResourceKind, ResourceLister,
    ResourceRecord, ResourceSnapshot,
};
