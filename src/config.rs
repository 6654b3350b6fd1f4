//! Configuration for environment checks.
//!
//! Loaded from YAML. Every field has a default, so an empty document is a
//! valid configuration that checks the default kinds cluster-wide.
//!
//! ```yaml
//! namespace: ci-run-42
//! kinds: [v1/ConfigMap, v1/Secret, apps/v1/Deployment]
//! exclusions:
//!   - kind: Event
//!     reason: events churn on every reconcile
//! sensitive_fields:
//!   by_kind:
//!     Secret: [/data, /stringData]
//! snapshot_retry: patient
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::diff::{ExclusionPolicy, ExclusionRule};
use crate::error::{Error, Result};
use crate::retry::{RetryConfig, RetryPreset};
use crate::snapshot::{ResourceKind, SensitiveFields, VolatileFields};

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "ENVCHECK_CONFIG";

/// Environment variable overriding the checked namespace
pub const NAMESPACE_ENV: &str = "ENVCHECK_NAMESPACE";

/// Default port for the health and metrics server
pub const DEFAULT_HEALTH_PORT: u16 = 8080;

/// Retry settings for snapshot capture: a preset name or an inline config.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RetrySelection {
    Preset(RetryPreset),
    Inline(RetryConfig),
}

impl Default for RetrySelection {
    fn default() -> Self {
        RetrySelection::Preset(RetryPreset::Patient)
    }
}

impl RetrySelection {
    /// The concrete configuration selected
    pub fn resolve(&self) -> RetryConfig {
        match self {
            RetrySelection::Preset(preset) => preset.config(),
            RetrySelection::Inline(config) => config.clone(),
        }
    }
}

/// Top-level configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvCheckConfig {
    /// Listing scope for namespaced kinds; cluster-wide when absent
    pub namespace: Option<String>,
    /// Kinds to snapshot
    pub kinds: Vec<ResourceKind>,
    /// Compare the status subtree too
    pub include_status: bool,
    /// Fields stripped before comparison
    pub volatile_fields: VolatileFields,
    /// Fields compared and reported only as fingerprints
    pub sensitive_fields: SensitiveFields,
    /// Resources allowed to differ
    pub exclusions: Vec<ExclusionRule>,
    /// Retry settings for both captures
    pub snapshot_retry: RetrySelection,
    /// Port of the health and metrics server
    pub health_port: u16,
}

impl Default for EnvCheckConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            kinds: ResourceKind::defaults(),
            include_status: false,
            volatile_fields: VolatileFields::default(),
            sensitive_fields: SensitiveFields::default(),
            exclusions: Vec::new(),
            snapshot_retry: RetrySelection::default(),
            health_port: DEFAULT_HEALTH_PORT,
        }
    }
}

impl EnvCheckConfig {
    /// Parse a YAML document. Empty input yields the defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Read and parse a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Load from the process environment: the file named by `ENVCHECK_CONFIG`
    /// if set, then the `ENVCHECK_NAMESPACE` override.
    pub fn load() -> Result<Self> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Like [`load`](Self::load), with a custom variable lookup.
    pub fn load_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match lookup(CONFIG_PATH_ENV).filter(|p| !p.is_empty()) {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        if let Some(namespace) = lookup(NAMESPACE_ENV).filter(|ns| !ns.is_empty()) {
            config.namespace = Some(namespace);
        }
        Ok(config)
    }

    /// Reject settings that cannot produce a meaningful check.
    pub fn validate(&self) -> Result<()> {
        if self.kinds.is_empty() {
            return Err(Error::config("at least one kind must be checked"));
        }
        ResourceKind::ensure_distinct_names(&self.kinds)?;
        if let Some(ns) = &self.namespace
            && ns.trim().is_empty()
        {
            return Err(Error::config("namespace must not be blank"));
        }
        self.snapshot_retry.resolve().validate()?;
        self.exclusion_policy()?;
        Ok(())
    }

    /// Compile the configured exclusions.
    pub fn exclusion_policy(&self) -> Result<ExclusionPolicy> {
        ExclusionPolicy::new(self.exclusions.iter().cloned())
    }
}
