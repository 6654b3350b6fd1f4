//! Point-in-time snapshots of cluster resources.
//!
//! A snapshot is built in two steps: a [`ResourceLister`] fetches raw objects
//! from the cluster, then a [`Normalizer`] strips volatile fields so that two
//! snapshots of an unmodified resource compare equal.
//!
//! ## Architecture
//!
//! - `kind`: `ResourceKind`, the group/version/kind triple a lister is asked for
//! - `lister`: the `ResourceLister` I/O boundary and its kube-rs implementation
//! - `normalizer`: volatile field stripping and canonical flattening

mod kind;
pub mod lister;
pub mod normalizer;

pub use kind::ResourceKind;
pub use lister::{KubeResourceLister, RawResource, ResourceLister};
pub use normalizer::{FieldPath, Normalizer, SensitiveFields, VolatileFields};

use std::collections::BTreeMap;
use std::fmt;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable identity of a cluster object.
///
/// Ordering is by (kind, namespace, name). Cluster-scoped objects have no
/// namespace and sort before namespaced objects of the same kind.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceIdentity {
    /// Kind name, e.g. `ConfigMap`
    pub kind: String,
    /// Namespace, `None` for cluster-scoped objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ResourceIdentity {
    /// Identity of a namespaced object.
    pub fn namespaced(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Identity of a cluster-scoped object.
    pub fn cluster_scoped(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: None,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Normalized representation of one cluster object.
///
/// `fields` maps JSON-pointer leaf paths (e.g. `/spec/replicas`) to values,
/// with volatile fields already removed. Two records of the same unmodified
/// object observed at different times are equal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    identity: ResourceIdentity,
    fields: BTreeMap<String, Value>,
}

impl ResourceRecord {
    /// Create a record from an identity and already-normalized fields.
    pub fn new(identity: ResourceIdentity, fields: BTreeMap<String, Value>) -> Self {
        Self { identity, fields }
    }

    /// Identity of the object this record describes
    pub fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }

    /// All normalized fields, sorted by path
    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Value at a normalized leaf path
    pub fn field(&self, path: &str) -> Option<&Value> {
        self.fields.get(path)
    }
}

/// Immutable point-in-time set of normalized records keyed by identity.
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceSnapshot {
    captured_at: Timestamp,
    records: BTreeMap<ResourceIdentity, ResourceRecord>,
    skipped: usize,
}

impl ResourceSnapshot {
    /// Build a snapshot from records. Later records win on duplicate identity.
    pub fn from_records(
        captured_at: Timestamp,
        records: impl IntoIterator<Item = ResourceRecord>,
    ) -> Self {
        let records = records
            .into_iter()
            .map(|r| (r.identity.clone(), r))
            .collect();
        Self {
            captured_at,
            records,
            skipped: 0,
        }
    }

    pub(crate) fn with_skipped(mut self, skipped: usize) -> Self {
        self.skipped = skipped;
        self
    }

    /// When the underlying listing completed
    pub fn captured_at(&self) -> Timestamp {
        self.captured_at
    }

    /// Number of objects excluded because they could not be normalized
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the snapshot holds no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Look up a record by identity
    pub fn get(&self, identity: &ResourceIdentity) -> Option<&ResourceRecord> {
        self.records.get(identity)
    }

    /// Whether a record with this identity exists
    pub fn contains(&self, identity: &ResourceIdentity) -> bool {
        self.records.contains_key(identity)
    }

    /// Records in (kind, namespace, name) order
    pub fn records(&self) -> impl Iterator<Item = &ResourceRecord> {
        self.records.values()
    }

    /// Identities in (kind, namespace, name) order
    pub fn identities(&self) -> impl Iterator<Item = &ResourceIdentity> {
        self.records.keys()
    }
}
