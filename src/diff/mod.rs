//! Structured comparison of two resource snapshots.
//!
//! Identity, not object lineage, is the comparison key: an object deleted and
//! recreated under the same kind/namespace/name with a different spec is
//! reported as changed. Every candidate entry passes through the exclusion
//! policy before it reaches the report, and all sequences come out sorted by
//! (kind, namespace, name) because snapshots iterate in that order.

pub mod exclusion;

pub use exclusion::{ExclusionPolicy, ExclusionRule};

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::snapshot::{ResourceIdentity, ResourceRecord, ResourceSnapshot};

/// A change to a single normalized field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    /// JSON-pointer leaf path
    pub path: String,
    /// Value before, `None` if the field was added
    pub before: Option<Value>,
    /// Value after, `None` if the field was removed
    pub after: Option<Value>,
}

/// A resource present in both snapshots with differing fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceChange {
    /// Which resource changed
    pub identity: ResourceIdentity,
    /// Field-level differences, sorted by path
    pub fields: Vec<FieldChange>,
}

/// Unexpected differences between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaReport {
    /// Present only after
    pub added: Vec<ResourceIdentity>,
    /// Present only before
    pub removed: Vec<ResourceIdentity>,
    /// Present in both with at least one differing field
    pub changed: Vec<ResourceChange>,
}

impl DeltaReport {
    /// Whether no differences were found
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    /// Total number of reported resources across all categories
    pub fn entry_count(&self) -> usize {
        self.added.len() + self.removed.len() + self.changed.len()
    }

    /// Every reported identity, in category order
    pub fn identities(&self) -> impl Iterator<Item = &ResourceIdentity> {
        self.added
            .iter()
            .chain(self.removed.iter())
            .chain(self.changed.iter().map(|c| &c.identity))
    }

    /// One-line summary, e.g. `1 added, 2 changed (5 fields)`.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.added.is_empty() {
            parts.push(format!("{} added", self.added.len()));
        }
        if !self.removed.is_empty() {
            parts.push(format!("{} removed", self.removed.len()));
        }
        if !self.changed.is_empty() {
            let fields: usize = self.changed.iter().map(|c| c.fields.len()).sum();
            parts.push(format!(
                "{} changed ({} field{})",
                self.changed.len(),
                fields,
                if fields == 1 { "" } else { "s" }
            ));
        }

        if parts.is_empty() {
            "no differences".to_string()
        } else {
            parts.join(", ")
        }
    }
}

impl fmt::Display for DeltaReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.summary())?;
        for id in &self.added {
            writeln!(f, "  + {id}")?;
        }
        for id in &self.removed {
            writeln!(f, "  - {id}")?;
        }
        for change in &self.changed {
            writeln!(f, "  ~ {}", change.identity)?;
            for field in &change.fields {
                writeln!(
                    f,
                    "      {}: {} -> {}",
                    field.path,
                    render(field.before.as_ref()),
                    render(field.after.as_ref())
                )?;
            }
        }
        Ok(())
    }
}

fn render(value: Option<&Value>) -> String {
    value.map_or_else(|| "<absent>".to_string(), Value::to_string)
}

/// Compare two snapshots.
///
/// Pure: performs no I/O and never mutates its inputs. `diff(s, s, p)` is
/// always empty.
pub fn diff(
    before: &ResourceSnapshot,
    after: &ResourceSnapshot,
    policy: &ExclusionPolicy,
) -> DeltaReport {
    let mut report = DeltaReport::default();

    for old in before.records() {
        let identity = old.identity();
        if policy.is_excluded(identity) {
            continue;
        }
        match after.get(identity) {
            None => report.removed.push(identity.clone()),
            Some(new) => {
                let fields = diff_fields(old, new);
                if !fields.is_empty() {
                    report.changed.push(ResourceChange {
                        identity: identity.clone(),
                        fields,
                    });
                }
            }
        }
    }

    report.added = after
        .identities()
        .filter(|id| !before.contains(id) && !policy.is_excluded(id))
        .cloned()
        .collect();

    report
}

/// Field-level differences between two records of the same identity.
fn diff_fields(old: &ResourceRecord, new: &ResourceRecord) -> Vec<FieldChange> {
    let paths: BTreeSet<&String> = old.fields().keys().chain(new.fields().keys()).collect();
    paths
        .into_iter()
        .filter_map(|path| {
            let before = old.fields().get(path);
            let after = new.fields().get(path);
            (before != after).then(|| FieldChange {
                path: path.clone(),
                before: before.cloned(),
                after: after.cloned(),
            })
        })
        .collect()
}
