//! Volatile field stripping and canonical flattening of raw objects.
//!
//! The normalizer removes every field that changes without a user action
//! (resource versions, UIDs, timestamps, managed fields, controller-written
//! annotations, the status subtree) and flattens what remains into sorted
//! JSON-pointer leaf paths. The set of volatile paths is configuration: a
//! fixed floor that is always removed, plus per-kind additions.
//!
//! Leaves under a sensitive path (Secret `data` by default) are replaced by a
//! SHA-256 fingerprint, so a report shows that a credential changed without
//! carrying its value.

use std::collections::BTreeMap;
use std::fmt;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::lister::RawResource;
use super::{ResourceIdentity, ResourceRecord, ResourceSnapshot};
use crate::error::{Error, Result};

/// Paths removed from every object regardless of configuration.
const ALWAYS_STRIPPED: &[&str] = &[
    "/apiVersion",
    "/kind",
    "/metadata/name",
    "/metadata/namespace",
    "/metadata/resourceVersion",
    "/metadata/uid",
    "/metadata/creationTimestamp",
    "/metadata/deletionTimestamp",
    "/metadata/deletionGracePeriodSeconds",
    "/metadata/managedFields",
    "/metadata/generation",
    "/metadata/selfLink",
];

const STATUS_PATH: &str = "/status";
const FINGERPRINT_PREFIX: &str = "sha256:";
const OWNER_REFERENCES: &str = "ownerReferences";

/// An RFC 6901 JSON pointer naming a field inside an object.
///
/// `/` inside a key is written `~1` and `~` is written `~0`, so the
/// annotation `deployment.kubernetes.io/revision` is
/// `/metadata/annotations/deployment.kubernetes.io~1revision`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath {
    pointer: String,
    segments: Vec<String>,
}

impl FieldPath {
    /// Parse and validate a JSON pointer.
    pub fn parse(pointer: &str) -> Result<Self> {
        let Some(rest) = pointer.strip_prefix('/') else {
            return Err(Error::config(format!(
                "field path '{}' must start with '/'",
                pointer
            )));
        };
        let segments = rest
            .split('/')
            .map(|raw| unescape_segment(raw).ok_or_else(|| invalid_escape(pointer)))
            .collect::<Result<Vec<_>>>()?;
        if segments.iter().any(String::is_empty) {
            return Err(Error::config(format!(
                "field path '{}' contains an empty segment",
                pointer
            )));
        }
        Ok(Self {
            pointer: pointer.to_string(),
            segments,
        })
    }

    /// The pointer as written
    pub fn as_str(&self) -> &str {
        &self.pointer
    }

    /// Unescaped path segments
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Remove the field this path names from `root`, if present.
    fn remove_from(&self, root: &mut Value) {
        let Some((last, parents)) = self.segments.split_last() else {
            return;
        };
        let mut current = root;
        for segment in parents {
            current = match current {
                Value::Object(map) => match map.get_mut(segment) {
                    Some(next) => next,
                    None => return,
                },
                Value::Array(items) => match segment
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| items.get_mut(i))
                {
                    Some(next) => next,
                    None => return,
                },
                _ => return,
            };
        }
        match current {
            Value::Object(map) => {
                map.remove(last);
            }
            Value::Array(items) => {
                if let Ok(index) = last.parse::<usize>()
                    && index < items.len()
                {
                    items.remove(index);
                }
            }
            _ => {}
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pointer)
    }
}

impl TryFrom<String> for FieldPath {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> Self {
        path.pointer
    }
}

fn unescape_segment(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '~' {
            match chars.next() {
                Some('0') => out.push('~'),
                Some('1') => out.push('/'),
                _ => return None,
            }
        } else {
            out.push(c);
        }
    }
    Some(out)
}

fn escape_segment(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

fn invalid_escape(pointer: &str) -> Error {
    Error::config(format!(
        "field path '{}' contains an invalid '~' escape (use ~0 or ~1)",
        pointer
    ))
}

/// Volatile field paths beyond the fixed floor.
///
/// `always` applies to every kind, `by_kind` adds paths for one kind name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolatileFields {
    /// Paths stripped from every kind
    pub always: Vec<FieldPath>,
    /// Extra paths stripped per kind name
    pub by_kind: BTreeMap<String, Vec<FieldPath>>,
}

impl Default for VolatileFields {
    fn default() -> Self {
        let paths = |ps: &[&str]| -> Vec<FieldPath> {
            ps.iter().filter_map(|p| FieldPath::parse(p).ok()).collect()
        };

        let mut by_kind = BTreeMap::new();
        by_kind.insert(
            "Deployment".to_string(),
            paths(&["/metadata/annotations/deployment.kubernetes.io~1revision"]),
        );
        by_kind.insert("ServiceAccount".to_string(), paths(&["/secrets"]));
        by_kind.insert(
            "Service".to_string(),
            paths(&["/spec/clusterIP", "/spec/clusterIPs"]),
        );
        by_kind.insert(
            "Endpoints".to_string(),
            paths(&["/metadata/annotations/endpoints.kubernetes.io~1last-change-trigger-time"]),
        );
        by_kind.insert("Pod".to_string(), paths(&["/spec/nodeName"]));
        by_kind.insert("Namespace".to_string(), paths(&["/spec/finalizers"]));
        by_kind.insert(
            "PersistentVolumeClaim".to_string(),
            paths(&[
                "/metadata/annotations/pv.kubernetes.io~1bind-completed",
                "/metadata/annotations/pv.kubernetes.io~1bound-by-controller",
            ]),
        );

        Self {
            always: paths(&["/metadata/annotations/kubectl.kubernetes.io~1last-applied-configuration"]),
            by_kind,
        }
    }
}

impl VolatileFields {
    /// No configurable paths; only the fixed floor is stripped.
    pub fn none() -> Self {
        Self {
            always: Vec::new(),
            by_kind: BTreeMap::new(),
        }
    }

    /// Add a path stripped from one kind.
    pub fn with_kind_path(mut self, kind: impl Into<String>, path: FieldPath) -> Self {
        self.by_kind.entry(kind.into()).or_default().push(path);
        self
    }

    /// Paths that apply to the given kind, `always` first.
    fn for_kind<'a>(&'a self, kind: &str) -> impl Iterator<Item = &'a FieldPath> {
        self.always
            .iter()
            .chain(self.by_kind.get(kind).into_iter().flatten())
    }
}

/// Paths whose leaf values are kept only as a fingerprint, per kind name.
///
/// A path covers the leaf it names and every leaf below it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensitiveFields {
    /// Fingerprinted paths per kind name
    pub by_kind: BTreeMap<String, Vec<FieldPath>>,
}

impl Default for SensitiveFields {
    fn default() -> Self {
        let secret = ["/data", "/stringData"]
            .iter()
            .filter_map(|p| FieldPath::parse(p).ok())
            .collect();
        Self {
            by_kind: BTreeMap::from([("Secret".to_string(), secret)]),
        }
    }
}

impl SensitiveFields {
    /// Keep every value in clear text.
    pub fn none() -> Self {
        Self {
            by_kind: BTreeMap::new(),
        }
    }

    /// Add a fingerprinted path for one kind.
    pub fn with_kind_path(mut self, kind: impl Into<String>, path: FieldPath) -> Self {
        self.by_kind.entry(kind.into()).or_default().push(path);
        self
    }

    /// Replace every leaf under a sensitive path of `kind` with its fingerprint.
    fn mask(&self, kind: &str, fields: &mut BTreeMap<String, Value>) {
        let Some(paths) = self.by_kind.get(kind) else {
            return;
        };
        for (pointer, value) in fields.iter_mut() {
            let covered = paths.iter().any(|path| {
                pointer
                    .strip_prefix(path.as_str())
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
            });
            if covered {
                *value = fingerprint(value);
            }
        }
    }
}

/// `sha256:<hex>` digest of a leaf; strings are hashed as their raw bytes.
fn fingerprint(value: &Value) -> Value {
    let digest = match value {
        Value::String(s) => Sha256::digest(s.as_bytes()),
        other => Sha256::digest(other.to_string().as_bytes()),
    };
    Value::String(format!("{}{}", FINGERPRINT_PREFIX, hex::encode(digest)))
}

/// Turns raw API objects into comparable records.
#[derive(Clone, Debug, Default)]
pub struct Normalizer {
    volatile: VolatileFields,
    sensitive: SensitiveFields,
    include_status: bool,
}

impl Normalizer {
    /// Create a normalizer with the given volatile paths.
    pub fn new(volatile: VolatileFields) -> Self {
        Self {
            volatile,
            sensitive: SensitiveFields::default(),
            include_status: false,
        }
    }

    /// Replace the set of fingerprinted paths.
    pub fn with_sensitive(mut self, sensitive: SensitiveFields) -> Self {
        self.sensitive = sensitive;
        self
    }

    /// Compare the status subtree instead of stripping it.
    pub fn with_status(mut self, include_status: bool) -> Self {
        self.include_status = include_status;
        self
    }

    /// Normalize one raw object.
    ///
    /// Fails with `MalformedResource` when the object has no readable name
    /// or namespace; the caller decides whether to skip or abort.
    pub fn normalize(&self, raw: &RawResource) -> Result<ResourceRecord> {
        let identity = identify(raw)?;

        let mut object = raw.object.clone();
        for pointer in ALWAYS_STRIPPED {
            remove_pointer(&mut object, pointer);
        }
        if !self.include_status {
            remove_pointer(&mut object, STATUS_PATH);
        }
        for path in self.volatile.for_kind(&identity.kind) {
            path.remove_from(&mut object);
        }
        reduce_owner_references(&mut object);

        let mut fields = BTreeMap::new();
        flatten(&mut String::new(), &object, &mut fields);
        self.sensitive.mask(&identity.kind, &mut fields);
        Ok(ResourceRecord::new(identity, fields))
    }

    /// Normalize a listing into a snapshot.
    ///
    /// Objects that fail normalization are logged and left out, so one bad
    /// object does not prevent leak detection for everything else.
    pub fn snapshot(&self, raws: &[RawResource], captured_at: Timestamp) -> ResourceSnapshot {
        let mut records: BTreeMap<ResourceIdentity, ResourceRecord> = BTreeMap::new();
        let mut skipped = 0usize;

        for raw in raws {
            match self.normalize(raw) {
                Ok(record) => {
                    if let Some(previous) = records.insert(record.identity().clone(), record) {
                        warn!(
                            resource = %previous.identity(),
                            "Duplicate identity in listing, keeping the later object"
                        );
                    }
                }
                Err(e) => {
                    skipped += 1;
                    warn!(kind = %raw.kind, error = %e, "Skipping malformed resource");
                }
            }
        }

        debug!(
            records = records.len(),
            skipped = skipped,
            "Normalized snapshot"
        );
        ResourceSnapshot::from_records(captured_at, records.into_values()).with_skipped(skipped)
    }
}

/// Read the identity of a raw object.
fn identify(raw: &RawResource) -> Result<ResourceIdentity> {
    let malformed =
        |ns: Option<String>, name: &str, reason: &str| Error::malformed(&raw.kind, ns, name, reason);

    let Some(metadata) = raw.object.get("metadata").and_then(Value::as_object) else {
        return Err(malformed(None, "<unknown>", "object has no metadata map"));
    };

    let namespace = match metadata.get("namespace") {
        None | Some(Value::Null) => None,
        Some(Value::String(ns)) if ns.is_empty() => None,
        Some(Value::String(ns)) => Some(ns.clone()),
        Some(_) => {
            let name = metadata
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("<unknown>");
            return Err(malformed(None, name, "metadata.namespace is not a string"));
        }
    };

    match metadata.get("name") {
        Some(Value::String(name)) if !name.is_empty() => Ok(ResourceIdentity {
            kind: raw.kind.clone(),
            namespace,
            name: name.clone(),
        }),
        Some(Value::String(_)) => Err(malformed(namespace, "<unknown>", "metadata.name is empty")),
        Some(_) => Err(malformed(
            namespace,
            "<unknown>",
            "metadata.name is not a string",
        )),
        None => Err(malformed(namespace, "<unknown>", "metadata.name is missing")),
    }
}

fn remove_pointer(root: &mut Value, pointer: &str) {
    if let Ok(path) = FieldPath::parse(pointer) {
        path.remove_from(root);
    }
}

/// Keep only the stable parts of owner references and sort them.
///
/// UIDs change when an owner is recreated under the same name, which is an
/// identity-preserving event for leak detection.
fn reduce_owner_references(object: &mut Value) {
    let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) else {
        return;
    };
    let Some(Value::Array(refs)) = metadata.get_mut(OWNER_REFERENCES) else {
        return;
    };

    let mut reduced: Vec<Value> = refs
        .iter()
        .filter_map(Value::as_object)
        .map(|r| {
            let mut kept = Map::new();
            for key in ["apiVersion", "kind", "name", "controller"] {
                if let Some(v) = r.get(key) {
                    kept.insert(key.to_string(), v.clone());
                }
            }
            Value::Object(kept)
        })
        .collect();
    reduced.sort_by_key(|r| {
        ["apiVersion", "kind", "name"].map(|k| {
            r.get(k)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        })
    });
    *refs = reduced;
}

/// Flatten `value` into leaf paths under `prefix`.
///
/// Objects recurse by key, arrays by index. Empty objects and nulls are
/// treated as absent so that stripping the last key of a map does not leave
/// a spurious `{}` behind. Empty arrays are kept as leaves.
fn flatten(prefix: &mut String, value: &Value, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Null => {}
        Value::Object(map) => {
            for (key, child) in map {
                let len = prefix.len();
                prefix.push('/');
                prefix.push_str(&escape_segment(key));
                flatten(prefix, child, out);
                prefix.truncate(len);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (index, child) in items.iter().enumerate() {
                let len = prefix.len();
                prefix.push('/');
                prefix.push_str(&index.to_string());
                flatten(prefix, child, out);
                prefix.truncate(len);
            }
        }
        leaf => {
            out.insert(prefix.clone(), leaf.clone());
        }
    }
}
