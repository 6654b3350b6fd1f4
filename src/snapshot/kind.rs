//! Resource kinds a lister can be asked for.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use kube::api::{ApiResource, GroupVersionKind};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Built-in kinds that are cluster-scoped. Anything else parsed from the
/// short string form is assumed to be namespaced.
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "APIService",
    "CSIDriver",
    "CSINode",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "IngressClass",
    "MutatingWebhookConfiguration",
    "Namespace",
    "Node",
    "PersistentVolume",
    "PriorityClass",
    "RuntimeClass",
    "StorageClass",
    "ValidatingWebhookConfiguration",
    "VolumeAttachment",
];

/// A group/version/kind to list, plus the scope and plural needed to build a
/// kube `ApiResource` for it.
///
/// Written in configuration either as a string (`ConfigMap`, `v1/ConfigMap`,
/// `apps/v1/Deployment`, `snapshot.storage.k8s.io/v1/VolumeSnapshot`) or as a
/// map with explicit `group`, `version`, `kind`, `plural` and `namespaced`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "KindRepr")]
pub struct ResourceKind {
    /// API group, empty for the core group
    pub group: String,
    /// API version
    pub version: String,
    /// Kind name
    pub kind: String,
    /// Plural resource name, derived from the kind when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plural: Option<String>,
    /// Whether objects of this kind live in a namespace
    pub namespaced: bool,
}

impl ResourceKind {
    /// A kind in the core (`v1`) group.
    pub fn core(kind: &str) -> Self {
        Self::new("", "v1", kind)
    }

    /// A kind in a named group, with scope inferred from the built-in table.
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: None,
            namespaced: !CLUSTER_SCOPED_KINDS.contains(&kind),
        }
    }

    /// Override the plural resource name.
    pub fn with_plural(mut self, plural: impl Into<String>) -> Self {
        self.plural = Some(plural.into());
        self
    }

    /// Override the scope.
    pub fn with_namespaced(mut self, namespaced: bool) -> Self {
        self.namespaced = namespaced;
        self
    }

    /// `apiVersion` string for this kind
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Build the kube `ApiResource` used for dynamic listing.
    pub fn api_resource(&self) -> ApiResource {
        let gvk = GroupVersionKind::gvk(&self.group, &self.version, &self.kind);
        match &self.plural {
            Some(plural) => ApiResource::from_gvk_with_plural(&gvk, plural),
            None => ApiResource::from_gvk(&gvk),
        }
    }

    /// Reject kind sets where two different entries share a kind name.
    ///
    /// Resource identities carry only the kind name, so `v1/Event` and
    /// `events.k8s.io/v1/Event` would collapse into one identity.
    pub fn ensure_distinct_names<'a>(
        kinds: impl IntoIterator<Item = &'a ResourceKind>,
    ) -> crate::error::Result<()> {
        let mut seen: BTreeMap<&str, &ResourceKind> = BTreeMap::new();
        for kind in kinds {
            if let Some(other) = seen.insert(&kind.kind, kind)
                && other != kind
            {
                return Err(Error::config(format!(
                    "kinds {} and {} share the kind name '{}'",
                    other, kind, kind.kind
                )));
            }
        }
        Ok(())
    }

    /// Kinds checked when configuration does not name any.
    pub fn defaults() -> Vec<ResourceKind> {
        vec![
            Self::core("ConfigMap"),
            Self::core("Secret"),
            Self::core("Service"),
            Self::core("ServiceAccount"),
            Self::core("PersistentVolumeClaim"),
            Self::core("Pod"),
            Self::core("PersistentVolume"),
            Self::core("Namespace"),
            Self::new("apps", "v1", "Deployment"),
            Self::new("apps", "v1", "StatefulSet"),
            Self::new("apps", "v1", "DaemonSet"),
            Self::new("batch", "v1", "Job"),
        ]
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.kind)
    }
}

impl FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        let (group, version, kind) = match parts.as_slice() {
            [kind] => ("", "v1", *kind),
            [version, kind] => ("", *version, *kind),
            [group, version, kind] => (*group, *version, *kind),
            _ => {
                return Err(Error::config(format!(
                    "invalid resource kind '{}': expected Kind, version/Kind or group/version/Kind",
                    s
                )));
            }
        };
        if version.is_empty() || kind.is_empty() {
            return Err(Error::config(format!(
                "invalid resource kind '{}': empty version or kind",
                s
            )));
        }
        if !kind.starts_with(|c: char| c.is_ascii_uppercase()) {
            return Err(Error::config(format!(
                "invalid resource kind '{}': kind must start with an uppercase letter",
                s
            )));
        }
        Ok(Self::new(group, version, kind))
    }
}

/// Accepted configuration forms for a kind.
#[derive(Deserialize)]
#[serde(untagged)]
enum KindRepr {
    Short(String),
    Full {
        #[serde(default)]
        group: String,
        version: String,
        kind: String,
        #[serde(default)]
        plural: Option<String>,
        #[serde(default)]
        namespaced: Option<bool>,
    },
}

impl TryFrom<KindRepr> for ResourceKind {
    type Error = Error;

    fn try_from(repr: KindRepr) -> Result<Self, Self::Error> {
        match repr {
            KindRepr::Short(s) => s.parse(),
            KindRepr::Full {
                group,
                version,
                kind,
                plural,
                namespaced,
            } => {
                let mut parsed: ResourceKind = format!("{group}/{version}/{kind}")
                    .trim_start_matches('/')
                    .parse()?;
                parsed.plural = plural;
                if let Some(namespaced) = namespaced {
                    parsed.namespaced = namespaced;
                }
                Ok(parsed)
            }
        }
    }
}
