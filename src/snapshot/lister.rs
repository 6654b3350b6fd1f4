//! Resource listing against the cluster API.
//!
//! `ResourceLister` is the only network-facing dependency of a check. The
//! production implementation lists each kind through `Api<DynamicObject>`,
//! following continue tokens so that a listing is either complete or an error.

use std::collections::BTreeSet;

use async_trait::async_trait;
use futures::future::try_join_all;
use kube::Client;
use kube::api::{Api, DynamicObject, ListParams};
use serde_json::Value;
use tracing::debug;

use super::ResourceKind;
use crate::error::{Error, Result};

/// Default page size for list calls
pub const DEFAULT_PAGE_SIZE: u32 = 500;

/// An unmodified API object, tagged with the kind it was listed as.
///
/// List responses often omit `kind` on items, so the tag is taken from the
/// request rather than the body.
#[derive(Clone, Debug, PartialEq)]
pub struct RawResource {
    /// Kind name the object was listed as
    pub kind: String,
    /// The object as returned by the API
    pub object: Value,
}

impl RawResource {
    /// Wrap an API object.
    pub fn new(kind: impl Into<String>, object: Value) -> Self {
        Self {
            kind: kind.into(),
            object,
        }
    }
}

/// Fetches the current objects of the given kinds.
///
/// Implementations fail with `ApiUnavailable` for transient conditions and
/// `Unauthorized` for rejected credentials; the retry engine relies on that
/// classification.
#[async_trait]
pub trait ResourceLister: Send + Sync {
    /// List all objects of `kinds`, restricted to `namespace` for namespaced kinds.
    async fn list(
        &self,
        kinds: &BTreeSet<ResourceKind>,
        namespace: Option<&str>,
    ) -> Result<Vec<RawResource>>;
}

/// Lister backed by a kube-rs client.
#[derive(Clone)]
pub struct KubeResourceLister {
    client: Client,
    page_size: u32,
}

impl KubeResourceLister {
    /// Create a lister using the given client.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Override the page size used for list calls.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn api_for(&self, kind: &ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = kind.api_resource();
        match namespace {
            Some(ns) if kind.namespaced => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }

    /// List every page of one kind.
    async fn list_kind(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
    ) -> Result<Vec<RawResource>> {
        let api = self.api_for(kind, namespace);
        let mut params = ListParams::default().limit(self.page_size);
        let mut items = Vec::new();

        loop {
            let page = match api.list(&params).await {
                Ok(page) => page,
                Err(kube::Error::Api(e)) if e.code == 404 => {
                    // API not served (e.g. CRD not installed): nothing to leak
                    debug!(kind = %kind, "Kind not served by the API server, treating as empty");
                    return Ok(Vec::new());
                }
                Err(e) => return Err(Error::from_kube(e)),
            };

            let continue_token = page.metadata.continue_.clone();
            for obj in page.items {
                items.push(RawResource::new(&kind.kind, serde_json::to_value(obj)?));
            }

            match continue_token {
                Some(token) if !token.is_empty() => {
                    params = params.continue_token(&token);
                }
                _ => break,
            }
        }

        debug!(kind = %kind, count = items.len(), "Listed resources");
        Ok(items)
    }
}

#[async_trait]
impl ResourceLister for KubeResourceLister {
    async fn list(
        &self,
        kinds: &BTreeSet<ResourceKind>,
        namespace: Option<&str>,
    ) -> Result<Vec<RawResource>> {
        let pages = try_join_all(kinds.iter().map(|kind| self.list_kind(kind, namespace))).await?;
        Ok(pages.into_iter().flatten().collect())
    }
}
