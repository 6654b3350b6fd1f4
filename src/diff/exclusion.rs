//! Exclusion rules for resources that may legitimately differ between snapshots.
//!
//! A rule names a kind, a name pattern, a namespace pattern, or any
//! combination; it matches when every criterion it specifies matches.
//! Patterns are regular expressions anchored at both ends.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::snapshot::ResourceIdentity;

/// One declarative exclusion rule.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionRule {
    /// Exact kind name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Regular expression the whole name must match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_pattern: Option<String>,
    /// Regular expression the whole namespace must match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_pattern: Option<String>,
    /// Why the resource is allowed to churn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ExclusionRule {
    /// Rule matching every object of a kind.
    pub fn kind(kind: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            ..Default::default()
        }
    }

    /// Restrict the rule to names matching `pattern`.
    pub fn with_name_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.name_pattern = Some(pattern.into());
        self
    }

    /// Restrict the rule to namespaces matching `pattern`.
    pub fn with_namespace_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.namespace_pattern = Some(pattern.into());
        self
    }

    /// Record why this rule exists.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[derive(Clone, Debug)]
struct CompiledRule {
    rule: ExclusionRule,
    name: Option<Regex>,
    namespace: Option<Regex>,
}

impl CompiledRule {
    fn compile(rule: ExclusionRule) -> Result<Self> {
        if rule.kind.is_none() && rule.name_pattern.is_none() && rule.namespace_pattern.is_none() {
            return Err(Error::config(
                "exclusion rule must set at least one of kind, name_pattern, namespace_pattern",
            ));
        }
        let name = rule.name_pattern.as_deref().map(anchored).transpose()?;
        let namespace = rule.namespace_pattern.as_deref().map(anchored).transpose()?;
        Ok(Self {
            rule,
            name,
            namespace,
        })
    }

    fn matches(&self, identity: &ResourceIdentity) -> bool {
        if let Some(kind) = &self.rule.kind
            && kind != &identity.kind
        {
            return false;
        }
        if let Some(re) = &self.name
            && !re.is_match(&identity.name)
        {
            return false;
        }
        if let Some(re) = &self.namespace {
            return identity
                .namespace
                .as_deref()
                .is_some_and(|ns| re.is_match(ns));
        }
        true
    }
}

fn anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|e| Error::config(format!("invalid exclusion pattern '{}': {}", pattern, e)))
}

/// Compiled, read-only set of exclusion rules.
#[derive(Clone, Debug, Default)]
pub struct ExclusionPolicy {
    rules: Vec<CompiledRule>,
}

impl ExclusionPolicy {
    /// Compile a rule set. Fails on rules with no criteria or invalid patterns.
    pub fn new(rules: impl IntoIterator<Item = ExclusionRule>) -> Result<Self> {
        let rules = rules
            .into_iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// A policy that excludes nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of rules
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the policy has no rules
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether any rule matches this identity.
    pub fn is_excluded(&self, identity: &ResourceIdentity) -> bool {
        self.matching_rule(identity).is_some()
    }

    /// The first rule matching this identity, for diagnostics.
    pub fn matching_rule(&self, identity: &ResourceIdentity) -> Option<&ExclusionRule> {
        self.rules
            .iter()
            .find(|r| r.matches(identity))
            .map(|r| &r.rule)
    }
}
