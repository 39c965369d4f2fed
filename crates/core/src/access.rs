//! Precomputed access grants and the partitions derived from them.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Key used for the single entry of a cluster-scoped grant table.
pub const CLUSTER_SCOPE: &str = "";

/// Access to one namespace: everything, or an explicit set of names.
/// When `all` is set, `names` is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceAccess {
    #[serde(default)]
    pub all: bool,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub names: BTreeSet<String>,
}

impl NamespaceAccess {
    pub fn all() -> Self {
        Self { all: true, names: BTreeSet::new() }
    }

    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { all: false, names: names.into_iter().map(Into::into).collect() }
    }

    /// Names that matter: empty when `all` is set.
    pub fn effective_names(&self) -> BTreeSet<String> {
        if self.all { BTreeSet::new() } else { self.names.clone() }
    }

    fn merge(&mut self, other: &NamespaceAccess) {
        self.all |= other.all;
        if self.all {
            self.names.clear();
        } else {
            self.names.extend(other.names.iter().cloned());
        }
    }
}

/// Grant set for one verb.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessGrant {
    /// Unconstrained across every namespace.
    All,
    Namespaces(BTreeMap<String, NamespaceAccess>),
}

impl Default for AccessGrant {
    fn default() -> Self {
        AccessGrant::Namespaces(BTreeMap::new())
    }
}

/// The caller's grants on one schema, keyed by verb (`list`, `watch`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessListByVerb {
    verbs: BTreeMap<String, AccessGrant>,
}

impl AccessListByVerb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant_all(mut self, verb: &str) -> Self {
        self.verbs.insert(verb.to_string(), AccessGrant::All);
        self
    }

    /// Grant every object in `namespace`.
    pub fn grant_namespace(self, verb: &str, namespace: &str) -> Self {
        self.grant_access(verb, namespace, NamespaceAccess::all())
    }

    /// Grant specific names in `namespace` (use [`CLUSTER_SCOPE`] for cluster-scoped kinds).
    pub fn grant_names<I, S>(self, verb: &str, namespace: &str, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.grant_access(verb, namespace, NamespaceAccess::names(names))
    }

    pub fn grant_access(mut self, verb: &str, namespace: &str, access: NamespaceAccess) -> Self {
        let grant = self.verbs.entry(verb.to_string()).or_default();
        if let AccessGrant::Namespaces(table) = grant {
            table.entry(namespace.to_string()).or_default().merge(&access);
        }
        self
    }

    pub fn grant(&self, verb: &str) -> Option<&AccessGrant> {
        self.verbs.get(verb)
    }

    /// True when `verb` is granted without constraint.
    pub fn all(&self, verb: &str) -> bool {
        matches!(self.verbs.get(verb), Some(AccessGrant::All))
    }

    /// Per-namespace grants for `verb`; empty when nothing (or everything) is granted.
    pub fn granted(&self, verb: &str) -> BTreeMap<String, NamespaceAccess> {
        match self.verbs.get(verb) {
            Some(AccessGrant::Namespaces(table)) => table.clone(),
            _ => BTreeMap::new(),
        }
    }

    pub fn verbs(&self) -> impl Iterator<Item = &str> {
        self.verbs.keys().map(String::as_str)
    }
}

/// One unit of decomposed List/Watch work.
///
/// An empty `namespace` means unscoped (cluster-scoped kinds). A partition with neither
/// `all` nor any `names` yields nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Partition {
    pub namespace: String,
    pub all: bool,
    pub names: BTreeSet<String>,
}

impl Partition {
    pub fn all(namespace: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), all: true, names: BTreeSet::new() }
    }

    pub fn names<I, S>(namespace: impl Into<String>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { namespace: namespace.into(), all: false, names: names.into_iter().map(Into::into).collect() }
    }

    pub fn from_access(namespace: impl Into<String>, access: &NamespaceAccess) -> Self {
        Self { namespace: namespace.into(), all: access.all, names: access.effective_names() }
    }

    /// Stable name used in continuation tokens.
    pub fn name(&self) -> &str {
        &self.namespace
    }

    pub fn scope(&self) -> Option<&str> {
        if self.namespace.is_empty() { None } else { Some(&self.namespace) }
    }

    pub fn is_empty(&self) -> bool {
        !self.all && self.names.is_empty()
    }
}
