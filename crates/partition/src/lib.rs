//! Ranch partition: split List/Watch work by the caller's access grants, and merge
//! partitioned listings back into one page.
//!
//! [`decide`] is pure. It answers whether a request can go straight through to the
//! store (the grant covers the whole requested scope) or which partitions to run.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use ranch_core::{AccessGrant, ApiRequest, ApiSchema, NamespaceAccess, Partition};

pub mod lister;
pub mod token;

pub use lister::{ListSummary, PageRequest, ParallelPartitionLister, PartitionListing, PartitionLister};
pub use token::ListState;

/// Outcome of [`decide`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The grant covers the requested scope; send the request as is.
    Passthrough,
    /// Run these partitions (sorted by namespace). Empty means nothing is visible.
    Partitions(Vec<Partition>),
}

impl Decision {
    pub fn is_passthrough(&self) -> bool {
        matches!(self, Decision::Passthrough)
    }

    pub fn partitions(&self) -> &[Partition] {
        match self {
            Decision::Passthrough => &[],
            Decision::Partitions(p) => p,
        }
    }
}

/// Decide how to serve `verb` on `schema` for `req`.
pub fn decide(req: &ApiRequest, schema: &ApiSchema, verb: &str) -> Decision {
    let decision = from_grants(req, schema, verb);
    let decision = if schema.namespaced { restrict(decision, req) } else { decision };
    match decision {
        Decision::Partitions(mut partitions) => {
            partitions.sort();
            Decision::Partitions(partitions)
        }
        passthrough => passthrough,
    }
}

fn from_grants(req: &ApiRequest, schema: &ApiSchema, verb: &str) -> Decision {
    let table = match schema.access.grant(verb) {
        None => return Decision::Partitions(Vec::new()),
        Some(AccessGrant::All) => return Decision::Passthrough,
        Some(AccessGrant::Namespaces(table)) => table,
    };

    if !schema.namespaced {
        return Decision::Partitions(merge_cluster_scope(table).into_iter().collect());
    }

    if let Some(ns) = req.namespace.as_deref() {
        return match table.get(ns) {
            Some(access) if access.all => Decision::Passthrough,
            Some(access) => Decision::Partitions(vec![Partition::from_access(ns, access)]),
            None => Decision::Partitions(vec![Partition::names(ns, Vec::<String>::new())]),
        };
    }

    Decision::Partitions(table.iter().map(|(ns, access)| Partition::from_access(ns.as_str(), access)).collect())
}

/// Cluster-scoped kinds have one implicit key; fold whatever is in the table into one
/// unscoped partition.
fn merge_cluster_scope(table: &BTreeMap<String, NamespaceAccess>) -> Option<Partition> {
    if table.is_empty() {
        return None;
    }
    let all = table.values().any(|a| a.all);
    let names: BTreeSet<String> = if all { BTreeSet::new() } else { table.values().flat_map(|a| a.names.iter().cloned()).collect() };
    Some(Partition { namespace: String::new(), all, names })
}

/// Apply the request's allowed-namespace set, if any.
fn restrict(decision: Decision, req: &ApiRequest) -> Decision {
    let Some(allowed) = req.allowed_namespaces.as_ref() else {
        return decision;
    };
    let allowed: BTreeSet<&str> = allowed
        .iter()
        .map(String::as_str)
        .filter(|ns| req.namespace.as_deref().map_or(true, |scoped| scoped == *ns))
        .collect();
    match decision {
        Decision::Passthrough => Decision::Partitions(allowed.into_iter().map(Partition::all).collect()),
        Decision::Partitions(partitions) => {
            Decision::Partitions(partitions.into_iter().filter(|p| allowed.contains(p.namespace.as_str())).collect())
        }
    }
}
