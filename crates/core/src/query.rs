//! Decoding of list/watch query parameters into backend-neutral options.

use std::collections::BTreeMap;

use crate::{ProxyError, ProxyResult};

/// List/watch options decoded from a request's query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub limit: Option<u32>,
    pub continue_token: Option<String>,
    pub resource_version: Option<String>,
    /// `Exact` or `NotOlderThan`.
    pub resource_version_match: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    pub timeout_seconds: Option<u32>,
    pub allow_bookmarks: bool,
    pub watch: bool,
}

fn non_empty(params: &BTreeMap<String, String>, key: &str) -> Option<String> {
    params.get(key).filter(|v| !v.is_empty()).cloned()
}

fn parse_u32(params: &BTreeMap<String, String>, key: &str) -> ProxyResult<Option<u32>> {
    match non_empty(params, key) {
        None => Ok(None),
        Some(v) => v
            .parse::<u32>()
            .map(Some)
            .map_err(|_| ProxyError::BadRequest(format!("invalid {} {:?}: expected a non-negative integer", key, v))),
    }
}

fn parse_bool(params: &BTreeMap<String, String>, key: &str) -> ProxyResult<bool> {
    match non_empty(params, key).as_deref() {
        None => Ok(false),
        Some("true") | Some("1") => Ok(true),
        Some("false") | Some("0") => Ok(false),
        Some(v) => Err(ProxyError::BadRequest(format!("invalid {} {:?}: expected a boolean", key, v))),
    }
}

impl ListQuery {
    /// Decode recognized parameters; unknown keys are ignored. `revision` is accepted as an
    /// alias of `resourceVersion`, and `limit=0` means unlimited.
    pub fn from_params(params: &BTreeMap<String, String>) -> ProxyResult<Self> {
        let resource_version_match = non_empty(params, "resourceVersionMatch");
        if let Some(m) = resource_version_match.as_deref() {
            if m != "Exact" && m != "NotOlderThan" {
                return Err(ProxyError::BadRequest(format!("invalid resourceVersionMatch {:?}", m)));
            }
        }
        Ok(Self {
            limit: parse_u32(params, "limit")?.filter(|l| *l > 0),
            continue_token: non_empty(params, "continue"),
            resource_version: non_empty(params, "resourceVersion").or_else(|| non_empty(params, "revision")),
            resource_version_match,
            label_selector: non_empty(params, "labelSelector"),
            field_selector: non_empty(params, "fieldSelector"),
            timeout_seconds: parse_u32(params, "timeoutSeconds")?,
            allow_bookmarks: parse_bool(params, "allowWatchBookmarks")?,
            watch: parse_bool(params, "watch")?,
        })
    }

    /// Append a field selector term, keeping any existing ones.
    pub fn and_field_selector(mut self, term: &str) -> Self {
        self.field_selector = Some(match self.field_selector.take() {
            Some(existing) => format!("{},{}", existing, term),
            None => term.to_string(),
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn decodes_known_params() {
        let q = ListQuery::from_params(&params(&[
            ("limit", "50"),
            ("continue", "tok"),
            ("revision", "99"),
            ("labelSelector", "app=web"),
            ("allowWatchBookmarks", "true"),
            ("unknown", "ignored"),
        ]))
        .unwrap();
        assert_eq!(q.limit, Some(50));
        assert_eq!(q.continue_token.as_deref(), Some("tok"));
        assert_eq!(q.resource_version.as_deref(), Some("99"));
        assert_eq!(q.label_selector.as_deref(), Some("app=web"));
        assert!(q.allow_bookmarks);
        assert!(!q.watch);
    }

    #[test]
    fn resource_version_wins_over_revision_alias() {
        let q = ListQuery::from_params(&params(&[("resourceVersion", "5"), ("revision", "7")])).unwrap();
        assert_eq!(q.resource_version.as_deref(), Some("5"));
    }

    #[test]
    fn zero_limit_is_unlimited() {
        let q = ListQuery::from_params(&params(&[("limit", "0")])).unwrap();
        assert_eq!(q.limit, None);
    }

    #[test]
    fn malformed_params_are_bad_requests() {
        for bad in [("limit", "-1"), ("limit", "ten"), ("watch", "maybe"), ("resourceVersionMatch", "Newest")] {
            let err = ListQuery::from_params(&params(&[bad])).unwrap_err();
            assert!(matches!(err, ProxyError::BadRequest(_)), "{:?} -> {:?}", bad, err);
        }
    }

    #[test]
    fn field_selector_terms_accumulate() {
        let q = ListQuery::default().and_field_selector("metadata.name=a");
        assert_eq!(q.field_selector.as_deref(), Some("metadata.name=a"));
        let q = q.and_field_selector("status.phase=Running");
        assert_eq!(q.field_selector.as_deref(), Some("metadata.name=a,status.phase=Running"));
    }
}
