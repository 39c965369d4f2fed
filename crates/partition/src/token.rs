//! Continuation token for partitioned listings.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use ranch_core::{ProxyError, ProxyResult};

/// Position of a partitioned listing, handed to the caller as an opaque string.
///
/// `continue_token` and `offset` address the page of partition `partition_index` to
/// resume in: the page is re-fetched with the same `limit` and its first `offset`
/// items are skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListState {
    #[serde(rename = "r", default, skip_serializing_if = "String::is_empty")]
    pub revision: String,
    #[serde(rename = "i", default)]
    pub partition_index: usize,
    #[serde(rename = "p", default)]
    pub partition_name: String,
    #[serde(rename = "c", default, skip_serializing_if = "String::is_empty")]
    pub continue_token: String,
    #[serde(rename = "o", default, skip_serializing_if = "is_zero")]
    pub offset: usize,
    #[serde(rename = "l", default, skip_serializing_if = "is_zero")]
    pub limit: usize,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

impl ListState {
    pub fn encode(&self) -> ProxyResult<String> {
        let raw = serde_json::to_vec(self).map_err(|e| ProxyError::Internal(format!("encode continue token: {}", e)))?;
        Ok(STANDARD.encode(raw))
    }

    pub fn decode(token: &str) -> ProxyResult<Self> {
        let raw = STANDARD
            .decode(token.trim())
            .map_err(|e| ProxyError::BadRequest(format!("malformed continue token: {}", e)))?;
        serde_json::from_slice(&raw).map_err(|e| ProxyError::BadRequest(format!("malformed continue token: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_encoding_omits_defaults() {
        let state = ListState { partition_index: 2, partition_name: "ns-b".into(), ..Default::default() };
        let raw = STANDARD.decode(state.encode().unwrap()).unwrap();
        assert_eq!(String::from_utf8(raw).unwrap(), r#"{"i":2,"p":"ns-b"}"#);
    }

    #[test]
    fn decodes_what_it_encodes() {
        let state = ListState {
            revision: "42".into(),
            partition_index: 1,
            partition_name: "ns".into(),
            continue_token: "abc".into(),
            offset: 3,
            limit: 5,
        };
        assert_eq!(ListState::decode(&state.encode().unwrap()).unwrap(), state);
    }

    #[test]
    fn garbage_is_a_bad_request() {
        assert!(matches!(ListState::decode("!!not base64"), Err(ProxyError::BadRequest(_))));
        let not_json = STANDARD.encode("plain");
        assert!(matches!(ListState::decode(&not_json), Err(ProxyError::BadRequest(_))));
    }
}
