//! Runtime configuration, read from `RANCH_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default server-side bound for a single backing watch.
pub const DEFAULT_WATCH_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Impersonate the caller on every backing call (otherwise share one trusted client).
    pub impersonate: bool,
    /// Partitions listed concurrently by a partitioned List.
    pub list_concurrency: usize,
    pub watch_timeout: Duration,
    /// Capacity of per-call result channels.
    pub queue_cap: usize,
    /// Read name-bounded partitions with the proxy's own client and filter by name.
    pub admin_name_filter: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            impersonate: true,
            list_concurrency: 3,
            watch_timeout: DEFAULT_WATCH_TIMEOUT,
            queue_cap: 100,
            admin_name_filter: true,
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim() {
        "1" => Some(true),
        "0" => Some(false),
        s if s.eq_ignore_ascii_case("true") => Some(true),
        s if s.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

impl ProxyConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset or invalid values keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let read = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = read("RANCH_IMPERSONATE") {
            match parse_bool(&v) {
                Some(b) => cfg.impersonate = b,
                None => warn!(value = %v, "invalid RANCH_IMPERSONATE; keeping default"),
            }
        }
        if let Some(v) = read("RANCH_LIST_CONCURRENCY") {
            match v.trim().parse::<usize>() {
                Ok(n) if n > 0 => cfg.list_concurrency = n,
                _ => warn!(value = %v, "invalid RANCH_LIST_CONCURRENCY; keeping default"),
            }
        }
        if let Some(v) = read("RANCH_WATCH_TIMEOUT_SECS") {
            match v.trim().parse::<u64>() {
                Ok(n) if n > 0 => cfg.watch_timeout = Duration::from_secs(n),
                _ => warn!(value = %v, "invalid RANCH_WATCH_TIMEOUT_SECS; keeping default"),
            }
        }
        if let Some(v) = read("RANCH_QUEUE_CAP") {
            match v.trim().parse::<usize>() {
                Ok(n) if n > 0 => cfg.queue_cap = n,
                _ => warn!(value = %v, "invalid RANCH_QUEUE_CAP; keeping default"),
            }
        }
        if let Some(v) = read("RANCH_ADMIN_NAME_FILTER") {
            match parse_bool(&v) {
                Some(b) => cfg.admin_name_filter = b,
                None => warn!(value = %v, "invalid RANCH_ADMIN_NAME_FILTER; keeping default"),
            }
        }
        cfg
    }

    pub fn watch_timeout_secs(&self) -> u64 {
        self.watch_timeout.as_secs().max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = ProxyConfig::from_lookup(|_| None);
        assert_eq!(cfg, ProxyConfig::default());
        assert_eq!(cfg.watch_timeout_secs(), 1800);
    }

    #[test]
    fn reads_overrides() {
        let cfg = ProxyConfig::from_lookup(lookup(&[
            ("RANCH_IMPERSONATE", "false"),
            ("RANCH_LIST_CONCURRENCY", "8"),
            ("RANCH_WATCH_TIMEOUT_SECS", "60"),
            ("RANCH_QUEUE_CAP", "16"),
            ("RANCH_ADMIN_NAME_FILTER", "0"),
        ]));
        assert!(!cfg.impersonate);
        assert_eq!(cfg.list_concurrency, 8);
        assert_eq!(cfg.watch_timeout, Duration::from_secs(60));
        assert_eq!(cfg.queue_cap, 16);
        assert!(!cfg.admin_name_filter);
    }

    #[test]
    fn invalid_values_keep_defaults() {
        let cfg = ProxyConfig::from_lookup(lookup(&[
            ("RANCH_IMPERSONATE", "sometimes"),
            ("RANCH_LIST_CONCURRENCY", "0"),
            ("RANCH_QUEUE_CAP", "lots"),
        ]));
        assert!(cfg.impersonate);
        assert_eq!(cfg.list_concurrency, 3);
        assert_eq!(cfg.queue_cap, 100);
    }
}
