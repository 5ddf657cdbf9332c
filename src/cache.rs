//! Bypass/priority policy and clean-verdict memoization.
//!
//! The cache is keyed by `(normalized URI, sha256 of the first 4 KiB of
//! body)` so a changed payload never rides a stale verdict. Only clean
//! verdicts are stored; infected content is re-scanned every time so
//! operational alerting always fires. Trusted registry hosts are *not*
//! bypassed — they are demoted to normal priority and still scanned.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::{KeySpace, Priority, ScanError};
use crate::store::SharedStore;

/// How much of the body participates in the fingerprint.
pub const FINGERPRINT_PREFIX: usize = 4096;

/// Default verdict memoization TTL.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Well-known package/image registries, scanned at normal priority.
const TRUSTED_HOSTS: &[&str] = &[
    "get.docker.com",
    "registry-1.docker.io",
    "quay.io",
    "gcr.io",
    "ghcr.io",
    "registry.k8s.io",
    "pypi.org",
    "registry.npmjs.org",
    "github.com",
    "*.maven.org",
];

/// How a request URI relates to the host policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostClass {
    /// Administrator-listed host: skip scanning entirely.
    Bypass,
    /// Trusted registry: scan, but never at high priority.
    Trusted {
        /// Registry category used as a metric label (e.g. "docker").
        category: &'static str,
    },
    /// Everything else.
    Unclassified,
}

/// Administrator-facing policy configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CachePolicyConfig {
    /// Extra trusted hosts merged with the built-in registry list.
    #[serde(default)]
    pub trusted_hosts: Vec<String>,
    /// Hosts exempted from scanning outright.
    #[serde(default)]
    pub bypass_hosts: Vec<String>,
    /// Verdict TTL override in seconds.
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

/// Read-through verdict cache with host policy.
#[derive(Clone)]
pub struct IntelligentCache {
    store: SharedStore,
    keys: KeySpace,
    ttl: Duration,
    trusted: Vec<String>,
    bypass: Vec<String>,
}

impl IntelligentCache {
    /// Creates a cache with the built-in trusted list and the given policy.
    pub fn new(store: SharedStore, keys: KeySpace, config: CachePolicyConfig) -> Self {
        let mut trusted: Vec<String> =
            TRUSTED_HOSTS.iter().map(|h| h.to_string()).collect();
        trusted.extend(config.trusted_hosts);
        Self {
            store,
            keys,
            ttl: config
                .ttl_seconds
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_CACHE_TTL),
            trusted,
            bypass: config.bypass_hosts,
        }
    }

    /// Classifies the URI against the bypass and trusted lists.
    pub fn classify(&self, uri: &str) -> HostClass {
        let host = host_of(uri);
        if self.bypass.iter().any(|p| host_matches(p, &host)) {
            return HostClass::Bypass;
        }
        if self.trusted.iter().any(|p| host_matches(p, &host)) {
            return HostClass::Trusted {
                category: registry_category(&host),
            };
        }
        HostClass::Unclassified
    }

    /// Applies priority demotion: trusted registries never scan high.
    pub fn effective_priority(&self, uri: &str, requested: Priority) -> Priority {
        match self.classify(uri) {
            HostClass::Trusted { .. } => Priority::Normal,
            _ => requested,
        }
    }

    /// Returns `true` when a clean verdict for this (URI, body prefix) pair
    /// is still memoized.
    pub async fn lookup_clean(
        &self,
        uri: &str,
        body_prefix: &[u8],
    ) -> Result<bool, ScanError> {
        let key = self.keys.cache_verdict(&fingerprint(uri, body_prefix));
        Ok(self.store.get(&key).await?.is_some())
    }

    /// Memoizes a clean verdict. Best-effort: failures are logged, never
    /// propagated, so a flaky cache cannot fail a completed scan.
    pub async fn store_clean(&self, uri: &str, body_prefix: &[u8]) {
        let key = self.keys.cache_verdict(&fingerprint(uri, body_prefix));
        if let Err(e) = self.store.set_ex(&key, b"1", self.ttl).await {
            tracing::warn!(error = %e, "verdict cache store failed");
        }
    }
}

/// Computes the cache fingerprint for a (URI, body prefix) pair.
pub fn fingerprint(uri: &str, body_prefix: &[u8]) -> String {
    let prefix = &body_prefix[..body_prefix.len().min(FINGERPRINT_PREFIX)];
    let body_hash = Sha256::digest(prefix);

    let mut hasher = Sha256::new();
    hasher.update(normalize_uri(uri).as_bytes());
    hasher.update([0u8]);
    hasher.update(body_hash);
    hex::encode(hasher.finalize())
}

/// Normalizes a URI: lowercased scheme and host, default ports stripped,
/// fragment dropped, empty path mapped to `/`.
pub fn normalize_uri(uri: &str) -> String {
    let uri = uri.split('#').next().unwrap_or(uri);

    let (scheme, rest) = match uri.split_once("://") {
        Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
        None => return uri.to_string(),
    };

    let (authority, path) = match rest.find('/') {
        Some(pos) => (&rest[..pos], &rest[pos..]),
        None => (rest, ""),
    };

    let mut host = authority.to_ascii_lowercase();
    let default_port = match scheme.as_str() {
        "http" => Some(":80"),
        "https" => Some(":443"),
        _ => None,
    };
    if let Some(port) = default_port {
        if let Some(stripped) = host.strip_suffix(port) {
            host = stripped.to_string();
        }
    }

    let path = if path.is_empty() { "/" } else { path };
    format!("{scheme}://{host}{path}")
}

fn host_of(uri: &str) -> String {
    let rest = uri.split_once("://").map(|(_, r)| r).unwrap_or(uri);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    let host = authority.rsplit_once('@').map(|(_, h)| h).unwrap_or(authority);
    host.split(':').next().unwrap_or(host).to_ascii_lowercase()
}

fn host_matches(pattern: &str, host: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        host == suffix || host.ends_with(&format!(".{suffix}"))
    } else {
        host == pattern
    }
}

fn registry_category(host: &str) -> &'static str {
    if host.contains("docker") || host == "quay.io" || host == "gcr.io" || host == "ghcr.io"
        || host == "registry.k8s.io"
    {
        "docker"
    } else if host == "pypi.org" {
        "python"
    } else if host == "registry.npmjs.org" {
        "node"
    } else if host.ends_with("maven.org") {
        "java"
    } else if host == "github.com" {
        "github"
    } else {
        "other"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn cache(config: CachePolicyConfig) -> IntelligentCache {
        IntelligentCache::new(Arc::new(MemoryStore::new()), KeySpace::new(""), config)
    }

    #[test]
    fn test_normalize_uri() {
        assert_eq!(
            normalize_uri("HTTPS://Example.COM:443/Path?q=1#frag"),
            "https://example.com/Path?q=1"
        );
        assert_eq!(normalize_uri("http://host:80"), "http://host/");
        assert_eq!(normalize_uri("http://host:8080/x"), "http://host:8080/x");
        assert_eq!(normalize_uri("/relative/path"), "/relative/path");
    }

    #[test]
    fn test_fingerprint_uses_only_prefix() {
        let mut long_a = vec![1u8; FINGERPRINT_PREFIX + 100];
        let mut long_b = long_a.clone();
        // Same prefix, different tail: same fingerprint.
        long_a[FINGERPRINT_PREFIX + 50] = 9;
        assert_eq!(
            fingerprint("http://h/x", &long_a),
            fingerprint("http://h/x", &long_b)
        );
        // Different prefix: different fingerprint.
        long_b[0] = 9;
        assert_ne!(
            fingerprint("http://h/x", &long_a),
            fingerprint("http://h/x", &long_b)
        );
    }

    #[test]
    fn test_fingerprint_sensitive_to_uri() {
        assert_ne!(
            fingerprint("http://a/x", b"body"),
            fingerprint("http://b/x", b"body")
        );
        // Normalization-equivalent URIs collapse.
        assert_eq!(
            fingerprint("HTTP://A/x", b"body"),
            fingerprint("http://a/x", b"body")
        );
    }

    #[test]
    fn test_trusted_hosts_demote_priority_not_bypass() {
        let cache = cache(CachePolicyConfig::default());
        let uri = "https://registry-1.docker.io/v2/library/alpine/blobs/sha256:abc";

        assert!(matches!(
            cache.classify(uri),
            HostClass::Trusted { category: "docker" }
        ));
        assert_eq!(
            cache.effective_priority(uri, Priority::High),
            Priority::Normal
        );

        let plain = "https://example.com/file.bin";
        assert_eq!(cache.classify(plain), HostClass::Unclassified);
        assert_eq!(
            cache.effective_priority(plain, Priority::High),
            Priority::High
        );
    }

    #[test]
    fn test_wildcard_trusted_host() {
        let cache = cache(CachePolicyConfig::default());
        assert!(matches!(
            cache.classify("https://repo1.maven.org/maven2/junit/junit.jar"),
            HostClass::Trusted { category: "java" }
        ));
    }

    #[test]
    fn test_admin_bypass_list() {
        let cache = cache(CachePolicyConfig {
            bypass_hosts: vec!["internal.corp".to_string()],
            ..CachePolicyConfig::default()
        });
        assert_eq!(
            cache.classify("https://internal.corp/artifact"),
            HostClass::Bypass
        );
    }

    #[tokio::test]
    async fn test_clean_verdict_memoized() {
        let cache = cache(CachePolicyConfig::default());
        let uri = "https://example.com/pkg.tgz";

        assert!(!cache.lookup_clean(uri, b"body").await.unwrap());
        cache.store_clean(uri, b"body").await;
        assert!(cache.lookup_clean(uri, b"body").await.unwrap());

        // Different body prefix misses.
        assert!(!cache.lookup_clean(uri, b"other").await.unwrap());
    }
}
