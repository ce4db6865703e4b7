//! C4 — Discovery client.
//!
//! Fetches `.well-known/ocm` (with a legacy `/ocm-provider` fallback), caches the
//! parsed document, and exposes pure read helpers over it. Grounded on the teacher's
//! `.well-known/oauth-protected-resource` / `.well-known/oauth-authorization-server`
//! discovery-with-fallback fetch in `web.rs`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::cache::{Cache, FullCache};
use crate::http_client::{OutboundRequest, SafeHttpClient};

pub const DEFAULT_DISCOVERY_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("discovery request failed: {0}")]
    Fetch(String),
    #[error("discovery document is not enabled")]
    NotEnabled,
    #[error("discovery document could not be parsed: {0}")]
    Parse(String),
    #[error("discovery timed out")]
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub share_types: Vec<String>,
    #[serde(default)]
    pub protocols: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    pub enabled: bool,
    pub api_version: String,
    pub endpoint: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub resource_types: Vec<ProtocolEntry>,
    #[serde(default)]
    pub capabilities: HashSet<String>,
    /// Must always serialize as `[]` when empty, never `null` (spec invariant 8).
    #[serde(default)]
    pub criteria: Vec<String>,
    #[serde(default)]
    pub public_keys: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,
}

impl DiscoveryDocument {
    pub fn get_endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn get_webdav_path(&self, resource_type: &str, protocol: &str) -> Option<String> {
        self.resource_types
            .iter()
            .find(|rt| rt.name == resource_type)
            .and_then(|rt| rt.protocols.get(protocol))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.contains(name)
    }

    pub fn has_criteria(&self, token: &str) -> bool {
        self.criteria.iter().any(|c| c == token)
    }

    pub fn get_public_key(&self, key_id: &str) -> Option<&str> {
        self.public_keys.get(key_id).map(|s| s.as_str())
    }

    pub fn build_webdav_url(&self, webdav_id: &str) -> Option<String> {
        let path = self.get_webdav_path("file", "webdav")?;
        Some(format!("{}/{}", path.trim_end_matches('/'), webdav_id))
    }
}

pub struct DiscoveryClient {
    http: Arc<SafeHttpClient>,
    cache: Arc<dyn FullCache>,
    ttl: Duration,
}

impl DiscoveryClient {
    /// A null `cache` silently substitutes a default in-memory cache — discovery
    /// must always cache (spec §4.4).
    pub fn new(http: Arc<SafeHttpClient>, cache: Option<Arc<dyn FullCache>>, ttl: Duration) -> Self {
        let cache = cache.unwrap_or_else(|| Arc::new(crate::cache::MemoryCache::new(ttl)));
        Self { http, cache, ttl }
    }

    fn cache_key(base_url: &str) -> String {
        format!("discovery:{base_url}")
    }

    pub async fn discover(&self, base_url: &str) -> Result<DiscoveryDocument, DiscoveryError> {
        let normalized = base_url.trim_end_matches('/');
        let key = Self::cache_key(normalized);
        if let Some(bytes) = Cache::get(self.cache.as_ref(), &key) {
            if let Ok(doc) = serde_json::from_slice::<DiscoveryDocument>(&bytes) {
                return Ok(doc);
            }
        }

        let doc = match self.fetch(&format!("{normalized}/.well-known/ocm")).await {
            Ok(doc) => doc,
            Err(_) => self.fetch(&format!("{normalized}/ocm-provider")).await?,
        };

        if !doc.enabled {
            return Err(DiscoveryError::NotEnabled);
        }

        let bytes = serde_json::to_vec(&doc).map_err(|e| DiscoveryError::Parse(e.to_string()))?;
        self.cache.set(&key, &bytes, Some(self.ttl));
        Ok(doc)
    }

    async fn fetch(&self, url: &str) -> Result<DiscoveryDocument, DiscoveryError> {
        let parsed = Url::parse(url).map_err(|e| DiscoveryError::Fetch(e.to_string()))?;
        let req = OutboundRequest {
            method: Method::GET,
            url: parsed,
            headers: Default::default(),
            body: None,
            signed: false,
        };
        let resp = self.http.execute(req).await.map_err(|e| DiscoveryError::Fetch(e.to_string()))?;
        if !resp.status.is_success() {
            return Err(DiscoveryError::Fetch(format!("status {}", resp.status)));
        }
        serde_json::from_slice(&resp.body).map_err(|e| DiscoveryError::Parse(e.to_string()))
    }
}

/// Extracts `host[:port]` from a keyId `https://host[:port]/path#name`. Identical
/// rule to `signature::keyid_to_host`, re-exported here for discovery-adjacent code
/// that only imports this module.
pub fn keyid_to_host(keyid: &str) -> Option<String> {
    crate::signature::keyid_to_host(keyid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_doc(enabled: bool) -> DiscoveryDocument {
        let mut protocols = BTreeMap::new();
        protocols.insert("webdav".to_string(), serde_json::json!("/remote.php/webdav"));
        DiscoveryDocument {
            enabled,
            api_version: "1.0-proposal1".into(),
            endpoint: "https://peer.example/ocm".into(),
            provider: Some("peer.example".into()),
            resource_types: vec![ProtocolEntry { name: "file".into(), share_types: vec!["user".into()], protocols }],
            capabilities: HashSet::from(["http-sig".to_string()]),
            criteria: vec![],
            public_keys: BTreeMap::from([("https://peer.example/ocm#k1".to_string(), "PEM".to_string())]),
            token_endpoint: Some("https://peer.example/ocm/token".into()),
        }
    }

    #[test]
    fn criteria_serializes_as_empty_array_not_null() {
        let doc = sample_doc(true);
        let v = serde_json::to_value(&doc).unwrap();
        assert_eq!(v["criteria"], serde_json::json!([]));
    }

    #[test]
    fn helpers_are_pure_reads() {
        let doc = sample_doc(true);
        assert_eq!(doc.get_endpoint(), "https://peer.example/ocm");
        assert_eq!(doc.get_webdav_path("file", "webdav").as_deref(), Some("/remote.php/webdav"));
        assert!(doc.has_capability("http-sig"));
        assert!(!doc.has_capability("exchange-token"));
        assert!(!doc.has_criteria("http-request-signatures"));
        assert_eq!(doc.get_public_key("https://peer.example/ocm#k1"), Some("PEM"));
        assert_eq!(
            doc.build_webdav_url("wd-1"),
            Some("/remote.php/webdav/wd-1".to_string())
        );
    }

    #[test]
    fn keyid_to_host_matches_signature_module() {
        assert_eq!(keyid_to_host("https://a.example/ocm#k1"), Some("a.example".into()));
    }
}
