//! C5 — Directory-service & federation manager.
//!
//! Fetches, JWS-verifies and caches per-federation membership lists; union
//! membership lookup across enabled federations. Grounded on the base64url-decode-
//! then-verify sequencing idiom of `signed_http-v1-wire.rs` and the teacher's
//! `parking_lot`-guarded cache-with-refresh shape in `policy/store.rs`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64URL;
use ed25519_dalek::{Signature as EdSignature, Verifier as _, VerifyingKey as EdVerifyingKey};
use p256::ecdsa::{Signature as EsSignature, VerifyingKey as EsVerifyingKey, signature::Verifier as _};
use parking_lot::RwLock;
use reqwest::Method;
use serde::Deserialize;
use url::Url;

use crate::http_client::{OutboundRequest, SafeHttpClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Ed25519,
    Rs256,
    Es256,
}

#[derive(Debug, Clone)]
pub struct FederationKey {
    pub pem_or_raw: String,
    pub algorithm: KeyAlgorithm,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct FederationConfig {
    pub federation_id: String,
    pub enabled: bool,
    pub enforce_membership: bool,
    pub keys: Vec<FederationKey>,
    pub directory_service_urls: Vec<String>,
    pub ttl: Duration,
    pub max_stale: Duration,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            federation_id: String::new(),
            enabled: true,
            enforce_membership: true,
            keys: Vec::new(),
            directory_service_urls: Vec::new(),
            ttl: Duration::from_secs(6 * 3600),
            max_stale: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FederationError {
    #[error("directory service fetch failed: {0}")]
    Fetch(String),
    #[error("no federation key verifies the directory-service response")]
    NoKeyVerifies,
    #[error("malformed JWS payload")]
    Malformed,
}

#[derive(Debug, Clone)]
struct CachedMembership {
    members: HashSet<String>,
    last_refresh: Instant,
}

/// Normalizes a host for comparison: lowercase, strip `:443`/`:80` when a scheme
/// prefix indicates the default port for that scheme; otherwise leave ports intact.
pub fn normalize_host(host: &str) -> String {
    if let Some((scheme, rest)) = host.split_once("://") {
        let lower_rest = rest.to_lowercase();
        match scheme.to_lowercase().as_str() {
            "https" => lower_rest.strip_suffix(":443").unwrap_or(&lower_rest).to_string(),
            "http" => lower_rest.strip_suffix(":80").unwrap_or(&lower_rest).to_string(),
            _ => lower_rest,
        }
    } else {
        host.to_lowercase()
    }
}

#[derive(Debug, Deserialize)]
struct MemberEntry {
    host: String,
    #[serde(default)]
    #[allow(dead_code)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MembershipPayload {
    Array(Vec<MemberEntry>),
    Object { servers: Vec<MemberEntry> },
}

#[derive(Debug, Deserialize)]
struct AppendixCJws {
    protected: String,
    payload: String,
    signature: String,
}

fn parse_jws(bytes: &[u8]) -> Result<(String, String, String), FederationError> {
    if let Ok(text) = std::str::from_utf8(bytes) {
        let parts: Vec<&str> = text.trim().split('.').collect();
        if parts.len() == 3 {
            return Ok((parts[0].to_string(), parts[1].to_string(), parts[2].to_string()));
        }
    }
    let doc: AppendixCJws = serde_json::from_slice(bytes).map_err(|_| FederationError::Malformed)?;
    Ok((doc.protected, doc.payload, doc.signature))
}

fn verify_signature(protected: &str, payload: &str, signature_b64: &str, key: &FederationKey) -> bool {
    let signing_input = format!("{protected}.{payload}");
    let sig_bytes = match B64URL.decode(signature_b64) {
        Ok(b) => b,
        Err(_) => return false,
    };
    match key.algorithm {
        KeyAlgorithm::Ed25519 => {
            let Ok(key_bytes) = B64URL.decode(&key.pem_or_raw).or_else(|_| base64::engine::general_purpose::STANDARD.decode(&key.pem_or_raw)) else {
                return false;
            };
            let Ok(key_arr): Result<[u8; 32], _> = key_bytes.as_slice().try_into() else { return false };
            let Ok(vk) = EdVerifyingKey::from_bytes(&key_arr) else { return false };
            let Ok(sig_arr): Result<[u8; 64], _> = sig_bytes.as_slice().try_into() else { return false };
            let sig = EdSignature::from_bytes(&sig_arr);
            vk.verify(signing_input.as_bytes(), &sig).is_ok()
        }
        KeyAlgorithm::Es256 => {
            let Ok(key_bytes) = B64URL.decode(&key.pem_or_raw).or_else(|_| base64::engine::general_purpose::STANDARD.decode(&key.pem_or_raw)) else {
                return false;
            };
            let Ok(vk) = EsVerifyingKey::from_sec1_bytes(&key_bytes) else { return false };
            // JOSE ES256 signatures are raw concatenated R||S (64 bytes), not DER.
            let Ok(sig) = EsSignature::from_slice(&sig_bytes) else { return false };
            vk.verify(signing_input.as_bytes(), &sig).is_ok()
        }
        KeyAlgorithm::Rs256 => false,
    }
}

pub struct FederationManager {
    configs: HashMap<String, FederationConfig>,
    order: Vec<String>,
    data: RwLock<HashMap<String, CachedMembership>>,
    refresh_locks: HashMap<String, tokio::sync::Mutex<()>>,
    http: Arc<SafeHttpClient>,
}

impl FederationManager {
    pub fn new(configs: Vec<FederationConfig>, http: Arc<SafeHttpClient>) -> Self {
        let mut map = HashMap::new();
        let mut order = Vec::new();
        let mut locks = HashMap::new();
        for cfg in configs {
            order.push(cfg.federation_id.clone());
            locks.insert(cfg.federation_id.clone(), tokio::sync::Mutex::new(()));
            map.insert(cfg.federation_id.clone(), cfg);
        }
        Self { configs: map, order, data: RwLock::new(HashMap::new()), refresh_locks: locks, http }
    }

    pub fn federation_ids(&self) -> &[String] {
        &self.order
    }

    pub fn members_snapshot(&self, federation_id: &str) -> Vec<String> {
        self.data
            .read()
            .get(federation_id)
            .map(|c| c.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Union membership across enabled federations, refreshing stale caches on demand.
    pub async fn is_member(&self, host: &str) -> bool {
        let host = normalize_host(host);
        for id in &self.order {
            let Some(cfg) = self.configs.get(id) else { continue };
            if !cfg.enabled {
                continue;
            }
            self.maybe_refresh(cfg).await;
            if self.data.read().get(id).is_some_and(|c| c.members.contains(&host)) {
                return true;
            }
        }
        false
    }

    async fn maybe_refresh(&self, cfg: &FederationConfig) {
        let age = self.data.read().get(&cfg.federation_id).map(|c| c.last_refresh.elapsed());
        match age {
            Some(a) if a > cfg.max_stale => {
                self.data.write().remove(&cfg.federation_id);
                let _ = self.refresh(cfg).await;
            }
            Some(a) if a > cfg.ttl => {
                let _ = self.refresh(cfg).await;
            }
            None => {
                let _ = self.refresh(cfg).await;
            }
            _ => {}
        }
    }

    /// Downloads and verifies every directory-service URL for `cfg`. On success the
    /// cache is atomically swapped; on failure (F2) the prior cache is left in place.
    pub async fn refresh(&self, cfg: &FederationConfig) -> Result<(), FederationError> {
        let Some(lock) = self.refresh_locks.get(&cfg.federation_id) else {
            return Err(FederationError::Fetch("unknown federation".into()));
        };
        let _guard = lock.lock().await;

        let mut members = HashSet::new();
        let mut any_ok = false;
        for url in &cfg.directory_service_urls {
            match self.fetch_and_verify_one(url, cfg).await {
                Ok(entries) => {
                    any_ok = true;
                    members.extend(entries);
                }
                Err(_) => continue,
            }
        }
        if !any_ok {
            return Err(FederationError::NoKeyVerifies);
        }
        self.data.write().insert(
            cfg.federation_id.clone(),
            CachedMembership { members, last_refresh: Instant::now() },
        );
        Ok(())
    }

    async fn fetch_and_verify_one(&self, url: &str, cfg: &FederationConfig) -> Result<HashSet<String>, FederationError> {
        let parsed = Url::parse(url).map_err(|e| FederationError::Fetch(e.to_string()))?;
        let req = OutboundRequest { method: Method::GET, url: parsed, headers: Default::default(), body: None, signed: false };
        let resp = self.http.execute(req).await.map_err(|e| FederationError::Fetch(e.to_string()))?;
        if !resp.status.is_success() {
            return Err(FederationError::Fetch(format!("status {}", resp.status)));
        }
        let (protected, payload, signature) = parse_jws(&resp.body)?;

        let verified = cfg
            .keys
            .iter()
            .filter(|k| k.active)
            .any(|k| verify_signature(&protected, &payload, &signature, k));
        if !verified {
            return Err(FederationError::NoKeyVerifies);
        }

        let payload_bytes = B64URL.decode(&payload).map_err(|_| FederationError::Malformed)?;
        let parsed: MembershipPayload = serde_json::from_slice(&payload_bytes).map_err(|_| FederationError::Malformed)?;
        let entries = match parsed {
            MembershipPayload::Array(v) => v,
            MembershipPayload::Object { servers } => servers,
        };
        Ok(entries.into_iter().map(|e| e.host.to_lowercase()).collect())
    }
}
