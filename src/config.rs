//! C12 — Configuration & operating mode.
//!
//! Three presets (strict/interop/dev) layered with a file overlay then a flag
//! overlay, enum fields revalidated after the full overlay is applied. Grounded on
//! the teacher's `ServerConfig::parse()` (clap-derive) entry point in `main.rs`; the
//! file/flag layering itself has no teacher analog and is built directly from
//! spec.md §4.12/§6.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::federation::{FederationConfig, FederationKey, KeyAlgorithm};
use crate::http_client::{ClientConfig, SsrfMode};
use crate::peers::ProfileRegistry;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid operating mode: {0}")]
    InvalidMode(String),
    #[error("failed to read config file {path}: {source}")]
    ReadFile { path: String, source: std::io::Error },
    #[error("failed to parse config file: {0}")]
    ParseToml(String),
    #[error("federation enabled but config_paths is empty or unreadable: {0}")]
    FederationConfigPaths(String),
    #[error("signature.inbound_mode=off forbids advertise_http_request_signatures=true")]
    GuardrailViolation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    Strict,
    Interop,
    Dev,
}

impl std::str::FromStr for OperatingMode {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "interop" => Ok(Self::Interop),
            "dev" => Ok(Self::Dev),
            other => Err(ConfigError::InvalidMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboundSignatureMode {
    Strict,
    Lenient,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboundSignatureMode {
    Strict,
    CriteriaOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnDiscoveryError {
    Allow,
    Reject,
}

#[derive(Debug, Clone)]
pub struct SignatureConfig {
    pub inbound_mode: InboundSignatureMode,
    pub outbound_mode: OutboundSignatureMode,
    pub on_discovery_error: OnDiscoveryError,
    pub advertise_http_request_signatures: bool,
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub acme_enabled: bool,
    pub acme_email: Option<String>,
    pub acme_cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct BootstrapAdmin {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct ServerSection {
    pub listen_addr: String,
    pub external_origin: String,
    pub external_base_path: Option<String>,
    pub data_dir: PathBuf,
    pub key_path: PathBuf,
    pub bootstrap_admin: Option<BootstrapAdmin>,
    pub trusted_proxies: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CacheSection {
    pub driver: String,
    pub default_ttl: Duration,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct FederationPolicySection {
    pub global_enforce: bool,
    pub allow_list: Vec<String>,
    pub deny_list: Vec<String>,
    pub exempt_list: Vec<String>,
}

/// The fully-resolved configuration, after preset → file → flag overlay and enum
/// revalidation. This is what `main.rs` and the rest of the crate consume.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: OperatingMode,
    pub server: ServerSection,
    pub tls: TlsConfig,
    pub outbound_http: ClientConfig,
    pub signature: SignatureConfig,
    pub cache: CacheSection,
    pub federation_enabled: bool,
    pub federation_config_paths: Vec<PathBuf>,
    pub federation_policy: FederationPolicySection,
    pub federation_membership_ttl: Duration,
    pub federation_membership_max_stale: Duration,
    pub profile_mappings: Vec<(String, String)>,
    /// Unknown top-level/section keys seen in the file overlay; logged, never fatal.
    pub unknown_keys: Vec<String>,
    custom_profiles_raw: Vec<(String, RawCustomProfile)>,
}

impl OperatingMode {
    fn defaults(self) -> Config {
        let (inbound_mode, outbound_mode, ssrf_mode, max_redirects, insecure_skip_verify, on_discovery_error, tls_enabled) =
            match self {
                OperatingMode::Strict => (
                    InboundSignatureMode::Strict,
                    OutboundSignatureMode::Strict,
                    SsrfMode::Strict,
                    1,
                    false,
                    OnDiscoveryError::Reject,
                    true,
                ),
                OperatingMode::Interop => (
                    InboundSignatureMode::Lenient,
                    OutboundSignatureMode::CriteriaOnly,
                    SsrfMode::Strict,
                    1,
                    false,
                    OnDiscoveryError::Reject,
                    true,
                ),
                OperatingMode::Dev => (
                    InboundSignatureMode::Lenient,
                    OutboundSignatureMode::CriteriaOnly,
                    SsrfMode::Off,
                    3,
                    true,
                    OnDiscoveryError::Allow,
                    false,
                ),
            };

        Config {
            mode: self,
            server: ServerSection {
                listen_addr: "0.0.0.0:8443".into(),
                external_origin: "https://localhost".into(),
                external_base_path: None,
                data_dir: PathBuf::from("./data"),
                key_path: PathBuf::from("./data/signing.key"),
                bootstrap_admin: None,
                trusted_proxies: Vec::new(),
            },
            tls: TlsConfig {
                enabled: tls_enabled,
                cert_path: None,
                key_path: None,
                acme_enabled: false,
                acme_email: None,
                acme_cache_dir: None,
            },
            outbound_http: ClientConfig {
                connect_timeout: Duration::from_secs(5),
                timeout: Duration::from_secs(15),
                max_redirects,
                max_response_bytes: 10 * 1024 * 1024,
                ssrf_mode,
                insecure_skip_verify,
            },
            signature: SignatureConfig {
                inbound_mode,
                outbound_mode,
                on_discovery_error,
                advertise_http_request_signatures: !matches!(inbound_mode, InboundSignatureMode::Off),
            },
            cache: CacheSection {
                driver: "memory".into(),
                default_ttl: crate::discovery::DEFAULT_DISCOVERY_TTL,
                sweep_interval: Duration::from_secs(60),
            },
            federation_enabled: false,
            federation_config_paths: Vec::new(),
            federation_policy: FederationPolicySection {
                global_enforce: !matches!(self, OperatingMode::Dev),
                allow_list: Vec::new(),
                deny_list: Vec::new(),
                exempt_list: Vec::new(),
            },
            federation_membership_ttl: Duration::from_secs(6 * 3600),
            federation_membership_max_stale: Duration::from_secs(7 * 24 * 3600),
            profile_mappings: Vec::new(),
            unknown_keys: Vec::new(),
            custom_profiles_raw: Vec::new(),
        }
    }
}

/// Raw TOML shape. Every field optional: presence of a sub-table selects whether it
/// overlays onto the preset (spec §4.12's "per-section pointer presence" rule).
#[derive(Debug, Default, Deserialize)]
struct RawFile {
    server: Option<RawServer>,
    tls: Option<RawTls>,
    outbound_http: Option<RawOutboundHttp>,
    signature: Option<RawSignature>,
    peer_profiles: Option<RawPeerProfiles>,
    cache: Option<RawCache>,
    federation: Option<RawFederation>,
    #[serde(flatten)]
    unknown: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawServer {
    listen_addr: Option<String>,
    external_origin: Option<String>,
    external_base_path: Option<String>,
    data_dir: Option<String>,
    key_path: Option<String>,
    bootstrap_admin: Option<RawBootstrapAdmin>,
    trusted_proxies: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawBootstrapAdmin {
    username: String,
    password: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawTls {
    enabled: Option<bool>,
    cert_path: Option<String>,
    key_path: Option<String>,
    acme: Option<RawAcme>,
}

#[derive(Debug, Default, Deserialize)]
struct RawAcme {
    enabled: Option<bool>,
    email: Option<String>,
    cache_dir: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawOutboundHttp {
    connect_timeout_secs: Option<u64>,
    timeout_secs: Option<u64>,
    max_redirects: Option<u8>,
    max_response_bytes: Option<u64>,
    ssrf_mode: Option<String>,
    insecure_skip_verify: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSignature {
    inbound_mode: Option<String>,
    outbound_mode: Option<String>,
    on_discovery_error: Option<String>,
    advertise_http_request_signatures: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPeerProfiles {
    #[serde(default)]
    mappings: BTreeMap<String, String>,
    #[serde(default)]
    custom_profiles: BTreeMap<String, RawCustomProfile>,
}

#[derive(Debug, Default, Clone, Deserialize)]
struct RawCustomProfile {
    #[serde(default)]
    allow_unsigned_inbound: bool,
    #[serde(default)]
    allow_unsigned_outbound: bool,
    #[serde(default)]
    allow_mismatched_host: bool,
    #[serde(default)]
    allow_http: bool,
    #[serde(default)]
    relax_must_exchange_token: bool,
    #[serde(default)]
    quirks: Vec<String>,
    #[serde(default)]
    allowed_basic_auth_patterns: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCache {
    driver: Option<String>,
    default_ttl_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawFederation {
    enabled: Option<bool>,
    config_paths: Option<Vec<String>>,
    membership_cache: Option<RawMembershipCache>,
    policy: Option<RawFederationPolicy>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMembershipCache {
    ttl_seconds: Option<u64>,
    max_stale_seconds: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawFederationPolicy {
    global_enforce: Option<bool>,
    allow_list: Option<Vec<String>>,
    deny_list: Option<Vec<String>>,
    exempt_list: Option<Vec<String>>,
}

/// Individual federation-member config file, one per path in `federation.config_paths`.
#[derive(Debug, Deserialize)]
pub struct FederationConfigFile {
    pub federation_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub enforce_membership: bool,
    #[serde(default)]
    pub keys: Vec<RawFederationKey>,
    #[serde(default)]
    pub directory_service_urls: Vec<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct RawFederationKey {
    pub pem_or_raw: String,
    pub algorithm: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

/// Flag overlay: CLI flags, each applied only when non-empty/Some (spec §4.12).
#[derive(Debug, Default, Clone)]
pub struct FlagOverlay {
    pub config_path: Option<PathBuf>,
    pub mode: Option<String>,
    pub listen_addr: Option<String>,
    pub external_base_path: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

impl Config {
    /// Loads configuration: preset (from `flags.mode` or `strict`) → file overlay →
    /// flag overlay → enum revalidation. Never touches the network.
    pub fn load(flags: &FlagOverlay) -> Result<Self, ConfigError> {
        let mode = match &flags.mode {
            Some(m) if !m.is_empty() => m.parse::<OperatingMode>()?,
            _ => OperatingMode::Strict,
        };
        let mut config = mode.defaults();

        if let Some(path) = &flags.config_path {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFile { path: path.display().to_string(), source: e })?;
            let raw: RawFile = toml::from_str(&text).map_err(|e| ConfigError::ParseToml(e.to_string()))?;
            config.apply_file(raw);
        }

        config.apply_flags(flags);
        config.revalidate()?;
        Ok(config)
    }

    fn apply_file(&mut self, raw: RawFile) {
        if let Some(s) = raw.server {
            if let Some(v) = s.listen_addr {
                self.server.listen_addr = v;
            }
            if let Some(v) = s.external_origin {
                self.server.external_origin = v;
            }
            if s.external_base_path.is_some() {
                self.server.external_base_path = s.external_base_path;
            }
            if let Some(v) = s.data_dir {
                self.server.data_dir = PathBuf::from(v);
            }
            if let Some(v) = s.key_path {
                self.server.key_path = PathBuf::from(v);
            }
            if let Some(b) = s.bootstrap_admin {
                self.server.bootstrap_admin = Some(BootstrapAdmin { username: b.username, password: b.password });
            }
            if let Some(v) = s.trusted_proxies {
                self.server.trusted_proxies = v;
            }
        }
        if let Some(t) = raw.tls {
            if let Some(v) = t.enabled {
                self.tls.enabled = v;
            }
            if let Some(v) = t.cert_path {
                self.tls.cert_path = Some(PathBuf::from(v));
            }
            if let Some(v) = t.key_path {
                self.tls.key_path = Some(PathBuf::from(v));
            }
            if let Some(acme) = t.acme {
                if let Some(v) = acme.enabled {
                    self.tls.acme_enabled = v;
                }
                if acme.email.is_some() {
                    self.tls.acme_email = acme.email;
                }
                if let Some(v) = acme.cache_dir {
                    self.tls.acme_cache_dir = Some(PathBuf::from(v));
                }
            }
        }
        if let Some(o) = raw.outbound_http {
            if let Some(v) = o.connect_timeout_secs {
                self.outbound_http.connect_timeout = Duration::from_secs(v);
            }
            if let Some(v) = o.timeout_secs {
                self.outbound_http.timeout = Duration::from_secs(v);
            }
            if let Some(v) = o.max_redirects {
                self.outbound_http.max_redirects = v;
            }
            if let Some(v) = o.max_response_bytes {
                self.outbound_http.max_response_bytes = v;
            }
            if let Some(v) = o.ssrf_mode {
                self.outbound_http.ssrf_mode = match v.to_lowercase().as_str() {
                    "off" => SsrfMode::Off,
                    _ => SsrfMode::Strict,
                };
            }
            if let Some(v) = o.insecure_skip_verify {
                self.outbound_http.insecure_skip_verify = v;
            }
        }
        if let Some(sig) = raw.signature {
            if let Some(v) = sig.inbound_mode {
                self.signature.inbound_mode = match v.to_lowercase().as_str() {
                    "strict" => InboundSignatureMode::Strict,
                    "off" => InboundSignatureMode::Off,
                    _ => InboundSignatureMode::Lenient,
                };
            }
            if let Some(v) = sig.outbound_mode {
                self.signature.outbound_mode = match v.to_lowercase().as_str() {
                    "strict" => OutboundSignatureMode::Strict,
                    _ => OutboundSignatureMode::CriteriaOnly,
                };
            }
            if let Some(v) = sig.on_discovery_error {
                self.signature.on_discovery_error = match v.to_lowercase().as_str() {
                    "allow" => OnDiscoveryError::Allow,
                    _ => OnDiscoveryError::Reject,
                };
            }
            if let Some(v) = sig.advertise_http_request_signatures {
                self.signature.advertise_http_request_signatures = v;
            }
        }
        if let Some(pp) = raw.peer_profiles {
            for (pattern, profile) in pp.mappings {
                self.profile_mappings.push((pattern, profile));
            }
            // Custom profiles are materialized by the caller via `ProfileRegistry`;
            // stash them as unknown-shaped data is avoided — see `build_profile_registry`.
            self.custom_profiles_raw = pp.custom_profiles.into_iter().collect();
        }
        if let Some(c) = raw.cache {
            if let Some(v) = c.driver {
                self.cache.driver = v;
            }
            if let Some(v) = c.default_ttl_secs {
                self.cache.default_ttl = Duration::from_secs(v);
            }
            if let Some(v) = c.sweep_interval_secs {
                self.cache.sweep_interval = Duration::from_secs(v);
            }
        }
        if let Some(f) = raw.federation {
            if let Some(v) = f.enabled {
                self.federation_enabled = v;
            }
            if let Some(v) = f.config_paths {
                self.federation_config_paths = v.into_iter().map(PathBuf::from).collect();
            }
            if let Some(mc) = f.membership_cache {
                if let Some(v) = mc.ttl_seconds {
                    self.federation_membership_ttl = Duration::from_secs(v);
                }
                if let Some(v) = mc.max_stale_seconds {
                    self.federation_membership_max_stale = Duration::from_secs(v);
                }
            }
            if let Some(p) = f.policy {
                if let Some(v) = p.global_enforce {
                    self.federation_policy.global_enforce = v;
                }
                if let Some(v) = p.allow_list {
                    self.federation_policy.allow_list = v;
                }
                if let Some(v) = p.deny_list {
                    self.federation_policy.deny_list = v;
                }
                if let Some(v) = p.exempt_list {
                    self.federation_policy.exempt_list = v;
                }
            }
        }
        self.unknown_keys = raw.unknown.into_keys().collect();
        for key in &self.unknown_keys {
            tracing::warn!(key, "unknown config key (ignored, not fatal)");
        }
    }

    fn apply_flags(&mut self, flags: &FlagOverlay) {
        if let Some(v) = &flags.listen_addr {
            if !v.is_empty() {
                self.server.listen_addr = v.clone();
            }
        }
        if let Some(v) = &flags.external_base_path {
            if !v.is_empty() {
                self.server.external_base_path = Some(v.clone());
            }
        }
        if let Some(v) = &flags.data_dir {
            self.server.data_dir = v.clone();
        }
        if let Some(v) = &flags.key_path {
            self.server.key_path = v.clone();
        }
    }

    fn revalidate(&self) -> Result<(), ConfigError> {
        if matches!(self.signature.inbound_mode, InboundSignatureMode::Off)
            && self.signature.advertise_http_request_signatures
        {
            return Err(ConfigError::GuardrailViolation);
        }
        if self.federation_enabled {
            if self.federation_config_paths.is_empty() {
                return Err(ConfigError::FederationConfigPaths("config_paths is empty".into()));
            }
            for path in &self.federation_config_paths {
                if !path.exists() {
                    return Err(ConfigError::FederationConfigPaths(path.display().to_string()));
                }
            }
        }
        Ok(())
    }

    /// Loads every federation member config file named in `federation_config_paths`
    /// and builds the live [`crate::federation::FederationManager`] configs.
    pub fn load_federation_configs(&self) -> Result<Vec<FederationConfig>, ConfigError> {
        let mut out = Vec::new();
        for path in &self.federation_config_paths {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFile { path: path.display().to_string(), source: e })?;
            let raw: FederationConfigFile = toml::from_str(&text).map_err(|e| ConfigError::ParseToml(e.to_string()))?;
            let keys = raw
                .keys
                .into_iter()
                .map(|k| FederationKey {
                    pem_or_raw: k.pem_or_raw,
                    algorithm: match k.algorithm.to_lowercase().as_str() {
                        "es256" => KeyAlgorithm::Es256,
                        "rs256" => KeyAlgorithm::Rs256,
                        _ => KeyAlgorithm::Ed25519,
                    },
                    active: k.active,
                })
                .collect();
            out.push(FederationConfig {
                federation_id: raw.federation_id,
                enabled: raw.enabled,
                enforce_membership: raw.enforce_membership,
                keys,
                directory_service_urls: raw.directory_service_urls,
                ttl: self.federation_membership_ttl,
                max_stale: self.federation_membership_max_stale,
            });
        }
        Ok(out)
    }

    /// Builds the peer-profile registry from `profile_mappings` and any custom
    /// profiles parsed from the file overlay.
    pub fn build_profile_registry(&self) -> ProfileRegistry {
        let mut registry = ProfileRegistry::default();
        for (name, raw) in &self.custom_profiles_raw {
            registry.add_or_replace_profile(crate::peers::PeerProfile {
                name: name.clone(),
                allow_unsigned_inbound: raw.allow_unsigned_inbound,
                allow_unsigned_outbound: raw.allow_unsigned_outbound,
                allow_mismatched_host: raw.allow_mismatched_host,
                allow_http: raw.allow_http,
                relax_must_exchange_token: raw.relax_must_exchange_token,
                quirks: raw.quirks.clone(),
                allowed_basic_auth_patterns: raw.allowed_basic_auth_patterns.clone(),
            });
        }
        for (pattern, profile) in &self.profile_mappings {
            registry.add_mapping(pattern, profile);
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_preset_has_expected_defaults() {
        let c = OperatingMode::Strict.defaults();
        assert_eq!(c.outbound_http.max_redirects, 1);
        assert!(!c.outbound_http.insecure_skip_verify);
        assert_eq!(c.outbound_http.ssrf_mode, SsrfMode::Strict);
        assert!(matches!(c.signature.inbound_mode, InboundSignatureMode::Strict));
    }

    #[test]
    fn dev_preset_is_maximally_permissive() {
        let c = OperatingMode::Dev.defaults();
        assert_eq!(c.outbound_http.ssrf_mode, SsrfMode::Off);
        assert!(c.outbound_http.insecure_skip_verify);
        assert_eq!(c.outbound_http.max_redirects, 3);
        assert!(!c.tls.enabled);
    }

    #[test]
    fn file_overlay_applies_on_top_of_preset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ocm.toml");
        std::fs::write(
            &path,
            r#"
            [server]
            listen_addr = "0.0.0.0:9443"

            [outbound_http]
            max_redirects = 5
            "#,
        )
        .unwrap();
        let flags = FlagOverlay { config_path: Some(path), ..Default::default() };
        let config = Config::load(&flags).unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:9443");
        assert_eq!(config.outbound_http.max_redirects, 5);
    }

    #[test]
    fn flag_overlay_wins_over_file_and_preset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ocm.toml");
        std::fs::write(&path, r#"[server]
listen_addr = "0.0.0.0:9443""#).unwrap();
        let flags = FlagOverlay {
            config_path: Some(path),
            listen_addr: Some("0.0.0.0:7777".into()),
            ..Default::default()
        };
        let config = Config::load(&flags).unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:7777");
    }

    #[test]
    fn empty_flag_does_not_override() {
        let flags = FlagOverlay { listen_addr: Some(String::new()), ..Default::default() };
        let config = Config::load(&flags).unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:8443");
    }

    #[test]
    fn guardrail_rejects_off_inbound_with_advertised_signatures() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ocm.toml");
        std::fs::write(
            &path,
            r#"
            [signature]
            inbound_mode = "off"
            advertise_http_request_signatures = true
            "#,
        )
        .unwrap();
        let flags = FlagOverlay { config_path: Some(path), ..Default::default() };
        assert!(matches!(Config::load(&flags), Err(ConfigError::GuardrailViolation)));
    }

    #[test]
    fn federation_enabled_without_config_paths_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ocm.toml");
        std::fs::write(&path, r#"[federation]
enabled = true"#).unwrap();
        let flags = FlagOverlay { config_path: Some(path), ..Default::default() };
        assert!(matches!(Config::load(&flags), Err(ConfigError::FederationConfigPaths(_))));
    }

    #[test]
    fn unknown_keys_are_collected_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ocm.toml");
        std::fs::write(&path, r#"totally_unknown_key = 1"#).unwrap();
        let flags = FlagOverlay { config_path: Some(path), ..Default::default() };
        let config = Config::load(&flags).unwrap();
        assert_eq!(config.unknown_keys, vec!["totally_unknown_key".to_string()]);
    }

    #[test]
    fn invalid_mode_flag_is_rejected() {
        let flags = FlagOverlay { mode: Some("bogus".into()), ..Default::default() };
        assert!(matches!(Config::load(&flags), Err(ConfigError::InvalidMode(_))));
    }
}
