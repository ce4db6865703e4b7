//! C6 — Peer profile registry + strict-first/single-quirk orchestrator.
//!
//! Domain→profile matching (ordered, first-match-wins) and the
//! strict-attempt-then-at-most-one-quirk execution pattern. Grounded on the
//! teacher's `policy/engine.rs` idempotent-attempt (`JoinResult`) and
//! ordered-first-match (`role_requirements`) idioms, generalized to an explicit
//! ordered `Vec` of `(pattern, profile)` pairs per the literal first-match rule.

use std::collections::HashMap;
use std::future::Future;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReasonCode {
    SignatureRequired,
    SignatureInvalid,
    SignatureMismatch,
    DigestMismatch,
    KeyidMismatch,
    KeyNotFound,
    TokenExchangeFailed,
    TokenInvalidFormat,
    TokenExpired,
    DiscoveryFailed,
    DiscoveryTimeout,
    PeerCapabilityMissing,
    NetworkError,
    PeerUnreachable,
    SsrfBlocked,
    TlsError,
    ProtocolMismatch,
    UnsupportedVersion,
    RemoteError,
    Unknown,
}

/// Wrapper error type that short-circuits classification — the orchestrator never
/// re-derives a reason code from a bare error, it trusts whatever produced this.
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    pub reason_code: ReasonCode,
    pub message: String,
}

impl ClassifiedError {
    pub fn new(reason_code: ReasonCode, message: impl Into<String>) -> Self {
        Self { reason_code, message: message.into() }
    }
}

/// Named, well-known quirk and the reason codes it addresses.
const QUIRKS: &[(&str, &[ReasonCode])] = &[
    (
        "accept_plain_token",
        &[ReasonCode::SignatureRequired, ReasonCode::SignatureInvalid, ReasonCode::KeyNotFound],
    ),
    (
        "send_token_in_body",
        &[ReasonCode::TokenExchangeFailed, ReasonCode::ProtocolMismatch],
    ),
    ("skip_digest_validation", &[ReasonCode::DigestMismatch]),
    (
        "allow_unsigned_discovery",
        &[ReasonCode::SignatureRequired, ReasonCode::SignatureInvalid],
    ),
    (
        "allow_keyid_mismatch",
        &[ReasonCode::KeyidMismatch, ReasonCode::SignatureMismatch],
    ),
];

fn quirk_applies_to(name: &str, reason: ReasonCode) -> bool {
    QUIRKS.iter().any(|(n, codes)| *n == name && codes.contains(&reason))
}

#[derive(Debug, Clone)]
pub struct PeerProfile {
    pub name: String,
    pub allow_unsigned_inbound: bool,
    pub allow_unsigned_outbound: bool,
    pub allow_mismatched_host: bool,
    pub allow_http: bool,
    pub relax_must_exchange_token: bool,
    /// Ordered; first quirk in this list whose `applies_to` contains the classified
    /// reason code wins (spec §4.6 step 3).
    pub quirks: Vec<String>,
    pub allowed_basic_auth_patterns: Vec<String>,
}

impl PeerProfile {
    pub fn strict() -> Self {
        Self {
            name: "strict".into(),
            allow_unsigned_inbound: false,
            allow_unsigned_outbound: false,
            allow_mismatched_host: false,
            allow_http: false,
            relax_must_exchange_token: false,
            quirks: vec![],
            allowed_basic_auth_patterns: vec![],
        }
    }

    pub fn nextcloud() -> Self {
        Self {
            name: "nextcloud".into(),
            relax_must_exchange_token: true,
            quirks: vec!["accept_plain_token".into()],
            ..Self::strict()
        }
    }

    pub fn owncloud() -> Self {
        Self {
            name: "owncloud".into(),
            relax_must_exchange_token: true,
            quirks: vec!["accept_plain_token".into()],
            ..Self::strict()
        }
    }

    pub fn dev() -> Self {
        Self {
            name: "dev".into(),
            allow_unsigned_inbound: true,
            allow_unsigned_outbound: true,
            allow_mismatched_host: true,
            allow_http: true,
            relax_must_exchange_token: true,
            quirks: vec![
                "accept_plain_token".into(),
                "send_token_in_body".into(),
                "skip_digest_validation".into(),
                "allow_unsigned_discovery".into(),
                "allow_keyid_mismatch".into(),
            ],
            allowed_basic_auth_patterns: vec![],
        }
    }

    /// First quirk (in this profile's declared order) addressing `reason`.
    pub fn first_quirk_for(&self, reason: ReasonCode) -> Option<&str> {
        self.quirks.iter().map(|s| s.as_str()).find(|q| quirk_applies_to(q, reason))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    Exact(String),
    Suffix(String),
}

impl Pattern {
    fn parse(raw: &str) -> Self {
        let lower = raw.to_lowercase();
        match lower.strip_prefix("*.") {
            Some(suffix) => Pattern::Suffix(suffix.to_string()),
            None => Pattern::Exact(lower),
        }
    }

    fn matches(&self, domain: &str) -> bool {
        match self {
            Pattern::Exact(e) => e == domain,
            Pattern::Suffix(s) => domain != *s && domain.ends_with(&format!(".{s}")),
        }
    }
}

/// Domain→profile mapping plus named profiles. Built-ins are seeded in `default()`
/// but custom mappings/profiles may extend or replace them by name.
pub struct ProfileRegistry {
    mappings: Vec<(Pattern, String)>,
    profiles: HashMap<String, PeerProfile>,
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        let mut profiles = HashMap::new();
        for p in [PeerProfile::strict(), PeerProfile::nextcloud(), PeerProfile::owncloud(), PeerProfile::dev()] {
            profiles.insert(p.name.clone(), p);
        }
        Self { mappings: Vec::new(), profiles }
    }
}

impl ProfileRegistry {
    /// Appends a mapping at the end of the match order (mappings scanned in
    /// insertion order; first match wins, per spec invariant 11).
    pub fn add_mapping(&mut self, pattern: &str, profile_name: &str) {
        self.mappings.push((Pattern::parse(pattern), profile_name.to_string()));
    }

    pub fn add_or_replace_profile(&mut self, profile: PeerProfile) {
        self.profiles.insert(profile.name.clone(), profile);
    }

    /// Looks up the profile for `domain`, stripping any port and lowercasing first.
    /// Falls back to the built-in `strict` profile when nothing matches.
    pub fn lookup(&self, domain: &str) -> &PeerProfile {
        let domain = domain.split(':').next().unwrap_or(domain).to_lowercase();
        for (pattern, name) in &self.mappings {
            if pattern.matches(&domain) {
                if let Some(p) = self.profiles.get(name) {
                    return p;
                }
            }
        }
        self.profiles.get("strict").expect("strict profile always registered")
    }
}

#[derive(Debug, Clone)]
pub enum AttemptResult<T> {
    Success { value: T, quirk_applied: Option<String>, reason_code: Option<ReasonCode> },
    Failure { reason_code: ReasonCode, message: String },
}

/// Tries `strict_fn` first; on a classified failure, asks `profile` for the single
/// eligible quirk and tries `quirk_fn` with it exactly once. Never calls `quirk_fn`
/// on strict success, and never calls it more than once.
pub async fn execute<T, F1, Fut1, F2, Fut2>(profile: &PeerProfile, strict_fn: F1, quirk_fn: F2) -> AttemptResult<T>
where
    F1: FnOnce() -> Fut1,
    Fut1: Future<Output = Result<T, ClassifiedError>>,
    F2: FnOnce(String) -> Fut2,
    Fut2: Future<Output = Result<T, ClassifiedError>>,
{
    match strict_fn().await {
        Ok(value) => AttemptResult::Success { value, quirk_applied: None, reason_code: None },
        Err(err) => match profile.first_quirk_for(err.reason_code) {
            None => AttemptResult::Failure { reason_code: err.reason_code, message: err.message },
            Some(quirk_name) => {
                let quirk_name = quirk_name.to_string();
                match quirk_fn(quirk_name.clone()).await {
                    Ok(value) => {
                        AttemptResult::Success { value, quirk_applied: Some(quirk_name), reason_code: Some(err.reason_code) }
                    }
                    Err(qerr) => AttemptResult::Failure { reason_code: qerr.reason_code, message: qerr.message },
                }
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn exact_pattern_matches_only_itself() {
        let p = Pattern::parse("cloud.example.com");
        assert!(p.matches("cloud.example.com"));
        assert!(!p.matches("sub.cloud.example.com"));
    }

    #[test]
    fn suffix_pattern_matches_any_depth_not_bare_domain() {
        let p = Pattern::parse("*.example.com");
        assert!(p.matches("a.example.com"));
        assert!(p.matches("a.b.example.com"));
        assert!(!p.matches("example.com"));
    }

    #[test]
    fn lookup_strips_port_and_lowercases() {
        let mut r = ProfileRegistry::default();
        r.add_mapping("cloud.example.com", "nextcloud");
        assert_eq!(r.lookup("Cloud.Example.Com:8080").name, "nextcloud");
    }

    #[test]
    fn lookup_is_order_preserving_first_match_wins() {
        let mut r = ProfileRegistry::default();
        r.add_mapping("*.example.com", "dev");
        r.add_mapping("a.example.com", "nextcloud");
        assert_eq!(r.lookup("a.example.com").name, "dev");
    }

    #[test]
    fn no_match_falls_back_to_strict() {
        let r = ProfileRegistry::default();
        assert_eq!(r.lookup("unknown.example").name, "strict");
    }

    #[tokio::test]
    async fn strict_success_never_calls_quirk_fn() {
        let profile = PeerProfile::nextcloud();
        let quirk_calls = AtomicUsize::new(0);
        let result = execute(
            &profile,
            || async { Ok::<_, ClassifiedError>(42) },
            |_name| {
                quirk_calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, ClassifiedError>(0) }
            },
        )
        .await;
        assert!(matches!(result, AttemptResult::Success { quirk_applied: None, .. }));
        assert_eq!(quirk_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn eligible_quirk_is_tried_exactly_once() {
        let profile = PeerProfile::nextcloud();
        let quirk_calls = AtomicUsize::new(0);
        let result = execute(
            &profile,
            || async { Err(ClassifiedError::new(ReasonCode::SignatureRequired, "no sig")) },
            |name| {
                quirk_calls.fetch_add(1, Ordering::SeqCst);
                assert_eq!(name, "accept_plain_token");
                async { Ok::<_, ClassifiedError>(7) }
            },
        )
        .await;
        assert!(matches!(
            result,
            AttemptResult::Success { quirk_applied: Some(ref q), .. } if q == "accept_plain_token"
        ));
        assert_eq!(quirk_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_eligible_quirk_fails_without_calling_quirk_fn() {
        let profile = PeerProfile::strict();
        let quirk_calls = AtomicUsize::new(0);
        let result = execute(
            &profile,
            || async { Err(ClassifiedError::new(ReasonCode::SignatureRequired, "no sig")) },
            |_name| {
                quirk_calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, ClassifiedError>(0) }
            },
        )
        .await;
        assert!(matches!(result, AttemptResult::Failure { reason_code: ReasonCode::SignatureRequired, .. }));
        assert_eq!(quirk_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_quirk_surfaces_quirk_reason_code() {
        let profile = PeerProfile::nextcloud();
        let result = execute(
            &profile,
            || async { Err(ClassifiedError::new(ReasonCode::SignatureRequired, "no sig")) },
            |_name| async { Err(ClassifiedError::new(ReasonCode::TokenExpired, "quirk failed too")) },
        )
        .await;
        assert!(matches!(result, AttemptResult::Failure { reason_code: ReasonCode::TokenExpired, .. }));
    }
}
