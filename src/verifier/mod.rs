//! C7 — Inbound request verifier.
//!
//! Declared-peer extraction → signature verification → content-digest check →
//! peer-identity context stamping, exactly the pipeline described for each
//! endpoint by spec.md §4.7. Grounded on the teacher's `web.rs` auth-middleware
//! shape (read body once, re-attach for downstream handlers, stamp an extension)
//! generalized from bearer tokens to HTTP message signatures.

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;

use crate::config::{InboundSignatureMode, OnDiscoveryError};
use crate::discovery::DiscoveryClient;
use crate::error::{AppError, ErrorKind};
use crate::signature::{self, MessageParts, SignatureError};
use crate::state::AppState;

/// Identity stamped into the request's extensions once verification completes.
#[derive(Debug, Clone)]
pub struct PeerContext {
    pub host: String,
    pub authenticated: bool,
    pub key_id: Option<String>,
}

/// Extracts the declared peer host from a request body. Resolvers never fail —
/// an unparsable or absent declaration simply yields an empty string, which means
/// "identity must come from the signature" (spec.md §4.7 step 3).
pub type DeclaredPeerResolver = fn(&[u8]) -> String;

pub fn shares_resolver(body: &[u8]) -> String {
    let Ok(v) = serde_json::from_slice::<serde_json::Value>(body) else { return String::new() };
    for field in ["sender", "owner"] {
        if let Some(s) = v.get(field).and_then(|x| x.as_str()) {
            if let Some(host) = host_part_of_address(s) {
                return host;
            }
        }
    }
    String::new()
}

pub fn invite_accepted_resolver(body: &[u8]) -> String {
    let Ok(v) = serde_json::from_slice::<serde_json::Value>(body) else { return String::new() };
    v.get("recipientProvider").and_then(|x| x.as_str()).unwrap_or_default().to_string()
}

pub fn no_declared_peer_resolver(_body: &[u8]) -> String {
    String::new()
}

/// `user@host` or bare `host` → `host`.
fn host_part_of_address(addr: &str) -> Option<String> {
    let host = addr.rsplit_once('@').map(|(_, h)| h).unwrap_or(addr);
    if host.is_empty() { None } else { Some(host.to_lowercase()) }
}

fn normalize_host(host: &str) -> String {
    host.split(':').next().unwrap_or(host).to_lowercase()
}

/// Pure verification core, independent of axum's request/response types so it can
/// be unit tested directly.
pub async fn verify(
    discovery: &DiscoveryClient,
    inbound_mode: InboundSignatureMode,
    on_discovery_error: OnDiscoveryError,
    allow_mismatch: bool,
    declared_peer: &str,
    signature_input: Option<&str>,
    signature_header: Option<&str>,
    content_digest_header: Option<&str>,
    parts: &MessageParts,
    body: &[u8],
) -> Result<PeerContext, AppError> {
    if matches!(inbound_mode, InboundSignatureMode::Off) {
        return Ok(PeerContext { host: declared_peer.to_string(), authenticated: false, key_id: None });
    }

    let headers_present = signature::has_signature_headers(signature_input, signature_header);

    let context = if headers_present {
        let sig_input = signature_input.unwrap();
        let sig_header = signature_header.unwrap();

        let parsed = signature::parse_signature_input(sig_input)
            .map_err(|e| AppError::new(ErrorKind::SignatureInvalid, e.to_string()))?;
        let key_host = signature::keyid_to_host(&parsed.keyid)
            .ok_or_else(|| AppError::new(ErrorKind::SignatureInvalid, "keyId has no host"))?;

        let verifying_key = resolve_public_key(discovery, &key_host, &parsed.keyid).await?;

        signature::verify_with_key(sig_input, sig_header, parts, &verifying_key)
            .map_err(|e| classify_signature_error(e))?;

        if !declared_peer.is_empty() && !allow_mismatch && normalize_host(declared_peer) != normalize_host(&key_host) {
            return Err(AppError::new(ErrorKind::PeerMismatch, "peer identity mismatch"));
        }

        PeerContext { host: key_host, authenticated: true, key_id: Some(parsed.keyid) }
    } else {
        match inbound_mode {
            InboundSignatureMode::Off => unreachable!("handled above"),
            InboundSignatureMode::Strict => {
                return Err(AppError::new(ErrorKind::SignatureRequired, "signature required"));
            }
            InboundSignatureMode::Lenient => {
                if declared_peer.is_empty() {
                    return Err(AppError::new(ErrorKind::SignatureRequired, "signature required"));
                }
                let signing_capable = match discovery.discover(&format!("https://{declared_peer}")).await {
                    Ok(doc) => doc.has_capability("http-sig"),
                    Err(_) => match on_discovery_error {
                        OnDiscoveryError::Allow => false,
                        OnDiscoveryError::Reject => {
                            return Err(AppError::new(ErrorKind::UpstreamUnreachable, "discovery failed"));
                        }
                    },
                };
                if signing_capable {
                    return Err(AppError::new(ErrorKind::SignatureRequired, "peer advertises signing but sent none"));
                }
                PeerContext { host: declared_peer.to_string(), authenticated: false, key_id: None }
            }
        }
    };

    if let Some(digest_header) = content_digest_header {
        if !signature::verify_content_digest(digest_header, body) {
            return Err(AppError::new(ErrorKind::DigestMismatch, "content-digest mismatch"));
        }
    }

    Ok(context)
}

async fn resolve_public_key(
    discovery: &DiscoveryClient,
    key_host: &str,
    keyid: &str,
) -> Result<ed25519_dalek::VerifyingKey, AppError> {
    let doc = discovery
        .discover(&format!("https://{key_host}"))
        .await
        .map_err(|e| AppError::new(ErrorKind::UpstreamUnreachable, e.to_string()))?;
    let pem = doc
        .get_public_key(keyid)
        .ok_or_else(|| AppError::new(ErrorKind::SignatureInvalid, "unknown keyId"))?;
    signature::parse_ed25519_public_key_pem(pem).map_err(|e| AppError::new(ErrorKind::SignatureInvalid, e.to_string()))
}

fn classify_signature_error(err: SignatureError) -> AppError {
    match err {
        SignatureError::DigestMismatch => AppError::new(ErrorKind::DigestMismatch, err.to_string()),
        SignatureError::MissingHeaders => AppError::new(ErrorKind::SignatureRequired, err.to_string()),
        _ => AppError::new(ErrorKind::SignatureInvalid, err.to_string()),
    }
}

fn message_parts_from_request(headers: &HeaderMap, method: &str, target_uri: &str, authority: &str, path: &str, query: Option<&str>) -> MessageParts {
    MessageParts {
        method: method.to_string(),
        target_uri: target_uri.to_string(),
        authority: authority.to_string(),
        path: path.to_string(),
        query: query.map(|q| q.to_string()),
        content_type: headers.get("content-type").and_then(|v| v.to_str().ok()).map(|s| s.to_string()),
        content_length: headers.get("content-length").and_then(|v| v.to_str().ok()).map(|s| s.to_string()),
        content_digest: headers.get(signature::CONTENT_DIGEST_HEADER).and_then(|v| v.to_str().ok()).map(|s| s.to_string()),
    }
}

/// Core of the axum middleware, parameterized by `resolver`. Not itself usable
/// with `middleware::from_fn_with_state` (that requires a fixed extractor
/// signature) — see the per-endpoint wrappers below.
async fn run_middleware(
    state: Arc<AppState>,
    resolver: DeclaredPeerResolver,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let (mut parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| AppError::new(ErrorKind::BadRequest, format!("failed to read body: {e}")))?;

    let declared_peer = resolver(&bytes);
    let signature_input = parts.headers.get(signature::SIGNATURE_INPUT_HEADER).and_then(|v| v.to_str().ok()).map(|s| s.to_string());
    let signature_header = parts.headers.get(signature::SIGNATURE_HEADER).and_then(|v| v.to_str().ok()).map(|s| s.to_string());
    let content_digest_header = parts.headers.get(signature::CONTENT_DIGEST_HEADER).and_then(|v| v.to_str().ok()).map(|s| s.to_string());

    let authority = parts
        .headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(|s| s.to_string());
    let target_uri = match &query {
        Some(q) => format!("https://{authority}{path}?{q}"),
        None => format!("https://{authority}{path}"),
    };
    let message_parts = message_parts_from_request(
        &parts.headers,
        parts.method.as_str(),
        &target_uri,
        &authority,
        &path,
        query.as_deref(),
    );

    let context = verify(
        &state.discovery,
        state.config.signature.inbound_mode,
        state.config.signature.on_discovery_error,
        false,
        &declared_peer,
        signature_input.as_deref(),
        signature_header.as_deref(),
        content_digest_header.as_deref(),
        &message_parts,
        &bytes,
    )
    .await?;

    parts.extensions.insert(context);
    let request = Request::from_parts(parts, Body::from(bytes));
    Ok(next.run(request).await)
}

/// `/ocm/shares` — declared peer is the host-part of `sender`/`owner` (spec.md §4.7).
pub async fn verify_shares(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Result<Response, AppError> {
    run_middleware(state, shares_resolver, request, next).await
}

/// `/ocm/invite-accepted` — declared peer is `recipientProvider`.
pub async fn verify_invite_accepted(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    run_middleware(state, invite_accepted_resolver, request, next).await
}

/// `/ocm/notifications` and `/ocm/token` — identity must come from the signature.
pub async fn verify_no_declared_peer(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    run_middleware(state, no_declared_peer_resolver, request, next).await
}

/// Reconstructs a readable `Bytes` body for a handler that needs the raw bytes
/// already consumed by the middleware (rarely needed — most handlers use `Json<T>`).
pub fn body_bytes(request: &Request) -> Option<&Bytes> {
    request.extensions().get::<Bytes>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::http_client::{ClientConfig, SafeHttpClient};
    use std::sync::Arc as StdArc;
    use std::time::Duration;

    fn test_discovery() -> DiscoveryClient {
        let http = StdArc::new(SafeHttpClient::new(ClientConfig::default()).unwrap());
        DiscoveryClient::new(http, Some(StdArc::new(MemoryCache::new(Duration::from_secs(60)))), Duration::from_secs(60))
    }

    fn empty_parts() -> MessageParts {
        MessageParts {
            method: "POST".into(),
            target_uri: "https://receiver.example/ocm/shares".into(),
            authority: "receiver.example".into(),
            path: "/ocm/shares".into(),
            query: None,
            content_type: None,
            content_length: None,
            content_digest: None,
        }
    }

    #[tokio::test]
    async fn off_mode_bypasses_verification_entirely() {
        let discovery = test_discovery();
        let ctx = verify(
            &discovery,
            InboundSignatureMode::Off,
            OnDiscoveryError::Reject,
            false,
            "peer.example",
            None,
            None,
            None,
            &empty_parts(),
            b"",
        )
        .await
        .unwrap();
        assert_eq!(ctx.host, "peer.example");
        assert!(!ctx.authenticated);
    }

    #[tokio::test]
    async fn strict_mode_without_signature_is_rejected() {
        let discovery = test_discovery();
        let err = verify(
            &discovery,
            InboundSignatureMode::Strict,
            OnDiscoveryError::Reject,
            false,
            "peer.example",
            None,
            None,
            None,
            &empty_parts(),
            b"",
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::SignatureRequired);
    }

    #[tokio::test]
    async fn lenient_mode_with_no_declared_peer_and_no_signature_is_rejected() {
        let discovery = test_discovery();
        let err = verify(
            &discovery,
            InboundSignatureMode::Lenient,
            OnDiscoveryError::Reject,
            false,
            "",
            None,
            None,
            None,
            &empty_parts(),
            b"",
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::SignatureRequired);
    }

    #[tokio::test]
    async fn lenient_mode_discovery_error_with_allow_fallback_accepts_unsigned() {
        let discovery = test_discovery();
        let ctx = verify(
            &discovery,
            InboundSignatureMode::Lenient,
            OnDiscoveryError::Allow,
            false,
            "unreachable.invalid",
            None,
            None,
            None,
            &empty_parts(),
            b"",
        )
        .await
        .unwrap();
        assert_eq!(ctx.host, "unreachable.invalid");
        assert!(!ctx.authenticated);
    }

    #[tokio::test]
    async fn lenient_mode_discovery_error_with_reject_fallback_rejects() {
        let discovery = test_discovery();
        let err = verify(
            &discovery,
            InboundSignatureMode::Lenient,
            OnDiscoveryError::Reject,
            false,
            "unreachable.invalid",
            None,
            None,
            None,
            &empty_parts(),
            b"",
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::UpstreamUnreachable);
    }

    #[test]
    fn shares_resolver_prefers_sender_then_owner() {
        let body = br#"{"sender":"bob@sender.example","owner":"carol@other.example"}"#;
        assert_eq!(shares_resolver(body), "sender.example");
    }

    #[test]
    fn shares_resolver_returns_empty_on_unparsable_body() {
        assert_eq!(shares_resolver(b"not json"), "");
    }

    #[test]
    fn invite_accepted_resolver_reads_recipient_provider() {
        let body = br#"{"recipientProvider":"receiver.example"}"#;
        assert_eq!(invite_accepted_resolver(body), "receiver.example");
    }

    #[test]
    fn no_declared_peer_resolver_always_empty() {
        assert_eq!(no_declared_peer_resolver(br#"{"anything":"here"}"#), "");
    }
}
