//! C10 — Invite codec, accepted handshake, and OAuth-flavored token exchange.
//!
//! Storage follows the same `Mutex<Connection>` shape as [`crate::shares::ShareStore`];
//! the exchange step is orchestrated through [`crate::peers::execute`] so a peer's
//! `send_token_in_body` quirk gets exactly one retry.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64URL;
use parking_lot::Mutex;
use rand::RngCore;
use reqwest::Method;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use rusqlite::{Connection, OptionalExtension, params};

use crate::http_client::{HttpClientError, OutboundRequest, SafeHttpClient};
use crate::peers::{AttemptResult, ClassifiedError, PeerProfile, ReasonCode};

#[derive(Debug, thiserror::Error)]
pub enum InviteError {
    #[error("database error: {0}")]
    Database(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("malformed invite token")]
    MalformedToken,
    #[error("invite not found")]
    NotFound,
    #[error("invite already consumed")]
    AlreadyConsumed,
    #[error("token exchange failed: {0}")]
    ExchangeFailed(String),
}

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

fn time_ordered_id(prefix: &str) -> String {
    let mut rand_bytes = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut rand_bytes);
    format!("{prefix}-{:016x}-{}", now_unix(), hex::encode(rand_bytes))
}

fn random_secret() -> String {
    let mut bytes = [0u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    B64URL.encode(bytes)
}

/// Opaque invite token: `base64("<token>@<fqdn>")` — the whole concatenated string is
/// the base64 payload, not just the token half. Parsing decodes first, then splits
/// the plaintext on the *last* `@` so a raw token that itself contains `@` never
/// breaks the split (spec.md §4.10).
pub fn encode_invite_token(raw_token: &str, originating_fqdn: &str) -> String {
    B64URL.encode(format!("{raw_token}@{originating_fqdn}"))
}

pub struct ParsedInviteToken {
    pub raw_token: String,
    pub originating_fqdn: String,
}

pub fn parse_invite_token(token: &str) -> Result<ParsedInviteToken, InviteError> {
    let decoded = B64URL.decode(token).map_err(|_| InviteError::MalformedToken)?;
    let decoded = String::from_utf8(decoded).map_err(|_| InviteError::MalformedToken)?;
    let idx = decoded.rfind('@').ok_or(InviteError::MalformedToken)?;
    let (raw_token, fqdn) = (&decoded[..idx], &decoded[idx + 1..]);
    if raw_token.is_empty() || fqdn.is_empty() || fqdn.contains("://") {
        return Err(InviteError::MalformedToken);
    }
    Ok(ParsedInviteToken { raw_token: raw_token.to_string(), originating_fqdn: fqdn.to_string() })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteStatus {
    Pending,
    Accepted,
    Expired,
}

impl InviteStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Expired => "expired",
        }
    }
    fn parse(s: &str) -> Self {
        match s {
            "accepted" => Self::Accepted,
            "expired" => Self::Expired,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutgoingInvite {
    pub invite_id: String,
    pub raw_token: String,
    pub description: Option<String>,
    pub recipient_provider: Option<String>,
    pub status: InviteStatus,
    pub created_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone)]
pub struct AcceptedInvite {
    pub invite_id: String,
    pub user_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub recipient_provider: String,
    pub accepted_at: i64,
}

pub struct InviteStore {
    db: Mutex<Connection>,
}

impl InviteStore {
    pub fn open(path: &str) -> Result<Self, InviteError> {
        let conn = Connection::open(path).map_err(|e| InviteError::Database(e.to_string()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").map_err(|e| InviteError::Database(e.to_string()))?;
        let store = Self { db: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, InviteError> {
        let conn = Connection::open_in_memory().map_err(|e| InviteError::Database(e.to_string()))?;
        let store = Self { db: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), InviteError> {
        let db = self.db.lock();
        db.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS outgoing_invites (
                invite_id TEXT PRIMARY KEY,
                raw_token TEXT NOT NULL UNIQUE,
                description TEXT,
                recipient_provider TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS accepted_invites (
                invite_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                email TEXT,
                name TEXT,
                recipient_provider TEXT NOT NULL,
                accepted_at INTEGER NOT NULL
            );
            ",
        )
        .map_err(|e| InviteError::Database(e.to_string()))?;
        Ok(())
    }

    /// Creates a pending invite, default TTL one hour per spec.md §4.10.
    pub fn create_invite(&self, description: Option<String>, ttl_secs: i64) -> Result<OutgoingInvite, InviteError> {
        let invite = OutgoingInvite {
            invite_id: time_ordered_id("invite"),
            raw_token: random_secret(),
            description,
            recipient_provider: None,
            status: InviteStatus::Pending,
            created_at: now_unix(),
            expires_at: now_unix() + ttl_secs,
        };
        let db = self.db.lock();
        db.execute(
            "INSERT INTO outgoing_invites (invite_id, raw_token, description, recipient_provider, status, created_at, expires_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                invite.invite_id,
                invite.raw_token,
                invite.description,
                invite.recipient_provider,
                invite.status.as_str(),
                invite.created_at,
                invite.expires_at,
            ],
        )
        .map_err(|e| InviteError::Database(e.to_string()))?;
        Ok(invite)
    }

    fn row_to_invite(row: &rusqlite::Row) -> rusqlite::Result<OutgoingInvite> {
        let status: String = row.get("status")?;
        Ok(OutgoingInvite {
            invite_id: row.get("invite_id")?,
            raw_token: row.get("raw_token")?,
            description: row.get("description")?,
            recipient_provider: row.get("recipient_provider")?,
            status: InviteStatus::parse(&status),
            created_at: row.get("created_at")?,
            expires_at: row.get("expires_at")?,
        })
    }

    pub fn find_by_raw_token(&self, raw_token: &str) -> Result<Option<OutgoingInvite>, InviteError> {
        let db = self.db.lock();
        db.query_row("SELECT * FROM outgoing_invites WHERE raw_token = ?1", params![raw_token], Self::row_to_invite)
            .optional()
            .map_err(|e| InviteError::Database(e.to_string()))
    }

    /// Marks an invite accepted by a specific recipient provider. Rejects a
    /// re-accept against a *different* provider as [`InviteError::AlreadyConsumed`];
    /// re-accepting the same provider is treated as a harmless retry.
    pub fn mark_accepted(&self, invite_id: &str, recipient_provider: &str) -> Result<(), InviteError> {
        let db = self.db.lock();
        let existing: Option<(String, String)> = db
            .query_row(
                "SELECT status, COALESCE(recipient_provider, '') FROM outgoing_invites WHERE invite_id = ?1",
                params![invite_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(|e| InviteError::Database(e.to_string()))?;
        let Some((status, prior_provider)) = existing else { return Err(InviteError::NotFound) };
        if status == "accepted" && prior_provider != recipient_provider {
            return Err(InviteError::AlreadyConsumed);
        }
        db.execute(
            "UPDATE outgoing_invites SET status = 'accepted', recipient_provider = ?1 WHERE invite_id = ?2",
            params![recipient_provider, invite_id],
        )
        .map_err(|e| InviteError::Database(e.to_string()))?;
        Ok(())
    }

    pub fn record_accepted_invite(&self, accepted: &AcceptedInvite) -> Result<(), InviteError> {
        let db = self.db.lock();
        db.execute(
            "INSERT OR REPLACE INTO accepted_invites (invite_id, user_id, email, name, recipient_provider, accepted_at)
             VALUES (?1,?2,?3,?4,?5,?6)",
            params![
                accepted.invite_id,
                accepted.user_id,
                accepted.email,
                accepted.name,
                accepted.recipient_provider,
                accepted.accepted_at,
            ],
        )
        .map_err(|e| InviteError::Database(e.to_string()))?;
        Ok(())
    }

    pub fn purge_expired(&self) -> Result<usize, InviteError> {
        let db = self.db.lock();
        let n = db
            .execute(
                "UPDATE outgoing_invites SET status = 'expired' WHERE status = 'pending' AND expires_at <= ?1",
                params![now_unix()],
            )
            .map_err(|e| InviteError::Database(e.to_string()))?;
        Ok(n)
    }
}

/// Token-exchange request fields sent to the invite-accepted peer's token endpoint.
pub struct TokenExchangeRequest<'a> {
    pub token_endpoint: &'a str,
    pub invite_token: &'a str,
    pub client_id: &'a str,
    pub client_name: &'a str,
}

#[derive(Debug, Clone)]
pub struct TokenExchangeResponse {
    pub access_token: String,
}

fn classify_http_err(err: HttpClientError) -> ClassifiedError {
    let reason = match &err {
        HttpClientError::SsrfBlocked(_) => ReasonCode::SsrfBlocked,
        HttpClientError::HostUnresolvable(_) => ReasonCode::NetworkError,
        HttpClientError::TooManyRedirects => ReasonCode::NetworkError,
        HttpClientError::ResponseTooLarge => ReasonCode::NetworkError,
        HttpClientError::SignedNoRedirect
        | HttpClientError::RedirectNotSameHost
        | HttpClientError::RedirectDowngrade
        | HttpClientError::RedirectBlocked(_) => ReasonCode::ProtocolMismatch,
        HttpClientError::NetworkError(_) => ReasonCode::NetworkError,
    };
    ClassifiedError::new(reason, err.to_string())
}

/// Performs the `grant_type=ocm_share` form-urlencoded exchange (spec.md §4.10).
/// `quirk` of `send_token_in_body` is handled by the caller choosing a different
/// body shape before calling this a second time; this function only knows how to
/// build one request shape at a time.
async fn do_exchange(
    http: &SafeHttpClient,
    req: &TokenExchangeRequest<'_>,
    token_in_body_only: bool,
) -> Result<TokenExchangeResponse, ClassifiedError> {
    let mut form = vec![
        ("grant_type".to_string(), "ocm_share".to_string()),
        ("client_id".to_string(), req.client_id.to_string()),
        ("name".to_string(), req.client_name.to_string()),
    ];
    form.push(("code".to_string(), req.invite_token.to_string()));
    if token_in_body_only {
        // some peers reject the standard `code` field name; fall back to `token`
        form.retain(|(k, _)| k != "code");
        form.push(("token".to_string(), req.invite_token.to_string()));
    }
    let body = urlencoding_form(&form);

    let url = req
        .token_endpoint
        .parse()
        .map_err(|_| ClassifiedError::new(ReasonCode::ProtocolMismatch, "invalid token endpoint URL".to_string()))?;
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/x-www-form-urlencoded"));
    let outbound = OutboundRequest { method: Method::POST, url, headers, body: Some(body.into_bytes()), signed: true };
    let response = http.execute(outbound).await.map_err(classify_http_err)?;
    if !response.status.is_success() {
        return Err(ClassifiedError::new(
            ReasonCode::TokenExchangeFailed,
            format!("token endpoint returned {}", response.status),
        ));
    }
    let parsed: serde_json::Value =
        serde_json::from_slice(&response.body).map_err(|e| ClassifiedError::new(ReasonCode::TokenExchangeFailed, e.to_string()))?;
    let access_token = parsed
        .get("access_token")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ClassifiedError::new(ReasonCode::TokenExchangeFailed, "missing access_token".to_string()))?
        .to_string();
    Ok(TokenExchangeResponse { access_token })
}

fn urlencoding_form(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Runs the exchange through the strict-first/single-quirk orchestrator: the
/// retry uses `send_token_in_body`'s alternate field name exactly once.
pub async fn exchange_token(
    http: &SafeHttpClient,
    profile: &PeerProfile,
    req: TokenExchangeRequest<'_>,
) -> AttemptResult<TokenExchangeResponse> {
    crate::peers::execute(
        profile,
        || do_exchange(http, &req, false),
        |quirk| async move {
            if quirk == "send_token_in_body" {
                do_exchange(http, &req, true).await
            } else {
                Err(ClassifiedError::new(ReasonCode::TokenExchangeFailed, format!("unsupported quirk {quirk}")))
            }
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invite_token_round_trips() {
        let token = encode_invite_token("secret-raw-value", "cloud.example.com");
        let parsed = parse_invite_token(&token).unwrap();
        assert_eq!(parsed.raw_token, "secret-raw-value");
        assert_eq!(parsed.originating_fqdn, "cloud.example.com");
    }

    #[test]
    fn invite_token_splits_on_last_at_of_decoded_payload() {
        // a raw token that itself contains '@' must not confuse the split direction.
        let token = encode_invite_token("user@home-provider", "host.a.example.com");
        let parsed = parse_invite_token(&token).unwrap();
        assert_eq!(parsed.raw_token, "user@home-provider");
        assert_eq!(parsed.originating_fqdn, "host.a.example.com");
    }

    #[test]
    fn malformed_token_bad_base64_is_rejected() {
        assert!(matches!(parse_invite_token("not valid base64 at all!!"), Err(InviteError::MalformedToken)));
    }

    #[test]
    fn fqdn_with_embedded_scheme_is_rejected() {
        let token = B64URL.encode("secret@https://evil.example.com");
        assert!(matches!(parse_invite_token(&token), Err(InviteError::MalformedToken)));
    }

    #[test]
    fn create_then_find_round_trips() {
        let store = InviteStore::open_in_memory().unwrap();
        let invite = store.create_invite(Some("for alice".into()), 3600).unwrap();
        let found = store.find_by_raw_token(&invite.raw_token).unwrap().unwrap();
        assert_eq!(found.invite_id, invite.invite_id);
        assert_eq!(found.status, InviteStatus::Pending);
    }

    #[test]
    fn accept_then_reaccept_same_provider_is_ok() {
        let store = InviteStore::open_in_memory().unwrap();
        let invite = store.create_invite(None, 3600).unwrap();
        store.mark_accepted(&invite.invite_id, "receiver.example").unwrap();
        store.mark_accepted(&invite.invite_id, "receiver.example").unwrap();
    }

    #[test]
    fn accept_then_reaccept_different_provider_is_rejected() {
        let store = InviteStore::open_in_memory().unwrap();
        let invite = store.create_invite(None, 3600).unwrap();
        store.mark_accepted(&invite.invite_id, "receiver.example").unwrap();
        let err = store.mark_accepted(&invite.invite_id, "other.example").unwrap_err();
        assert!(matches!(err, InviteError::AlreadyConsumed));
    }

    #[test]
    fn purge_expired_marks_stale_pending_invites() {
        let store = InviteStore::open_in_memory().unwrap();
        store.create_invite(None, 0).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        let n = store.purge_expired().unwrap();
        assert_eq!(n, 1);
    }
}
