//! C11 — WebDAV credential validator.
//!
//! Read-only resource access gate: path/UUID parsing, write-method rejection, and
//! the credential-acceptance matrix combining a share's `must_exchange_token` flag,
//! operating mode, and peer profile relaxation (spec.md §4.11). Grounded on
//! `examples/wrenger-dav-server-rs` for the read/write method split; the acceptance
//! matrix itself has no teacher analog and is built directly from spec.md's table.

use crate::peers::PeerProfile;
use crate::shares::{IncomingShare, ShareStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebdavMethod {
    Get,
    Head,
    Propfind,
    Options,
    Write,
}

impl WebdavMethod {
    pub fn parse(method: &str) -> Self {
        match method.to_ascii_uppercase().as_str() {
            "GET" => Self::Get,
            "HEAD" => Self::Head,
            "PROPFIND" => Self::Propfind,
            "OPTIONS" => Self::Options,
            _ => Self::Write,
        }
    }

    pub fn is_write(self) -> bool {
        matches!(self, Self::Write)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WebdavError {
    #[error("malformed webdav id")]
    MalformedId,
    #[error("write-side WebDAV is not implemented")]
    NotImplemented,
    #[error("share not found")]
    NotFound,
    #[error("missing or non-bearer Authorization header")]
    Unauthorized,
    #[error("credential rejected")]
    CredentialRejected,
}

/// `webdav_id` must be a 36-character UUID of the form 8-4-4-4-12 hex (spec §4.11).
pub fn validate_webdav_id(id: &str) -> Result<(), WebdavError> {
    let bytes = id.as_bytes();
    if bytes.len() != 36 {
        return Err(WebdavError::MalformedId);
    }
    for (i, b) in bytes.iter().enumerate() {
        let is_dash = matches!(i, 8 | 13 | 18 | 23);
        if is_dash {
            if *b != b'-' {
                return Err(WebdavError::MalformedId);
            }
        } else if !b.is_ascii_hexdigit() {
            return Err(WebdavError::MalformedId);
        }
    }
    Ok(())
}

/// The credential a caller presented, parsed from `Authorization` (or absent).
#[derive(Debug, Clone)]
pub enum Credential<'a> {
    Bearer(&'a str),
    Basic { id: &'a str, token: &'a str },
}

/// Parses an `Authorization` header value. `None` means missing or an unsupported
/// scheme, which the caller turns into a 401 with `WWW-Authenticate: Bearer`.
pub fn parse_authorization(header: &str) -> Option<Credential<'_>> {
    if let Some(rest) = header.strip_prefix("Bearer ") {
        return Some(Credential::Bearer(rest.trim()));
    }
    if let Some(rest) = header.strip_prefix("Basic ") {
        use base64::Engine;
        let decoded = base64::engine::general_purpose::STANDARD.decode(rest.trim()).ok()?;
        let text = String::from_utf8(decoded).ok()?;
        return match text.split_once(':') {
            Some((id, token)) => Some(Credential::Basic { id, token }),
            None => None,
        };
    }
    None
}

/// Classifies a Basic credential against the profile's allowed patterns (spec §4.11):
/// `token:`, `token:token`, `:token`, `id:token`. An empty pattern list allows all.
fn basic_pattern_matches(id: &str, token: &str, pattern: &str) -> bool {
    match pattern {
        "token:" => !id.is_empty() && token.is_empty(),
        "token:token" => !id.is_empty() && !token.is_empty() && id == token,
        ":token" => id.is_empty() && !token.is_empty(),
        "id:token" => !id.is_empty() && !token.is_empty(),
        _ => false,
    }
}

fn basic_allowed(id: &str, token: &str, profile: &PeerProfile) -> bool {
    if profile.allowed_basic_auth_patterns.is_empty() {
        return true;
    }
    profile.allowed_basic_auth_patterns.iter().any(|p| basic_pattern_matches(id, token, p))
}

/// Evaluates the credential-acceptance matrix of spec §4.11's table for one share.
/// `exchanged_token_lookup` resolves a presented Bearer token to the `share_id` it
/// was issued for, honoring token expiry (spec §3's "expired tokens are invisible").
pub fn accept_credential(
    share: &IncomingShare,
    credential: &Credential<'_>,
    mode_strict: bool,
    profile: &PeerProfile,
    exchanged_token_lookup: impl FnOnce(&str) -> Option<String>,
) -> Result<(), WebdavError> {
    if let Credential::Bearer(token) = credential {
        if let Some(token_share_id) = exchanged_token_lookup(token) {
            if token_share_id == share.share_id {
                return Ok(());
            }
        }
    }

    if !share.must_exchange_token {
        return match credential {
            Credential::Bearer(token) if *token == share.shared_secret => Ok(()),
            Credential::Basic { id, token }
                if basic_allowed(id, token, profile) && (*id == share.shared_secret || *token == share.shared_secret) =>
            {
                Ok(())
            }
            _ => Err(WebdavError::CredentialRejected),
        };
    }

    if mode_strict {
        return Err(WebdavError::CredentialRejected);
    }

    if !profile.relax_must_exchange_token {
        return Err(WebdavError::CredentialRejected);
    }
    match credential {
        Credential::Bearer(token) if *token == share.shared_secret => Ok(()),
        Credential::Basic { id, token }
            if basic_allowed(id, token, profile) && (*id == share.shared_secret || *token == share.shared_secret) =>
        {
            Ok(())
        }
        _ => Err(WebdavError::CredentialRejected),
    }
}

/// Resolves `webdav_id` to its incoming share, rejecting malformed ids before ever
/// touching storage.
pub fn resolve_share(store: &ShareStore, webdav_id: &str) -> Result<IncomingShare, WebdavError> {
    validate_webdav_id(webdav_id)?;
    store
        .get_incoming_by_webdav_id(webdav_id)
        .ok()
        .flatten()
        .ok_or(WebdavError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shares::{IncomingStatus, ShareType};

    fn sample_share(must_exchange_token: bool) -> IncomingShare {
        IncomingShare {
            share_id: "ishare-1".into(),
            provider_id: "p-001".into(),
            sender_host: "sender.example".into(),
            owner: "bob@sender.example".into(),
            sender: "bob@sender.example".into(),
            share_with: "alice@receiver.example".into(),
            name: "doc.txt".into(),
            description: None,
            resource_type: "file".into(),
            share_type: ShareType::User,
            webdav_id: Some("123e4567-e89b-12d3-a456-426614174000".into()),
            webdav_uri_absolute: None,
            shared_secret: "s3cr3t".into(),
            permissions: vec!["read".into()],
            must_exchange_token,
            status: IncomingStatus::Accepted,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn valid_uuid_shape_is_accepted() {
        assert!(validate_webdav_id("123e4567-e89b-12d3-a456-426614174000").is_ok());
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert!(matches!(validate_webdav_id("not-a-uuid"), Err(WebdavError::MalformedId)));
    }

    #[test]
    fn non_hex_character_is_rejected() {
        assert!(matches!(
            validate_webdav_id("zzze4567-e89b-12d3-a456-426614174000"),
            Err(WebdavError::MalformedId)
        ));
    }

    #[test]
    fn write_methods_are_distinguished_from_read_methods() {
        assert!(WebdavMethod::parse("PUT").is_write());
        assert!(WebdavMethod::parse("DELETE").is_write());
        assert!(WebdavMethod::parse("MKCOL").is_write());
        assert!(!WebdavMethod::parse("GET").is_write());
        assert!(!WebdavMethod::parse("PROPFIND").is_write());
        assert!(!WebdavMethod::parse("OPTIONS").is_write());
    }

    #[test]
    fn bearer_header_parses() {
        assert!(matches!(parse_authorization("Bearer abc123"), Some(Credential::Bearer("abc123"))));
    }

    #[test]
    fn basic_header_parses_id_and_token() {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode("myid:mytoken");
        let header = format!("Basic {encoded}");
        assert!(matches!(parse_authorization(&header), Some(Credential::Basic { id: "myid", token: "mytoken" })));
    }

    #[test]
    fn unsupported_scheme_is_none() {
        assert!(parse_authorization("Digest abc").is_none());
    }

    #[test]
    fn exchanged_token_always_accepted_regardless_of_must_exchange_token() {
        let share = sample_share(true);
        let cred = Credential::Bearer("exchanged-tok");
        let result = accept_credential(&share, &cred, true, &PeerProfile::strict(), |tok| {
            (tok == "exchanged-tok").then(|| "ishare-1".to_string())
        });
        assert!(result.is_ok());
    }

    #[test]
    fn no_must_exchange_token_accepts_shared_secret_bearer() {
        let share = sample_share(false);
        let cred = Credential::Bearer("s3cr3t");
        let result = accept_credential(&share, &cred, true, &PeerProfile::strict(), |_| None);
        assert!(result.is_ok());
    }

    #[test]
    fn must_exchange_token_strict_mode_rejects_shared_secret() {
        let share = sample_share(true);
        let cred = Credential::Bearer("s3cr3t");
        let result = accept_credential(&share, &cred, true, &PeerProfile::strict(), |_| None);
        assert!(matches!(result, Err(WebdavError::CredentialRejected)));
    }

    #[test]
    fn must_exchange_token_lenient_mode_with_relaxing_profile_accepts_shared_secret() {
        let share = sample_share(true);
        let cred = Credential::Bearer("s3cr3t");
        let result = accept_credential(&share, &cred, false, &PeerProfile::nextcloud(), |_| None);
        assert!(result.is_ok());
    }

    #[test]
    fn must_exchange_token_lenient_mode_without_relaxing_profile_rejects_shared_secret() {
        let share = sample_share(true);
        let cred = Credential::Bearer("s3cr3t");
        let result = accept_credential(&share, &cred, false, &PeerProfile::strict(), |_| None);
        assert!(matches!(result, Err(WebdavError::CredentialRejected)));
    }

    #[test]
    fn basic_auth_pattern_allowlist_is_enforced() {
        let share = sample_share(false);
        let mut profile = PeerProfile::strict();
        profile.allowed_basic_auth_patterns = vec!["token:".into()];
        let accepted = accept_credential(
            &share,
            &Credential::Basic { id: "s3cr3t", token: "" },
            true,
            &profile,
            |_| None,
        );
        assert!(accepted.is_ok());
        let rejected = accept_credential(
            &share,
            &Credential::Basic { id: "someid", token: "s3cr3t" },
            true,
            &profile,
            |_| None,
        );
        assert!(matches!(rejected, Err(WebdavError::CredentialRejected)));
    }
}
