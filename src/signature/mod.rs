//! C3 — Signature engine.
//!
//! Signs and verifies HTTP messages over an RFC 9421-flavored canonical signature
//! base: selected derived components (`@method`, `@target-uri`, `@authority`,
//! optionally `@path`, `@query`) plus selected header components (`content-type`,
//! `content-digest`, `content-length`), Ed25519-signed under the `sig1` label.
//! Verification sequencing and the clock/time-window idea are grounded on
//! `signed_http-v1-wire.rs`'s `verify_invoke_request_v1`; key persistence is
//! grounded on the teacher's `load_msg_signing_key` (load-or-generate-and-persist).

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

pub const SIGNATURE_INPUT_HEADER: &str = "signature-input";
pub const SIGNATURE_HEADER: &str = "signature";
pub const CONTENT_DIGEST_HEADER: &str = "content-digest";
pub const SIG_LABEL: &str = "sig1";

#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum SignatureError {
    #[error("missing Signature-Input/Signature headers")]
    MissingHeaders,
    #[error("malformed Signature-Input header")]
    MalformedSignatureInput,
    #[error("malformed Signature header")]
    MalformedSignature,
    #[error("signature verification failed")]
    Invalid,
    #[error("content-digest mismatch")]
    DigestMismatch,
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("key not found for keyid {0}")]
    KeyNotFound(String),
    #[error("key load/generate error: {0}")]
    KeyIo(String),
}

/// The parts of an HTTP message relevant to signature-base construction.
#[derive(Debug, Clone)]
pub struct MessageParts {
    pub method: String,
    pub target_uri: String,
    pub authority: String,
    pub path: String,
    pub query: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<String>,
    pub content_digest: Option<String>,
}

fn component_value<'a>(name: &str, parts: &'a MessageParts) -> Option<String> {
    match name {
        "@method" => Some(parts.method.to_uppercase()),
        "@target-uri" => Some(parts.target_uri.clone()),
        "@authority" => Some(parts.authority.to_lowercase()),
        "@path" => Some(parts.path.clone()),
        "@query" => parts.query.clone(),
        "content-type" => parts.content_type.clone(),
        "content-digest" => parts.content_digest.clone(),
        "content-length" => parts.content_length.clone(),
        _ => None,
    }
}

/// `sha-256=:<base64>:` over `body`.
pub fn content_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("sha-256=:{}:", B64.encode(hasher.finalize()))
}

/// Validates a `Content-Digest` header value against `body`. Only the `sha-256` form
/// is checked; unrecognized digest algorithms are treated as a mismatch.
pub fn verify_content_digest(header_value: &str, body: &[u8]) -> bool {
    content_digest(body) == header_value
}

fn signature_params(components: &[String], created: u64, keyid: &str, alg: &str) -> String {
    let list = components.iter().map(|c| format!("\"{c}\"")).collect::<Vec<_>>().join(" ");
    format!("({list});created={created};keyid=\"{keyid}\";alg=\"{alg}\"")
}

fn build_base(components: &[String], params: &str, parts: &MessageParts) -> Result<String, SignatureError> {
    let mut lines = Vec::new();
    for name in components {
        let value = component_value(name, parts).ok_or(SignatureError::MalformedSignatureInput)?;
        lines.push(format!("\"{name}\": {value}"));
    }
    lines.push(format!("\"@signature-params\": {params}"));
    Ok(lines.join("\n"))
}

/// Request-side signing input.
pub struct SignRequest<'a> {
    pub parts: MessageParts,
    pub body: Option<&'a [u8]>,
    pub keyid: String,
    pub created: u64,
    /// Header components the caller wants covered, if present on the message.
    pub header_components: &'a [&'a str],
}

pub struct SignedHeaders {
    pub signature_input: String,
    pub signature: String,
    pub content_digest: Option<String>,
    pub content_length: Option<String>,
}

/// Signs a message, returning the headers to attach. Mutates nothing — the caller
/// attaches `content_digest`/`content_length` to the outgoing request themselves.
pub fn sign(signing_key: &SigningKey, req: SignRequest) -> SignedHeaders {
    let mut parts = req.parts;
    let mut content_digest_header = None;
    let mut content_length_header = None;
    if let Some(body) = req.body {
        let digest = content_digest(body);
        parts.content_digest = Some(digest.clone());
        parts.content_length = Some(body.len().to_string());
        content_digest_header = Some(digest);
        content_length_header = Some(body.len().to_string());
    }

    let mut components: Vec<String> = vec!["@method".into(), "@target-uri".into(), "@authority".into()];
    if !parts.path.is_empty() {
        components.push("@path".into());
    }
    if parts.query.is_some() {
        components.push("@query".into());
    }
    for h in req.header_components {
        if component_value(h, &parts).is_some() {
            components.push(h.to_string());
        }
    }

    let params = signature_params(&components, req.created, &req.keyid, "ed25519");
    let base = build_base(&components, &params, &parts).expect("components chosen to be present");
    let signature: Signature = signing_key.sign(base.as_bytes());

    SignedHeaders {
        signature_input: format!("{SIG_LABEL}={params}"),
        signature: format!("{SIG_LABEL}=:{}:", B64.encode(signature.to_bytes())),
        content_digest: content_digest_header,
        content_length: content_length_header,
    }
}

/// What was recovered from `Signature-Input` before key resolution.
#[derive(Debug, Clone)]
pub struct ParsedSignatureInput {
    pub components: Vec<String>,
    pub created: u64,
    pub keyid: String,
    pub alg: String,
    raw_params: String,
}

/// Parses the `sig1=(...)` value of a `Signature-Input` header.
pub fn parse_signature_input(header_value: &str) -> Result<ParsedSignatureInput, SignatureError> {
    let value = header_value.trim();
    let rest = value
        .strip_prefix(&format!("{SIG_LABEL}="))
        .ok_or(SignatureError::MalformedSignatureInput)?;
    let close = rest.find(')').ok_or(SignatureError::MalformedSignatureInput)?;
    if !rest.starts_with('(') {
        return Err(SignatureError::MalformedSignatureInput);
    }
    let list_inner = &rest[1..close];
    let components: Vec<String> = list_inner
        .split_whitespace()
        .map(|c| c.trim_matches('"').to_string())
        .filter(|c| !c.is_empty())
        .collect();
    let params_str = &rest[close + 1..];
    let params_str = params_str.strip_prefix(';').unwrap_or(params_str);

    let mut created = None;
    let mut keyid = None;
    let mut alg = None;
    for field in params_str.split(';') {
        let field = field.trim();
        if field.is_empty() {
            continue;
        }
        let (k, v) = field.split_once('=').ok_or(SignatureError::MalformedSignatureInput)?;
        let v = v.trim_matches('"');
        match k {
            "created" => created = v.parse::<u64>().ok(),
            "keyid" => keyid = Some(v.to_string()),
            "alg" => alg = Some(v.to_string()),
            _ => {}
        }
    }

    Ok(ParsedSignatureInput {
        components,
        created: created.ok_or(SignatureError::MalformedSignatureInput)?,
        keyid: keyid.ok_or(SignatureError::MalformedSignatureInput)?,
        alg: alg.ok_or(SignatureError::MalformedSignatureInput)?,
        raw_params: rest.to_string(),
    })
}

fn parse_signature_header(header_value: &str) -> Result<Vec<u8>, SignatureError> {
    let rest = header_value
        .trim()
        .strip_prefix(&format!("{SIG_LABEL}=:"))
        .ok_or(SignatureError::MalformedSignature)?;
    let rest = rest.strip_suffix(':').ok_or(SignatureError::MalformedSignature)?;
    B64.decode(rest).map_err(|_| SignatureError::MalformedSignature)
}

pub struct VerifiedSignature {
    pub keyid: String,
}

/// Verifies a message against a caller-resolved public key for `parsed.keyid`.
/// Content-Digest (if present on the message) must already have been checked by the
/// caller via [`verify_content_digest`] — a digest mismatch is a distinct error from
/// signature invalidity per spec §4.3.
pub fn verify_with_key(
    signature_input: &str,
    signature_header: &str,
    parts: &MessageParts,
    verifying_key: &VerifyingKey,
) -> Result<VerifiedSignature, SignatureError> {
    let parsed = parse_signature_input(signature_input)?;
    if parsed.alg != "ed25519" {
        return Err(SignatureError::UnsupportedAlgorithm(parsed.alg));
    }
    let sig_bytes = parse_signature_header(signature_header)?;
    let sig_array: [u8; 64] = sig_bytes.as_slice().try_into().map_err(|_| SignatureError::MalformedSignature)?;
    let signature = Signature::from_bytes(&sig_array);

    let base = build_base(&parsed.components, &parsed.raw_params, parts)?;
    verifying_key
        .verify(base.as_bytes(), &signature)
        .map_err(|_| SignatureError::Invalid)?;

    Ok(VerifiedSignature { keyid: parsed.keyid })
}

/// True iff both `Signature-Input` and `Signature` are present.
pub fn has_signature_headers(signature_input: Option<&str>, signature: Option<&str>) -> bool {
    signature_input.is_some() && signature.is_some()
}

pub fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Extracts `host[:port]` from a keyId of the shape `https://host[:port]/path#name`.
pub fn keyid_to_host(keyid: &str) -> Option<String> {
    let without_scheme = keyid.split_once("://").map(|(_, rest)| rest).unwrap_or(keyid);
    let end = without_scheme
        .find(['/', '#'])
        .unwrap_or(without_scheme.len());
    let host = &without_scheme[..end];
    if host.is_empty() { None } else { Some(host.to_lowercase()) }
}

/// Loads an Ed25519 keypair from `path`, generating and persisting one if absent.
pub struct KeyManager {
    signing_key: SigningKey,
    key_id: String,
}

impl KeyManager {
    pub fn load_or_generate(path: &Path, external_origin: &str, name: &str) -> Result<Self, SignatureError> {
        let signing_key = if path.exists() {
            let data = std::fs::read(path).map_err(|e| SignatureError::KeyIo(e.to_string()))?;
            let bytes: [u8; 32] = data.as_slice().try_into().map_err(|_| SignatureError::KeyIo("corrupt key file".into()))?;
            SigningKey::from_bytes(&bytes)
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| SignatureError::KeyIo(e.to_string()))?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700));
                }
            }
            let key = SigningKey::generate(&mut rand::rngs::OsRng);
            std::fs::write(path, key.to_bytes()).map_err(|e| SignatureError::KeyIo(e.to_string()))?;
            key
        };
        let key_id = format!("{external_origin}#{name}");
        Ok(Self { signing_key, key_id })
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// PEM-encoded SPKI public half, advertised via discovery.
    pub fn public_key_pem(&self) -> String {
        // Ed25519 SPKI prefix for raw 32-byte public keys.
        const SPKI_PREFIX: [u8; 12] = [
            0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
        ];
        let mut der = Vec::with_capacity(SPKI_PREFIX.len() + 32);
        der.extend_from_slice(&SPKI_PREFIX);
        der.extend_from_slice(self.verifying_key().as_bytes());
        let b64 = B64.encode(&der);
        let mut pem = String::from("-----BEGIN PUBLIC KEY-----\n");
        for chunk in b64.as_bytes().chunks(64) {
            pem.push_str(std::str::from_utf8(chunk).unwrap());
            pem.push('\n');
        }
        pem.push_str("-----END PUBLIC KEY-----\n");
        pem
    }
}

/// Inverse of [`KeyManager::public_key_pem`]: recovers a raw Ed25519 public key from
/// the SPKI PEM a peer advertises via discovery's `publicKeys` map.
pub fn parse_ed25519_public_key_pem(pem: &str) -> Result<VerifyingKey, SignatureError> {
    const SPKI_PREFIX: [u8; 12] = [0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00];
    let body: String = pem
        .lines()
        .filter(|l| !l.starts_with("-----"))
        .collect::<Vec<_>>()
        .join("");
    let der = B64.decode(body.trim()).map_err(|_| SignatureError::KeyIo("malformed public key PEM".into()))?;
    let raw = der.strip_prefix(&SPKI_PREFIX).ok_or_else(|| SignatureError::KeyIo("unsupported public key encoding".into()))?;
    let bytes: [u8; 32] = raw.try_into().map_err(|_| SignatureError::KeyIo("corrupt public key".into()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| SignatureError::KeyIo("invalid Ed25519 public key".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_parts(with_body: bool) -> MessageParts {
        MessageParts {
            method: "POST".into(),
            target_uri: "https://receiver.example/ocm/shares".into(),
            authority: "receiver.example".into(),
            path: "/ocm/shares".into(),
            query: None,
            content_type: if with_body { Some("application/json".into()) } else { None },
            content_length: None,
            content_digest: None,
        }
    }

    #[test]
    fn sign_then_verify_round_trips_with_matching_keyid() {
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        let body = br#"{"hello":"world"}"#;
        let req = SignRequest {
            parts: sample_parts(true),
            body: Some(body),
            keyid: "https://sender.example/ocm#k1".into(),
            created: now_unix(),
            header_components: &["content-type", "content-digest", "content-length"],
        };
        let signed = sign(&key, req);

        let mut parts = sample_parts(true);
        parts.content_digest = signed.content_digest.clone();
        parts.content_length = signed.content_length.clone();

        let verified =
            verify_with_key(&signed.signature_input, &signed.signature, &parts, &key.verifying_key()).unwrap();
        assert_eq!(verified.keyid, "https://sender.example/ocm#k1");
    }

    #[test]
    fn altered_body_breaks_digest_before_signature_check() {
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        let body = br#"{"a":1}"#;
        let req = SignRequest {
            parts: sample_parts(true),
            body: Some(body),
            keyid: "https://sender.example/ocm#k1".into(),
            created: now_unix(),
            header_components: &["content-digest"],
        };
        let signed = sign(&key, req);
        assert!(!verify_content_digest(signed.content_digest.as_deref().unwrap(), br#"{"a":2}"#));
    }

    #[test]
    fn tampered_base_fails_verification() {
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        let req = SignRequest {
            parts: sample_parts(false),
            body: None,
            keyid: "https://sender.example/ocm#k1".into(),
            created: now_unix(),
            header_components: &[],
        };
        let signed = sign(&key, req);
        let mut tampered = sample_parts(false);
        tampered.path = "/ocm/notifications".into();
        let err = verify_with_key(&signed.signature_input, &signed.signature, &tampered, &key.verifying_key())
            .unwrap_err();
        assert_eq!(err, SignatureError::Invalid);
    }

    #[test]
    fn wrong_key_fails_verification() {
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        let other = SigningKey::generate(&mut rand::rngs::OsRng);
        let req = SignRequest {
            parts: sample_parts(false),
            body: None,
            keyid: "https://sender.example/ocm#k1".into(),
            created: now_unix(),
            header_components: &[],
        };
        let signed = sign(&key, req);
        let err =
            verify_with_key(&signed.signature_input, &signed.signature, &sample_parts(false), &other.verifying_key())
                .unwrap_err();
        assert_eq!(err, SignatureError::Invalid);
    }

    #[test]
    fn missing_headers_is_detected() {
        assert!(!has_signature_headers(None, Some("x")));
        assert!(!has_signature_headers(Some("x"), None));
        assert!(has_signature_headers(Some("x"), Some("y")));
    }

    #[test]
    fn keyid_to_host_extracts_authority() {
        assert_eq!(keyid_to_host("https://sender.example:8443/ocm#k1"), Some("sender.example:8443".into()));
        assert_eq!(keyid_to_host("https://sender.example#k1"), Some("sender.example".into()));
    }

    #[test]
    fn key_manager_generates_and_persists_then_reloads_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("signing.key");
        let km1 = KeyManager::load_or_generate(&path, "https://my.example", "k1").unwrap();
        let km2 = KeyManager::load_or_generate(&path, "https://my.example", "k1").unwrap();
        assert_eq!(km1.verifying_key().as_bytes(), km2.verifying_key().as_bytes());
        assert_eq!(km1.key_id(), "https://my.example#k1");
    }

    #[test]
    fn public_key_pem_has_expected_armor() {
        let dir = tempfile::tempdir().unwrap();
        let km = KeyManager::load_or_generate(&dir.path().join("k"), "https://x.example", "k1").unwrap();
        let pem = km.public_key_pem();
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----\n"));
        assert!(pem.ends_with("-----END PUBLIC KEY-----\n"));
    }
}
