//! C9 — Share state & storage.
//!
//! Incoming (sender-scoped) and outgoing share records, providerId/webdavId
//! indexes, and the pending→{accepted,declined}/pending→{sent,failed} status
//! machines. Grounded directly on the teacher's `policy/store.rs`:
//! `Mutex<rusqlite::Connection>`, one `execute_batch` migration with `UNIQUE(...)`
//! constraints, and a `thiserror` `StoreError` enum, reused near-verbatim in
//! structure.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64URL;
use parking_lot::Mutex;
use rand::RngCore;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ShareError {
    #[error("database error: {0}")]
    Database(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("conflict: share already exists for this sender/providerId")]
    Conflict,
    #[error("not found")]
    NotFound,
    #[error("invalid state transition: {0}")]
    InvalidTransition(String),
    #[error("path {0:?} is outside the configured allowlist")]
    PathNotAllowed(String),
}

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

fn time_ordered_id(prefix: &str) -> String {
    let mut rand_bytes = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut rand_bytes);
    format!("{prefix}-{:016x}-{}", now_unix(), hex::encode(rand_bytes))
}

pub fn generate_shared_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    B64URL.encode(bytes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareType {
    User,
    Group,
    Federation,
}

impl ShareType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "group" => Some(Self::Group),
            "federation" => Some(Self::Federation),
            _ => None,
        }
    }
    fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Group => "group",
            Self::Federation => "federation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingStatus {
    Pending,
    Accepted,
    Declined,
}

impl IncomingStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
        }
    }
    fn parse(s: &str) -> Self {
        match s {
            "accepted" => Self::Accepted,
            "declined" => Self::Declined,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingStatus {
    Pending,
    Sent,
    Failed,
}

impl OutgoingStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
    fn parse(s: &str) -> Self {
        match s {
            "sent" => Self::Sent,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebdavLocation {
    pub webdav_id: Option<String>,
    pub webdav_uri_absolute: Option<String>,
}

impl WebdavLocation {
    /// A `uri` containing `://` is absolute; otherwise it's a relative `webdav_id`
    /// (spec.md §4.9).
    pub fn from_uri(uri: &str) -> Self {
        if uri.contains("://") {
            Self { webdav_id: None, webdav_uri_absolute: Some(uri.to_string()) }
        } else {
            Self { webdav_id: Some(uri.to_string()), webdav_uri_absolute: None }
        }
    }
}

#[derive(Debug, Clone)]
pub struct IncomingShare {
    pub share_id: String,
    pub provider_id: String,
    pub sender_host: String,
    pub owner: String,
    pub sender: String,
    pub share_with: String,
    pub name: String,
    pub description: Option<String>,
    pub resource_type: String,
    pub share_type: ShareType,
    pub webdav_id: Option<String>,
    pub webdav_uri_absolute: Option<String>,
    pub shared_secret: String,
    pub permissions: Vec<String>,
    pub must_exchange_token: bool,
    pub status: IncomingStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Immutable view dropping `shared_secret` (spec.md §3 ownership rule).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingShareView {
    pub share_id: String,
    pub provider_id: String,
    pub sender_host: String,
    pub owner: String,
    pub sender: String,
    pub share_with: String,
    pub name: String,
    pub description: Option<String>,
    pub resource_type: String,
    pub share_type: String,
    pub webdav_id: Option<String>,
    pub webdav_uri_absolute: Option<String>,
    pub permissions: Vec<String>,
    pub must_exchange_token: bool,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl IncomingShare {
    pub fn to_view(&self) -> IncomingShareView {
        IncomingShareView {
            share_id: self.share_id.clone(),
            provider_id: self.provider_id.clone(),
            sender_host: self.sender_host.clone(),
            owner: self.owner.clone(),
            sender: self.sender.clone(),
            share_with: self.share_with.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            resource_type: self.resource_type.clone(),
            share_type: self.share_type.as_str().to_string(),
            webdav_id: self.webdav_id.clone(),
            webdav_uri_absolute: self.webdav_uri_absolute.clone(),
            permissions: self.permissions.clone(),
            must_exchange_token: self.must_exchange_token,
            status: self.status.as_str().to_string(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Inbound `POST /ocm/shares` request fields, pre-validation.
#[derive(Debug, Clone)]
pub struct NewIncomingShare {
    pub share_with: String,
    pub name: String,
    pub description: Option<String>,
    pub provider_id: String,
    pub owner: String,
    pub sender: String,
    pub sender_host: String,
    pub share_type: String,
    pub resource_type: String,
    pub webdav_uri: Option<String>,
    pub shared_secret: Option<String>,
    pub permissions: Vec<String>,
    pub requirements: Vec<String>,
}

const ALLOWED_PERMISSIONS: &[&str] = &["read", "write", "share"];
const KNOWN_REQUIREMENTS: &[&str] = &["must-exchange-token"];

/// Validates a new incoming share per spec.md §4.9. Does not touch storage.
pub fn validate_new_incoming(req: &NewIncomingShare) -> Result<(), ShareError> {
    if req.share_with.is_empty() {
        return Err(ShareError::Validation("shareWith is required".into()));
    }
    if req.name.is_empty() {
        return Err(ShareError::Validation("name is required".into()));
    }
    if req.provider_id.is_empty() {
        return Err(ShareError::Validation("providerId is required".into()));
    }
    if req.owner.is_empty() {
        return Err(ShareError::Validation("owner is required".into()));
    }
    if req.sender.is_empty() {
        return Err(ShareError::Validation("sender is required".into()));
    }
    if ShareType::parse(&req.share_type).is_none() {
        return Err(ShareError::Validation(format!("unknown shareType {:?}", req.share_type)));
    }
    if req.resource_type == "file" && req.webdav_uri.is_none() {
        return Err(ShareError::Validation("protocol.webdav is required for resourceType=file".into()));
    }
    for p in &req.permissions {
        if !ALLOWED_PERMISSIONS.contains(&p.as_str()) {
            return Err(ShareError::Validation(format!("unknown permission {p:?}")));
        }
    }
    // WebDAV always requires sharedSecret (strict) per spec.md §4.9.
    if req.webdav_uri.is_some() && req.shared_secret.is_none() {
        return Err(ShareError::Validation("sharedSecret is required for WebDAV shares".into()));
    }
    for r in &req.requirements {
        if r == "must-use-mfa" {
            return Err(ShareError::Validation("must-use-mfa is not supported".into()));
        }
        if !KNOWN_REQUIREMENTS.contains(&r.as_str()) {
            return Err(ShareError::Validation(format!("unknown requirement {r:?}")));
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct OutgoingShare {
    pub share_id: String,
    pub provider_id: String,
    pub webdav_id: String,
    pub shared_secret: String,
    pub local_path: String,
    pub receiver_host: String,
    pub receiver_endpoint: Option<String>,
    pub share_with: String,
    pub name: String,
    pub resource_type: String,
    pub share_type: ShareType,
    pub permissions: Vec<String>,
    pub owner: String,
    pub sender: String,
    pub status: OutgoingStatus,
    pub created_at: i64,
    pub sent_at: Option<i64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewOutgoingShare {
    pub receiver_domain: String,
    pub share_with: String,
    pub local_path: String,
    pub name: String,
    pub resource_type: String,
    pub share_type: String,
    pub permissions: Vec<String>,
    pub owner: String,
    pub sender: String,
}

/// Rejects relative/`..`-containing paths and paths outside the configured
/// allowlist of prefixes (spec.md §4.9).
pub fn validate_local_path(path: &str, allowed_prefixes: &[String]) -> Result<(), ShareError> {
    if !path.starts_with('/') {
        return Err(ShareError::Validation("localPath must be absolute".into()));
    }
    if path.split('/').any(|seg| seg == "..") {
        return Err(ShareError::Validation("localPath must not contain ..".into()));
    }
    if !allowed_prefixes.is_empty() && !allowed_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
        return Err(ShareError::PathNotAllowed(path.to_string()));
    }
    Ok(())
}

/// A notification queued for delivery to a sender (spec.md §4.9's notifications sink).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    ShareAccepted,
    ShareDeclined,
    ShareUnshared,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ShareAccepted => "SHARE_ACCEPTED",
            Self::ShareDeclined => "SHARE_DECLINED",
            Self::ShareUnshared => "SHARE_UNSHARED",
        }
    }
}

/// Implemented by the out-of-scope REST/notification-delivery collaborator; the
/// store only needs to know a notification *was* emitted, not how it's delivered.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, kind: NotificationKind, provider_id: &str, recipient_host: &str);
}

/// No-op sink used when no delivery collaborator is wired in (e.g. tests).
pub struct NullSink;
impl NotificationSink for NullSink {
    fn notify(&self, _kind: NotificationKind, _provider_id: &str, _recipient_host: &str) {}
}

pub struct ShareStore {
    db: Mutex<Connection>,
}

impl ShareStore {
    pub fn open(path: &str) -> Result<Self, ShareError> {
        let conn = Connection::open(path).map_err(|e| ShareError::Database(e.to_string()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").map_err(|e| ShareError::Database(e.to_string()))?;
        let store = Self { db: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, ShareError> {
        let conn = Connection::open_in_memory().map_err(|e| ShareError::Database(e.to_string()))?;
        let store = Self { db: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), ShareError> {
        let db = self.db.lock();
        db.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS incoming_shares (
                share_id TEXT PRIMARY KEY,
                provider_id TEXT NOT NULL,
                sender_host TEXT NOT NULL,
                owner TEXT NOT NULL,
                sender TEXT NOT NULL,
                share_with TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                resource_type TEXT NOT NULL,
                share_type TEXT NOT NULL,
                webdav_id TEXT,
                webdav_uri_absolute TEXT,
                shared_secret TEXT NOT NULL,
                permissions_json TEXT NOT NULL,
                must_exchange_token INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(sender_host, provider_id)
            );
            CREATE INDEX IF NOT EXISTS idx_incoming_provider ON incoming_shares(provider_id);

            CREATE TABLE IF NOT EXISTS outgoing_shares (
                share_id TEXT PRIMARY KEY,
                provider_id TEXT NOT NULL UNIQUE,
                webdav_id TEXT NOT NULL UNIQUE,
                shared_secret TEXT NOT NULL,
                local_path TEXT NOT NULL,
                receiver_host TEXT NOT NULL,
                receiver_endpoint TEXT,
                share_with TEXT NOT NULL,
                name TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                share_type TEXT NOT NULL,
                permissions_json TEXT NOT NULL,
                owner TEXT NOT NULL,
                sender TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at INTEGER NOT NULL,
                sent_at INTEGER,
                error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_outgoing_provider ON outgoing_shares(provider_id);
            CREATE INDEX IF NOT EXISTS idx_outgoing_webdav ON outgoing_shares(webdav_id);

            CREATE TABLE IF NOT EXISTS issued_tokens (
                access_token TEXT PRIMARY KEY,
                share_id TEXT NOT NULL,
                client_id TEXT NOT NULL,
                issued_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tokens_share ON issued_tokens(share_id);
            ",
        )
        .map_err(|e| ShareError::Database(e.to_string()))?;
        Ok(())
    }

    /// Inserts a new incoming share. `(sender_host, provider_id)` uniqueness is
    /// enforced by the DB; a collision surfaces as [`ShareError::Conflict`] and
    /// leaves the existing record unchanged (spec invariant 1).
    pub fn insert_incoming(&self, req: &NewIncomingShare) -> Result<IncomingShare, ShareError> {
        validate_new_incoming(req)?;
        let location = req.webdav_uri.as_deref().map(WebdavLocation::from_uri);
        let must_exchange_token = req.requirements.iter().any(|r| r == "must-exchange-token");
        let now = now_unix();
        let share = IncomingShare {
            share_id: time_ordered_id("ishare"),
            provider_id: req.provider_id.clone(),
            sender_host: req.sender_host.to_lowercase(),
            owner: req.owner.clone(),
            sender: req.sender.clone(),
            share_with: req.share_with.clone(),
            name: req.name.clone(),
            description: req.description.clone(),
            resource_type: req.resource_type.clone(),
            share_type: ShareType::parse(&req.share_type).expect("validated above"),
            webdav_id: location.as_ref().and_then(|l| l.webdav_id.clone()),
            webdav_uri_absolute: location.as_ref().and_then(|l| l.webdav_uri_absolute.clone()),
            shared_secret: req.shared_secret.clone().unwrap_or_default(),
            permissions: req.permissions.clone(),
            must_exchange_token,
            status: IncomingStatus::Pending,
            created_at: now,
            updated_at: now,
        };

        let db = self.db.lock();
        let result = db.execute(
            "INSERT INTO incoming_shares
             (share_id, provider_id, sender_host, owner, sender, share_with, name, description,
              resource_type, share_type, webdav_id, webdav_uri_absolute, shared_secret,
              permissions_json, must_exchange_token, status, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
            params![
                share.share_id,
                share.provider_id,
                share.sender_host,
                share.owner,
                share.sender,
                share.share_with,
                share.name,
                share.description,
                share.resource_type,
                share.share_type.as_str(),
                share.webdav_id,
                share.webdav_uri_absolute,
                share.shared_secret,
                serde_json::to_string(&share.permissions).unwrap(),
                share.must_exchange_token as i64,
                share.status.as_str(),
                share.created_at,
                share.updated_at,
            ],
        );

        match result {
            Ok(_) => Ok(share),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
                Err(ShareError::Conflict)
            }
            Err(e) => Err(ShareError::Database(e.to_string())),
        }
    }

    fn row_to_incoming(row: &rusqlite::Row) -> rusqlite::Result<IncomingShare> {
        let share_type: String = row.get("share_type")?;
        let status: String = row.get("status")?;
        let permissions_json: String = row.get("permissions_json")?;
        Ok(IncomingShare {
            share_id: row.get("share_id")?,
            provider_id: row.get("provider_id")?,
            sender_host: row.get("sender_host")?,
            owner: row.get("owner")?,
            sender: row.get("sender")?,
            share_with: row.get("share_with")?,
            name: row.get("name")?,
            description: row.get("description")?,
            resource_type: row.get("resource_type")?,
            share_type: ShareType::parse(&share_type).unwrap_or(ShareType::User),
            webdav_id: row.get("webdav_id")?,
            webdav_uri_absolute: row.get("webdav_uri_absolute")?,
            shared_secret: row.get("shared_secret")?,
            permissions: serde_json::from_str(&permissions_json).unwrap_or_default(),
            must_exchange_token: row.get::<_, i64>("must_exchange_token")? != 0,
            status: IncomingStatus::parse(&status),
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    pub fn get_incoming(&self, share_id: &str) -> Result<Option<IncomingShare>, ShareError> {
        let db = self.db.lock();
        db.query_row("SELECT * FROM incoming_shares WHERE share_id = ?1", params![share_id], Self::row_to_incoming)
            .optional()
            .map_err(|e| ShareError::Database(e.to_string()))
    }

    pub fn get_incoming_by_webdav_id(&self, webdav_id: &str) -> Result<Option<IncomingShare>, ShareError> {
        let db = self.db.lock();
        db.query_row("SELECT * FROM incoming_shares WHERE webdav_id = ?1", params![webdav_id], Self::row_to_incoming)
            .optional()
            .map_err(|e| ShareError::Database(e.to_string()))
    }

    /// Idempotent accept/decline. Repeated transitions into the same terminal state
    /// return `Ok(false)` (no-op, no notification); crossing terminal states is
    /// [`ShareError::InvalidTransition`]; a fresh pending→terminal transition returns
    /// `Ok(true)` and the caller should emit the matching notification.
    pub fn transition_incoming(&self, share_id: &str, target: IncomingStatus) -> Result<bool, ShareError> {
        let db = self.db.lock();
        let current: Option<String> = db
            .query_row("SELECT status FROM incoming_shares WHERE share_id = ?1", params![share_id], |r| r.get(0))
            .optional()
            .map_err(|e| ShareError::Database(e.to_string()))?;
        let Some(current) = current else { return Err(ShareError::NotFound) };
        let current = IncomingStatus::parse(&current);

        if current == target {
            return Ok(false);
        }
        if current != IncomingStatus::Pending {
            return Err(ShareError::InvalidTransition(format!(
                "cannot transition from {} to {}",
                current.as_str(),
                target.as_str()
            )));
        }
        db.execute(
            "UPDATE incoming_shares SET status = ?1, updated_at = ?2 WHERE share_id = ?3",
            params![target.as_str(), now_unix(), share_id],
        )
        .map_err(|e| ShareError::Database(e.to_string()))?;
        Ok(true)
    }

    pub fn insert_outgoing(
        &self,
        req: &NewOutgoingShare,
        allowed_path_prefixes: &[String],
    ) -> Result<OutgoingShare, ShareError> {
        if req.receiver_domain.is_empty() {
            return Err(ShareError::Validation("receiverDomain is required".into()));
        }
        if req.share_with.is_empty() {
            return Err(ShareError::Validation("shareWith is required".into()));
        }
        validate_local_path(&req.local_path, allowed_path_prefixes)?;
        for p in &req.permissions {
            if !ALLOWED_PERMISSIONS.contains(&p.as_str()) {
                return Err(ShareError::Validation(format!("unknown permission {p:?}")));
            }
        }
        let share_type = ShareType::parse(&req.share_type).unwrap_or(ShareType::User);
        let now = now_unix();
        let share = OutgoingShare {
            share_id: time_ordered_id("oshare"),
            provider_id: time_ordered_id("prov"),
            webdav_id: uuid_like(),
            shared_secret: generate_shared_secret(),
            local_path: req.local_path.clone(),
            receiver_host: req.receiver_domain.to_lowercase(),
            receiver_endpoint: None,
            share_with: req.share_with.clone(),
            name: req.name.clone(),
            resource_type: req.resource_type.clone(),
            share_type,
            permissions: req.permissions.clone(),
            owner: req.owner.clone(),
            sender: req.sender.clone(),
            status: OutgoingStatus::Pending,
            created_at: now,
            sent_at: None,
            error: None,
        };
        let db = self.db.lock();
        db.execute(
            "INSERT INTO outgoing_shares
             (share_id, provider_id, webdav_id, shared_secret, local_path, receiver_host, receiver_endpoint,
              share_with, name, resource_type, share_type, permissions_json, owner, sender, status, created_at, sent_at, error)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
            params![
                share.share_id,
                share.provider_id,
                share.webdav_id,
                share.shared_secret,
                share.local_path,
                share.receiver_host,
                share.receiver_endpoint,
                share.share_with,
                share.name,
                share.resource_type,
                share.share_type.as_str(),
                serde_json::to_string(&share.permissions).unwrap(),
                share.owner,
                share.sender,
                share.status.as_str(),
                share.created_at,
                share.sent_at,
                share.error,
            ],
        )
        .map_err(|e| ShareError::Database(e.to_string()))?;
        Ok(share)
    }

    fn row_to_outgoing(row: &rusqlite::Row) -> rusqlite::Result<OutgoingShare> {
        let share_type: String = row.get("share_type")?;
        let status: String = row.get("status")?;
        let permissions_json: String = row.get("permissions_json")?;
        Ok(OutgoingShare {
            share_id: row.get("share_id")?,
            provider_id: row.get("provider_id")?,
            webdav_id: row.get("webdav_id")?,
            shared_secret: row.get("shared_secret")?,
            local_path: row.get("local_path")?,
            receiver_host: row.get("receiver_host")?,
            receiver_endpoint: row.get("receiver_endpoint")?,
            share_with: row.get("share_with")?,
            name: row.get("name")?,
            resource_type: row.get("resource_type")?,
            share_type: ShareType::parse(&share_type).unwrap_or(ShareType::User),
            permissions: serde_json::from_str(&permissions_json).unwrap_or_default(),
            owner: row.get("owner")?,
            sender: row.get("sender")?,
            status: OutgoingStatus::parse(&status),
            created_at: row.get("created_at")?,
            sent_at: row.get("sent_at")?,
            error: row.get("error")?,
        })
    }

    pub fn get_outgoing(&self, share_id: &str) -> Result<Option<OutgoingShare>, ShareError> {
        let db = self.db.lock();
        db.query_row("SELECT * FROM outgoing_shares WHERE share_id = ?1", params![share_id], Self::row_to_outgoing)
            .optional()
            .map_err(|e| ShareError::Database(e.to_string()))
    }

    pub fn get_outgoing_by_provider_id(&self, provider_id: &str) -> Result<Option<OutgoingShare>, ShareError> {
        let db = self.db.lock();
        db.query_row("SELECT * FROM outgoing_shares WHERE provider_id = ?1", params![provider_id], Self::row_to_outgoing)
            .optional()
            .map_err(|e| ShareError::Database(e.to_string()))
    }

    pub fn get_outgoing_by_webdav_id(&self, webdav_id: &str) -> Result<Option<OutgoingShare>, ShareError> {
        let db = self.db.lock();
        db.query_row("SELECT * FROM outgoing_shares WHERE webdav_id = ?1", params![webdav_id], Self::row_to_outgoing)
            .optional()
            .map_err(|e| ShareError::Database(e.to_string()))
    }

    /// Looks an outgoing share up by the `code` a token-exchange client presents,
    /// which is the shared secret handed out when the share was created.
    pub fn get_outgoing_by_shared_secret(&self, shared_secret: &str) -> Result<Option<OutgoingShare>, ShareError> {
        let db = self.db.lock();
        db.query_row("SELECT * FROM outgoing_shares WHERE shared_secret = ?1", params![shared_secret], Self::row_to_outgoing)
            .optional()
            .map_err(|e| ShareError::Database(e.to_string()))
    }

    pub fn mark_outgoing_sent(&self, share_id: &str, receiver_endpoint: &str) -> Result<(), ShareError> {
        let db = self.db.lock();
        db.execute(
            "UPDATE outgoing_shares SET status = 'sent', receiver_endpoint = ?1, sent_at = ?2 WHERE share_id = ?3",
            params![receiver_endpoint, now_unix(), share_id],
        )
        .map_err(|e| ShareError::Database(e.to_string()))?;
        Ok(())
    }

    pub fn mark_outgoing_failed(&self, share_id: &str, error: &str) -> Result<(), ShareError> {
        let db = self.db.lock();
        db.execute(
            "UPDATE outgoing_shares SET status = 'failed', error = ?1 WHERE share_id = ?2",
            params![error, share_id],
        )
        .map_err(|e| ShareError::Database(e.to_string()))?;
        Ok(())
    }

    /// Issues a random access token for `share_id`, default TTL one hour.
    pub fn issue_token(&self, share_id: &str, client_id: &str, ttl_secs: i64) -> Result<String, ShareError> {
        let token = generate_shared_secret();
        let now = now_unix();
        let db = self.db.lock();
        db.execute(
            "INSERT INTO issued_tokens (access_token, share_id, client_id, issued_at, expires_at) VALUES (?1,?2,?3,?4,?5)",
            params![token, share_id, client_id, now, now + ttl_secs],
        )
        .map_err(|e| ShareError::Database(e.to_string()))?;
        Ok(token)
    }

    /// Expired tokens are invisible (spec.md §3).
    pub fn lookup_token(&self, access_token: &str) -> Result<Option<String>, ShareError> {
        let db = self.db.lock();
        let row: Option<(String, i64)> = db
            .query_row(
                "SELECT share_id, expires_at FROM issued_tokens WHERE access_token = ?1",
                params![access_token],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(|e| ShareError::Database(e.to_string()))?;
        Ok(row.filter(|(_, exp)| *exp > now_unix()).map(|(share_id, _)| share_id))
    }
}

fn uuid_like() -> String {
    let mut b = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut b);
    // Version/variant bits don't matter for our shape check (8-4-4-4-12 hex), only
    // the canonical separator positions do.
    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]
    )
}

/// Handles an inbox `accept`/`decline` action, emitting the matching notification
/// exactly once on a fresh transition (spec.md §4.9).
pub fn handle_inbox_action(
    store: &ShareStore,
    sink: &dyn NotificationSink,
    share_id: &str,
    accept: bool,
) -> Result<(), ShareError> {
    let share = store.get_incoming(share_id)?.ok_or(ShareError::NotFound)?;
    let target = if accept { IncomingStatus::Accepted } else { IncomingStatus::Declined };
    let transitioned = store.transition_incoming(share_id, target)?;
    if transitioned {
        let kind = if accept { NotificationKind::ShareAccepted } else { NotificationKind::ShareDeclined };
        sink.notify(kind, &share.provider_id, &share.sender_host);
    }
    Ok(())
}

/// Resolves a `providerId` from a notification body to exactly one stored outgoing
/// share from `sender_host` (spec.md §4.9).
pub fn resolve_outgoing_for_notification(
    store: &ShareStore,
    provider_id: &str,
    sender_host: &str,
) -> Result<OutgoingShare, ShareError> {
    let share = store.get_outgoing_by_provider_id(provider_id)?.ok_or(ShareError::NotFound)?;
    if share.receiver_host.to_lowercase() != sender_host.to_lowercase() {
        return Err(ShareError::NotFound);
    }
    Ok(share)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request(sender: &str, sender_host: &str) -> NewIncomingShare {
        NewIncomingShare {
            share_with: "alice@receiver.example".into(),
            name: "doc.txt".into(),
            description: None,
            provider_id: "p-001".into(),
            owner: "bob@sender.example".into(),
            sender: sender.into(),
            sender_host: sender_host.into(),
            share_type: "user".into(),
            resource_type: "file".into(),
            webdav_uri: Some("wd-001".into()),
            shared_secret: Some("s".into()),
            permissions: vec!["read".into()],
            requirements: vec![],
        }
    }

    #[test]
    fn s1_share_round_trip() {
        let store = ShareStore::open_in_memory().unwrap();
        let req = sample_request("bob@sender.example", "sender.example");
        let share = store.insert_incoming(&req).unwrap();
        assert_eq!(share.status, IncomingStatus::Pending);
        assert_eq!(share.sender_host, "sender.example");
        assert_eq!(share.share_with, "alice@receiver.example");
        assert_eq!(share.webdav_id.as_deref(), Some("wd-001"));
    }

    #[test]
    fn s2_provider_id_collision_across_senders_is_allowed() {
        let store = ShareStore::open_in_memory().unwrap();
        store.insert_incoming(&sample_request("bob@sender.example", "sender.example")).unwrap();
        let second = store.insert_incoming(&sample_request("carol@other.example", "other.example")).unwrap();
        assert_eq!(second.provider_id, "p-001");
        assert_eq!(second.sender_host, "other.example");
    }

    #[test]
    fn duplicate_sender_host_provider_id_is_conflict() {
        let store = ShareStore::open_in_memory().unwrap();
        store.insert_incoming(&sample_request("bob@sender.example", "sender.example")).unwrap();
        let err = store.insert_incoming(&sample_request("bob@sender.example", "sender.example")).unwrap_err();
        assert!(matches!(err, ShareError::Conflict));
    }

    #[test]
    fn absolute_webdav_uri_is_stored_separately() {
        let mut req = sample_request("bob@sender.example", "sender.example");
        req.webdav_uri = Some("https://sender.example/dav/wd-1".into());
        let store = ShareStore::open_in_memory().unwrap();
        let share = store.insert_incoming(&req).unwrap();
        assert!(share.webdav_id.is_none());
        assert_eq!(share.webdav_uri_absolute.as_deref(), Some("https://sender.example/dav/wd-1"));
    }

    #[test]
    fn must_exchange_token_requirement_is_accepted_and_stored() {
        let mut req = sample_request("bob@sender.example", "sender.example");
        req.requirements = vec!["must-exchange-token".into()];
        let store = ShareStore::open_in_memory().unwrap();
        let share = store.insert_incoming(&req).unwrap();
        assert!(share.must_exchange_token);
    }

    #[test]
    fn must_use_mfa_requirement_is_rejected() {
        let mut req = sample_request("bob@sender.example", "sender.example");
        req.requirements = vec!["must-use-mfa".into()];
        assert!(matches!(validate_new_incoming(&req), Err(ShareError::Validation(_))));
    }

    #[test]
    fn accept_then_repeated_accept_is_idempotent_noop() {
        let store = ShareStore::open_in_memory().unwrap();
        let share = store.insert_incoming(&sample_request("bob@sender.example", "sender.example")).unwrap();
        assert!(store.transition_incoming(&share.share_id, IncomingStatus::Accepted).unwrap());
        assert!(!store.transition_incoming(&share.share_id, IncomingStatus::Accepted).unwrap());
    }

    #[test]
    fn crossing_accepted_to_declined_is_invalid_transition() {
        let store = ShareStore::open_in_memory().unwrap();
        let share = store.insert_incoming(&sample_request("bob@sender.example", "sender.example")).unwrap();
        store.transition_incoming(&share.share_id, IncomingStatus::Accepted).unwrap();
        assert!(matches!(
            store.transition_incoming(&share.share_id, IncomingStatus::Declined),
            Err(ShareError::InvalidTransition(_))
        ));
    }

    #[test]
    fn handle_inbox_action_emits_notification_once() {
        struct CountingSink(std::sync::atomic::AtomicUsize);
        impl NotificationSink for CountingSink {
            fn notify(&self, _kind: NotificationKind, _provider_id: &str, _recipient_host: &str) {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }
        let store = ShareStore::open_in_memory().unwrap();
        let share = store.insert_incoming(&sample_request("bob@sender.example", "sender.example")).unwrap();
        let sink = CountingSink(std::sync::atomic::AtomicUsize::new(0));
        handle_inbox_action(&store, &sink, &share.share_id, true).unwrap();
        handle_inbox_action(&store, &sink, &share.share_id, true).unwrap();
        assert_eq!(sink.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn relative_local_path_is_rejected() {
        assert!(matches!(validate_local_path("relative/path", &[]), Err(ShareError::Validation(_))));
    }

    #[test]
    fn dotdot_path_is_rejected() {
        assert!(matches!(validate_local_path("/data/../etc/passwd", &[]), Err(ShareError::Validation(_))));
    }

    #[test]
    fn path_outside_allowlist_is_rejected() {
        let err = validate_local_path("/other/x", &["/data".to_string()]).unwrap_err();
        assert!(matches!(err, ShareError::PathNotAllowed(_)));
    }

    #[test]
    fn outgoing_share_indexes_by_all_three_keys() {
        let store = ShareStore::open_in_memory().unwrap();
        let req = NewOutgoingShare {
            receiver_domain: "receiver.example".into(),
            share_with: "alice@receiver.example".into(),
            local_path: "/data/bob/doc.txt".into(),
            name: "doc.txt".into(),
            resource_type: "file".into(),
            share_type: "user".into(),
            permissions: vec!["read".into()],
            owner: "bob@sender.example".into(),
            sender: "bob@sender.example".into(),
        };
        let share = store.insert_outgoing(&req, &["/data".to_string()]).unwrap();
        assert!(store.get_outgoing(&share.share_id).unwrap().is_some());
        assert!(store.get_outgoing_by_provider_id(&share.provider_id).unwrap().is_some());
        assert!(store.get_outgoing_by_webdav_id(&share.webdav_id).unwrap().is_some());
    }

    #[test]
    fn issued_token_is_invisible_after_expiry() {
        let store = ShareStore::open_in_memory().unwrap();
        let req = NewOutgoingShare {
            receiver_domain: "receiver.example".into(),
            share_with: "alice@receiver.example".into(),
            local_path: "/data/bob/doc.txt".into(),
            name: "doc.txt".into(),
            resource_type: "file".into(),
            share_type: "user".into(),
            permissions: vec!["read".into()],
            owner: "bob@sender.example".into(),
            sender: "bob@sender.example".into(),
        };
        let share = store.insert_outgoing(&req, &[]).unwrap();
        let token = store.issue_token(&share.share_id, "client1", 0).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(store.lookup_token(&token).unwrap().is_none());
    }

    #[test]
    fn resolve_outgoing_for_notification_requires_matching_sender_host() {
        let store = ShareStore::open_in_memory().unwrap();
        let req = NewOutgoingShare {
            receiver_domain: "receiver.example".into(),
            share_with: "alice@receiver.example".into(),
            local_path: "/data/bob/doc.txt".into(),
            name: "doc.txt".into(),
            resource_type: "file".into(),
            share_type: "user".into(),
            permissions: vec!["read".into()],
            owner: "bob@sender.example".into(),
            sender: "bob@sender.example".into(),
        };
        let share = store.insert_outgoing(&req, &[]).unwrap();
        assert!(resolve_outgoing_for_notification(&store, &share.provider_id, "receiver.example").is_ok());
        assert!(resolve_outgoing_for_notification(&store, &share.provider_id, "evil.example").is_err());
    }

    #[test]
    fn unknown_share_type_is_rejected() {
        let mut req = sample_request("bob@sender.example", "sender.example");
        req.share_type = "bogus".into();
        assert!(matches!(validate_new_incoming(&req), Err(ShareError::Validation(_))));
    }

    #[test]
    fn file_resource_without_webdav_is_rejected() {
        let mut req = sample_request("bob@sender.example", "sender.example");
        req.webdav_uri = None;
        assert!(matches!(validate_new_incoming(&req), Err(ShareError::Validation(_))));
    }
}
