//! Auth collaborator — Party/Session storage (ambient; out-of-scope per spec.md but
//! required for the crate to run end to end).
//!
//! Backed by the same `rusqlite` + `parking_lot::Mutex<Connection>` pattern as C9's
//! `ShareStore`, itself grounded on the teacher's `policy/store.rs` (one `Mutex`-
//! guarded connection, one `execute_batch` migration, JSON-blob-plus-indexed-columns
//! rows). Password hashing is a salted SHA-256 stand-in — clearly not a production
//! KDF (argon2/bcrypt would be the real choice) but kept in the already-present
//! dependency stack rather than fabricating a new one; see `DESIGN.md`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64URL;
use parking_lot::Mutex;
use rand::RngCore;
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("database error: {0}")]
    Database(String),
    #[error("username already exists")]
    UsernameTaken,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("session not found or expired")]
    SessionExpired,
    #[error("cannot delete or demote the super_admin")]
    SuperAdminProtected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Admin,
    SuperAdmin,
    Probe,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
            Role::SuperAdmin => "super_admin",
            Role::Probe => "probe",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "admin" => Role::Admin,
            "super_admin" => Role::SuperAdmin,
            "probe" => Role::Probe,
            _ => Role::User,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Party {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub email: String,
    pub role: Role,
    pub realm: String,
    pub storage_root: String,
    pub created_at: i64,
    pub expires_at: Option<i64>,
}

impl Party {
    /// A probe user whose `expires_at` is in the past is logically absent.
    pub fn is_logically_absent(&self, now: i64) -> bool {
        self.role == Role::Probe && self.expires_at.is_some_and(|e| e < now)
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub user_id: String,
    pub created_at: i64,
    pub expires_at: i64,
}

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

fn time_ordered_id(prefix: &str) -> String {
    let mut rand_bytes = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut rand_bytes);
    format!("{prefix}-{:016x}-{}", now_unix(), hex::encode(rand_bytes))
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    B64URL.encode(bytes)
}

fn hash_password(password: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct AuthStore {
    db: Mutex<Connection>,
}

impl AuthStore {
    pub fn open(path: &str) -> Result<Self, AuthError> {
        let conn = Connection::open(path).map_err(|e| AuthError::Database(e.to_string()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").map_err(|e| AuthError::Database(e.to_string()))?;
        let store = Self { db: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, AuthError> {
        let conn = Connection::open_in_memory().map_err(|e| AuthError::Database(e.to_string()))?;
        let store = Self { db: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), AuthError> {
        let db = self.db.lock();
        db.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS parties (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL,
                email TEXT NOT NULL,
                password_hash TEXT NOT NULL,
                password_salt TEXT NOT NULL,
                role TEXT NOT NULL,
                realm TEXT NOT NULL,
                storage_root TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS sessions (
                token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
            ",
        )
        .map_err(|e| AuthError::Database(e.to_string()))?;
        Ok(())
    }

    pub fn create_party(
        &self,
        username: &str,
        display_name: &str,
        email: &str,
        password: &str,
        role: Role,
        realm: &str,
        storage_root: &str,
        probe_ttl: Option<Duration>,
    ) -> Result<Party, AuthError> {
        let db = self.db.lock();
        let exists: Option<String> = db
            .query_row("SELECT id FROM parties WHERE username = ?1", params![username], |r| r.get(0))
            .optional()
            .map_err(|e| AuthError::Database(e.to_string()))?;
        if exists.is_some() {
            return Err(AuthError::UsernameTaken);
        }

        let salt = random_token();
        let hash = hash_password(password, &salt);
        let now = now_unix();
        let expires_at = probe_ttl.map(|d| now + d.as_secs() as i64);
        let party = Party {
            id: time_ordered_id("user"),
            username: username.to_string(),
            display_name: display_name.to_string(),
            email: email.to_string(),
            role,
            realm: realm.to_string(),
            storage_root: storage_root.to_string(),
            created_at: now,
            expires_at,
        };

        db.execute(
            "INSERT INTO parties (id, username, display_name, email, password_hash, password_salt, role, realm, storage_root, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                party.id,
                party.username,
                party.display_name,
                party.email,
                hash,
                salt,
                party.role.as_str(),
                party.realm,
                party.storage_root,
                party.created_at,
                party.expires_at,
            ],
        )
        .map_err(|e| AuthError::Database(e.to_string()))?;
        Ok(party)
    }

    fn row_to_party(row: &rusqlite::Row) -> rusqlite::Result<Party> {
        let role: String = row.get("role")?;
        Ok(Party {
            id: row.get("id")?,
            username: row.get("username")?,
            display_name: row.get("display_name")?,
            email: row.get("email")?,
            role: Role::parse(&role),
            realm: row.get("realm")?,
            storage_root: row.get("storage_root")?,
            created_at: row.get("created_at")?,
            expires_at: row.get("expires_at")?,
        })
    }

    pub fn find_by_username(&self, username: &str) -> Result<Option<Party>, AuthError> {
        let db = self.db.lock();
        let party = db
            .query_row(
                "SELECT id, username, display_name, email, role, realm, storage_root, created_at, expires_at
                 FROM parties WHERE username = ?1",
                params![username],
                Self::row_to_party,
            )
            .optional()
            .map_err(|e| AuthError::Database(e.to_string()))?;
        Ok(party.filter(|p| !p.is_logically_absent(now_unix())))
    }

    pub fn find_by_id(&self, id: &str) -> Result<Option<Party>, AuthError> {
        let db = self.db.lock();
        let party = db
            .query_row(
                "SELECT id, username, display_name, email, role, realm, storage_root, created_at, expires_at
                 FROM parties WHERE id = ?1",
                params![id],
                Self::row_to_party,
            )
            .optional()
            .map_err(|e| AuthError::Database(e.to_string()))?;
        Ok(party.filter(|p| !p.is_logically_absent(now_unix())))
    }

    pub fn is_empty(&self) -> Result<bool, AuthError> {
        let db = self.db.lock();
        let count: i64 = db
            .query_row("SELECT COUNT(*) FROM parties", [], |r| r.get(0))
            .map_err(|e| AuthError::Database(e.to_string()))?;
        Ok(count == 0)
    }

    /// Authenticates `username`/`password`, returning the party on success.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<Party, AuthError> {
        let db = self.db.lock();
        let row: Option<(String, String, String, String, String, String, String, String, i64, Option<i64>)> = db
            .query_row(
                "SELECT id, username, display_name, email, role, realm, storage_root, password_hash, created_at, expires_at
                 FROM parties WHERE username = ?1",
                params![username],
                |r| {
                    Ok((
                        r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?, r.get(6)?,
                        r.get(7)?, r.get(8)?, r.get(9)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| AuthError::Database(e.to_string()))?;

        let Some((id, username, display_name, email, role, realm, storage_root, stored_hash, created_at, expires_at)) = row
        else {
            return Err(AuthError::InvalidCredentials);
        };
        let salt: String = db
            .query_row("SELECT password_salt FROM parties WHERE id = ?1", params![id], |r| r.get(0))
            .map_err(|e| AuthError::Database(e.to_string()))?;
        if hash_password(password, &salt) != stored_hash {
            return Err(AuthError::InvalidCredentials);
        }
        let party = Party {
            id,
            username,
            display_name,
            email,
            role: Role::parse(&role),
            realm,
            storage_root,
            created_at,
            expires_at,
        };
        if party.is_logically_absent(now_unix()) {
            return Err(AuthError::InvalidCredentials);
        }
        Ok(party)
    }

    /// Cannot delete or demote the super_admin (spec.md §3 invariant).
    pub fn delete_party(&self, id: &str) -> Result<(), AuthError> {
        let db = self.db.lock();
        let role: Option<String> = db
            .query_row("SELECT role FROM parties WHERE id = ?1", params![id], |r| r.get(0))
            .optional()
            .map_err(|e| AuthError::Database(e.to_string()))?;
        if role.as_deref() == Some("super_admin") {
            return Err(AuthError::SuperAdminProtected);
        }
        db.execute("DELETE FROM parties WHERE id = ?1", params![id]).map_err(|e| AuthError::Database(e.to_string()))?;
        db.execute("DELETE FROM sessions WHERE user_id = ?1", params![id]).map_err(|e| AuthError::Database(e.to_string()))?;
        Ok(())
    }

    pub fn create_session(&self, user_id: &str, ttl: Duration) -> Result<Session, AuthError> {
        let session = Session {
            token: random_token(),
            user_id: user_id.to_string(),
            created_at: now_unix(),
            expires_at: now_unix() + ttl.as_secs() as i64,
        };
        let db = self.db.lock();
        db.execute(
            "INSERT INTO sessions (token, user_id, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
            params![session.token, session.user_id, session.created_at, session.expires_at],
        )
        .map_err(|e| AuthError::Database(e.to_string()))?;
        Ok(session)
    }

    /// Expired sessions are invisible to lookups (spec.md §3).
    pub fn lookup_session(&self, token: &str) -> Result<Option<Session>, AuthError> {
        let db = self.db.lock();
        let row: Option<(String, String, i64, i64)> = db
            .query_row(
                "SELECT token, user_id, created_at, expires_at FROM sessions WHERE token = ?1",
                params![token],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()
            .map_err(|e| AuthError::Database(e.to_string()))?;
        Ok(row
            .map(|(token, user_id, created_at, expires_at)| Session { token, user_id, created_at, expires_at })
            .filter(|s| s.expires_at > now_unix()))
    }

    pub fn delete_session(&self, token: &str) -> Result<(), AuthError> {
        let db = self.db.lock();
        db.execute("DELETE FROM sessions WHERE token = ?1", params![token]).map_err(|e| AuthError::Database(e.to_string()))?;
        Ok(())
    }

    /// Removes expired sessions and expired probe users. Returns `(sessions, probes)` removed.
    pub fn purge_expired(&self) -> Result<(usize, usize), AuthError> {
        let db = self.db.lock();
        let now = now_unix();
        let sessions = db
            .execute("DELETE FROM sessions WHERE expires_at <= ?1", params![now])
            .map_err(|e| AuthError::Database(e.to_string()))?;
        let probes = db
            .execute(
                "DELETE FROM parties WHERE role = 'probe' AND expires_at IS NOT NULL AND expires_at <= ?1",
                params![now],
            )
            .map_err(|e| AuthError::Database(e.to_string()))?;
        Ok((sessions, probes))
    }
}

/// Spawns the background purge sweeper on its own timer (spec.md §5).
pub fn spawn_purge_sweeper(store: std::sync::Arc<AuthStore>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match store.purge_expired() {
                Ok((sessions, probes)) if sessions > 0 || probes > 0 => {
                    tracing::debug!(sessions, probes, "purged expired sessions/probe users");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "purge sweep failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_authenticate_round_trips() {
        let store = AuthStore::open_in_memory().unwrap();
        store.create_party("alice", "Alice", "a@example.com", "hunter2", Role::User, "default", "/data/alice", None).unwrap();
        let party = store.authenticate("alice", "hunter2").unwrap();
        assert_eq!(party.username, "alice");
    }

    #[test]
    fn wrong_password_is_rejected() {
        let store = AuthStore::open_in_memory().unwrap();
        store.create_party("alice", "Alice", "a@example.com", "hunter2", Role::User, "default", "/data/alice", None).unwrap();
        assert!(matches!(store.authenticate("alice", "wrong"), Err(AuthError::InvalidCredentials)));
    }

    #[test]
    fn duplicate_username_is_rejected() {
        let store = AuthStore::open_in_memory().unwrap();
        store.create_party("alice", "Alice", "a@example.com", "p", Role::User, "default", "/x", None).unwrap();
        assert!(matches!(
            store.create_party("alice", "Alice2", "a2@example.com", "p", Role::User, "default", "/x", None),
            Err(AuthError::UsernameTaken)
        ));
    }

    #[test]
    fn super_admin_cannot_be_deleted() {
        let store = AuthStore::open_in_memory().unwrap();
        let admin =
            store.create_party("root", "Root", "root@example.com", "p", Role::SuperAdmin, "default", "/x", None).unwrap();
        assert!(matches!(store.delete_party(&admin.id), Err(AuthError::SuperAdminProtected)));
    }

    #[test]
    fn expired_probe_user_is_logically_absent() {
        let store = AuthStore::open_in_memory().unwrap();
        store
            .create_party("probe1", "Probe", "p@example.com", "p", Role::Probe, "probes", "/x", Some(Duration::from_secs(0)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        assert!(store.find_by_username("probe1").unwrap().is_none());
    }

    #[test]
    fn session_lookup_invisible_after_expiry() {
        let store = AuthStore::open_in_memory().unwrap();
        let party = store.create_party("alice", "Alice", "a@example.com", "p", Role::User, "default", "/x", None).unwrap();
        let session = store.create_session(&party.id, Duration::from_secs(0)).unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        assert!(store.lookup_session(&session.token).unwrap().is_none());
    }

    #[test]
    fn logout_deletes_session() {
        let store = AuthStore::open_in_memory().unwrap();
        let party = store.create_party("alice", "Alice", "a@example.com", "p", Role::User, "default", "/x", None).unwrap();
        let session = store.create_session(&party.id, Duration::from_secs(60)).unwrap();
        store.delete_session(&session.token).unwrap();
        assert!(store.lookup_session(&session.token).unwrap().is_none());
    }

    #[test]
    fn purge_removes_expired_sessions_and_probes() {
        let store = AuthStore::open_in_memory().unwrap();
        let party = store.create_party("alice", "Alice", "a@example.com", "p", Role::User, "default", "/x", None).unwrap();
        store.create_session(&party.id, Duration::from_secs(0)).unwrap();
        store
            .create_party("probe1", "Probe", "p@example.com", "p", Role::Probe, "probes", "/x", Some(Duration::from_secs(0)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        let (sessions, probes) = store.purge_expired().unwrap();
        assert_eq!(sessions, 1);
        assert_eq!(probes, 1);
    }
}
