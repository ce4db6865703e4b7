//! Dependency-injected application state.
//!
//! Replaces the source's process-wide globals with an explicit struct constructed
//! once at startup and threaded through handler/service constructors (spec.md §9's
//! "globals & singletons → injection everywhere" design note). Field shape mirrors
//! the teacher's `SharedState` in `server.rs`: one field per subsystem, each owning
//! its own interior mutability rather than one giant lock.

use std::sync::Arc;

use crate::auth::AuthStore;
use crate::cache::FullCache;
use crate::config::Config;
use crate::discovery::DiscoveryClient;
use crate::federation::FederationManager;
use crate::http_client::SafeHttpClient;
use crate::invites::InviteStore;
use crate::peers::ProfileRegistry;
use crate::policy::PolicyState;
use crate::shares::ShareStore;
use crate::signature::KeyManager;

/// Everything a request handler or background task needs, constructed once in
/// `main.rs` and shared via `Arc`. Tests construct a fresh one per test rather than
/// relying on any process-wide instance.
pub struct AppState {
    pub config: Config,
    pub keys: KeyManager,
    pub http: Arc<SafeHttpClient>,
    pub discovery: DiscoveryClient,
    pub federation: Option<Arc<FederationManager>>,
    pub profiles: ProfileRegistry,
    pub policy: PolicyState,
    pub shares: ShareStore,
    pub auth: Arc<AuthStore>,
    pub invites: Arc<InviteStore>,
    /// Backs both the discovery-document cache and the per-path rate limiters
    /// (`src/http/rate_limit.rs`); one driver instance per process.
    pub cache: Arc<dyn FullCache>,
}

impl AppState {
    pub fn external_origin(&self) -> &str {
        &self.config.server.external_origin
    }

    /// `true` iff `host` is a member of any enabled federation; `false` (not an
    /// error) when federation is disabled entirely.
    pub async fn is_federation_member(&self, host: &str) -> bool {
        match &self.federation {
            Some(manager) => manager.is_member(host).await,
            None => false,
        }
    }
}
