//! Process entry point: tracing setup, CLI parsing, config load, store/state
//! construction, background sweepers, router assembly, listener bind. Mirrors the
//! teacher's `main.rs` — a thin wiring shell with no protocol logic of its own.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use ocm_federation::auth::{AuthStore, Role};
use ocm_federation::cache::{FullCache, MemoryCache};
use ocm_federation::config::{Config, FlagOverlay};
use ocm_federation::discovery::DiscoveryClient;
use ocm_federation::federation::FederationManager;
use ocm_federation::http;
use ocm_federation::http_client::SafeHttpClient;
use ocm_federation::invites::InviteStore;
use ocm_federation::policy::PolicyState;
use ocm_federation::shares::ShareStore;
use ocm_federation::signature::KeyManager;
use ocm_federation::state::AppState;

/// CLI flags, each optional so the config-file/preset overlay chain owns every
/// default (spec.md §4.12's layered overlay).
#[derive(Debug, Parser)]
#[command(name = "ocm-federation-server", about = "Open Cloud Mesh federation protocol server")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, env = "OCM_CONFIG")]
    config: Option<PathBuf>,
    /// Operating mode preset: strict, interop, or dev.
    #[arg(long, env = "OCM_MODE")]
    mode: Option<String>,
    /// Address to bind the HTTP(S) listener to.
    #[arg(long, env = "OCM_LISTEN_ADDR")]
    listen_addr: Option<String>,
    /// Path prefix every federation/API/webdav route is nested under.
    #[arg(long, env = "OCM_EXTERNAL_BASE_PATH")]
    external_base_path: Option<String>,
    /// Directory holding the SQLite stores.
    #[arg(long, env = "OCM_DATA_DIR")]
    data_dir: Option<PathBuf>,
    /// Path to the Ed25519 signing key (generated on first run if absent).
    #[arg(long, env = "OCM_KEY_PATH")]
    key_path: Option<PathBuf>,
}

impl Cli {
    fn into_overlay(self) -> FlagOverlay {
        FlagOverlay {
            config_path: self.config,
            mode: self.mode,
            listen_addr: self.listen_addr,
            external_base_path: self.external_base_path,
            data_dir: self.data_dir,
            key_path: self.key_path,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // rustls needs an explicit crypto provider selection.
    let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();

    let json_logs = std::env::var("OCM_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("ocm_federation=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let cli = Cli::parse();
    let config = Config::load(&cli.into_overlay()).context("failed to load configuration")?;
    tracing::info!(mode = ?config.mode, listen_addr = %config.server.listen_addr, "starting ocm-federation-server");

    std::fs::create_dir_all(&config.server.data_dir)
        .with_context(|| format!("failed to create data dir {}", config.server.data_dir.display()))?;

    let keys = KeyManager::load_or_generate(&config.server.key_path, &config.server.external_origin, "ocm-federation-server")
        .context("failed to load or generate signing key")?;

    let http_client = Arc::new(SafeHttpClient::new(config.outbound_http.clone()).context("failed to build outbound HTTP client")?);

    let memory_cache = Arc::new(MemoryCache::new(config.cache.default_ttl));
    let cache: Arc<dyn FullCache> = memory_cache.clone();
    ocm_federation::cache::spawn_sweeper(memory_cache, config.cache.sweep_interval);

    let discovery = DiscoveryClient::new(http_client.clone(), Some(cache.clone()), config.cache.default_ttl);

    let federation = if config.federation_enabled {
        let configs = config.load_federation_configs().context("failed to load federation config files")?;
        Some(Arc::new(FederationManager::new(configs, http_client.clone())))
    } else {
        None
    };

    let profiles = config.build_profile_registry();
    let policy = PolicyState {
        global_enforce: config.federation_policy.global_enforce,
        allow_list: config.federation_policy.allow_list.iter().cloned().collect(),
        deny_list: config.federation_policy.deny_list.iter().cloned().collect(),
        exempt_list: config.federation_policy.exempt_list.iter().cloned().collect(),
    };

    let shares_path = config.server.data_dir.join("shares.db").to_string_lossy().into_owned();
    let auth_path = config.server.data_dir.join("auth.db").to_string_lossy().into_owned();
    let invites_path = config.server.data_dir.join("invites.db").to_string_lossy().into_owned();
    let shares = ShareStore::open(&shares_path).context("failed to open share store")?;
    let auth = Arc::new(AuthStore::open(&auth_path).context("failed to open auth store")?);
    let invites = Arc::new(InviteStore::open(&invites_path).context("failed to open invite store")?);

    if let Some(bootstrap) = &config.server.bootstrap_admin {
        if auth.is_empty().context("failed to check auth store")? {
            tracing::info!(username = %bootstrap.username, "seeding bootstrap admin party");
            auth.create_party(
                &bootstrap.username,
                &bootstrap.username,
                "",
                &bootstrap.password,
                Role::SuperAdmin,
                "default",
                &config.server.data_dir.join(&bootstrap.username).display().to_string(),
                None,
            )
            .context("failed to seed bootstrap admin")?;
        }
    }

    ocm_federation::auth::spawn_purge_sweeper(auth.clone(), Duration::from_secs(300));

    {
        let invites = invites.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(300));
            loop {
                ticker.tick().await;
                match invites.purge_expired() {
                    Ok(n) if n > 0 => tracing::debug!(removed = n, "invite purge removed expired invites"),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "invite purge failed"),
                }
            }
        });
    }

    let state = Arc::new(AppState {
        config: config.clone(),
        keys,
        http: http_client,
        discovery,
        federation,
        profiles,
        policy,
        shares,
        auth,
        invites,
        cache,
    });

    let app = http::router(state);

    if config.tls.enabled {
        let cert_path = config.tls.cert_path.as_ref().context("tls.enabled requires tls.cert_path")?;
        let key_path = config.tls.key_path.as_ref().context("tls.enabled requires tls.key_path")?;
        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert_path, key_path)
            .await
            .context("failed to load TLS certificate/key")?;
        let addr: SocketAddr = config.server.listen_addr.parse().context("listen_addr must be a socket address for TLS")?;
        tracing::info!(%addr, "listening (TLS)");
        axum_server::bind_rustls(addr, tls_config)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .context("HTTPS server error")?;
    } else {
        let listener = tokio::net::TcpListener::bind(&config.server.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;
        tracing::info!(addr = %listener.local_addr()?, "listening");
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .context("HTTP server error")?;
    }

    Ok(())
}
