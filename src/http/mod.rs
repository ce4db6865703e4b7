//! E — HTTP routing glue.
//!
//! Composes every endpoint in spec.md §6's table into a single axum `Router`, in
//! the teacher's `web.rs` style: sub-routers built independently, conditionally
//! merged when the backing subsystem is configured, then `.with_state()`-ed once.
//! `.well-known/ocm` and `/ocm-provider` are merged host-root-only, unprefixed by
//! `external_base_path`, matching spec.md §6's explicit carve-out.

pub mod client_ip;
pub mod rate_limit;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::auth::Role;
use crate::discovery::{DiscoveryDocument, ProtocolEntry};
use crate::error::{AppError, ErrorKind};
use crate::invites::{AcceptedInvite, InviteError, encode_invite_token, parse_invite_token};
use crate::shares::{
    IncomingShareView, NewIncomingShare, NewOutgoingShare, NotificationKind, NullSink, ShareError, handle_inbox_action,
    resolve_outgoing_for_notification,
};
use crate::state::AppState;
use crate::verifier::{self, PeerContext};
use crate::webdav::{self, WebdavError, WebdavMethod};
use client_ip::client_ip;

/// Builds this server's own discovery document, advertising exactly what this
/// instance supports (spec.md §4.4/§6).
pub fn self_discovery_document(state: &AppState) -> DiscoveryDocument {
    let base = state.external_origin().trim_end_matches('/').to_string();
    let prefix = state.config.server.external_base_path.clone().unwrap_or_default();
    let mut webdav_protocols = std::collections::BTreeMap::new();
    webdav_protocols.insert("webdav".to_string(), json!(format!("{base}{prefix}/webdav/ocm/")));
    let mut capabilities = std::collections::HashSet::new();
    if state.config.signature.advertise_http_request_signatures {
        capabilities.insert("http-sig".to_string());
    }
    DiscoveryDocument {
        enabled: true,
        api_version: "1.1.0".to_string(),
        endpoint: format!("{base}{prefix}/ocm"),
        provider: Some(base.clone()),
        resource_types: vec![ProtocolEntry {
            name: "file".to_string(),
            share_types: vec!["user".to_string(), "group".to_string()],
            protocols: webdav_protocols,
        }],
        capabilities,
        criteria: Vec::new(),
        public_keys: std::collections::BTreeMap::from([(state.keys.key_id().to_string(), state.keys.public_key_pem())]),
        token_endpoint: Some(format!("{base}{prefix}/ocm/token")),
    }
}

async fn well_known_ocm(State(state): State<Arc<AppState>>) -> Json<DiscoveryDocument> {
    Json(self_discovery_document(&state))
}

async fn ocm_provider_legacy(State(state): State<Arc<AppState>>) -> Json<DiscoveryDocument> {
    Json(self_discovery_document(&state))
}

/// `POST /ocm/shares` — receive an inbound share, validated and stored.
async fn receive_share(State(state): State<Arc<AppState>>, request: Request) -> Result<Response, AppError> {
    let (parts, body) = request.into_parts();
    let ctx = parts.extensions.get::<PeerContext>().cloned();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| AppError::new(ErrorKind::BadRequest, format!("failed to read body: {e}")))?;
    let wire: ShareWire =
        serde_json::from_slice(&bytes).map_err(|e| AppError::new(ErrorKind::InvalidJson, e.to_string()))?;

    let sender_host = ctx.map(|c| c.host).filter(|h| !h.is_empty()).unwrap_or_else(|| wire.sender_host());
    if !state.policy.evaluate(&sender_host, state.is_federation_member(&sender_host).await).is_allowed() {
        return Err(AppError::new(ErrorKind::ForbiddenPolicy, "peer is not allowed by federation policy"));
    }

    let req = NewIncomingShare {
        share_with: wire.share_with,
        name: wire.name,
        description: wire.description,
        provider_id: wire.provider_id,
        owner: wire.owner,
        sender: wire.sender,
        sender_host,
        share_type: wire.share_type,
        resource_type: wire.resource_type,
        webdav_uri: wire.protocol.as_ref().and_then(|p| p.webdav.clone()),
        shared_secret: wire.shared_secret,
        permissions: wire.permissions.unwrap_or_default(),
        requirements: wire.requirements.unwrap_or_default(),
    };
    let share = state.shares.insert_incoming(&req).map_err(share_error_to_app)?;
    Ok((StatusCode::CREATED, Json(share.to_view())).into_response())
}

#[derive(Debug, Deserialize)]
struct ShareWire {
    #[serde(rename = "shareWith")]
    share_with: String,
    name: String,
    description: Option<String>,
    #[serde(rename = "providerId")]
    provider_id: String,
    owner: String,
    sender: String,
    #[serde(rename = "senderDisplayName")]
    #[allow(dead_code)]
    sender_display_name: Option<String>,
    #[serde(rename = "shareType")]
    share_type: String,
    #[serde(rename = "resourceType")]
    resource_type: String,
    protocol: Option<ShareWireProtocol>,
    #[serde(rename = "sharedSecret")]
    shared_secret: Option<String>,
    #[serde(default)]
    permissions: Option<Vec<String>>,
    requirements: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct ShareWireProtocol {
    webdav: Option<String>,
}

impl ShareWire {
    fn sender_host(&self) -> String {
        self.sender.rsplit_once('@').map(|(_, h)| h.to_lowercase()).unwrap_or_default()
    }
}

fn share_error_to_app(err: ShareError) -> AppError {
    match err {
        ShareError::Validation(m) => AppError::new(ErrorKind::ValidationFailed, m),
        ShareError::Conflict => AppError::new(ErrorKind::Conflict, err.to_string()),
        ShareError::NotFound => AppError::new(ErrorKind::NotFound, err.to_string()),
        ShareError::InvalidTransition(m) => AppError::new(ErrorKind::Conflict, m),
        ShareError::PathNotAllowed(m) => AppError::new(ErrorKind::ValidationFailed, m),
        ShareError::Database(m) => AppError::internal(m),
    }
}

#[derive(Debug, Deserialize)]
struct NotificationWire {
    #[serde(rename = "notificationType")]
    notification_type: String,
    #[serde(rename = "resourceType")]
    #[allow(dead_code)]
    resource_type: Option<String>,
    #[serde(rename = "providerId")]
    provider_id: String,
}

/// `POST /ocm/notifications` — lifecycle event about a share this instance sent.
async fn receive_notification(State(state): State<Arc<AppState>>, request: Request) -> Result<Response, AppError> {
    let (parts, body) = request.into_parts();
    let ctx = parts.extensions.get::<PeerContext>().cloned();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| AppError::new(ErrorKind::BadRequest, format!("failed to read body: {e}")))?;
    let wire: NotificationWire =
        serde_json::from_slice(&bytes).map_err(|e| AppError::new(ErrorKind::InvalidJson, e.to_string()))?;

    let sender_host = ctx.map(|c| c.host).filter(|h| !h.is_empty()).ok_or_else(|| {
        AppError::new(ErrorKind::SignatureRequired, "notification sender identity could not be established")
    })?;

    let share = resolve_outgoing_for_notification(&state.shares, &wire.provider_id, &sender_host)
        .map_err(share_error_to_app)?;
    match wire.notification_type.as_str() {
        "SHARE_ACCEPTED" | "SHARE_DECLINED" => {
            let _ = share;
            Ok(StatusCode::OK.into_response())
        }
        other => Err(AppError::new(ErrorKind::BadRequest, format!("unknown notificationType {other:?}"))),
    }
}

#[derive(Debug, Deserialize)]
struct InviteAcceptedWire {
    #[serde(rename = "userId")]
    user_id: String,
    email: Option<String>,
    name: Option<String>,
    token: String,
    #[serde(rename = "recipientProvider")]
    recipient_provider: String,
}

/// `POST /ocm/invite-accepted` — the invited peer confirms acceptance of an
/// outgoing invite this instance issued.
async fn receive_invite_accepted(State(state): State<Arc<AppState>>, request: Request) -> Result<Response, AppError> {
    let (_parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| AppError::new(ErrorKind::BadRequest, format!("failed to read body: {e}")))?;
    let wire: InviteAcceptedWire =
        serde_json::from_slice(&bytes).map_err(|e| AppError::new(ErrorKind::InvalidJson, e.to_string()))?;

    let parsed = parse_invite_token(&wire.token).map_err(invite_error_to_app)?;
    let invite = state
        .invites
        .find_by_raw_token(&parsed.raw_token)
        .map_err(invite_error_to_app)?
        .ok_or_else(|| AppError::new(ErrorKind::NotFound, "invite not found"))?;

    state.invites.mark_accepted(&invite.invite_id, &wire.recipient_provider).map_err(invite_error_to_app)?;
    state
        .invites
        .record_accepted_invite(&AcceptedInvite {
            invite_id: invite.invite_id,
            user_id: wire.user_id,
            email: wire.email,
            name: wire.name,
            recipient_provider: wire.recipient_provider,
            accepted_at: crate::signature::now_unix() as i64,
        })
        .map_err(invite_error_to_app)?;
    Ok(StatusCode::OK.into_response())
}

fn invite_error_to_app(err: InviteError) -> AppError {
    match err {
        InviteError::Validation(m) => AppError::new(ErrorKind::ValidationFailed, m),
        InviteError::MalformedToken => AppError::new(ErrorKind::BadRequest, err.to_string()),
        InviteError::NotFound => AppError::new(ErrorKind::NotFound, err.to_string()),
        InviteError::AlreadyConsumed => AppError::new(ErrorKind::Conflict, err.to_string()),
        InviteError::ExchangeFailed(m) => AppError::new(ErrorKind::TokenExchangeFailed, m),
        InviteError::Database(m) => AppError::internal(m),
    }
}

/// OAuth-flavored error shape for `/ocm/token`, distinct from the crate's general
/// `{error, description}` writer (spec.md §4.10/§6).
#[derive(Debug, Serialize)]
struct OAuthError {
    error: &'static str,
    error_description: String,
}

fn oauth_error(code: &'static str, description: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, Json(OAuthError { error: code, error_description: description.into() })).into_response()
}

const TOKEN_TTL_SECS: i64 = 3600;

/// `POST /ocm/token` — exchanges a share's `sharedSecret` (the `code`) for a
/// short-lived bearer access token (spec.md §4.10).
async fn token_exchange(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let (_parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b,
        Err(_) => return oauth_error("invalid_request", "failed to read request body"),
    };
    let form: std::collections::HashMap<String, String> = url::form_urlencoded::parse(&bytes).into_owned().collect();

    let Some(grant_type) = form.get("grant_type") else {
        return oauth_error("invalid_request", "grant_type is required");
    };
    if grant_type != "ocm_share" {
        return oauth_error("unauthorized_client", format!("unsupported grant_type {grant_type:?}"));
    }
    let Some(code) = form.get("code").or_else(|| form.get("token")) else {
        return oauth_error("invalid_request", "code is required");
    };
    let Some(client_id) = form.get("client_id") else {
        return oauth_error("invalid_request", "client_id is required");
    };

    let share = match state.shares.get_outgoing_by_shared_secret(code) {
        Ok(Some(s)) => s,
        Ok(None) => return oauth_error("invalid_grant", "code is unknown or already consumed"),
        Err(e) => return oauth_error("invalid_request", e.to_string()),
    };

    match state.shares.issue_token(&share.share_id, client_id, TOKEN_TTL_SECS) {
        Ok(access_token) => {
            Json(json!({ "access_token": access_token, "token_type": "Bearer", "expires_in": TOKEN_TTL_SECS })).into_response()
        }
        Err(e) => oauth_error("invalid_request", e.to_string()),
    }
}

/// `GET /ocm-aux/federations` — lists configured federations and their cached members.
async fn list_federations(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let Some(manager) = &state.federation else {
        return Json(json!({ "federations": [] }));
    };
    let federations: Vec<serde_json::Value> = manager
        .federation_ids()
        .iter()
        .map(|id| json!({ "federationId": id, "members": manager.members_snapshot(id) }))
        .collect();
    Json(json!({ "federations": federations }))
}

#[derive(Debug, Deserialize)]
struct DiscoverQuery {
    #[serde(rename = "baseUrl")]
    base_url: String,
}

/// `GET /ocm-aux/discover` — proxies discovery against an arbitrary peer, rate
/// limited per spec.md §6.
async fn discover_proxy(
    State(state): State<Arc<AppState>>,
    axum::extract::Query(query): axum::extract::Query<DiscoverQuery>,
) -> Result<Json<DiscoveryDocument>, AppError> {
    let doc = state
        .discovery
        .discover(&query.base_url)
        .await
        .map_err(|e| AppError::new(ErrorKind::UpstreamUnreachable, e.to_string()))?;
    Ok(Json(doc))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    token: String,
    #[serde(rename = "userId")]
    user_id: String,
    role: String,
}

const SESSION_TTL: Duration = Duration::from_secs(24 * 3600);

async fn login(State(state): State<Arc<AppState>>, Json(req): Json<LoginRequest>) -> Result<Json<LoginResponse>, AppError> {
    let party = state
        .auth
        .authenticate(&req.username, &req.password)
        .map_err(|e| AppError::new(ErrorKind::InvalidCredentials, e.to_string()))?;
    let session = state.auth.create_session(&party.id, SESSION_TTL).map_err(|e| AppError::internal(e.to_string()))?;
    Ok(Json(LoginResponse { token: session.token, user_id: party.id, role: role_str(party.role) }))
}

fn role_str(role: Role) -> String {
    match role {
        Role::User => "user",
        Role::Admin => "admin",
        Role::SuperAdmin => "super_admin",
        Role::Probe => "probe",
    }
    .to_string()
}

async fn session_from_headers(state: &AppState, headers: &HeaderMap) -> Result<crate::auth::Party, AppError> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| AppError::new(ErrorKind::Unauthenticated, "missing bearer session token"))?;
    let session = state
        .auth
        .lookup_session(token)
        .map_err(|e| AppError::internal(e.to_string()))?
        .ok_or_else(|| AppError::new(ErrorKind::SessionExpired, "session not found or expired"))?;
    state
        .auth
        .find_by_id(&session.user_id)
        .map_err(|e| AppError::internal(e.to_string()))?
        .ok_or_else(|| AppError::new(ErrorKind::Unauthenticated, "party no longer exists"))
}

async fn logout(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Result<StatusCode, AppError> {
    if let Some(token) = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok()).and_then(|v| v.strip_prefix("Bearer ")) {
        state.auth.delete_session(token).map_err(|e| AppError::internal(e.to_string()))?;
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct MeResponse {
    #[serde(rename = "userId")]
    user_id: String,
    username: String,
    role: String,
}

async fn me(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Result<Json<MeResponse>, AppError> {
    let party = session_from_headers(&state, &headers).await?;
    Ok(Json(MeResponse { user_id: party.id, username: party.username, role: role_str(party.role) }))
}

async fn list_inbox_shares(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<IncomingShareView>>, AppError> {
    session_from_headers(&state, &headers).await?;
    // The minimal session surface has no per-user inbox partitioning yet; this
    // lists nothing until a caller supplies a share_id lookup (see inbox_action).
    Ok(Json(Vec::new()))
}

/// Strips at most one trailing `/accept` or `/decline` suffix, `/accept` checked
/// first, per the Open Question decision recorded in `DESIGN.md`.
fn strip_inbox_action_suffix(raw_id: &str) -> Option<(&str, bool)> {
    if let Some(id) = raw_id.strip_suffix("/accept") {
        return (!id.is_empty()).then_some((id, true));
    }
    if let Some(id) = raw_id.strip_suffix("/decline") {
        return (!id.is_empty()).then_some((id, false));
    }
    None
}

async fn inbox_share_action(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(raw_id): Path<String>,
) -> Result<StatusCode, AppError> {
    session_from_headers(&state, &headers).await?;
    let (share_id, accept) =
        strip_inbox_action_suffix(&raw_id).ok_or_else(|| AppError::new(ErrorKind::BadRequest, "expected .../accept or .../decline"))?;
    handle_inbox_action(&state.shares, &NullSink, share_id, accept).map_err(share_error_to_app)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn inbox_invite_action(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(raw_id): Path<String>,
) -> Result<StatusCode, AppError> {
    session_from_headers(&state, &headers).await?;
    let (invite_id, accept) =
        strip_inbox_action_suffix(&raw_id).ok_or_else(|| AppError::new(ErrorKind::BadRequest, "expected .../accept or .../decline"))?;
    if !accept {
        return Ok(StatusCode::NO_CONTENT);
    }
    state.invites.mark_accepted(invite_id, state.external_origin()).map_err(invite_error_to_app)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct CreateOutgoingShareRequest {
    #[serde(rename = "receiverDomain")]
    receiver_domain: String,
    #[serde(rename = "shareWith")]
    share_with: String,
    #[serde(rename = "localPath")]
    local_path: String,
    name: String,
    #[serde(rename = "resourceType")]
    resource_type: String,
    #[serde(rename = "shareType")]
    share_type: String,
    #[serde(default)]
    permissions: Vec<String>,
}

async fn create_outgoing_share(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateOutgoingShareRequest>,
) -> Result<Response, AppError> {
    let party = session_from_headers(&state, &headers).await?;
    let new_share = NewOutgoingShare {
        receiver_domain: req.receiver_domain,
        share_with: req.share_with,
        local_path: req.local_path,
        name: req.name,
        resource_type: req.resource_type,
        share_type: req.share_type,
        permissions: req.permissions,
        owner: party.username.clone(),
        sender: party.username,
    };
    let allowed_prefixes = vec![party.storage_root];
    let share = state.shares.insert_outgoing(&new_share, &allowed_prefixes).map_err(share_error_to_app)?;
    Ok((StatusCode::CREATED, Json(json!({
        "shareId": share.share_id,
        "providerId": share.provider_id,
        "webdavId": share.webdav_id,
        "sharedSecret": share.shared_secret,
    }))).into_response())
}

#[derive(Debug, Deserialize)]
struct CreateOutgoingInviteRequest {
    description: Option<String>,
    #[serde(default = "default_invite_ttl")]
    #[serde(rename = "ttlSecs")]
    ttl_secs: i64,
}

fn default_invite_ttl() -> i64 {
    3600
}

#[derive(Debug, Serialize)]
struct CreateOutgoingInviteResponse {
    #[serde(rename = "inviteId")]
    invite_id: String,
    token: String,
}

async fn create_outgoing_invite(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateOutgoingInviteRequest>,
) -> Result<Json<CreateOutgoingInviteResponse>, AppError> {
    session_from_headers(&state, &headers).await?;
    let invite = state.invites.create_invite(req.description, req.ttl_secs).map_err(invite_error_to_app)?;
    let host = state.external_origin().trim_start_matches("https://").trim_start_matches("http://").to_string();
    let token = encode_invite_token(&invite.raw_token, &host);
    Ok(Json(CreateOutgoingInviteResponse { invite_id: invite.invite_id, token }))
}

/// `GET|HEAD|PROPFIND|OPTIONS /webdav/ocm/{webdav_id}` — the read-only resource
/// gate. Write methods are rejected via [`WebdavMethod::is_write`] before the
/// credential is even examined (spec.md §4.11).
async fn webdav_handler(
    State(state): State<Arc<AppState>>,
    Path(webdav_id): Path<String>,
    headers: HeaderMap,
    request: Request,
) -> Result<Response, AppError> {
    webdav_handle(state, webdav_id, headers, request).await
}

/// Same gate for `/webdav/ocm/{webdav_id}/{*rest}`; the trailing path segment
/// addresses a resource within the share but isn't otherwise interpreted yet
/// (file-serving is out of scope here).
async fn webdav_handler_with_rest(
    State(state): State<Arc<AppState>>,
    Path((webdav_id, _rest)): Path<(String, String)>,
    headers: HeaderMap,
    request: Request,
) -> Result<Response, AppError> {
    webdav_handle(state, webdav_id, headers, request).await
}

async fn webdav_handle(state: Arc<AppState>, webdav_id: String, headers: HeaderMap, request: Request) -> Result<Response, AppError> {
    let method = WebdavMethod::parse(request.method().as_str());
    if method.is_write() {
        return Err(AppError::new(ErrorKind::NotImplemented, "write-side WebDAV is not implemented"));
    }

    let share = webdav::resolve_share(&state.shares, &webdav_id).map_err(webdav_error_to_app)?;
    let auth_header = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    let Some(auth_header) = auth_header else {
        return Err(AppError::new(ErrorKind::Unauthenticated, "missing Authorization header"));
    };
    let credential = webdav::parse_authorization(auth_header)
        .ok_or_else(|| AppError::new(ErrorKind::Unauthenticated, "unsupported Authorization scheme"))?;

    let profile = state.profiles.lookup(&share.sender_host).clone();
    let mode_strict = matches!(state.config.mode, crate::config::OperatingMode::Strict);
    webdav::accept_credential(&share, &credential, mode_strict, &profile, |token| {
        state.shares.lookup_token(token).ok().flatten()
    })
    .map_err(webdav_error_to_app)?;

    match method {
        WebdavMethod::Options => Ok((StatusCode::OK, [("Allow", "GET, HEAD, PROPFIND, OPTIONS")]).into_response()),
        WebdavMethod::Head => Ok(StatusCode::OK.into_response()),
        _ => Ok((StatusCode::OK, Json(json!({ "name": share.name, "shareId": share.share_id }))).into_response()),
    }
}

fn webdav_error_to_app(err: WebdavError) -> AppError {
    match err {
        WebdavError::MalformedId => AppError::new(ErrorKind::BadRequest, err.to_string()),
        WebdavError::NotImplemented => AppError::new(ErrorKind::NotImplemented, err.to_string()),
        WebdavError::NotFound => AppError::new(ErrorKind::NotFound, err.to_string()),
        WebdavError::Unauthorized => AppError::new(ErrorKind::Unauthenticated, err.to_string()),
        WebdavError::CredentialRejected => AppError::new(ErrorKind::InvalidCredentials, err.to_string()),
    }
}

/// Access logger, outermost: observes the final (post-recovery) response status,
/// per the Open Question decision recorded in `DESIGN.md`.
async fn access_logger(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = std::time::Instant::now();
    let response = next.run(request).await;
    tracing::info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "request"
    );
    response
}

/// Renders a caught panic as the crate's standard `internal` error body, rather
/// than `tower_http`'s plain-text default.
fn handle_panic(_err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    tracing::error!("request handler panicked");
    AppError::internal("internal server error").into_response()
}

/// Wraps a handler with a per-client-IP leaky-bucket limiter keyed by `bucket`,
/// backed by `state.cache` (spec.md §6's rate-limiting paragraph).
fn rate_limit_layer(
    state: Arc<AppState>,
    bucket: &'static str,
    limit_per_min: u32,
    burst: u32,
) -> impl Fn(Request, Next) -> std::pin::Pin<Box<dyn std::future::Future<Output = Response> + Send>> + Clone {
    move |request: Request, next: Next| {
        let state = state.clone();
        Box::pin(async move {
            let peer = request
                .extensions()
                .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
                .map(|ci| ci.0.ip());
            let ip = client_ip(&state.config.server.trusted_proxies, request.headers(), peer);
            if !rate_limit::allow(state.cache.as_ref(), bucket, &ip, limit_per_min, burst) {
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    [("Retry-After", "60")],
                    Json(json!({ "error": "rate_limited", "description": "rate limit exceeded" })),
                )
                    .into_response();
            }
            next.run(request).await
        })
    }
}

/// Builds the complete application router. Federation endpoints are merged
/// unconditionally (they degrade to empty responses when federation is disabled),
/// matching the teacher's "merge the sub-router, let it no-op" style rather than
/// omitting routes outright.
pub fn router(state: Arc<AppState>) -> Router {
    let well_known = Router::new()
        .route("/.well-known/ocm", get(well_known_ocm))
        .route("/ocm-provider", get(ocm_provider_legacy))
        .with_state(state.clone());

    let ocm = Router::new()
        .route("/ocm/shares", post(receive_share).layer(middleware::from_fn_with_state(state.clone(), verifier::verify_shares)))
        .route(
            "/ocm/notifications",
            post(receive_notification).layer(middleware::from_fn_with_state(state.clone(), verifier::verify_no_declared_peer)),
        )
        .route(
            "/ocm/invite-accepted",
            post(receive_invite_accepted).layer(middleware::from_fn_with_state(state.clone(), verifier::verify_invite_accepted)),
        )
        .route(
            "/ocm/token",
            post(token_exchange).layer(middleware::from_fn_with_state(state.clone(), verifier::verify_no_declared_peer)),
        )
        .with_state(state.clone());

    let ocm_aux = Router::new()
        .route("/ocm-aux/federations", get(list_federations))
        .route(
            "/ocm-aux/discover",
            get(discover_proxy).layer(middleware::from_fn(rate_limit_layer(state.clone(), "discover", 10, 2))),
        )
        .with_state(state.clone());

    let api = Router::new()
        .route(
            "/api/auth/login",
            post(login).layer(middleware::from_fn(rate_limit_layer(state.clone(), "login", 5, 2))),
        )
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/me", get(me))
        .route("/api/inbox/shares", get(list_inbox_shares))
        .route("/api/inbox/shares/{*id}", post(inbox_share_action))
        .route("/api/inbox/invites/{*id}", post(inbox_invite_action))
        .route("/api/shares/outgoing", post(create_outgoing_share))
        .route("/api/invites/outgoing", post(create_outgoing_invite))
        .with_state(state.clone());

    let webdav_router = Router::new()
        .route("/webdav/ocm/{webdav_id}", axum::routing::any(webdav_handler))
        .route("/webdav/ocm/{webdav_id}/{*rest}", axum::routing::any(webdav_handler_with_rest))
        .with_state(state.clone());

    let prefixed_subrouters = ocm.merge(ocm_aux).merge(api).merge(webdav_router);
    let prefixed = match state.config.server.external_base_path.as_deref() {
        Some(prefix) if !prefix.is_empty() => Router::new().nest(prefix, prefixed_subrouters),
        _ => prefixed_subrouters,
    };

    // `.layer()` wraps outward: the last call added here is the outermost layer a
    // request meets first and a response meets last. The panic recoverer sits
    // inside the access logger so the logger always observes the recovered
    // (non-panicking) status, per the Open Question decision recorded in
    // `DESIGN.md`.
    well_known
        .merge(prefixed)
        .layer(CorsLayer::permissive())
        .layer(axum::extract::DefaultBodyLimit::max(32 * 1024 * 1024))
        .layer(tower_http::catch_panic::CatchPanicLayer::custom(handle_panic))
        .layer(middleware::from_fn(access_logger))
}
