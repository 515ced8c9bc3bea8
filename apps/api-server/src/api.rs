//! HTTP surface: routes, request/response bodies and handlers.
//!
//! Authenticated routes read the caller's key from the `Authorization` header
//! on every request; `/api/v1/keys/*` additionally requires an admin key.
//! `GET /:shortened` is public and records the visit.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use domain::keys::{redact, KeyStore, KeyUpdate};
use domain::service::{LinkDetail, LinkService, LinkUpdate, ShortenRequest};
use domain::token::RandomTokenGenerator;
use domain::{ApiKey, AuthContext, Link, LinkVisit, SystemClock, Visitor};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ApiError;
use crate::store::SharedStore;

pub type Keys = KeyStore<SharedStore, SystemClock>;
pub type Links = LinkService<SharedStore, SharedStore, RandomTokenGenerator, SystemClock>;

#[derive(Clone)]
pub struct AppState {
    pub keys: Arc<Keys>,
    pub links: Arc<Links>,
}

impl AppState {
    pub fn new(store: SharedStore, site_host: Option<String>) -> Self {
        Self {
            keys: Arc::new(KeyStore::new(store.clone(), SystemClock)),
            links: Arc::new(
                LinkService::new(store.clone(), store, RandomTokenGenerator, SystemClock)
                    .with_site_host(site_host),
            ),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let links = Router::new()
        .route("/shorten", post(shorten))
        .route("/retrieve", post(retrieve))
        .route("/delete", post(delete_link))
        .route("/update", post(update_link))
        .route("/visits", post(link_visits))
        .route("/retrieve-all-by-key", post(retrieve_all_by_key))
        .route("/retrieve-all", get(retrieve_all));

    let keys = Router::new()
        .route("/validate", post(validate_key))
        .route("/generate", post(generate_key))
        .route("/update", post(update_key))
        .route("/delete", post(delete_key))
        .route("/retrieve-all", get(retrieve_all_keys));

    Router::new()
        .route("/", get(home))
        .route("/api", get(api_home))
        .route("/api/health", get(health))
        .nest("/api/v1/links", links)
        .nest("/api/v1/keys", keys)
        .route("/:shortened", get(redirect))
        .fallback(not_found)
        .with_state(state)
}

// ============================================================================
// Request / response bodies
// ============================================================================

#[derive(Deserialize)]
struct ShortenReq {
    #[serde(default)]
    custom_url: Option<String>,
    #[serde(default)]
    redirect_to: String,
    #[serde(default)]
    expires_at: Option<String>,
}

#[derive(Serialize)]
struct ShortenOut {
    shortened: String,
}

#[derive(Deserialize)]
struct ShortenedReq {
    #[serde(default)]
    shortened: String,
}

#[derive(Deserialize)]
struct UpdateLinkReq {
    #[serde(default)]
    shortened: String,
    #[serde(default)]
    redirect_to: Option<String>,
    #[serde(default)]
    new_shortened: Option<String>,
    #[serde(default)]
    expires_at: Option<String>,
    #[serde(default)]
    is_active: Option<bool>,
}

#[derive(Deserialize)]
struct KeyReq {
    #[serde(default)]
    key: String,
}

#[derive(Deserialize)]
struct GenerateKeyReq {
    #[serde(default)]
    name: String,
    #[serde(default)]
    is_admin: bool,
}

#[derive(Deserialize)]
struct UpdateKeyReq {
    #[serde(default)]
    key: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    is_admin: Option<bool>,
    #[serde(default)]
    is_active: Option<bool>,
}

#[derive(Deserialize)]
struct DeleteKeyReq {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Serialize)]
struct OwnerOut {
    key: String,
    name: String,
}

#[derive(Serialize)]
struct LinkOut {
    id: String,
    redirect_to: String,
    shortened: String,
    expires_at: Option<String>,
    created_at: String,
    updated_at: String,
    created_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    secret_key: Option<OwnerOut>,
    visits: u64,
    last_visited_at: Option<String>,
    is_active: bool,
}

#[derive(Serialize)]
struct LinksOut {
    message: &'static str,
    links: Vec<LinkOut>,
}

#[derive(Serialize)]
struct VisitOut {
    id: String,
    visited_at: String,
    user_agent: Option<String>,
    ip_address: Option<String>,
    referrer: Option<String>,
}

#[derive(Serialize)]
struct VisitsOut {
    shortened: String,
    visits: Vec<VisitOut>,
}

#[derive(Serialize)]
struct KeyOut {
    key: String,
    name: String,
    created_at: String,
    updated_at: String,
    last_used_at: Option<String>,
    is_active: bool,
    is_admin: bool,
}

#[derive(Serialize)]
struct KeyMessageOut {
    message: &'static str,
    key: KeyOut,
}

#[derive(Serialize)]
struct KeysOut {
    message: &'static str,
    keys: Vec<KeyOut>,
}

fn link_to_out(link: Link, owner: Option<OwnerOut>) -> LinkOut {
    LinkOut {
        id: link.id.to_string(),
        redirect_to: link.redirect_to,
        shortened: link.shortened.to_string(),
        expires_at: http_common::optional_rfc3339(link.expires_at),
        created_at: http_common::system_time_to_rfc3339(link.created_at),
        updated_at: http_common::system_time_to_rfc3339(link.updated_at),
        created_by: link.created_by.to_string(),
        secret_key: owner,
        visits: link.visits,
        last_visited_at: http_common::optional_rfc3339(link.last_visited_at),
        is_active: link.is_active,
    }
}

fn detail_to_out(detail: LinkDetail) -> LinkOut {
    let owner = detail.owner.map(|o| OwnerOut {
        key: o.key,
        name: o.name,
    });
    link_to_out(detail.link, owner)
}

fn visit_to_out(v: LinkVisit) -> VisitOut {
    VisitOut {
        id: v.id.to_string(),
        visited_at: http_common::system_time_to_rfc3339(v.visited_at),
        user_agent: v.user_agent,
        ip_address: v.ip_address,
        referrer: v.referrer,
    }
}

fn key_to_out(k: ApiKey) -> KeyOut {
    KeyOut {
        key: k.key,
        name: k.name,
        created_at: http_common::system_time_to_rfc3339(k.created_at),
        updated_at: http_common::system_time_to_rfc3339(k.updated_at),
        last_used_at: http_common::optional_rfc3339(k.last_used_at),
        is_active: k.is_active,
        is_admin: k.is_admin,
    }
}

// ============================================================================
// Auth and parsing helpers
// ============================================================================

fn header_str<'a>(headers: &'a HeaderMap, name: header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<AuthContext, ApiError> {
    let raw = header_str(headers, header::AUTHORIZATION)
        .and_then(http_common::api_key_from_authorization)
        .ok_or_else(|| ApiError::unauthorized("Authorization header required"))?;
    state.keys.authenticate(raw).map_err(|e| {
        warn!(key = %redact(raw), "rejected api key");
        ApiError::from(e)
    })
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<AuthContext, ApiError> {
    let ctx = authenticate(state, headers)?;
    ctx.require_admin()?;
    Ok(ctx)
}

/// Absent, `null` and `""` all mean "not supplied".
fn parse_time(raw: Option<String>) -> Result<Option<SystemTime>, ApiError> {
    match raw.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => http_common::parse_rfc3339(s)
            .map(Some)
            .map_err(|_| ApiError::bad_request("expires_at must be an RFC 3339 timestamp")),
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|v| !v.is_empty())
}

// ============================================================================
// Public routes
// ============================================================================

async fn home() -> impl IntoResponse {
    (StatusCode::FOUND, [(header::LOCATION, "/not-found")])
}

async fn api_home() -> impl IntoResponse {
    Json(http_common::json_message("URL shortener API"))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(http_common::json_err("not_found")))
}

async fn redirect(
    State(state): State<AppState>,
    Path(shortened): Path<String>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Result<Response, ApiError> {
    let visitor = Visitor {
        user_agent: header_str(&headers, header::USER_AGENT).map(str::to_string),
        ip_address: http_common::client_ip(
            headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()),
            peer.map(|ConnectInfo(addr)| addr),
        ),
        referrer: header_str(&headers, header::REFERER).map(str::to_string),
    };

    match state.links.resolve_redirect(&shortened, visitor) {
        Ok(target) => {
            info!(shortened = %shortened, redirect_to = %target, "resolve ok");
            Ok((StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, target)]).into_response())
        }
        Err(e) => {
            warn!(shortened = %shortened, err = %e, "resolve failed");
            Err(e.into())
        }
    }
}

// ============================================================================
// Link routes
// ============================================================================

async fn shorten(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ShortenReq>, JsonRejection>,
) -> Result<Json<ShortenOut>, ApiError> {
    let ctx = authenticate(&state, &headers)?;
    let Json(req) = body?;
    let token = state.links.shorten(
        &ctx,
        ShortenRequest {
            custom: non_empty(req.custom_url),
            redirect_to: req.redirect_to,
            expires_at: parse_time(req.expires_at)?,
        },
    )?;
    info!(shortened = %token, owner = %ctx.name, "link created");
    Ok(Json(ShortenOut {
        shortened: token.to_string(),
    }))
}

async fn retrieve(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ShortenedReq>, JsonRejection>,
) -> Result<Json<LinkOut>, ApiError> {
    authenticate(&state, &headers)?;
    let Json(req) = body?;
    Ok(Json(detail_to_out(state.links.retrieve(&req.shortened)?)))
}

async fn delete_link(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ShortenedReq>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = authenticate(&state, &headers)?;
    let Json(req) = body?;
    state.links.delete(&ctx, &req.shortened)?;
    info!(shortened = %req.shortened, by = %ctx.name, "link deleted");
    Ok(Json(http_common::json_message("Link deleted successfully")))
}

async fn update_link(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<UpdateLinkReq>, JsonRejection>,
) -> Result<Json<LinkOut>, ApiError> {
    let ctx = authenticate(&state, &headers)?;
    let Json(req) = body?;
    let fields = LinkUpdate {
        redirect_to: req.redirect_to.into(),
        shortened: non_empty(req.new_shortened).into(),
        expires_at: parse_time(req.expires_at)?.into(),
        is_active: req.is_active.into(),
    };
    let link = state.links.update(&ctx, &req.shortened, fields)?;
    info!(shortened = %req.shortened, now = %link.shortened, by = %ctx.name, "link updated");
    Ok(Json(link_to_out(link, None)))
}

async fn link_visits(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ShortenedReq>, JsonRejection>,
) -> Result<Json<VisitsOut>, ApiError> {
    let ctx = authenticate(&state, &headers)?;
    let Json(req) = body?;
    let visits = state.links.visits(&ctx, &req.shortened)?;
    Ok(Json(VisitsOut {
        shortened: req.shortened,
        visits: visits.into_iter().map(visit_to_out).collect(),
    }))
}

async fn retrieve_all(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<LinksOut>, ApiError> {
    let ctx = authenticate(&state, &headers)?;
    let links = state.links.retrieve_all(&ctx)?;
    Ok(Json(LinksOut {
        message: "Links retrieved successfully",
        links: links.into_iter().map(detail_to_out).collect(),
    }))
}

async fn retrieve_all_by_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<KeyReq>, JsonRejection>,
) -> Result<Json<LinksOut>, ApiError> {
    let ctx = authenticate(&state, &headers)?;
    let Json(req) = body?;
    let links = state.links.retrieve_all_by_key(&ctx, &req.key)?;
    Ok(Json(LinksOut {
        message: "Links retrieved successfully",
        links: links.into_iter().map(detail_to_out).collect(),
    }))
}

// ============================================================================
// Key routes (admin only)
// ============================================================================

async fn validate_key(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<KeyMessageOut>, ApiError> {
    let ctx = require_admin(&state, &headers)?;
    let key = state.keys.find_by_key(&ctx.key)?;
    Ok(Json(KeyMessageOut {
        message: "Key validated successfully",
        key: key_to_out(key),
    }))
}

async fn generate_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<GenerateKeyReq>, JsonRejection>,
) -> Result<Json<KeyMessageOut>, ApiError> {
    let ctx = require_admin(&state, &headers)?;
    let Json(req) = body?;
    let key = state.keys.create(&req.name, req.is_admin)?;
    info!(name = %key.name, is_admin = key.is_admin, by = %ctx.name, "key generated");
    Ok(Json(KeyMessageOut {
        message: "Key generated successfully",
        key: key_to_out(key),
    }))
}

async fn update_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<UpdateKeyReq>, JsonRejection>,
) -> Result<Json<KeyMessageOut>, ApiError> {
    let ctx = require_admin(&state, &headers)?;
    let Json(req) = body?;
    if req.key.is_empty() {
        return Err(ApiError::bad_request("key required"));
    }
    let fields = KeyUpdate {
        name: non_empty(req.name).into(),
        is_active: req.is_active.into(),
        is_admin: req.is_admin.into(),
    };
    let key = state.keys.update(&req.key, fields)?;
    info!(name = %key.name, by = %ctx.name, "key updated");
    Ok(Json(KeyMessageOut {
        message: "Key updated successfully",
        key: key_to_out(key),
    }))
}

async fn delete_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<DeleteKeyReq>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = require_admin(&state, &headers)?;
    let Json(req) = body?;
    match (non_empty(req.key), non_empty(req.name)) {
        (Some(key), _) => {
            state.keys.delete(&key)?;
            info!(key = %redact(&key), by = %ctx.name, "key deleted");
        }
        (None, Some(name)) => {
            state.keys.delete_by_name(&name)?;
            info!(name = %name, by = %ctx.name, "key deleted");
        }
        (None, None) => return Err(ApiError::bad_request("key or name required")),
    }
    Ok(Json(http_common::json_message("Key deleted successfully")))
}

async fn retrieve_all_keys(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<KeysOut>, ApiError> {
    require_admin(&state, &headers)?;
    let keys = state.keys.list()?;
    Ok(Json(KeysOut {
        message: "Keys retrieved successfully",
        keys: keys.into_iter().map(key_to_out).collect(),
    }))
}
