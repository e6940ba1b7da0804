/*
 * Cvassist - personal CV assistant backend
 * Copyright (C) 2025–2026 Pedro Monteiro <pedro@cvassist.dev>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Cvassist backend: the HTTP service behind a personal CV site.
//!
//! Exposes:
//! - `POST /api/v1/chat/ask`         — CV-persona chat proxy
//! - `POST /api/v1/contact/send`     — free-text contact intake
//! - `GET  /api/v1/contact/messages` — admin-gated message listing
//! - `GET  /api/v1/profile/:login`   — intra profile proxy with fallback
//! - `GET  /api/v1/health`           — health check

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod chat;
mod contact;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use cvassist_config::Config;
use cvassist_intra::{Credentials, IntraClient, ProfileError};
use cvassist_secrets::SecretsProvider;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

use chat::{ChatClient, ChatError};
use contact::ParseRejection;

const SERVICE_NAME: &str = "cvassist-backend";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

const ADMIN_PASSWORD_HEADER: &str = "x-admin-password";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Parse(#[from] ParseRejection),
    #[error("invalid login")]
    InvalidLogin,
    #[error("no profile data for '{0}'")]
    ProfileNotFound(String),
    #[error("invalid admin password")]
    InvalidCredential,
    #[error("misconfiguration: {0}")]
    Misconfiguration(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Chat(#[from] ChatError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ProfileError> for ApiError {
    fn from(e: ProfileError) -> Self {
        match e {
            ProfileError::InvalidLogin => Self::InvalidLogin,
            ProfileError::NotFound(login) => Self::ProfileNotFound(login),
            ProfileError::FallbackUnreadable(detail) => Self::Internal(detail),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let trace_id = Uuid::new_v4().to_string();
        let (status_code, kind, message) = match &self {
            Self::Parse(e) => {
                (StatusCode::BAD_REQUEST, "parse_error", e.to_string())
            }
            Self::InvalidLogin => (
                StatusCode::BAD_REQUEST,
                "invalid_login",
                "login may only contain lowercase letters, digits, '-' and '_'".to_string(),
            ),
            Self::ProfileNotFound(login) => (
                StatusCode::NOT_FOUND,
                "profile_not_found",
                format!("no profile data available for '{login}'"),
            ),
            Self::InvalidCredential => {
                warn!(trace_id = %trace_id, "admin listing rejected: wrong password");
                (
                    StatusCode::UNAUTHORIZED,
                    "invalid_credential",
                    "invalid admin password".to_string(),
                )
            }
            Self::Misconfiguration(detail) => {
                error!(detail = %detail, trace_id = %trace_id, "misconfiguration");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "misconfiguration",
                    "configuration error".to_string(),
                )
            }
            Self::Database(e) => {
                error!(error = %e, trace_id = %trace_id, "database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "database_error",
                    "internal database error".to_string(),
                )
            }
            Self::Chat(ChatError::QuestionTooLong(max)) => (
                StatusCode::BAD_REQUEST,
                "question_too_long",
                format!("question exceeds {max} characters"),
            ),
            Self::Chat(ChatError::Unconfigured) => {
                error!(trace_id = %trace_id, "chat API key not provisioned");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "misconfiguration",
                    "configuration error".to_string(),
                )
            }
            Self::Chat(e) => {
                warn!(error = %e, trace_id = %trace_id, "chat upstream failure");
                (
                    StatusCode::BAD_GATEWAY,
                    "chat_unavailable",
                    "Sorry, the assistant is temporarily unavailable.".to_string(),
                )
            }
            Self::Internal(detail) => {
                error!(detail = %detail, trace_id = %trace_id, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal error".to_string(),
                )
            }
        };

        let body = serde_json::json!({
            "error": kind,
            "message": message,
            "trace_id": trace_id,
            "status": "error",
        });

        (status_code, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Response envelope
// ---------------------------------------------------------------------------

fn ok_response(data: serde_json::Value) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "data": data,
        "updated_at": Utc::now().to_rfc3339(),
        "status": "ok",
    }))
}

// ---------------------------------------------------------------------------
// Health response
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: HashMap<String, DependencyStatus>,
}

#[derive(Serialize)]
pub struct DependencyStatus {
    pub status: String, // "ok" or "offline"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct AskRequest {
    pub message: String,
}

#[derive(Deserialize)]
pub struct SendMessageRequest {
    pub message: String,
}

// ---------------------------------------------------------------------------
// Application state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub pg: PgPool,
    pub config: Arc<Config>,
    pub chat: ChatClient,
    pub intra: IntraClient,
    /// `None` when the admin secret was not provisioned; the listing then
    /// reports a misconfiguration instead of comparing against nothing.
    pub admin_password: Option<String>,
    pub start_time: Instant,
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("fatal: failed to load config: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = cvassist_telemetry::init_telemetry(SERVICE_NAME, &config.telemetry) {
        eprintln!("fatal: telemetry init failed: {e}");
        process::exit(1);
    }

    info!(service = SERVICE_NAME, version = SERVICE_VERSION, "starting");

    let state = match init_state(config).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "fatal: failed to initialise");
            process::exit(1);
        }
    };

    let port = state.config.server.port;
    let shared = Arc::new(state);
    let app = build_router(Arc::clone(&shared));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(addr = %addr, "listening");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "failed to bind");
            process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "server error");
        process::exit(1);
    }

    info!("shutdown complete");
}

async fn init_state(config: Config) -> Result<AppState, ApiError> {
    let config = Arc::new(config);

    // Secrets provider
    let secrets: Arc<dyn SecretsProvider> = {
        let sc = &config.secrets;
        let provider = cvassist_secrets::create_provider(&sc.provider, sc.secrets_dir.as_deref())
            .map_err(|e| ApiError::Misconfiguration(e.to_string()))?;
        Arc::from(provider)
    };

    // The database URL is the one secret the service cannot run without.
    let pg_url = secrets
        .get(&config.postgres.url_key)
        .await
        .map_err(|e| ApiError::Misconfiguration(format!("database url: {e}")))?;

    let pg = PgPoolOptions::new()
        .min_connections(config.postgres.min_connections)
        .max_connections(config.postgres.max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&pg_url)
        .await?;
    info!("postgres pool connected");

    contact::ensure_schema(&pg).await?;

    // CV document for the chat persona; a CV site without its CV is a
    // deployment mistake, so this one is fatal.
    let cv_json = tokio::fs::read_to_string(&config.chat.cv_path)
        .await
        .map_err(|e| {
            ApiError::Misconfiguration(format!("cv document {}: {e}", config.chat.cv_path))
        })?;

    // Per-feature secrets degrade to call-time misconfiguration when absent.
    let chat_key = secrets
        .get_optional(&config.chat.api_key_name)
        .await
        .map_err(|e| ApiError::Misconfiguration(e.to_string()))?;
    if chat_key.is_none() {
        warn!(key = %config.chat.api_key_name, "chat API key not provisioned, asks will fail");
    }

    let chat = ChatClient::new(&config.chat, chat_key, &cv_json)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let intra_creds = match (
        secrets
            .get_optional(&config.intra.client_id_key)
            .await
            .map_err(|e| ApiError::Misconfiguration(e.to_string()))?,
        secrets
            .get_optional(&config.intra.client_secret_key)
            .await
            .map_err(|e| ApiError::Misconfiguration(e.to_string()))?,
    ) {
        (Some(client_id), Some(client_secret)) => Some(Credentials {
            client_id,
            client_secret,
        }),
        _ => {
            warn!("intra credentials not provisioned, profiles will come from fallback files");
            None
        }
    };

    let intra = IntraClient::new(&config.intra, intra_creds)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let admin_password = secrets
        .get_optional(&config.admin.password_key)
        .await
        .map_err(|e| ApiError::Misconfiguration(e.to_string()))?;
    if admin_password.is_none() {
        warn!(key = %config.admin.password_key, "admin password not provisioned, listing is disabled");
    }

    Ok(AppState {
        pg,
        config,
        chat,
        intra,
        admin_password,
        start_time: Instant::now(),
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .unwrap_or_else(|e| error!(error = %e, "ctrl-c handler failed"));
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "SIGTERM handler unavailable, relying on ctrl-c");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c"),
        () = terminate => info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Router construction
// ---------------------------------------------------------------------------

fn build_router(state: Arc<AppState>) -> Router {
    let cors = build_cors_layer(&state.config.server.cors_origins);

    let api_routes = Router::new()
        .route("/chat/ask", post(handler_ask))
        .route("/contact/send", post(handler_send_message))
        .route("/contact/messages", get(handler_messages))
        .route("/profile/:login", get(handler_profile))
        .route("/health", get(handler_health))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(cors)
}

fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allowed_headers = [
        header::CONTENT_TYPE,
        header::HeaderName::from_static(ADMIN_PASSWORD_HEADER),
    ];

    if origins.is_empty() {
        return CorsLayer::new()
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(allowed_headers);
    }

    let parsed: Vec<header::HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(allowed_headers)
}

// ---------------------------------------------------------------------------
// POST /api/v1/chat/ask
// ---------------------------------------------------------------------------

async fn handler_ask(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AskRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let reply = state.chat.ask(&req.message).await?;
    Ok(ok_response(serde_json::json!({ "reply": reply })))
}

// ---------------------------------------------------------------------------
// POST /api/v1/contact/send
// ---------------------------------------------------------------------------

async fn handler_send_message(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let parsed = contact::parse_contact(&req.message)?;
    let id = contact::insert_message(&state.pg, &parsed).await?;

    info!(id, company = %parsed.company, "contact message stored");

    Ok(ok_response(serde_json::json!({
        "id": id,
        "reply": format!(
            "Thanks {}! Your message for {} was recorded.",
            parsed.contact, parsed.company
        ),
    })))
}

// ---------------------------------------------------------------------------
// GET /api/v1/contact/messages
// ---------------------------------------------------------------------------

/// Exact-equality password check. An unset configured secret is a
/// misconfiguration, distinct from a wrong password.
fn check_admin_password(
    configured: Option<&str>,
    supplied: Option<&str>,
) -> Result<(), ApiError> {
    let Some(configured) = configured else {
        return Err(ApiError::Misconfiguration(
            "admin password not configured".to_string(),
        ));
    };
    match supplied {
        Some(s) if s == configured => Ok(()),
        _ => Err(ApiError::InvalidCredential),
    }
}

async fn handler_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let supplied = headers
        .get(ADMIN_PASSWORD_HEADER)
        .and_then(|v| v.to_str().ok());
    check_admin_password(state.admin_password.as_deref(), supplied)?;

    let messages: Vec<serde_json::Value> = contact::list_messages(&state.pg)
        .await?
        .into_iter()
        .map(|m| {
            serde_json::json!({
                "id": m.id,
                "company": m.company,
                "contact": m.contact,
                "message": m.message,
                "date": contact::format_timestamp(m.date),
            })
        })
        .collect();

    Ok(ok_response(serde_json::json!({ "messages": messages })))
}

// ---------------------------------------------------------------------------
// GET /api/v1/profile/:login
// ---------------------------------------------------------------------------

async fn handler_profile(
    State(state): State<Arc<AppState>>,
    Path(login): Path<String>,
) -> Result<Response, ApiError> {
    let doc = state.intra.profile(&login).await?;

    info!(login = %login, source = doc.source.as_str(), "profile served");

    // Verbatim passthrough of the upstream (or fallback) document.
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        doc.body,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// GET /api/v1/health
// ---------------------------------------------------------------------------

async fn handler_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let mut dependencies = HashMap::new();

    let started = Instant::now();
    let pg_status = match sqlx::query("SELECT 1").execute(&state.pg).await {
        Ok(_) => DependencyStatus {
            status: "ok".to_string(),
            latency_ms: Some(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)),
            detail: None,
        },
        Err(e) => DependencyStatus {
            status: "offline".to_string(),
            latency_ms: None,
            detail: Some(e.to_string()),
        },
    };
    let overall = if pg_status.status == "ok" { "ok" } else { "degraded" };
    dependencies.insert("postgres".to_string(), pg_status);

    Json(HealthResponse {
        status: overall.to_string(),
        service: SERVICE_NAME.to_string(),
        version: SERVICE_VERSION.to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        dependencies,
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_check_unset_secret_is_misconfiguration() {
        let err = check_admin_password(None, Some("anything")).unwrap_err();
        assert!(matches!(err, ApiError::Misconfiguration(_)));
    }

    #[test]
    fn test_admin_check_wrong_password() {
        let err = check_admin_password(Some("hunter2"), Some("hunter3")).unwrap_err();
        assert!(matches!(err, ApiError::InvalidCredential));

        let err = check_admin_password(Some("hunter2"), None).unwrap_err();
        assert!(matches!(err, ApiError::InvalidCredential));
    }

    #[test]
    fn test_admin_check_exact_match_only() {
        assert!(check_admin_password(Some("hunter2"), Some("hunter2")).is_ok());
        // No normalization: case and whitespace must match byte for byte.
        assert!(check_admin_password(Some("hunter2"), Some("Hunter2")).is_err());
        assert!(check_admin_password(Some("hunter2"), Some(" hunter2")).is_err());
    }

    #[test]
    fn test_error_status_mapping() {
        let cases: Vec<(ApiError, StatusCode)> = vec![
            (
                ApiError::Parse(ParseRejection {
                    reason: "could not extract: Message".to_string(),
                }),
                StatusCode::BAD_REQUEST,
            ),
            (ApiError::InvalidLogin, StatusCode::BAD_REQUEST),
            (
                ApiError::ProfileNotFound("pedmonte".to_string()),
                StatusCode::NOT_FOUND,
            ),
            (ApiError::InvalidCredential, StatusCode::UNAUTHORIZED),
            (
                ApiError::Misconfiguration("x".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                ApiError::Chat(ChatError::QuestionTooLong(2000)),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::Chat(ChatError::Unconfigured),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                ApiError::Chat(ChatError::Rejected { status: 503 }),
                StatusCode::BAD_GATEWAY,
            ),
            (
                ApiError::Chat(ChatError::Transport("timed out".to_string())),
                StatusCode::BAD_GATEWAY,
            ),
            (
                ApiError::Internal("boom".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            let resp = err.into_response();
            assert_eq!(resp.status(), expected);
        }
    }

    #[test]
    fn test_profile_error_conversion() {
        let err: ApiError = ProfileError::NotFound("pedmonte".to_string()).into();
        assert!(matches!(err, ApiError::ProfileNotFound(login) if login == "pedmonte"));

        let err: ApiError = ProfileError::InvalidLogin.into();
        assert!(matches!(err, ApiError::InvalidLogin));
    }

    #[test]
    fn test_ok_response_envelope() {
        let Json(body) = ok_response(serde_json::json!({ "reply": "hi" }));
        assert_eq!(body["status"], "ok");
        assert_eq!(body["data"]["reply"], "hi");
        assert!(body["updated_at"].is_string());
    }
}
