//! HTTP surface (spec.md §6.5): health/voices/model-discovery, JWT
//! login/logout, and admin-gated introspection. Same
//! `State<Arc<ServerState>>` extractor shape as the rest of this
//! module, and the same `LoginRequest`/`LoginResponse` JSON contracts
//! as `server::auth`.

use super::auth::{Claims, LoginRequest, LoginResponse, LogoutRequest, TokenType};
use super::ServerState;
use crate::config::LlmDialect;
use axum::extract::{Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

async fn probe_reachable(client: &reqwest::Client, url: &str) -> &'static str {
    match client.get(url).send().await {
        Ok(resp) if resp.status().is_success() || resp.status().is_client_error() => "ok",
        Ok(_) => "unreachable",
        Err(_) => "unreachable",
    }
}

/// `GET /health` (spec.md §6.5): reachability of each configured adapter
/// plus the registered tool count. `comfyui` has no counterpart module
/// here and is always reported `not_configured`.
pub async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let client = reqwest::Client::new();
    let (stt, tts, llm) = tokio::join!(
        probe_reachable(&client, &state.config.stt.base_url),
        probe_reachable(&client, &state.config.tts.base_url),
        probe_reachable(&client, &state.config.llm.base_url),
    );

    Json(json!({
        "status": "ok",
        "stt": stt,
        "tts": tts,
        "llm": llm,
        "tools_registered": state.pipeline.tools.registry_specs().len(),
        "comfyui": "not_configured",
    }))
}

/// `GET /api/voices` (spec.md §6.5).
pub async fn voices_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    match state.pipeline.tts.list_voices().await {
        Ok(voices) => Json(json!({ "voices": voices })).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "Cannot reach TTS server", "details": e.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ModelsQuery {
    #[serde(default)]
    backend: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
}

/// `GET /api/models?backend=&url=&api_key=` (spec.md §6.5): discovers the
/// model list from an arbitrary backend, not necessarily the one
/// currently configured, so the settings UI can probe before saving.
pub async fn models_handler(State(state): State<Arc<ServerState>>, Query(query): Query<ModelsQuery>) -> impl IntoResponse {
    let dialect = match query.backend.as_deref() {
        Some("ollama") => LlmDialect::Ollama,
        Some("openai") | Some("openai_compatible") => LlmDialect::OpenAiCompatible,
        Some(other) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": format!("unknown backend '{other}'") }))).into_response();
        }
        None => state.config.llm.dialect,
    };
    let base_url = query.url.unwrap_or_else(|| state.config.llm.base_url.clone());
    let api_key = query.api_key.or_else(|| state.config.llm.api_key.clone());

    let client = reqwest::Client::new();
    let result = match dialect {
        LlmDialect::Ollama => fetch_ollama_models(&client, &base_url).await,
        LlmDialect::OpenAiCompatible => fetch_openai_models(&client, &base_url, api_key.as_deref()).await,
    };

    match result {
        Ok(models) => Json(json!({ "models": models })).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "Cannot reach LLM server", "details": e.to_string() })),
        )
            .into_response(),
    }
}

async fn fetch_ollama_models(client: &reqwest::Client, base_url: &str) -> anyhow::Result<Vec<String>> {
    let url = format!("{}/api/tags", base_url.trim_end_matches('/'));
    let body: serde_json::Value = client.get(url).send().await?.error_for_status()?.json().await?;
    let models = body["models"]
        .as_array()
        .map(|list| list.iter().filter_map(|m| m["name"].as_str().map(String::from)).collect())
        .unwrap_or_default();
    Ok(models)
}

async fn fetch_openai_models(client: &reqwest::Client, base_url: &str, api_key: Option<&str>) -> anyhow::Result<Vec<String>> {
    let url = format!("{}/v1/models", base_url.trim_end_matches('/'));
    let mut request = client.get(url);
    if let Some(key) = api_key {
        request = request.bearer_auth(key);
    }
    let body: serde_json::Value = request.send().await?.error_for_status()?.json().await?;
    let models = body["data"]
        .as_array()
        .map(|list| list.iter().filter_map(|m| m["id"].as_str().map(String::from)).collect())
        .unwrap_or_default();
    Ok(models)
}

/// `POST /api/auth/login` (spec.md §6.5), active only when multi-user
/// auth is enabled; otherwise clients rely on `X-Admin-Token` instead.
/// Checks `req.password` against the one configured admin account, with
/// the same attempt-lockout counters `server::auth::AuthState` already
/// tracks for token validation.
pub async fn login_handler(State(state): State<Arc<ServerState>>, Json(req): Json<LoginRequest>) -> impl IntoResponse {
    if !state.config.auth.multi_user_enabled {
        return (StatusCode::NOT_FOUND, Json(json!({ "error": "multi-user auth is disabled" }))).into_response();
    }

    if let Some(remaining) = state.auth_state.is_locked(&req.username) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": "account locked", "retry_after_seconds": remaining.num_seconds() })),
        )
            .into_response();
    }

    let authenticated = match state.auth_state.authenticate(&req.username, &req.password) {
        Ok(ok) => ok,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))).into_response(),
    };
    if !authenticated {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid username or password" }))).into_response();
    }

    let permissions = vec!["read".to_string(), "write".to_string()];
    let access_token = match state.auth_state.generate_access_token(&req.username, &permissions) {
        Ok(token) => token,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))).into_response(),
    };
    let refresh_token = match state.auth_state.generate_refresh_token(&req.username) {
        Ok(token) => token,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))).into_response(),
    };

    Json(LoginResponse {
        access_token,
        refresh_token,
        token_type: "Bearer".to_string(),
        expires_in: state.auth_state.config.access_token_expiry_minutes * 60,
    })
    .into_response()
}

/// `POST /api/auth/logout` (spec.md §6.5).
pub async fn logout_handler(State(state): State<Arc<ServerState>>, Json(req): Json<LogoutRequest>) -> impl IntoResponse {
    match state.auth_state.extract_jti(&req.token) {
        Ok(jti) => {
            let _ = state.auth_state.revoke_token(&jti);
            (StatusCode::OK, Json(json!({ "message": "logged out" }))).into_response()
        }
        Err(e) => (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid token", "details": e.to_string() }))).into_response(),
    }
}

/// Gate for `/api/admin/*` (spec.md §6.5): a valid bearer session token
/// when multi-user auth is enabled, otherwise a matching
/// `X-Admin-Token` header. Mirrors `auth::auth_middleware`'s shape but
/// widens the accepted credential.
pub async fn admin_gate(State(state): State<Arc<ServerState>>, headers: HeaderMap, mut request: Request, next: Next) -> Result<Response, StatusCode> {
    if state.config.auth.multi_user_enabled {
        let token = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "));
        let claims = token.and_then(|t| state.auth_state.validate_token(t).ok()).ok_or(StatusCode::UNAUTHORIZED)?;
        if claims.token_type != TokenType::Access {
            return Err(StatusCode::UNAUTHORIZED);
        }
        request.extensions_mut().insert(claims);
        return Ok(next.run(request).await);
    }

    let configured = crate::security::get_credential("admin-token")
        .ok()
        .or_else(|| state.config.server.admin_token.clone())
        .ok_or(StatusCode::FORBIDDEN)?;
    let supplied = headers.get("x-admin-token").and_then(|h| h.to_str().ok()).ok_or(StatusCode::UNAUTHORIZED)?;
    if !crate::security::constant_time_eq(supplied.as_bytes(), configured.as_bytes()) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(request).await)
}

/// `GET /api/admin/health` — same payload as the public `/health`, kept
/// separate so the admin surface doesn't depend on the public route
/// staying unauthenticated.
pub async fn admin_health_handler(state: State<Arc<ServerState>>) -> impl IntoResponse {
    health_handler(state).await
}

/// `GET /api/admin/sessions` — every live session's identity and state.
pub async fn admin_sessions_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(json!({ "sessions": state.connections.list_summaries().await }))
}

/// `GET /api/admin/events` — placeholder until a ring-buffer event log is
/// wired up; reports session count so the endpoint is usable today
/// without inventing event data nothing upstream produces yet.
pub async fn admin_events_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(json!({ "events": [], "active_sessions": state.connections.session_count().await }))
}

/// `GET /api/admin/logs` — tail of the process's own tracing output
/// isn't buffered anywhere yet; this reports where to find it instead of
/// fabricating log lines.
pub async fn admin_logs_handler() -> impl IntoResponse {
    Json(json!({ "logs": [], "note": "structured logs are written to stdout via tracing; no in-process log buffer is kept" }))
}
