//! Web server: the `/ws` conversational pipeline endpoint plus the HTTP
//! surface from spec.md §6.5, assembling protected/public route groups
//! around one `ServerState`.

pub mod auth;
pub mod http;
pub mod voice_ws;

use crate::config::{Config, LlmDialect, VadBackend};
use crate::pipeline::connection::{energy_classifier_factory, ClassifierFactory, ConnectionManager};
use crate::pipeline::llm::{LlmAdapter, OllamaAdapter, OpenAiCompatibleAdapter, ProviderConfig};
use crate::pipeline::orchestrator::PipelineServices;
use crate::pipeline::stt::HttpSttAdapter;
use crate::pipeline::tools::{builtin_registry, ToolExecutor};
use crate::pipeline::tts::HttpTtsAdapter;
use crate::pipeline::vad::{OnnxClassifier, VadGateConfig};
use anyhow::{Context, Result};
use auth::{AuthConfig, AuthState};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

const SYSTEM_PROMPT: &str = "You are a helpful voice assistant. Keep replies concise; you are speaking, not writing.";

/// Everything a request handler or the `/ws` upgrade needs, shared across
/// every connection in the process (spec.md §5: adapters/registry/HTTP
/// client are per-process singletons).
pub struct ServerState {
    pub config: Arc<Config>,
    pub pipeline: Arc<PipelineServices>,
    pub connections: Arc<ConnectionManager>,
    pub vad_config: VadGateConfig,
    pub classifier_factory: ClassifierFactory,
    pub auth_state: Arc<AuthState>,
}

fn build_llm_adapter(config: &Config) -> Arc<dyn LlmAdapter> {
    let mut provider = ProviderConfig::new(config.llm.base_url.clone());
    // The keyring-backed credential store takes precedence over a key
    // committed to the plaintext config file.
    let api_key = crate::security::get_credential("llm-api-key").ok().or_else(|| config.llm.api_key.clone());
    if let Some(key) = api_key {
        provider = provider.with_api_key(key);
    }
    provider.extra_headers = config.llm.extra_headers.clone();

    match config.llm.dialect {
        LlmDialect::Ollama => Arc::new(OllamaAdapter::new(provider)),
        LlmDialect::OpenAiCompatible => Arc::new(OpenAiCompatibleAdapter::new(provider)),
    }
}

/// Builds the per-session/per-probe classifier factory. The ONNX model
/// itself is a process-scoped singleton (spec.md §5: "Global singletons
/// (VAD, STT, TTS, LLM client): model as process-scoped resources created
/// during startup") — it's loaded once here, and every factory call just
/// clones the `Arc` and builds a cheap per-connection handle around it.
/// A misconfigured ONNX path is therefore a startup-time error (§7
/// taxonomy #7): `build_state` propagates it via `?` before the server
/// binds its listening socket, instead of panicking on a later session.
fn build_classifier_factory(config: &Config) -> Result<ClassifierFactory> {
    match config.vad.backend {
        VadBackend::Energy => Ok(energy_classifier_factory()),
        VadBackend::Onnx => {
            let model = Arc::new(crate::voice::silero_vad::SileroModel::load().context("failed to load ONNX VAD model")?);
            Ok(Arc::new(move || Box::new(OnnxClassifier::new(model.clone())) as Box<dyn crate::pipeline::vad::SpeechClassifier>))
        }
    }
}

/// Builds the shared `ServerState` from a loaded `Config` (spec.md §5).
pub fn build_state(config: Config) -> Result<Arc<ServerState>> {
    let config = Arc::new(config);

    let tools = Arc::new(ToolExecutor::new(
        Arc::new(builtin_registry()),
        config.tools.max_concurrent,
        config.tools.timeout_secs,
    ));

    let llm = build_llm_adapter(&config);
    let compactor = Some(Arc::new(crate::pipeline::conversation::Compactor::new(llm.clone(), config.llm.model.clone())));

    let pipeline = Arc::new(PipelineServices {
        stt: Arc::new(HttpSttAdapter::new(config.stt.base_url.clone())),
        llm,
        tts: Arc::new(HttpTtsAdapter::new(config.tts.base_url.clone(), config.tts.voice.clone())),
        tools,
        llm_model: config.llm.model.clone(),
        speaking_rate: config.tts.speaking_rate,
        token_budget: config.conversation.token_budget,
        compactor,
        compaction_max_messages: config.conversation.compaction_max_messages,
        compaction_token_threshold: config.conversation.compaction_token_threshold,
        compaction_keep_recent: config.conversation.compaction_keep_recent,
    });

    let vad_config = VadGateConfig {
        threshold: config.vad.threshold,
        min_speech_ms: config.vad.min_speech_ms,
        min_silence_ms: config.vad.min_silence_ms,
    };
    let classifier_factory = build_classifier_factory(&config)?;

    let connections = Arc::new(ConnectionManager::new(
        classifier_factory.clone(),
        vad_config,
        SYSTEM_PROMPT,
        config.conversation.max_entries,
        crate::config::sessions_snapshot_path()?,
    ));

    let mut jwt_config = (*config).clone();
    let jwt_secret = jwt_config.ensure_jwt_secret()?;
    if config.auth.multi_user_enabled {
        if let Some(generated) = jwt_config.ensure_admin_credentials()? {
            info!(username = %jwt_config.auth.admin_username, password = %generated, "generated admin password; change it via config");
        }
    }
    let auth_state = AuthState::new(AuthConfig {
        jwt_secret,
        admin_username: jwt_config.auth.admin_username.clone(),
        admin_password_hash: jwt_config.auth.admin_password_hash.clone(),
        ..AuthConfig::default()
    });

    Ok(Arc::new(ServerState {
        config,
        pipeline,
        connections,
        vad_config,
        classifier_factory,
        auth_state,
    }))
}

/// Runs the server until the process is killed (spec.md §4.10: the
/// background sweep task persists sessions and clears speaking timeouts
/// for the lifetime of the process).
pub async fn start(config: Config) -> Result<()> {
    let host = config.server.host.clone();
    let port = config.server.port;
    let state = build_state(config)?;

    state.connections.spawn_background_sweep(state.config.snapshots.interval_secs);

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let admin = Router::new()
        .route("/api/admin/health", get(http::admin_health_handler))
        .route("/api/admin/sessions", get(http::admin_sessions_handler))
        .route("/api/admin/events", get(http::admin_events_handler))
        .route("/api/admin/logs", get(http::admin_logs_handler))
        .layer(middleware::from_fn_with_state(state.clone(), http::admin_gate));

    let app = Router::new()
        .route("/health", get(http::health_handler))
        .route("/api/voices", get(http::voices_handler))
        .route("/api/models", get(http::models_handler))
        .route("/api/auth/login", post(http::login_handler))
        .route("/api/auth/logout", post(http::logout_handler))
        .route("/ws", get(voice_ws::upgrade_handler))
        .merge(admin)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = format!("{host}:{port}").parse().context("invalid server host/port")?;
    info!(%addr, "voicebridge server listening");
    let listener = tokio::net::TcpListener::bind(addr).await.context("failed to bind server address")?;
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
