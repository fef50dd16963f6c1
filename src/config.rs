//! Configuration management.
//!
//! A single TOML-backed `Config` struct, loaded/saved the way the source
//! corpus does it throughout: `directories::ProjectDirs` for the config/data
//! paths, `toml` for the file format, defaults provided per-field so a
//! partially-written config file still parses.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub stt: SttConfig,
    #[serde(default)]
    pub tts: TtsConfig,
    #[serde(default)]
    pub vad: VadConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub snapshots: SnapshotConfig,
    #[serde(default)]
    pub auth: AuthSettingsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            llm: LlmConfig::default(),
            stt: SttConfig::default(),
            tts: TtsConfig::default(),
            vad: VadConfig::default(),
            tools: ToolsConfig::default(),
            conversation: ConversationConfig::default(),
            snapshots: SnapshotConfig::default(),
            auth: AuthSettingsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared secret compared against `X-Admin-Token` for `/api/admin/*`
    /// when multi-user auth is disabled (spec.md §6.5).
    #[serde(default)]
    pub admin_token: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8787
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            admin_token: None,
        }
    }
}

/// Which provider dialect (spec.md §4.5) the configured LLM backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmDialect {
    /// Ollama-shaped `/api/chat`, line-delimited JSON.
    Ollama,
    /// OpenAI-compatible `/v1/chat/completions`, SSE.
    OpenAiCompatible,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_dialect")]
    pub dialect: LlmDialect,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Extra headers sent with every request (e.g. OpenRouter's
    /// `HTTP-Referer`/`X-Title`), generalized as `ProviderConfig` is in
    /// `agent::llm`.
    #[serde(default)]
    pub extra_headers: Vec<(String, String)>,
}

fn default_llm_dialect() -> LlmDialect {
    LlmDialect::OpenAiCompatible
}
fn default_llm_base_url() -> String {
    "http://127.0.0.1:11434".to_string()
}
fn default_llm_model() -> String {
    "llama3.1".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            dialect: default_llm_dialect(),
            base_url: default_llm_base_url(),
            api_key: None,
            model: default_llm_model(),
            extra_headers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    #[serde(default = "default_stt_base_url")]
    pub base_url: String,
}

fn default_stt_base_url() -> String {
    "http://127.0.0.1:9000".to_string()
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            base_url: default_stt_base_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(default = "default_tts_base_url")]
    pub base_url: String,
    #[serde(default = "default_voice")]
    pub voice: String,
    /// Clamped to [0.5, 2.0] at the adapter boundary (spec.md §4.7).
    #[serde(default = "default_speaking_rate")]
    pub speaking_rate: f32,
}

fn default_tts_base_url() -> String {
    "http://127.0.0.1:8880".to_string()
}
fn default_voice() -> String {
    "af_heart".to_string()
}
fn default_speaking_rate() -> f32 {
    1.0
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            base_url: default_tts_base_url(),
            voice: default_voice(),
            speaking_rate: default_speaking_rate(),
        }
    }
}

/// Which `SpeechClassifier` backend is active (REDESIGN FLAGS: explicit
/// choice, never a runtime fallback chain).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VadBackend {
    Energy,
    Onnx,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    #[serde(default = "default_vad_backend")]
    pub backend: VadBackend,
    #[serde(default = "default_vad_threshold")]
    pub threshold: f32,
    #[serde(default = "default_min_speech_ms")]
    pub min_speech_ms: u64,
    #[serde(default = "default_min_silence_ms")]
    pub min_silence_ms: u64,
}

fn default_vad_backend() -> VadBackend {
    VadBackend::Energy
}
fn default_vad_threshold() -> f32 {
    0.5
}
fn default_min_speech_ms() -> u64 {
    150
}
fn default_min_silence_ms() -> u64 {
    300
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            backend: default_vad_backend(),
            threshold: default_vad_threshold(),
            min_speech_ms: default_min_speech_ms(),
            min_silence_ms: default_min_silence_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_max_concurrent() -> usize {
    5
}
fn default_tool_timeout_secs() -> u64 {
    30
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            timeout_secs: default_tool_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    #[serde(default = "default_compaction_max_messages")]
    pub compaction_max_messages: usize,
    #[serde(default = "default_compaction_token_threshold")]
    pub compaction_token_threshold: usize,
    #[serde(default = "default_keep_recent")]
    pub compaction_keep_recent: usize,
}

fn default_max_entries() -> usize {
    200
}
fn default_token_budget() -> usize {
    6000
}
fn default_compaction_max_messages() -> usize {
    40
}
fn default_compaction_token_threshold() -> usize {
    4000
}
fn default_keep_recent() -> usize {
    12
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            token_budget: default_token_budget(),
            compaction_max_messages: default_compaction_max_messages(),
            compaction_token_threshold: default_compaction_token_threshold(),
            compaction_keep_recent: default_keep_recent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// 0 disables periodic snapshotting (spec.md §4.10).
    #[serde(default = "default_snapshot_interval")]
    pub interval_secs: u64,
}

fn default_snapshot_interval() -> u64 {
    60
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_snapshot_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettingsConfig {
    /// Multi-user JWT auth, disabled by default (spec.md Non-goals: strong
    /// authenticated multi-tenant isolation is out of scope; the admin
    /// token path is the default gate per §6.5).
    #[serde(default)]
    pub multi_user_enabled: bool,
    #[serde(default)]
    pub jwt_secret: Option<String>,
    /// The one account `/api/auth/login` accepts when multi-user auth is
    /// on. No multi-tenant user store (out of scope per Non-goals above);
    /// this is one admin login, not a user directory.
    #[serde(default = "default_admin_username")]
    pub admin_username: String,
    /// Set by `Config::ensure_admin_credentials` the first time multi-user
    /// auth is enabled with no password configured yet.
    #[serde(default)]
    pub admin_password_hash: Option<String>,
}

fn default_admin_username() -> String {
    "admin".to_string()
}

impl Default for AuthSettingsConfig {
    fn default() -> Self {
        Self {
            multi_user_enabled: false,
            jwt_secret: None,
            admin_username: default_admin_username(),
            admin_password_hash: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path).context("failed to read config file")?;
            let config: Config = toml::from_str(&contents).context("failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = config_path()?;
        let parent = path.parent().context("config path has no parent")?;
        std::fs::create_dir_all(parent).context("failed to create config directory")?;
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(&path, contents).context("failed to write config file")?;
        Ok(())
    }

    pub fn ensure_jwt_secret(&mut self) -> Result<String> {
        if let Some(secret) = &self.auth.jwt_secret {
            return Ok(secret.clone());
        }
        let secret = crate::server::auth::generate_jwt_secret();
        self.auth.jwt_secret = Some(secret.clone());
        self.save()?;
        Ok(secret)
    }

    /// Generates and persists an admin password the first time multi-user
    /// auth is turned on with none configured. Returns the plaintext only
    /// when freshly generated, so the caller can surface it once.
    pub fn ensure_admin_credentials(&mut self) -> Result<Option<String>> {
        if self.auth.admin_password_hash.is_some() {
            return Ok(None);
        }
        let password = crate::server::auth::generate_admin_password();
        self.auth.admin_password_hash = Some(crate::server::auth::hash_password(&password)?);
        self.save()?;
        Ok(Some(password))
    }
}

pub fn config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("dev", "voicebridge", "voicebridge")
        .context("failed to resolve project directories")?;
    Ok(base.config_dir().join("config.toml"))
}

pub fn data_dir() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("dev", "voicebridge", "voicebridge")
        .context("failed to resolve project directories")?;
    let dir = base.data_dir().to_path_buf();
    std::fs::create_dir_all(&dir).context("failed to create data directory")?;
    Ok(dir)
}

/// Rejects anything but a plain path-segment identifier, so a client-
/// supplied `client_id` (from a WebSocket query string) can never escape
/// `{data_dir}/users/` via `..`, a separator, or a null byte.
fn sanitize_client_id(client_id: &str) -> Result<()> {
    let valid = !client_id.is_empty()
        && client_id.len() <= 128
        && client_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        bail!("invalid client_id: must be 1-128 ASCII alphanumeric/-/_ characters");
    }
    Ok(())
}

/// Where per-client settings/history live (spec.md §6.6).
pub fn user_dir(client_id: &str) -> Result<PathBuf> {
    sanitize_client_id(client_id)?;
    let dir = data_dir()?.join("users").join(client_id);
    std::fs::create_dir_all(&dir).context("failed to create user directory")?;
    Ok(dir)
}

/// `{data_dir}/users/{client_id}/settings.json` (spec.md §6.6).
pub fn client_settings_path(client_id: &str) -> Result<PathBuf> {
    Ok(user_dir(client_id)?.join("settings.json"))
}

/// Where the process-wide sessions snapshot lives (spec.md §6.6).
pub fn sessions_snapshot_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("sessions.json"))
}

/// Per-client adapter overrides applied from a `settings` control frame
/// (spec.md §6.3: "reconfigure adapters; persist per-client"). Kept
/// separate from `Config` since these are per-connection, not process-wide.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClientSettings {
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(rename = "voiceSpeed", default)]
    pub voice_speed: Option<f32>,
}

impl ClientSettings {
    pub fn is_empty(&self) -> bool {
        self.voice.is_none() && self.model.is_none() && self.voice_speed.is_none()
    }

    pub fn load(client_id: &str) -> Result<Self> {
        let path = client_settings_path(client_id)?;
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path).context("failed to read client settings file")?;
        serde_json::from_str(&contents).context("failed to parse client settings file")
    }

    pub fn save(&self, client_id: &str) -> Result<()> {
        write_json_atomic(&client_settings_path(client_id)?, self)
    }
}

/// Atomic write-rename used throughout the corpus for anything persisted
/// to disk (the same pattern `Config::save` and the session-snapshot
/// writer use).
pub fn write_json_atomic<T: Serialize>(path: &std::path::Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("failed to create directory for atomic write")?;
    }
    let json = serde_json::to_string_pretty(value).context("failed to serialize value")?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, json).context("failed to write temporary file")?;
    std::fs::rename(&tmp_path, path).context("failed to rename file into place")?;
    Ok(())
}

/// Prints the config as a terse human-readable dump, not a
/// debug-format pretty-print.
pub fn show_config() -> Result<()> {
    let config = Config::load()?;
    println!("server:      {}:{}", config.server.host, config.server.port);
    println!(
        "llm:         dialect={:?} base_url={} model={}",
        config.llm.dialect, config.llm.base_url, config.llm.model
    );
    println!("stt:         base_url={}", config.stt.base_url);
    println!(
        "tts:         base_url={} voice={} speaking_rate={}",
        config.tts.base_url, config.tts.voice, config.tts.speaking_rate
    );
    println!(
        "vad:         backend={:?} threshold={} min_speech_ms={} min_silence_ms={}",
        config.vad.backend, config.vad.threshold, config.vad.min_speech_ms, config.vad.min_silence_ms
    );
    println!(
        "tools:       max_concurrent={} timeout_secs={}",
        config.tools.max_concurrent, config.tools.timeout_secs
    );
    println!(
        "conversation: max_entries={} token_budget={}",
        config.conversation.max_entries, config.conversation.token_budget
    );
    println!("snapshots:   interval_secs={}", config.snapshots.interval_secs);
    println!("auth:        multi_user_enabled={}", config.auth.multi_user_enabled);
    Ok(())
}

/// Sets one dotted-path config key from the CLI's `config set` subcommand.
/// Supports the knobs an operator actually tunes without wiring a full
/// reflection layer for a TOML document this small.
pub fn set_key(key: &str, value: &str) -> Result<()> {
    let mut config = Config::load()?;
    match key {
        "server.host" => config.server.host = value.to_string(),
        "server.port" => config.server.port = value.parse().context("port must be a u16")?,
        "server.admin_token" => config.server.admin_token = Some(value.to_string()),
        "llm.base_url" => config.llm.base_url = value.to_string(),
        "llm.model" => config.llm.model = value.to_string(),
        "llm.dialect" => {
            config.llm.dialect = match value {
                "ollama" => LlmDialect::Ollama,
                "openai" | "openai-compatible" => LlmDialect::OpenAiCompatible,
                other => anyhow::bail!("unknown llm dialect '{other}' (expected 'ollama' or 'openai-compatible')"),
            }
        }
        "stt.base_url" => config.stt.base_url = value.to_string(),
        "tts.base_url" => config.tts.base_url = value.to_string(),
        "tts.voice" => config.tts.voice = value.to_string(),
        "tts.speaking_rate" => {
            config.tts.speaking_rate = value.parse::<f32>().context("speaking_rate must be a float")?.clamp(0.5, 2.0)
        }
        "vad.backend" => {
            config.vad.backend = match value {
                "energy" => VadBackend::Energy,
                "onnx" => VadBackend::Onnx,
                other => anyhow::bail!("unknown vad backend '{other}' (expected 'energy' or 'onnx')"),
            }
        }
        "tools.max_concurrent" => {
            config.tools.max_concurrent = value.parse().context("max_concurrent must be a usize")?
        }
        "snapshots.interval_secs" => {
            config.snapshots.interval_secs = value.parse().context("interval_secs must be a u64")?
        }
        "auth.multi_user_enabled" => {
            config.auth.multi_user_enabled = value.parse().context("multi_user_enabled must be true/false")?
        }
        other => anyhow::bail!("unknown config key '{other}'"),
    }
    config.save()?;
    println!("{key} = {value}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_settings_empty_by_default() {
        assert!(ClientSettings::default().is_empty());
    }

    #[test]
    fn client_settings_json_uses_camel_case_voice_speed() {
        let settings = ClientSettings { voice: Some("nova".to_string()), model: None, voice_speed: Some(1.25) };
        let json = serde_json::to_string(&settings).unwrap();
        assert!(json.contains("\"voiceSpeed\":1.25"));
        assert!(!settings.is_empty());

        let round_tripped: ClientSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(round_tripped, settings);
    }

    #[test]
    fn write_json_atomic_round_trips_and_leaves_no_tmp_file() {
        let dir = std::env::temp_dir().join(format!("voicebridge-config-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("nested").join("settings.json");

        let settings = ClientSettings { voice: Some("sage".to_string()), model: Some("gpt-test".to_string()), voice_speed: None };
        write_json_atomic(&path, &settings).unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        let contents = std::fs::read_to_string(&path).unwrap();
        let loaded: ClientSettings = serde_json::from_str(&contents).unwrap();
        assert_eq!(loaded, settings);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
