//! LLM Adapter (C5).
//!
//! Normalizes two provider dialects (spec.md §4.5 table) behind one
//! `LlmAdapter` trait: dialect A (Ollama-shaped `/api/chat`, line-delimited
//! JSON) and dialect B (OpenAI-compatible `/v1/chat/completions`, SSE).
//! Streaming is modeled as a producer task writing to a bounded channel
//! (spec.md §9 re-architecture notes), generalized over a
//! `ProviderConfig` the way `agent::llm::ProviderConfig` does for
//! OpenRouter/NVIDIA NIM (SPEC_FULL.md §4 C5 supplement).

use super::types::{CancelToken, Message, ToolCall, ToolSpec};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Normalized chunk handed to the orchestrator, independent of dialect.
#[derive(Debug, Clone)]
pub enum Chunk {
    Text { delta: String },
    ToolCall { id: String, name: String, arguments: HashMap<String, Value> },
    Finish,
}

/// Base URL / credentials / extra headers for a concrete backend. One
/// struct covers both dialects so adding a new OpenAI-compatible backend is
/// a config value, not new code (SPEC_FULL.md C5 supplement).
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub extra_headers: Vec<(String, String)>,
}

impl ProviderConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            extra_headers: Vec::new(),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

#[async_trait]
pub trait LlmAdapter: Send + Sync {
    /// Streams a chat completion. The returned receiver yields exactly one
    /// `Chunk::Finish` as its last item (spec.md §4.5 rule 5), or an error
    /// item if the backend failed (§4.5 Failure — HTTP error, connection
    /// error, model-not-found surfaces as a terminating error item instead
    /// of a panic).
    async fn chat(
        &self,
        model: &str,
        messages: &[Message],
        tools: &[ToolSpec],
        cancel: CancelToken,
    ) -> Result<mpsc::Receiver<Result<Chunk>>>;

    /// A single non-streaming completion, used by the conversation
    /// compactor for summarization (SPEC_FULL.md C4 supplement).
    async fn complete_once(&self, model: &str, messages: &[Message]) -> Result<String>;

    /// Swaps the backend's base URL / API key in place (spec.md §5:
    /// "`update_config` closes the current client and a new one is lazily
    /// created"; driven by a `settings` control frame's `llmUrl`/
    /// `llmApiKey` fields, spec.md §6.3). A no-op default for adapters
    /// with no mutable connection state (e.g. test stubs).
    async fn update_config(&self, _base_url: Option<String>, _api_key: Option<String>) {}
}

// ===================== Wire message shape (both dialects) =====================

#[derive(Debug, Clone, Serialize)]
struct WireMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct WireToolCall {
    id: String,
    r#type: &'static str,
    function: WireFunctionCall,
}

#[derive(Debug, Clone, Serialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

fn to_wire_messages(messages: &[Message]) -> Vec<WireMessage> {
    messages
        .iter()
        .map(|m| match m {
            Message::System { text, .. } => WireMessage {
                role: "system",
                content: Some(text.clone()),
                tool_calls: None,
                tool_call_id: None,
                name: None,
            },
            Message::User { text, .. } => WireMessage {
                role: "user",
                content: Some(text.clone()),
                tool_calls: None,
                tool_call_id: None,
                name: None,
            },
            Message::Assistant { text, tool_calls, .. } => WireMessage {
                role: "assistant",
                content: if text.is_empty() { None } else { Some(text.clone()) },
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        tool_calls
                            .iter()
                            .map(|tc| WireToolCall {
                                id: tc.id.clone(),
                                r#type: "function",
                                function: WireFunctionCall {
                                    name: tc.name.clone(),
                                    arguments: serde_json::to_string(&tc.arguments).unwrap_or_default(),
                                },
                            })
                            .collect(),
                    )
                },
                tool_call_id: None,
                name: None,
            },
            Message::Tool {
                tool_call_id,
                tool_name,
                result_text,
                ..
            } => WireMessage {
                role: "tool",
                content: Some(result_text.clone()),
                tool_calls: None,
                tool_call_id: Some(tool_call_id.clone()),
                name: Some(tool_name.clone()),
            },
        })
        .collect()
}

fn to_wire_tools(tools: &[ToolSpec]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            serde_json::json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.json_schema_parameters,
                }
            })
        })
        .collect()
}

// ===================== Normalization state machine (spec.md §4.5, §9) =====================

/// Phrases a small closed list of models repeat when they stall; if any
/// occurs >= 4 times within the last 200 characters of accumulated text,
/// or the accumulated text exceeds 2000 characters, the stream is
/// truncated to the first occurrence and ended (spec.md §4.5 rule 4).
const REPETITION_PHRASES: &[&str] = &["I'm ready", "Ready.", "..."];
const REPETITION_WINDOW: usize = 200;
const MAX_ACCUMULATED_CHARS: usize = 2000;

struct PendingToolCall {
    id: String,
    name: String,
    arguments_buf: String,
}

/// Accumulates streamed text/tool-call fragments from either dialect into
/// normalized `Chunk`s, applying rules 1-4 of spec.md §4.5. One instance
/// lives for the duration of one `chat()` call.
struct Normalizer {
    text_buf: String,
    emitted_chars: usize,
    tool_calls: Vec<PendingToolCall>,
    /// Keyed by call id (or a synthetic `call_{index}` when the dialect
    /// only supplies a positional index, as OpenAI-compatible deltas do
    /// after the first fragment).
    tool_call_index: HashMap<String, usize>,
    saw_tool_call: bool,
    truncated: bool,
}

impl Normalizer {
    fn new() -> Self {
        Self {
            text_buf: String::new(),
            emitted_chars: 0,
            tool_calls: Vec::new(),
            tool_call_index: HashMap::new(),
            saw_tool_call: false,
            truncated: false,
        }
    }

    /// Rule 1: buffer text; caller decides whether to forward it once the
    /// full response is known to carry no tool-calls. Returns `Some(delta)`
    /// to forward immediately only when no tool-call has been seen yet in
    /// this stream (matching "stream text chunks as they arrive, except
    /// when the provider also emits tool-calls in the same response").
    fn push_text(&mut self, delta: &str) -> Option<String> {
        if delta.is_empty() || self.truncated {
            return None;
        }
        self.text_buf.push_str(delta);

        if let Some(truncate_at) = self.repetition_cut_point() {
            self.text_buf.truncate(truncate_at);
            self.truncated = true;
        }

        if self.saw_tool_call {
            // Text arriving alongside tool-calls is partial JSON in many
            // small models; never forwarded (rule 1).
            return None;
        }

        let already_emitted = self.emitted_chars;
        if already_emitted >= self.text_buf.len() {
            return None;
        }
        let fresh = self.text_buf[already_emitted..].to_string();
        self.emitted_chars = self.text_buf.len();
        if fresh.is_empty() {
            None
        } else {
            Some(fresh)
        }
    }

    fn repetition_cut_point(&self) -> Option<usize> {
        if self.text_buf.len() > MAX_ACCUMULATED_CHARS {
            return Some(MAX_ACCUMULATED_CHARS);
        }
        let window_start = self.text_buf.len().saturating_sub(REPETITION_WINDOW);
        let window = &self.text_buf[window_start..];
        for phrase in REPETITION_PHRASES {
            let count = window.matches(phrase).count();
            if count >= 4 {
                if let Some(first) = self.text_buf.find(phrase) {
                    // Keep through the end of the first occurrence.
                    return Some(first + phrase.len());
                }
            }
        }
        None
    }

    /// Rule 2: accumulate a tool-call fragment by id (or positional index).
    fn push_tool_call_fragment(&mut self, key: &str, id: Option<&str>, name: Option<&str>, arguments_fragment: Option<&str>) {
        self.saw_tool_call = true;
        let idx = if let Some(&idx) = self.tool_call_index.get(key) {
            idx
        } else {
            let idx = self.tool_calls.len();
            self.tool_calls.push(PendingToolCall {
                id: id.unwrap_or(key).to_string(),
                name: String::new(),
                arguments_buf: String::new(),
            });
            self.tool_call_index.insert(key.to_string(), idx);
            idx
        };
        let entry = &mut self.tool_calls[idx];
        if let Some(id) = id {
            if !id.is_empty() {
                entry.id = id.to_string();
            }
        }
        if let Some(name) = name {
            entry.name.push_str(name);
        }
        if let Some(frag) = arguments_fragment {
            entry.arguments_buf.push_str(frag);
        }
    }

    /// Finalizes accumulated tool calls into `Chunk::ToolCall`s, applying
    /// rule 3 (brace-balanced reconstruction, then last-resort text
    /// extraction; drop calls with required params that can't be
    /// recovered) and the §9 open-question resolution (API-reported calls
    /// win; text-extraction is fallback only).
    fn finish_tool_calls(&mut self, tools: &[ToolSpec]) -> Vec<Chunk> {
        let mut out = Vec::new();
        for tc in self.tool_calls.drain(..) {
            let schema = tools.iter().find(|t| t.name == tc.name);
            let required = schema
                .and_then(|s| s.json_schema_parameters.get("required"))
                .and_then(|r| r.as_array())
                .cloned()
                .unwrap_or_default();

            let arguments = parse_arguments(&tc.arguments_buf, &tc.name, &self.text_buf);

            match arguments {
                Some(args) => {
                    if !required.is_empty() && required.iter().all(|r| {
                        let key = r.as_str().unwrap_or_default();
                        !args.contains_key(key)
                    }) {
                        warn!("dropping tool call '{}': no required parameters recovered", tc.name);
                        continue;
                    }
                    out.push(Chunk::ToolCall {
                        id: tc.id,
                        name: tc.name,
                        arguments: args,
                    });
                }
                None => {
                    if required.is_empty() {
                        out.push(Chunk::ToolCall {
                            id: tc.id,
                            name: tc.name,
                            arguments: HashMap::new(),
                        });
                    } else {
                        warn!("dropping unparseable tool call '{}'", tc.name);
                    }
                }
            }
        }
        out
    }
}

/// Rule 3: arguments may be a clean JSON object string, brace-unbalanced
/// (truncate trailing incomplete key/value), or entirely unparseable (fall
/// back to extracting a `{"name":...,"arguments":{...}}` pattern from the
/// accumulated response text).
fn parse_arguments(raw: &str, tool_name: &str, full_text: &str) -> Option<HashMap<String, Value>> {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw) {
        return Some(map.into_iter().collect());
    }

    if let Some(balanced) = brace_balance_truncate(raw) {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&balanced) {
            return Some(map.into_iter().collect());
        }
    }

    // Last resort: scan the accumulated text for an embedded call matching
    // this tool's name.
    extract_embedded_call(full_text, tool_name)
}

/// Truncates `raw` at the last point where braces balance, dropping a
/// trailing incomplete key/value pair. Returns `None` if no balanced
/// prefix exists.
fn brace_balance_truncate(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut depth = 0i32;
    let mut last_balanced: Option<usize> = None;
    let mut in_string = false;
    let mut escape = false;
    for (i, c) in raw.char_indices() {
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    last_balanced = Some(i + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    last_balanced.map(|end| raw[..end].to_string())
}

fn extract_embedded_call(full_text: &str, tool_name: &str) -> Option<HashMap<String, Value>> {
    let re = Regex::new(r#""name"\s*:\s*"([^"]+)"\s*,\s*"arguments"\s*:\s*(\{[^}]*\})"#).ok()?;
    for caps in re.captures_iter(full_text) {
        if &caps[1] == tool_name {
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&caps[2]) {
                return Some(map.into_iter().collect());
            }
        }
    }
    None
}

// ===================== Dialect A: Ollama-shaped /api/chat =====================

/// `config` is behind a `RwLock` so `update_config` can swap the base URL
/// / API key for a shared `Arc<dyn LlmAdapter>` singleton in place (spec.md
/// §5, §6.3 `settings` frame).
pub struct OllamaAdapter {
    config: std::sync::RwLock<ProviderConfig>,
    client: reqwest::Client,
}

impl OllamaAdapter {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config: std::sync::RwLock::new(config),
            client: reqwest::Client::new(),
        }
    }

    fn config(&self) -> ProviderConfig {
        self.config.read().expect("llm config lock poisoned").clone()
    }

    fn request(&self, rb: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let config = self.config();
        let mut rb = rb;
        for (k, v) in &config.extra_headers {
            rb = rb.header(k, v);
        }
        if let Some(key) = &config.api_key {
            rb = rb.bearer_auth(key);
        }
        rb
    }
}

#[derive(Deserialize)]
struct OllamaStreamLine {
    message: OllamaMessage,
    #[serde(default)]
    done: bool,
}

#[derive(Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<OllamaToolCall>,
}

#[derive(Deserialize)]
struct OllamaToolCall {
    function: OllamaFunctionCall,
}

#[derive(Deserialize)]
struct OllamaFunctionCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[async_trait]
impl LlmAdapter for OllamaAdapter {
    async fn chat(
        &self,
        model: &str,
        messages: &[Message],
        tools: &[ToolSpec],
        cancel: CancelToken,
    ) -> Result<mpsc::Receiver<Result<Chunk>>> {
        let (tx, rx) = mpsc::channel(16);
        let url = format!("{}/api/chat", self.config().base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": model,
            "messages": to_wire_messages(messages),
            "tools": to_wire_tools(tools),
            "stream": true,
        });

        let resp = self
            .request(self.client.post(&url).json(&body))
            .send()
            .await;

        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                let _ = tx.send(Err(anyhow::anyhow!("cannot connect to ollama llm backend: {e}"))).await;
                return Ok(rx);
            }
        };

        if !resp.status().is_success() {
            let status = resp.status();
            let _ = tx.send(Err(anyhow::anyhow!("llm backend returned HTTP {status}"))).await;
            return Ok(rx);
        }

        let tools = tools.to_vec();
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut buffer = String::new();
            let mut norm = Normalizer::new();

            'outer: while let Some(chunk) = stream.next().await {
                if cancel.is_cancelled() {
                    break;
                }
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(anyhow::anyhow!("llm stream read error: {e}"))).await;
                        break;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer = buffer[pos + 1..].to_string();
                    if line.is_empty() {
                        continue;
                    }
                    let parsed: OllamaStreamLine = match serde_json::from_str(&line) {
                        Ok(p) => p,
                        Err(_) => continue,
                    };

                    // Tool-call fragments are processed before the text delta so
                    // `saw_tool_call` is already set when `push_text` checks it —
                    // a single line can carry both partial-JSON content and a
                    // tool-call delta, and that content must never leak (spec.md
                    // §4.5 rule 1).
                    for (i, tc) in parsed.message.tool_calls.iter().enumerate() {
                        let args_str = match &tc.function.arguments {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        norm.push_tool_call_fragment(
                            &format!("call_{i}"),
                            None,
                            Some(&tc.function.name),
                            Some(&args_str),
                        );
                    }
                    if let Some(delta) = norm.push_text(&parsed.message.content) {
                        if tx.send(Ok(Chunk::Text { delta })).await.is_err() {
                            break 'outer;
                        }
                    }

                    if parsed.done {
                        for tc in norm.finish_tool_calls(&tools) {
                            if tx.send(Ok(tc)).await.is_err() {
                                break 'outer;
                            }
                        }
                        let _ = tx.send(Ok(Chunk::Finish)).await;
                        return;
                    }
                }
            }
            for tc in norm.finish_tool_calls(&tools) {
                let _ = tx.send(Ok(tc)).await;
            }
            let _ = tx.send(Ok(Chunk::Finish)).await;
        });

        Ok(rx)
    }

    async fn complete_once(&self, model: &str, messages: &[Message]) -> Result<String> {
        let url = format!("{}/api/chat", self.config().base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": model,
            "messages": to_wire_messages(messages),
            "stream": false,
        });
        let resp = self
            .request(self.client.post(&url).json(&body))
            .send()
            .await
            .context("cannot connect to ollama llm backend")?;
        if !resp.status().is_success() {
            bail!("llm backend returned HTTP {}", resp.status());
        }
        let parsed: OllamaStreamLine = resp.json().await.context("failed to parse ollama response")?;
        Ok(parsed.message.content)
    }

    async fn update_config(&self, base_url: Option<String>, api_key: Option<String>) {
        apply_config_update(&self.config, base_url, api_key);
    }
}

/// Shared by both dialects' `update_config`: `reqwest::Client` itself has
/// no per-request base URL to reset, so "closes the current client and a
/// new one is lazily created" (spec.md §5) reduces to swapping the
/// `ProviderConfig` the next request reads — no client rebuild needed.
fn apply_config_update(config: &std::sync::RwLock<ProviderConfig>, base_url: Option<String>, api_key: Option<String>) {
    let mut guard = config.write().expect("llm config lock poisoned");
    if let Some(base_url) = base_url {
        guard.base_url = base_url;
    }
    if let Some(api_key) = api_key {
        guard.api_key = Some(api_key);
    }
}

// ===================== Dialect B: OpenAI-compatible SSE =====================

pub struct OpenAiCompatibleAdapter {
    config: std::sync::RwLock<ProviderConfig>,
    client: reqwest::Client,
}

impl OpenAiCompatibleAdapter {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config: std::sync::RwLock::new(config),
            client: reqwest::Client::new(),
        }
    }

    fn config(&self) -> ProviderConfig {
        self.config.read().expect("llm config lock poisoned").clone()
    }

    fn request(&self, rb: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let config = self.config();
        let mut rb = rb;
        for (k, v) in &config.extra_headers {
            rb = rb.header(k, v);
        }
        if let Some(key) = &config.api_key {
            rb = rb.bearer_auth(key);
        }
        rb
    }
}

#[derive(Deserialize)]
struct SseChunk {
    choices: Vec<SseChoice>,
}

#[derive(Deserialize)]
struct SseChoice {
    delta: SseDelta,
}

#[derive(Deserialize, Default)]
struct SseDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<SseToolCallDelta>,
}

#[derive(Deserialize)]
struct SseToolCallDelta {
    #[serde(default)]
    id: Option<String>,
    index: i64,
    #[serde(default)]
    function: Option<SseFunctionDelta>,
}

#[derive(Deserialize, Default)]
struct SseFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[async_trait]
impl LlmAdapter for OpenAiCompatibleAdapter {
    async fn chat(
        &self,
        model: &str,
        messages: &[Message],
        tools: &[ToolSpec],
        cancel: CancelToken,
    ) -> Result<mpsc::Receiver<Result<Chunk>>> {
        let (tx, rx) = mpsc::channel(16);
        let url = format!("{}/v1/chat/completions", self.config().base_url.trim_end_matches('/'));
        let wire_tools = to_wire_tools(tools);
        let mut body = serde_json::json!({
            "model": model,
            "messages": to_wire_messages(messages),
            "stream": true,
        });
        if !wire_tools.is_empty() {
            body["tools"] = Value::Array(wire_tools);
        }

        let resp = self.request(self.client.post(&url).json(&body)).send().await;
        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                let _ = tx.send(Err(anyhow::anyhow!("cannot connect to llm backend: {e}"))).await;
                return Ok(rx);
            }
        };

        if !resp.status().is_success() {
            let status = resp.status();
            let body_text = resp.text().await.unwrap_or_default();
            if status.as_u16() == 404 {
                let _ = tx
                    .send(Err(anyhow::anyhow!("llm model not found (404): {body_text}")))
                    .await;
            } else {
                let _ = tx.send(Err(anyhow::anyhow!("llm backend returned HTTP {status}: {body_text}"))).await;
            }
            return Ok(rx);
        }

        let tools = tools.to_vec();
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut buffer = String::new();
            let mut norm = Normalizer::new();

            'outer: while let Some(chunk) = stream.next().await {
                if cancel.is_cancelled() {
                    break;
                }
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(anyhow::anyhow!("llm stream read error: {e}"))).await;
                        break;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buffer.find("\n\n") {
                    let event = buffer[..pos].to_string();
                    buffer = buffer[pos + 2..].to_string();

                    for line in event.lines() {
                        let Some(data) = line.strip_prefix("data: ") else { continue };
                        if data == "[DONE]" {
                            for tc in norm.finish_tool_calls(&tools) {
                                if tx.send(Ok(tc)).await.is_err() {
                                    break 'outer;
                                }
                            }
                            let _ = tx.send(Ok(Chunk::Finish)).await;
                            return;
                        }
                        let parsed: SseChunk = match serde_json::from_str(data) {
                            Ok(p) => p,
                            Err(_) => continue,
                        };
                        let Some(choice) = parsed.choices.into_iter().next() else { continue };
                        // Tool-call deltas are processed before the text delta so
                        // `saw_tool_call` is already set when `push_text` checks it —
                        // a single SSE event can carry both partial-JSON content and
                        // a tool-call delta, and that content must never leak
                        // (spec.md §4.5 rule 1).
                        for tcd in choice.delta.tool_calls {
                            let key = tcd.id.clone().unwrap_or_else(|| format!("call_{}", tcd.index));
                            let name = tcd.function.as_ref().and_then(|f| f.name.as_deref());
                            let args = tcd.function.as_ref().and_then(|f| f.arguments.as_deref());
                            norm.push_tool_call_fragment(&key, tcd.id.as_deref(), name, args);
                        }
                        if let Some(content) = choice.delta.content {
                            if let Some(delta) = norm.push_text(&content) {
                                if tx.send(Ok(Chunk::Text { delta })).await.is_err() {
                                    break 'outer;
                                }
                            }
                        }
                    }
                }
            }
            for tc in norm.finish_tool_calls(&tools) {
                let _ = tx.send(Ok(tc)).await;
            }
            let _ = tx.send(Ok(Chunk::Finish)).await;
        });

        Ok(rx)
    }

    async fn complete_once(&self, model: &str, messages: &[Message]) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.config().base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": model,
            "messages": to_wire_messages(messages),
            "stream": false,
        });
        let resp = self
            .request(self.client.post(&url).json(&body))
            .send()
            .await
            .context("cannot connect to llm backend")?;
        if !resp.status().is_success() {
            bail!("llm backend returned HTTP {}", resp.status());
        }
        let parsed: Value = resp.json().await.context("failed to parse llm response")?;
        let content = parsed["choices"][0]["message"]["content"].as_str().unwrap_or_default();
        Ok(content.to_string())
    }

    async fn update_config(&self, base_url: Option<String>, api_key: Option<String>) {
        apply_config_update(&self.config, base_url, api_key);
    }
}

// ===================== Test stub =====================

/// Deterministic adapter used by orchestrator scenario tests: replays a
/// fixed sequence of chunks regardless of input.
pub struct StubLlmAdapter {
    pub chunks: Vec<Chunk>,
}

#[async_trait]
impl LlmAdapter for StubLlmAdapter {
    async fn chat(
        &self,
        _model: &str,
        _messages: &[Message],
        _tools: &[ToolSpec],
        _cancel: CancelToken,
    ) -> Result<mpsc::Receiver<Result<Chunk>>> {
        let (tx, rx) = mpsc::channel(self.chunks.len().max(1) + 1);
        for c in self.chunks.clone() {
            let _ = tx.send(Ok(c)).await;
        }
        let _ = tx.send(Ok(Chunk::Finish)).await;
        Ok(rx)
    }

    async fn complete_once(&self, _model: &str, _messages: &[Message]) -> Result<String> {
        Ok(self
            .chunks
            .iter()
            .filter_map(|c| match c {
                Chunk::Text { delta } => Some(delta.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn tool(name: &str, required: &[&str]) -> ToolSpec {
        ToolSpec {
            name: name.to_string(),
            description: String::new(),
            json_schema_parameters: serde_json::json!({
                "type": "object",
                "properties": {},
                "required": required,
            }),
            category: "test".to_string(),
        }
    }

    #[test]
    fn text_buffered_and_discarded_when_tool_call_present() {
        let mut norm = Normalizer::new();
        assert_eq!(norm.push_text("partial"), Some("partial".to_string()));
        norm.push_tool_call_fragment("call_0", Some("id1"), Some("get_time"), Some("{}"));
        // Further text after a tool-call started is withheld.
        assert_eq!(norm.push_text(" json"), None);
    }

    #[test]
    fn text_in_same_event_as_a_tool_call_never_leaks() {
        // Mirrors the adapter loops' order: a tool-call fragment from the
        // same stream event/line is processed before the event's text
        // delta, so `push_text` already sees `saw_tool_call == true`.
        let mut norm = Normalizer::new();
        norm.push_tool_call_fragment("call_0", Some("id1"), Some("get_time"), Some("{}"));
        assert_eq!(norm.push_text("{\"partial json\":"), None);
    }

    #[test]
    fn fragmented_arguments_concatenate_by_id() {
        let mut norm = Normalizer::new();
        norm.push_tool_call_fragment("call_0", Some("id1"), Some("get_"), Some("{\"a\":"));
        norm.push_tool_call_fragment("call_0", None, Some("weather"), Some("1}"));
        let tools = vec![tool("get_weather", &[])];
        let out = norm.finish_tool_calls(&tools);
        assert_eq!(out.len(), 1);
        match &out[0] {
            Chunk::ToolCall { name, arguments, .. } => {
                assert_eq!(name, "get_weather");
                assert_eq!(arguments.get("a").and_then(|v| v.as_i64()), Some(1));
            }
            _ => panic!("expected tool call"),
        }
    }

    #[test]
    fn brace_balance_recovers_truncated_arguments() {
        // An object with a trailing unterminated string and no closing
        // brace has no balanced prefix at all; the reconstruction gives up
        // rather than guessing, and callers fall back to text extraction.
        let truncated = brace_balance_truncate(r#"{"city": "NYC", "units": "met"#);
        assert!(truncated.is_none());

        let recovered = brace_balance_truncate(r#"{"city": "NYC", "units": "metric"}extra garbage"#).unwrap();
        assert_eq!(recovered, r#"{"city": "NYC", "units": "metric"}"#);

        let clean = brace_balance_truncate(r#"{"city": "NYC"}"#).unwrap();
        assert_eq!(clean, r#"{"city": "NYC"}"#);
    }

    #[test]
    fn required_param_missing_drops_tool_call() {
        let mut norm = Normalizer::new();
        norm.push_tool_call_fragment("call_0", Some("id1"), Some("get_weather"), Some("not json at all"));
        let tools = vec![tool("get_weather", &["city"])];
        let out = norm.finish_tool_calls(&tools);
        assert!(out.is_empty());
    }

    #[test]
    fn repetition_guard_truncates_after_four_occurrences() {
        let mut norm = Normalizer::new();
        let mut last = None;
        for _ in 0..6 {
            last = norm.push_text("I'm ready ");
        }
        assert!(last.is_some());
        assert!(norm.truncated);
        // Further pushes are no-ops once truncated.
        assert_eq!(norm.push_text("more text"), None);
    }

    #[test]
    fn accumulated_text_over_2000_chars_truncates() {
        let mut norm = Normalizer::new();
        let chunk = "x".repeat(500);
        for _ in 0..5 {
            norm.push_text(&chunk);
        }
        assert!(norm.truncated);
        assert!(norm.text_buf.len() <= MAX_ACCUMULATED_CHARS);
    }

    #[test]
    fn extract_embedded_call_last_resort() {
        let text = r#"blah {"name":"get_weather","arguments":{"city":"nyc"}} blah"#;
        let args = extract_embedded_call(text, "get_weather").unwrap();
        let _: StdHashMap<String, Value> = args;
    }

    #[tokio::test]
    async fn update_config_swaps_base_url_and_api_key_in_place() {
        let adapter = OllamaAdapter::new(ProviderConfig::new("http://localhost:11434"));
        assert_eq!(adapter.config().base_url, "http://localhost:11434");
        assert!(adapter.config().api_key.is_none());

        adapter.update_config(Some("http://remote:11434".to_string()), Some("secret-key".to_string())).await;
        assert_eq!(adapter.config().base_url, "http://remote:11434");
        assert_eq!(adapter.config().api_key.as_deref(), Some("secret-key"));
    }

    #[tokio::test]
    async fn update_config_with_none_fields_leaves_existing_values() {
        let adapter = OllamaAdapter::new(ProviderConfig::new("http://localhost:11434").with_api_key("original"));
        adapter.update_config(None, None).await;
        assert_eq!(adapter.config().base_url, "http://localhost:11434");
        assert_eq!(adapter.config().api_key.as_deref(), Some("original"));
    }
}
