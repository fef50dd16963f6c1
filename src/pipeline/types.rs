//! Shared data model for the conversational pipeline engine.
//!
//! Mirrors the Session / Conversation / Message / Utterance / ToolSpec /
//! ToolCall / ToolResult / VADDecision types at the heart of the engine.
//! Kept in one module because nearly every other pipeline component
//! speaks in these types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// A reusable one-shot cooperative cancel signal (spec.md §3, §5). Cloning
/// shares the same underlying flag; `cancel()` wakes every clone currently
/// awaiting `cancelled()`. `reset()` is called on entering Listening or
/// starting a new Processing turn so the token is monotonic *within* a turn
/// but never carries over to the next one.
#[derive(Clone)]
pub struct CancelToken(Arc<CancelInner>);

struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(CancelInner {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        }))
    }

    pub fn cancel(&self) {
        self.0.flag.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.flag.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.flag.store(false, Ordering::SeqCst);
    }

    /// Resolves once `cancel()` has been called. Safe to poll repeatedly;
    /// if already cancelled, resolves immediately.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            self.0.notify.notified().await;
            if self.is_cancelled() {
                return;
            }
        }
    }
}

/// A contiguous span of speech captured between VAD speech-start and
/// speech-end, ready for transcription. Consumed once by the STT adapter.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
    pub width_bits: u16,
}

impl Utterance {
    pub fn from_pcm16le(pcm: Vec<u8>) -> Self {
        Self {
            pcm,
            sample_rate: 16_000,
            channels: 1,
            width_bits: 16,
        }
    }

    /// Duration implied by the PCM16 mono buffer length.
    pub fn duration_ms(&self) -> u64 {
        let bytes_per_sample = (self.width_bits / 8) as usize * self.channels as usize;
        if bytes_per_sample == 0 {
            return 0;
        }
        let samples = self.pcm.len() / bytes_per_sample;
        (samples as u64 * 1000) / self.sample_rate as u64
    }

    pub fn as_i16_samples(&self) -> Vec<i16> {
        self.pcm
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    }
}

/// One decision produced by the VAD gate for a completed window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadDecision {
    pub speech_probability: f32,
    pub is_currently_speech: bool,
    pub speech_just_ended: bool,
}

/// A structured function call proposed by the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: HashMap<String, serde_json::Value>,
}

/// The outcome of executing one ToolCall.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub id: String,
    pub name: String,
    pub ok: bool,
    pub text_or_error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_attachment: Option<serde_json::Value>,
}

/// A tagged conversation message. `index` is a conversation-local,
/// monotonically increasing counter assigned on append so that "strictly
/// increasing message index" (testable property) is checkable directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    User {
        index: u64,
        text: String,
    },
    Assistant {
        index: u64,
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        index: u64,
        tool_call_id: String,
        tool_name: String,
        result_text: String,
    },
    System {
        index: u64,
        text: String,
    },
}

impl Message {
    pub fn index(&self) -> u64 {
        match self {
            Message::User { index, .. }
            | Message::Assistant { index, .. }
            | Message::Tool { index, .. }
            | Message::System { index, .. } => *index,
        }
    }

    /// Approximate text content, used for token-budget estimation.
    pub fn text_len(&self) -> usize {
        match self {
            Message::User { text, .. } => text.len(),
            Message::Assistant { text, .. } => text.len(),
            Message::Tool { result_text, .. } => result_text.len(),
            Message::System { text, .. } => text.len(),
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Message::System { .. })
    }
}

/// A process-wide tool registration. Handlers live behind the registry
/// (see `pipeline::tools`); this struct carries only the declarative part.
#[derive(Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub json_schema_parameters: serde_json::Value,
    pub category: String,
}

/// Five-state session lifecycle (C8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Listening,
    Processing,
    Speaking,
    Interrupted,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Listening => "listening",
            SessionState::Processing => "processing",
            SessionState::Speaking => "speaking",
            SessionState::Interrupted => "interrupted",
        }
    }
}

/// Snapshot of one session's conversation, persisted to disk by the
/// Connection Manager and restored on reconnect for clients that present
/// a stable `client_id` (see spec.md §9, open question 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub client_id: String,
    pub state: SessionState,
    pub last_activity_at: DateTime<Utc>,
    pub speaking_started_at: Option<DateTime<Utc>>,
    pub system_prompt: String,
    pub messages: Vec<Message>,
}
