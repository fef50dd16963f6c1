//! Orchestrator-boundary error taxonomy (spec.md §7).
//!
//! Adapters themselves fail with `anyhow::Error` (see each adapter trait);
//! the orchestrator narrows those into this small typed enum so it can
//! choose the right client-visible `error` frame and recovery action
//! without matching on string content everywhere.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed frame or unknown control message type. Logged and
    /// ignored; the connection is preserved.
    #[error("client protocol error: {0}")]
    ClientProtocol(String),

    /// Network error, 5xx, or timeout talking to an adapter's backend.
    #[error("cannot connect to {adapter}: {detail}")]
    AdapterTransient { adapter: &'static str, detail: String },

    /// Model/voice not found, or similar configuration mismatch with a
    /// reachable backend.
    #[error("{adapter} configuration error: {detail}")]
    AdapterConfig { adapter: &'static str, detail: String },

    /// A tool invocation failed. Never terminates a turn; carried as a
    /// `tool_result` with `ok: false` instead of propagating here in
    /// practice, but kept as a variant for completeness/testing.
    #[error("tool '{name}' failed: {detail}")]
    ToolFailure { name: String, detail: String },

    /// VAD/STT/TTS engine failure mid-turn.
    #[error("{engine} engine failure: {detail}")]
    EngineFailure { engine: &'static str, detail: String },

    /// Session got stuck in a state past its timeout (e.g. Speaking > 30s).
    #[error("session stuck in {state} for longer than {secs}s")]
    StateTimeout { state: &'static str, secs: u64 },
}

impl PipelineError {
    /// The phrasing shown to the user in an `error` frame (§7 propagation
    /// policy: adapter-transient errors get a human-phrased message).
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::AdapterTransient { adapter, .. } => {
                format!("Cannot connect to {adapter} server. Please check it is running and reachable.")
            }
            PipelineError::AdapterConfig { adapter, detail } => {
                format!("{adapter} configuration problem: {detail}")
            }
            PipelineError::EngineFailure { engine, .. } => {
                format!("The {engine} engine hit an error; please try again.")
            }
            PipelineError::ToolFailure { name, detail } => {
                format!("Tool '{name}' failed: {detail}")
            }
            PipelineError::StateTimeout { .. } => {
                "The assistant took too long to finish speaking and has reset.".to_string()
            }
            PipelineError::ClientProtocol(detail) => detail.clone(),
        }
    }
}
