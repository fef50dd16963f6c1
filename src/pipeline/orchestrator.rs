//! Pipeline Orchestrator (C9).
//!
//! Wires C1–C8 per connection: the ingress loop dispatches binary frames
//! (barge-in probe vs. listening accumulation) and text control frames
//! (spec.md §6.3), while the turn runner — serialized by the caller
//! holding the session's outer `Arc<tokio::sync::Mutex<Session>>` for the
//! whole turn (see `server::voice_ws::spawn_turn`) — drives the twelve-step
//! STT → LLM → tools* → TTS
//! sequence (spec.md §4.9) and emits the strictly-ordered outbound frames
//! of spec.md §6.4. Built in the style of `server::realtime_voice`'s
//! message-loop shape, generalized from a single hardcoded voice flow
//! into this adapter-pluggable pipeline.

use super::conversation::Compactor;
use super::errors::PipelineError;
use super::llm::Chunk;
use super::llm::LlmAdapter;
use super::segmenter::SegmentOutcome;
use super::session::{Session, SessionEvent};
use super::stt::SttAdapter;
use super::tools::ToolExecutor;
use super::tts::TtsAdapter;
use super::types::{SessionState, ToolCall};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Server → client frame (spec.md §6.4). Serialized as a tagged JSON
/// object; the `type` field drives client-side dispatch the same way
/// `ControlMessage::type` drives ours.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum OutboundFrame {
    #[serde(rename = "state")]
    State { state: &'static str },
    #[serde(rename = "transcript")]
    Transcript { text: String, is_final: bool },
    #[serde(rename = "response_chunk")]
    ResponseChunk { text: String },
    #[serde(rename = "response")]
    Response { text: String },
    #[serde(rename = "tool_call")]
    ToolCall { tool: String },
    #[serde(rename = "tool_result")]
    ToolResult { tool: String, result: String },
    #[serde(rename = "audio")]
    Audio { data: String },
    #[serde(rename = "flyout")]
    Flyout { flyout_type: String, content: serde_json::Value },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "settings_updated")]
    SettingsUpdated { applied: serde_json::Value },
    #[serde(rename = "settings_warning")]
    SettingsWarning { message: String },
    #[serde(rename = "music_state")]
    MusicState { status: serde_json::Value },
    #[serde(rename = "interrupt")]
    Interrupt { reason: &'static str },
}

/// Client → server control frame (spec.md §6.3). Unknown `type` values
/// and frames missing required fields are logged and ignored (not an
/// error) — the connection is never closed over a malformed control
/// frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "start_listening")]
    StartListening,
    #[serde(rename = "stop_listening")]
    StopListening,
    #[serde(rename = "settings")]
    Settings {
        #[serde(default)]
        voice: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(rename = "voiceSpeed", default)]
        voice_speed: Option<f32>,
        /// Dialect swap isn't live-reconfigurable (spec.md §9 REDESIGN
        /// FLAGS precedent: the VAD backend is a startup-time choice, not
        /// a runtime fallback chain — this adapter follows the same
        /// rule), so a non-empty value here only produces a
        /// `settings_warning`.
        #[serde(rename = "llmBackend", default)]
        llm_backend: Option<String>,
        #[serde(rename = "llmUrl", default)]
        llm_url: Option<String>,
        #[serde(rename = "llmApiKey", default)]
        llm_api_key: Option<String>,
        #[serde(rename = "sttUrl", default)]
        stt_url: Option<String>,
        #[serde(rename = "ttsUrl", default)]
        tts_url: Option<String>,
    },
    #[serde(rename = "interrupt")]
    Interrupt,
    #[serde(rename = "playback_done")]
    PlaybackDone,
    #[serde(rename = "test_audio")]
    TestAudio {
        #[serde(default)]
        voice: Option<String>,
    },
    #[serde(rename = "clear_conversation")]
    ClearConversation,
    #[serde(rename = "text_message")]
    TextMessage { text: String },
    #[serde(rename = "music_command")]
    MusicCommand {
        command: String,
        #[serde(default)]
        params: serde_json::Value,
    },
}

/// Owned, flattened form of `ControlMessage::Settings`'s fields, so
/// `Orchestrator::apply_settings` doesn't take eight loose parameters.
struct SettingsUpdate {
    voice: Option<String>,
    model: Option<String>,
    voice_speed: Option<f32>,
    llm_backend: Option<String>,
    llm_url: Option<String>,
    llm_api_key: Option<String>,
    stt_url: Option<String>,
    tts_url: Option<String>,
}

/// The adapters + policy knobs a turn needs, shared across every session
/// in the process (spec.md §5: "the LLM adapter's HTTP client is a
/// per-process singleton").
pub struct PipelineServices {
    pub stt: Arc<dyn SttAdapter>,
    pub llm: Arc<dyn LlmAdapter>,
    pub tts: Arc<dyn TtsAdapter>,
    pub tools: Arc<ToolExecutor>,
    pub llm_model: String,
    pub speaking_rate: f32,
    pub token_budget: usize,
    /// Best-effort summarization pass run before the hard trim once a
    /// session's log crosses `compaction_max_messages` and
    /// `compaction_token_threshold`. `None` disables compaction entirely —
    /// `trim_to_token_limit` still runs and still guarantees the budget.
    pub compactor: Option<Arc<Compactor>>,
    pub compaction_max_messages: usize,
    pub compaction_token_threshold: usize,
    pub compaction_keep_recent: usize,
}

pub struct Orchestrator {
    services: Arc<PipelineServices>,
}

impl Orchestrator {
    pub fn new(services: Arc<PipelineServices>) -> Self {
        Self { services }
    }

    /// Handles one binary frame (spec.md §6.2, §4.9 barge-in path).
    /// Returns `true` when the chunk completed an utterance long enough
    /// to run a turn on (the caller is expected to spawn `run_turn` in
    /// that case, holding the session's outer mutex for the duration).
    pub async fn handle_binary_frame(
        &self,
        session: &mut Session,
        flag_byte: u8,
        pcm: &[u8],
        outbound: &mpsc::Sender<OutboundFrame>,
    ) -> bool {
        let tts_playing = flag_byte == 0x01;

        if tts_playing {
            // Barge-in probe: run VAD without buffering.
            let decision = session.vad.process(pcm);
            if decision.is_currently_speech && session.state() == SessionState::Speaking {
                info!(session = %session.id, "barge-in detected");
                session.interrupt();
                session.segmenter.clear();
                session.vad.reset();
                let _ = outbound.send(OutboundFrame::Interrupt { reason: "user_speech" }).await;
                let _ = outbound.send(OutboundFrame::State { state: session.state().as_str() }).await;
                session.apply(SessionEvent::StartListening);
                let _ = outbound.send(OutboundFrame::State { state: session.state().as_str() }).await;
            }
            return false;
        }

        if session.state() != SessionState::Listening {
            return false;
        }

        match session.segmenter.process(&mut session.vad, pcm) {
            SegmentOutcome::Accumulating => false,
            SegmentOutcome::DroppedAsNoise => {
                debug!(session = %session.id, "utterance dropped as noise (too short)");
                false
            }
            SegmentOutcome::Utterance(utterance) => {
                session.apply(SessionEvent::SpeechEndedLongEnough);
                session.pending_utterance = Some(utterance);
                true
            }
        }
    }

    /// Dispatches one text control frame (spec.md §6.3).
    pub async fn handle_control(
        &self,
        session: &mut Session,
        message: ControlMessage,
        outbound: &mpsc::Sender<OutboundFrame>,
    ) -> bool {
        match message {
            ControlMessage::StartListening => {
                session.apply(SessionEvent::StartListening);
                session.segmenter.clear();
                let _ = outbound.send(OutboundFrame::State { state: session.state().as_str() }).await;
                false
            }
            ControlMessage::StopListening => {
                session.apply(SessionEvent::StopListening);
                let _ = outbound.send(OutboundFrame::State { state: session.state().as_str() }).await;
                false
            }
            ControlMessage::Interrupt => {
                session.interrupt();
                let _ = outbound.send(OutboundFrame::State { state: session.state().as_str() }).await;
                false
            }
            ControlMessage::PlaybackDone => {
                if session.state() == SessionState::Speaking {
                    session.apply(SessionEvent::PlaybackDone);
                    let _ = outbound.send(OutboundFrame::State { state: session.state().as_str() }).await;
                }
                false
            }
            ControlMessage::ClearConversation => {
                session.conversation.clear();
                false
            }
            ControlMessage::Settings { voice, model, voice_speed, llm_backend, llm_url, llm_api_key, stt_url, tts_url } => {
                self.apply_settings(
                    session,
                    SettingsUpdate { voice, model, voice_speed, llm_backend, llm_url, llm_api_key, stt_url, tts_url },
                    outbound,
                )
                .await;
                false
            }
            ControlMessage::TestAudio { voice } => {
                if let Some(voice) = voice {
                    self.services.tts.set_voice(voice).await;
                }
                self.run_tts_only(session, "This is a test of the speech synthesis voice.", outbound).await;
                false
            }
            ControlMessage::TextMessage { text } => {
                if session.begin_text_turn() {
                    session.pending_text = Some(text);
                    true
                } else {
                    debug!(session = %session.id, "dropped text_message turn: already processing");
                    false
                }
            }
            ControlMessage::MusicCommand { command, params } => {
                let call = ToolCall {
                    id: uuid::Uuid::new_v4().to_string(),
                    name: format!("music_{command}"),
                    arguments: params
                        .as_object()
                        .map(|m| m.clone().into_iter().collect())
                        .unwrap_or_default(),
                };
                let result = self.services.tools.execute(&call).await;
                let _ = outbound
                    .send(OutboundFrame::MusicState {
                        status: serde_json::json!({ "ok": result.ok, "detail": result.text_or_error }),
                    })
                    .await;
                false
            }
        }
    }

    /// Runs compaction ahead of the hard trim when both thresholds are
    /// crossed (SPEC_FULL.md C4 supplement). Best-effort: a summarization
    /// failure just leaves the log as-is for `trim_to_token_limit` to
    /// handle on its own, matching `Compactor::compact`'s own fallback.
    async fn maybe_compact(&self, session: &mut Session) {
        let Some(compactor) = &self.services.compactor else { return };
        let messages = session.conversation.messages();
        if !Compactor::should_compact(messages, self.services.compaction_max_messages, self.services.compaction_token_threshold) {
            return;
        }
        match compactor.compact(messages, self.services.compaction_keep_recent).await {
            Ok(compacted) => session.conversation.replace_messages(compacted),
            Err(e) => warn!("conversation compaction failed, falling back to hard trim: {e}"),
        }
    }

    /// Applies a `settings` control frame (spec.md §6.3): merges the
    /// provided fields into the session's overrides, reconfigures the TTS
    /// adapter's default voice (the LLM model override is applied
    /// per-call — see `Session::effective_model`), reconfigures the LLM/
    /// STT/TTS adapters' base URLs and the LLM's API key in place, and
    /// persists the merged settings to
    /// `{data_dir}/users/{client_id}/settings.json` when the client
    /// presented a stable `client_id` (spec.md §6.6). Unset fields in the
    /// incoming frame leave the existing override untouched rather than
    /// clearing it.
    async fn apply_settings(&self, session: &mut Session, update: SettingsUpdate, outbound: &mpsc::Sender<OutboundFrame>) {
        let SettingsUpdate { voice, model, voice_speed, llm_backend, llm_url, llm_api_key, stt_url, tts_url } = update;

        if let Some(voice) = voice {
            self.services.tts.set_voice(voice.clone()).await;
            session.settings.voice = Some(voice);
        }
        if let Some(model) = model {
            session.settings.model = Some(model);
        }
        if let Some(rate) = voice_speed {
            session.settings.voice_speed = Some(super::tts::clamp_speaking_rate(rate));
        }

        if let Some(backend) = llm_backend {
            warn!(requested = %backend, "llmBackend cannot be changed at runtime, ignoring");
            let _ = outbound
                .send(OutboundFrame::SettingsWarning {
                    message: "llm backend is a startup-time choice and cannot be changed at runtime".to_string(),
                })
                .await;
        }
        if llm_url.is_some() || llm_api_key.is_some() {
            self.services.llm.update_config(llm_url, llm_api_key).await;
        }
        if stt_url.is_some() {
            self.services.stt.update_config(stt_url).await;
        }
        if tts_url.is_some() {
            self.services.tts.update_config(tts_url).await;
        }

        if let Some(client_id) = &session.client_id {
            if let Err(e) = session.settings.save(client_id) {
                warn!(client_id = %client_id, error = %e, "failed to persist client settings");
                let _ = outbound
                    .send(OutboundFrame::SettingsWarning { message: "settings applied but not persisted".to_string() })
                    .await;
            }
        }

        let applied = serde_json::json!({
            "voice": session.settings.voice,
            "model": session.settings.model,
            "voiceSpeed": session.settings.voice_speed,
        });
        let _ = outbound.send(OutboundFrame::SettingsUpdated { applied }).await;
    }

    async fn run_tts_only(&self, session: &Session, text: &str, outbound: &mpsc::Sender<OutboundFrame>) {
        let speaking_rate = session.effective_speaking_rate(self.services.speaking_rate);
        match self.services.tts.synthesize_stream(text, speaking_rate, session.cancel_token.clone()).await {
            Ok(mut rx) => {
                while let Some(chunk) = rx.recv().await {
                    match chunk {
                        Ok(bytes) => {
                            let data = base64::engine::general_purpose::STANDARD.encode(bytes);
                            let _ = outbound.send(OutboundFrame::Audio { data }).await;
                        }
                        Err(e) => {
                            warn!("test_audio synthesis error: {e}");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                let _ = outbound
                    .send(OutboundFrame::Error {
                        message: PipelineError::AdapterTransient { adapter: "tts", detail: e.to_string() }.user_message(),
                    })
                    .await;
            }
        }
    }

    /// Runs one full turn (spec.md §4.9 "Order of operations inside a
    /// turn"). The caller must already hold the session's outer
    /// `tokio::sync::Mutex` (step 1's "tryLock") before calling this; a
    /// second concurrent attempt blocks on that mutex and then no-ops via
    /// the `Processing`-state guard just below, which is this
    /// implementation's equivalent of "if already held, drop the turn".
    pub async fn run_turn(&self, session: &mut Session, outbound: mpsc::Sender<OutboundFrame>) {
        // Step 2: re-check state and that there's something to run on.
        if session.state() != SessionState::Processing {
            return;
        }

        // Step 4: announce the Processing transition (must precede
        // `transcript` per spec.md §8's ordering invariant).
        let _ = outbound.send(OutboundFrame::State { state: session.state().as_str() }).await;

        session.reset_cancel();

        // Step 5: STT (or the text_message bypass).
        let transcript = if let Some(text) = session.pending_text.take() {
            text
        } else if let Some(utterance) = session.pending_utterance.take() {
            match self.services.stt.transcribe(&utterance).await {
                Ok(text) => text,
                Err(e) => {
                    warn!("stt failure: {e}");
                    let _ = outbound
                        .send(OutboundFrame::Error {
                            message: PipelineError::AdapterTransient { adapter: "stt", detail: e.to_string() }.user_message(),
                        })
                        .await;
                    session.apply(SessionEvent::EmptyReplyOrError);
                    let _ = outbound.send(OutboundFrame::State { state: session.state().as_str() }).await;
                    return;
                }
            }
        } else {
            session.apply(SessionEvent::EmptyReplyOrError);
            let _ = outbound.send(OutboundFrame::State { state: session.state().as_str() }).await;
            return;
        };

        if transcript.trim().is_empty() {
            session.apply(SessionEvent::EmptyReplyOrError);
            let _ = outbound.send(OutboundFrame::State { state: session.state().as_str() }).await;
            return;
        }

        // Step 6.
        let _ = outbound.send(OutboundFrame::Transcript { text: transcript.clone(), is_final: true }).await;
        session.conversation.append_user(transcript);

        // Step 7: tools are passed fresh to every call, so there is no
        // mutable registration step to repeat here.
        let tool_specs = self.services.tools.registry_specs();

        // Step 8: first LLM pass.
        self.maybe_compact(session).await;
        session.conversation.trim_to_token_limit(self.services.token_budget);
        let messages = session.conversation.render_for_llm(true);
        let (mut full_response, mut tool_calls, tool_ran) =
            self.run_llm_pass(session, &messages, &tool_specs, &outbound).await;

        // Follow-up call fires unconditionally on this one condition,
        // never nested (SPEC_FULL.md REDESIGN FLAGS).
        if full_response.trim().is_empty() && tool_ran {
            self.maybe_compact(session).await;
            session.conversation.trim_to_token_limit(self.services.token_budget);
            let followup_messages = session.conversation.render_for_llm(true);
            let (followup_text, followup_calls, _) =
                self.run_llm_pass(session, &followup_messages, &tool_specs, &outbound).await;
            full_response = followup_text;
            tool_calls.extend(followup_calls);
        }

        // Step 9.
        if full_response.trim().is_empty() {
            session.apply(SessionEvent::EmptyReplyOrError);
            let _ = outbound.send(OutboundFrame::State { state: session.state().as_str() }).await;
            return;
        }

        // Step 10.
        session.conversation.append_assistant(full_response.clone(), tool_calls);
        let _ = outbound.send(OutboundFrame::Response { text: full_response.clone() }).await;

        // Step 11.
        session.apply(SessionEvent::ReplyReady);
        let _ = outbound.send(OutboundFrame::State { state: session.state().as_str() }).await;

        let speaking_rate = session.effective_speaking_rate(self.services.speaking_rate);
        match self.services.tts.synthesize_stream(&full_response, speaking_rate, session.cancel_token.clone()).await {
            Ok(mut rx) => {
                while let Some(chunk) = rx.recv().await {
                    if session.cancel_token.is_cancelled() {
                        break;
                    }
                    match chunk {
                        Ok(bytes) => {
                            let data = base64::engine::general_purpose::STANDARD.encode(bytes);
                            if outbound.send(OutboundFrame::Audio { data }).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("tts stream error: {e}");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                let _ = outbound
                    .send(OutboundFrame::Error {
                        message: PipelineError::AdapterTransient { adapter: "tts", detail: e.to_string() }.user_message(),
                    })
                    .await;
            }
        }
        // Step 12 (playback_done / speaking_timeout) is driven externally
        // by `handle_control` and the connection manager's sweep.
    }

    /// One LLM stream consumption: forwards text deltas, executes tool
    /// calls inline, appends their results to the conversation. Returns
    /// the accumulated text, the tool calls proposed, and whether any
    /// tool actually ran (spec.md §4.9 step 8).
    async fn run_llm_pass(
        &self,
        session: &mut Session,
        messages: &[super::types::Message],
        tool_specs: &[super::types::ToolSpec],
        outbound: &mpsc::Sender<OutboundFrame>,
    ) -> (String, Vec<ToolCall>, bool) {
        let mut full_text = String::new();
        let mut tool_calls = Vec::new();
        let mut tool_ran = false;

        let model = session.effective_model(&self.services.llm_model).to_string();
        let mut rx = match self.services.llm.chat(&model, messages, tool_specs, session.cancel_token.clone()).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!("llm call failed: {e}");
                let _ = outbound
                    .send(OutboundFrame::Error {
                        message: PipelineError::AdapterTransient { adapter: "llm", detail: e.to_string() }.user_message(),
                    })
                    .await;
                return (full_text, tool_calls, tool_ran);
            }
        };

        while let Some(item) = rx.recv().await {
            if session.cancel_token.is_cancelled() {
                break;
            }
            match item {
                Ok(Chunk::Text { delta }) => {
                    full_text.push_str(&delta);
                    let _ = outbound.send(OutboundFrame::ResponseChunk { text: full_text.clone() }).await;
                }
                Ok(Chunk::ToolCall { id, name, arguments }) => {
                    let call = ToolCall { id, name: name.clone(), arguments };
                    let _ = outbound.send(OutboundFrame::ToolCall { tool: name.clone() }).await;
                    let result = self.services.tools.execute(&call).await;
                    tool_ran = true;
                    let _ = outbound
                        .send(OutboundFrame::ToolResult { tool: name.clone(), result: result.text_or_error.clone() })
                        .await;
                    session.conversation.append_tool_result(result.id.clone(), result.name.clone(), result.text_or_error.clone());
                    tool_calls.push(call);
                }
                Ok(Chunk::Finish) => break,
                Err(e) => {
                    warn!("llm stream error: {e}");
                    let _ = outbound
                        .send(OutboundFrame::Error {
                            message: PipelineError::AdapterTransient { adapter: "llm", detail: e.to_string() }.user_message(),
                        })
                        .await;
                    break;
                }
            }
        }

        (full_text, tool_calls, tool_ran)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::llm::StubLlmAdapter;
    use crate::pipeline::stt::StubSttAdapter;
    use crate::pipeline::tools::{builtin_registry, ToolExecutor};
    use crate::pipeline::tts::StubTtsAdapter;
    use crate::pipeline::types::Utterance;
    use crate::pipeline::vad::{EnergyClassifier, VadGate, VadGateConfig};

    fn services(llm_text: &str) -> Arc<PipelineServices> {
        Arc::new(PipelineServices {
            stt: Arc::new(StubSttAdapter { fixed_transcript: "hello there".to_string() }),
            llm: Arc::new(StubLlmAdapter { chunks: vec![Chunk::Text { delta: llm_text.to_string() }] }),
            tts: Arc::new(StubTtsAdapter { chunk: vec![1, 2, 3, 4] }),
            tools: Arc::new(ToolExecutor::new(Arc::new(builtin_registry()), 4, 5)),
            llm_model: "test-model".to_string(),
            speaking_rate: 1.0,
            token_budget: 6000,
            compactor: None,
            compaction_max_messages: 40,
            compaction_token_threshold: 4000,
            compaction_keep_recent: 12,
        })
    }

    fn test_session() -> Session {
        let vad = VadGate::new(Box::new(EnergyClassifier::default()), VadGateConfig::default());
        Session::new("s1", "sys", 100, vad)
    }

    #[tokio::test]
    async fn full_turn_emits_frames_in_spec_order() {
        let orchestrator = Orchestrator::new(services("hi back"));
        let mut session = test_session();
        session.apply(SessionEvent::StartListening);
        session.pending_utterance = Some(Utterance::from_pcm16le(vec![0u8; 32000]));
        session.apply(SessionEvent::SpeechEndedLongEnough);

        let (tx, mut rx) = mpsc::channel(64);
        orchestrator.run_turn(&mut session, tx).await;

        let mut kinds = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            kinds.push(match frame {
                OutboundFrame::Transcript { .. } => "transcript",
                OutboundFrame::Response { .. } => "response",
                OutboundFrame::State { .. } => "state",
                OutboundFrame::Audio { .. } => "audio",
                _ => "other",
            });
        }

        let transcript_pos = kinds.iter().position(|k| *k == "transcript").unwrap();
        let response_pos = kinds.iter().position(|k| *k == "response").unwrap();
        let audio_pos = kinds.iter().position(|k| *k == "audio").unwrap();
        assert!(transcript_pos < response_pos);
        assert!(response_pos < audio_pos);
        assert_eq!(session.state(), SessionState::Speaking);
    }

    #[tokio::test]
    async fn empty_transcript_returns_to_listening_without_llm_call() {
        let orchestrator = Orchestrator::new(Arc::new(PipelineServices {
            stt: Arc::new(StubSttAdapter { fixed_transcript: String::new() }),
            llm: Arc::new(StubLlmAdapter { chunks: vec![Chunk::Text { delta: "should not be reached".to_string() }] }),
            tts: Arc::new(StubTtsAdapter { chunk: vec![] }),
            tools: Arc::new(ToolExecutor::new(Arc::new(builtin_registry()), 4, 5)),
            llm_model: "test-model".to_string(),
            speaking_rate: 1.0,
            token_budget: 6000,
            compactor: None,
            compaction_max_messages: 40,
            compaction_token_threshold: 4000,
            compaction_keep_recent: 12,
        }));
        let mut session = test_session();
        session.apply(SessionEvent::StartListening);
        session.pending_utterance = Some(Utterance::from_pcm16le(vec![0u8; 32000]));
        session.apply(SessionEvent::SpeechEndedLongEnough);

        let (tx, _rx) = mpsc::channel(64);
        orchestrator.run_turn(&mut session, tx).await;

        assert_eq!(session.state(), SessionState::Listening);
        assert!(session.conversation.messages().is_empty());
    }

    #[tokio::test]
    async fn barge_in_sets_cancel_token_and_interrupts() {
        let orchestrator = Orchestrator::new(services("reply"));
        let mut session = test_session();
        session.apply(SessionEvent::StartListening);
        session.apply(SessionEvent::SpeechEndedLongEnough);
        session.apply(SessionEvent::ReplyReady);
        assert_eq!(session.state(), SessionState::Speaking);

        let (tx, _rx) = mpsc::channel(64);
        let mut loud = Vec::new();
        for i in 0..600 {
            let v: i16 = if i % 2 == 0 { 20000 } else { -20000 };
            loud.extend_from_slice(&v.to_le_bytes());
        }
        orchestrator.handle_binary_frame(&mut session, 0x01, &loud, &tx).await;

        assert!(session.cancel_token.is_cancelled());
    }

    #[tokio::test]
    async fn run_turn_compacts_before_trim_once_thresholds_are_crossed() {
        let llm: Arc<dyn LlmAdapter> = Arc::new(StubLlmAdapter { chunks: vec![Chunk::Text { delta: "ok".to_string() }] });
        let compactor = Arc::new(crate::pipeline::conversation::Compactor::new(llm.clone(), "test-model".to_string()));
        let services = Arc::new(PipelineServices {
            stt: Arc::new(StubSttAdapter { fixed_transcript: "one more thing".to_string() }),
            llm,
            tts: Arc::new(StubTtsAdapter { chunk: vec![1, 2, 3] }),
            tools: Arc::new(ToolExecutor::new(Arc::new(builtin_registry()), 4, 5)),
            llm_model: "test-model".to_string(),
            speaking_rate: 1.0,
            token_budget: 6000,
            compactor: Some(compactor),
            compaction_max_messages: 2,
            compaction_token_threshold: 1,
            compaction_keep_recent: 1,
        });
        let orchestrator = Orchestrator::new(services);

        let mut session = test_session();
        for i in 0..5 {
            session.conversation.append_user(format!("filler message number {i} with enough text"));
        }
        session.apply(SessionEvent::StartListening);
        session.pending_utterance = Some(Utterance::from_pcm16le(vec![0u8; 32000]));
        session.apply(SessionEvent::SpeechEndedLongEnough);

        let (tx, _rx) = mpsc::channel(64);
        orchestrator.run_turn(&mut session, tx).await;

        let messages = session.conversation.messages();
        assert!(messages.len() < 5 + 2, "expected compaction to have collapsed older filler messages");
        assert!(matches!(messages.first(), Some(crate::pipeline::types::Message::System { .. })));
    }

    #[tokio::test]
    async fn settings_frame_applies_overrides_and_warns_on_llm_backend() {
        let orchestrator = Orchestrator::new(services("hi"));
        let mut session = test_session();
        let (tx, mut rx) = mpsc::channel(64);

        let applied = orchestrator
            .handle_control(
                &mut session,
                ControlMessage::Settings {
                    voice: Some("nova".to_string()),
                    model: Some("gpt-test".to_string()),
                    voice_speed: Some(1.5),
                    llm_backend: Some("openai".to_string()),
                    llm_url: None,
                    llm_api_key: None,
                    stt_url: None,
                    tts_url: None,
                },
                &tx,
            )
            .await;
        assert!(!applied);

        assert_eq!(session.settings.voice.as_deref(), Some("nova"));
        assert_eq!(session.settings.model.as_deref(), Some("gpt-test"));
        assert_eq!(session.settings.voice_speed, Some(1.5));
        assert_eq!(session.effective_model("default-model"), "gpt-test");

        let mut saw_warning = false;
        let mut saw_update = false;
        while let Ok(frame) = rx.try_recv() {
            match frame {
                OutboundFrame::SettingsWarning { .. } => saw_warning = true,
                OutboundFrame::SettingsUpdated { .. } => saw_update = true,
                _ => {}
            }
        }
        assert!(saw_warning, "expected a settings_warning for the unsupported llmBackend field");
        assert!(saw_update, "expected a settings_updated frame");
    }
}
