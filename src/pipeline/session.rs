//! Session + Session State Machine (C8).
//!
//! Owns the per-connection mutable state spec.md §3 describes (PCM
//! buffer, conversation, cancel token, timestamps) and
//! the five-state transition table from spec.md §4.8. The state machine
//! itself is a small, synchronous, panic-free transition function so the
//! orchestrator can unit-test it independently of any network or adapter
//! concerns — follows the `AuthState`-style owning-struct pattern
//! (`server/auth.rs`), generalized with an explicit allowed-transition
//! table instead of ad hoc field mutation.

use super::conversation::Conversation;
use super::segmenter::Segmenter;
use super::types::{CancelToken, SessionSnapshot, SessionState, Utterance};
use super::vad::VadGate;
use crate::config::ClientSettings;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::warn;

/// Speaking > this long without a `playback_done` auto-recovers to Idle
/// (spec.md §4.8, §7 taxonomy #6).
pub const SPEAKING_TIMEOUT: Duration = Duration::from_secs(30);

/// An event that can drive the state machine. Named after the client
/// actions / internal signals in spec.md §4.8's transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    StartListening,
    StopListening,
    SpeechEndedLongEnough,
    ReplyReady,
    EmptyReplyOrError,
    BargeInDetected,
    PlaybackDone,
    SpeakingTimeout,
    Interrupt,
}

/// Applies one transition of spec.md §4.8's table. Returns `None` for a
/// disallowed transition (the caller should ignore the event, not panic —
/// every external trigger for this function ultimately comes from client
/// input or a timer, never a programming invariant).
pub fn transition(state: SessionState, event: SessionEvent) -> Option<SessionState> {
    use SessionEvent::*;
    use SessionState::*;
    match (state, event) {
        (Idle, StartListening) => Some(Listening),
        (Listening, SpeechEndedLongEnough) => Some(Processing),
        (Listening, StopListening) => Some(Idle),
        (Processing, ReplyReady) => Some(Speaking),
        (Processing, EmptyReplyOrError) => Some(Listening),
        (Speaking, BargeInDetected) => Some(Interrupted),
        (Speaking, PlaybackDone) => Some(Listening),
        (Speaking, SpeakingTimeout) => Some(Idle),
        (Interrupted, _) => Some(Listening),
        // `interrupt()` always sets the cancel token; it only moves the
        // state machine when currently Speaking (spec.md §4.8).
        (Speaking, Interrupt) => Some(Interrupted),
        _ => None,
    }
}

/// One live client connection's mutable state (spec.md §3).
pub struct Session {
    pub id: String,
    pub client_id: Option<String>,
    pub created_at: DateTime<Utc>,
    state: SessionState,
    pub segmenter: Segmenter,
    pub vad: VadGate,
    pub conversation: Conversation,
    pub cancel_token: CancelToken,
    pub speaking_started_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    /// Handoff slot from the ingress loop to the turn runner: the
    /// finalized utterance for a STT-driven turn (spec.md §4.9 step 5).
    pub pending_utterance: Option<Utterance>,
    /// Handoff slot for the `text_message` STT bypass (spec.md §6.3).
    pub pending_text: Option<String>,
    /// Per-client adapter overrides applied by a `settings` control frame
    /// (spec.md §6.3) and restored from `{data_dir}/users/{client_id}/
    /// settings.json` (spec.md §6.6) on connect, when the client presents a
    /// stable `client_id`.
    pub settings: ClientSettings,
}

impl Session {
    pub fn new(id: impl Into<String>, system_prompt: impl Into<String>, max_entries: usize, vad: VadGate) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            client_id: None,
            created_at: now,
            state: SessionState::Idle,
            segmenter: Segmenter::new(),
            vad,
            conversation: Conversation::new(system_prompt, max_entries),
            cancel_token: CancelToken::new(),
            speaking_started_at: None,
            last_activity_at: now,
            pending_utterance: None,
            pending_text: None,
            settings: ClientSettings::default(),
        }
    }

    /// The model name a turn's LLM call should use: the per-client
    /// override from a `settings` control frame if one was applied,
    /// otherwise the process-wide configured default.
    pub fn effective_model<'a>(&'a self, default: &'a str) -> &'a str {
        self.settings.model.as_deref().unwrap_or(default)
    }

    /// The speaking rate a turn's TTS call should use, already clamped to
    /// `[0.5, 2.0]` (spec.md §4.7).
    pub fn effective_speaking_rate(&self, default: f32) -> f32 {
        super::tts::clamp_speaking_rate(self.settings.voice_speed.unwrap_or(default))
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Applies `event`; a disallowed transition is a no-op (logged), not
    /// an error — matching spec.md's framing of the table as *permitted*
    /// transitions, with anything else silently ignored by callers who
    /// guard state before acting anyway.
    pub fn apply(&mut self, event: SessionEvent) -> SessionState {
        match transition(self.state, event) {
            Some(next) => {
                self.last_activity_at = Utc::now();
                if next == SessionState::Speaking {
                    self.speaking_started_at = Some(self.last_activity_at);
                }
                if next == SessionState::Listening {
                    self.segmenter.clear();
                }
                self.state = next;
                next
            }
            None => {
                warn!(session = %self.id, ?event, state = ?self.state, "ignored disallowed state transition");
                self.state
            }
        }
    }

    /// `interrupt()` (spec.md §4.8): sets the cancel token unconditionally
    /// and, only if currently Speaking, moves to Interrupted.
    pub fn interrupt(&mut self) {
        self.cancel_token.cancel();
        if self.state == SessionState::Speaking {
            self.apply(SessionEvent::BargeInDetected);
        }
    }

    /// Resets the cancel token for a fresh turn (spec.md §5: monotonic
    /// within a turn, reset on entering Listening or starting Processing).
    pub fn reset_cancel(&mut self) {
        self.cancel_token.reset();
    }

    /// Forces entry into Processing for the `text_message` STT bypass
    /// (spec.md §6.3), which has no VAD speech-end of its own to drive the
    /// normal Listening→Processing transition. Returns `false` (and leaves
    /// state untouched) when a turn is already in flight, matching step 1's
    /// "tryLock; if already held, drop the turn" rule for audio-driven
    /// turns.
    pub fn begin_text_turn(&mut self) -> bool {
        match self.state {
            SessionState::Processing | SessionState::Speaking => false,
            SessionState::Idle | SessionState::Interrupted => {
                self.apply(SessionEvent::StartListening);
                self.apply(SessionEvent::SpeechEndedLongEnough);
                true
            }
            SessionState::Listening => {
                self.apply(SessionEvent::SpeechEndedLongEnough);
                true
            }
        }
    }

    pub fn speaking_timed_out(&self) -> bool {
        self.state == SessionState::Speaking
            && self
                .speaking_started_at
                .map(|t| Utc::now().signed_duration_since(t).to_std().unwrap_or_default() >= SPEAKING_TIMEOUT)
                .unwrap_or(false)
    }

    pub fn snapshot(&self) -> Option<SessionSnapshot> {
        let client_id = self.client_id.clone()?;
        Some(SessionSnapshot {
            client_id,
            state: self.state,
            last_activity_at: self.last_activity_at,
            speaking_started_at: self.speaking_started_at,
            system_prompt: self.conversation.system_prompt().to_string(),
            messages: self.conversation.messages().to_vec(),
        })
    }

    /// Restores conversation state from a snapshot presented by a client
    /// that opted in with a stable `client_id` (spec.md §9 open question
    /// 3). The live `state`/timestamps are *not* restored — a reconnect
    /// always starts fresh in Idle regardless of what was persisted.
    pub fn restore_from(&mut self, snapshot: SessionSnapshot, max_entries: usize) {
        self.client_id = Some(snapshot.client_id);
        self.conversation = Conversation::new(snapshot.system_prompt, max_entries);
        for message in snapshot.messages {
            self.conversation.restore_message(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::vad::{EnergyClassifier, VadGateConfig};

    fn test_vad() -> VadGate {
        VadGate::new(Box::new(EnergyClassifier::default()), VadGateConfig::default())
    }

    #[test]
    fn full_happy_path_cycle() {
        let mut s = SessionState::Idle;
        s = transition(s, SessionEvent::StartListening).unwrap();
        assert_eq!(s, SessionState::Listening);
        s = transition(s, SessionEvent::SpeechEndedLongEnough).unwrap();
        assert_eq!(s, SessionState::Processing);
        s = transition(s, SessionEvent::ReplyReady).unwrap();
        assert_eq!(s, SessionState::Speaking);
        s = transition(s, SessionEvent::PlaybackDone).unwrap();
        assert_eq!(s, SessionState::Listening);
    }

    #[test]
    fn barge_in_then_any_event_returns_to_listening() {
        let mut s = SessionState::Speaking;
        s = transition(s, SessionEvent::BargeInDetected).unwrap();
        assert_eq!(s, SessionState::Interrupted);
        s = transition(s, SessionEvent::StartListening).unwrap();
        assert_eq!(s, SessionState::Listening);
    }

    #[test]
    fn speaking_timeout_goes_idle_not_listening() {
        let next = transition(SessionState::Speaking, SessionEvent::SpeakingTimeout).unwrap();
        assert_eq!(next, SessionState::Idle);
    }

    #[test]
    fn disallowed_transition_is_rejected() {
        assert!(transition(SessionState::Idle, SessionEvent::ReplyReady).is_none());
        assert!(transition(SessionState::Processing, SessionEvent::PlaybackDone).is_none());
    }

    #[test]
    fn interrupt_sets_cancel_token_and_moves_from_speaking_only() {
        let mut session = Session::new("s1", "sys", 100, test_vad());
        session.apply(SessionEvent::StartListening);
        assert!(!session.cancel_token.is_cancelled());
        session.interrupt();
        assert!(session.cancel_token.is_cancelled());
        assert_eq!(session.state(), SessionState::Listening);

        session.reset_cancel();
        session.apply(SessionEvent::SpeechEndedLongEnough);
        session.apply(SessionEvent::ReplyReady);
        assert_eq!(session.state(), SessionState::Speaking);
        session.interrupt();
        assert_eq!(session.state(), SessionState::Interrupted);
    }

    #[test]
    fn speaking_timed_out_detects_elapsed_budget() {
        let mut session = Session::new("s1", "sys", 100, test_vad());
        session.apply(SessionEvent::StartListening);
        session.apply(SessionEvent::SpeechEndedLongEnough);
        session.apply(SessionEvent::ReplyReady);
        assert!(!session.speaking_timed_out());
        session.speaking_started_at = Some(Utc::now() - chrono::Duration::seconds(31));
        assert!(session.speaking_timed_out());
    }

    #[test]
    fn effective_model_and_rate_fall_back_to_defaults_until_overridden() {
        let mut session = Session::new("s1", "sys", 100, test_vad());
        assert_eq!(session.effective_model("default-model"), "default-model");
        assert_eq!(session.effective_speaking_rate(1.0), 1.0);

        session.settings.model = Some("gpt-test".to_string());
        session.settings.voice_speed = Some(1.5);
        assert_eq!(session.effective_model("default-model"), "gpt-test");
        assert_eq!(session.effective_speaking_rate(1.0), 1.5);
    }

    #[test]
    fn effective_speaking_rate_clamps_an_out_of_range_override() {
        let mut session = Session::new("s1", "sys", 100, test_vad());
        session.settings.voice_speed = Some(9.0);
        assert_eq!(session.effective_speaking_rate(1.0), 2.0);
    }
}
