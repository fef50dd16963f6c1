//! Conversation Store (C4).
//!
//! An ordered, bounded per-session message log with a token-budget hard
//! trim, plus an optional LLM-powered compaction pass that supplements
//! (never replaces) the trim — in the shape of `agent/compaction.rs`'s
//! `SessionCompactor`, adapted onto `pipeline::types::Message`.

use super::types::{Message, ToolCall};
use anyhow::Result;
use tracing::{debug, info};

/// Conservative chars-per-token estimate used throughout this corpus.
const CHARS_PER_TOKEN: usize = 4;

pub struct Conversation {
    system_prompt: String,
    messages: Vec<Message>,
    next_index: u64,
    max_entries: usize,
}

impl Conversation {
    pub fn new(system_prompt: impl Into<String>, max_entries: usize) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            messages: Vec::new(),
            next_index: 0,
            max_entries,
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    fn next_index(&mut self) -> u64 {
        let idx = self.next_index;
        self.next_index += 1;
        idx
    }

    fn push_bounded(&mut self, message: Message) {
        self.messages.push(message);
        if self.messages.len() > self.max_entries {
            self.messages.remove(0);
        }
    }

    pub fn append_user(&mut self, text: impl Into<String>) {
        let index = self.next_index();
        self.push_bounded(Message::User { index, text: text.into() });
    }

    pub fn append_assistant(&mut self, text: impl Into<String>, tool_calls: Vec<ToolCall>) {
        let index = self.next_index();
        self.push_bounded(Message::Assistant { index, text: text.into(), tool_calls });
    }

    pub fn append_tool_result(&mut self, tool_call_id: impl Into<String>, tool_name: impl Into<String>, text: impl Into<String>) {
        let index = self.next_index();
        self.push_bounded(Message::Tool {
            index,
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            result_text: text.into(),
        });
    }

    /// Renders the message log for an LLM call. `include_system` controls
    /// whether the immutable system prompt is prepended as a `Message::System`.
    pub fn render_for_llm(&self, include_system: bool) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        if include_system {
            out.push(Message::System { index: 0, text: self.system_prompt.clone() });
        }
        out.extend(self.messages.iter().cloned());
        out
    }

    fn estimate_tokens(&self) -> usize {
        let text_len: usize = self.messages.iter().map(|m| m.text_len()).sum();
        (self.system_prompt.len() + text_len) / CHARS_PER_TOKEN
    }

    /// Drops oldest non-system messages until the token estimate is under
    /// budget. The system prompt is never dropped (it lives outside
    /// `messages` entirely, so it is trivially always kept).
    pub fn trim_to_token_limit(&mut self, token_budget: usize) {
        while self.estimate_tokens() > token_budget && !self.messages.is_empty() {
            self.messages.remove(0);
        }
    }

    /// Drops all messages, keeping the (immutable) system prompt.
    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Swaps in a compacted message set (e.g. `Compactor::compact`'s
    /// output), keeping `next_index` ahead of the highest surviving index
    /// so subsequently appended messages still satisfy strictly-increasing
    /// ordering.
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.next_index = messages.iter().map(|m| m.index() + 1).max().unwrap_or(self.next_index);
        self.messages = messages;
    }

    /// Re-inserts a message restored from a persisted snapshot, keeping
    /// `next_index` ahead of every restored index so newly appended
    /// messages still satisfy strictly-increasing ordering.
    pub fn restore_message(&mut self, message: Message) {
        self.next_index = self.next_index.max(message.index() + 1);
        self.push_bounded(message);
    }
}

/// Threshold policy + LLM-summarization compaction, layered in front of
/// `trim_to_token_limit`. Grounded on `agent/compaction.rs::SessionCompactor`;
/// unlike the hard trim this is best-effort and never the only line of
/// defense against budget overrun — `Conversation::trim_to_token_limit`
/// still runs afterward regardless of whether compaction ran or failed.
pub struct Compactor {
    llm: std::sync::Arc<dyn super::llm::LlmAdapter>,
    model: String,
}

impl Compactor {
    pub fn new(llm: std::sync::Arc<dyn super::llm::LlmAdapter>, model: impl Into<String>) -> Self {
        Self { llm, model: model.into() }
    }

    pub fn should_compact(messages: &[Message], max_messages: usize, token_threshold: usize) -> bool {
        if messages.len() <= max_messages {
            return false;
        }
        let tokens: usize = messages.iter().map(|m| m.text_len()).sum::<usize>() / CHARS_PER_TOKEN;
        tokens > token_threshold
    }

    /// Summarizes all but the most recent `keep_recent` messages into a
    /// single `Message::System` entry, following a split/extract/
    /// summarize/rebuild shape.
    pub async fn compact(&self, messages: &[Message], keep_recent: usize) -> Result<Vec<Message>> {
        if messages.len() <= keep_recent {
            return Ok(messages.to_vec());
        }

        let split = messages.len() - keep_recent;
        let to_compact = &messages[..split];
        let to_keep = &messages[split..];

        info!("compacting {} messages, keeping {} recent", to_compact.len(), to_keep.len());

        let summary = self.summarize(to_compact).await;

        let mut result = Vec::with_capacity(1 + to_keep.len());
        result.push(Message::System {
            index: to_compact.last().map(|m| m.index()).unwrap_or(0),
            text: format!(
                "[Conversation summary of {} earlier messages]\n\n{summary}",
                to_compact.len()
            ),
        });
        result.extend(to_keep.iter().cloned());
        Ok(result)
    }

    async fn summarize(&self, messages: &[Message]) -> String {
        let mut conversation_text = String::new();
        for m in messages {
            let role = match m {
                Message::User { .. } => "user",
                Message::Assistant { .. } => "assistant",
                Message::Tool { .. } => "tool",
                Message::System { .. } => "system",
            };
            if role == "tool" {
                continue;
            }
            conversation_text.push_str(&format!("[{role}]: {}\n", text_of(m)));
        }

        if conversation_text.len() < 1000 {
            return format!("## Conversation Summary\n\n{conversation_text}");
        }

        let prompt = format!(
            "Summarize this conversation concisely, preserving decisions, \
             facts, and open questions:\n\n{conversation_text}"
        );
        let summary_messages = vec![
            Message::System { index: 0, text: "You are a concise summarizer.".into() },
            Message::User { index: 1, text: prompt },
        ];

        match self.llm.complete_once(&self.model, &summary_messages).await {
            Ok(text) => text,
            Err(e) => {
                debug!("compaction summary call failed, using raw transcript: {e}");
                conversation_text
            }
        }
    }
}

fn text_of(m: &Message) -> &str {
    match m {
        Message::User { text, .. } => text,
        Message::Assistant { text, .. } => text,
        Message::Tool { result_text, .. } => result_text,
        Message::System { text, .. } => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_assigns_strictly_increasing_index() {
        let mut convo = Conversation::new("sys", 100);
        convo.append_user("hi");
        convo.append_assistant("hello", vec![]);
        convo.append_tool_result("1", "echo", "hi");

        let indices: Vec<u64> = convo.messages().iter().map(|m| m.index()).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn trim_drops_oldest_first_and_preserves_order() {
        let mut convo = Conversation::new("sys", 1000);
        for i in 0..20 {
            convo.append_user(format!("message number {i} with enough text to add up tokens quickly"));
        }
        convo.trim_to_token_limit(50);
        let remaining = convo.messages();
        assert!(!remaining.is_empty());
        // Retained messages keep relative order (monotonic indices).
        let indices: Vec<u64> = remaining.iter().map(|m| m.index()).collect();
        let mut sorted = indices.clone();
        sorted.sort_unstable();
        assert_eq!(indices, sorted);
        // The oldest message (index 0) should have been dropped.
        assert!(!indices.contains(&0));
    }

    #[test]
    fn clear_drops_all_messages() {
        let mut convo = Conversation::new("sys", 100);
        convo.append_user("hi");
        convo.append_assistant("hello", vec![]);
        convo.clear();
        assert!(convo.messages().is_empty());
        assert_eq!(convo.system_prompt(), "sys");
    }

    #[test]
    fn bounded_log_drops_oldest_when_exceeding_max_entries() {
        let mut convo = Conversation::new("sys", 3);
        for i in 0..5 {
            convo.append_user(format!("msg{i}"));
        }
        assert_eq!(convo.messages().len(), 3);
        let indices: Vec<u64> = convo.messages().iter().map(|m| m.index()).collect();
        assert_eq!(indices, vec![2, 3, 4]);
    }
}
