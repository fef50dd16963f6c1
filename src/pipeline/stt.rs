//! STT Adapter (C3).
//!
//! Transcribes an `Utterance` to text. Concrete backends are interface-only
//! collaborators per spec.md §1; this module defines the trait contract and
//! an HTTP implementation in the style of `voice/stt_local.rs` (local
//! faster-whisper-server bridge).

use super::types::Utterance;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::RwLock;
use std::time::Duration;

/// Utterances shorter than this are never sent to the engine (spec.md §4.3).
const MIN_TRANSCRIBE_MS: u64 = 100;

#[async_trait]
pub trait SttAdapter: Send + Sync {
    /// Transcribes one utterance. Never returns an error for empty or
    /// silent audio — an engine failure is the only error case, and even
    /// that is expected to be handled by the orchestrator as an
    /// engine-failure (§7 #5), not propagated as a panic.
    async fn transcribe(&self, utterance: &Utterance) -> Result<String>;

    /// Swaps the backend's base URL in place (spec.md §5/§6.3
    /// `sttUrl`). A no-op default for adapters with no mutable
    /// connection state (e.g. test stubs).
    async fn update_config(&self, _base_url: Option<String>) {}
}

/// Guards the `< 100ms ⇒ empty without invoking engine` edge case common
/// to every concrete adapter; concrete adapters call this first.
pub fn too_short_to_transcribe(utterance: &Utterance) -> bool {
    utterance.duration_ms() < MIN_TRANSCRIBE_MS
}

fn pcm_to_wav(pcm: &[u8], sample_rate: u32) -> Vec<u8> {
    let data_len = pcm.len() as u32;
    let mut wav = Vec::with_capacity(44 + pcm.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&1u16.to_le_bytes()); // mono
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&(sample_rate * 2).to_le_bytes()); // byte rate
    wav.extend_from_slice(&2u16.to_le_bytes()); // block align
    wav.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm);
    wav
}

/// HTTP STT backend speaking an OpenAI-compatible `/v1/audio/transcriptions`
/// multipart endpoint, the shape a local faster-whisper-server instance
/// exposes.
pub struct HttpSttAdapter {
    base_url: RwLock<String>,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpSttAdapter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: RwLock::new(base_url.into()),
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(30),
        }
    }

    fn base_url(&self) -> String {
        self.base_url.read().expect("stt base_url lock poisoned").clone()
    }
}

#[async_trait]
impl SttAdapter for HttpSttAdapter {
    async fn transcribe(&self, utterance: &Utterance) -> Result<String> {
        if too_short_to_transcribe(utterance) {
            return Ok(String::new());
        }

        let wav = pcm_to_wav(&utterance.pcm, utterance.sample_rate);
        let url = format!("{}/v1/audio/transcriptions", self.base_url().trim_end_matches('/'));

        let form = reqwest::multipart::Form::new()
            .text("model", "whisper-1")
            .part(
                "file",
                reqwest::multipart::Part::bytes(wav)
                    .file_name("utterance.wav")
                    .mime_str("audio/wav")?,
            );

        let resp = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .multipart(form)
            .send()
            .await?;

        if !resp.status().is_success() {
            anyhow::bail!("stt backend returned HTTP {}", resp.status());
        }

        #[derive(serde::Deserialize)]
        struct TranscriptionResponse {
            text: String,
        }

        let parsed: TranscriptionResponse = resp.json().await?;
        Ok(parsed.text)
    }

    async fn update_config(&self, base_url: Option<String>) {
        if let Some(base_url) = base_url {
            *self.base_url.write().expect("stt base_url lock poisoned") = base_url;
        }
    }
}

/// Stub STT adapter used in orchestrator scenario tests: returns a
/// fixed transcript regardless of input, skipping the network entirely.
pub struct StubSttAdapter {
    pub fixed_transcript: String,
}

#[async_trait]
impl SttAdapter for StubSttAdapter {
    async fn transcribe(&self, utterance: &Utterance) -> Result<String> {
        if too_short_to_transcribe(utterance) {
            return Ok(String::new());
        }
        Ok(self.fixed_transcript.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn short_utterance_skips_engine() {
        let adapter = StubSttAdapter { fixed_transcript: "should not appear".into() };
        let utterance = Utterance::from_pcm16le(vec![0u8; 100]); // well under 100ms
        let text = adapter.transcribe(&utterance).await.unwrap();
        assert_eq!(text, "");
    }

    #[tokio::test]
    async fn update_config_swaps_base_url_and_tolerates_none() {
        let adapter = HttpSttAdapter::new("http://localhost:9000");
        assert_eq!(adapter.base_url(), "http://localhost:9000");

        adapter.update_config(Some("http://remote:9000".to_string())).await;
        assert_eq!(adapter.base_url(), "http://remote:9000");

        adapter.update_config(None).await;
        assert_eq!(adapter.base_url(), "http://remote:9000");
    }

    #[test]
    fn wav_header_has_correct_data_length() {
        let pcm = vec![1u8, 2, 3, 4];
        let wav = pcm_to_wav(&pcm, 16_000);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        let data_len = u32::from_le_bytes([wav[40], wav[41], wav[42], wav[43]]);
        assert_eq!(data_len, 4);
    }
}
