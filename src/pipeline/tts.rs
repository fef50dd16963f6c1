//! TTS Adapter (C7).
//!
//! `synthesize_stream` produces self-delimited audio chunks the client can
//! enqueue to a playback buffer, checking the cancel token between chunks
//! so a barge-in stops production within one chunk (spec.md §4.7, §4.9
//! cancellation propagation). The concrete HTTP adapter wraps a Kokorox-
//! shaped OpenAI-compatible `/v1/audio/speech` endpoint, generalized
//! from the pattern in `voice::tts_local::LocalTts`.

use super::types::CancelToken;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Single chunk under 500 KB is acceptable as-is; larger output is split
/// so decoder state for chunk N+1 depends only on header metadata carried
/// in chunk 0, never on chunk N's body (spec.md §4.7 chunking policy).
const MAX_SINGLE_CHUNK_BYTES: usize = 500 * 1024;

#[async_trait]
pub trait TtsAdapter: Send + Sync {
    /// Streams audio chunks for `text` at the given speaking rate (clamped
    /// to `[0.5, 2.0]` before use). The returned receiver is exhausted
    /// once synthesis completes or `cancel` fires.
    async fn synthesize_stream(
        &self,
        text: &str,
        speaking_rate: f32,
        cancel: CancelToken,
    ) -> Result<mpsc::Receiver<Result<Vec<u8>>>>;

    async fn list_voices(&self) -> Result<Vec<String>>;

    /// Reconfigures the adapter's default voice for subsequent calls
    /// (spec.md §9's `{synthesize-stream, list-voices, set-voice}`
    /// capability set; driven by a `settings` control frame, spec.md
    /// §6.3). A no-op default for adapters with no mutable voice state
    /// (e.g. test stubs).
    async fn set_voice(&self, _voice: String) {}

    /// Swaps the backend's base URL in place (spec.md §5/§6.3
    /// `ttsUrl`). A no-op default for adapters with no mutable
    /// connection state (e.g. test stubs).
    async fn update_config(&self, _base_url: Option<String>) {}
}

pub fn clamp_speaking_rate(rate: f32) -> f32 {
    rate.clamp(0.5, 2.0)
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
    speed: f32,
}

/// Wraps a Kokorox-shaped OpenAI-compatible TTS server. `voice` is behind
/// a `RwLock` rather than a plain field since `set_voice` reconfigures it
/// for a shared `Arc<dyn TtsAdapter>` singleton (spec.md §5: adapters are
/// process-wide, `update_config`/`set_voice` mutate them in place).
pub struct HttpTtsAdapter {
    base_url: RwLock<String>,
    voice: RwLock<String>,
    client: Client,
}

impl HttpTtsAdapter {
    pub fn new(base_url: impl Into<String>, voice: impl Into<String>) -> Self {
        Self {
            base_url: RwLock::new(base_url.into().trim_end_matches('/').to_string()),
            voice: RwLock::new(voice.into()),
            client: Client::new(),
        }
    }

    fn current_voice(&self) -> String {
        self.voice.read().expect("tts voice lock poisoned").clone()
    }

    fn current_base_url(&self) -> String {
        self.base_url.read().expect("tts base_url lock poisoned").clone()
    }
}

#[async_trait]
impl TtsAdapter for HttpTtsAdapter {
    async fn synthesize_stream(
        &self,
        text: &str,
        speaking_rate: f32,
        cancel: CancelToken,
    ) -> Result<mpsc::Receiver<Result<Vec<u8>>>> {
        let (tx, rx) = mpsc::channel(4);
        if text.is_empty() {
            drop(tx);
            return Ok(rx);
        }

        let rate = clamp_speaking_rate(speaking_rate);
        let voice = self.current_voice();
        debug!(chars = text.len(), rate, voice = %voice, "synthesizing speech");

        let request = SpeechRequest {
            model: "kokoro",
            input: text,
            voice: &voice,
            response_format: "wav",
            speed: rate,
        };

        let response = self
            .client
            .post(format!("{}/v1/audio/speech", self.current_base_url()))
            .json(&request)
            .send()
            .await
            .context("cannot connect to tts backend")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("tts backend returned HTTP {status}: {body}"));
        }

        let wav_bytes = response.bytes().await.context("failed to read tts response")?.to_vec();
        let pcm = wav_to_pcm_i16(&wav_bytes)?;
        info!(bytes = pcm.len(), "tts produced audio");

        tokio::spawn(async move {
            if cancel.is_cancelled() {
                return;
            }
            if pcm.len() <= MAX_SINGLE_CHUNK_BYTES {
                let _ = tx.send(Ok(pcm)).await;
                return;
            }
            // Split into header-carrying chunks: the first chunk repeats
            // the PCM framing assumption (16-bit mono) callers already
            // know, so no extra header bytes are needed beyond chunk 0
            // itself acting as the header-bearing chunk.
            for (i, chunk) in pcm.chunks(MAX_SINGLE_CHUNK_BYTES).enumerate() {
                if cancel.is_cancelled() {
                    warn!(chunk = i, "tts synthesis cancelled mid-stream");
                    break;
                }
                if tx.send(Ok(chunk.to_vec())).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn list_voices(&self) -> Result<Vec<String>> {
        let resp = self
            .client
            .get(format!("{}/v1/audio/voices", self.current_base_url()))
            .send()
            .await
            .context("cannot connect to tts backend")?;
        if !resp.status().is_success() {
            return Err(anyhow!("tts backend returned HTTP {}", resp.status()));
        }
        let value: serde_json::Value = resp.json().await.context("failed to parse voices response")?;
        let voices = value
            .get("voices")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        Ok(voices)
    }

    async fn set_voice(&self, voice: String) {
        info!(voice = %voice, "tts voice reconfigured");
        *self.voice.write().expect("tts voice lock poisoned") = voice;
    }

    async fn update_config(&self, base_url: Option<String>) {
        if let Some(base_url) = base_url {
            *self.base_url.write().expect("tts base_url lock poisoned") = base_url.trim_end_matches('/').to_string();
        }
    }
}

/// Converts WAV bytes to raw PCM16LE, tolerating the streaming
/// `0xFFFFFFFF` chunk-size sentinel some TTS servers emit (ported from
/// `voice::tts_local::wav_to_pcm_i16`, which `hound` cannot parse
/// directly for that reason).
fn wav_to_pcm_i16(wav_bytes: &[u8]) -> Result<Vec<u8>> {
    if wav_bytes.len() < 44 {
        return Err(anyhow!("WAV data too short: {} bytes", wav_bytes.len()));
    }
    if &wav_bytes[0..4] != b"RIFF" || &wav_bytes[8..12] != b"WAVE" {
        return Err(anyhow!("not a valid WAV file"));
    }

    let mut pos = 12;
    let mut data_start = 0usize;
    let mut audio_format = 0u16;
    let mut bits_per_sample = 0u16;

    while pos + 8 <= wav_bytes.len() {
        let chunk_id = &wav_bytes[pos..pos + 4];
        let chunk_size = u32::from_le_bytes([
            wav_bytes[pos + 4],
            wav_bytes[pos + 5],
            wav_bytes[pos + 6],
            wav_bytes[pos + 7],
        ]);

        if chunk_id == b"fmt " {
            if pos + 8 + 16 <= wav_bytes.len() {
                audio_format = u16::from_le_bytes([wav_bytes[pos + 8], wav_bytes[pos + 9]]);
                bits_per_sample = u16::from_le_bytes([wav_bytes[pos + 22], wav_bytes[pos + 23]]);
            }
            let real_size = if chunk_size == 0xFFFF_FFFF { 16 } else { chunk_size as usize };
            pos += 8 + real_size;
        } else if chunk_id == b"data" {
            data_start = pos + 8;
            break;
        } else {
            let real_size = if chunk_size == 0xFFFF_FFFF { 0 } else { chunk_size as usize };
            pos += 8 + real_size;
        }
    }

    if data_start == 0 || data_start >= wav_bytes.len() {
        return Err(anyhow!("could not find data chunk in WAV"));
    }

    let audio_data = &wav_bytes[data_start..];
    let mut pcm_bytes = Vec::new();

    match audio_format {
        3 => {
            for chunk in audio_data.chunks_exact(4) {
                let f = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                let i16_val = (f * 32767.0).clamp(-32768.0, 32767.0) as i16;
                pcm_bytes.extend_from_slice(&i16_val.to_le_bytes());
            }
        }
        1 => {
            if bits_per_sample == 16 {
                pcm_bytes.extend_from_slice(audio_data);
            } else if bits_per_sample == 32 {
                for chunk in audio_data.chunks_exact(4) {
                    let i32_val = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    let i16_val = (i32_val >> 16) as i16;
                    pcm_bytes.extend_from_slice(&i16_val.to_le_bytes());
                }
            } else {
                return Err(anyhow!("unsupported WAV bit depth: {bits_per_sample}"));
            }
        }
        other => return Err(anyhow!("unsupported WAV audio format: {other}")),
    }

    Ok(pcm_bytes)
}

/// Fixed-output adapter for orchestrator tests.
pub struct StubTtsAdapter {
    pub chunk: Vec<u8>,
}

#[async_trait]
impl TtsAdapter for StubTtsAdapter {
    async fn synthesize_stream(
        &self,
        text: &str,
        _speaking_rate: f32,
        cancel: CancelToken,
    ) -> Result<mpsc::Receiver<Result<Vec<u8>>>> {
        let (tx, rx) = mpsc::channel(4);
        if text.is_empty() || cancel.is_cancelled() {
            return Ok(rx);
        }
        let _ = tx.send(Ok(self.chunk.clone())).await;
        Ok(rx)
    }

    async fn list_voices(&self) -> Result<Vec<String>> {
        Ok(vec!["stub".to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speaking_rate_clamps_to_range() {
        assert_eq!(clamp_speaking_rate(0.1), 0.5);
        assert_eq!(clamp_speaking_rate(5.0), 2.0);
        assert_eq!(clamp_speaking_rate(1.0), 1.0);
    }

    #[tokio::test]
    async fn stub_emits_nothing_for_empty_text() {
        let adapter = StubTtsAdapter { chunk: vec![1, 2, 3] };
        let mut rx = adapter.synthesize_stream("", 1.0, CancelToken::new()).await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn stub_respects_pre_set_cancel_token() {
        let adapter = StubTtsAdapter { chunk: vec![1, 2, 3] };
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut rx = adapter.synthesize_stream("hello", 1.0, cancel).await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn pcm16_wav_round_trips_without_conversion() {
        let mut wav = Vec::new();
        wav.extend_from_slice(b"RIFF");
        wav.extend_from_slice(&36u32.to_le_bytes());
        wav.extend_from_slice(b"WAVE");
        wav.extend_from_slice(b"fmt ");
        wav.extend_from_slice(&16u32.to_le_bytes());
        wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
        wav.extend_from_slice(&1u16.to_le_bytes()); // mono
        wav.extend_from_slice(&16000u32.to_le_bytes());
        wav.extend_from_slice(&32000u32.to_le_bytes());
        wav.extend_from_slice(&2u16.to_le_bytes());
        wav.extend_from_slice(&16u16.to_le_bytes());
        wav.extend_from_slice(b"data");
        let samples: [i16; 2] = [100, -100];
        wav.extend_from_slice(&0u32.to_le_bytes());
        for s in samples {
            wav.extend_from_slice(&s.to_le_bytes());
        }
        let pcm = wav_to_pcm_i16(&wav).unwrap();
        assert_eq!(pcm, vec![100u8, 0, 156, 255]);
    }

    #[tokio::test]
    async fn set_voice_and_update_config_mutate_in_place() {
        let adapter = HttpTtsAdapter::new("http://localhost:8880", "af_sky");
        assert_eq!(adapter.current_voice(), "af_sky");
        assert_eq!(adapter.current_base_url(), "http://localhost:8880");

        adapter.set_voice("af_bella".to_string()).await;
        assert_eq!(adapter.current_voice(), "af_bella");

        adapter.update_config(Some("http://remote:8880/".to_string())).await;
        assert_eq!(adapter.current_base_url(), "http://remote:8880");

        adapter.update_config(None).await;
        assert_eq!(adapter.current_base_url(), "http://remote:8880");
    }
}
