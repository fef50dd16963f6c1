//! Silero VAD (Voice Activity Detection) using ONNX Runtime
//!
//! ML-based voice activity detection using the Silero VAD v5 ONNX model.
//! Much more accurate than energy-based VAD for handling noise, breathing,
//! and non-speech sounds. The model is auto-downloaded (~2MB) on first use.
//!
//! This wraps only the raw per-window inference call. The
//! triggered/min-speech/min-silence hysteresis state machine lives in
//! `pipeline::vad::VadGate`, which drives this through the
//! `SpeechClassifier` trait (`pipeline::vad::OnnxClassifier`) — keeping a
//! second hysteresis layer in here would just duplicate it.
//!
//! `SileroModel` is the process-scoped singleton (spec.md: "Global
//! singletons (VAD, STT, TTS, LLM client): model as process-scoped
//! resources created during startup") — it owns the loaded ONNX session
//! and is built exactly once in `server::build_state`. `SileroVad` is the
//! cheap per-connection handle: it holds only the 128-float hidden state
//! and an `Arc<SileroModel>`, so spinning up a new session per connection
//! never happens.

use anyhow::{Context, Result};
use ort::session::Session;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::info;

const SILERO_VAD_URL: &str = "https://github.com/snakers4/silero-vad/raw/master/src/silero_vad/data/silero_vad.onnx";
const MODEL_FILENAME: &str = "silero_vad.onnx";
const SAMPLE_RATE: i64 = 16000;
const WINDOW_SIZE: usize = 512; // 32ms at 16kHz
const HIDDEN_STATE_LEN: usize = 2 * 1 * 128;

/// The loaded ONNX session, shared by every connection's `SileroVad`
/// handle. `ort::Session::run` needs `&mut self`, so concurrent callers
/// serialize on the session lock; each caller brings its own hidden state,
/// so that serialization never leaks one connection's VAD state into
/// another's.
pub struct SileroModel {
    session: Mutex<Session>,
}

impl SileroModel {
    /// Loads the model (downloading it first if needed). Called once, at
    /// startup.
    pub fn load() -> Result<Self> {
        let model_path = Self::ensure_model()?;

        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(&model_path)
            .context("failed to create ONNX session for Silero VAD")?;

        info!("Silero VAD loaded from {}", model_path.display());

        Ok(Self { session: Mutex::new(session) })
    }

    fn ensure_model() -> Result<PathBuf> {
        let model_dir = crate::config::data_dir()?.join("models");
        std::fs::create_dir_all(&model_dir).context("failed to create models directory")?;

        let model_path = model_dir.join(MODEL_FILENAME);
        if model_path.exists() {
            return Ok(model_path);
        }

        info!("downloading Silero VAD model to {}", model_path.display());

        let response = reqwest::blocking::get(SILERO_VAD_URL).context("failed to download Silero VAD model")?;
        if !response.status().is_success() {
            return Err(anyhow::anyhow!("failed to download Silero VAD model: HTTP {}", response.status()));
        }

        let bytes = response.bytes().context("failed to read Silero VAD model bytes")?;
        std::fs::write(&model_path, &bytes).context("failed to save Silero VAD model")?;

        info!("Silero VAD model downloaded ({} bytes)", bytes.len());
        Ok(model_path)
    }

    /// Raw speech probability for one window, given the caller's own
    /// hidden state (updated in place). No hysteresis applied.
    fn probability(&self, audio: &[f32], state: &mut Vec<f32>) -> Result<f32> {
        use ort::value::Value;

        let audio_len = audio.len();
        let input = Value::from_array(([1usize, audio_len], audio.to_vec()))?;
        let state_value = Value::from_array(([2usize, 1usize, 128usize], state.clone()))?;
        let sr = Value::from_array(([1usize], vec![SAMPLE_RATE]))?;

        let mut session = self.session.lock().expect("silero vad session lock poisoned");
        let outputs = session.run(ort::inputs![input, state_value, sr])?;

        let (_prob_shape, prob_data) = outputs[0].try_extract_tensor::<f32>()?;
        let prob = if !prob_data.is_empty() { prob_data[0] } else { 0.0 };

        let (_state_shape, new_state_data) = outputs[1].try_extract_tensor::<f32>()?;
        if new_state_data.len() == state.len() {
            state.copy_from_slice(new_state_data);
        }

        Ok(prob)
    }
}

/// Per-connection handle onto a shared `SileroModel`: just the hidden
/// state tensor plus a reference to the loaded session.
pub struct SileroVad {
    model: Arc<SileroModel>,
    state: Vec<f32>,
}

impl SileroVad {
    pub fn new(model: Arc<SileroModel>) -> Self {
        Self { model, state: vec![0.0f32; HIDDEN_STATE_LEN] }
    }

    /// Raw speech probability for one window of `window_size()` samples (f32,
    /// normalized to [-1.0, 1.0] at 16kHz), with no hysteresis applied.
    pub fn probability(&mut self, audio: &[f32]) -> Result<f32> {
        self.model.probability(audio, &mut self.state)
    }

    /// Resets the hidden state (call between sessions).
    pub fn reset(&mut self) {
        self.state.fill(0.0);
    }

    /// Required chunk size in samples.
    pub fn window_size(&self) -> usize {
        WINDOW_SIZE
    }
}

/// Converts i16 PCM samples to f32 normalized [-1.0, 1.0].
pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i16_to_f32_conversion_maps_full_range() {
        let samples = vec![0i16, 32767, -32768];
        let converted = i16_to_f32(&samples);
        assert!((converted[0] - 0.0).abs() < 0.001);
        assert!((converted[1] - 1.0).abs() < 0.001);
        assert!((converted[2] - (-1.0)).abs() < 0.001);
    }
}
