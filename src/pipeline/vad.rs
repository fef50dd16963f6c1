//! Voice Activity Detection gate (C1).
//!
//! Buffers arbitrarily-sized PCM16/16kHz chunks into fixed 512-sample
//! windows (32ms) and runs each complete window through a pluggable
//! `SpeechClassifier`, then applies the hysteresis state machine from
//! spec.md §4.1 on top of the raw per-window probability.
//!
//! Two classifiers are provided: an energy-threshold one (default, no
//! model download required) in the style of `voice/vad.rs`, and an ONNX
//! Silero classifier in the style of `voice/silero_vad.rs`. Which one
//! runs is a config choice (`vad.backend`), never a runtime fallback
//! chain — see SPEC_FULL.md's REDESIGN FLAGS.

use anyhow::Result;
use tracing::warn;

pub const WINDOW_SAMPLES: usize = 512;
const SAMPLE_RATE: u32 = 16_000;

/// A pluggable speech/non-speech classifier over one 512-sample window of
/// PCM16 mono audio at 16kHz. Implementations may hold internal state
/// (e.g. an RNN hidden state) that `reset()` must clear.
pub trait SpeechClassifier: Send {
    /// Returns speech probability in [0, 1] for one window.
    fn classify(&mut self, window: &[i16]) -> Result<f32>;

    fn reset(&mut self);
}

/// Simple RMS-energy classifier against an adaptive-free fixed threshold.
/// Deterministic and dependency-free, used for tests and as the default
/// backend so a fresh checkout runs without downloading a model.
pub struct EnergyClassifier {
    /// RMS level (on a 0..32768 scale) above which a window counts as speech.
    pub rms_threshold: f32,
}

impl Default for EnergyClassifier {
    fn default() -> Self {
        Self { rms_threshold: 400.0 }
    }
}

impl SpeechClassifier for EnergyClassifier {
    fn classify(&mut self, window: &[i16]) -> Result<f32> {
        if window.is_empty() {
            return Ok(0.0);
        }
        let sum_sq: f64 = window.iter().map(|&s| (s as f64) * (s as f64)).sum();
        let rms = (sum_sq / window.len() as f64).sqrt() as f32;
        // Map RMS onto [0, 1] with the threshold as the midpoint so the
        // same `threshold` config knob the ONNX classifier uses (0.5)
        // has a sensible meaning here too.
        let prob = (rms / (self.rms_threshold * 2.0)).clamp(0.0, 1.0);
        Ok(prob)
    }

    fn reset(&mut self) {}
}

/// ONNX-backed Silero-style classifier. Feature-gated behind `voice`
/// (requires the `ort` crate and a downloaded model); see
/// `voice::silero_vad::SileroVad` for the inference call this wraps.
///
/// Construction is cheap: the ONNX session itself is a process-scoped
/// `voice::silero_vad::SileroModel` loaded once at startup and shared via
/// `Arc`; each `OnnxClassifier` only owns its own hidden-state vector, so
/// a fresh one can be built per session/probe without reloading anything.
#[cfg(feature = "onnx-vad")]
pub struct OnnxClassifier {
    inner: crate::voice::silero_vad::SileroVad,
}

#[cfg(feature = "onnx-vad")]
impl OnnxClassifier {
    /// `VadGate` applies its own threshold/min-speech/min-silence
    /// hysteresis on top of the raw probability this classifier returns.
    pub fn new(model: std::sync::Arc<crate::voice::silero_vad::SileroModel>) -> Self {
        Self {
            inner: crate::voice::silero_vad::SileroVad::new(model),
        }
    }
}

#[cfg(feature = "onnx-vad")]
impl SpeechClassifier for OnnxClassifier {
    fn classify(&mut self, window: &[i16]) -> Result<f32> {
        let floats = crate::voice::silero_vad::i16_to_f32(window);
        self.inner.probability(&floats)
    }

    fn reset(&mut self) {
        self.inner.reset();
    }
}

/// Configuration for the VAD gate's hysteresis state machine.
#[derive(Debug, Clone, Copy)]
pub struct VadGateConfig {
    pub threshold: f32,
    pub min_speech_ms: u64,
    pub min_silence_ms: u64,
}

impl Default for VadGateConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            min_speech_ms: 150,
            min_silence_ms: 300,
        }
    }
}

/// The VAD Gate: windowing + hysteresis state machine over a pluggable
/// classifier, per spec.md §4.1.
pub struct VadGate {
    classifier: Box<dyn SpeechClassifier>,
    config: VadGateConfig,
    window_buf: Vec<i16>,
    triggered: bool,
    speech_samples: u64,
    silence_samples: u64,
}

impl VadGate {
    pub fn new(classifier: Box<dyn SpeechClassifier>, config: VadGateConfig) -> Self {
        Self {
            classifier,
            config,
            window_buf: Vec::with_capacity(WINDOW_SAMPLES),
            triggered: false,
            speech_samples: 0,
            silence_samples: 0,
        }
    }

    fn min_speech_samples(&self) -> u64 {
        (self.config.min_speech_ms * SAMPLE_RATE as u64) / 1000
    }

    fn min_silence_samples(&self) -> u64 {
        (self.config.min_silence_ms * SAMPLE_RATE as u64) / 1000
    }

    /// Process an arbitrarily-sized PCM16LE chunk. Internally buffers into
    /// 512-sample windows; returns the decision for the *last* complete
    /// window processed in this call (or a non-speech decision if the
    /// chunk didn't complete a window).
    pub fn process(&mut self, pcm_chunk: &[u8]) -> super::types::VadDecision {
        let samples: Vec<i16> = pcm_chunk
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();

        let mut last = super::types::VadDecision {
            speech_probability: 0.0,
            is_currently_speech: self.triggered,
            speech_just_ended: false,
        };

        for sample in samples {
            self.window_buf.push(sample);
            if self.window_buf.len() == WINDOW_SAMPLES {
                let window = std::mem::take(&mut self.window_buf);
                last = self.process_window(&window);
                self.window_buf = Vec::with_capacity(WINDOW_SAMPLES);
            }
        }

        last
    }

    fn process_window(&mut self, window: &[i16]) -> super::types::VadDecision {
        let prob = match self.classifier.classify(window) {
            Ok(p) => p,
            Err(e) => {
                // Classifier failure is fatal to this decision, not the
                // session (§4.1 Failure): report non-speech and move on.
                warn!("VAD classifier error: {e}");
                return super::types::VadDecision {
                    speech_probability: 0.0,
                    is_currently_speech: self.triggered,
                    speech_just_ended: false,
                };
            }
        };

        let is_speech_window = prob >= self.config.threshold;
        let mut speech_just_ended = false;

        if is_speech_window {
            self.silence_samples = 0;
            self.speech_samples += WINDOW_SAMPLES as u64;
            if self.speech_samples >= self.min_speech_samples() {
                self.triggered = true;
            }
        } else if self.triggered {
            self.silence_samples += WINDOW_SAMPLES as u64;
            if self.silence_samples >= self.min_silence_samples() {
                speech_just_ended = true;
                self.triggered = false;
                self.speech_samples = 0;
                self.silence_samples = 0;
            }
        } else {
            // Non-speech window before ever triggering: onset counter
            // resets so a few stray loud samples don't accumulate toward
            // the speech-start threshold across a long silence.
            self.speech_samples = 0;
        }

        super::types::VadDecision {
            speech_probability: prob,
            is_currently_speech: self.triggered,
            speech_just_ended,
        }
    }

    pub fn reset(&mut self) {
        self.classifier.reset();
        self.window_buf.clear();
        self.triggered = false;
        self.speech_samples = 0;
        self.silence_samples = 0;
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn silence_chunk(samples: usize) -> Vec<u8> {
        vec![0u8; samples * 2]
    }

    fn speech_chunk(samples: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(samples * 2);
        for i in 0..samples {
            // A loud tone, well above the default energy threshold.
            let v = if i % 2 == 0 { 20000i16 } else { -20000i16 };
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    #[test]
    fn silence_never_triggers() {
        let mut gate = VadGate::new(Box::new(EnergyClassifier::default()), VadGateConfig::default());
        for _ in 0..50 {
            let d = gate.process(&silence_chunk(WINDOW_SAMPLES));
            assert!(!d.is_currently_speech);
            assert!(!d.speech_just_ended);
        }
    }

    #[test]
    fn speech_then_silence_emits_exactly_one_speech_ended() {
        let mut gate = VadGate::new(Box::new(EnergyClassifier::default()), VadGateConfig::default());

        // 150ms min_speech at 16kHz / 512-sample windows ~= 4.7 windows;
        // feed enough speech windows to trigger.
        let mut ended_count = 0;
        for _ in 0..10 {
            let d = gate.process(&speech_chunk(WINDOW_SAMPLES));
            if d.speech_just_ended {
                ended_count += 1;
            }
        }
        assert!(gate.is_triggered());

        // 300ms min_silence ~= 9.4 windows of silence to end.
        for _ in 0..15 {
            let d = gate.process(&silence_chunk(WINDOW_SAMPLES));
            if d.speech_just_ended {
                ended_count += 1;
            }
        }
        assert_eq!(ended_count, 1);
        assert!(!gate.is_triggered());
    }

    #[test]
    fn reset_clears_state() {
        let mut gate = VadGate::new(Box::new(EnergyClassifier::default()), VadGateConfig::default());
        for _ in 0..10 {
            gate.process(&speech_chunk(WINDOW_SAMPLES));
        }
        assert!(gate.is_triggered());
        gate.reset();
        assert!(!gate.is_triggered());
    }
}
