//! Utterance Segmenter (C2).
//!
//! Sits between the VAD gate and the STT adapter: accumulates PCM while
//! the session is listening (or while VAD is triggered during a barge-in
//! probe), and snapshots a finished `Utterance` when VAD reports
//! `speech_just_ended`, provided the span is long enough to be real
//! speech rather than a transient.

use super::types::{Utterance, VadDecision};
use super::vad::VadGate;

/// Utterances shorter than this are dropped as noise (spec.md §4.2).
const MIN_UTTERANCE_MS: u64 = 500;

pub struct Segmenter {
    buffer: Vec<u8>,
}

impl Default for Segmenter {
    fn default() -> Self {
        Self::new()
    }
}

impl Segmenter {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Append a chunk currently being accumulated (session is Listening).
    pub fn push(&mut self, pcm_chunk: &[u8]) {
        self.buffer.extend_from_slice(pcm_chunk);
    }

    /// Run a chunk through the VAD gate and the segmenter together. If the
    /// window completes an utterance long enough to keep, returns it and
    /// clears internal state; otherwise appends to the buffer (if
    /// currently speech-bearing) and returns `None`.
    ///
    /// `vad` is reset by this call whenever it reports `speech_just_ended`,
    /// matching the "clears the buffer, resets VAD" step in spec.md §4.2.
    pub fn process(&mut self, vad: &mut VadGate, pcm_chunk: &[u8]) -> SegmentOutcome {
        let decision: VadDecision = vad.process(pcm_chunk);

        if decision.is_currently_speech || vad.is_triggered() {
            self.push(pcm_chunk);
        }

        if decision.speech_just_ended {
            let snapshot = std::mem::take(&mut self.buffer);
            vad.reset();
            let utterance = Utterance::from_pcm16le(snapshot);
            if utterance.duration_ms() >= MIN_UTTERANCE_MS {
                return SegmentOutcome::Utterance(utterance);
            }
            return SegmentOutcome::DroppedAsNoise;
        }

        SegmentOutcome::Accumulating
    }
}

#[derive(Debug)]
pub enum SegmentOutcome {
    /// Still listening; nothing to do yet.
    Accumulating,
    /// Speech ended but didn't meet the minimum duration; caller should
    /// return the session to Listening without invoking STT.
    DroppedAsNoise,
    /// A complete utterance is ready for STT.
    Utterance(Utterance),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::vad::{EnergyClassifier, VadGate, VadGateConfig, WINDOW_SAMPLES};

    fn silence_window() -> Vec<u8> {
        vec![0u8; WINDOW_SAMPLES * 2]
    }

    fn speech_window() -> Vec<u8> {
        let mut out = Vec::with_capacity(WINDOW_SAMPLES * 2);
        for i in 0..WINDOW_SAMPLES {
            let v: i16 = if i % 2 == 0 { 20000 } else { -20000 };
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    #[test]
    fn short_blip_is_dropped_as_noise() {
        let mut vad = VadGate::new(Box::new(EnergyClassifier::default()), VadGateConfig::default());
        let mut seg = Segmenter::new();

        // Just barely trigger (a handful of speech windows), then go
        // straight to silence for long enough to end - but the kept span
        // itself is shy of 500ms given only a couple speech windows.
        let mut outcome = SegmentOutcome::Accumulating;
        for _ in 0..4 {
            outcome = seg.process(&mut vad, &speech_window());
        }
        for _ in 0..15 {
            outcome = seg.process(&mut vad, &silence_window());
            if matches!(outcome, SegmentOutcome::Utterance(_) | SegmentOutcome::DroppedAsNoise) {
                break;
            }
        }
        assert!(matches!(outcome, SegmentOutcome::DroppedAsNoise));
        assert!(seg.is_empty());
    }

    #[test]
    fn long_enough_speech_yields_utterance() {
        let mut vad = VadGate::new(Box::new(EnergyClassifier::default()), VadGateConfig::default());
        let mut seg = Segmenter::new();

        let mut outcome = SegmentOutcome::Accumulating;
        // ~25 windows of speech = 25*512/16000s ~= 800ms, well over 500ms.
        for _ in 0..25 {
            outcome = seg.process(&mut vad, &speech_window());
        }
        for _ in 0..15 {
            outcome = seg.process(&mut vad, &silence_window());
            if matches!(outcome, SegmentOutcome::Utterance(_) | SegmentOutcome::DroppedAsNoise) {
                break;
            }
        }
        match outcome {
            SegmentOutcome::Utterance(u) => assert!(u.duration_ms() >= MIN_UTTERANCE_MS),
            other => panic!("expected Utterance, got {other:?}"),
        }
        assert!(seg.is_empty());
    }
}
