//! Local ONNX-backed speech classifier, wrapped by `pipeline::vad::OnnxClassifier`
//! behind the `onnx-vad` feature (SPEC_FULL.md REDESIGN FLAGS: one VAD
//! backend is active per process, chosen by config, never a fallback chain).

#[cfg(feature = "onnx-vad")]
pub mod silero_vad;
