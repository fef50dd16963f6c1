//! voicebridge - Real-time full-duplex voice assistant server
//!
//! The conversational pipeline engine (`pipeline`) implements VAD-gated
//! utterance segmentation, tool-augmented LLM dispatch, cancellable TTS
//! streaming, and barge-in arbitration for one client connection at a
//! time. Everything else in this crate is ambient scaffolding around
//! that engine: configuration, credential storage, the HTTP/WebSocket
//! server, and the CLI.
//!
//! # Example
//!
//! ```ignore
//! use voicebridge::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     voicebridge::server::start(config).await
//! }
//! ```

pub mod cli;
pub mod config;
pub mod doctor;
pub mod pipeline;
pub mod security;
pub mod server;
pub mod voice;

pub use config::Config;
pub use pipeline::orchestrator::{Orchestrator, PipelineServices};
pub use server::ServerState;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get the library info
pub fn info() -> String {
    format!("{} v{} - real-time voice assistant server", NAME, VERSION)
}
