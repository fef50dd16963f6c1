//! CLI interface for voicebridge-server.
//!
//! A `clap`-derive `Cli`/`Commands` tree scoped down to the three things
//! an operator of this server actually does: run it, inspect/edit its
//! config, and check whether its adapters are reachable before serving
//! traffic.

use crate::config::Config;
use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "voicebridge-server", about = "Real-time full-duplex voice assistant server", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the voice assistant server (default if no subcommand is given).
    Serve {
        /// Override the configured bind host.
        #[arg(long)]
        host: Option<String>,
        /// Override the configured bind port.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Inspect or edit the persisted TOML config.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Check reachability of the configured LLM/STT/TTS adapters.
    Doctor,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the current config.
    Show,
    /// Set one dotted-path config key, e.g. `llm.base_url`.
    Set { key: String, value: String },
    /// Store the LLM provider API key in the OS keyring (or its file
    /// fallback) instead of the plaintext config file.
    SetApiKey { key: String },
    /// Store the `/api/admin/*` shared secret the same way.
    SetAdminToken { token: String },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve { host: None, port: None }) {
        Commands::Serve { host, port } => {
            let mut config = Config::load()?;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            crate::server::start(config).await
        }
        Commands::Config { command } => match command {
            ConfigCommands::Show => crate::config::show_config(),
            ConfigCommands::Set { key, value } => crate::config::set_key(&key, &value),
            ConfigCommands::SetApiKey { key } => crate::security::set_credential("llm-api-key", &key),
            ConfigCommands::SetAdminToken { token } => crate::security::set_credential("admin-token", &token),
        },
        Commands::Doctor => crate::doctor::run_diagnostics().await,
    }
}
