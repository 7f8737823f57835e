pub mod config;
pub mod run;

use clap::{Parser, Subcommand};

/// ChainStream: streaming execution core for multi-agent LLM chains.
#[derive(Debug, Parser)]
#[command(name = "chainstream", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the HTTP server (default when no subcommand is given).
    Serve,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Execute one prompt through the streaming pipeline and print the
    /// response.
    Run {
        /// The prompt to send.
        prompt: String,
        /// Model to use (defaults to the supervisor model).
        #[arg(long)]
        model: Option<String>,
        /// Print the wire events as JSON instead of plain text.
        #[arg(long)]
        json: bool,
    },
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

// ── Config loading helper ─────────────────────────────────────────────

/// Load the configuration from the path specified by `CS_CONFIG` (or
/// `config.toml` by default). Returns the parsed [`Config`] and the
/// path that was used.
///
/// [`Config`]: cs_domain::config::Config
pub fn load_config() -> anyhow::Result<(cs_domain::config::Config, String)> {
    let config_path = std::env::var("CS_CONFIG").unwrap_or_else(|_| "config.toml".into());

    let config = if std::path::Path::new(&config_path).exists() {
        let raw = std::fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("reading {config_path}: {e}"))?;
        toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {config_path}: {e}"))?
    } else {
        cs_domain::config::Config::default()
    };

    Ok((config, config_path))
}
