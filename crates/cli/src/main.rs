//! Hearth CLI: the main entry point.
//!
//! Commands:
//! - `chat`    Interactive or single-message chat with tool calling
//! - `config`  Print the effective configuration

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use hearth_config::AppConfig;

mod commands;

#[derive(Parser)]
#[command(
    name = "hearth",
    about = "Hearth: local LLM inference sessions with tool calling",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Read configuration from this file instead of ~/.hearth/config.toml
    #[arg(long, global = true, env = "HEARTH_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with a local model that can call the built-in tools
    Chat {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,

        /// Print the answer as it is generated
        #[arg(long)]
        stream: bool,

        /// Override the model path
        #[arg(long)]
        model: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Print the built-in defaults instead
        #[arg(long)]
        default: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<AppConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    Ok(config)
}

fn init_logging(config: &AppConfig, verbose: bool) {
    let level = if verbose { "debug" } else { config.logging.level.as_str() };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    init_logging(&config, cli.verbose);

    match cli.command {
        Commands::Chat {
            message,
            stream,
            model,
        } => commands::chat::run(config, model, message, stream).await?,
        Commands::Config { default } => commands::config_cmd::show(&config, default)?,
    }

    Ok(())
}
