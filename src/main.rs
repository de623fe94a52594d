use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "logship")]
#[command(about = "Log file shipping agent", long_about = None)]
struct Cli {
    /// Config file (default: $LOGSHIP_CONFIG, ~/.config/logship/config.yml, /etc/logship/config.yml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the state file named in the config
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Tail the configured files and ship them (the default)
    Run,
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a sample config
    Init {
        /// Where to write it instead of the per-user config location
        #[arg(long, short)]
        output: Option<PathBuf>,

        #[arg(long, conflicts_with = "output")]
        stdout: bool,
    },
    /// Validate the config and list the files it collects
    Check,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // RUST_LOG overrides the default filter
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "logship=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config_path = logship::config::resolve_config_path(cli.config.as_deref());

    match cli.command {
        Some(Commands::Run) | None => {
            logship::cli::run::run(config_path, cli.state).await?;
        }
        Some(Commands::Config { action }) => match action {
            ConfigAction::Init { output, stdout } => {
                logship::cli::config::init(output, stdout)?;
            }
            ConfigAction::Check => match config_path {
                Some(path) => logship::cli::config::check(&path)?,
                None => {
                    eprintln!("Error: config not found; use --config <path>");
                    std::process::exit(1);
                }
            },
        },
    }

    Ok(())
}
