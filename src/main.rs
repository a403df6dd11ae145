mod cmd;

use clap::{Parser, Subcommand};
use std::process;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gallery")]
#[command(version)]
#[command(about = "Fetch and check on-device language models", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Catalog models and whether they are on disk
    #[command(alias = "ls")]
    List,
    /// Where a model lives on disk
    Path { model: String },
    /// Exit 0 when the model is fully downloaded, 1 otherwise
    Check { model: String },
    Pull {
        model: String,
        /// Source URL; derived from the download base when omitted
        #[arg(short, long)]
        url: Option<String>,
        /// Bearer token for gated models
        #[arg(short, long)]
        token: Option<String>,
    },
    Version,
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::List => cmd::list().await,
        Commands::Path { model } => cmd::path(&model).await,
        Commands::Check { model } => cmd::check(&model).await,
        Commands::Pull { model, url, token } => cmd::pull(&model, url, token).await,
        Commands::Version => cmd::version().await,
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}
