use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use data_mirror::{service, Config, MirrorError};

#[derive(Parser)]
#[command(name = "data-mirror")]
#[command(about = "CDC egress: stream PostgreSQL changes into compressed CSV batches")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the egress service until terminated
    Egress {
        /// Path to the YAML configuration file
        #[arg(long, short)]
        config: PathBuf,
    },
    /// Print per-table registry state and active reloads
    Status {
        /// Path to the YAML configuration file
        #[arg(long, short)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Egress { config } => match Config::from_file(&config) {
            Ok(config) => service::run_egress(config).await,
            Err(e) => Err(e),
        },
        Commands::Status { config } => match Config::from_file(&config) {
            Ok(config) => service::run_status(config).await,
            Err(e) => Err(e),
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            let code = e
                .downcast_ref::<MirrorError>()
                .map(MirrorError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code as u8)
        }
    }
}
