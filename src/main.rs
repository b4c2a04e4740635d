use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use scarab_runtime::config::RobotConfig;

/// Hexapod movement runtime: polls the command file and drives the leg servos
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// JSON config; built-in defaults when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the polled command file
    #[arg(long)]
    command_file: Option<PathBuf>,

    /// Log servo output instead of opening the serial ports
    #[arg(long)]
    dry_run: bool,
}

fn load_config(args: &Args) -> Result<RobotConfig, Box<dyn std::error::Error + Send + Sync>> {
    let mut config = match &args.config {
        Some(path) => RobotConfig::load(path)?,
        None => {
            info!("No config file given, using built-in defaults");
            RobotConfig::default()
        }
    };
    if let Some(path) = &args.command_file {
        config.files.command = path.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init(); // installs the subscriber globally

    let args = Args::parse();
    let result = match load_config(&args) {
        Ok(config) => scarab_runtime::runtime::run(config, args.dry_run).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
