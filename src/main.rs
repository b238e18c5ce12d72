//! bitbucket-mcp - Bitbucket Cloud credential broker CLI
//!
#![doc = "bitbucket-mcp - Bitbucket Cloud credential broker CLI"]
#![doc = "Main entry point for the bitbucket-mcp command-line tool."]

use std::process::ExitCode;

use anyhow::Result;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bitbucket_mcp::cli::{Cli, Commands};
use bitbucket_mcp::commands;
use bitbucket_mcp::config::Config;

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Initialize tracing
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or("config/config.yaml");
    let config = Config::load(config_path, &cli)?;

    // Validate configuration
    config.validate()?;

    // Execute command
    match cli.command {
        Commands::Login { show_tokens } => {
            tracing::info!("Starting Bitbucket authorization");
            commands::login::run_login(&config, show_tokens).await
        }
        Commands::Status => commands::status::show_status(&config),
        Commands::Logout => commands::logout::run_logout(&config),
        Commands::Get {
            endpoint,
            raw,
            query,
        } => {
            tracing::debug!("GET {}", endpoint);
            commands::get::run_get(&config, &endpoint, raw, &query).await
        }
    }
}

/// Initialize tracing subscriber with environment filter
///
/// Logs go to stderr; stdout is reserved for command output.
fn init_tracing(verbose: bool) {
    let default_level = if verbose {
        "bitbucket_mcp=debug"
    } else {
        "bitbucket_mcp=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
