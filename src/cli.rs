//! Command-line interface definition for bitbucket-mcp
//!
//! This module defines the CLI structure using clap's derive API,
//! providing commands for authorization, credential inspection, and
//! authenticated API calls.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// bitbucket-mcp - Bitbucket Cloud credential broker
///
/// Obtains, refreshes, and persists Bitbucket credentials and performs
/// authenticated REST calls on behalf of an agent tool server.
#[derive(Parser, Debug, Clone)]
#[command(name = "bitbucket-mcp")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Override the credential file location
    #[arg(long, env = "BITBUCKET_TOKEN_FILE")]
    pub token_file: Option<PathBuf>,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for bitbucket-mcp
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the browser authorization flow and persist the credential
    Login {
        /// Print the issued access and refresh tokens
        #[arg(long)]
        show_tokens: bool,
    },

    /// Show the active authentication strategy and stored credential
    Status,

    /// Remove the stored credential
    Logout,

    /// Perform an authenticated GET request and print the response
    Get {
        /// API path (e.g. `/user`) or absolute URL
        endpoint: String,

        /// Print the body as text instead of JSON
        #[arg(long)]
        raw: bool,

        /// Query parameter in `key=value` form (repeatable)
        #[arg(short, long = "query", value_parser = parse_key_value)]
        query: Vec<(String, String)>,
    },
}

/// Parses a `key=value` argument
fn parse_key_value(arg: &str) -> std::result::Result<(String, String), String> {
    arg.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got `{}`", arg))
}

impl Cli {
    /// Parse command line arguments
    ///
    /// # Returns
    ///
    /// Returns the parsed CLI structure
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
