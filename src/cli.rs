//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// DashGate - self-hosted application dashboard with single sign-on
#[derive(Parser, Debug)]
#[command(name = "dashgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "DASHGATE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the dashboard server (default)
    Serve,

    /// Create a local account, marking first-run setup complete
    CreateUser {
        /// Login name
        #[arg(required = true)]
        username: String,

        /// Password (at least 8 characters)
        #[arg(long, env = "DASHGATE_PASSWORD", hide_env_values = true)]
        password: String,

        /// Email address
        #[arg(long)]
        email: Option<String>,

        /// Display name (defaults to the username)
        #[arg(long)]
        display_name: Option<String>,

        /// Groups, comma separated
        #[arg(long, value_delimiter = ',', default_value = "admin")]
        groups: Vec<String>,
    },
}
