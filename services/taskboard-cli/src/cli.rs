//! CLI argument definitions for the Taskboard client.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use reqwest::Method;

/// Taskboard API client
#[derive(Parser, Debug)]
#[command(name = "taskboard", version, about = "Taskboard API client")]
pub struct Cli {
    /// Config file (defaults to ./taskboard.toml)
    #[arg(long, global = true, env = "CONFIG_PATH", value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands. The password for `login` and `register` comes from
/// TASKBOARD_PASSWORD, never from argv.
#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Log in and store the session
    Login { email: String },
    /// Create an account and log in
    Register { name: String, email: String },
    /// Drop the stored session
    Logout,
    /// Show the current user
    Whoami,
    /// Send an authenticated request
    Request {
        /// HTTP method (case-insensitive)
        #[arg(value_parser = parse_method)]
        method: Method,
        /// Path relative to the API base URL
        path: String,
        /// JSON request body
        #[arg(value_parser = parse_json)]
        body: Option<serde_json::Value>,
    },
    /// Refresh the session in the background until Ctrl-C
    Keepalive,
}

fn parse_method(raw: &str) -> Result<Method, String> {
    Method::from_bytes(raw.to_ascii_uppercase().as_bytes())
        .map_err(|_| format!("invalid HTTP method: {raw}"))
}

fn parse_json(raw: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("request body must be valid JSON: {e}"))
}
