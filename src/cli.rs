//! CLI argument parsing.

use clap::Parser;

/// Headless AI coding agent kernel.
#[derive(Debug, Parser)]
#[command(name = "plover", version, about)]
pub struct Cli {
    /// Run mode: `stdio` (default) or `serve` (HTTP control surface).
    #[arg(long, default_value = "stdio")]
    pub mode: String,

    /// Open a specific session file.
    #[arg(long)]
    pub session: Option<String>,

    /// Continue the most recent session in the sessions directory.
    #[arg(long, short = 'c')]
    pub r#continue: bool,

    /// Keep the session in memory only (no file).
    #[arg(long)]
    pub no_session: bool,

    /// Override the sessions directory.
    #[arg(long)]
    pub sessions_dir: Option<String>,

    /// Model id to use (must be in the catalog).
    #[arg(long, short = 'm')]
    pub model: Option<String>,

    /// System prompt override.
    #[arg(long)]
    pub system_prompt: Option<String>,

    /// API key (falls back to the provider's environment variable).
    #[arg(long)]
    pub api_key: Option<String>,

    /// One-shot prompt: run a single turn, print the reply, exit.
    #[arg(long, short = 'p')]
    pub print: Option<String>,
}
