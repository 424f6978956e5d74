use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "prsync",
    version,
    about = "Keep pull requests and CI runs in sync without burning the API quota"
)]
pub struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// YAML config file; PRSYNC_* environment variables apply when omitted
    #[arg(long, global = true, env = "PRSYNC_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Poll repositories and print pull request and workflow run changes
    Watch(WatchArgs),
    /// Authenticate and print user, auth state and rate-limit estimate
    Status,
    /// Print the effective configuration as YAML
    Config,
}

#[derive(clap::Args, Clone)]
pub struct WatchArgs {
    /// Repositories as owner/repo
    #[arg(required = true)]
    pub repos: Vec<String>,

    /// Polling period in seconds (overrides config)
    #[arg(long)]
    pub interval: Option<u64>,

    /// Skip workflow runs
    #[arg(long)]
    pub no_runs: bool,

    /// Do not restore or persist snapshots
    #[arg(long)]
    pub no_snapshots: bool,
}
