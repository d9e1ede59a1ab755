//! CLI argument definitions for the lansync binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use lansync::config::{DEFAULT_DISCOVERY_PORT, DEFAULT_SYNC_PORT};

/// Sync mode for pushes triggered by the node
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Mode {
    /// Send every record on each push
    Full,
    /// Send only records changed since the last successful push
    Incremental,
}

/// Winner selection for concurrent edits
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Strategy {
    /// Later modification wins
    Lww,
    /// Higher version wins
    HighestVersion,
}

/// Output format for inspection commands
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Format {
    Human,
    Json,
}

/// lansync LAN synchronization node
#[derive(Parser, Debug)]
#[command(name = "lansync")]
#[command(about = "lansync: serverless sync of tasks, time logs and goals on the local network")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a sync node
    Serve(ServeArgs),
    /// Check health of a running node
    Health(HealthArgs),
    /// Show the identity of a running node
    Info(InfoArgs),
    /// Listen for discovery announcements and print the peer table
    Discover(DiscoverArgs),
}

/// Arguments for the serve command
#[derive(clap::Args, Debug)]
pub struct ServeArgs {
    /// WebSocket port to listen on
    #[arg(short, long, default_value_t = DEFAULT_SYNC_PORT, env = "LANSYNC_PORT")]
    pub port: u16,

    /// UDP discovery port
    #[arg(long, default_value_t = DEFAULT_DISCOVERY_PORT, env = "LANSYNC_DISCOVERY_PORT")]
    pub discovery_port: u16,

    /// Display name announced to peers (defaults to the host name)
    #[arg(short, long, env = "LANSYNC_NAME")]
    pub name: Option<String>,

    /// Data directory holding lansync.json and peer-id
    #[arg(short = 'D', long, default_value = ".", env = "LANSYNC_DATA_DIR")]
    pub data_dir: PathBuf,

    /// JSON config file; command-line flags override it
    #[arg(short, long, env = "LANSYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Sync mode
    #[arg(long, env = "LANSYNC_MODE")]
    pub mode: Option<Mode>,

    /// Conflict resolution strategy
    #[arg(long, env = "LANSYNC_STRATEGY")]
    pub strategy: Option<Strategy>,

    /// Disable UDP discovery
    #[arg(long)]
    pub no_discovery: bool,

    /// Dial discovered peers automatically
    #[arg(long, env = "LANSYNC_AUTO_CONNECT")]
    pub auto_connect: bool,

    /// Peer to connect to at startup, as host:port (repeatable)
    #[arg(long = "connect", value_name = "HOST:PORT")]
    pub connect: Vec<String>,
}

/// Arguments for the health command
#[derive(clap::Args, Debug)]
pub struct HealthArgs {
    /// Base URL of the node to check
    #[arg(default_value = "http://127.0.0.1:8765", env = "LANSYNC_URL")]
    pub url: String,

    /// Timeout in seconds
    #[arg(short, long, default_value_t = 5)]
    pub timeout: u64,
}

/// Arguments for the info command
#[derive(clap::Args, Debug)]
pub struct InfoArgs {
    /// Base URL of the node to query
    #[arg(default_value = "http://127.0.0.1:8765", env = "LANSYNC_URL")]
    pub url: String,

    /// Timeout in seconds
    #[arg(short, long, default_value_t = 5)]
    pub timeout: u64,

    /// Output format
    #[arg(short, long, default_value = "human")]
    pub format: Format,
}

/// Arguments for the discover command
#[derive(clap::Args, Debug)]
pub struct DiscoverArgs {
    /// UDP discovery port
    #[arg(long, default_value_t = DEFAULT_DISCOVERY_PORT, env = "LANSYNC_DISCOVERY_PORT")]
    pub port: u16,

    /// How long to listen
    #[arg(short, long, default_value_t = 10)]
    pub seconds: u64,

    /// Output format
    #[arg(short, long, default_value = "human")]
    pub format: Format,
}
