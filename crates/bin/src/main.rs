use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands {
    pub mod discover;
    pub mod health;
    pub mod info;
    pub mod serve;
}
mod output;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Inspection commands keep stdout clean
    let default_level = match cli.command {
        Commands::Serve(_) => "lansync=info",
        _ => "lansync=warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_level.parse()?))
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::Serve(args) => commands::serve::run(args).await,
        Commands::Health(args) => commands::health::run(args).await,
        Commands::Info(args) => commands::info::run(args).await,
        Commands::Discover(args) => commands::discover::run(args).await,
    }
}
