//! NetLink command-line front end.
//!
//! ```bash
//! # Receive into ~/NetLinkReceived and announce this machine
//! netlink receive
//!
//! # Send a file or a directory to a discovered machine
//! netlink send desk ./photos
//! ```

use anyhow::Result;
use clap::Parser;

mod commands;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Command::Receive(args) => commands::receive(args).await,
        Command::Send(args) => commands::send(args).await,
        Command::Discover(args) => commands::discover(args).await,
        Command::CleanPartials(args) => commands::clean_partials(args),
    }
}

fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}
