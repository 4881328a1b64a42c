//! peerchat - encrypted one-to-one chat between peers
//!
//! A CLI for chatting over TCP with AES-GCM encrypted messages.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::{ChatCommand, CommandExecutor, KeygenCommand};

/// peerchat - encrypted one-to-one chat
///
/// Start a session with `peerchat chat`, share the printed peer ID, and let
/// the other side connect with `peerchat chat --connect <id>`.
#[derive(Parser)]
#[command(name = "peerchat")]
#[command(version)]
#[command(about = "Encrypted one-to-one chat between peers")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a chat session
    Chat(ChatCommand),

    /// Generate a chat key and print it
    Keygen(KeygenCommand),
}

fn main() -> Result<()> {
    // Set RUST_LOG=peerchat=debug for verbose output
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("peerchat=info"));
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Chat(cmd) => cmd.execute(),
        Commands::Keygen(cmd) => cmd.execute(),
    }
}
