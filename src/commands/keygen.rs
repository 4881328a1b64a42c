//! Key generation command.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use peerchat::crypto::{export_key, generate_local_key};

use super::CommandExecutor;

/// Generate a chat key and print it in its exported form.
#[derive(Args, Debug)]
pub struct KeygenCommand {
    /// Write the key to this file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

impl CommandExecutor for KeygenCommand {
    fn execute(&self) -> Result<()> {
        let key = generate_local_key().context("Failed to generate key")?;
        let exported = export_key(&key);

        match &self.output {
            Some(path) => {
                fs::write(path, format!("{}\n", exported))
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("Key written to {}", path.display());
                println!("Keep this file secret.");
            }
            None => println!("{}", exported),
        }
        Ok(())
    }
}
