use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use crate::checkpoint::{CheckpointStore, FileCheckpointStore};
use crate::error::RelayError;

#[derive(Args)]
pub struct CheckpointArgs {
    #[command(subcommand)]
    command: CheckpointCommands,
}

#[derive(Subcommand)]
enum CheckpointCommands {
    /// Show the stored resume position
    Show {
        #[arg(long, default_value = "mysql-replica-pos.json")]
        checkpoint: PathBuf,
    },
    /// Delete the checkpoint so the next run starts from the current binlog position
    Reset {
        #[arg(long, default_value = "mysql-replica-pos.json")]
        checkpoint: PathBuf,
    },
}

pub fn command(args: CheckpointArgs) -> Result<()> {
    match args.command {
        CheckpointCommands::Show { checkpoint } => {
            let store = FileCheckpointStore::new(checkpoint);
            match store.load() {
                Ok(position) => println!("Resume position: {}", position),
                Err(RelayError::CheckpointNotFound { path }) => {
                    println!("No checkpoint stored at {}.", path.display())
                }
                Err(err) => return Err(err).context("Failed to load checkpoint"),
            }
        }
        CheckpointCommands::Reset { checkpoint } => {
            let store = FileCheckpointStore::new(checkpoint);
            let removed = store.clear().with_context(|| {
                format!("Failed to remove checkpoint {}", store.path().display())
            })?;
            if removed {
                println!("Checkpoint {} removed.", store.path().display());
            } else {
                println!("No checkpoint stored at {}.", store.path().display());
            }
        }
    }
    Ok(())
}
