// ABOUTME: Command implementations behind the CLI
// ABOUTME: `run` relays the binlog, `checkpoint` inspects or resets the resume position

pub mod checkpoint;
pub mod run;

pub use checkpoint::{command as checkpoint, CheckpointArgs};
pub use run::{run, RunArgs};
