// ABOUTME: CLI entry point for binlog-relay
// ABOUTME: Parses commands, sets up logging and maps the outcome to an exit code

use std::path::PathBuf;
use std::process::ExitCode;

use binlog_relay::commands;
use binlog_relay::error::{exit_code_for, EXIT_CONFIG, EXIT_OK};
use binlog_relay::logging::{LogFile, LogRotation};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "binlog-relay")]
#[command(about = "Relay MySQL binlog row changes to Kafka", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log: String,
    /// Also append logs to this file
    #[arg(long = "log-file", global = true)]
    log_file: Option<PathBuf>,
    /// How often the log file is rolled over
    #[arg(long = "log-rotation", global = true, value_enum, default_value_t = LogRotation::Daily)]
    log_rotation: LogRotation,
    /// Rotated log files to keep
    #[arg(long = "log-max-files", global = true, default_value_t = 5)]
    log_max_files: usize,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tail the binlog and publish whitelisted row changes until stopped
    Run(commands::RunArgs),
    /// Inspect or reset the stored resume position
    Checkpoint {
        #[command(flatten)]
        args: commands::CheckpointArgs,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_file = cli.log_file.map(|path| LogFile {
        path,
        rotation: cli.log_rotation,
        max_files: cli.log_max_files,
    });
    // Dropping the guard flushes buffered file logs, so it lives until exit.
    let _log_guard = match binlog_relay::logging::init(&cli.log, log_file.as_ref()) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let result = match cli.command {
        Commands::Run(args) => commands::run(args).await,
        Commands::Checkpoint { args } => commands::checkpoint(args).map(|()| EXIT_OK),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::from(exit_code_for(&err))
        }
    }
}
