// ABOUTME: `run` command: wires config, checkpoint, Kafka and the binlog source together
// ABOUTME: Returns the process exit code reported by the shutdown sequence

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;

use crate::broker::KafkaBroker;
use crate::checkpoint::{position_channel, CheckpointStore, FileCheckpointStore, ResumePosition};
use crate::config::RelayConfig;
use crate::error::{RelayError, EXIT_CONFIG, EXIT_OK};
use crate::relay::EventRelay;
use crate::shutdown::{spawn_periodic_checkpoints, supervise, ShutdownCoordinator, SignalListener};
use crate::source::MysqlBinlogSource;

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Relay configuration (JSON, or TOML when the file ends in .toml)
    #[arg(long, default_value = "configuration.json")]
    pub config: PathBuf,
    /// Checkpoint file holding the resume position
    #[arg(long, default_value = "mysql-replica-pos.json")]
    pub checkpoint: PathBuf,
    /// Source database password (overrides the configuration file)
    #[arg(
        long = "source-password",
        env = "BINLOG_RELAY_SOURCE_PASSWORD",
        hide_env_values = true
    )]
    pub source_password: Option<String>,
}

pub async fn run(args: RunArgs) -> Result<u8> {
    let mut config = RelayConfig::load(&args.config).context("Failed to load configuration")?;
    if let Some(password) = args.source_password {
        config.source_connection.password = Some(password);
    }
    tracing::info!(
        config = %args.config.display(),
        schemas = ?config.whitelist.schemas(),
        tables = config.whitelist.table_count(),
        "Configuration loaded"
    );

    // A corrupt checkpoint stops us here, before anything connects.
    let store = Arc::new(FileCheckpointStore::new(&args.checkpoint));
    let resume = match store.load() {
        Ok(position) => position,
        Err(RelayError::CheckpointNotFound { path }) => {
            tracing::info!(
                "No checkpoint at {}, starting from the current binlog position",
                path.display()
            );
            ResumePosition::fresh()
        }
        Err(err) => return Err(err).context("Refusing to start"),
    };

    let mut signals = SignalListener::install()
        .context("Failed to install signal handlers")?
        .forward();

    let broker = match KafkaBroker::connect(&config.kafka_settings()) {
        Ok(broker) => Arc::new(broker),
        Err(err) => return Ok(startup_failed(err)),
    };

    let source_settings = config.source_settings();
    let source = tokio::select! {
        opened = MysqlBinlogSource::open(&source_settings, &resume) => match opened {
            Ok(source) => source,
            Err(err) => return Ok(startup_failed(err)),
        },
        Some(kind) = signals.recv() => {
            tracing::info!("Received {} before the relay started, exiting", kind);
            return Ok(EXIT_OK);
        }
    };

    let (tracker, handle) = position_channel(source.position().clone());
    let coordinator = Arc::new(ShutdownCoordinator::new(
        Arc::clone(&broker),
        Arc::clone(&store),
        handle,
        config.flush_timeout(),
    ));
    let periodic = config
        .checkpoint_interval()
        .map(|interval| spawn_periodic_checkpoints(Arc::clone(&coordinator), interval));

    let mut relay = EventRelay::new(
        source,
        broker,
        config.whitelist.clone(),
        config.encoder(),
        tracker,
    );
    let report = supervise(relay.run(), &coordinator, &mut signals).await;

    if let Some(periodic) = periodic {
        periodic.abort();
    }

    let stats = relay.stats();
    tracing::info!(
        received = stats.received,
        published = stats.published,
        filtered = stats.filtered,
        "Relay stopped"
    );

    let Some(report) = report else {
        return Ok(EXIT_OK);
    };
    let exit_code = report.exit_code();
    tracing::info!(
        reason = %report.reason,
        position = %report.position,
        exit_code,
        "Shutdown complete"
    );
    Ok(exit_code)
}

fn startup_failed(err: RelayError) -> u8 {
    tracing::error!("Startup failed: {}", err);
    EXIT_CONFIG
}
