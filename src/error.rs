// ABOUTME: Error taxonomy for the relay pipeline and its process exit codes
// ABOUTME: Startup, checkpoint, source, serialization and broker failures

use std::path::PathBuf;

use thiserror::Error;

/// Graceful shutdown.
pub const EXIT_OK: u8 = 0;
/// The relay stopped on a source, serialization or broker failure.
pub const EXIT_RELAY_FAILURE: u8 = 1;
/// Configuration file missing or malformed.
pub const EXIT_CONFIG: u8 = 2;
/// Checkpoint file exists but cannot be parsed.
pub const EXIT_CHECKPOINT_CORRUPT: u8 = 3;
/// Checkpoint could not be written during shutdown.
pub const EXIT_CHECKPOINT_SAVE: u8 = 4;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("configuration file {path:?} not found")]
    ConfigMissing { path: PathBuf },

    #[error("configuration file {path:?} is malformed: {reason}")]
    ConfigMalformed { path: PathBuf, reason: String },

    /// Recoverable: the caller starts from the server's current position.
    #[error("no checkpoint found at {path:?}")]
    CheckpointNotFound { path: PathBuf },

    #[error("checkpoint {path:?} is corrupt: {reason}")]
    CheckpointCorrupt { path: PathBuf, reason: String },

    #[error("failed to save checkpoint {path:?}: {reason}")]
    CheckpointSave { path: PathBuf, reason: String },

    #[error("lost connection to source: {0}")]
    SourceConnectionLost(String),

    #[error("source protocol error: {0}")]
    SourceProtocol(String),

    #[error("cannot serialize event from {schema}.{table}: {reason}")]
    Serialization {
        schema: String,
        table: String,
        reason: String,
    },

    #[error("failed to publish to topic '{topic}': {reason}")]
    Publish { topic: String, reason: String },

    #[error("broker flush failed: {0}")]
    BrokerFlush(String),

    #[error("failed to create broker client: {0}")]
    BrokerConnect(String),
}

impl RelayError {
    /// Process exit code used when this error ends the process.
    pub fn exit_code(&self) -> u8 {
        match self {
            RelayError::ConfigMissing { .. } | RelayError::ConfigMalformed { .. } => EXIT_CONFIG,
            RelayError::CheckpointCorrupt { .. } => EXIT_CHECKPOINT_CORRUPT,
            RelayError::CheckpointSave { .. } => EXIT_CHECKPOINT_SAVE,
            RelayError::CheckpointNotFound { .. }
            | RelayError::SourceConnectionLost(_)
            | RelayError::SourceProtocol(_)
            | RelayError::Serialization { .. }
            | RelayError::Publish { .. }
            | RelayError::BrokerFlush(_)
            | RelayError::BrokerConnect(_) => EXIT_RELAY_FAILURE,
        }
    }
}

/// Exit code for an error chain that may wrap a [`RelayError`].
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<RelayError>())
        .map(RelayError::exit_code)
        .unwrap_or(EXIT_RELAY_FAILURE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn config_errors_map_to_config_exit_code() {
        let err = RelayError::ConfigMissing {
            path: PathBuf::from("configuration.json"),
        };
        assert_eq!(err.exit_code(), EXIT_CONFIG);
    }

    #[test]
    fn exit_code_found_through_context() {
        let err: anyhow::Error = Err::<(), _>(RelayError::CheckpointCorrupt {
            path: PathBuf::from("pos.json"),
            reason: "expected value".to_string(),
        })
        .context("failed to load checkpoint")
        .unwrap_err();
        assert_eq!(exit_code_for(&err), EXIT_CHECKPOINT_CORRUPT);
    }

    #[test]
    fn missing_checkpoint_reaching_exit_is_a_failure() {
        let err: anyhow::Error = RelayError::CheckpointNotFound {
            path: PathBuf::from("mysql-replica-pos.json"),
        }
        .into();
        assert_eq!(exit_code_for(&err), EXIT_RELAY_FAILURE);
        assert_ne!(exit_code_for(&err), EXIT_OK);
    }

    #[test]
    fn unknown_errors_are_relay_failures() {
        let err = anyhow::anyhow!("boom");
        assert_eq!(exit_code_for(&err), EXIT_RELAY_FAILURE);
    }
}
