// ABOUTME: Broker client seam used by the relay and the shutdown path
// ABOUTME: Buffered async send plus a synchronous, bounded flush

pub mod kafka;

use std::future::Future;
use std::time::Duration;

use crate::error::RelayError;

pub use kafka::KafkaBroker;

/// Message broker client.
///
/// `send` hands the payload to a client-managed buffer and resolves without
/// waiting for acknowledgement; it only waits while the local buffer is
/// full. Ordering of submissions is the caller's, delivery ordering and
/// partitioning are the client's. `flush` blocks until every buffered
/// message is acknowledged or failed, or `timeout` elapses, and fails if any
/// message could not be delivered.
pub trait Broker: Send + Sync + 'static {
    fn send(
        &self,
        topic: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), RelayError>> + Send;

    fn flush(&self, timeout: Duration) -> Result<(), RelayError>;
}
