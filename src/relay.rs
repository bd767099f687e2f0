// ABOUTME: Event relay pipeline: pull, whitelist filter, normalize, encode, publish
// ABOUTME: Advances the shared resume position only after an event is fully handled

use std::sync::Arc;

use crate::broker::Broker;
use crate::checkpoint::PositionTracker;
use crate::config::Whitelist;
use crate::error::RelayError;
use crate::event::{SourceItem, SourceRecord};
use crate::normalize::PayloadEncoder;
use crate::source::ChangeSource;

const STATS_LOG_EVERY: u64 = 10_000;

/// Why [`EventRelay::run`] returned without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    SourceExhausted,
}

/// Counters kept by the relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub received: u64,
    pub published: u64,
    pub filtered: u64,
}

/// Single worker relaying source records to the broker in log order.
pub struct EventRelay<S, B> {
    source: S,
    broker: Arc<B>,
    whitelist: Whitelist,
    encoder: PayloadEncoder,
    position: PositionTracker,
    stats: RelayStats,
}

impl<S, B> EventRelay<S, B>
where
    S: ChangeSource,
    B: Broker,
{
    pub fn new(
        source: S,
        broker: Arc<B>,
        whitelist: Whitelist,
        encoder: PayloadEncoder,
        position: PositionTracker,
    ) -> Self {
        Self {
            source,
            broker,
            whitelist,
            encoder,
            position,
            stats: RelayStats::default(),
        }
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    /// Relay until the source is exhausted or an event fails.
    ///
    /// Await points are the source pull and a `send` waiting for broker
    /// buffer space. Dropping this future at either leaves the position at
    /// the last fully handled event.
    pub async fn run(&mut self) -> Result<RelayExit, RelayError> {
        tracing::info!(
            position = %self.position.current(),
            tables = self.whitelist.table_count(),
            "Relay started"
        );

        while let Some(item) = self.source.next_item().await? {
            match item {
                SourceItem::Change(record) => self.process(record).await?,
                SourceItem::Position(position) => self.position.advance(position),
            }
        }

        tracing::info!(
            received = self.stats.received,
            published = self.stats.published,
            filtered = self.stats.filtered,
            "Source exhausted"
        );
        Ok(RelayExit::SourceExhausted)
    }

    /// Handle one record. On error the position stays at the previous event.
    pub async fn process(&mut self, record: SourceRecord) -> Result<(), RelayError> {
        let SourceRecord { event, position } = record;
        self.stats.received += 1;

        if self.whitelist.allows(&event.schema, &event.table) {
            let message = self.encoder.encode(event)?;
            self.broker.send(&message.topic, message.payload).await?;
            self.stats.published += 1;
        } else {
            tracing::trace!(table = %event.qualified_name(), "event filtered");
            self.stats.filtered += 1;
        }

        self.position.advance(position);

        if self.stats.received % STATS_LOG_EVERY == 0 {
            tracing::debug!(
                received = self.stats.received,
                published = self.stats.published,
                filtered = self.stats.filtered,
                position = %self.position.current(),
                "relay progress"
            );
        }
        Ok(())
    }
}
