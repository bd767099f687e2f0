// In-memory stand-ins for the binlog source, the broker and the checkpoint store.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use binlog_relay::broker::Broker;
use binlog_relay::checkpoint::{CheckpointStore, ResumePosition};
use binlog_relay::event::{ChangeEvent, EventKind, RowImage, SourceItem, SourceRecord};
use binlog_relay::source::ChangeSource;
use binlog_relay::RelayError;
use tokio::sync::Notify;

pub fn insert(schema: &str, table: &str, fields: RowImage, pos: u64) -> SourceRecord {
    SourceRecord {
        event: ChangeEvent::new(schema, table, EventKind::Insert, fields),
        position: ResumePosition::at("mysql-bin.000001", pos),
    }
}

/// Replays a fixed script, then either ends or waits forever.
pub struct ScriptedSource {
    script: VecDeque<Result<SourceItem, RelayError>>,
    drained: Option<Arc<Notify>>,
}

impl ScriptedSource {
    pub fn new(records: Vec<SourceRecord>) -> Self {
        Self {
            script: records.into_iter().map(|r| Ok(r.into())).collect(),
            drained: None,
        }
    }

    /// Rows interleaved with commit positions, as a real binlog reports them.
    pub fn items(items: Vec<SourceItem>) -> Self {
        Self {
            script: items.into_iter().map(Ok).collect(),
            drained: None,
        }
    }

    /// Hang after the script instead of reporting exhaustion; `drained` is
    /// notified once the last record has been handed out.
    pub fn hanging(records: Vec<SourceRecord>, drained: Arc<Notify>) -> Self {
        Self {
            script: records.into_iter().map(|r| Ok(r.into())).collect(),
            drained: Some(drained),
        }
    }

    pub fn then_fail(mut self, err: RelayError) -> Self {
        self.script.push_back(Err(err));
        self
    }
}

impl ChangeSource for ScriptedSource {
    async fn next_item(&mut self) -> Result<Option<SourceItem>, RelayError> {
        match self.script.pop_front() {
            Some(Ok(item)) => Ok(Some(item)),
            Some(Err(err)) => Err(err),
            None => match &self.drained {
                Some(drained) => {
                    drained.notify_one();
                    std::future::pending().await
                }
                None => Ok(None),
            },
        }
    }
}

#[derive(Default)]
pub struct RecordingBroker {
    sent: Mutex<Vec<(String, Vec<u8>)>>,
    flushes: AtomicUsize,
    fail_topic: Option<String>,
    fail_flush: bool,
    flush_delay: Duration,
    stalled: Option<Arc<Notify>>,
}

impl RecordingBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_topic(topic: &str) -> Self {
        Self {
            fail_topic: Some(topic.to_string()),
            ..Self::default()
        }
    }

    pub fn failing_flush() -> Self {
        Self {
            fail_flush: true,
            ..Self::default()
        }
    }

    pub fn slow_flush(delay: Duration) -> Self {
        Self {
            flush_delay: delay,
            ..Self::default()
        }
    }

    /// Every send waits forever, like a producer whose queue never frees up;
    /// `stalled` is notified when the first send starts waiting.
    pub fn stalled(stalled: Arc<Notify>) -> Self {
        Self {
            stalled: Some(stalled),
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<(String, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_json(&self) -> Vec<(String, serde_json::Value)> {
        self.sent()
            .into_iter()
            .map(|(topic, payload)| (topic, serde_json::from_slice(&payload).unwrap()))
            .collect()
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl Broker for RecordingBroker {
    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<(), RelayError> {
        if let Some(stalled) = &self.stalled {
            stalled.notify_one();
            std::future::pending::<()>().await;
        }
        if self.fail_topic.as_deref() == Some(topic) {
            return Err(RelayError::Publish {
                topic: topic.to_string(),
                reason: "leader not available".to_string(),
            });
        }
        self.sent.lock().unwrap().push((topic.to_string(), payload));
        Ok(())
    }

    fn flush(&self, _timeout: Duration) -> Result<(), RelayError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        if !self.flush_delay.is_zero() {
            std::thread::sleep(self.flush_delay);
        }
        if self.fail_flush {
            return Err(RelayError::BrokerFlush("request timed out".to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct CountingStore {
    saves: Mutex<Vec<ResumePosition>>,
    fail_save: bool,
}

impl CountingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail_save: true,
            ..Self::default()
        }
    }

    pub fn saves(&self) -> Vec<ResumePosition> {
        self.saves.lock().unwrap().clone()
    }
}

impl CheckpointStore for CountingStore {
    fn load(&self) -> Result<ResumePosition, RelayError> {
        self.saves
            .lock()
            .unwrap()
            .last()
            .cloned()
            .ok_or_else(|| RelayError::CheckpointNotFound {
                path: "memory".into(),
            })
    }

    fn save(&self, position: &ResumePosition) -> Result<(), RelayError> {
        if self.fail_save {
            return Err(RelayError::CheckpointSave {
                path: "memory".into(),
                reason: "read-only file system".to_string(),
            });
        }
        self.saves.lock().unwrap().push(position.clone());
        Ok(())
    }
}
