//! In-memory broker for local runs and tests
//!
//! Keeps an append-only log per topic partition, per-group read positions and
//! a commit log. Poll, commit and registration failures can be injected.

use crate::consumer::record::{InboundRecord, OffsetCommitter};
use crate::consumer::registrar::TopicRegistration;
use crate::consumer::source::{RecordSource, RecordSourceFactory};
use crate::error::{IngestError, IngestResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// One committed offset
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommittedOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<Vec<u8>>,
    value: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct BrokerState {
    /// topic -> partition -> records
    logs: HashMap<String, BTreeMap<i32, Vec<StoredRecord>>>,
    commits: Vec<CommittedOffset>,
    paused: HashSet<String>,
    rejected: HashSet<String>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BrokerState>,
    appended: Notify,
    commit_failures: AtomicU32,
    poll_failures: AtomicU32,
    polls: AtomicU64,
}

/// Shared in-memory broker
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record, returning its offset
    pub fn produce(&self, topic: &str, partition: i32, key: Option<&[u8]>, value: &[u8]) -> i64 {
        self.append(topic, partition, key, Some(value))
    }

    /// Append a record without a value
    pub fn produce_tombstone(&self, topic: &str, partition: i32, key: Option<&[u8]>) -> i64 {
        self.append(topic, partition, key, None)
    }

    fn append(&self, topic: &str, partition: i32, key: Option<&[u8]>, value: Option<&[u8]>) -> i64 {
        let offset = {
            let mut state = self.shared.state.lock();
            let log = state
                .logs
                .entry(topic.to_string())
                .or_default()
                .entry(partition)
                .or_default();
            log.push(StoredRecord {
                key: key.map(<[u8]>::to_vec),
                value: value.map(<[u8]>::to_vec),
            });
            (log.len() - 1) as i64
        };
        self.shared.appended.notify_waiters();
        offset
    }

    /// Build a record bound to this broker without appending it to a log
    pub fn record(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
    ) -> InboundRecord {
        InboundRecord::new(
            topic,
            partition,
            offset,
            key.map(<[u8]>::to_vec),
            value.map(<[u8]>::to_vec),
            Arc::new(self.clone()),
        )
    }

    /// Fail the next `n` commits
    pub fn fail_commits(&self, n: u32) {
        self.shared.commit_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` polls
    pub fn fail_polls(&self, n: u32) {
        self.shared.poll_failures.store(n, Ordering::SeqCst);
    }

    /// Make consumer creation for `topic` fail
    pub fn reject_topic(&self, topic: &str) {
        self.shared.state.lock().rejected.insert(topic.to_string());
    }

    pub fn commits(&self) -> Vec<CommittedOffset> {
        self.shared.state.lock().commits.clone()
    }

    /// How many times this exact offset was committed
    pub fn commit_count(&self, topic: &str, partition: i32, offset: i64) -> usize {
        self.shared
            .state
            .lock()
            .commits
            .iter()
            .filter(|c| c.topic == topic && c.partition == partition && c.offset == offset)
            .count()
    }

    pub fn is_paused(&self, topic: &str) -> bool {
        self.shared.state.lock().paused.contains(topic)
    }

    /// Total successful and failed polls across all sources
    pub fn poll_count(&self) -> u64 {
        self.shared.polls.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl OffsetCommitter for MemoryBroker {
    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> IngestResult<()> {
        if Self::take_failure(&self.shared.commit_failures) {
            return Err(IngestError::Commit {
                topic: topic.to_string(),
                partition,
                offset,
                reason: "broker unavailable".to_string(),
            });
        }

        self.shared.state.lock().commits.push(CommittedOffset {
            topic: topic.to_string(),
            partition,
            offset,
        });
        Ok(())
    }
}

impl RecordSourceFactory for MemoryBroker {
    fn create(&self, registration: &TopicRegistration) -> IngestResult<Arc<dyn RecordSource>> {
        if self.shared.state.lock().rejected.contains(&registration.topic) {
            return Err(IngestError::Broker(format!(
                "topic '{}' does not exist",
                registration.topic
            )));
        }

        Ok(Arc::new(MemorySource {
            broker: self.clone(),
            topic: registration.topic.clone(),
            positions: Mutex::new(HashMap::new()),
        }))
    }
}

/// A single group's view of one topic
#[derive(Debug)]
pub struct MemorySource {
    broker: MemoryBroker,
    topic: String,
    positions: Mutex<HashMap<i32, i64>>,
}

impl MemorySource {
    fn fetch(&self, max_records: usize) -> Vec<InboundRecord> {
        let state = self.broker.shared.state.lock();
        let Some(partitions) = state.logs.get(&self.topic) else {
            return Vec::new();
        };

        let mut positions = self.positions.lock();
        let mut records = Vec::new();
        for (partition, log) in partitions {
            let position = positions.entry(*partition).or_insert(0);
            while (*position as usize) < log.len() && records.len() < max_records {
                let stored = &log[*position as usize];
                records.push(InboundRecord::new(
                    self.topic.clone(),
                    *partition,
                    *position,
                    stored.key.clone(),
                    stored.value.clone(),
                    Arc::new(self.broker.clone()),
                ));
                *position += 1;
            }
        }
        records
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn poll(&self, max_records: usize, timeout: Duration) -> IngestResult<Vec<InboundRecord>> {
        self.broker.shared.polls.fetch_add(1, Ordering::SeqCst);
        if MemoryBroker::take_failure(&self.broker.shared.poll_failures) {
            return Err(IngestError::Broker("poll failed: broker unavailable".to_string()));
        }

        let notified = self.broker.shared.appended.notified();
        let records = self.fetch(max_records);
        if !records.is_empty() {
            return Ok(records);
        }

        let _ = tokio::time::timeout(timeout, notified).await;
        Ok(self.fetch(max_records))
    }

    async fn pause(&self) -> IngestResult<()> {
        self.broker.shared.state.lock().paused.insert(self.topic.clone());
        Ok(())
    }

    async fn resume(&self) -> IngestResult<()> {
        self.broker.shared.state.lock().paused.remove(&self.topic);
        Ok(())
    }
}
