//! Shared helpers for the integration tests

#![allow(dead_code)]

use action_ingest::consumer::{MemoryBroker, RetryPolicy};
use action_ingest::store::{MemoryActionItemRepository, MemoryErrorStore};
use action_ingest::{Collaborators, IngestConfig};
use std::time::Duration;

pub const VALID: &[u8] =
    br#"{"title":"Replace valve","description":"Line 3","typeCode":"MAINT","status":"OPEN"}"#;
pub const MALFORMED: &[u8] = b"{not json";
pub const MISSING_TITLE: &[u8] = br#"{"typeCode":"MAINT","status":"OPEN"}"#;

/// Fast polling, fast retries and no scheduled probes during a test
pub fn test_config(topics: &[&str]) -> IngestConfig {
    IngestConfig::builder()
        .topics(topics.iter().copied())
        .group_id_prefix("test")
        .poll(10, Duration::from_millis(20))
        .worker_pool(2, 4, 16)
        .health(3, Duration::from_secs(3600))
        .retry_policy(RetryPolicy::fixed(3, Duration::from_millis(10)))
        .shutdown_timeout(Duration::from_secs(5))
        .build()
}

pub struct Harness {
    pub broker: MemoryBroker,
    pub repository: MemoryActionItemRepository,
    pub errors: MemoryErrorStore,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            broker: MemoryBroker::new(),
            repository: MemoryActionItemRepository::new(),
            errors: MemoryErrorStore::new(),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators::in_memory(&self.broker, &self.repository, &self.errors)
    }
}

/// Poll `cond` until it holds, failing the test after five seconds
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
