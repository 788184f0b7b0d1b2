//! Startup registration of one consumer loop per configured topic

use crate::config::IngestConfig;
use crate::consumer::consumer::{ConsumerHandle, ConsumerStatus, TopicConsumer};
use crate::consumer::dispatcher::Dispatcher;
use crate::consumer::metrics::IngestMetrics;
use crate::consumer::retry::RetryExecutor;
use crate::consumer::shutdown::ShutdownState;
use crate::consumer::source::RecordSourceFactory;
use crate::error::{IngestError, IngestResult};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info};

/// One topic's consumer wiring, fixed for the process lifetime
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicRegistration {
    pub topic: String,
    pub group_id: String,
    /// Always 1: one ordered poll loop per topic
    pub concurrency: usize,
    pub auto_start: bool,
}

impl TopicRegistration {
    pub fn new(topic: impl Into<String>, group_id_prefix: &str, auto_start: bool) -> Self {
        let topic = topic.into();
        Self {
            group_id: Self::group_id_for(group_id_prefix, &topic),
            topic,
            concurrency: 1,
            auto_start,
        }
    }

    /// Consumer group for `topic`, unique per topic
    pub fn group_id_for(prefix: &str, topic: &str) -> String {
        format!("{}-{}", prefix, topic)
    }

    /// Name used for the consumer loop and its log output
    pub fn consumer_name(&self) -> String {
        format!("{}-consumer-0", self.topic)
    }
}

/// Builds consumer loops from configuration
pub struct TopicRegistrar;

impl TopicRegistrar {
    /// Derive registrations, rejecting empty and duplicate topic names
    pub fn registrations(config: &IngestConfig) -> IngestResult<Vec<TopicRegistration>> {
        let mut seen = HashSet::new();
        let mut registrations = Vec::with_capacity(config.topics.len());

        for topic in &config.topics {
            let trimmed = topic.trim();
            if trimmed.is_empty() {
                return Err(IngestError::registration(
                    topic,
                    IngestError::Config("topic name cannot be empty".to_string()),
                ));
            }
            if !seen.insert(trimmed.to_string()) {
                return Err(IngestError::registration(
                    trimmed,
                    IngestError::Config("topic configured more than once".to_string()),
                ));
            }
            registrations.push(TopicRegistration::new(
                trimmed,
                &config.group_id_prefix,
                config.auto_start,
            ));
        }

        Ok(registrations)
    }

    /// Create every consumer loop, or none.
    ///
    /// Sources are all created before any loop starts, so a failure on one
    /// topic leaves nothing running.
    pub fn register_all(
        config: &IngestConfig,
        factory: &dyn RecordSourceFactory,
        dispatcher: Dispatcher,
        shutdown: Arc<ShutdownState>,
        metrics: IngestMetrics,
    ) -> IngestResult<ConsumerRegistry> {
        let registrations = Self::registrations(config)?;

        let mut sources = Vec::with_capacity(registrations.len());
        for registration in registrations {
            match factory.create(&registration) {
                Ok(source) => sources.push((registration, source)),
                Err(cause) => {
                    error!(topic = %registration.topic, "Consumer registration failed: {}", cause);
                    for (_, source) in &sources {
                        let source = source.clone();
                        tokio::spawn(async move { source.close().await });
                    }
                    return Err(IngestError::registration(&registration.topic, cause));
                }
            }
        }

        let retry = RetryExecutor::new(config.retry_policy.clone());
        let handles = sources
            .into_iter()
            .map(|(registration, source)| {
                info!(
                    topic = %registration.topic,
                    group_id = %registration.group_id,
                    auto_start = registration.auto_start,
                    "Registered consumer"
                );
                TopicConsumer::new(
                    registration,
                    source,
                    dispatcher.clone(),
                    retry.clone(),
                    config.poll_batch_size,
                    config.poll_timeout,
                    shutdown.subscribe(),
                    metrics.clone(),
                )
                .spawn()
            })
            .collect();

        Ok(ConsumerRegistry { handles })
    }
}

/// Every registered consumer loop
#[derive(Debug, Default)]
pub struct ConsumerRegistry {
    handles: Vec<ConsumerHandle>,
}

impl ConsumerRegistry {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn handles(&self) -> &[ConsumerHandle] {
        &self.handles
    }

    /// Start loops registered without auto-start
    pub fn start_all(&self) {
        for handle in &self.handles {
            handle.start();
        }
    }

    /// Stop polling on every loop. Idempotent.
    pub fn pause_all(&self) {
        for handle in &self.handles {
            handle.pause();
        }
    }

    /// Undo [`ConsumerRegistry::pause_all`]. Idempotent.
    pub fn resume_all(&self) {
        for handle in &self.handles {
            handle.resume();
        }
    }

    /// True when there is at least one loop and every loop is paused
    pub fn all_paused(&self) -> bool {
        !self.handles.is_empty() && self.handles.iter().all(ConsumerHandle::is_paused)
    }

    pub fn statuses(&self) -> Vec<ConsumerStatus> {
        self.handles.iter().map(ConsumerHandle::status).collect()
    }

    /// Wait for every loop to exit after shutdown was signalled
    pub async fn join_all(&self) {
        for handle in &self.handles {
            handle.join().await;
        }
    }
}
