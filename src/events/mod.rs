//! 生命周期事件模块：以 CloudEvents 格式发布模型与推理事件，发布失败不影响调用方。
//!
//! # Lifecycle Events
//!
//! Structured notifications about model loads and completed inference work. Publishing
//! is fire-and-forget for the core: [`EventPublisher::publish`] logs delivery failures
//! and reports them as `false`, never as an error.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`LifecycleEvent`] | Typed event payloads (`model.loaded`, `model.failed`, ...) |
//! | [`CloudEvent`] | CloudEvents 1.0 envelope |
//! | [`EventSink`] | Trait for event destinations |
//! | [`EventPublisher`] | Wraps events in envelopes and publishes quietly |
//! | [`NoopEventSink`] | Discards events |
//! | [`LogEventSink`] | Writes events to the tracing log |
//! | [`InMemoryEventSink`] | Keeps events for assertions in tests |
//! | [`HttpEventSink`] | POSTs envelopes to a webhook or event bridge |
//! | [`CompositeEventSink`] | Fans out to several sinks |

mod envelope;
mod http;

pub use envelope::{CloudEvent, LifecycleEvent};
pub use http::HttpEventSink;

use crate::Result;
use async_trait::async_trait;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error, info, warn};

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }
    async fn publish(&self, event: &CloudEvent) -> Result<()>;
    async fn close(&self) -> Result<()> {
        Ok(())
    }
    fn name(&self) -> &'static str;
}

pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn publish(&self, _: &CloudEvent) -> Result<()> {
        Ok(())
    }
    fn name(&self) -> &'static str {
        "noop"
    }
}

/// Logs each event at `info`.
pub struct LogEventSink;

#[async_trait]
impl EventSink for LogEventSink {
    async fn publish(&self, event: &CloudEvent) -> Result<()> {
        info!(
            event_type = %event.event_type,
            event_id = %event.id,
            data = %event.data,
            "lifecycle event"
        );
        Ok(())
    }
    fn name(&self) -> &'static str {
        "log"
    }
}

/// In-memory sink for testing. Keeps at most `max_events`, dropping the oldest.
pub struct InMemoryEventSink {
    events: RwLock<Vec<CloudEvent>>,
    max_events: usize,
}

impl InMemoryEventSink {
    pub fn new(max: usize) -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            max_events: max,
        }
    }
    pub fn events(&self) -> Vec<CloudEvent> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
    /// Events whose full type (including prefix) is `event_type`.
    pub fn events_of_type(&self, event_type: &str) -> Vec<CloudEvent> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
    pub fn clear(&self) {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
    pub fn len(&self) -> usize {
        self.events.read().unwrap_or_else(PoisonError::into_inner).len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryEventSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventSink for InMemoryEventSink {
    async fn publish(&self, event: &CloudEvent) -> Result<()> {
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        events.push(event.clone());
        if events.len() > self.max_events {
            events.remove(0);
        }
        Ok(())
    }
    fn name(&self) -> &'static str {
        "in_memory"
    }
}

/// Fan-out sink. Delivery succeeds if every inner sink accepted the event.
pub struct CompositeEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl CompositeEventSink {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }
    pub fn add_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl Default for CompositeEventSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for CompositeEventSink {
    async fn connect(&self) -> Result<()> {
        for s in &self.sinks {
            s.connect().await?;
        }
        Ok(())
    }
    async fn publish(&self, event: &CloudEvent) -> Result<()> {
        let mut first_err = None;
        for s in &self.sinks {
            if let Err(e) = s.publish(event).await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
    async fn close(&self) -> Result<()> {
        for s in &self.sinks {
            let _ = s.close().await;
        }
        Ok(())
    }
    fn name(&self) -> &'static str {
        "composite"
    }
}

/// Envelope builder in front of an [`EventSink`].
pub struct EventPublisher {
    sink: Arc<dyn EventSink>,
    topic_prefix: String,
    service_name: String,
}

impl EventPublisher {
    pub fn new(sink: Arc<dyn EventSink>, topic_prefix: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            sink,
            topic_prefix: topic_prefix.into(),
            service_name: service_name.into(),
        }
    }

    /// Publisher that drops everything.
    pub fn noop() -> Self {
        Self::new(Arc::new(NoopEventSink), "ai", "ai-ml-service")
    }

    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    /// Connect the sink. Errors propagate only when `strict`.
    pub async fn connect(&self, strict: bool) -> Result<()> {
        match self.sink.connect().await {
            Ok(()) => {
                info!(sink = self.sink.name(), "event publisher connected");
                Ok(())
            }
            Err(e) if strict => Err(e),
            Err(e) => {
                error!(sink = self.sink.name(), error = %e, "failed to connect event sink");
                warn!("continuing without event delivery");
                Ok(())
            }
        }
    }

    pub async fn close(&self) {
        if let Err(e) = self.sink.close().await {
            warn!(error = %e, "event sink close failed");
        }
    }

    /// Publish and surface the delivery error.
    pub async fn try_publish(&self, event: &LifecycleEvent) -> Result<()> {
        let envelope = CloudEvent::wrap(&self.topic_prefix, &self.service_name, event);
        self.sink.publish(&envelope).await?;
        debug!(event_type = %envelope.event_type, "published event");
        Ok(())
    }

    /// Publish, logging and swallowing any failure. Returns whether it was delivered.
    pub async fn publish(&self, event: LifecycleEvent) -> bool {
        match self.try_publish(&event).await {
            Ok(()) => true,
            Err(e) => {
                warn!(event_type = event.event_type(), error = %e, "failed to publish event");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSink;

    #[async_trait]
    impl EventSink for FailingSink {
        async fn publish(&self, _: &CloudEvent) -> Result<()> {
            Err(crate::Error::backend("broker down"))
        }
        fn name(&self) -> &'static str {
            "failing"
        }
    }

    #[tokio::test]
    async fn test_publish_records_prefixed_type() {
        let sink = Arc::new(InMemoryEventSink::default());
        let publisher = EventPublisher::new(sink.clone(), "ai", "svc");
        assert!(publisher.publish(LifecycleEvent::model_failed("m", "boom")).await);
        let events = sink.events_of_type("ai.model.failed");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, "/svc");
    }

    #[tokio::test]
    async fn test_publish_failure_is_swallowed() {
        let publisher = EventPublisher::new(Arc::new(FailingSink), "ai", "svc");
        assert!(!publisher.publish(LifecycleEvent::model_failed("m", "boom")).await);
        assert!(publisher
            .try_publish(&LifecycleEvent::model_failed("m", "boom"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_composite_delivers_to_all() {
        let a = Arc::new(InMemoryEventSink::default());
        let b = Arc::new(InMemoryEventSink::default());
        let composite = CompositeEventSink::new()
            .add_sink(a.clone())
            .add_sink(Arc::new(FailingSink))
            .add_sink(b.clone());
        let publisher = EventPublisher::new(Arc::new(composite), "ai", "svc");
        assert!(!publisher.publish(LifecycleEvent::model_loaded("m", "1", 1.0)).await);
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }

    #[tokio::test]
    async fn test_in_memory_cap() {
        let sink = InMemoryEventSink::new(2);
        for i in 0..3 {
            let event = CloudEvent::wrap("ai", "svc", &LifecycleEvent::model_loaded(format!("m{}", i), "1", 0.0));
            sink.publish(&event).await.unwrap();
        }
        let kept = sink.events();
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].data["model_name"], "m1");
    }
}
