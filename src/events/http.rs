//! HTTP webhook sink.

use super::{CloudEvent, EventSink};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// POSTs each envelope as JSON to an event bridge endpoint.
pub struct HttpEventSink {
    client: reqwest::Client,
    endpoint: Url,
    connected: AtomicBool,
}

impl HttpEventSink {
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint = Url::parse(endpoint).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid events endpoint {:?}: {}", endpoint, e),
                ErrorContext::new().with_field_path("events.endpoint"),
            )
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            endpoint,
            connected: AtomicBool::new(false),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl EventSink for HttpEventSink {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, event: &CloudEvent) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::backend_with_context(
                "event sink not connected",
                ErrorContext::new().with_source("http_event_sink"),
            ));
        }
        let resp = self
            .client
            .post(self.endpoint.clone())
            .header("content-type", "application/cloudevents+json")
            .body(serde_json::to_vec(event)?)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::backend_with_context(
                format!("event endpoint returned {}", resp.status()),
                ErrorContext::new()
                    .with_details(event.event_type.clone())
                    .with_source("http_event_sink"),
            ));
        }
        debug!(event_type = %event.event_type, "event delivered");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
