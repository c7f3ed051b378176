//! HTTP event sink against a mock endpoint.

use ai_ml_core::events::{EventPublisher, EventSink, HttpEventSink, LifecycleEvent};
use mockito::{Matcher, Server};
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn test_envelope_is_posted() {
    let mut server = Server::new_async().await;
    let hook = server
        .mock("POST", "/events")
        .match_header("content-type", "application/cloudevents+json")
        .match_body(Matcher::PartialJson(json!({
            "specversion": "1.0",
            "type": "ai.translation.completed",
            "source": "/translator",
            "data": {"source_lang": "en", "target_lang": "fr", "character_count": 5}
        })))
        .with_status(202)
        .create_async()
        .await;

    let sink = Arc::new(HttpEventSink::new(&format!("{}/events", server.url())).unwrap());
    let publisher = EventPublisher::new(sink, "ai", "translator");
    publisher.connect(true).await.unwrap();

    assert!(
        publisher
            .publish(LifecycleEvent::translation_completed("Hello", "en", "fr", None))
            .await
    );
    hook.assert_async().await;
}

#[tokio::test]
async fn test_rejected_event_is_not_fatal() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/events")
        .with_status(503)
        .create_async()
        .await;

    let sink = Arc::new(HttpEventSink::new(&format!("{}/events", server.url())).unwrap());
    let publisher = EventPublisher::new(sink.clone(), "ai", "svc");
    publisher.connect(false).await.unwrap();

    let event = LifecycleEvent::model_failed("m", "boom");
    assert!(publisher.try_publish(&event).await.is_err());
    assert!(!publisher.publish(event).await);
}

#[tokio::test]
async fn test_closed_sink_refuses_events() {
    let server = Server::new_async().await;
    let sink = HttpEventSink::new(&server.url()).unwrap();
    sink.connect().await.unwrap();
    sink.close().await.unwrap();

    let envelope = ai_ml_core::events::CloudEvent::wrap(
        "ai",
        "svc",
        &LifecycleEvent::model_loaded("m", "latest", 1.0),
    );
    assert!(sink.publish(&envelope).await.is_err());
}

#[test]
fn test_invalid_endpoint_is_configuration_error() {
    let err = HttpEventSink::new("not a url").err().unwrap();
    assert!(matches!(err, ai_ml_core::Error::Configuration { .. }));
}
