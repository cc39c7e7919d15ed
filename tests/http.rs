// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use amqp_relay::{
    codec,
    history::SentHistory,
    http::{router, AppState},
    memory::InMemoryBroker,
    message::Message,
    publisher::Publisher,
    settings::{tutorial_topology, PublisherSettings},
    topology::ensure_topology,
};
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

async fn producer(mandatory: bool) -> (Arc<InMemoryBroker>, Router) {
    let broker = InMemoryBroker::new();
    ensure_topology(broker.clone(), &tutorial_topology())
        .await
        .unwrap();

    let publisher = PublisherSettings::default();
    let app = router(AppState {
        publisher: Publisher::new(broker.clone()),
        history: SentHistory::new(publisher.history_capacity),
        exchange: publisher.exchange,
        routes: Arc::new(publisher.routes),
        mandatory,
    });
    (broker, app)
}

fn post(kind: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/message/{kind}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_owned()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn greeting_is_published_and_recorded() {
    let (broker, app) = producer(false).await;

    let response = app
        .clone()
        .oneshot(post("greeting", r#"{"title":"hi","content":"there"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(
        json_body(response).await,
        json!({
            "status": "greeting message sent",
            "message": { "title": "hi", "content": "there" }
        })
    );

    let sent = Message::new("hi", "there");
    for queue in ["queue0", "queue2"] {
        let data = broker.pop(queue).unwrap();
        assert_eq!(codec::decode::<Message>(&data).unwrap(), sent);
    }
    assert_eq!(broker.ready_count("queue1"), 0);

    let response = app.oneshot(get("/message")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json_body(response).await,
        json!([{ "title": "hi", "content": "there" }])
    );
}

#[tokio::test]
async fn bye_goes_to_queue1_and_queue2() {
    let (broker, app) = producer(false).await;

    let response = app
        .oneshot(post("bye", r#"{"title":"bye","content":"see you"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    assert_eq!(broker.ready_count("queue0"), 0);
    assert_eq!(broker.ready_count("queue1"), 1);
    assert_eq!(broker.ready_count("queue2"), 1);
}

#[tokio::test]
async fn malformed_body_is_rejected_without_publishing() {
    let (broker, app) = producer(false).await;

    let response = app
        .clone()
        .oneshot(post("greeting", "not json"))
        .await
        .unwrap();
    assert!(response.status().is_client_error());
    assert_eq!(broker.ready_count("queue0"), 0);

    let response = app.oneshot(get("/message")).await.unwrap();
    assert_eq!(json_body(response).await, json!([]));
}

#[tokio::test]
async fn unroutable_mandatory_publish_is_unprocessable() {
    let broker = InMemoryBroker::new();
    ensure_topology(broker.clone(), &tutorial_topology())
        .await
        .unwrap();
    let mut routes = PublisherSettings::default().routes;
    routes.insert("shout".to_owned(), "shout.loud.message".to_owned());

    let app = router(AppState {
        publisher: Publisher::new(broker.clone()),
        history: SentHistory::new(10),
        exchange: "topic_exchange".to_owned(),
        routes: Arc::new(routes),
        mandatory: true,
    });

    let response = app
        .clone()
        .oneshot(post("shout", r#"{"title":"a","content":"b"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert!(json_body(response).await["error"].is_string());

    let response = app
        .clone()
        .oneshot(post("greeting", r#"{"title":"a","content":"b"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = app.oneshot(get("/message")).await.unwrap();
    assert_eq!(
        json_body(response).await,
        json!([{ "title": "a", "content": "b" }])
    );
}

#[tokio::test]
async fn health_reports_ok() {
    let (_broker, app) = producer(false).await;
    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({ "status": "ok" }));
}
