// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # HTTP Producer
//!
//! `POST /message/{kind}` publishes a JSON `Message` with the routing key
//! configured for `kind`; `GET /message` lists what this process has
//! published so far.

use crate::{
    errors::{AmqpError, PublishError, TopologyError},
    history::MessageStore,
    message::Message,
    publisher::{PublishOptions, Publisher},
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use opentelemetry::Context;
use serde_json::json;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub publisher: Arc<Publisher>,
    pub history: Arc<dyn MessageStore>,
    pub exchange: String,
    /// Message kind → routing key
    pub routes: Arc<BTreeMap<String, String>>,
    pub mandatory: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/message", get(list_messages))
        .route("/message/:kind", post(publish_message))
        .with_state(state)
}

/// Error body returned by the producer endpoints.
#[derive(Debug)]
pub enum ApiError {
    UnknownKind(String),
    Relay(AmqpError),
}

impl From<AmqpError> for ApiError {
    fn from(err: AmqpError) -> Self {
        ApiError::Relay(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::UnknownKind(kind) => (
                StatusCode::NOT_FOUND,
                format!("unknown message kind `{}`", kind),
            ),
            ApiError::Relay(err) => {
                let status = match &err {
                    AmqpError::Publish(PublishError::NotConnected)
                    | AmqpError::ConnectionError(_) => StatusCode::SERVICE_UNAVAILABLE,
                    AmqpError::Publish(PublishError::Unroutable { .. }) => {
                        StatusCode::UNPROCESSABLE_ENTITY
                    }
                    AmqpError::Topology(TopologyError::MissingResource(_)) => {
                        StatusCode::NOT_FOUND
                    }
                    AmqpError::SerializationError(_) => StatusCode::BAD_REQUEST,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.to_string())
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn list_messages(State(state): State<AppState>) -> Json<Vec<Message>> {
    Json(state.history.list())
}

async fn publish_message(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Json(message): Json<Message>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(routing_key) = state.routes.get(&kind) else {
        warn!(kind = %kind, "unknown message kind");
        return Err(ApiError::UnknownKind(kind));
    };

    let mut options = PublishOptions::default().kind(&kind);
    options.mandatory = state.mandatory;

    state
        .publisher
        .publish_message(
            &Context::current(),
            &state.exchange,
            routing_key,
            &message,
            &options,
        )
        .await?;

    info!(kind = %kind, routing_key = %routing_key, "message accepted");
    state.history.record(message.clone());

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": format!("{} message sent", kind),
            "message": message,
        })),
    ))
}
