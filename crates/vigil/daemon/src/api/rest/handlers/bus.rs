//! Bus bridge: inject messages into the in-process bus over HTTP.

use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::debug;
use vigil_control::BusMessage;

use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};

/// Query options for bus injection
#[derive(Debug, Default, Deserialize)]
pub struct PublishQuery {
    /// Wait for a reply instead of publishing fire-and-forget
    #[serde(default)]
    pub request: bool,

    /// Reply timeout in milliseconds, capped by the server setting
    pub timeout_ms: Option<u64>,
}

/// Acknowledgement of a fire-and-forget publish
#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub topic: String,
    pub accepted: bool,
}

/// Publish a JSON body on `topic`, or send it as a request and return the reply.
pub async fn publish_to_bus(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    Query(query): Query<PublishQuery>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    if topic.trim().is_empty() || topic.starts_with("_INBOX.") {
        return Err(ApiError::BadRequest(format!("invalid topic: {topic:?}")));
    }

    if query.request {
        let timeout = query
            .timeout_ms
            .map(Duration::from_millis)
            .map_or(state.request_timeout, |t| t.min(state.request_timeout));
        let payload = serde_json::to_vec(&body).map_err(vigil_control::BusError::from)?;

        let reply = state.bus.request(&topic, payload, timeout).await?;
        let reply: serde_json::Value = reply.decode()?;
        return Ok((StatusCode::OK, Json(reply)));
    }

    state.bus.publish(BusMessage::json(topic.as_str(), &body)?)?;
    debug!(topic = %topic, "Injected message");

    let ack = PublishResponse {
        topic,
        accepted: true,
    };
    let ack = serde_json::to_value(ack).map_err(vigil_control::BusError::from)?;
    Ok((StatusCode::ACCEPTED, Json(ack)))
}
