//! Bus transport routes
//!
//! `POST /{service}/{command}` carries one command call whose body is the
//! JSON object of named arguments. Calls that register an eviction
//! subscription answer with a Server-Sent Events stream: a `reply` event
//! first, then at most one `evicted` event. Dropping the stream cancels
//! the subscription.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::post,
};
use filecache_core::{CacheEvent, Subscription};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::convert::Infallible;
use tracing::{debug, warn};

use crate::error::BusError;
use crate::state::AppState;

/// Liveness check answered without touching the cache
pub const SERVER_STATUS_PATH: &str = "/com.palm.lunabus/signal/registerServerStatus";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerStatusArgs {
    service_name: String,
}

/// POST /com.palm.lunabus/signal/registerServerStatus
async fn register_server_status(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, BusError> {
    let args: ServerStatusArgs = serde_json::from_value(parse_body(&body)?)
        .map_err(|e| BusError::InvalidArgs(e.to_string()))?;
    let connected = args.service_name == *state.service_name;

    Ok(Json(json!({
        "returnValue": true,
        "serviceName": args.service_name,
        "connected": connected,
    })))
}

/// POST /{service}/{command}
async fn call(
    State(state): State<AppState>,
    Path((service, command)): Path<(String, String)>,
    body: Bytes,
) -> Result<Response, BusError> {
    if service != *state.service_name {
        warn!("Call for unknown service '{}'", service);
        return Err(BusError::UnknownService(service));
    }

    let args = parse_body(&body)?;
    let reply = state
        .dispatcher
        .call(&command, args)
        .await
        .inspect_err(|e| debug!("{} failed: {}", command, e))?;

    Ok(match reply.subscription {
        Some(subscription) => subscription_stream(reply.payload, subscription).into_response(),
        None => Json(reply.payload).into_response(),
    })
}

/// Parse a call body, an empty body meaning no arguments
fn parse_body(body: &[u8]) -> Result<Value, BusError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }

    let value: Value =
        serde_json::from_slice(body).map_err(|e| BusError::InvalidArgs(e.to_string()))?;
    if !value.is_object() {
        return Err(BusError::InvalidArgs(
            "arguments must be a JSON object".to_string(),
        ));
    }
    Ok(value)
}

fn subscription_stream(
    payload: Value,
    subscription: Subscription,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let reply = Event::default().event("reply").data(payload.to_string());

    // The stream owns the subscription so the object stays pinned until
    // the client goes away or the event has been sent
    let evicted = stream::once(async move {
        let mut subscription = subscription;
        subscription.recv().await
    })
    .filter_map(|event| async move { event.map(|e| Ok(evicted_event(&e))) });

    Sse::new(stream::once(async move { Ok::<_, Infallible>(reply) }).chain(evicted))
        .keep_alive(KeepAlive::default())
}

fn evicted_event(event: &CacheEvent) -> Event {
    let data = match event {
        CacheEvent::Evicted {
            path_name,
            type_name,
        } => json!({
            "returnValue": true,
            "event": "evicted",
            "pathName": path_name,
            "typeName": type_name,
        }),
    };
    Event::default().event("evicted").data(data.to_string())
}

/// Create bus routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route(SERVER_STATUS_PATH, post(register_server_status))
        .route("/{service}/{command}", post(call))
}
