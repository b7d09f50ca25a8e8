//! HTTP binding of the object bus
//!
//! Routes:
//! - `GET /objects?prefix=...` lists published objects with their properties
//! - `GET /object/{*path}` returns one object
//! - `POST /call` runs a method call through the broker dispatcher
//! - `GET /signals` streams bus signals as server-sent events
//!
//! Calls are decoded and checked against the target's method table here, so
//! malformed requests never reach the dispatcher.

use crate::bus::{BusSignal, ObjectBus, ObjectExporter, ObjectSnapshot};
use crate::error::{BrokerError, Result};
use crate::event::{BrokerEvent, EventSender};
use crate::wire::MethodCall;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::{Value, json};
use std::future::Future;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, info, warn};

/// Listing root when no prefix is given
const ROOT_PREFIX: &str = "/broker";

/// Shared handler state
#[derive(Clone, Debug)]
pub struct AppState {
    bus: ObjectBus,
    tx: EventSender,
}

impl AppState {
    /// State serving `bus` and forwarding calls to the dispatcher behind `tx`
    pub fn new(bus: ObjectBus, tx: EventSender) -> Self {
        Self { bus, tx }
    }
}

#[derive(Debug, Deserialize)]
struct ObjectsQuery {
    prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallBody {
    path: String,
    method: String,
    #[serde(default)]
    args: Value,
}

/// Error response carrying the bus error name
#[derive(Debug)]
pub struct ApiError(BrokerError);

impl From<BrokerError> for ApiError {
    fn from(e: BrokerError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            BrokerError::InvalidArgs(_) | BrokerError::UnknownMethod { .. } => {
                StatusCode::BAD_REQUEST
            }
            BrokerError::UnknownObject(_) => StatusCode::NOT_FOUND,
            BrokerError::RequestFailed(_)
            | BrokerError::ReconfigureFailed(_)
            | BrokerError::GetValuesFailed(_)
            | BrokerError::SetValuesFailed(_) => StatusCode::CONFLICT,
            BrokerError::Bus(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.0.bus_name(),
            "message": self.0.to_string(),
        });
        if let Some(adapter) = self.0.adapter_error() {
            body["code"] = json!(adapter.code());
        }
        (self.status(), Json(body)).into_response()
    }
}

/// Build the router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/objects", get(list_objects))
        .route("/object/{*path}", get(get_object))
        .route("/call", post(call_method))
        .route("/signals", get(signals))
        .with_state(state)
}

/// Serve the router on `listener` until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("object bus listening on http://{}", addr);
    }

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| BrokerError::Bus(format!("HTTP server failed: {}", e)))
}

async fn list_objects(
    State(state): State<AppState>,
    Query(query): Query<ObjectsQuery>,
) -> Json<Vec<ObjectSnapshot>> {
    let prefix = query.prefix.as_deref().unwrap_or(ROOT_PREFIX);
    Json(state.bus.children(prefix))
}

async fn get_object(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> std::result::Result<Json<ObjectSnapshot>, ApiError> {
    let path = format!("/{}", path.trim_start_matches('/'));
    state
        .bus
        .object(&path)
        .map(Json)
        .ok_or_else(|| BrokerError::UnknownObject(path).into())
}

async fn call_method(
    State(state): State<AppState>,
    Json(body): Json<CallBody>,
) -> std::result::Result<Json<Value>, ApiError> {
    state.bus.resolve_method(&body.path, &body.method)?;
    let call = MethodCall::from_wire(&body.path, &body.method, &body.args)?;
    debug!(path = %body.path, method = %body.method, "queueing method call");

    let (reply_tx, reply_rx) = oneshot::channel();
    state
        .tx
        .send(BrokerEvent::MethodCall {
            path: body.path,
            call,
            reply: Some(reply_tx),
        })
        .map_err(|_| BrokerError::Bus("broker is not running".to_string()))?;

    let reply = reply_rx
        .await
        .map_err(|_| BrokerError::Bus("broker dropped the call".to_string()))??;

    Ok(Json(json!({ "result": reply.to_wire() })))
}

async fn signals(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, axum::Error>>> {
    let stream = BroadcastStream::new(state.bus.subscribe()).map(signal_event);
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// A subscriber that falls behind gets a `lagged` event carrying the number
/// of signals it missed, in place of those signals.
fn signal_event(
    item: std::result::Result<BusSignal, BroadcastStreamRecvError>,
) -> std::result::Result<Event, axum::Error> {
    match item {
        Ok(signal) => Event::default().json_data(signal),
        Err(BroadcastStreamRecvError::Lagged(missed)) => {
            warn!(missed, "signal subscriber lagged, signals dropped");
            Ok(Event::default().event("lagged").data(missed.to_string()))
        }
    }
}
