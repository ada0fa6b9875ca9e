// vpnctl - REST API Module
// HTTP control surface for the connection supervisor

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{stream, StreamExt};
use tokio_stream::wrappers::BroadcastStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use vpnctl_common::{
    ConnectionEvent, Error, ErrorResponse, LocationsResponse, MessageResponse, Utc,
};

use crate::geo::GeoClient;
use crate::sudoers;
use crate::supervisor::ConnectionSupervisor;

/// What add-sudoers needs to know
#[derive(Debug, Clone)]
pub struct BootstrapSettings {
    pub sudoers_path: PathBuf,
    pub binary: Option<PathBuf>,
    pub binary_name: String,
}

/// Shared application state
pub struct AppState {
    pub supervisor: ConnectionSupervisor,
    pub bootstrap: BootstrapSettings,
    pub geo: GeoClient,
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/start/:location", post(start_vpn))
        .route("/stop", post(stop_vpn))
        .route("/vpn-status", get(vpn_status))
        .route("/status", get(vpn_status))
        .route("/status/detail", get(status_detail))
        .route("/locations", get(list_locations))
        .route("/add-sudoers", get(add_sudoers))
        .route("/ip-info", get(ip_info))
        .route("/events", get(event_stream))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Map a domain error to `{error, kind}`; bad locations are the client's fault
fn error_response(e: &Error) -> Response {
    match e {
        Error::UnknownLocation(_) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: e.to_string(),
                kind: None,
            }),
        )
            .into_response(),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
                kind: Some(e.kind()),
            }),
        )
            .into_response(),
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn start_vpn(
    State(state): State<Arc<AppState>>,
    Path(location): Path<String>,
) -> Response {
    info!("API: Start request for {:?}", location);

    match state.supervisor.start(&location).await {
        Ok(message) => (StatusCode::OK, Json(MessageResponse { message })).into_response(),
        Err(e) => {
            error!("Failed to start VPN for {:?}: {}", location, e);
            error_response(&e)
        }
    }
}

async fn stop_vpn(State(state): State<Arc<AppState>>) -> Response {
    info!("API: Stop request");

    match state.supervisor.stop().await {
        Ok(message) => (StatusCode::OK, Json(MessageResponse { message })).into_response(),
        Err(e) => {
            error!("Failed to stop VPN: {}", e);
            error_response(&e)
        }
    }
}

/// Plain-text answer backed by the probe, not the believed state
async fn vpn_status(State(state): State<Arc<AppState>>) -> Response {
    match state.supervisor.status().await {
        Ok(report) => (StatusCode::OK, report.message()).into_response(),
        Err(e) => {
            error!("Status check failed: {}", e);
            error_response(&e)
        }
    }
}

async fn status_detail(State(state): State<Arc<AppState>>) -> Response {
    match state.supervisor.status().await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => {
            error!("Status check failed: {}", e);
            error_response(&e)
        }
    }
}

async fn list_locations(State(state): State<Arc<AppState>>) -> Json<LocationsResponse> {
    Json(LocationsResponse {
        locations: state.supervisor.locations(),
    })
}

async fn add_sudoers(State(state): State<Arc<AppState>>) -> Response {
    info!("API: add-sudoers request");
    let settings = &state.bootstrap;

    let Some(binary) = settings.binary.clone() else {
        let e = Error::BinaryNotFound(settings.binary_name.clone());
        error!("{}", e);
        return error_response(&e);
    };

    let result = match sudoers::current_user() {
        Ok(user) => {
            sudoers::ensure_elevated_invocation(settings.sudoers_path.clone(), user, binary).await
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(outcome) => (StatusCode::OK, outcome.message()).into_response(),
        Err(e) => {
            error!("Failed to add sudoers entry: {}", e);
            error_response(&e)
        }
    }
}

async fn ip_info(State(state): State<Arc<AppState>>) -> Response {
    match state.geo.lookup().await {
        Ok(value) => Json(value).into_response(),
        Err(e) => {
            error!("IP info lookup failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// GET /events → SSE stream of connection events
pub async fn event_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.supervisor.subscribe();
    let mut shutdown_rx = state.shutdown_tx.subscribe();

    let connection_events = BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(event) => event_frame(&event).map(Ok),
            Err(lagged) => {
                // Slow client; later events still arrive
                tracing::debug!("Event stream lagged: {:?}, continuing", lagged);
                None
            }
        }
    });

    let merged = stream::select(connection_events, heartbeat_stream());

    let shutdown_aware = merged.take_until(async move {
        let _ = shutdown_rx.recv().await;
    });

    Sse::new(shutdown_aware)
}

fn event_frame(event: &ConnectionEvent) -> Option<Event> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Event::default().data(json)),
        Err(e) => {
            tracing::error!("Failed to serialize ConnectionEvent: {e}");
            None
        }
    }
}

fn heartbeat_stream(
) -> impl futures::Stream<Item = Result<Event, Infallible>> + Send + Sync + 'static {
    tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(heartbeat_interval()))
        .map(|_| Ok(Event::default().data(heartbeat_payload())))
}

fn heartbeat_payload() -> String {
    let heartbeat = ConnectionEvent::Heartbeat {
        timestamp: Utc::now(),
    };
    match serde_json::to_string(&heartbeat) {
        Ok(j) => j,
        Err(e) => {
            tracing::error!("Failed to serialize heartbeat: {e}");
            "{}".to_string()
        }
    }
}

#[cfg(not(test))]
fn heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}

#[cfg(test)]
fn heartbeat_interval() -> Duration {
    Duration::from_millis(100)
}
