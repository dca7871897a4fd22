//! HTTP surface: `PUT /{class}/{id}/{action}` and `GET /{class}/{id}`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::devices::{DeviceClass, DeviceRecord};
use crate::error::GatewayError;
use crate::gateway::Gateway;

/// `{"data": ..., "error": ...}` body used by every JSON response.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            data: Some(data),
            error: None,
        })
    }
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    let body = Envelope::<()> {
        data: None,
        error: Some(message.into()),
    };
    (status, Json(body)).into_response()
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("{}", self);
        }
        failure(status, self.to_string())
    }
}

#[derive(Clone)]
pub struct AppState {
    gateway: Arc<Gateway>,
    api_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>, api_token: Option<String>) -> Self {
        Self {
            gateway,
            api_token: api_token.map(Arc::from),
        }
    }
}

pub fn router(state: AppState, request_timeout: Duration) -> Router {
    let devices = Router::new()
        .route("/devices", get(list_devices))
        .route("/:class/:device_id", get(device_status))
        .route("/:class/:device_id/:action", put(update_device))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/ping", get(ping))
        .merge(devices)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(expected) = &state.api_token {
        let presented = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(expected.as_ref()) {
            return failure(StatusCode::UNAUTHORIZED, "missing or invalid API token");
        }
    }
    next.run(request).await
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    connected: bool,
}

async fn ping(State(state): State<AppState>) -> Json<Envelope<Health>> {
    Envelope::ok(Health {
        status: "ok",
        connected: state.gateway.is_connected(),
    })
}

async fn list_devices(State(state): State<AppState>) -> Json<Envelope<Vec<DeviceRecord>>> {
    Envelope::ok(state.gateway.registry().devices().to_vec())
}

/// Resolve the class path segment and check the device belongs to it.
fn check_class(state: &AppState, class: &str, device_id: &str) -> Result<DeviceClass, Response> {
    let class = DeviceClass::from_path_segment(class)
        .ok_or_else(|| failure(StatusCode::NOT_FOUND, format!("unknown device class {class}")))?;
    let device = state
        .gateway
        .registry()
        .resolve(device_id)
        .map_err(IntoResponse::into_response)?;
    if device.class != class {
        return Err(GatewayError::UnknownDevice(device_id.to_string()).into_response());
    }
    Ok(class)
}

async fn update_device(
    State(state): State<AppState>,
    Path((class, device_id, action)): Path<(String, String, String)>,
) -> Response {
    let class = match check_class(&state, &class, &device_id) {
        Ok(class) => class,
        Err(response) => return response,
    };
    match state.gateway.issue_command(&device_id, &action).await {
        Ok(()) => Envelope::ok(format!("{class} updated successfully")).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn device_status(
    State(state): State<AppState>,
    Path((class, device_id)): Path<(String, String)>,
) -> Response {
    if let Err(response) = check_class(&state, &class, &device_id) {
        return response;
    }
    match state.gateway.query_status(&device_id).await {
        Ok(payload) => ([(header::CONTENT_TYPE, "application/json")], payload).into_response(),
        Err(e) => e.into_response(),
    }
}
