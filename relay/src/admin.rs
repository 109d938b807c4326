//! Read-only admin API: `GET /version` and `GET /snapshot`.

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use lighttunnel_shared::protocol::PROTOCOL_VERSION;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::server::{Registries, Snapshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Clone)]
struct AdminState {
    registries: Registries,
    credentials: Option<AdminCredentials>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VersionInfo {
    name: &'static str,
    version: &'static str,
    protocol_version: u8,
}

pub fn router(registries: Registries, credentials: Option<AdminCredentials>) -> Router {
    Router::new()
        .route("/version", get(version))
        .route("/snapshot", get(snapshot))
        .with_state(AdminState {
            registries,
            credentials,
        })
}

pub async fn serve(listener: TcpListener, app: Router, shutdown: CancellationToken) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "Admin API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn version(State(state): State<AdminState>, headers: HeaderMap) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    Json(VersionInfo {
        name: "lighttunnel-relay",
        version: lighttunnel_shared::VERSION,
        protocol_version: PROTOCOL_VERSION,
    })
    .into_response()
}

async fn snapshot(State(state): State<AdminState>, headers: HeaderMap) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    let snapshot: Snapshot = state.registries.snapshot();
    Json(snapshot).into_response()
}

fn authorize(state: &AdminState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = &state.credentials else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|v| STANDARD.decode(v.trim()).ok());
    let wanted = format!("{}:{}", expected.username, expected.password);
    if presented.as_deref() == Some(wanted.as_bytes()) {
        return Ok(());
    }

    let mut response = (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"lighttunnel\""),
    );
    Err(response)
}
