//! Internal HTTP API.
//!
//! Serves `GET /authorized_keys/`, the merged key list of the instance named
//! by the `Host` header, for other infrastructure such as the reverse proxy.
//! Must only be bound to an internal address.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use log::{debug, error, info};

use crate::config::{is_valid_slug, Config};
use crate::error::KeySourceError;
use crate::keysource::{authorized_key_line, KeySource};
use crate::state::GatewayState;

/// Failure of an internal API request.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,

    #[error(transparent)]
    KeySource(#[from] KeySourceError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::KeySource(e) => {
                error!("Internal API: failed to fetch keys: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = status.canonical_reason().unwrap_or("error").to_string();
        (status, [(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
    }
}

/// The `authorized_keys` file for the instance at `host`: global keys first,
/// then the instance's own keys.
pub async fn render_authorized_keys(
    config: &Config,
    keys: &KeySource,
    host: &str,
) -> Result<String, ApiError> {
    let admin_keys = keys.admin_keys().await?;

    let slug = config
        .slug_from_host(host)
        .filter(|slug| is_valid_slug(slug))
        .ok_or(ApiError::NotFound)?;
    let tenant = keys.tenant(&slug).await?.ok_or(ApiError::NotFound)?;
    let tenant_keys = tenant.keys().await?;

    let mut body = String::new();
    for key in admin_keys.iter().chain(&tenant_keys) {
        body.push_str(&authorized_key_line(key)?);
    }
    debug!(
        "Internal API: {} keys for '{}'",
        admin_keys.len() + tenant_keys.len(),
        slug
    );
    Ok(body)
}

/// GET /authorized_keys/
async fn authorized_keys(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .ok_or(ApiError::NotFound)?;

    let body = render_authorized_keys(&state.config, &state.keys, host).await?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response())
}

/// Create the internal API router
pub fn create_internal_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/authorized_keys/", get(authorized_keys))
        .with_state(state)
}

/// Run the internal API server
pub async fn run_internal_api(state: Arc<GatewayState>, addr: &str) -> anyhow::Result<()> {
    let router = create_internal_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Internal API listening on {}", addr);

    axum::serve(listener, router).await?;

    Ok(())
}
