//! Landing page surface: static files, health, public config and security headers.

use axum::{
    extract::{Request, State},
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::error;

use crate::error::AppResult;
use crate::extract::ApiQuery;
use crate::{AppState, VERSION};

pub const CONTENT_SECURITY_POLICY: &str = "default-src 'self'; \
script-src 'self' 'unsafe-inline' https://www.googletagmanager.com https://www.google-analytics.com https://cdn.jsdelivr.net; \
style-src 'self' 'unsafe-inline' https://cdn.jsdelivr.net; \
img-src 'self' data: https:; \
font-src 'self' https://cdn.jsdelivr.net data:; \
connect-src 'self' https://www.google-analytics.com https://www.googletagmanager.com; \
frame-ancestors 'none'; base-uri 'self'; form-action 'self'";

pub const PERMISSIONS_POLICY: &str = "geolocation=(), microphone=(), camera=(), payment=(), \
usb=(), magnetometer=(), gyroscope=(), accelerometer=()";

pub async fn health() -> Json<Value> {
    Json(json!({
        "success": true,
        "message": "Server is running",
        "timestamp": Utc::now().to_rfc3339(),
        "version": VERSION,
    }))
}

#[derive(Deserialize)]
pub struct ConfigQuery {
    #[serde(default)]
    key: Option<String>,
}

/// Values the landing page script may read before consent is given.
pub async fn config_lookup(
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<ConfigQuery>,
) -> AppResult<Json<Value>> {
    let body = match query.key.as_deref() {
        Some("google_analytics_id") => json!({
            "success": true,
            "value": state.config.analytics.google_analytics_id,
        }),
        _ => json!({
            "success": false,
            "value": null,
            "message": "Unknown config key",
        }),
    };
    Ok(Json(body))
}

/// JSON 404 for unmatched `/api` paths.
pub async fn api_not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "success": false, "message": "Endpoint not found" })),
    )
        .into_response()
}

/// Resolve a request path under the document root. `None` if it tries to climb out.
pub fn resolve_static_path(document_root: &Path, uri_path: &str) -> Option<PathBuf> {
    let clean_path = uri_path.trim_start_matches('/');
    if clean_path.contains("..") {
        return None;
    }
    Some(document_root.join(clean_path))
}

pub async fn static_handler(State(state): State<Arc<AppState>>, req: Request) -> Response {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed").into_response();
    }

    let decoded = match urlencoding::decode(req.uri().path()) {
        Ok(path) => path.into_owned(),
        Err(_) => return (StatusCode::BAD_REQUEST, "Bad Request").into_response(),
    };

    let Some(mut path) = resolve_static_path(&state.config.server.document_root, &decoded) else {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    };

    if fs::metadata(&path).await.is_ok_and(|m| m.is_dir()) {
        path = path.join("index.html");
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return (StatusCode::FORBIDDEN, "Directory listing denied").into_response();
        }
    }

    serve_static_file(path).await
}

async fn serve_static_file(path: PathBuf) -> Response {
    match fs::read(&path).await {
        Ok(content) => {
            let mime_type = mime_guess::from_path(&path).first_or_text_plain();
            ([(header::CONTENT_TYPE, mime_type.to_string())], content).into_response()
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            (StatusCode::NOT_FOUND, "Not Found").into_response()
        }
        Err(e) => {
            error!("Error reading {}: {e}", path.display());
            (StatusCode::INTERNAL_SERVER_ERROR, "Error reading file").into_response()
        }
    }
}

/// Fixed security headers on every response.
pub fn with_security_headers<S>(router: Router<S>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router
        .layer(SetResponseHeaderLayer::overriding(
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static(CONTENT_SECURITY_POLICY),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::REFERRER_POLICY,
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("permissions-policy"),
            HeaderValue::from_static(PERMISSIONS_POLICY),
        ))
}
