use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequest, FromRequestParts},
    http::{request::Parts, HeaderMap},
};
use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::auth::ADMIN_PASSWORD_HEADER;
use crate::error::AppError;
use crate::AppState;

/// JSON body extractor whose failures use the `{success:false}` envelope.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct ApiJson<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(AppError))]
pub struct ApiQuery<T>(pub T);

/// Marker inserted on connections accepted over TLS.
#[derive(Clone, Copy, Debug)]
pub struct TlsConnection;

/// The caller's IP as used for audit lines, allowlist checks and `createdBy`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientIp(String);

impl ClientIp {
    pub fn new(ip: impl Into<String>) -> Self {
        Self(ip.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn resolve(parts: &Parts, trust_proxy_headers: bool) -> Self {
        if trust_proxy_headers {
            if let Some(ip) = forwarded_ip(&parts.headers) {
                return Self(ip);
            }
        }

        parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| Self(addr.ip().to_canonical().to_string()))
            .unwrap_or_else(|| Self("unknown".to_string()))
    }
}

impl fmt::Display for ClientIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    let from_xff = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| v.parse::<std::net::IpAddr>().is_ok());

    let from_real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| v.parse::<std::net::IpAddr>().is_ok())
    };

    from_xff.or_else(from_real_ip).map(str::to_string)
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        Ok(Self::resolve(parts, state.config.server.trust_proxy_headers))
    }
}

/// Whether the request reached us over HTTPS, directly or through a trusted proxy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SecureTransport(pub bool);

impl SecureTransport {
    pub fn resolve(parts: &Parts, trust_proxy_headers: bool) -> Self {
        if parts.extensions.get::<TlsConnection>().is_some() {
            return Self(true);
        }
        let proxied_https = trust_proxy_headers
            && parts
                .headers
                .get("x-forwarded-proto")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.eq_ignore_ascii_case("https"));
        Self(proxied_https)
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for SecureTransport {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        Ok(Self::resolve(parts, state.config.server.trust_proxy_headers))
    }
}

/// The `X-Admin-Password` header, if present and non-empty.
pub fn admin_password_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ADMIN_PASSWORD_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Header first, then the body field.
pub fn admin_secret<'a>(header: Option<&'a str>, body: Option<&'a str>) -> Option<&'a str> {
    header.or(body).filter(|s| !s.trim().is_empty())
}
