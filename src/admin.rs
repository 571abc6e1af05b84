//! Admin API for launchsite
//! Password verification, caller status and the admin IP allowlist.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::extract::{admin_password_header, admin_secret, ApiJson, ClientIp};
use crate::store::{Document, JsonStore};
use crate::AppState;

pub const DEFAULT_ADMIN_IPS: [&str; 3] = ["127.0.0.1", "::1", "localhost"];

/// Load the allowlist, seeding it with the loopback defaults on first access.
pub async fn load_admin_ips(store: &JsonStore) -> AppResult<Vec<String>> {
    match store.load::<Vec<String>>(Document::AdminIps).await? {
        Some(ips) => Ok(ips),
        None => {
            let ips: Vec<String> = DEFAULT_ADMIN_IPS.iter().map(|s| s.to_string()).collect();
            store.save(Document::AdminIps, &ips).await?;
            Ok(ips)
        }
    }
}

/// IPv4 literal, `localhost` or the IPv6 loopback.
pub fn is_valid_admin_ip(ip: &str) -> bool {
    ip == "localhost" || ip == "::1" || ip.parse::<Ipv4Addr>().is_ok()
}

pub async fn add_admin_ip(store: &JsonStore, ip: &str) -> AppResult<Vec<String>> {
    if !is_valid_admin_ip(ip) {
        return Err(AppError::Validation("Invalid IP address format".to_string()));
    }

    let mut ips = load_admin_ips(store).await?;
    if ips.iter().any(|existing| existing == ip) {
        return Err(AppError::Validation("IP is already in the list".to_string()));
    }

    ips.push(ip.to_string());
    store.save(Document::AdminIps, &ips).await?;
    Ok(ips)
}

pub async fn remove_admin_ip(store: &JsonStore, ip: &str) -> AppResult<Vec<String>> {
    let mut ips = load_admin_ips(store).await?;
    let before = ips.len();
    ips.retain(|existing| existing != ip);
    if ips.len() == before {
        return Err(AppError::NotFound("IP not found in the list".to_string()));
    }

    store.save(Document::AdminIps, &ips).await?;
    Ok(ips)
}

#[derive(Deserialize)]
struct VerifyRequest {
    #[serde(default)]
    password: Option<String>,
}

#[derive(Deserialize)]
struct AddIpRequest {
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// Create the admin router
pub fn admin_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/user/status", get(user_status))
        .route("/admin/verify", post(verify_handler))
        .route("/admin/ips", get(list_ips).post(add_ip))
        .route("/admin/ips/:ip", delete(remove_ip))
}

async fn user_status(State(state): State<Arc<AppState>>, ip: ClientIp) -> Json<Value> {
    let is_admin = state.gate.is_admin_ip(ip.as_str()).await;
    Json(json!({
        "success": true,
        "ip": ip.as_str(),
        "isAdmin": is_admin,
    }))
}

async fn verify_handler(
    State(state): State<Arc<AppState>>,
    ip: ClientIp,
    headers: HeaderMap,
    ApiJson(body): ApiJson<VerifyRequest>,
) -> AppResult<Json<Value>> {
    let header = admin_password_header(&headers);
    let supplied = admin_secret(header.as_deref(), body.password.as_deref());
    if supplied.is_none() {
        warn!(ip = %ip, "Admin verification without password");
        return Err(AppError::Validation("Password is required".to_string()));
    }

    state.gate.authorize(supplied, &ip).await?;
    info!(target: "audit", actor = %ip, "admin verification succeeded");

    Ok(Json(json!({
        "success": true,
        "message": "Admin verification successful",
        "ip": ip.as_str(),
    })))
}

async fn list_ips(
    State(state): State<Arc<AppState>>,
    ip: ClientIp,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    state
        .gate
        .authorize(admin_password_header(&headers).as_deref(), &ip)
        .await?;

    let ips = load_admin_ips(&state.store).await?;
    Ok(Json(json!({ "success": true, "ips": ips })))
}

async fn add_ip(
    State(state): State<Arc<AppState>>,
    ip: ClientIp,
    headers: HeaderMap,
    ApiJson(body): ApiJson<AddIpRequest>,
) -> AppResult<Json<Value>> {
    let header = admin_password_header(&headers);
    state
        .gate
        .authorize(admin_secret(header.as_deref(), body.password.as_deref()), &ip)
        .await?;

    let new_ip = body
        .ip
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::Validation("IP address is required".to_string()))?;

    let ips = add_admin_ip(&state.store, &new_ip).await?;
    info!(target: "audit", actor = %ip, added = %new_ip, "admin IP added");

    Ok(Json(json!({
        "success": true,
        "message": "IP added",
        "ips": ips,
    })))
}

async fn remove_ip(
    State(state): State<Arc<AppState>>,
    ip: ClientIp,
    headers: HeaderMap,
    Path(target): Path<String>,
) -> AppResult<Json<Value>> {
    state
        .gate
        .authorize(admin_password_header(&headers).as_deref(), &ip)
        .await?;

    let ips = remove_admin_ip(&state.store, &target).await?;
    info!(target: "audit", actor = %ip, removed = %target, "admin IP removed");

    Ok(Json(json!({
        "success": true,
        "message": "IP removed",
        "ips": ips,
    })))
}
