//! Mod catalog: listing, admin add/delete, file upload and download.

use axum::{
    body::Body,
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, Path, State},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::extract::{admin_password_header, admin_secret, ApiJson, ApiQuery, ClientIp};
use crate::store::{Document, JsonStore};
use crate::AppState;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModEntry {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub file: Option<ModFile>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

/// Attached file. Either stored in the uploads directory (`path`) or carried inline.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ModFile {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type", default)]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

// Older catalogs stored numeric millisecond ids.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("invalid mod id {other}"))),
    }
}

/// Millisecond timestamp plus four random digits.
pub fn new_mod_id() -> String {
    let suffix: u16 = rand::thread_rng().gen_range(0..10_000);
    format!("{}{:04}", Utc::now().timestamp_millis(), suffix)
}

fn unsafe_filename_chars() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9._-]").ok()).as_ref()
}

/// Last path component with anything outside `[A-Za-z0-9._-]` replaced.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned = match unsafe_filename_chars() {
        Some(re) => re.replace_all(base, "_").into_owned(),
        None => base
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || "._-".contains(c) { c } else { '_' })
            .collect(),
    };
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}

pub fn file_extension(name: &str) -> Option<String> {
    std::path::Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Stored name: `{unix seconds}_{uuid}_{sanitised original}`.
pub fn stored_file_name(original: &str) -> String {
    format!(
        "{}_{}_{}",
        Utc::now().timestamp(),
        Uuid::new_v4().simple(),
        sanitize_filename(original)
    )
}

fn check_extension(config: &Config, name: &str) -> AppResult<()> {
    match file_extension(name) {
        Some(ext) if config.is_allowed_extension(&ext) => Ok(()),
        _ => Err(AppError::Validation("File type not allowed".to_string())),
    }
}

fn check_size(config: &Config, size: u64) -> AppResult<()> {
    if size > config.uploads.max_file_size as u64 {
        return Err(AppError::PayloadTooLarge(
            "File size exceeds maximum allowed size".to_string(),
        ));
    }
    Ok(())
}

/// Uploaded paths are bare file names inside the uploads directory.
fn upload_path(config: &Config, stored: &str) -> AppResult<PathBuf> {
    if stored.is_empty() || stored.contains(['/', '\\']) || stored.contains("..") {
        return Err(AppError::Validation("Invalid file path".to_string()));
    }
    Ok(config.storage.uploads_dir.join(stored))
}

fn validate_file(config: &Config, file: &ModFile) -> AppResult<()> {
    check_extension(config, &file.name)?;
    check_size(config, file.size)?;

    match (&file.base64, &file.path) {
        (Some(encoded), _) => {
            let decoded = BASE64
                .decode(encoded.as_bytes())
                .map_err(|_| AppError::Validation("File content is not valid base64".to_string()))?;
            check_size(config, decoded.len() as u64)
        }
        (None, Some(stored)) => {
            if !upload_path(config, stored)?.is_file() {
                return Err(AppError::Validation("Uploaded file not found".to_string()));
            }
            Ok(())
        }
        (None, None) => Err(AppError::Validation("File content is missing".to_string())),
    }
}

pub async fn list_mods(store: &JsonStore) -> Vec<ModEntry> {
    store.read_or_default(Document::Mods).await
}

pub async fn add_mod(store: &JsonStore, entry: ModEntry) -> AppResult<Vec<ModEntry>> {
    let mut mods: Vec<ModEntry> = store.load_or_default(Document::Mods).await?;
    mods.push(entry);
    store.save(Document::Mods, &mods).await?;
    Ok(mods)
}

/// Returns the removed entry and the remaining catalog.
pub async fn remove_mod(store: &JsonStore, id: &str) -> AppResult<(ModEntry, Vec<ModEntry>)> {
    let mut mods: Vec<ModEntry> = store.load_or_default(Document::Mods).await?;
    let index = mods
        .iter()
        .position(|m| m.id == id)
        .ok_or_else(|| AppError::NotFound("Mod not found".to_string()))?;
    let removed = mods.remove(index);
    store.save(Document::Mods, &mods).await?;
    Ok((removed, mods))
}

#[derive(Deserialize)]
struct AddModRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    file: Option<ModFile>,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Deserialize)]
struct UploadOptions {
    #[serde(default)]
    inline: bool,
}

pub fn mods_router(config: &Config) -> Router<Arc<AppState>> {
    // Multipart framing on top of the file itself.
    let upload_limit = config.uploads.max_file_size.saturating_add(1024 * 1024);

    Router::new()
        .route("/mods", get(list_handler).post(add_handler))
        .route("/mods/:id", delete(delete_handler))
        .route("/mods/:id/download", get(download_handler))
        .route(
            "/mods/upload",
            post(upload_handler).layer(DefaultBodyLimit::max(upload_limit)),
        )
}

async fn list_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let mods = list_mods(&state.store).await;
    Json(json!({ "success": true, "mods": mods }))
}

async fn add_handler(
    State(state): State<Arc<AppState>>,
    ip: ClientIp,
    headers: HeaderMap,
    ApiJson(body): ApiJson<AddModRequest>,
) -> AppResult<Json<Value>> {
    let header = admin_password_header(&headers);
    state
        .gate
        .authorize(admin_secret(header.as_deref(), body.password.as_deref()), &ip)
        .await?;

    let name = body.name.as_deref().map(str::trim).unwrap_or_default();
    let description = body.description.as_deref().map(str::trim).unwrap_or_default();
    if name.is_empty() || description.is_empty() {
        return Err(AppError::Validation(
            "Mod name and description are required".to_string(),
        ));
    }

    if let Some(file) = &body.file {
        validate_file(&state.config, file)?;
    }

    let entry = ModEntry {
        id: new_mod_id(),
        name: name.to_string(),
        description: description.to_string(),
        file: body.file,
        created_at: Utc::now(),
        created_by: ip.to_string(),
    };

    let mods = add_mod(&state.store, entry.clone()).await?;
    info!(target: "audit", actor = %ip, id = %entry.id, name = %entry.name, "mod added");

    Ok(Json(json!({
        "success": true,
        "message": "Mod added",
        "mod": entry,
        "mods": mods,
    })))
}

async fn delete_handler(
    State(state): State<Arc<AppState>>,
    ip: ClientIp,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    state
        .gate
        .authorize(admin_password_header(&headers).as_deref(), &ip)
        .await?;

    let (removed, mods) = remove_mod(&state.store, &id).await?;
    info!(target: "audit", actor = %ip, id = %id, "mod deleted");

    if let Some(stored) = removed.file.as_ref().and_then(|f| f.path.as_deref()) {
        if let Ok(path) = upload_path(&state.config, stored) {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("Could not remove uploaded file {}: {e}", path.display());
            }
        }
    }

    Ok(Json(json!({
        "success": true,
        "message": "Mod deleted",
        "mods": mods,
    })))
}

async fn upload_handler(
    State(state): State<Arc<AppState>>,
    ip: ClientIp,
    headers: HeaderMap,
    ApiQuery(options): ApiQuery<UploadOptions>,
    multipart: Result<Multipart, MultipartRejection>,
) -> AppResult<Json<Value>> {
    let mut multipart = multipart?;
    let mut upload: Option<(String, bytes::Bytes)> = None;

    // A header secret is checked before any of the body is read.
    let mut authorized = false;
    if let Some(header) = admin_password_header(&headers) {
        state.gate.authorize(Some(&header), &ip).await?;
        authorized = true;
    }

    while let Some(field) = multipart.next_field().await? {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("file") => {
                let name = field.file_name().unwrap_or_default().to_string();
                let data = field.bytes().await?;
                upload = Some((name, data));
            }
            Some("password") if !authorized => {
                let password = field.text().await?;
                state
                    .gate
                    .authorize(admin_secret(None, Some(&password)), &ip)
                    .await?;
                authorized = true;
            }
            _ => {}
        }
    }

    if !authorized {
        state.gate.authorize(None, &ip).await?;
    }

    let (original_name, data) = match upload {
        Some((name, data)) if !name.is_empty() => (name, data),
        _ => return Err(AppError::Validation("No file uploaded".to_string())),
    };

    check_size(&state.config, data.len() as u64)?;
    check_extension(&state.config, &original_name)?;

    let stored = stored_file_name(&original_name);
    let uploads_dir = &state.config.storage.uploads_dir;
    tokio::fs::create_dir_all(uploads_dir).await?;
    tokio::fs::write(uploads_dir.join(&stored), &data).await?;

    info!(target: "audit", actor = %ip, file = %stored, size = data.len(), "mod file uploaded");

    let file = ModFile {
        content_type: mime_guess::from_path(&original_name)
            .first_or_octet_stream()
            .to_string(),
        name: original_name,
        size: data.len() as u64,
        base64: options.inline.then(|| BASE64.encode(&data)),
        path: Some(stored),
    };

    Ok(Json(json!({
        "success": true,
        "message": "File uploaded successfully",
        "file": file,
    })))
}

async fn download_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let mods = list_mods(&state.store).await;
    let file = mods
        .into_iter()
        .find(|m| m.id == id)
        .ok_or_else(|| AppError::NotFound("Mod not found".to_string()))?
        .file
        .ok_or_else(|| AppError::NotFound("Mod has no file".to_string()))?;

    let content = match (&file.path, &file.base64) {
        (Some(stored), _) => match tokio::fs::read(upload_path(&state.config, stored)?).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AppError::NotFound("File not found".to_string()));
            }
            Err(e) => return Err(e.into()),
        },
        (None, Some(encoded)) => BASE64
            .decode(encoded.as_bytes())
            .map_err(|e| AppError::Internal(format!("stored base64 for mod {id}: {e}")))?,
        (None, None) => return Err(AppError::NotFound("File not found".to_string())),
    };

    let content_type = if file.content_type.is_empty() {
        mime_guess::from_path(&file.name).first_or_octet_stream().to_string()
    } else {
        file.content_type.clone()
    };
    let disposition = format!("attachment; filename=\"{}\"", sanitize_filename(&file.name));

    let mut response = Body::from(content).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}
