//! Hotspot and UTM event capture with capped on-disk logs.

use axum::{
    extract::State,
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::error::AppResult;
use crate::extract::{admin_password_header, ApiJson, ClientIp};
use crate::store::{tail, Document, JsonStore};
use crate::AppState;

pub const SUMMARY_HOTSPOTS: usize = 1000;
pub const SUMMARY_UTM_RECORDS: usize = 100;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HotspotKind {
    #[default]
    Move,
    Click,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UtmKind {
    Pageview,
    Click,
    Scroll,
    FeatureView,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HotspotRequest {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub session_id: String,
    #[serde(rename = "type", default)]
    pub kind: HotspotKind,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HotspotEvent {
    pub x: f64,
    pub y: f64,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: HotspotKind,
    pub ip: String,
}

/// Campaign parameters; absent values fall back to `direct` / `none`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct UtmParams {
    #[serde(default = "direct")]
    pub source: String,
    #[serde(default = "none")]
    pub medium: String,
    #[serde(default = "none")]
    pub campaign: String,
    #[serde(default = "none")]
    pub term: String,
    #[serde(default = "none")]
    pub content: String,
}

fn direct() -> String {
    "direct".to_string()
}

fn none() -> String {
    "none".to_string()
}

impl Default for UtmParams {
    fn default() -> Self {
        Self {
            source: direct(),
            medium: none(),
            campaign: none(),
            term: none(),
            content: none(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UtmRequest {
    #[serde(rename = "type")]
    pub kind: UtmKind,
    #[serde(default)]
    pub session_id: String,
    #[serde(flatten)]
    pub params: UtmParams,
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Any other top-level keys are folded into `data`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UtmEvent {
    #[serde(rename = "type")]
    pub kind: UtmKind,
    pub session_id: String,
    pub ip: String,
    #[serde(flatten)]
    pub params: UtmParams,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl HotspotRequest {
    pub fn into_event(self, ip: String, timestamp: DateTime<Utc>) -> HotspotEvent {
        HotspotEvent {
            x: self.x,
            y: self.y,
            timestamp,
            session_id: self.session_id,
            kind: self.kind,
            ip,
        }
    }
}

impl UtmRequest {
    pub fn into_event(self, ip: String, timestamp: DateTime<Utc>) -> UtmEvent {
        let mut data = self.extra;
        data.extend(self.data);
        UtmEvent {
            kind: self.kind,
            session_id: self.session_id,
            ip,
            params: self.params,
            timestamp,
            data,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsStats {
    pub total_clicks: usize,
    pub total_views: usize,
    pub unique_visitors: usize,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSummary {
    pub hotspots: Vec<HotspotEvent>,
    pub utm_records: Vec<UtmEvent>,
    pub stats: AnalyticsStats,
}

pub fn compute_stats(records: &[UtmEvent]) -> AnalyticsStats {
    let sessions: HashSet<&str> = records
        .iter()
        .map(|r| r.session_id.as_str())
        .filter(|s| !s.is_empty())
        .collect();

    AnalyticsStats {
        total_clicks: records.iter().filter(|r| r.kind == UtmKind::Click).count(),
        total_views: records.iter().filter(|r| r.kind == UtmKind::Pageview).count(),
        unique_visitors: sessions.len(),
    }
}

pub async fn summarize(store: &JsonStore) -> AnalyticsSummary {
    let hotspots: Vec<HotspotEvent> = store.read_or_default(Document::Hotspots).await;
    let records: Vec<UtmEvent> = store.read_or_default(Document::UtmEvents).await;

    AnalyticsSummary {
        hotspots: tail(&hotspots, SUMMARY_HOTSPOTS),
        utm_records: tail(&records, SUMMARY_UTM_RECORDS),
        stats: compute_stats(&records),
    }
}

pub fn analytics_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/analytics/hotspot", post(hotspot_handler))
        .route("/analytics/utm", post(utm_handler))
        .route("/analytics/summary", get(summary_handler))
}

async fn hotspot_handler(
    State(state): State<Arc<AppState>>,
    ip: ClientIp,
    ApiJson(body): ApiJson<HotspotRequest>,
) -> AppResult<Json<Value>> {
    let event = body.into_event(ip.into_string(), Utc::now());
    let stored = state
        .store
        .append_capped(Document::Hotspots, event, state.config.storage.hotspot_cap)
        .await?;
    debug!(stored, "hotspot recorded");

    Ok(Json(json!({ "success": true, "message": "Hotspot recorded" })))
}

async fn utm_handler(
    State(state): State<Arc<AppState>>,
    ip: ClientIp,
    ApiJson(body): ApiJson<UtmRequest>,
) -> AppResult<Json<Value>> {
    let event = body.into_event(ip.into_string(), Utc::now());
    let stored = state
        .store
        .append_capped(Document::UtmEvents, event, state.config.storage.utm_cap)
        .await?;
    debug!(stored, "utm event recorded");

    Ok(Json(json!({ "success": true, "message": "UTM event recorded" })))
}

async fn summary_handler(
    State(state): State<Arc<AppState>>,
    ip: ClientIp,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    state
        .gate
        .authorize(admin_password_header(&headers).as_deref(), &ip)
        .await?;

    let summary = summarize(&state.store).await;
    Ok(Json(json!({
        "success": true,
        "hotspots": summary.hotspots,
        "utmRecords": summary.utm_records,
        "stats": summary.stats,
    })))
}
