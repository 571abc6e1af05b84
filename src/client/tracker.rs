//! Click, pointer, scroll and campaign tracking for one page load.

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use super::{
    ClientStorage, Outbound, ThirdPartyEvent, Transport, HOTSPOT_STORAGE_KEY, UTM_STORAGE_KEY,
};
use crate::analytics::{HotspotKind, HotspotRequest, UtmKind, UtmParams, UtmRequest};
use crate::cookies::ConsentRecord;
use crate::store::push_capped;

#[derive(Clone, Debug)]
pub struct TrackerSettings {
    pub mouse_throttle_ms: u64,
    pub mouse_buffer: usize,
    pub grid_size: f64,
    pub scroll_debounce_ms: u64,
    pub local_cap: usize,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            mouse_throttle_ms: 100,
            mouse_buffer: 5000,
            grid_size: 50.0,
            scroll_debounce_ms: 500,
            local_cap: 1000,
        }
    }
}

/// The clicked element as the page reports it.
#[derive(Clone, Debug, Default)]
pub struct ElementInfo {
    pub tag: String,
    pub id: Option<String>,
    pub classes: Vec<String>,
}

impl ElementInfo {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_class(mut self, class: &str) -> Self {
        self.classes.push(class.to_string());
        self
    }

    pub fn action(&self) -> &'static str {
        match self.id.as_deref() {
            Some("downloadBtn") => "download_button",
            Some("viewModsBtn") => "view_mods_button",
            _ if self.classes.iter().any(|c| c == "nav-dot") => "feature_navigation",
            _ => "other_click",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MousePosition {
    pub x: f64,
    pub y: f64,
    pub at_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct HeatCell {
    pub x: i64,
    pub y: i64,
    pub count: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalHotspot {
    pub x: f64,
    pub y: f64,
    pub timestamp: u64,
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: HotspotKind,
    pub element: String,
}

#[derive(Clone, Copy, Debug)]
struct PendingScroll {
    due_ms: u64,
    position: f64,
    percentage: u32,
}

/// `session_<millis>_<9 base36 chars>`. Only meant to group analytics events.
pub fn new_session_id(now_ms: u64) -> String {
    const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("session_{now_ms}_{suffix}")
}

/// Campaign parameters from the page URL, with `direct` / `none` defaults.
pub fn utm_from_url(page_url: &str) -> UtmParams {
    let mut params = UtmParams::default();
    let Ok(url) = Url::parse(page_url) else {
        return params;
    };

    for (key, value) in url.query_pairs() {
        if value.is_empty() {
            continue;
        }
        let slot = match key.as_ref() {
            "utm_source" => &mut params.source,
            "utm_medium" => &mut params.medium,
            "utm_campaign" => &mut params.campaign,
            "utm_term" => &mut params.term,
            "utm_content" => &mut params.content,
            _ => continue,
        };
        *slot = value.into_owned();
    }
    params
}

fn page_path(page_url: &str) -> String {
    Url::parse(page_url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| "/".to_string())
}

fn utm_kind_name(kind: UtmKind) -> &'static str {
    match kind {
        UtmKind::Pageview => "pageview",
        UtmKind::Click => "click",
        UtmKind::Scroll => "scroll",
        UtmKind::FeatureView => "feature_view",
    }
}

/// Client context for one page load.
pub struct Tracker {
    session_id: String,
    utm: UtmParams,
    page: String,
    referrer: String,
    settings: TrackerSettings,
    storage: Arc<dyn ClientStorage>,
    consent: Option<ConsentRecord>,
    utm_log: Vec<Value>,
    hotspots: Vec<LocalHotspot>,
    mouse: Vec<MousePosition>,
    last_mouse_ms: Option<u64>,
    pending_mouse: Option<MousePosition>,
    pending_scroll: Option<PendingScroll>,
    page_view_sent: bool,
    outbox: Vec<Outbound>,
}

impl Tracker {
    pub fn new(
        page_url: &str,
        referrer: Option<&str>,
        storage: Arc<dyn ClientStorage>,
        settings: TrackerSettings,
        now_ms: u64,
    ) -> Self {
        let utm_log = load_local(storage.as_ref(), UTM_STORAGE_KEY);
        let hotspots = load_local(storage.as_ref(), HOTSPOT_STORAGE_KEY);

        Self {
            session_id: new_session_id(now_ms),
            utm: utm_from_url(page_url),
            page: page_path(page_url),
            referrer: referrer
                .filter(|r| !r.is_empty())
                .unwrap_or("direct")
                .to_string(),
            settings,
            storage,
            consent: None,
            utm_log,
            hotspots,
            mouse: Vec::new(),
            last_mouse_ms: None,
            pending_mouse: None,
            pending_scroll: None,
            page_view_sent: false,
            outbox: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn utm(&self) -> &UtmParams {
        &self.utm
    }

    /// Forwarding follows the latest consent decision.
    pub fn set_consent(&mut self, consent: Option<ConsentRecord>) {
        self.consent = consent;
    }

    fn first_party_allowed(&self) -> bool {
        self.consent.is_some()
    }

    fn third_party_allowed(&self) -> bool {
        self.consent.as_ref().is_some_and(|c| c.advertising)
    }

    pub fn outbox(&self) -> &[Outbound] {
        &self.outbox
    }

    pub fn local_utm_events(&self) -> &[Value] {
        &self.utm_log
    }

    pub fn local_hotspots(&self) -> &[LocalHotspot] {
        &self.hotspots
    }

    pub fn mouse_positions(&self) -> &[MousePosition] {
        &self.mouse
    }

    fn track(&mut self, kind: UtmKind, mut data: Map<String, Value>, now_ms: u64) {
        data.insert("clientTimestamp".to_string(), json!(now_ms));
        let label = data
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or(utm_kind_name(kind))
            .to_string();

        let request = UtmRequest {
            kind,
            session_id: self.session_id.clone(),
            params: self.utm.clone(),
            data,
            extra: Map::new(),
        };

        match serde_json::to_value(&request) {
            Ok(value) => {
                push_capped(&mut self.utm_log, value, self.settings.local_cap);
                save_local(self.storage.as_ref(), UTM_STORAGE_KEY, &self.utm_log);
            }
            Err(e) => warn!("Could not mirror analytics event locally: {e}"),
        }

        if self.third_party_allowed() {
            self.outbox.push(Outbound::ThirdParty(ThirdPartyEvent {
                name: utm_kind_name(kind).to_string(),
                category: "UTM".to_string(),
                label,
                value: 1,
            }));
        }
        if self.first_party_allowed() {
            self.outbox.push(Outbound::Utm(request));
        }
    }

    /// Record the page view. Only the first call per load does anything.
    pub fn page_view(&mut self, now_ms: u64) -> bool {
        if self.page_view_sent {
            return false;
        }
        self.page_view_sent = true;

        let mut data = Map::new();
        data.insert("page".to_string(), json!(self.page));
        data.insert("referrer".to_string(), json!(self.referrer));
        self.track(UtmKind::Pageview, data, now_ms);
        true
    }

    pub fn click(&mut self, element: &ElementInfo, x: f64, y: f64, now_ms: u64) {
        let mut data = Map::new();
        data.insert("action".to_string(), json!(element.action()));
        data.insert("element".to_string(), json!(element.tag));
        data.insert("id".to_string(), json!(element.id.as_deref().unwrap_or("none")));
        let class = if element.classes.is_empty() {
            "none".to_string()
        } else {
            element.classes.join(" ")
        };
        data.insert("class".to_string(), json!(class));
        self.track(UtmKind::Click, data, now_ms);

        let hotspot = LocalHotspot {
            x,
            y,
            timestamp: now_ms,
            session_id: self.session_id.clone(),
            kind: HotspotKind::Click,
            element: element.tag.clone(),
        };
        push_capped(&mut self.hotspots, hotspot, self.settings.local_cap);
        save_local(self.storage.as_ref(), HOTSPOT_STORAGE_KEY, &self.hotspots);

        if self.first_party_allowed() {
            self.outbox.push(Outbound::Hotspot(HotspotRequest {
                x,
                y,
                session_id: self.session_id.clone(),
                kind: HotspotKind::Click,
            }));
        }
    }

    pub fn feature_view(&mut self, feature: Option<&str>, now_ms: u64) {
        let mut data = Map::new();
        data.insert("feature".to_string(), json!(feature.unwrap_or("unknown")));
        self.track(UtmKind::FeatureView, data, now_ms);
    }

    /// At most one position per throttle window; moves inside a window are
    /// coalesced into the latest one and recorded by `tick`.
    pub fn mouse_move(&mut self, x: f64, y: f64, now_ms: u64) {
        let position = MousePosition { x, y, at_ms: now_ms };
        match self.last_mouse_ms {
            Some(last) if now_ms.saturating_sub(last) < self.settings.mouse_throttle_ms => {
                self.pending_mouse = Some(position);
            }
            _ => self.record_mouse(position),
        }
    }

    fn record_mouse(&mut self, position: MousePosition) {
        self.last_mouse_ms = Some(position.at_ms);
        self.pending_mouse = None;
        push_capped(&mut self.mouse, position, self.settings.mouse_buffer);
    }

    pub fn scroll(&mut self, position: f64, scrollable_height: f64, now_ms: u64) {
        let percentage = if scrollable_height > 0.0 {
            ((position / scrollable_height) * 100.0).round().clamp(0.0, 100.0) as u32
        } else {
            0
        };
        self.pending_scroll = Some(PendingScroll {
            due_ms: now_ms.saturating_add(self.settings.scroll_debounce_ms),
            position,
            percentage,
        });
    }

    /// Fire whatever throttle or debounce windows have elapsed.
    pub fn tick(&mut self, now_ms: u64) {
        if let (Some(pending), Some(last)) = (self.pending_mouse, self.last_mouse_ms) {
            if now_ms.saturating_sub(last) >= self.settings.mouse_throttle_ms {
                self.record_mouse(MousePosition {
                    at_ms: now_ms,
                    ..pending
                });
            }
        }

        if let Some(scroll) = self.pending_scroll {
            if now_ms >= scroll.due_ms {
                self.pending_scroll = None;
                let mut data = Map::new();
                data.insert("scrollPosition".to_string(), json!(scroll.position));
                data.insert("scrollPercentage".to_string(), json!(scroll.percentage));
                self.track(UtmKind::Scroll, data, now_ms);
            }
        }
    }

    /// Pointer density keyed by `"{gx}_{gy}"`; cell coordinates are the grid origin.
    pub fn heatmap(&self) -> BTreeMap<String, HeatCell> {
        let grid = self.settings.grid_size;
        let mut cells: BTreeMap<String, HeatCell> = BTreeMap::new();
        for pos in &self.mouse {
            let gx = (pos.x / grid).floor() as i64;
            let gy = (pos.y / grid).floor() as i64;
            cells
                .entry(format!("{gx}_{gy}"))
                .or_insert(HeatCell {
                    x: gx * grid as i64,
                    y: gy * grid as i64,
                    count: 0,
                })
                .count += 1;
        }
        cells
    }

    /// Send everything queued. Failures are logged and dropped.
    pub async fn flush(&mut self, transport: &dyn Transport) -> usize {
        let pending = std::mem::take(&mut self.outbox);
        let mut delivered = 0;
        for item in &pending {
            match transport.send(item).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Analytics delivery failed: {e}"),
            }
        }
        debug!(delivered, queued = pending.len(), "outbox flushed");
        delivered
    }
}

fn load_local<T: serde::de::DeserializeOwned>(storage: &dyn ClientStorage, key: &str) -> Vec<T> {
    storage
        .get(key)
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

fn save_local<T: Serialize>(storage: &dyn ClientStorage, key: &str, items: &[T]) {
    match serde_json::to_string(items) {
        Ok(raw) => storage.set(key, raw),
        Err(e) => warn!("Could not persist {key}: {e}"),
    }
}
