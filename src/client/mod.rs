//! Visitor-side behaviour of the landing page.
//!
//! The tracker and consent controller are plain state machines. The caller
//! owns them and drives them with explicit millisecond timestamps; nothing in
//! here keeps ambient global state.

pub mod consent;
pub mod tracker;

pub use consent::{ConsentController, ConsentOutcome, ConsentState, ScriptEffect};
pub use tracker::{ElementInfo, HeatCell, Tracker, TrackerSettings};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::analytics::{HotspotRequest, UtmRequest};
use crate::cookies::CookieRequest;
use crate::error::{AppError, AppResult};

pub const UTM_STORAGE_KEY: &str = "launcherUTM";
pub const HOTSPOT_STORAGE_KEY: &str = "launcherHotspots";
pub const CONSENT_STORAGE_KEY: &str = "cookieConsent";

/// Persistent key/value storage on the visitor's device.
pub trait ClientStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
    fn remove(&self, key: &str);
}

#[derive(Default)]
pub struct MemoryStorage {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClientStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.items.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        self.items.lock().insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.items.lock().remove(key);
    }
}

/// Third-party analytics event, shaped like a gtag `event` call.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ThirdPartyEvent {
    pub name: String,
    pub category: String,
    pub label: String,
    pub value: u32,
}

/// Something waiting in the tracker outbox.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Outbound {
    Hotspot(HotspotRequest),
    Utm(UtmRequest),
    ThirdParty(ThirdPartyEvent),
    ConsentSync(CookieRequest),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, item: &Outbound) -> AppResult<()>;
}

/// Delivers the outbox to a running launchsite server.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Url,
    third_party: Option<Url>,
}

impl HttpTransport {
    pub fn new(base_url: Url) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            third_party: None,
        })
    }

    /// Collector that receives third-party events. Without one they are dropped.
    pub fn with_third_party(mut self, endpoint: Url) -> Self {
        self.third_party = Some(endpoint);
        self
    }

    pub fn endpoint(&self, item: &Outbound) -> AppResult<Option<Url>> {
        let path = match item {
            Outbound::Hotspot(_) => "api/analytics/hotspot",
            Outbound::Utm(_) => "api/analytics/utm",
            Outbound::ConsentSync(_) => "api/cookies",
            Outbound::ThirdParty(_) => return Ok(self.third_party.clone()),
        };
        self.base_url
            .join(path)
            .map(Some)
            .map_err(|e| AppError::Internal(format!("bad endpoint {path}: {e}")))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, item: &Outbound) -> AppResult<()> {
        let Some(url) = self.endpoint(item)? else {
            debug!("no third-party collector configured, dropping event");
            return Ok(());
        };

        let request = self.client.post(url.clone());
        let request = match item {
            Outbound::Hotspot(body) => request.json(body),
            Outbound::Utm(body) => request.json(body),
            Outbound::ConsentSync(body) => request.json(body),
            Outbound::ThirdParty(body) => request.json(body),
        };

        let response = request
            .send()
            .await
            .map_err(|e| AppError::Upstream(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Upstream(format!("{url} returned HTTP {status}")));
        }
        Ok(())
    }
}
