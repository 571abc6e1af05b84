//! Server side of the cookie consent flow.
//!
//! Essential cookies are issued on every decision. Preference and advertising
//! cookies are issued only when their category is granted and are actively
//! expired otherwise. The decision itself is mirrored into `cookie_consent` so
//! later requests can read it without running client script.

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::CookieConfig;
use crate::error::{AppError, AppResult};
use crate::extract::{ApiJson, SecureTransport};
use crate::AppState;

pub const SESSION_COOKIE: &str = "session_id";
pub const CSRF_COOKIE: &str = "csrf_token";
pub const FUNCTIONALITY_COOKIE: &str = "site_functionality";
pub const THEME_COOKIE: &str = "theme_preference";
pub const LANGUAGE_COOKIE: &str = "language_preference";
pub const AD_TRACKING_COOKIE: &str = "ad_tracking";
pub const ANALYTICS_ID_COOKIE: &str = "analytics_id";
pub const CONSENT_COOKIE: &str = "cookie_consent";

const YEAR_DAYS: i64 = 365;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CookieCategory {
    Essentials,
    Preferences,
    Advertising,
}

impl CookieCategory {
    /// Cookies owned by a category that can be withdrawn.
    pub fn cookie_names(self) -> &'static [&'static str] {
        match self {
            CookieCategory::Essentials => &[SESSION_COOKIE, CSRF_COOKIE, FUNCTIONALITY_COOKIE],
            CookieCategory::Preferences => &[THEME_COOKIE, LANGUAGE_COOKIE],
            CookieCategory::Advertising => &[AD_TRACKING_COOKIE, ANALYTICS_ID_COOKIE],
        }
    }
}

/// The visitor's decision. `essentials` is always true.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsentRecord {
    pub essentials: bool,
    pub preferences: bool,
    pub advertising: bool,
    pub timestamp: DateTime<Utc>,
}

impl ConsentRecord {
    pub fn new(preferences: bool, advertising: bool, timestamp: DateTime<Utc>) -> Self {
        Self {
            essentials: true,
            preferences,
            advertising,
            timestamp,
        }
    }

    pub fn allows(&self, category: CookieCategory) -> bool {
        match category {
            CookieCategory::Essentials => true,
            CookieCategory::Preferences => self.preferences,
            CookieCategory::Advertising => self.advertising,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetCookie {
    pub name: String,
    pub value: String,
    /// `None` for a browser-session cookie.
    pub max_age_days: Option<i64>,
    pub removal: bool,
}

impl SetCookie {
    pub fn new(name: &str, value: impl Into<String>, max_age_days: Option<i64>) -> Self {
        Self {
            name: name.to_string(),
            value: value.into(),
            max_age_days,
            removal: false,
        }
    }

    pub fn removal(name: &str) -> Self {
        Self {
            name: name.to_string(),
            value: String::new(),
            max_age_days: None,
            removal: true,
        }
    }

    pub fn http_only(&self) -> bool {
        self.name == SESSION_COOKIE || self.name == CSRF_COOKIE
    }

    /// Render as a `Set-Cookie` header value.
    pub fn render(&self, secure: bool, now: DateTime<Utc>) -> String {
        let mut cookie = format!("{}={}", self.name, urlencoding::encode(&self.value));

        if self.removal {
            let past = now - Duration::hours(1);
            cookie.push_str(&format!("; Max-Age=0; Expires={}", http_date(past)));
        } else if let Some(days) = self.max_age_days {
            let expires = now + Duration::days(days);
            cookie.push_str(&format!(
                "; Max-Age={}; Expires={}",
                days * 24 * 60 * 60,
                http_date(expires)
            ));
        }

        cookie.push_str("; Path=/; SameSite=Lax");
        if secure {
            cookie.push_str("; Secure");
        }
        if self.http_only() {
            cookie.push_str("; HttpOnly");
        }
        cookie
    }
}

fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Request cookies by name, values URL-decoded.
pub fn request_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            let value = urlencoding::decode(value).ok()?.into_owned();
            Some((name.to_string(), value))
        })
        .collect()
}

pub fn consent_from_cookies(cookies: &HashMap<String, String>) -> Option<ConsentRecord> {
    let raw = cookies.get(CONSENT_COOKIE)?;
    match serde_json::from_str(raw) {
        Ok(record) => Some(record),
        Err(e) => {
            debug!("ignoring unreadable consent cookie: {e}");
            None
        }
    }
}

fn csrf_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn analytics_id(now: DateTime<Utc>) -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("analytics_{}_{}", now.timestamp(), hex::encode(bytes))
}

/// Session id, CSRF token and the functionality flag. Existing values are kept.
pub fn essential_cookies(existing: &HashMap<String, String>) -> Vec<SetCookie> {
    let mut cookies = Vec::new();

    if !existing.contains_key(SESSION_COOKIE) {
        cookies.push(SetCookie::new(
            SESSION_COOKIE,
            Uuid::new_v4().simple().to_string(),
            None,
        ));
    }

    let csrf = existing
        .get(CSRF_COOKIE)
        .filter(|v| !v.is_empty())
        .cloned()
        .unwrap_or_else(csrf_token);
    cookies.push(SetCookie::new(CSRF_COOKIE, csrf, Some(1)));
    cookies.push(SetCookie::new(FUNCTIONALITY_COOKIE, "enabled", Some(YEAR_DAYS)));
    cookies
}

pub fn removal_cookies(category: CookieCategory) -> AppResult<Vec<SetCookie>> {
    if category == CookieCategory::Essentials {
        return Err(AppError::Validation(
            "Essential cookies cannot be deleted".to_string(),
        ));
    }
    Ok(category
        .cookie_names()
        .iter()
        .map(|name| SetCookie::removal(name))
        .collect())
}

/// Every cookie change for a saved decision, in issue order.
pub fn consent_cookies(
    record: &ConsentRecord,
    analytics: Option<&str>,
    prefs: &CookieConfig,
    existing: &HashMap<String, String>,
) -> AppResult<Vec<SetCookie>> {
    let mut cookies = essential_cookies(existing);

    if record.preferences {
        cookies.push(SetCookie::new(THEME_COOKIE, prefs.theme.clone(), Some(YEAR_DAYS)));
        cookies.push(SetCookie::new(LANGUAGE_COOKIE, prefs.language.clone(), Some(YEAR_DAYS)));
    } else {
        cookies.extend(removal_cookies(CookieCategory::Preferences)?);
    }

    if record.advertising {
        let id = analytics
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| analytics_id(record.timestamp));
        cookies.push(SetCookie::new(AD_TRACKING_COOKIE, "enabled", Some(YEAR_DAYS)));
        cookies.push(SetCookie::new(ANALYTICS_ID_COOKIE, id, Some(YEAR_DAYS)));
    } else {
        cookies.extend(removal_cookies(CookieCategory::Advertising)?);
    }

    cookies.push(SetCookie::new(
        CONSENT_COOKIE,
        serde_json::to_string(record)?,
        Some(YEAR_DAYS),
    ));
    Ok(cookies)
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ConsentChoice {
    #[serde(default)]
    pub preferences: bool,
    #[serde(default)]
    pub advertising: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CookieRequest {
    InitEssentials,
    Save {
        consent: ConsentChoice,
        #[serde(default)]
        analytics_id: Option<String>,
    },
    Delete {
        category: CookieCategory,
    },
}

pub fn cookies_router() -> Router<Arc<AppState>> {
    Router::new().route("/cookies", get(read_consent).post(cookie_handler))
}

fn set_cookie_headers(cookies: &[SetCookie], secure: bool) -> HeaderMap {
    let now = Utc::now();
    let mut headers = HeaderMap::new();
    for cookie in cookies {
        match HeaderValue::from_str(&cookie.render(secure, now)) {
            Ok(value) => {
                headers.append(header::SET_COOKIE, value);
            }
            Err(e) => warn!(cookie = %cookie.name, "skipping unrepresentable cookie: {e}"),
        }
    }
    headers
}

async fn cookie_handler(
    State(state): State<Arc<AppState>>,
    SecureTransport(secure): SecureTransport,
    headers: HeaderMap,
    ApiJson(request): ApiJson<CookieRequest>,
) -> AppResult<impl IntoResponse> {
    let existing = request_cookies(&headers);

    let (cookies, message, consent) = match request {
        CookieRequest::InitEssentials => (
            essential_cookies(&existing),
            "Essential cookies initialized",
            None,
        ),
        CookieRequest::Save {
            consent,
            analytics_id,
        } => {
            let record = ConsentRecord::new(consent.preferences, consent.advertising, Utc::now());
            let cookies = consent_cookies(
                &record,
                analytics_id.as_deref(),
                &state.config.cookies,
                &existing,
            )?;
            (cookies, "Cookie preferences saved", Some(record))
        }
        CookieRequest::Delete { category } => {
            (removal_cookies(category)?, "Cookie category deleted", None)
        }
    };

    debug!(count = cookies.len(), secure, "issuing cookies");
    let body = match consent {
        Some(record) => json!({ "success": true, "message": message, "consent": record }),
        None => json!({ "success": true, "message": message }),
    };
    Ok((set_cookie_headers(&cookies, secure), Json(body)))
}

async fn read_consent(headers: HeaderMap) -> Json<serde_json::Value> {
    let consent = consent_from_cookies(&request_cookies(&headers));
    Json(json!({ "success": true, "consent": consent }))
}
