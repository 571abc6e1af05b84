//! Cookie consent banner logic.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::{ClientStorage, Outbound, CONSENT_STORAGE_KEY};
use crate::config::CookieConfig;
use crate::cookies::{
    consent_cookies, ConsentChoice, ConsentRecord, CookieCategory, CookieRequest, SetCookie,
    ANALYTICS_ID_COOKIE,
};
use crate::error::AppResult;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsentState {
    Unknown,
    Decided(ConsentRecord),
}

/// What should happen to the third-party analytics script.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScriptEffect {
    Inject { measurement_id: String },
    Disable,
    Unchanged,
}

#[derive(Clone, Debug)]
pub struct ConsentOutcome {
    pub record: ConsentRecord,
    /// Cookies the page itself sets or expires. HttpOnly ones come from the server.
    pub cookies: Vec<SetCookie>,
    pub sync: Outbound,
    pub script: ScriptEffect,
}

pub struct ConsentController {
    storage: Arc<dyn ClientStorage>,
    preferences: CookieConfig,
    measurement_id: Option<String>,
    state: ConsentState,
    script_loaded: bool,
}

impl ConsentController {
    pub fn new(
        storage: Arc<dyn ClientStorage>,
        preferences: CookieConfig,
        measurement_id: Option<String>,
    ) -> Self {
        let state = match storage.get(CONSENT_STORAGE_KEY) {
            Some(raw) => match serde_json::from_str::<ConsentRecord>(&raw) {
                Ok(record) => ConsentState::Decided(record),
                Err(e) => {
                    warn!("Stored consent unreadable, asking again: {e}");
                    ConsentState::Unknown
                }
            },
            None => ConsentState::Unknown,
        };

        Self {
            storage,
            preferences,
            measurement_id: measurement_id.filter(|id| !id.trim().is_empty()),
            state,
            script_loaded: false,
        }
    }

    pub fn state(&self) -> &ConsentState {
        &self.state
    }

    pub fn record(&self) -> Option<&ConsentRecord> {
        match &self.state {
            ConsentState::Decided(record) => Some(record),
            ConsentState::Unknown => None,
        }
    }

    pub fn banner_visible(&self) -> bool {
        self.state == ConsentState::Unknown
    }

    pub fn script_loaded(&self) -> bool {
        self.script_loaded
    }

    /// Request that issues the essential cookies on first load.
    pub fn init_essentials(&self) -> Outbound {
        Outbound::ConsentSync(CookieRequest::InitEssentials)
    }

    /// Re-apply a decision restored from storage on page load.
    pub fn restore(&mut self) -> ScriptEffect {
        let advertising = self
            .record()
            .is_some_and(|r| r.allows(CookieCategory::Advertising));
        self.script_effect(advertising)
    }

    /// Toggle positions for the settings panel.
    pub fn settings_toggles(&self) -> ConsentChoice {
        self.record()
            .map(|r| ConsentChoice {
                preferences: r.preferences,
                advertising: r.advertising,
            })
            .unwrap_or_default()
    }

    pub fn accept_all(&mut self, now: DateTime<Utc>) -> AppResult<ConsentOutcome> {
        self.decide(
            ConsentChoice {
                preferences: true,
                advertising: true,
            },
            now,
        )
    }

    pub fn essentials_only(&mut self, now: DateTime<Utc>) -> AppResult<ConsentOutcome> {
        self.decide(ConsentChoice::default(), now)
    }

    pub fn save_custom(&mut self, choice: ConsentChoice, now: DateTime<Utc>) -> AppResult<ConsentOutcome> {
        self.decide(choice, now)
    }

    fn decide(&mut self, choice: ConsentChoice, now: DateTime<Utc>) -> AppResult<ConsentOutcome> {
        let record = ConsentRecord::new(choice.preferences, choice.advertising, now);
        self.storage
            .set(CONSENT_STORAGE_KEY, serde_json::to_string(&record)?);

        let cookies: Vec<SetCookie> =
            consent_cookies(&record, None, &self.preferences, &HashMap::new())?
                .into_iter()
                .filter(|c| !c.http_only())
                .collect();

        // The server mirrors the same analytics id the page just set.
        let analytics_id = cookies
            .iter()
            .find(|c| c.name == ANALYTICS_ID_COOKIE && !c.removal)
            .map(|c| c.value.clone());

        let script = self.script_effect(record.advertising);
        self.state = ConsentState::Decided(record.clone());
        info!(
            preferences = record.preferences,
            advertising = record.advertising,
            "cookie consent saved"
        );

        Ok(ConsentOutcome {
            record,
            cookies,
            sync: Outbound::ConsentSync(CookieRequest::Save {
                consent: choice,
                analytics_id,
            }),
            script,
        })
    }

    fn script_effect(&mut self, advertising: bool) -> ScriptEffect {
        match (advertising, self.script_loaded, &self.measurement_id) {
            (true, false, Some(id)) => {
                self.script_loaded = true;
                ScriptEffect::Inject {
                    measurement_id: id.clone(),
                }
            }
            (false, true, _) => {
                self.script_loaded = false;
                ScriptEffect::Disable
            }
            _ => ScriptEffect::Unchanged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryStorage;
    use crate::cookies::{
        AD_TRACKING_COOKIE, CONSENT_COOKIE, CSRF_COOKIE, FUNCTIONALITY_COOKIE, LANGUAGE_COOKIE,
        SESSION_COOKIE, THEME_COOKIE,
    };

    fn controller(storage: Arc<MemoryStorage>) -> ConsentController {
        ConsentController::new(storage, CookieConfig::default(), Some("G-TEST".to_string()))
    }

    fn set(outcome: &ConsentOutcome, name: &str) -> bool {
        outcome.cookies.iter().any(|c| c.name == name && !c.removal)
    }

    fn expired(outcome: &ConsentOutcome, name: &str) -> bool {
        outcome.cookies.iter().any(|c| c.name == name && c.removal)
    }

    #[test]
    fn test_starts_unknown() {
        let c = controller(Arc::new(MemoryStorage::new()));
        assert!(c.banner_visible());
        assert_eq!(c.settings_toggles(), ConsentChoice::default());
    }

    #[test]
    fn test_essentials_only() {
        let mut c = controller(Arc::new(MemoryStorage::new()));
        let outcome = c.essentials_only(Utc::now()).unwrap();

        assert!(set(&outcome, FUNCTIONALITY_COOKIE));
        assert!(set(&outcome, CONSENT_COOKIE));
        for name in [THEME_COOKIE, LANGUAGE_COOKIE, AD_TRACKING_COOKIE, ANALYTICS_ID_COOKIE] {
            assert!(expired(&outcome, name), "{name} should be expired");
        }
        assert_eq!(outcome.script, ScriptEffect::Unchanged);
        assert!(!c.script_loaded());
        assert!(!c.banner_visible());
    }

    #[test]
    fn test_accept_all_injects_script_once() {
        let mut c = controller(Arc::new(MemoryStorage::new()));
        let first = c.accept_all(Utc::now()).unwrap();

        for name in [FUNCTIONALITY_COOKIE, THEME_COOKIE, AD_TRACKING_COOKIE, ANALYTICS_ID_COOKIE] {
            assert!(set(&first, name), "{name} should be set");
        }
        assert!(!first.cookies.iter().any(|c| c.name == SESSION_COOKIE || c.name == CSRF_COOKIE));
        assert_eq!(
            first.script,
            ScriptEffect::Inject {
                measurement_id: "G-TEST".to_string()
            }
        );

        let second = c.accept_all(Utc::now()).unwrap();
        assert_eq!(second.script, ScriptEffect::Unchanged);
        assert!(c.script_loaded());
    }

    #[test]
    fn test_sync_carries_page_analytics_id() {
        let mut c = controller(Arc::new(MemoryStorage::new()));
        let outcome = c.accept_all(Utc::now()).unwrap();
        let page_id = outcome
            .cookies
            .iter()
            .find(|c| c.name == ANALYTICS_ID_COOKIE)
            .map(|c| c.value.clone());

        match outcome.sync {
            Outbound::ConsentSync(CookieRequest::Save { analytics_id, .. }) => {
                assert_eq!(analytics_id, page_id)
            }
            other => panic!("unexpected sync {other:?}"),
        }
    }

    #[test]
    fn test_withdrawing_advertising_disables_script() {
        let mut c = controller(Arc::new(MemoryStorage::new()));
        c.accept_all(Utc::now()).unwrap();
        let outcome = c
            .save_custom(
                ConsentChoice {
                    preferences: true,
                    advertising: false,
                },
                Utc::now(),
            )
            .unwrap();
        assert_eq!(outcome.script, ScriptEffect::Disable);
        assert!(expired(&outcome, AD_TRACKING_COOKIE));
        assert!(set(&outcome, THEME_COOKIE));
    }

    #[test]
    fn test_choice_survives_reload_and_preloads_toggles() {
        let storage = Arc::new(MemoryStorage::new());
        let mut c = controller(storage.clone());
        c.save_custom(
            ConsentChoice {
                preferences: false,
                advertising: true,
            },
            Utc::now(),
        )
        .unwrap();

        let mut reloaded = controller(storage);
        assert!(!reloaded.banner_visible());
        assert_eq!(
            reloaded.settings_toggles(),
            ConsentChoice {
                preferences: false,
                advertising: true
            }
        );
        assert!(matches!(reloaded.restore(), ScriptEffect::Inject { .. }));
        assert_eq!(reloaded.restore(), ScriptEffect::Unchanged);
    }

    #[test]
    fn test_no_measurement_id_never_injects() {
        let mut c = ConsentController::new(
            Arc::new(MemoryStorage::new()),
            CookieConfig::default(),
            Some("  ".to_string()),
        );
        assert_eq!(c.accept_all(Utc::now()).unwrap().script, ScriptEffect::Unchanged);
    }
}
