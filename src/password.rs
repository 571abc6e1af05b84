//! Daily rotating admin password.
//!
//! A record is *fresh* when its date equals today's date in the configured
//! timezone, *stale* otherwise. Reading a fresh record never takes a lock.
//! Regeneration is serialised and re-reads the persisted date first, so a boot
//! check racing the midnight trigger still yields one password per day.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::MIN_PASSWORD_LENGTH;
use crate::error::AppResult;
use crate::store::{Document, JsonStore};
use crate::webhook::PasswordNotifier;

pub const UPPERCASE: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
pub const LOWERCASE: &str = "abcdefghijklmnopqrstuvwxyz";
pub const DIGITS: &str = "0123456789";
pub const SYMBOLS: &str = "!@#$%^&*()_+-=[]{}|;:,.<>?";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DailyPasswordRecord {
    pub date: NaiveDate,
    pub password: String,
    pub generated_at: DateTime<Utc>,
}

/// Generate a password of at least 20 characters with one character from each
/// class, the rest drawn from the combined alphabet, then shuffled.
pub fn generate_password(length: usize) -> String {
    let length = length.max(MIN_PASSWORD_LENGTH);
    let mut rng = rand::thread_rng();
    let all: Vec<char> = [UPPERCASE, LOWERCASE, DIGITS, SYMBOLS].concat().chars().collect();

    let mut chars: Vec<char> = [UPPERCASE, LOWERCASE, DIGITS, SYMBOLS]
        .iter()
        .map(|class| {
            let class: Vec<char> = class.chars().collect();
            class[rng.gen_range(0..class.len())]
        })
        .collect();

    while chars.len() < length {
        chars.push(all[rng.gen_range(0..all.len())]);
    }

    chars.shuffle(&mut rng);
    chars.into_iter().collect()
}

pub struct DailyPasswordManager {
    store: JsonStore,
    timezone: Tz,
    length: usize,
    notifier: Arc<dyn PasswordNotifier>,
    rotation: Mutex<()>,
}

impl DailyPasswordManager {
    pub fn new(
        store: JsonStore,
        timezone: Tz,
        length: usize,
        notifier: Arc<dyn PasswordNotifier>,
    ) -> Self {
        Self {
            store,
            timezone,
            length,
            notifier,
            rotation: Mutex::new(()),
        }
    }

    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.timezone).date_naive()
    }

    pub async fn current_password(&self) -> AppResult<String> {
        self.password_for(self.today()).await
    }

    /// Today's password, generating, persisting and announcing a new one when
    /// the stored record belongs to another day.
    pub async fn password_for(&self, today: NaiveDate) -> AppResult<String> {
        if let Some(record) = self.fresh_record(today).await {
            return Ok(record.password);
        }

        let record = {
            let _guard = self.rotation.lock().await;
            if let Some(record) = self.fresh_record(today).await {
                return Ok(record.password);
            }

            let record = DailyPasswordRecord {
                date: today,
                password: generate_password(self.length),
                generated_at: Utc::now(),
            };
            self.store.save(Document::DailyPassword, &record).await?;
            record
        };

        info!("Generated admin password for {}", record.date);
        if let Err(e) = self.notifier.notify(&record).await {
            error!("Failed to deliver daily password for {}: {e}", record.date);
        }

        Ok(record.password)
    }

    async fn fresh_record(&self, today: NaiveDate) -> Option<DailyPasswordRecord> {
        match self.store.load::<DailyPasswordRecord>(Document::DailyPassword).await {
            Ok(Some(record)) if record.date == today && !record.password.is_empty() => Some(record),
            Ok(_) => None,
            Err(e) => {
                warn!("Daily password record unreadable, regenerating: {e}");
                None
            }
        }
    }

    /// Time left until the next local midnight.
    pub fn until_next_rotation(&self) -> Duration {
        until_next_midnight(Utc::now(), self.timezone)
    }
}

pub fn until_next_midnight(now: DateTime<Utc>, tz: Tz) -> Duration {
    let local = now.with_timezone(&tz);
    let next_day = local
        .date_naive()
        .succ_opt()
        .unwrap_or_else(|| local.date_naive());

    // Midnight can be skipped by a DST jump; take the first valid instant after it.
    let midnight = (0..3)
        .filter_map(|hour| {
            next_day
                .and_hms_opt(hour, 0, 0)
                .and_then(|naive| tz.from_local_datetime(&naive).earliest())
        })
        .next();

    match midnight {
        Some(midnight) => (midnight.with_timezone(&Utc) - now)
            .to_std()
            .unwrap_or(Duration::from_secs(60)),
        None => Duration::from_secs(60 * 60),
    }
}

/// Rotate at startup and then at every local midnight.
pub fn spawn_rotation(manager: Arc<DailyPasswordManager>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let wait = manager.until_next_rotation();
            tokio::time::sleep(wait).await;
            info!("Rotating daily admin password");
            if let Err(e) = manager.current_password().await {
                error!("Daily password rotation failed: {e}");
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
        }
    })
}
