//! Out-of-band delivery of the daily password.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::WebhookConfig;
use crate::error::{AppError, AppResult};
use crate::password::DailyPasswordRecord;

#[async_trait]
pub trait PasswordNotifier: Send + Sync {
    async fn notify(&self, record: &DailyPasswordRecord) -> AppResult<()>;
}

/// Posts an embed to a Discord-compatible chat webhook.
pub struct ChatWebhook {
    client: reqwest::Client,
    config: WebhookConfig,
}

impl ChatWebhook {
    pub fn new(config: WebhookConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, config }
    }

    pub fn payload(&self, record: &DailyPasswordRecord) -> serde_json::Value {
        json!({
            "embeds": [{
                "title": self.config.title,
                "description": format!("**Date:** {}\n**Password:** `{}`", record.date, record.password),
                "color": self.config.color,
                "timestamp": Utc::now().to_rfc3339(),
                "footer": { "text": self.config.footer },
            }]
        })
    }
}

#[async_trait]
impl PasswordNotifier for ChatWebhook {
    async fn notify(&self, record: &DailyPasswordRecord) -> AppResult<()> {
        let Some(url) = self.config.url.as_deref() else {
            warn!("Webhook URL not configured, skipping password notification");
            return Ok(());
        };

        let response = self
            .client
            .post(url)
            .json(&self.payload(record))
            .send()
            .await
            .map_err(|e| AppError::Upstream(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Upstream(format!("webhook returned HTTP {status}")));
        }

        info!("Daily password sent to webhook for {}", record.date);
        Ok(())
    }
}
