use anyhow::Context;
use chrono_tz::Tz;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const CONFIG_FILE: &str = "launchsite.toml";
pub const MIN_PASSWORD_LENGTH: usize = 20;

const DEFAULT_CONFIG: &str = r#"# launchsite configuration

[server]
host = "0.0.0.0"
port = 3000
document_root = "public"
# Honour X-Forwarded-For / X-Forwarded-Proto. Only enable behind a reverse proxy.
trust_proxy_headers = false

[storage]
data_dir = "data"
uploads_dir = "uploads"
hotspot_cap = 10000
utm_cap = 5000

[password]
# "daily" rotates a password every calendar day and posts it to the webhook.
# "file" reads a static secret from secret_file.
source = "daily"
secret_file = "data/admin_secret.txt"
timezone = "Europe/Istanbul"
length = 20

[webhook]
# Prefer LAUNCHSITE_WEBHOOK_URL in the environment over putting the URL here.
title = "Launcher - Daily Admin Password"
footer = "Launcher Security System"

[uploads]
max_file_size = 52428800
allowed_extensions = ["zip", "rar", "7z", "exe", "dll", "mod"]

[analytics]
google_analytics_id = ""

[logging]
filter = "info"
"#;

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub password: PasswordConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub uploads: UploadConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    #[serde(default)]
    pub cookies: CookieConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_document_root")]
    pub document_root: PathBuf,
    #[serde(default)]
    pub trust_proxy_headers: bool,
}

#[derive(Deserialize, Clone, Debug)]
pub struct TlsConfig {
    pub port: u16,
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Deserialize, Clone, Debug)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: PathBuf,
    #[serde(default = "default_hotspot_cap")]
    pub hotspot_cap: usize,
    #[serde(default = "default_utm_cap")]
    pub utm_cap: usize,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SecretSourceKind {
    Daily,
    File,
}

#[derive(Deserialize, Clone, Debug)]
pub struct PasswordConfig {
    #[serde(default = "default_secret_source")]
    pub source: SecretSourceKind,
    #[serde(default = "default_secret_file")]
    pub secret_file: PathBuf,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_password_length")]
    pub length: usize,
}

#[derive(Deserialize, Clone, Debug)]
pub struct WebhookConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_webhook_title")]
    pub title: String,
    #[serde(default = "default_webhook_footer")]
    pub footer: String,
    #[serde(default = "default_webhook_color")]
    pub color: u32,
}

#[derive(Deserialize, Clone, Debug)]
pub struct UploadConfig {
    #[serde(default = "default_max_file_size")]
    pub max_file_size: usize,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct AnalyticsConfig {
    #[serde(default)]
    pub google_analytics_id: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct CookieConfig {
    #[serde(default = "default_theme")]
    pub theme: String,
    #[serde(default = "default_language")]
    pub language: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_document_root() -> PathBuf {
    PathBuf::from("public")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_uploads_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_hotspot_cap() -> usize {
    10_000
}

fn default_utm_cap() -> usize {
    5_000
}

fn default_secret_source() -> SecretSourceKind {
    SecretSourceKind::Daily
}

fn default_secret_file() -> PathBuf {
    PathBuf::from("data/admin_secret.txt")
}

fn default_timezone() -> String {
    "Europe/Istanbul".to_string()
}

fn default_password_length() -> usize {
    MIN_PASSWORD_LENGTH
}

fn default_webhook_title() -> String {
    "Launcher - Daily Admin Password".to_string()
}

fn default_webhook_footer() -> String {
    "Launcher Security System".to_string()
}

fn default_webhook_color() -> u32 {
    0x00d4ff
}

fn default_max_file_size() -> usize {
    50 * 1024 * 1024
}

fn default_allowed_extensions() -> Vec<String> {
    ["zip", "rar", "7z", "exe", "dll", "mod"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_theme() -> String {
    "dark".to_string()
}

fn default_language() -> String {
    "tr".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            uploads_dir: default_uploads_dir(),
            hotspot_cap: default_hotspot_cap(),
            utm_cap: default_utm_cap(),
        }
    }
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            source: default_secret_source(),
            secret_file: default_secret_file(),
            timezone: default_timezone(),
            length: default_password_length(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            title: default_webhook_title(),
            footer: default_webhook_footer(),
            color: default_webhook_color(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            allowed_extensions: default_allowed_extensions(),
        }
    }
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            theme: default_theme(),
            language: default_language(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

impl Config {
    /// Load the config file, writing the default one first if it does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                eprintln!(
                    "Configuration file '{}' not found. Creating default.",
                    path.display()
                );
                std::fs::write(path, DEFAULT_CONFIG)
                    .with_context(|| format!("writing default config to {}", path.display()))?;
                DEFAULT_CONFIG.to_string()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading config {}", path.display()));
            }
        };

        let mut config = Self::parse(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let mut config: Config = toml::from_str(raw).context("parsing configuration")?;
        if config.password.length < MIN_PASSWORD_LENGTH {
            warn!(
                "password.length {} is below the minimum, using {}",
                config.password.length, MIN_PASSWORD_LENGTH
            );
            config.password.length = MIN_PASSWORD_LENGTH;
        }
        for ext in config.uploads.allowed_extensions.iter_mut() {
            *ext = ext.trim_start_matches('.').to_ascii_lowercase();
        }
        if config.webhook.url.as_deref().is_some_and(|u| u.trim().is_empty()) {
            config.webhook.url = None;
        }
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(port) = env::var("LAUNCHSITE_PORT") {
            match port.parse() {
                Ok(p) => {
                    info!("LAUNCHSITE_PORT set, listening on {p}");
                    self.server.port = p;
                }
                Err(e) => warn!("Invalid LAUNCHSITE_PORT value: {e}"),
            }
        }

        let webhook = env::var("LAUNCHSITE_WEBHOOK_URL").or_else(|_| env::var("DISCORD_WEBHOOK_URL"));
        if let Ok(url) = webhook {
            if !url.trim().is_empty() {
                self.webhook.url = Some(url.trim().to_string());
            }
        }

        if let Ok(tz) = env::var("LAUNCHSITE_TIMEZONE") {
            self.password.timezone = tz;
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.timezone()?;
        Ok(())
    }

    pub fn timezone(&self) -> anyhow::Result<Tz> {
        self.password
            .timezone
            .parse::<Tz>()
            .map_err(|e| anyhow::anyhow!("invalid password.timezone '{}': {e}", self.password.timezone))
    }

    pub fn is_allowed_extension(&self, ext: &str) -> bool {
        let ext = ext.to_ascii_lowercase();
        self.uploads.allowed_extensions.iter().any(|e| *e == ext)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
                document_root: default_document_root(),
                trust_proxy_headers: false,
            },
            tls: None,
            storage: StorageConfig::default(),
            password: PasswordConfig::default(),
            webhook: WebhookConfig::default(),
            uploads: UploadConfig::default(),
            analytics: AnalyticsConfig::default(),
            cookies: CookieConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
