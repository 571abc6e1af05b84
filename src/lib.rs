//! launchsite: landing page server with a daily admin password, mod catalog,
//! analytics capture and cookie consent.

pub mod admin;
pub mod analytics;
pub mod auth;
pub mod client;
pub mod config;
pub mod cookies;
pub mod error;
pub mod extract;
pub mod mods;
pub mod password;
pub mod site;
pub mod store;
pub mod webhook;

use axum::{
    http::{header, HeaderName, Method},
    routing::get,
    Router,
};
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::auth::{AdminGate, SecretSource, ADMIN_PASSWORD_HEADER};
use crate::config::{Config, SecretSourceKind};
use crate::password::DailyPasswordManager;
use crate::store::JsonStore;
use crate::webhook::PasswordNotifier;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct AppState {
    pub config: Config,
    pub store: JsonStore,
    pub gate: AdminGate,
    /// Present when the admin secret is the rotating daily password.
    pub passwords: Option<Arc<DailyPasswordManager>>,
}

impl AppState {
    /// Prepare the data and upload directories and wire the admin secret source.
    pub async fn build(config: Config, notifier: Arc<dyn PasswordNotifier>) -> anyhow::Result<Self> {
        let store = JsonStore::new(&config.storage.data_dir);
        store.init().await?;
        tokio::fs::create_dir_all(&config.storage.uploads_dir).await?;
        admin::load_admin_ips(&store).await?;

        let (source, passwords) = match config.password.source {
            SecretSourceKind::Daily => {
                let manager = Arc::new(DailyPasswordManager::new(
                    store.clone(),
                    config.timezone()?,
                    config.password.length,
                    notifier,
                ));
                (SecretSource::Daily(manager.clone()), Some(manager))
            }
            SecretSourceKind::File => {
                info!(
                    "Admin secret read from {}",
                    config.password.secret_file.display()
                );
                (SecretSource::StaticFile(config.password.secret_file.clone()), None)
            }
        };

        Ok(Self {
            gate: AdminGate::new(source, store.clone()),
            config,
            store,
            passwords,
        })
    }
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static(ADMIN_PASSWORD_HEADER),
        ])
}

/// The full application: JSON API under `/api`, static site everywhere else.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/health", get(site::health))
        .route("/config", get(site::config_lookup))
        .merge(admin::admin_router())
        .merge(mods::mods_router(&state.config))
        .merge(analytics::analytics_router())
        .merge(cookies::cookies_router())
        .fallback(site::api_not_found);

    let app = Router::new()
        .nest("/api", api)
        .fallback(site::static_handler)
        .with_state(state);

    site::with_security_headers(app)
        .layer(CompressionLayer::new())
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
}
