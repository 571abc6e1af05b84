//! Admin authentication.
//!
//! The secret is authoritative and the caller IP must also be on the admin
//! allowlist. Both checks are applied the same way by every protected route.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

use crate::admin::load_admin_ips;
use crate::error::{AppError, AppResult};
use crate::extract::ClientIp;
use crate::password::{generate_password, DailyPasswordManager};
use crate::store::JsonStore;

pub const ADMIN_PASSWORD_HEADER: &str = "x-admin-password";

pub enum SecretSource {
    Daily(Arc<DailyPasswordManager>),
    /// Operator-managed secret file. Created with a random secret when missing.
    StaticFile(PathBuf),
}

pub struct AdminGate {
    source: SecretSource,
    store: JsonStore,
}

/// Compare two byte strings without branching on their content.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Hash both sides first so neither the content nor the length of the
/// expected secret influences timing.
pub fn secrets_match(supplied: &str, expected: &str) -> bool {
    let a = Sha256::digest(supplied.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    constant_time_eq(&a, &b) && !expected.is_empty()
}

impl AdminGate {
    pub fn new(source: SecretSource, store: JsonStore) -> Self {
        Self { source, store }
    }

    async fn expected_secret(&self) -> AppResult<String> {
        match &self.source {
            SecretSource::Daily(manager) => manager.current_password().await,
            SecretSource::StaticFile(path) => load_secret_file(path).await,
        }
    }

    pub async fn verify(&self, supplied: &str) -> AppResult<bool> {
        let supplied = supplied.trim();
        if supplied.is_empty() {
            return Ok(false);
        }
        let expected = self.expected_secret().await?;
        Ok(secrets_match(supplied, expected.trim()))
    }

    pub async fn is_admin_ip(&self, ip: &str) -> bool {
        load_admin_ips(&self.store)
            .await
            .map(|ips| ips.iter().any(|allowed| allowed == ip))
            .unwrap_or_else(|e| {
                warn!("Could not read admin allowlist: {e}");
                false
            })
    }

    /// Full admin check used by every protected route.
    pub async fn authorize(&self, supplied: Option<&str>, ip: &ClientIp) -> AppResult<()> {
        let supplied = supplied.map(str::trim).unwrap_or_default();
        if supplied.is_empty() {
            warn!(ip = %ip, "Admin request without password");
            return Err(AppError::Unauthorized("Admin password required".to_string()));
        }

        if !self.verify(supplied).await? {
            warn!(ip = %ip, "Failed admin authentication");
            return Err(AppError::Unauthorized("Invalid admin password".to_string()));
        }

        if !self.is_admin_ip(ip.as_str()).await {
            warn!(ip = %ip, "Correct admin password from an IP outside the allowlist");
            return Err(AppError::Forbidden("Access denied".to_string()));
        }

        Ok(())
    }
}

async fn load_secret_file(path: &Path) -> AppResult<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(secret) => {
            let secret = secret.trim().to_string();
            if secret.is_empty() {
                return Err(AppError::Storage(format!("{} is empty", path.display())));
            }
            Ok(secret)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let secret = generate_password(20);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, &secret).await?;
            restrict_permissions(path).await;
            warn!(
                "Admin secret file {} was missing; generated a new random secret there",
                path.display()
            );
            Ok(secret)
        }
        Err(e) => Err(AppError::Storage(format!("reading {}: {e}", path.display()))),
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await {
        warn!("Could not restrict permissions on {}: {e}", path.display());
    }
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) {}
