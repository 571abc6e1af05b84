//! Flat-file JSON persistence.
//!
//! Each logical document lives in its own pretty-printed file under the data
//! directory. Every mutation reads the whole document, changes it in memory and
//! writes it back. There is no locking between writers; the last writer wins.

use serde::{de::DeserializeOwned, Serialize};
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tracing::warn;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Document {
    AdminIps,
    Mods,
    DailyPassword,
    Hotspots,
    UtmEvents,
}

impl Document {
    pub fn file_name(self) -> &'static str {
        match self {
            Document::AdminIps => "admin_ips.json",
            Document::Mods => "mods.json",
            Document::DailyPassword => "daily_password.json",
            Document::Hotspots => "hotspots.json",
            Document::UtmEvents => "utm_data.json",
        }
    }
}

#[derive(Clone, Debug)]
pub struct JsonStore {
    data_dir: PathBuf,
}

impl JsonStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub async fn init(&self) -> AppResult<()> {
        fs::create_dir_all(&self.data_dir).await?;
        Ok(())
    }

    pub fn path(&self, doc: Document) -> PathBuf {
        self.data_dir.join(doc.file_name())
    }

    /// `Ok(None)` when the file does not exist; a storage error when it exists but
    /// cannot be read or decoded.
    pub async fn load<T: DeserializeOwned>(&self, doc: Document) -> AppResult<Option<T>> {
        let path = self.path(doc);
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(AppError::Storage(format!("reading {}: {e}", path.display())));
            }
        };

        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| AppError::Storage(format!("decoding {}: {e}", path.display())))
    }

    /// Strict load for write paths: absent means default, corrupt fails the request.
    pub async fn load_or_default<T: DeserializeOwned + Default>(&self, doc: Document) -> AppResult<T> {
        Ok(self.load(doc).await?.unwrap_or_default())
    }

    /// Lenient load for read paths: any failure falls back to the default.
    pub async fn read_or_default<T: DeserializeOwned + Default>(&self, doc: Document) -> T {
        match self.load(doc).await {
            Ok(value) => value.unwrap_or_default(),
            Err(e) => {
                warn!(document = doc.file_name(), "falling back to empty document: {e}");
                T::default()
            }
        }
    }

    pub async fn save<T: Serialize + ?Sized>(&self, doc: Document, value: &T) -> AppResult<()> {
        let path = self.path(doc);
        let encoded = serde_json::to_vec_pretty(value)?;

        fs::create_dir_all(&self.data_dir).await?;
        // Each writer gets its own temp file; concurrent saves of one document
        // may lose updates but never fail or leave torn JSON behind.
        let tmp = self.data_dir.join(format!(
            "{}.{}.tmp",
            doc.file_name(),
            Uuid::new_v4().simple()
        ));
        fs::write(&tmp, encoded)
            .await
            .map_err(|e| AppError::Storage(format!("writing {}: {e}", tmp.display())))?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(AppError::Storage(format!("replacing {}: {e}", path.display())));
        }
        Ok(())
    }

    /// Load, push, keep the newest `cap` entries, save. Returns the stored length.
    pub async fn append_capped<T>(&self, doc: Document, item: T, cap: usize) -> AppResult<usize>
    where
        T: Serialize + DeserializeOwned,
    {
        let mut items: Vec<T> = self.load_or_default(doc).await?;
        push_capped(&mut items, item, cap);
        self.save(doc, &items).await?;
        Ok(items.len())
    }
}

/// Append `item` and drop the oldest entries beyond `cap`, keeping relative order.
pub fn push_capped<T>(items: &mut Vec<T>, item: T, cap: usize) {
    items.push(item);
    if items.len() > cap {
        let excess = items.len() - cap;
        items.drain(..excess);
    }
}

/// The newest `n` entries, oldest first.
pub fn tail<T: Clone>(items: &[T], n: usize) -> Vec<T> {
    items[items.len().saturating_sub(n)..].to_vec()
}
