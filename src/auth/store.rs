//! Token persistence.
//!
//! The broker stores one [`AccessToken`] per cache key. Keys are built by
//! [`delegated_key`] and [`application_key`]. Writes are last-write-wins.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::RwLock;

use directories::ProjectDirs;
use tracing::{debug, error};

use super::token::AccessToken;
use crate::error::StoreError;

/// Store file name.
const STORE_FILE: &str = "token_cache.json";

/// Key prefix shared by every delegated token of one principal.
pub fn principal_prefix(principal_id: &str) -> String {
    format!("delegated:{}:", principal_id)
}

/// Cache key for a delegated token.
pub fn delegated_key(principal_id: &str, scope: &str) -> String {
    format!("{}{}", principal_prefix(principal_id), scope.to_ascii_lowercase())
}

/// Cache key for an application-only token.
pub fn application_key(tenant: &str, scope: &str) -> String {
    format!(
        "application:{}:{}",
        tenant.to_ascii_lowercase(),
        scope.to_ascii_lowercase()
    )
}

/// Key-value storage for cached tokens.
pub trait TokenStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<AccessToken>, StoreError>;
    fn put(&self, key: &str, token: &AccessToken) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
    /// All entries whose key starts with `prefix`.
    fn with_prefix(&self, prefix: &str) -> Result<Vec<(String, AccessToken)>, StoreError>;
    /// Remove every entry whose key starts with `prefix`.
    fn remove_prefix(&self, prefix: &str) -> Result<usize, StoreError>;
}

/// In-process token store.
#[derive(Default)]
pub struct MemoryTokenStore {
    entries: RwLock<HashMap<String, AccessToken>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> StoreError {
    StoreError::ReadFailed("store lock poisoned".into())
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, key: &str) -> Result<Option<AccessToken>, StoreError> {
        Ok(self.entries.read().map_err(|_| poisoned())?.get(key).cloned())
    }

    fn put(&self, key: &str, token: &AccessToken) -> Result<(), StoreError> {
        self.entries
            .write()
            .map_err(|_| poisoned())?
            .insert(key.to_string(), token.clone());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().map_err(|_| poisoned())?.remove(key);
        Ok(())
    }

    fn with_prefix(&self, prefix: &str) -> Result<Vec<(String, AccessToken)>, StoreError> {
        Ok(self
            .entries
            .read()
            .map_err(|_| poisoned())?
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn remove_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        Ok(before - entries.len())
    }
}

/// Token store persisted as a JSON file.
///
/// The whole file is rewritten on every change; the lock serializes writers
/// within this process.
pub struct FileTokenStore {
    path: PathBuf,
    lock: RwLock<()>,
}

impl FileTokenStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: RwLock::new(()),
        }
    }

    /// Get the default path of the store file.
    ///
    /// Returns e.g. `~/.cache/m365-broker/token_cache.json` on Linux.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "m365", "m365-broker").map(|dirs| dirs.cache_dir().join(STORE_FILE))
    }

    fn read_all(&self) -> Result<HashMap<String, AccessToken>, StoreError> {
        if !self.path.exists() {
            debug!("Token store {:?} does not exist yet", self.path);
            return Ok(HashMap::new());
        }

        let content = fs::read_to_string(&self.path)?;
        match serde_json::from_str(&content) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                // A corrupt cache is recoverable: tokens can be re-derived.
                error!("Failed to parse token store {:?}: {}, starting empty", self.path, e);
                Ok(HashMap::new())
            }
        }
    }

    fn write_all(&self, entries: &HashMap<String, AccessToken>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(entries)
            .map_err(|e| StoreError::WriteFailed(e.to_string()))?;

        // Write a private sibling file, then rename it over the store.
        let staging = self.path.with_extension("json.tmp");
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&staging)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            // `mode` only applies when the file is created.
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&staging, &self.path)?;

        debug!("Saved {} token(s) to {:?}", entries.len(), self.path);
        Ok(())
    }
}

impl TokenStore for FileTokenStore {
    fn get(&self, key: &str) -> Result<Option<AccessToken>, StoreError> {
        let _guard = self.lock.read().map_err(|_| poisoned())?;
        Ok(self.read_all()?.remove(key))
    }

    fn put(&self, key: &str, token: &AccessToken) -> Result<(), StoreError> {
        let _guard = self.lock.write().map_err(|_| poisoned())?;
        let mut entries = self.read_all()?;
        entries.insert(key.to_string(), token.clone());
        self.write_all(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.lock.write().map_err(|_| poisoned())?;
        let mut entries = self.read_all()?;
        if entries.remove(key).is_some() {
            self.write_all(&entries)?;
        }
        Ok(())
    }

    fn with_prefix(&self, prefix: &str) -> Result<Vec<(String, AccessToken)>, StoreError> {
        let _guard = self.lock.read().map_err(|_| poisoned())?;
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .collect())
    }

    fn remove_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let _guard = self.lock.write().map_err(|_| poisoned())?;
        let mut entries = self.read_all()?;
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        let removed = before - entries.len();
        if removed > 0 {
            self.write_all(&entries)?;
        }
        Ok(removed)
    }
}
