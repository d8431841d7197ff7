//! Secure key-value storage for long-lived credentials.
//!
//! The file-backed store keeps a flat JSON map in `<home>/credentials.json`
//! with restricted permissions (0600). Values are never logged.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use courier_types::{AuthError, AuthResult};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use crate::config::paths;

/// Storage key of the persisted refresh token.
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

/// Persists and retrieves secrets.
pub trait SecureStorage: Send + Sync {
    fn get(&self, key: &str) -> BoxFuture<'_, AuthResult<Option<String>>>;
    fn set(&self, key: &str, value: &str) -> BoxFuture<'_, AuthResult<()>>;
    fn remove(&self, key: &str) -> BoxFuture<'_, AuthResult<()>>;
}

/// Reads the stored refresh token, treating an empty value as absent.
///
/// # Errors
/// Returns `Storage` if the backend fails.
pub async fn load_refresh_token(storage: &dyn SecureStorage) -> AuthResult<Option<String>> {
    let token = storage.get(REFRESH_TOKEN_KEY).await?;
    Ok(token.filter(|token| !token.trim().is_empty()))
}

/// Overwrites the stored refresh token when the server issued one.
///
/// # Errors
/// Returns `Storage` if the backend fails.
pub async fn store_refresh_token_if_present(
    storage: &dyn SecureStorage,
    token: Option<&str>,
) -> AuthResult<()> {
    match token.filter(|token| !token.is_empty()) {
        Some(token) => storage.set(REFRESH_TOKEN_KEY, token).await,
        None => Ok(()),
    }
}

/// JSON file storage.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
    // Serialises read-modify-write cycles within this process.
    lock: Arc<Mutex<()>>,
}

impl Default for FileStorage {
    fn default() -> Self {
        Self::new(paths::credentials_path())
    }
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Result<BTreeMap<String, String>> {
        if !path.exists() {
            return Ok(BTreeMap::new());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read credentials from {}", path.display()))?;
        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse credentials from {}", path.display()))
    }

    fn save(path: &Path, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let contents =
            serde_json::to_string_pretty(entries).context("Failed to serialize credentials")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(path)
                .with_context(|| format!("Failed to open {} for writing", path.display()))?;
            file.write_all(contents.as_bytes())
                .with_context(|| format!("Failed to write to {}", path.display()))?;
        }

        #[cfg(not(unix))]
        {
            fs::write(path, contents)
                .with_context(|| format!("Failed to write to {}", path.display()))?;
        }

        Ok(())
    }

    /// Runs a blocking read-modify-write cycle off the async runtime.
    async fn with_entries<T, F>(&self, op: F) -> AuthResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Path, &mut BTreeMap<String, String>) -> Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        let lock = Arc::clone(&self.lock);
        tokio::task::spawn_blocking(move || {
            let _guard = lock
                .lock()
                .map_err(|_poisoned| anyhow::anyhow!("credentials lock poisoned"))?;
            let mut entries = Self::load(&path)?;
            op(&path, &mut entries)
        })
        .await
        .map_err(AuthError::storage)?
        .map_err(|err| AuthError::storage(format!("{err:#}")))
    }
}

impl SecureStorage for FileStorage {
    fn get(&self, key: &str) -> BoxFuture<'_, AuthResult<Option<String>>> {
        let key = key.to_string();
        self.with_entries(move |_, entries| Ok(entries.get(&key).cloned()))
            .boxed()
    }

    fn set(&self, key: &str, value: &str) -> BoxFuture<'_, AuthResult<()>> {
        let key = key.to_string();
        let value = value.to_string();
        self.with_entries(move |path, entries| {
            if entries.get(&key) == Some(&value) {
                return Ok(());
            }
            entries.insert(key, value);
            Self::save(path, entries)
        })
        .boxed()
    }

    fn remove(&self, key: &str) -> BoxFuture<'_, AuthResult<()>> {
        let key = key.to_string();
        self.with_entries(move |path, entries| {
            if entries.remove(&key).is_some() {
                Self::save(path, entries)?;
            }
            Ok(())
        })
        .boxed()
    }
}

/// In-process storage; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_entry(self, key: &str, value: &str) -> Self {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), value.to_string());
        }
        self
    }

    fn entries(&self) -> AuthResult<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_poisoned| AuthError::storage("memory storage lock poisoned"))
    }
}

impl SecureStorage for MemoryStorage {
    fn get(&self, key: &str) -> BoxFuture<'_, AuthResult<Option<String>>> {
        let result = self.entries().map(|entries| entries.get(key).cloned());
        futures_util::future::ready(result).boxed()
    }

    fn set(&self, key: &str, value: &str) -> BoxFuture<'_, AuthResult<()>> {
        let result = self.entries().map(|mut entries| {
            entries.insert(key.to_string(), value.to_string());
        });
        futures_util::future::ready(result).boxed()
    }

    fn remove(&self, key: &str) -> BoxFuture<'_, AuthResult<()>> {
        let result = self.entries().map(|mut entries| {
            entries.remove(key);
        });
        futures_util::future::ready(result).boxed()
    }
}
