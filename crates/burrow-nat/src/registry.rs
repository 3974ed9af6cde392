//! Connection Method Registry
//!
//! Remembers, per peer, the method and address that last produced a
//! connection so the orchestrator can try it first next time. The registry
//! is a cache: callers treat every error it returns as non-fatal.
//!
//! Whether a cached method is still trusted is decided by a
//! [`RegistryPolicy`]: entries can be distrusted after a number of
//! consecutive failed preferred attempts, or once they are older than a
//! maximum age.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::method::ConnectionMethod;

/// Registry storage errors
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Backing file could not be read or written
    #[error("Registry I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backing file is not valid registry JSON
    #[error("Registry serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The method that last worked for a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Method that succeeded
    pub method: ConnectionMethod,
    /// Remote address the method connected to, if known
    pub remote: Option<SocketAddr>,
    /// When the success was recorded
    pub recorded_at: SystemTime,
    /// Failed preferred attempts since the success
    #[serde(default)]
    pub consecutive_failures: u32,
}

impl RegistryEntry {
    /// Entry recorded now
    #[must_use]
    pub fn new(method: ConnectionMethod, remote: Option<SocketAddr>) -> Self {
        Self {
            method,
            remote,
            recorded_at: SystemTime::now(),
            consecutive_failures: 0,
        }
    }

    /// Age of the entry at `now`; zero if the clock went backwards
    #[must_use]
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.recorded_at).unwrap_or_default()
    }
}

/// When a cached method stops being trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryPolicy {
    /// Distrust after this many failed preferred attempts; zero never
    pub max_consecutive_failures: u32,
    /// Distrust entries older than this; `None` never
    #[serde(
        default,
        with = "crate::config::opt_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_age: Option<Duration>,
}

impl Default for RegistryPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
            max_age: None,
        }
    }
}

impl RegistryPolicy {
    /// Keep every entry forever
    #[must_use]
    pub const fn trust_forever() -> Self {
        Self {
            max_consecutive_failures: 0,
            max_age: None,
        }
    }

    /// Whether `entry` may still be promoted at `now`
    #[must_use]
    pub fn is_trusted(&self, entry: &RegistryEntry, now: SystemTime) -> bool {
        if self.max_consecutive_failures > 0
            && entry.consecutive_failures >= self.max_consecutive_failures
        {
            return false;
        }
        if let Some(max_age) = self.max_age {
            if entry.age(now) > max_age {
                return false;
            }
        }
        true
    }
}

/// Per-peer method cache
#[async_trait]
pub trait MethodRegistry: Send + Sync {
    /// Entry for `peer_id`, if any
    async fn get(&self, peer_id: &str) -> Result<Option<RegistryEntry>, RegistryError>;

    /// Record a success, replacing any previous entry
    async fn put(
        &self,
        peer_id: &str,
        method: ConnectionMethod,
        remote: Option<SocketAddr>,
    ) -> Result<(), RegistryError>;

    /// Record that the cached `method` failed for `peer_id`
    ///
    /// Returns the new consecutive failure count, or zero when the entry is
    /// missing or records a different method.
    async fn record_failure(
        &self,
        peer_id: &str,
        method: ConnectionMethod,
    ) -> Result<u32, RegistryError>;

    /// Forget `peer_id`
    async fn remove(&self, peer_id: &str) -> Result<(), RegistryError>;
}

fn bump_failure(
    entries: &mut HashMap<String, RegistryEntry>,
    peer_id: &str,
    method: ConnectionMethod,
) -> u32 {
    match entries.get_mut(peer_id) {
        Some(entry) if entry.method == method => {
            entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
            entry.consecutive_failures
        }
        _ => 0,
    }
}

/// In-memory registry
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    entries: Mutex<HashMap<String, RegistryEntry>>,
}

impl MemoryRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of peers recorded
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether nothing is recorded
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Insert an entry as-is
    pub async fn insert(&self, peer_id: impl Into<String>, entry: RegistryEntry) {
        self.entries.lock().await.insert(peer_id.into(), entry);
    }
}

#[async_trait]
impl MethodRegistry for MemoryRegistry {
    async fn get(&self, peer_id: &str) -> Result<Option<RegistryEntry>, RegistryError> {
        Ok(self.entries.lock().await.get(peer_id).cloned())
    }

    async fn put(
        &self,
        peer_id: &str,
        method: ConnectionMethod,
        remote: Option<SocketAddr>,
    ) -> Result<(), RegistryError> {
        self.entries
            .lock()
            .await
            .insert(peer_id.to_string(), RegistryEntry::new(method, remote));
        Ok(())
    }

    async fn record_failure(
        &self,
        peer_id: &str,
        method: ConnectionMethod,
    ) -> Result<u32, RegistryError> {
        Ok(bump_failure(&mut *self.entries.lock().await, peer_id, method))
    }

    async fn remove(&self, peer_id: &str) -> Result<(), RegistryError> {
        self.entries.lock().await.remove(peer_id);
        Ok(())
    }
}

/// Registry persisted as a JSON object keyed by peer id
///
/// The file is loaded lazily on first access and rewritten atomically
/// (temporary file then rename) after every change.
#[derive(Debug)]
pub struct JsonFileRegistry {
    path: PathBuf,
    entries: Mutex<Option<HashMap<String, RegistryEntry>>>,
}

impl JsonFileRegistry {
    /// Registry backed by `path`; the file need not exist yet
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Mutex::new(None),
        }
    }

    /// Backing file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<HashMap<String, RegistryEntry>, RegistryError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Registry file not found, starting empty");
                Ok(HashMap::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, entries: &HashMap<String, RegistryEntry>) -> Result<(), RegistryError> {
        let contents = serde_json::to_vec_pretty(entries)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, contents).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            warn!(path = %self.path.display(), error = %e, "Failed to replace registry file");
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Run `f` against the loaded entries, persisting if it reports a change
    async fn update<T: Send>(
        &self,
        f: impl FnOnce(&mut HashMap<String, RegistryEntry>) -> (T, bool) + Send,
    ) -> Result<T, RegistryError> {
        let mut guard = self.entries.lock().await;
        if guard.is_none() {
            *guard = Some(self.load().await?);
        }
        let entries = guard.get_or_insert_with(HashMap::new);
        let (value, changed) = f(entries);
        if changed {
            self.store(entries).await?;
        }
        Ok(value)
    }
}

#[async_trait]
impl MethodRegistry for JsonFileRegistry {
    async fn get(&self, peer_id: &str) -> Result<Option<RegistryEntry>, RegistryError> {
        self.update(|entries| (entries.get(peer_id).cloned(), false))
            .await
    }

    async fn put(
        &self,
        peer_id: &str,
        method: ConnectionMethod,
        remote: Option<SocketAddr>,
    ) -> Result<(), RegistryError> {
        self.update(|entries| {
            entries.insert(peer_id.to_string(), RegistryEntry::new(method, remote));
            ((), true)
        })
        .await
    }

    async fn record_failure(
        &self,
        peer_id: &str,
        method: ConnectionMethod,
    ) -> Result<u32, RegistryError> {
        self.update(|entries| {
            let count = bump_failure(entries, peer_id, method);
            (count, count > 0)
        })
        .await
    }

    async fn remove(&self, peer_id: &str) -> Result<(), RegistryError> {
        self.update(|entries| ((), entries.remove(peer_id).is_some()))
            .await
    }
}
