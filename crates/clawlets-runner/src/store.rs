//! TTL-bounded, take-once storage of submitted job secrets.
//!
//! One entry per job id; a new submission replaces the old one and restarts
//! its TTL. [`SecretStore::take`] removes the entry it returns, so a secret
//! set is handed out at most once. Expired entries are dropped on every
//! `take` and by the buffer's periodic reaper, and secret values are
//! zeroized when an entry is dropped.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;
use zeroize::Zeroize;

use clawlets_core::exec::deadline_after;

/// Smallest TTL a store will use.
pub const MIN_TTL: Duration = Duration::from_secs(10);

/// Largest TTL a store will use.
pub const MAX_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(2);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// TTL actually applied for a requested TTL.
#[must_use]
pub fn effective_ttl(requested: Duration) -> Duration {
    requested.clamp(MIN_TTL, MAX_TTL)
}

/// Reaper period for a requested TTL: a quarter of the effective TTL,
/// clamped to 2..=30 seconds.
#[must_use]
pub fn sweep_interval(requested: Duration) -> Duration {
    (effective_ttl(requested) / 4).clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL)
}

/// Secret name to value map. Values are wiped on drop and never printed.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretMap(BTreeMap<String, String>);

impl SecretMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON object, keeping only non-empty keys with string
    /// values.
    #[must_use]
    pub fn from_json_object(object: &serde_json::Map<String, serde_json::Value>) -> Self {
        object
            .iter()
            .filter(|(key, _)| !key.is_empty())
            .filter_map(|(key, value)| value.as_str().map(|v| (key.clone(), v.to_owned())))
            .collect()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SecretMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl Drop for SecretMap {
    fn drop(&mut self) {
        for value in self.0.values_mut() {
            value.zeroize();
        }
    }
}

impl fmt::Debug for SecretMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretMap")
            .field("keys", &self.0.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

struct Entry {
    secrets: SecretMap,
    expires_at: Instant,
}

/// In-memory job secrets keyed by job id.
pub struct SecretStore {
    entries: Mutex<HashMap<String, Entry>>,
    ttl: Duration,
}

impl SecretStore {
    /// Create a store; `ttl` is clamped to [`MIN_TTL`]..=[`MAX_TTL`].
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: effective_ttl(ttl),
        }
    }

    /// The effective TTL.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// How often expired entries should be swept.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        sweep_interval(self.ttl)
    }

    /// Store `secrets` for `job_id`, replacing any previous entry.
    /// Returns the number of secrets stored.
    pub fn submit(&self, job_id: &str, secrets: SecretMap) -> usize {
        let accepted = secrets.len();
        let entry = Entry {
            secrets,
            expires_at: deadline_after(Instant::now(), self.ttl),
        };
        // The replaced entry, if any, is dropped (and wiped) here.
        self.lock().insert(job_id.to_owned(), entry);
        accepted
    }

    /// Remove and return the live secrets for `job_id`.
    ///
    /// Returns `None` if nothing was submitted, the entry expired, or it was
    /// already taken.
    pub fn take(&self, job_id: &str) -> Option<SecretMap> {
        let mut entries = self.lock();
        purge(&mut entries, Instant::now());
        entries
            .remove(job_id)
            .map(|mut entry| std::mem::take(&mut entry.secrets))
    }

    /// Drop every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        purge(&mut self.lock(), Instant::now())
    }

    /// Number of buffered entries, expired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        // No code path panics while holding the lock, but a poisoned map is
        // still structurally valid.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretStore")
            .field("entries", &self.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

fn purge(entries: &mut HashMap<String, Entry>, now: Instant) -> usize {
    let before = entries.len();
    entries.retain(|_, entry| entry.expires_at > now);
    let purged = before - entries.len();
    if purged > 0 {
        debug!(purged, "dropped expired secret entries");
    }
    purged
}
