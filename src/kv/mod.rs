//! Per-guild key-value scratchpad for scripts.
//!
//! [`KvStore`] is the storage backend (injected by the host); [`GuildKv`]
//! is the bridge scripts go through. The bridge owns the limits and the
//! value encoding; backends only guarantee per-key atomicity and enforce the
//! key quota atomically for writes that create a key.

pub mod bridge;
pub mod file;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::values::ValueError;

pub use bridge::GuildKv;
pub use file::FileKvStore;
pub use memory::MemoryKvStore;

/// Maximum key length in bytes.
pub const MAX_KV_KEY_LENGTH: usize = 256;

/// Maximum encoded value length in bytes.
pub const MAX_KV_VALUE_LENGTH: usize = 16 * 1024;

/// A stored entry. `value` holds the tagged JSON text of the script value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KvEntry {
    pub guild_id: String,
    pub key: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KvEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Error)]
pub enum KvError {
    #[error("key exceeds maximum length of {max}")]
    KeyTooLong { max: usize },

    #[error("value exceeds maximum length of {max}")]
    ValueTooLong { max: usize },

    #[error("maximum number of keys reached: {max}")]
    QuotaExceeded { max: usize },

    #[error("value stored at '{key}' is not numeric (found {found})")]
    TypeMismatch { key: String, found: String },

    #[error("increasing '{key}' overflows")]
    Overflow { key: String },

    #[error("invalid guild id: {0}")]
    InvalidGuild(String),

    #[error(transparent)]
    Value(#[from] ValueError),

    #[error("KV backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Limits applied by [`GuildKv`]. `max_keys` comes from the guild's plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvLimits {
    pub max_key_length: usize,
    pub max_value_length: usize,
    pub max_keys: usize,
}

impl KvLimits {
    pub fn with_max_keys(max_keys: usize) -> Self {
        Self {
            max_key_length: MAX_KV_KEY_LENGTH,
            max_value_length: MAX_KV_VALUE_LENGTH,
            max_keys,
        }
    }
}

/// Read-modify-write callback used by [`KvStore::update`].
///
/// Receives the current live entry (if any) and returns the new value text.
pub type UpdateFn<'a> = &'a (dyn Fn(Option<&KvEntry>) -> Result<String, KvError> + Send + Sync);

/// Storage backend for KV entries.
///
/// Implementations must be safe for concurrent use by many runs and make
/// `set`, `update` and `delete` atomic per key. Expired entries are never
/// returned and do not count toward the quota.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, guild_id: &str, key: &str) -> Result<Option<KvEntry>, KvError>;

    /// Inserts or replaces an entry. Creating a new key fails with
    /// [`KvError::QuotaExceeded`] when the guild already holds `max_keys`.
    async fn set(&self, entry: KvEntry, max_keys: usize) -> Result<(), KvError>;

    /// Atomically replaces the value of `key` with the result of `apply`.
    async fn update(
        &self,
        guild_id: &str,
        key: &str,
        max_keys: usize,
        apply: UpdateFn<'_>,
    ) -> Result<KvEntry, KvError>;

    /// Removes an entry, returning it if it existed.
    async fn delete(&self, guild_id: &str, key: &str) -> Result<Option<KvEntry>, KvError>;

    async fn count(&self, guild_id: &str) -> Result<usize, KvError>;

    /// Entries whose key matches a LIKE pattern (`%` any run, `_` one char).
    async fn search(&self, guild_id: &str, pattern: &str) -> Result<Vec<KvEntry>, KvError>;
}

// ── Keyspace ─────────────────────────────────────────────

/// The entries of one guild. Shared bookkeeping for the in-process backends.
#[derive(Debug, Default, Clone)]
pub(crate) struct Keyspace {
    entries: BTreeMap<String, KvEntry>,
}

impl Keyspace {
    pub(crate) fn from_entries(entries: impl IntoIterator<Item = KvEntry>) -> Self {
        Self {
            entries: entries.into_iter().map(|e| (e.key.clone(), e)).collect(),
        }
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &KvEntry> {
        self.entries.values()
    }

    /// Drops expired entries, returning how many were removed.
    pub(crate) fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before - self.entries.len()
    }

    pub(crate) fn get(&self, key: &str, now: DateTime<Utc>) -> Option<&KvEntry> {
        self.entries.get(key).filter(|e| !e.is_expired(now))
    }

    pub(crate) fn count(&self, now: DateTime<Utc>) -> usize {
        self.entries.values().filter(|e| !e.is_expired(now)).count()
    }

    pub(crate) fn set(
        &mut self,
        entry: KvEntry,
        max_keys: usize,
        now: DateTime<Utc>,
    ) -> Result<(), KvError> {
        self.purge_expired(now);
        let created_at = match self.entries.get(&entry.key) {
            Some(existing) => existing.created_at,
            None if self.entries.len() >= max_keys => {
                return Err(KvError::QuotaExceeded { max: max_keys })
            }
            None => entry.created_at,
        };
        self.entries
            .insert(entry.key.clone(), KvEntry { created_at, ..entry });
        Ok(())
    }

    pub(crate) fn update(
        &mut self,
        guild_id: &str,
        key: &str,
        max_keys: usize,
        apply: UpdateFn<'_>,
        now: DateTime<Utc>,
    ) -> Result<KvEntry, KvError> {
        self.purge_expired(now);
        let next = match self.entries.get(key) {
            Some(current) => KvEntry {
                value: apply(Some(current))?,
                updated_at: now,
                ..current.clone()
            },
            None if self.entries.len() >= max_keys => {
                return Err(KvError::QuotaExceeded { max: max_keys })
            }
            None => KvEntry {
                guild_id: guild_id.to_string(),
                key: key.to_string(),
                value: apply(None)?,
                expires_at: None,
                created_at: now,
                updated_at: now,
            },
        };
        self.entries.insert(key.to_string(), next.clone());
        Ok(next)
    }

    pub(crate) fn delete(&mut self, key: &str, now: DateTime<Utc>) -> Option<KvEntry> {
        self.purge_expired(now);
        self.entries.remove(key)
    }

    pub(crate) fn search(&self, pattern: &str, now: DateTime<Utc>) -> Vec<KvEntry> {
        self.entries
            .values()
            .filter(|e| !e.is_expired(now) && like_match(pattern, &e.key))
            .cloned()
            .collect()
    }
}

/// SQL LIKE matching: `%` matches any run of characters, `_` exactly one.
pub fn like_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && p[pi] == '%' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if pi < p.len() && (p[pi] == '_' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if let Some((star, mark)) = backtrack {
            pi = star + 1;
            ti = mark + 1;
            backtrack = Some((star, mark + 1));
        } else {
            return false;
        }
    }

    p[pi..].iter().all(|&c| c == '%')
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(key: &str, value: &str) -> KvEntry {
        let now = Utc::now();
        KvEntry {
            guild_id: "1".to_string(),
            key: key.to_string(),
            value: value.to_string(),
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_like_match() {
        assert!(like_match("score", "score"));
        assert!(!like_match("score", "scores"));
        assert!(like_match("score:%", "score:1234"));
        assert!(like_match("score:%", "score:"));
        assert!(like_match("%:1234", "score:1234"));
        assert!(like_match("s_ore", "score"));
        assert!(!like_match("s_ore", "sore"));
        assert!(like_match("%", ""));
        assert!(like_match("%a%b%", "xxaxxbxx"));
        assert!(!like_match("%a%b%", "xxbxxaxx"));
    }

    #[test]
    fn test_keyspace_quota_only_for_new_keys() {
        let now = Utc::now();
        let mut space = Keyspace::default();
        space.set(entry("a", "1"), 2, now).unwrap();
        space.set(entry("b", "2"), 2, now).unwrap();

        // Overwriting an existing key does not grow the keyspace
        space.set(entry("a", "3"), 2, now).unwrap();
        assert_eq!(space.get("a", now).unwrap().value, "3");

        let err = space.set(entry("c", "4"), 2, now).unwrap_err();
        assert!(matches!(err, KvError::QuotaExceeded { max: 2 }));
    }

    #[test]
    fn test_keyspace_overwrite_keeps_created_at() {
        let now = Utc::now();
        let mut space = Keyspace::default();
        let mut first = entry("a", "1");
        first.created_at = now - Duration::hours(1);
        space.set(first.clone(), 10, now).unwrap();
        space.set(entry("a", "2"), 10, now).unwrap();

        assert_eq!(space.get("a", now).unwrap().created_at, first.created_at);
    }

    #[test]
    fn test_keyspace_expired_entries_are_absent() {
        let now = Utc::now();
        let mut space = Keyspace::default();
        let mut expiring = entry("temp", "1");
        expiring.expires_at = Some(now - Duration::seconds(1));
        space.entries.insert("temp".to_string(), expiring);

        assert!(space.get("temp", now).is_none());
        assert_eq!(space.count(now), 0);

        // Expired keys do not count toward the quota
        space.set(entry("fresh", "1"), 1, now).unwrap();
        assert_eq!(space.count(now), 1);
    }

    #[test]
    fn test_keyspace_update_applies_to_current() {
        let now = Utc::now();
        let mut space = Keyspace::default();
        let apply = |current: Option<&KvEntry>| -> Result<String, KvError> {
            Ok(match current {
                Some(e) => format!("{}+", e.value),
                None => "0".to_string(),
            })
        };

        assert_eq!(space.update("1", "n", 10, &apply, now).unwrap().value, "0");
        assert_eq!(space.update("1", "n", 10, &apply, now).unwrap().value, "0+");
    }
}
