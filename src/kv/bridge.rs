use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rhai::Dynamic;
use tracing::debug;

use super::{KvEntry, KvError, KvLimits, KvStore};
use crate::values;

/// The KV surface of one run, bound to the invoking guild.
///
/// Validates keys and values, encodes script values, and forwards to the
/// injected [`KvStore`].
#[derive(Clone)]
pub struct GuildKv {
    guild_id: String,
    store: Arc<dyn KvStore>,
    limits: KvLimits,
}

impl GuildKv {
    pub fn new(guild_id: impl Into<String>, store: Arc<dyn KvStore>, limits: KvLimits) -> Self {
        Self {
            guild_id: guild_id.into(),
            store,
            limits,
        }
    }

    pub fn guild_id(&self) -> &str {
        &self.guild_id
    }

    pub fn limits(&self) -> KvLimits {
        self.limits
    }

    fn check_key(&self, key: &str) -> Result<(), KvError> {
        if key.len() > self.limits.max_key_length {
            return Err(KvError::KeyTooLong {
                max: self.limits.max_key_length,
            });
        }
        Ok(())
    }

    /// Stores `value` under `key`, optionally expiring after `ttl`.
    pub async fn set(&self, key: &str, value: &Dynamic, ttl: Option<Duration>) -> Result<(), KvError> {
        self.check_key(key)?;
        let raw = values::to_json_string(value)?;
        if raw.len() > self.limits.max_value_length {
            return Err(KvError::ValueTooLong {
                max: self.limits.max_value_length,
            });
        }

        let now = Utc::now();
        // A TTL too large to represent means no expiry.
        let expires_at = ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| now.checked_add_signed(ttl));
        let entry = KvEntry {
            guild_id: self.guild_id.clone(),
            key: key.to_string(),
            value: raw,
            expires_at,
            created_at: now,
            updated_at: now,
        };

        self.store.set(entry, self.limits.max_keys).await?;
        debug!(guild = %self.guild_id, key, "KV set");
        Ok(())
    }

    /// The stored value, or unit when absent or expired.
    pub async fn get(&self, key: &str) -> Result<Dynamic, KvError> {
        match self.store.get(&self.guild_id, key).await? {
            Some(entry) => Ok(values::from_json_str(&entry.value)?),
            None => Ok(Dynamic::UNIT),
        }
    }

    /// Removes `key`, returning its prior value or unit.
    pub async fn delete(&self, key: &str) -> Result<Dynamic, KvError> {
        match self.store.delete(&self.guild_id, key).await? {
            Some(entry) => {
                debug!(guild = %self.guild_id, key, "KV delete");
                Ok(values::from_json_str(&entry.value)?)
            }
            None => Ok(Dynamic::UNIT),
        }
    }

    /// Atomically adds `delta` to the numeric value at `key`.
    ///
    /// An absent key starts at 0. Integers stay integers and floats stay
    /// floats; anything else fails with [`KvError::TypeMismatch`].
    pub async fn increase(&self, key: &str, delta: i64) -> Result<Dynamic, KvError> {
        self.check_key(key)?;
        let owned_key = key.to_string();
        let apply = move |current: Option<&KvEntry>| -> Result<String, KvError> {
            let next = match current {
                None => Dynamic::from(delta),
                Some(entry) => {
                    let value = values::from_json_str(&entry.value)?;
                    if let Ok(n) = value.as_int() {
                        let sum = n.checked_add(delta).ok_or_else(|| KvError::Overflow {
                            key: owned_key.clone(),
                        })?;
                        Dynamic::from(sum)
                    } else if let Ok(f) = value.as_float() {
                        Dynamic::from(f + delta as f64)
                    } else {
                        return Err(KvError::TypeMismatch {
                            key: owned_key.clone(),
                            found: value.type_name().to_string(),
                        });
                    }
                }
            };
            Ok(values::to_json_string(&next)?)
        };

        let entry = self
            .store
            .update(&self.guild_id, key, self.limits.max_keys, &apply)
            .await?;
        Ok(values::from_json_str(&entry.value)?)
    }

    /// Entries whose key matches a LIKE pattern, in key order.
    pub async fn search(&self, pattern: &str) -> Result<Vec<(String, Dynamic)>, KvError> {
        let entries = self.store.search(&self.guild_id, pattern).await?;
        entries
            .into_iter()
            .map(|entry| {
                let value = values::from_json_str(&entry.value)?;
                Ok::<_, KvError>((entry.key, value))
            })
            .collect()
    }

    pub async fn count(&self) -> Result<usize, KvError> {
        self.store.count(&self.guild_id).await
    }
}
