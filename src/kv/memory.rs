use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use super::{Keyspace, KvEntry, KvError, KvStore, UpdateFn};

/// Process-local KV backend. Entries are lost on restart.
#[derive(Default)]
pub struct MemoryKvStore {
    guilds: Mutex<HashMap<String, Keyspace>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Keyspace>> {
        self.guilds.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, guild_id: &str, key: &str) -> Result<Option<KvEntry>, KvError> {
        let guilds = self.lock();
        Ok(guilds
            .get(guild_id)
            .and_then(|space| space.get(key, Utc::now()))
            .cloned())
    }

    async fn set(&self, entry: KvEntry, max_keys: usize) -> Result<(), KvError> {
        let mut guilds = self.lock();
        guilds
            .entry(entry.guild_id.clone())
            .or_default()
            .set(entry, max_keys, Utc::now())
    }

    async fn update(
        &self,
        guild_id: &str,
        key: &str,
        max_keys: usize,
        apply: UpdateFn<'_>,
    ) -> Result<KvEntry, KvError> {
        let mut guilds = self.lock();
        guilds
            .entry(guild_id.to_string())
            .or_default()
            .update(guild_id, key, max_keys, apply, Utc::now())
    }

    async fn delete(&self, guild_id: &str, key: &str) -> Result<Option<KvEntry>, KvError> {
        let mut guilds = self.lock();
        Ok(guilds
            .get_mut(guild_id)
            .and_then(|space| space.delete(key, Utc::now())))
    }

    async fn count(&self, guild_id: &str) -> Result<usize, KvError> {
        let guilds = self.lock();
        Ok(guilds
            .get(guild_id)
            .map(|space| space.count(Utc::now()))
            .unwrap_or(0))
    }

    async fn search(&self, guild_id: &str, pattern: &str) -> Result<Vec<KvEntry>, KvError> {
        let guilds = self.lock();
        Ok(guilds
            .get(guild_id)
            .map(|space| space.search(pattern, Utc::now()))
            .unwrap_or_default())
    }
}
