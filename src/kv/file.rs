use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use super::{Keyspace, KvEntry, KvError, KvStore, UpdateFn};

/// File-backed KV backend.
///
/// Layout:
///   {base_path}/{guild_id}/kv.jsonl   one entry per line
///
/// Every mutation rewrites the guild's file while holding the store lock,
/// so writes are atomic per key within one process.
pub struct FileKvStore {
    base_path: PathBuf,
    lock: Mutex<()>,
}

impl FileKvStore {
    pub fn open(path: &Path) -> Result<Self, KvError> {
        fs::create_dir_all(path)?;
        info!("KV store opened at {}", path.display());
        Ok(Self {
            base_path: path.to_path_buf(),
            lock: Mutex::new(()),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Guild ids become directory names, so only plain identifiers pass.
    fn kv_path(&self, guild_id: &str) -> Result<PathBuf, KvError> {
        let valid = !guild_id.is_empty()
            && guild_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(KvError::InvalidGuild(guild_id.to_string()));
        }
        Ok(self.base_path.join(guild_id).join("kv.jsonl"))
    }

    fn load(&self, guild_id: &str) -> Result<Keyspace, KvError> {
        let path = self.kv_path(guild_id)?;
        if !path.exists() {
            return Ok(Keyspace::default());
        }
        let content = fs::read_to_string(&path)?;
        let mut entries = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<KvEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping unreadable KV line in {}: {e}", path.display()),
            }
        }
        Ok(Keyspace::from_entries(entries))
    }

    fn save(&self, guild_id: &str, space: &Keyspace) -> Result<(), KvError> {
        let path = self.kv_path(guild_id)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut file = fs::File::create(&path)?;
        for entry in space.entries() {
            let json = serde_json::to_string(entry)
                .map_err(|e| KvError::Backend(e.to_string()))?;
            writeln!(file, "{json}")?;
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, guild_id: &str, key: &str) -> Result<Option<KvEntry>, KvError> {
        let _guard = self.guard();
        let space = self.load(guild_id)?;
        Ok(space.get(key, Utc::now()).cloned())
    }

    async fn set(&self, entry: KvEntry, max_keys: usize) -> Result<(), KvError> {
        let _guard = self.guard();
        let guild_id = entry.guild_id.clone();
        let mut space = self.load(&guild_id)?;
        space.set(entry, max_keys, Utc::now())?;
        self.save(&guild_id, &space)
    }

    async fn update(
        &self,
        guild_id: &str,
        key: &str,
        max_keys: usize,
        apply: UpdateFn<'_>,
    ) -> Result<KvEntry, KvError> {
        let _guard = self.guard();
        let mut space = self.load(guild_id)?;
        let entry = space.update(guild_id, key, max_keys, apply, Utc::now())?;
        self.save(guild_id, &space)?;
        Ok(entry)
    }

    async fn delete(&self, guild_id: &str, key: &str) -> Result<Option<KvEntry>, KvError> {
        let _guard = self.guard();
        let mut space = self.load(guild_id)?;
        let removed = space.delete(key, Utc::now());
        if removed.is_some() {
            self.save(guild_id, &space)?;
        }
        Ok(removed)
    }

    async fn count(&self, guild_id: &str) -> Result<usize, KvError> {
        let _guard = self.guard();
        Ok(self.load(guild_id)?.count(Utc::now()))
    }

    async fn search(&self, guild_id: &str, pattern: &str) -> Result<Vec<KvEntry>, KvError> {
        let _guard = self.guard();
        Ok(self.load(guild_id)?.search(pattern, Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, value: &str) -> KvEntry {
        let now = Utc::now();
        KvEntry {
            guild_id: "42".to_string(),
            key: key.to_string(),
            value: value.to_string(),
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_set_and_get_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileKvStore::open(dir.path()).unwrap();
            store.set(entry("greeting", "\"hi\""), 10).await.unwrap();
        }

        let store = FileKvStore::open(dir.path()).unwrap();
        let found = store.get("42", "greeting").await.unwrap().unwrap();
        assert_eq!(found.value, "\"hi\"");
        assert!(dir.path().join("42").join("kv.jsonl").exists());
    }

    #[tokio::test]
    async fn test_overwrite_keeps_single_line() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::open(dir.path()).unwrap();

        store.set(entry("k", "1"), 10).await.unwrap();
        store.set(entry("k", "2"), 10).await.unwrap();

        let content = fs::read_to_string(dir.path().join("42").join("kv.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert_eq!(store.get("42", "k").await.unwrap().unwrap().value, "2");
    }

    #[tokio::test]
    async fn test_delete_and_quota() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::open(dir.path()).unwrap();

        store.set(entry("a", "1"), 1).await.unwrap();
        let err = store.set(entry("b", "1"), 1).await.unwrap_err();
        assert!(matches!(err, KvError::QuotaExceeded { max: 1 }));

        assert!(store.delete("42", "a").await.unwrap().is_some());
        store.set(entry("b", "1"), 1).await.unwrap();
        assert_eq!(store.count("42").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rejects_path_like_guild_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::open(dir.path()).unwrap();

        let err = store.get("../etc", "k").await.unwrap_err();
        assert!(matches!(err, KvError::InvalidGuild(_)));
    }

    #[tokio::test]
    async fn test_skips_corrupt_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::open(dir.path()).unwrap();
        store.set(entry("k", "1"), 10).await.unwrap();

        let path = dir.path().join("42").join("kv.jsonl");
        let mut content = fs::read_to_string(&path).unwrap();
        content.push_str("not json\n");
        fs::write(&path, content).unwrap();

        assert_eq!(store.count("42").await.unwrap(), 1);
    }
}
