use std::time::Duration;

use rhai::{Dynamic, Engine, ImmutableString, Map};

use super::host::HostLink;
use super::{to_rhai, Namespace};
use crate::kv::GuildKv;
use crate::sandbox::ScriptError;

/// The `kv` namespace: the guild's key-value store.
#[derive(Clone)]
pub struct KvNamespace {
    kv: GuildKv,
    link: HostLink,
}

impl KvNamespace {
    pub fn new(kv: GuildKv, link: HostLink) -> Self {
        Self { kv, link }
    }

    pub fn set(&self, key: &str, value: Dynamic, ttl_seconds: Option<i64>) -> Result<(), ScriptError> {
        let ttl = match ttl_seconds {
            None => None,
            Some(secs) if secs > 0 => Some(Duration::from_secs(secs.unsigned_abs())),
            Some(secs) => {
                return Err(ScriptError::InvalidArgument(format!(
                    "ttl must be a positive number of seconds, got {secs}"
                )))
            }
        };
        self.link.call(self.kv.set(key, &value, ttl))
    }

    pub fn get(&self, key: &str) -> Result<Dynamic, ScriptError> {
        self.link.call(self.kv.get(key))
    }

    pub fn delete(&self, key: &str) -> Result<Dynamic, ScriptError> {
        self.link.call(self.kv.delete(key))
    }

    pub fn increase(&self, key: &str, delta: i64) -> Result<Dynamic, ScriptError> {
        self.link.call(self.kv.increase(key, delta))
    }

    pub fn search(&self, pattern: &str) -> Result<Map, ScriptError> {
        let entries = self.link.call(self.kv.search(pattern))?;
        Ok(entries
            .into_iter()
            .map(|(key, value)| (key.into(), value))
            .collect())
    }
}

impl Namespace for KvNamespace {
    fn name(&self) -> &'static str {
        "kv"
    }

    fn register(&self, engine: &mut Engine) {
        engine
            .register_type_with_name::<KvNamespace>("KV")
            .register_fn("set", |kv: &mut KvNamespace, key: ImmutableString, value: Dynamic| {
                to_rhai(kv.set(&key, value, None))
            })
            .register_fn(
                "set",
                |kv: &mut KvNamespace, key: ImmutableString, value: Dynamic, ttl: i64| {
                    to_rhai(kv.set(&key, value, Some(ttl)))
                },
            )
            .register_fn("get", |kv: &mut KvNamespace, key: ImmutableString| {
                to_rhai(kv.get(&key))
            })
            .register_fn("delete", |kv: &mut KvNamespace, key: ImmutableString| {
                to_rhai(kv.delete(&key))
            })
            .register_fn("increase", |kv: &mut KvNamespace, key: ImmutableString| {
                to_rhai(kv.increase(&key, 1))
            })
            .register_fn(
                "increase",
                |kv: &mut KvNamespace, key: ImmutableString, delta: i64| {
                    to_rhai(kv.increase(&key, delta))
                },
            )
            .register_fn("search", |kv: &mut KvNamespace, pattern: ImmutableString| {
                to_rhai(kv.search(&pattern))
            });
    }

    fn binding(&self) -> Dynamic {
        Dynamic::from(self.clone())
    }
}
