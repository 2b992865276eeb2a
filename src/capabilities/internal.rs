//! The `internal` namespace: data owned by the service itself.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rhai::{Dynamic, Engine, ImmutableString};
use serde::{Deserialize, Serialize};

use super::host::HostLink;
use super::{optional_string, to_rhai, Namespace};
use crate::sandbox::ScriptError;
use crate::values;

/// A message saved by a guild in the editor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SavedMessage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Lookup of saved messages, scoped by guild.
#[async_trait]
pub trait SavedMessageStore: Send + Sync {
    async fn saved_message(&self, guild_id: &str, message_id: &str) -> Result<Option<SavedMessage>>;
}

/// Fixed set of saved messages.
#[derive(Debug, Default)]
pub struct MemorySavedMessages {
    messages: Vec<SavedMessage>,
}

impl MemorySavedMessages {
    pub fn new(messages: Vec<SavedMessage>) -> Self {
        Self { messages }
    }
}

#[async_trait]
impl SavedMessageStore for MemorySavedMessages {
    async fn saved_message(&self, guild_id: &str, message_id: &str) -> Result<Option<SavedMessage>> {
        Ok(self
            .messages
            .iter()
            .find(|m| m.id == message_id && m.guild_id.as_deref() == Some(guild_id))
            .cloned())
    }
}

#[derive(Clone)]
pub struct SavedMessageView {
    message: SavedMessage,
}

impl SavedMessageView {
    pub fn get_data(&self) -> Result<Dynamic, ScriptError> {
        Ok(values::from_plain_json(&self.message.data)?)
    }
}

/// The `internal` namespace.
#[derive(Clone)]
pub struct InternalNamespace {
    store: Arc<dyn SavedMessageStore>,
    guild_id: String,
    link: HostLink,
}

impl InternalNamespace {
    pub fn new(store: Arc<dyn SavedMessageStore>, guild_id: impl Into<String>, link: HostLink) -> Self {
        Self {
            store,
            guild_id: guild_id.into(),
            link,
        }
    }

    /// A saved message of the invoking guild, or `None`.
    pub fn get_saved_message(&self, message_id: &str) -> Result<Option<SavedMessageView>, ScriptError> {
        let message = self
            .link
            .call(self.store.saved_message(&self.guild_id, message_id))?;
        Ok(message.map(|message| SavedMessageView { message }))
    }
}

impl Namespace for InternalNamespace {
    fn name(&self) -> &'static str {
        "internal"
    }

    fn register(&self, engine: &mut Engine) {
        engine
            .register_type_with_name::<SavedMessageView>("SavedMessage")
            .register_get("id", |m: &mut SavedMessageView| m.message.id.clone())
            .register_get("name", |m: &mut SavedMessageView| m.message.name.clone())
            .register_get("description", |m: &mut SavedMessageView| {
                optional_string(&m.message.description)
            })
            .register_fn("get_data", |m: &mut SavedMessageView| to_rhai(m.get_data()));

        engine
            .register_type_with_name::<InternalNamespace>("Internal")
            .register_fn(
                "get_saved_message",
                |internal: &mut InternalNamespace, id: ImmutableString| {
                    to_rhai(
                        internal
                            .get_saved_message(&id)
                            .map(|m| m.map(Dynamic::from).unwrap_or(Dynamic::UNIT)),
                    )
                },
            );
    }

    fn binding(&self) -> Dynamic {
        Dynamic::from(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{ExecutionAccount, ExecutionBudget};

    fn saved(id: &str, guild_id: &str) -> SavedMessage {
        SavedMessage {
            id: id.to_string(),
            guild_id: Some(guild_id.to_string()),
            name: "Welcome".to_string(),
            description: None,
            data: serde_json::json!({"content": "Hello", "embeds": [{"title": "Hi", "color": 5}]}),
        }
    }

    fn internal(rt: &tokio::runtime::Runtime) -> InternalNamespace {
        let store = Arc::new(MemorySavedMessages::new(vec![saved("a", "1"), saved("b", "2")]));
        let link = HostLink::new(ExecutionAccount::new(ExecutionBudget::default()), rt.handle().clone());
        InternalNamespace::new(store, "1", link)
    }

    #[test]
    fn test_saved_message_is_guild_scoped() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let internal = internal(&rt);

        assert!(internal.get_saved_message("a").unwrap().is_some());
        assert!(internal.get_saved_message("b").unwrap().is_none());
    }

    #[test]
    fn test_get_data_decodes_plain_json() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let view = internal(&rt).get_saved_message("a").unwrap().unwrap();

        let data = view.get_data().unwrap().cast::<rhai::Map>();
        assert_eq!(data["content"].clone().into_string().unwrap(), "Hello");
        let embeds = data["embeds"].clone().cast::<rhai::Array>();
        let embed = embeds[0].clone().cast::<rhai::Map>();
        assert_eq!(embed["color"].as_int().unwrap(), 5);
    }
}
