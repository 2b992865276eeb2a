//! In-memory collaborators: a fixture-backed entity cache and a REST client
//! that records calls instead of sending them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::client::{DiscordRest, EntityCache};
use super::models::{
    Channel, ChannelEdit, Guild, InteractionResponse, Member, Message, ResponseData,
    ResponseKind, Role, RoleEdit, User,
};
use super::permissions::DerivedPermissions;

/// Cached guild state, as loaded from a fixture.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheSnapshot {
    #[serde(default)]
    pub guilds: Vec<Guild>,
    #[serde(default)]
    pub channels: Vec<Channel>,
    /// Roles by guild id.
    #[serde(default)]
    pub roles: HashMap<String, Vec<Role>>,
    /// Members by guild id.
    #[serde(default)]
    pub members: HashMap<String, Vec<Member>>,
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Live permissions by user id. Users without an entry cannot be
    /// re-derived.
    #[serde(default)]
    pub permissions: HashMap<String, DerivedPermissions>,
}

#[derive(Debug, Default)]
pub struct InMemoryCache {
    state: RwLock<CacheSnapshot>,
}

impl InMemoryCache {
    pub fn new(snapshot: CacheSnapshot) -> Self {
        Self {
            state: RwLock::new(snapshot),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheSnapshot> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheSnapshot> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Replaces the live permissions of a user.
    pub fn set_permissions(&self, permissions: DerivedPermissions) {
        self.write()
            .permissions
            .insert(permissions.user_id.clone(), permissions);
    }

    pub fn insert_channel(&self, channel: Channel) {
        let mut state = self.write();
        state.channels.retain(|c| c.id != channel.id);
        state.channels.push(channel);
    }

    pub fn insert_message(&self, message: Message) {
        let mut state = self.write();
        state.messages.retain(|m| m.id != message.id);
        state.messages.push(message);
    }
}

#[async_trait]
impl EntityCache for InMemoryCache {
    async fn guild(&self, guild_id: &str) -> Result<Option<Guild>> {
        Ok(self.read().guilds.iter().find(|g| g.id == guild_id).cloned())
    }

    async fn guild_channels(&self, guild_id: &str) -> Result<Vec<Channel>> {
        Ok(self
            .read()
            .channels
            .iter()
            .filter(|c| c.guild_id.as_deref() == Some(guild_id))
            .cloned()
            .collect())
    }

    async fn channel(&self, channel_id: &str) -> Result<Option<Channel>> {
        Ok(self.read().channels.iter().find(|c| c.id == channel_id).cloned())
    }

    async fn guild_roles(&self, guild_id: &str) -> Result<Vec<Role>> {
        Ok(self.read().roles.get(guild_id).cloned().unwrap_or_default())
    }

    async fn role(&self, guild_id: &str, role_id: &str) -> Result<Option<Role>> {
        Ok(self
            .read()
            .roles
            .get(guild_id)
            .and_then(|roles| roles.iter().find(|r| r.id == role_id))
            .cloned())
    }

    async fn member(&self, guild_id: &str, user_id: &str) -> Result<Option<Member>> {
        Ok(self
            .read()
            .members
            .get(guild_id)
            .and_then(|members| members.iter().find(|m| m.user.id == user_id))
            .cloned())
    }

    async fn message(&self, channel_id: &str, message_id: &str) -> Result<Option<Message>> {
        Ok(self
            .read()
            .messages
            .iter()
            .find(|m| m.channel_id == channel_id && m.id == message_id)
            .cloned())
    }

    async fn derived_permissions(
        &self,
        _guild_id: &str,
        _channel_id: &str,
        user_id: &str,
    ) -> Result<Option<DerivedPermissions>> {
        Ok(self.read().permissions.get(user_id).cloned())
    }
}

// ── Recording REST client ────────────────────────────────

/// One REST call as seen by [`RecordingRest`].
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum RestCall {
    InteractionResponse {
        interaction_id: String,
        response: InteractionResponse,
    },
    Followup {
        application_id: String,
        data: ResponseData,
    },
    DeleteMessage {
        channel_id: String,
        message_id: String,
    },
    AddReaction {
        channel_id: String,
        message_id: String,
        emoji: String,
    },
    RemoveReaction {
        channel_id: String,
        message_id: String,
        emoji: String,
        user_id: Option<String>,
    },
    ClearReactions {
        channel_id: String,
        message_id: String,
    },
    EditChannel {
        channel_id: String,
        edit: ChannelEdit,
    },
    DeleteChannel {
        channel_id: String,
    },
    KickMember {
        guild_id: String,
        user_id: String,
        reason: Option<String>,
    },
    BanMember {
        guild_id: String,
        user_id: String,
        reason: Option<String>,
    },
    AddMemberRole {
        guild_id: String,
        user_id: String,
        role_id: String,
    },
    RemoveMemberRole {
        guild_id: String,
        user_id: String,
        role_id: String,
    },
    EditRole {
        guild_id: String,
        role_id: String,
        edit: RoleEdit,
    },
    DeleteRole {
        guild_id: String,
        role_id: String,
    },
}

/// REST client that records every call and answers with synthetic data.
#[derive(Debug, Default)]
pub struct RecordingRest {
    calls: Mutex<Vec<RestCall>>,
    next_message_id: AtomicU64,
    delay: Duration,
    failure: Option<String>,
}

impl RecordingRest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps for `delay` before being recorded.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every call fails with `message` (after being recorded).
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RestCall>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn calls(&self) -> Vec<RestCall> {
        self.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().len()
    }

    async fn record(&self, call: RestCall) -> Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.lock().push(call);
        if let Some(message) = &self.failure {
            bail!("{message}");
        }
        Ok(())
    }

    fn message(&self, channel_id: &str, data: &ResponseData) -> Message {
        let id = self.next_message_id.fetch_add(1, Ordering::Relaxed) + 1;
        Message {
            id: format!("recorded-{id}"),
            channel_id: channel_id.to_string(),
            author: User {
                id: "0".to_string(),
                username: "guild-scripts".to_string(),
                bot: true,
                ..User::default()
            },
            content: data.content.clone().unwrap_or_default(),
            embeds: data.embeds.clone(),
            ..Message::default()
        }
    }
}

#[async_trait]
impl DiscordRest for RecordingRest {
    async fn create_interaction_response(
        &self,
        interaction_id: &str,
        _token: &str,
        response: &InteractionResponse,
    ) -> Result<Option<Message>> {
        self.record(RestCall::InteractionResponse {
            interaction_id: interaction_id.to_string(),
            response: response.clone(),
        })
        .await?;

        let creates_message = matches!(
            response.kind,
            ResponseKind::ChannelMessageWithSource | ResponseKind::UpdateMessage
        );
        Ok(match (&response.data, creates_message) {
            (Some(data), true) => Some(self.message("", data)),
            _ => None,
        })
    }

    async fn create_followup_message(
        &self,
        application_id: &str,
        _token: &str,
        data: &ResponseData,
    ) -> Result<Message> {
        self.record(RestCall::Followup {
            application_id: application_id.to_string(),
            data: data.clone(),
        })
        .await?;
        Ok(self.message("", data))
    }

    async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<()> {
        self.record(RestCall::DeleteMessage {
            channel_id: channel_id.to_string(),
            message_id: message_id.to_string(),
        })
        .await
    }

    async fn add_reaction(&self, channel_id: &str, message_id: &str, emoji: &str) -> Result<()> {
        self.record(RestCall::AddReaction {
            channel_id: channel_id.to_string(),
            message_id: message_id.to_string(),
            emoji: emoji.to_string(),
        })
        .await
    }

    async fn remove_reaction(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
        user_id: Option<&str>,
    ) -> Result<()> {
        self.record(RestCall::RemoveReaction {
            channel_id: channel_id.to_string(),
            message_id: message_id.to_string(),
            emoji: emoji.to_string(),
            user_id: user_id.map(str::to_string),
        })
        .await
    }

    async fn clear_reactions(&self, channel_id: &str, message_id: &str) -> Result<()> {
        self.record(RestCall::ClearReactions {
            channel_id: channel_id.to_string(),
            message_id: message_id.to_string(),
        })
        .await
    }

    async fn edit_channel(&self, channel_id: &str, edit: &ChannelEdit) -> Result<Channel> {
        self.record(RestCall::EditChannel {
            channel_id: channel_id.to_string(),
            edit: edit.clone(),
        })
        .await?;
        Ok(Channel {
            id: channel_id.to_string(),
            name: edit.name.clone().unwrap_or_default(),
            topic: edit.topic.clone(),
            ..Channel::default()
        })
    }

    async fn delete_channel(&self, channel_id: &str) -> Result<()> {
        self.record(RestCall::DeleteChannel {
            channel_id: channel_id.to_string(),
        })
        .await
    }

    async fn kick_member(&self, guild_id: &str, user_id: &str, reason: Option<&str>) -> Result<()> {
        self.record(RestCall::KickMember {
            guild_id: guild_id.to_string(),
            user_id: user_id.to_string(),
            reason: reason.map(str::to_string),
        })
        .await
    }

    async fn ban_member(&self, guild_id: &str, user_id: &str, reason: Option<&str>) -> Result<()> {
        self.record(RestCall::BanMember {
            guild_id: guild_id.to_string(),
            user_id: user_id.to_string(),
            reason: reason.map(str::to_string),
        })
        .await
    }

    async fn add_member_role(&self, guild_id: &str, user_id: &str, role_id: &str) -> Result<()> {
        self.record(RestCall::AddMemberRole {
            guild_id: guild_id.to_string(),
            user_id: user_id.to_string(),
            role_id: role_id.to_string(),
        })
        .await
    }

    async fn remove_member_role(
        &self,
        guild_id: &str,
        user_id: &str,
        role_id: &str,
    ) -> Result<()> {
        self.record(RestCall::RemoveMemberRole {
            guild_id: guild_id.to_string(),
            user_id: user_id.to_string(),
            role_id: role_id.to_string(),
        })
        .await
    }

    async fn edit_role(&self, guild_id: &str, role_id: &str, edit: &RoleEdit) -> Result<Role> {
        self.record(RestCall::EditRole {
            guild_id: guild_id.to_string(),
            role_id: role_id.to_string(),
            edit: edit.clone(),
        })
        .await?;
        Ok(Role {
            id: role_id.to_string(),
            name: edit.name.clone().unwrap_or_default(),
            ..Role::default()
        })
    }

    async fn delete_role(&self, guild_id: &str, role_id: &str) -> Result<()> {
        self.record(RestCall::DeleteRole {
            guild_id: guild_id.to_string(),
            role_id: role_id.to_string(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cache_lookups() {
        let cache = InMemoryCache::new(CacheSnapshot {
            guilds: vec![Guild {
                id: "1".to_string(),
                name: "Rustaceans".to_string(),
                ..Guild::default()
            }],
            channels: vec![Channel {
                id: "2".to_string(),
                guild_id: Some("1".to_string()),
                name: "general".to_string(),
                ..Channel::default()
            }],
            ..CacheSnapshot::default()
        });

        assert_eq!(cache.guild("1").await.unwrap().unwrap().name, "Rustaceans");
        assert!(cache.guild("9").await.unwrap().is_none());
        assert_eq!(cache.guild_channels("1").await.unwrap().len(), 1);
        assert!(cache.derived_permissions("1", "2", "3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recording_rest_counts_calls() {
        let rest = RecordingRest::new();
        let response = InteractionResponse {
            kind: ResponseKind::ChannelMessageWithSource,
            data: Some(ResponseData {
                content: Some("hi".to_string()),
                ..ResponseData::default()
            }),
        };

        let message = rest
            .create_interaction_response("10", "tok", &response)
            .await
            .unwrap();
        assert_eq!(message.unwrap().content, "hi");
        rest.delete_message("2", "3").await.unwrap();

        assert_eq!(rest.call_count(), 2);
        assert!(matches!(rest.calls()[1], RestCall::DeleteMessage { .. }));
    }

    #[tokio::test]
    async fn test_failing_rest_still_records() {
        let rest = RecordingRest::new().failing("boom");
        let err = rest.kick_member("1", "2", None).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(rest.call_count(), 1);
    }
}
