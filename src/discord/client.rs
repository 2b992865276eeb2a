//! Host collaborators for Discord state and REST delivery.
//!
//! The sandbox never talks to Discord directly. The host injects an
//! [`EntityCache`] (read-through state) and a [`DiscordRest`] client; tests
//! and the CLI use the in-memory versions from [`super::memory`].

use anyhow::Result;
use async_trait::async_trait;

use super::models::{
    Channel, ChannelEdit, Guild, InteractionResponse, Member, Message, ResponseData, Role,
    RoleEdit,
};
use super::permissions::DerivedPermissions;

/// Read-through view of cached Discord state.
///
/// Misses return `Ok(None)` (or an empty list); errors are reserved for
/// backend failures.
#[async_trait]
pub trait EntityCache: Send + Sync {
    async fn guild(&self, guild_id: &str) -> Result<Option<Guild>>;

    async fn guild_channels(&self, guild_id: &str) -> Result<Vec<Channel>>;

    async fn channel(&self, channel_id: &str) -> Result<Option<Channel>>;

    async fn guild_roles(&self, guild_id: &str) -> Result<Vec<Role>>;

    async fn role(&self, guild_id: &str, role_id: &str) -> Result<Option<Role>>;

    async fn member(&self, guild_id: &str, user_id: &str) -> Result<Option<Member>>;

    async fn message(&self, channel_id: &str, message_id: &str) -> Result<Option<Message>>;

    /// Recomputes the user's permissions from current state.
    ///
    /// `None` means the cache cannot derive them (e.g. member not cached);
    /// callers then rely on the snapshot taken at dispatch.
    async fn derived_permissions(
        &self,
        guild_id: &str,
        channel_id: &str,
        user_id: &str,
    ) -> Result<Option<DerivedPermissions>>;
}

/// Discord REST operations a script may trigger.
#[async_trait]
pub trait DiscordRest: Send + Sync {
    /// Sends the initial interaction response. Returns the created message
    /// when the response type produces one.
    async fn create_interaction_response(
        &self,
        interaction_id: &str,
        token: &str,
        response: &InteractionResponse,
    ) -> Result<Option<Message>>;

    async fn create_followup_message(
        &self,
        application_id: &str,
        token: &str,
        data: &ResponseData,
    ) -> Result<Message>;

    async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<()>;

    async fn add_reaction(&self, channel_id: &str, message_id: &str, emoji: &str) -> Result<()>;

    /// Removes a reaction. `user_id = None` removes the bot's own reaction.
    async fn remove_reaction(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
        user_id: Option<&str>,
    ) -> Result<()>;

    async fn clear_reactions(&self, channel_id: &str, message_id: &str) -> Result<()>;

    async fn edit_channel(&self, channel_id: &str, edit: &ChannelEdit) -> Result<Channel>;

    async fn delete_channel(&self, channel_id: &str) -> Result<()>;

    async fn kick_member(&self, guild_id: &str, user_id: &str, reason: Option<&str>) -> Result<()>;

    async fn ban_member(&self, guild_id: &str, user_id: &str, reason: Option<&str>) -> Result<()>;

    async fn add_member_role(&self, guild_id: &str, user_id: &str, role_id: &str) -> Result<()>;

    async fn remove_member_role(&self, guild_id: &str, user_id: &str, role_id: &str)
        -> Result<()>;

    async fn edit_role(&self, guild_id: &str, role_id: &str, edit: &RoleEdit) -> Result<Role>;

    async fn delete_role(&self, guild_id: &str, role_id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collaborators_are_object_safe() {
        fn _assert_cache(_: &dyn EntityCache) {}
        fn _assert_rest(_: &dyn DiscordRest) {}
    }
}
