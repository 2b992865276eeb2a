//! Script-facing projections of Discord entities.
//!
//! Each view owns a snapshot of its entity plus a [`DiscordHost`] handle for
//! the calls it allows. Reads go through the entity cache; mutations pass
//! the [`PermissionGate`] first and never reach the REST client on denial.

use std::sync::Arc;

use rhai::{Array, Dynamic, Engine, ImmutableString, Map};

use super::host::{HostLink, PermissionGate, Requirement};
use super::{optional_string, reject_unknown_keys, string_field, to_rhai};
use crate::discord::{
    Attachment, Channel, ChannelEdit, DiscordRest, EntityCache, Guild, Member, Message,
    Permissions, Role, RoleEdit, User,
};
use crate::sandbox::ScriptError;
use crate::values;

/// Collaborators shared by every view of one run.
#[derive(Clone)]
pub struct DiscordHost {
    inner: Arc<HostInner>,
}

struct HostInner {
    link: HostLink,
    gate: PermissionGate,
    cache: Arc<dyn EntityCache>,
    rest: Arc<dyn DiscordRest>,
    guild_id: String,
}

impl DiscordHost {
    pub fn new(
        link: HostLink,
        gate: PermissionGate,
        cache: Arc<dyn EntityCache>,
        rest: Arc<dyn DiscordRest>,
        guild_id: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(HostInner {
                link,
                gate,
                cache,
                rest,
                guild_id: guild_id.into(),
            }),
        }
    }

    pub fn link(&self) -> &HostLink {
        &self.inner.link
    }

    pub fn rest(&self) -> &dyn DiscordRest {
        self.inner.rest.as_ref()
    }

    pub fn cache(&self) -> &dyn EntityCache {
        self.inner.cache.as_ref()
    }

    pub fn guild_id(&self) -> &str {
        &self.inner.guild_id
    }

    fn check(&self, requirement: Requirement) -> Result<(), ScriptError> {
        self.inner.gate.check(requirement)
    }

    pub fn guild(&self) -> Result<Option<GuildView>, ScriptError> {
        let guild = self.link().call(self.cache().guild(self.guild_id()))?;
        Ok(guild.map(|guild| GuildView::new(guild, self.clone())))
    }

    /// A channel of this guild. Channels of other guilds read as missing.
    pub fn channel(&self, channel_id: &str) -> Result<Option<ChannelView>, ScriptError> {
        let channel = self.link().call(self.cache().channel(channel_id))?;
        Ok(channel
            .filter(|c| c.guild_id.as_deref() == Some(self.guild_id()))
            .map(|channel| ChannelView::new(channel, self.clone())))
    }

    pub fn role(&self, role_id: &str) -> Result<Option<RoleView>, ScriptError> {
        let role = self.link().call(self.cache().role(self.guild_id(), role_id))?;
        Ok(role.map(|role| RoleView::new(role, self.clone())))
    }

    pub fn member(&self, user_id: &str) -> Result<Option<MemberView>, ScriptError> {
        let member = self.link().call(self.cache().member(self.guild_id(), user_id))?;
        Ok(member.map(|member| MemberView::new(member, self.clone())))
    }
}

fn view_or_unit<T: Clone + Send + Sync + 'static>(view: Option<T>) -> Dynamic {
    view.map(Dynamic::from).unwrap_or(Dynamic::UNIT)
}

// ── User ─────────────────────────────────────────────────

#[derive(Clone)]
pub struct UserView {
    user: User,
}

impl UserView {
    pub fn new(user: User) -> Self {
        Self { user }
    }

    pub fn user(&self) -> &User {
        &self.user
    }
}

// ── Member ───────────────────────────────────────────────

#[derive(Clone)]
pub struct MemberView {
    member: Member,
    host: DiscordHost,
}

impl MemberView {
    pub fn new(member: Member, host: DiscordHost) -> Self {
        Self { member, host }
    }

    pub fn member(&self) -> &Member {
        &self.member
    }

    fn user_id(&self) -> &str {
        &self.member.user.id
    }

    pub fn kick(&self) -> Result<(), ScriptError> {
        self.host.check(Requirement::Guild(Permissions::KICK_MEMBERS))?;
        self.host.link().call(self.host.rest().kick_member(
            self.host.guild_id(),
            self.user_id(),
            None,
        ))
    }

    pub fn ban(&self, reason: Option<&str>) -> Result<(), ScriptError> {
        self.host.check(Requirement::Guild(Permissions::BAN_MEMBERS))?;
        self.host.link().call(self.host.rest().ban_member(
            self.host.guild_id(),
            self.user_id(),
            reason,
        ))
    }

    pub fn add_role(&self, role_id: &str) -> Result<(), ScriptError> {
        self.host.check(Requirement::ManageRole(role_id.to_string()))?;
        self.host.link().call(self.host.rest().add_member_role(
            self.host.guild_id(),
            self.user_id(),
            role_id,
        ))
    }

    pub fn remove_role(&self, role_id: &str) -> Result<(), ScriptError> {
        self.host.check(Requirement::ManageRole(role_id.to_string()))?;
        self.host.link().call(self.host.rest().remove_member_role(
            self.host.guild_id(),
            self.user_id(),
            role_id,
        ))
    }
}

// ── Guild ────────────────────────────────────────────────

#[derive(Clone)]
pub struct GuildView {
    guild: Guild,
    host: DiscordHost,
}

impl GuildView {
    pub fn new(guild: Guild, host: DiscordHost) -> Self {
        Self { guild, host }
    }

    pub fn channels(&self) -> Result<Vec<ChannelView>, ScriptError> {
        let channels = self
            .host
            .link()
            .call(self.host.cache().guild_channels(&self.guild.id))?;
        Ok(channels
            .into_iter()
            .map(|channel| ChannelView::new(channel, self.host.clone()))
            .collect())
    }

    pub fn roles(&self) -> Result<Vec<RoleView>, ScriptError> {
        let roles = self
            .host
            .link()
            .call(self.host.cache().guild_roles(&self.guild.id))?;
        Ok(roles
            .into_iter()
            .map(|role| RoleView::new(role, self.host.clone()))
            .collect())
    }
}

// ── Channel ──────────────────────────────────────────────

#[derive(Clone)]
pub struct ChannelView {
    channel: Channel,
    host: DiscordHost,
}

impl ChannelView {
    pub fn new(channel: Channel, host: DiscordHost) -> Self {
        Self { channel, host }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    fn requirement(&self, permission: Permissions) -> Requirement {
        Requirement::channel(self.channel.id.clone(), permission)
    }

    pub fn edit(&self, edit: &ChannelEdit) -> Result<ChannelView, ScriptError> {
        self.host.check(self.requirement(Permissions::MANAGE_CHANNELS))?;
        let channel = self
            .host
            .link()
            .call(self.host.rest().edit_channel(&self.channel.id, edit))?;
        Ok(ChannelView::new(channel, self.host.clone()))
    }

    pub fn delete(&self) -> Result<(), ScriptError> {
        self.host.check(self.requirement(Permissions::MANAGE_CHANNELS))?;
        self.host
            .link()
            .call(self.host.rest().delete_channel(&self.channel.id))
    }

    pub fn get_message(&self, message_id: &str) -> Result<Option<MessageView>, ScriptError> {
        let message = self
            .host
            .link()
            .call(self.host.cache().message(&self.channel.id, message_id))?;
        Ok(message.map(|message| MessageView::new(message, self.host.clone())))
    }
}

fn channel_edit(map: &Map) -> Result<ChannelEdit, ScriptError> {
    reject_unknown_keys(map, &["name", "topic"])?;
    Ok(ChannelEdit {
        name: string_field(map, "name")?,
        topic: string_field(map, "topic")?,
    })
}

// ── Role ─────────────────────────────────────────────────

#[derive(Clone)]
pub struct RoleView {
    role: Role,
    host: DiscordHost,
}

impl RoleView {
    pub fn new(role: Role, host: DiscordHost) -> Self {
        Self { role, host }
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn edit(&self, edit: &RoleEdit) -> Result<RoleView, ScriptError> {
        self.host.check(Requirement::ManageRole(self.role.id.clone()))?;
        let role = self.host.link().call(self.host.rest().edit_role(
            self.host.guild_id(),
            &self.role.id,
            edit,
        ))?;
        Ok(RoleView::new(role, self.host.clone()))
    }

    pub fn delete(&self) -> Result<(), ScriptError> {
        self.host.check(Requirement::ManageRole(self.role.id.clone()))?;
        self.host
            .link()
            .call(self.host.rest().delete_role(self.host.guild_id(), &self.role.id))
    }
}

fn role_edit(map: &Map) -> Result<RoleEdit, ScriptError> {
    reject_unknown_keys(map, &["name"])?;
    Ok(RoleEdit {
        name: string_field(map, "name")?,
    })
}

// ── Message ──────────────────────────────────────────────

#[derive(Clone)]
pub struct MessageView {
    message: Message,
    host: DiscordHost,
}

impl MessageView {
    pub fn new(message: Message, host: DiscordHost) -> Self {
        Self { message, host }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    fn requirement(&self, permission: Permissions) -> Requirement {
        Requirement::channel(self.message.channel_id.clone(), permission)
    }

    pub fn delete(&self) -> Result<(), ScriptError> {
        self.host.check(self.requirement(Permissions::MANAGE_MESSAGES))?;
        self.host.link().call(
            self.host
                .rest()
                .delete_message(&self.message.channel_id, &self.message.id),
        )
    }

    pub fn add_reaction(&self, emoji: &str) -> Result<(), ScriptError> {
        self.host.check(self.requirement(Permissions::ADD_REACTIONS))?;
        self.host.link().call(self.host.rest().add_reaction(
            &self.message.channel_id,
            &self.message.id,
            emoji,
        ))
    }

    /// Removes the bot's own reaction, or another user's with MANAGE_MESSAGES.
    pub fn remove_reaction(&self, emoji: &str, user_id: Option<&str>) -> Result<(), ScriptError> {
        if user_id.is_some() {
            self.host.check(self.requirement(Permissions::MANAGE_MESSAGES))?;
        }
        self.host.link().call(self.host.rest().remove_reaction(
            &self.message.channel_id,
            &self.message.id,
            emoji,
            user_id,
        ))
    }

    pub fn clear_reactions(&self) -> Result<(), ScriptError> {
        self.host.check(self.requirement(Permissions::MANAGE_MESSAGES))?;
        self.host.link().call(
            self.host
                .rest()
                .clear_reactions(&self.message.channel_id, &self.message.id),
        )
    }

    fn embeds(&self) -> Result<Array, ScriptError> {
        self.message
            .embeds
            .iter()
            .map(|embed| values::from_plain_json(embed).map_err(ScriptError::from))
            .collect()
    }
}

// ── Attachment ───────────────────────────────────────────

#[derive(Clone)]
pub struct AttachmentView {
    attachment: Attachment,
}

impl AttachmentView {
    pub fn new(attachment: Attachment) -> Self {
        Self { attachment }
    }
}

// ── Registration ─────────────────────────────────────────

/// Registers every entity view type with `engine`.
pub fn register(engine: &mut Engine) {
    register_user(engine);
    register_member(engine);
    register_guild(engine);
    register_channel(engine);
    register_role(engine);
    register_message(engine);
    register_attachment(engine);
}

fn register_user(engine: &mut Engine) {
    engine
        .register_type_with_name::<UserView>("User")
        .register_get("id", |u: &mut UserView| u.user.id.clone())
        .register_get("name", |u: &mut UserView| u.user.username.clone())
        .register_get("username", |u: &mut UserView| u.user.username.clone())
        .register_get("global_name", |u: &mut UserView| {
            optional_string(&u.user.global_name)
        })
        .register_get("display_name", |u: &mut UserView| {
            u.user.display_name().to_string()
        })
        .register_get("discriminator", |u: &mut UserView| {
            u.user.discriminator.clone()
        })
        .register_get("avatar", |u: &mut UserView| optional_string(&u.user.avatar))
        .register_get("bot", |u: &mut UserView| u.user.bot)
        .register_fn("mention", |u: &mut UserView| u.user.mention());
}

fn register_member(engine: &mut Engine) {
    engine
        .register_type_with_name::<MemberView>("Member")
        .register_get("id", |m: &mut MemberView| m.member.user.id.clone())
        .register_get("name", |m: &mut MemberView| m.member.user.username.clone())
        .register_get("username", |m: &mut MemberView| {
            m.member.user.username.clone()
        })
        .register_get("global_name", |m: &mut MemberView| {
            optional_string(&m.member.user.global_name)
        })
        .register_get("display_name", |m: &mut MemberView| {
            m.member.display_name().to_string()
        })
        .register_get("nick", |m: &mut MemberView| optional_string(&m.member.nick))
        .register_get("discriminator", |m: &mut MemberView| {
            m.member.user.discriminator.clone()
        })
        .register_get("avatar", |m: &mut MemberView| {
            optional_string(&m.member.user.avatar)
        })
        .register_get("roles", |m: &mut MemberView| -> Array {
            m.member.roles.iter().cloned().map(Dynamic::from).collect()
        })
        .register_get("user", |m: &mut MemberView| {
            UserView::new(m.member.user.clone())
        })
        .register_fn("mention", |m: &mut MemberView| m.member.user.mention())
        .register_fn("kick", |m: &mut MemberView| to_rhai(m.kick()))
        .register_fn("ban", |m: &mut MemberView| to_rhai(m.ban(None)))
        .register_fn("ban", |m: &mut MemberView, reason: ImmutableString| {
            to_rhai(m.ban(Some(reason.as_str())))
        })
        .register_fn("add_role", |m: &mut MemberView, role_id: ImmutableString| {
            to_rhai(m.add_role(&role_id))
        })
        .register_fn("remove_role", |m: &mut MemberView, role_id: ImmutableString| {
            to_rhai(m.remove_role(&role_id))
        });
}

fn register_guild(engine: &mut Engine) {
    engine
        .register_type_with_name::<GuildView>("Guild")
        .register_get("id", |g: &mut GuildView| g.guild.id.clone())
        .register_get("name", |g: &mut GuildView| g.guild.name.clone())
        .register_get("owner_id", |g: &mut GuildView| g.guild.owner_id.clone())
        .register_get("icon", |g: &mut GuildView| optional_string(&g.guild.icon))
        .register_get("description", |g: &mut GuildView| {
            optional_string(&g.guild.description)
        })
        .register_fn("get_channels", |g: &mut GuildView| {
            to_rhai(g.channels().map(|c| c.into_iter().map(Dynamic::from).collect::<Array>()))
        })
        .register_fn("get_channel", |g: &mut GuildView, id: ImmutableString| {
            to_rhai(g.host.channel(&id).map(view_or_unit))
        })
        .register_fn("get_roles", |g: &mut GuildView| {
            to_rhai(g.roles().map(|r| r.into_iter().map(Dynamic::from).collect::<Array>()))
        })
        .register_fn("get_role", |g: &mut GuildView, id: ImmutableString| {
            to_rhai(g.host.role(&id).map(view_or_unit))
        })
        .register_fn("get_member", |g: &mut GuildView, id: ImmutableString| {
            to_rhai(g.host.member(&id).map(view_or_unit))
        });
}

fn register_channel(engine: &mut Engine) {
    engine
        .register_type_with_name::<ChannelView>("Channel")
        .register_get("id", |c: &mut ChannelView| c.channel.id.clone())
        .register_get("name", |c: &mut ChannelView| c.channel.name.clone())
        .register_get("topic", |c: &mut ChannelView| optional_string(&c.channel.topic))
        .register_get("kind", |c: &mut ChannelView| c.channel.kind as i64)
        .register_get("position", |c: &mut ChannelView| c.channel.position)
        .register_get("nsfw", |c: &mut ChannelView| c.channel.nsfw)
        .register_get("parent_id", |c: &mut ChannelView| {
            optional_string(&c.channel.parent_id)
        })
        .register_fn("mention", |c: &mut ChannelView| c.channel.mention())
        .register_fn("edit", |c: &mut ChannelView, changes: Map| {
            to_rhai(channel_edit(&changes).and_then(|edit| c.edit(&edit)))
        })
        .register_fn("delete", |c: &mut ChannelView| to_rhai(c.delete()))
        .register_fn("get_message", |c: &mut ChannelView, id: ImmutableString| {
            to_rhai(c.get_message(&id).map(view_or_unit))
        });
}

fn register_role(engine: &mut Engine) {
    engine
        .register_type_with_name::<RoleView>("Role")
        .register_get("id", |r: &mut RoleView| r.role.id.clone())
        .register_get("name", |r: &mut RoleView| r.role.name.clone())
        .register_get("color", |r: &mut RoleView| r.role.color as i64)
        .register_get("position", |r: &mut RoleView| r.role.position)
        .register_get("hoist", |r: &mut RoleView| r.role.hoist)
        .register_get("mentionable", |r: &mut RoleView| r.role.mentionable)
        .register_fn("mention", |r: &mut RoleView| r.role.mention())
        .register_fn("edit", |r: &mut RoleView, changes: Map| {
            to_rhai(role_edit(&changes).and_then(|edit| r.edit(&edit)))
        })
        .register_fn("delete", |r: &mut RoleView| to_rhai(r.delete()));
}

fn register_message(engine: &mut Engine) {
    engine
        .register_type_with_name::<MessageView>("Message")
        .register_get("id", |m: &mut MessageView| m.message.id.clone())
        .register_get("channel_id", |m: &mut MessageView| m.message.channel_id.clone())
        .register_get("content", |m: &mut MessageView| m.message.content.clone())
        .register_get("author", |m: &mut MessageView| {
            UserView::new(m.message.author.clone())
        })
        .register_get("embeds", |m: &mut MessageView| to_rhai(m.embeds()))
        .register_get("attachments", |m: &mut MessageView| -> Array {
            m.message
                .attachments
                .iter()
                .cloned()
                .map(|a| Dynamic::from(AttachmentView::new(a)))
                .collect()
        })
        .register_fn("delete", |m: &mut MessageView| to_rhai(m.delete()))
        .register_fn("add_reaction", |m: &mut MessageView, emoji: ImmutableString| {
            to_rhai(m.add_reaction(&emoji))
        })
        .register_fn("remove_reaction", |m: &mut MessageView, emoji: ImmutableString| {
            to_rhai(m.remove_reaction(&emoji, None))
        })
        .register_fn(
            "remove_reaction",
            |m: &mut MessageView, emoji: ImmutableString, user_id: ImmutableString| {
                to_rhai(m.remove_reaction(&emoji, Some(user_id.as_str())))
            },
        )
        .register_fn("clear_reactions", |m: &mut MessageView| {
            to_rhai(m.clear_reactions())
        });
}

fn register_attachment(engine: &mut Engine) {
    engine
        .register_type_with_name::<AttachmentView>("Attachment")
        .register_get("id", |a: &mut AttachmentView| a.attachment.id.clone())
        .register_get("filename", |a: &mut AttachmentView| {
            a.attachment.filename.clone()
        })
        .register_get("url", |a: &mut AttachmentView| a.attachment.url.clone())
        .register_get("size", |a: &mut AttachmentView| {
            i64::try_from(a.attachment.size).unwrap_or(i64::MAX)
        })
        .register_get("content_type", |a: &mut AttachmentView| {
            optional_string(&a.attachment.content_type)
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discord::{
        CacheSnapshot, DerivedPermissions, InMemoryCache, RecordingRest, RestCall,
    };
    use crate::sandbox::{ExecutionAccount, ExecutionBudget};

    struct Fixture {
        rt: tokio::runtime::Runtime,
        cache: Arc<InMemoryCache>,
        rest: Arc<RecordingRest>,
    }

    impl Fixture {
        fn new() -> Self {
            let snapshot = CacheSnapshot {
                channels: vec![
                    Channel {
                        id: "2".to_string(),
                        guild_id: Some("1".to_string()),
                        name: "general".to_string(),
                        ..Channel::default()
                    },
                    Channel {
                        id: "99".to_string(),
                        guild_id: Some("other".to_string()),
                        name: "elsewhere".to_string(),
                        ..Channel::default()
                    },
                ],
                ..CacheSnapshot::default()
            };
            Self {
                rt: tokio::runtime::Runtime::new().unwrap(),
                cache: Arc::new(InMemoryCache::new(snapshot)),
                rest: Arc::new(RecordingRest::new()),
            }
        }

        fn host(&self, permissions: DerivedPermissions) -> DiscordHost {
            let link = HostLink::new(
                ExecutionAccount::new(ExecutionBudget::default()),
                self.rt.handle().clone(),
            );
            let gate = PermissionGate::new(permissions, self.cache.clone(), "1", "2", link.clone());
            DiscordHost::new(link, gate, self.cache.clone(), self.rest.clone(), "1")
        }
    }

    fn message(host: &DiscordHost) -> MessageView {
        MessageView::new(
            Message {
                id: "m1".to_string(),
                channel_id: "2".to_string(),
                ..Message::default()
            },
            host.clone(),
        )
    }

    fn member(host: &DiscordHost) -> MemberView {
        MemberView::new(
            Member {
                user: User {
                    id: "7".to_string(),
                    username: "bob".to_string(),
                    ..User::default()
                },
                ..Member::default()
            },
            host.clone(),
        )
    }

    #[test]
    fn test_denied_delete_makes_no_rest_call() {
        let fx = Fixture::new();
        let host = fx.host(DerivedPermissions::default());

        let err = message(&host).delete().unwrap_err();
        assert!(matches!(err, ScriptError::PermissionDenied { .. }));
        assert_eq!(fx.rest.call_count(), 0);
    }

    #[test]
    fn test_allowed_delete_reaches_rest() {
        let fx = Fixture::new();
        let host = fx.host(DerivedPermissions {
            channel_permissions: Permissions::MANAGE_MESSAGES,
            ..DerivedPermissions::default()
        });

        message(&host).delete().unwrap();
        assert_eq!(
            fx.rest.calls(),
            vec![RestCall::DeleteMessage {
                channel_id: "2".to_string(),
                message_id: "m1".to_string(),
            }]
        );
    }

    #[test]
    fn test_removing_own_reaction_needs_no_permission() {
        let fx = Fixture::new();
        let host = fx.host(DerivedPermissions::default());
        let message = message(&host);

        message.remove_reaction("👍", None).unwrap();
        let err = message.remove_reaction("👍", Some("8")).unwrap_err();
        assert!(matches!(err, ScriptError::PermissionDenied { .. }));
        assert_eq!(fx.rest.call_count(), 1);
    }

    #[test]
    fn test_member_moderation_permissions() {
        let fx = Fixture::new();
        let host = fx.host(DerivedPermissions {
            guild_permissions: Permissions::KICK_MEMBERS,
            ..DerivedPermissions::default()
        });
        let member = member(&host);

        member.kick().unwrap();
        assert!(member.ban(Some("spam")).is_err());
        assert!(member.add_role("10").is_err());
        assert_eq!(fx.rest.call_count(), 1);
    }

    #[test]
    fn test_channel_lookup_is_scoped_to_guild() {
        let fx = Fixture::new();
        let host = fx.host(DerivedPermissions::default());

        assert_eq!(host.channel("2").unwrap().unwrap().channel().name, "general");
        assert!(host.channel("99").unwrap().is_none());
        assert!(host.channel("404").unwrap().is_none());
    }

    #[test]
    fn test_channel_edit_map_validation() {
        let mut map = Map::new();
        map.insert("name".into(), Dynamic::from("renamed".to_string()));
        let edit = channel_edit(&map).unwrap();
        assert_eq!(edit.name.as_deref(), Some("renamed"));
        assert!(edit.topic.is_none());

        map.insert("position".into(), Dynamic::from(3_i64));
        assert!(matches!(
            channel_edit(&map),
            Err(ScriptError::InvalidArgument(_))
        ));
    }
}
