//! The `ctx` namespace: the interaction being handled and the calls that
//! answer it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rhai::{Dynamic, Engine, ImmutableString, Map};
use tracing::debug;

use super::entities::{
    self, ChannelView, DiscordHost, MemberView, MessageView, RoleView, UserView,
};
use super::{optional_string, reject_unknown_keys, string_field, to_rhai, Namespace};
use crate::discord::{
    Channel, CommandData, Interaction, InteractionKind, InteractionResponse, Message, OptionKind,
    ResponseData, ResponseKind, Role, User,
};
use crate::sandbox::ScriptError;
use crate::values;

/// Records whether the initial interaction response has been sent.
///
/// Shared with the dispatcher, which needs it to route its own error
/// message.
#[derive(Debug, Default)]
pub struct ResponseTracker {
    responded: AtomicBool,
}

impl ResponseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_responded(&self) -> bool {
        self.responded.load(Ordering::SeqCst)
    }

    pub fn mark_responded(&self) {
        self.responded.store(true, Ordering::SeqCst);
    }
}

/// Message content passed to `respond` / `update`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponsePayload {
    pub content: Option<String>,
    pub ephemeral: bool,
    pub embeds: Vec<serde_json::Value>,
}

impl ResponsePayload {
    pub fn text(content: impl Into<String>, ephemeral: bool) -> Self {
        Self {
            content: Some(content.into()),
            ephemeral,
            embeds: Vec::new(),
        }
    }

    /// Parses `#{content, ephemeral, embeds}`. Ephemeral defaults to true.
    pub fn from_map(map: &Map) -> Result<Self, ScriptError> {
        reject_unknown_keys(map, &["content", "ephemeral", "embeds"])?;

        let ephemeral = match map.get("ephemeral") {
            None => true,
            Some(value) if value.is_unit() => true,
            Some(value) => value.as_bool().map_err(|found| {
                ScriptError::InvalidArgument(format!("'ephemeral' must be a bool, got {found}"))
            })?,
        };

        let embeds = match map.get("embeds") {
            None => Vec::new(),
            Some(value) if value.is_unit() => Vec::new(),
            Some(value) => match values::to_plain_json(value)? {
                serde_json::Value::Array(embeds) => embeds,
                embed @ serde_json::Value::Object(_) => vec![embed],
                _ => {
                    return Err(ScriptError::InvalidArgument(
                        "'embeds' must be a map or an array of maps".to_string(),
                    ))
                }
            },
        };

        Ok(Self {
            content: string_field(map, "content")?,
            ephemeral,
            embeds,
        })
    }

    fn into_data(self) -> ResponseData {
        ResponseData {
            content: self.content,
            embeds: self.embeds,
            ephemeral: self.ephemeral,
        }
    }
}

/// The `ctx` namespace.
#[derive(Clone)]
pub struct ContextNamespace {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    interaction: Arc<Interaction>,
    host: DiscordHost,
    tracker: Arc<ResponseTracker>,
}

impl ContextNamespace {
    pub fn new(
        interaction: Arc<Interaction>,
        host: DiscordHost,
        tracker: Arc<ResponseTracker>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                interaction,
                host,
                tracker,
            }),
        }
    }

    pub fn interaction(&self) -> &Interaction {
        &self.inner.interaction
    }

    pub fn tracker(&self) -> &Arc<ResponseTracker> {
        &self.inner.tracker
    }

    fn host(&self) -> &DiscordHost {
        &self.inner.host
    }

    pub fn member(&self) -> MemberView {
        MemberView::new(self.interaction().member.clone(), self.host().clone())
    }

    pub fn message(&self) -> Option<MessageView> {
        self.interaction()
            .message
            .clone()
            .map(|message| MessageView::new(message, self.host().clone()))
    }

    pub fn command(&self) -> Option<CommandView> {
        self.interaction().command.clone().map(|command| CommandView {
            command: Arc::new(command),
            host: self.host().clone(),
        })
    }

    /// Sends a message. The first response of a run answers the
    /// interaction; every later one is a followup.
    pub fn respond(&self, payload: ResponsePayload) -> Result<Option<MessageView>, ScriptError> {
        self.send(ResponseKind::ChannelMessageWithSource, payload)
    }

    /// Like [`respond`](Self::respond), but the initial response edits the
    /// message the component belongs to.
    pub fn update(&self, payload: ResponsePayload) -> Result<Option<MessageView>, ScriptError> {
        self.send(ResponseKind::UpdateMessage, payload)
    }

    /// Acknowledges the interaction without content. No-op once answered.
    pub fn defer(&self) -> Result<(), ScriptError> {
        if self.tracker().has_responded() {
            debug!("defer() after initial response ignored");
            return Ok(());
        }
        let kind = match self.interaction().kind {
            InteractionKind::Command => ResponseKind::DeferredChannelMessageWithSource,
            _ => ResponseKind::DeferredUpdateMessage,
        };
        self.initial_response(InteractionResponse { kind, data: None })?;
        Ok(())
    }

    fn send(
        &self,
        kind: ResponseKind,
        payload: ResponsePayload,
    ) -> Result<Option<MessageView>, ScriptError> {
        let data = payload.into_data();
        let interaction = self.interaction();

        let message = if self.tracker().has_responded() {
            let host = self.host();
            let message = host.link().call(host.rest().create_followup_message(
                &interaction.application_id,
                &interaction.token,
                &data,
            ))?;
            Some(message)
        } else {
            self.initial_response(InteractionResponse {
                kind,
                data: Some(data),
            })?
        };

        Ok(message.map(|mut message| {
            if message.channel_id.is_empty() {
                message.channel_id = interaction.channel_id.clone();
            }
            MessageView::new(message, self.host().clone())
        }))
    }

    fn initial_response(
        &self,
        response: InteractionResponse,
    ) -> Result<Option<Message>, ScriptError> {
        let host = self.host();
        let interaction = self.interaction();
        let tracker = self.tracker();
        host.link().call(async {
            let message = host
                .rest()
                .create_interaction_response(&interaction.id, &interaction.token, &response)
                .await?;
            tracker.mark_responded();
            Ok::<_, anyhow::Error>(message)
        })
    }

    pub fn get_guild(&self) -> Result<Dynamic, ScriptError> {
        Ok(self.host().guild()?.map(Dynamic::from).unwrap_or(Dynamic::UNIT))
    }

    /// The interaction channel, or the channel with `channel_id`.
    pub fn get_channel(&self, channel_id: Option<&str>) -> Result<Dynamic, ScriptError> {
        let channel_id = channel_id.unwrap_or(&self.interaction().channel_id);
        Ok(self
            .host()
            .channel(channel_id)?
            .map(Dynamic::from)
            .unwrap_or(Dynamic::UNIT))
    }

    pub fn get_role(&self, role_id: &str) -> Result<Dynamic, ScriptError> {
        Ok(self
            .host()
            .role(role_id)?
            .map(Dynamic::from)
            .unwrap_or(Dynamic::UNIT))
    }

    pub fn get_member(&self, user_id: &str) -> Result<Dynamic, ScriptError> {
        Ok(self
            .host()
            .member(user_id)?
            .map(Dynamic::from)
            .unwrap_or(Dynamic::UNIT))
    }
}

fn sent_or_unit(message: Option<MessageView>) -> Dynamic {
    message.map(Dynamic::from).unwrap_or(Dynamic::UNIT)
}

impl Namespace for ContextNamespace {
    fn name(&self) -> &'static str {
        "ctx"
    }

    fn register(&self, engine: &mut Engine) {
        entities::register(engine);
        register_command(engine);

        engine
            .register_type_with_name::<ContextNamespace>("Context")
            .register_get("interaction_id", |c: &mut ContextNamespace| {
                c.interaction().id.clone()
            })
            .register_get("guild_id", |c: &mut ContextNamespace| {
                c.interaction().guild_id.clone()
            })
            .register_get("channel_id", |c: &mut ContextNamespace| {
                c.interaction().channel_id.clone()
            })
            .register_get("custom_id", |c: &mut ContextNamespace| {
                optional_string(&c.interaction().custom_id)
            })
            .register_get("member", |c: &mut ContextNamespace| c.member())
            .register_get("message", |c: &mut ContextNamespace| {
                c.message().map(Dynamic::from).unwrap_or(Dynamic::UNIT)
            })
            .register_get("command", |c: &mut ContextNamespace| {
                c.command().map(Dynamic::from).unwrap_or(Dynamic::UNIT)
            })
            .register_fn("respond", |c: &mut ContextNamespace, content: ImmutableString| {
                to_rhai(c.respond(ResponsePayload::text(content.as_str(), true)).map(sent_or_unit))
            })
            .register_fn(
                "respond",
                |c: &mut ContextNamespace, content: ImmutableString, ephemeral: bool| {
                    to_rhai(
                        c.respond(ResponsePayload::text(content.as_str(), ephemeral))
                            .map(sent_or_unit),
                    )
                },
            )
            .register_fn("respond", |c: &mut ContextNamespace, payload: Map| {
                to_rhai(
                    ResponsePayload::from_map(&payload)
                        .and_then(|payload| c.respond(payload))
                        .map(sent_or_unit),
                )
            })
            .register_fn("update", |c: &mut ContextNamespace, content: ImmutableString| {
                to_rhai(c.update(ResponsePayload::text(content.as_str(), true)).map(sent_or_unit))
            })
            .register_fn(
                "update",
                |c: &mut ContextNamespace, content: ImmutableString, ephemeral: bool| {
                    to_rhai(
                        c.update(ResponsePayload::text(content.as_str(), ephemeral))
                            .map(sent_or_unit),
                    )
                },
            )
            .register_fn("update", |c: &mut ContextNamespace, payload: Map| {
                to_rhai(
                    ResponsePayload::from_map(&payload)
                        .and_then(|payload| c.update(payload))
                        .map(sent_or_unit),
                )
            })
            .register_fn("defer", |c: &mut ContextNamespace| to_rhai(c.defer()))
            .register_fn("get_guild", |c: &mut ContextNamespace| to_rhai(c.get_guild()))
            .register_fn("get_channel", |c: &mut ContextNamespace| {
                to_rhai(c.get_channel(None))
            })
            .register_fn("get_channel", |c: &mut ContextNamespace, id: ImmutableString| {
                to_rhai(c.get_channel(Some(id.as_str())))
            })
            .register_fn("get_role", |c: &mut ContextNamespace, id: ImmutableString| {
                to_rhai(c.get_role(&id))
            })
            .register_fn("get_member", |c: &mut ContextNamespace, id: ImmutableString| {
                to_rhai(c.get_member(&id))
            });
    }

    fn binding(&self) -> Dynamic {
        Dynamic::from(self.clone())
    }
}

// ── Command ──────────────────────────────────────────────

/// The invoked slash command and its arguments.
#[derive(Clone)]
pub struct CommandView {
    command: Arc<CommandData>,
    host: DiscordHost,
}

impl CommandView {
    /// Argument `name`, converted by option type. Absent options are unit.
    pub fn get_arg(&self, name: &str) -> Result<Dynamic, ScriptError> {
        let Some(option) = self.command.option(name) else {
            return Ok(Dynamic::UNIT);
        };
        let Some(value) = &option.value else {
            return Ok(Dynamic::UNIT);
        };
        let resolved = &self.command.resolved;
        let id = || value.as_str().unwrap_or_default().to_string();
        let invalid = || {
            ScriptError::InvalidArgument(format!("option '{name}' has an unexpected value: {value}"))
        };

        let arg = match option.kind {
            OptionKind::String => Dynamic::from(value.as_str().ok_or_else(invalid)?.to_string()),
            OptionKind::Integer => Dynamic::from(value.as_i64().ok_or_else(invalid)?),
            OptionKind::Number => Dynamic::from(value.as_f64().ok_or_else(invalid)?),
            OptionKind::Boolean => Dynamic::from(value.as_bool().ok_or_else(invalid)?),
            OptionKind::User => Dynamic::from(self.user(&id())),
            OptionKind::Channel => Dynamic::from(self.channel(&id())),
            OptionKind::Role => Dynamic::from(self.role(&id())),
            OptionKind::Mentionable => {
                let id = id();
                if resolved.users.contains_key(&id) {
                    Dynamic::from(self.user(&id))
                } else if resolved.roles.contains_key(&id) {
                    Dynamic::from(self.role(&id))
                } else {
                    Dynamic::UNIT
                }
            }
            OptionKind::Attachment => resolved
                .attachments
                .get(&id())
                .cloned()
                .map(|a| Dynamic::from(entities::AttachmentView::new(a)))
                .unwrap_or(Dynamic::UNIT),
            OptionKind::SubCommand | OptionKind::SubCommandGroup => Dynamic::UNIT,
        };
        Ok(arg)
    }

    fn user(&self, id: &str) -> UserView {
        let user = self.command.resolved.users.get(id).cloned().unwrap_or_else(|| User {
            id: id.to_string(),
            ..User::default()
        });
        UserView::new(user)
    }

    fn channel(&self, id: &str) -> ChannelView {
        let channel = self
            .command
            .resolved
            .channels
            .get(id)
            .cloned()
            .unwrap_or_else(|| Channel {
                id: id.to_string(),
                ..Channel::default()
            });
        ChannelView::new(channel, self.host.clone())
    }

    fn role(&self, id: &str) -> RoleView {
        let role = self.command.resolved.roles.get(id).cloned().unwrap_or_else(|| Role {
            id: id.to_string(),
            ..Role::default()
        });
        RoleView::new(role, self.host.clone())
    }
}

fn register_command(engine: &mut Engine) {
    engine
        .register_type_with_name::<CommandView>("Command")
        .register_get("id", |c: &mut CommandView| c.command.id.clone())
        .register_get("name", |c: &mut CommandView| c.command.name.clone())
        .register_fn("get_arg", |c: &mut CommandView, name: ImmutableString| {
            to_rhai(c.get_arg(&name))
        });
}
