pub mod client;
pub mod memory;
pub mod models;
pub mod permissions;

pub use client::{DiscordRest, EntityCache};
pub use memory::{CacheSnapshot, InMemoryCache, RecordingRest, RestCall};
pub use models::{
    Attachment, Channel, ChannelEdit, CommandData, CommandOption, Guild, Interaction,
    InteractionKind, InteractionResponse, Member, Message, OptionKind, ResolvedData,
    ResolvedMember, ResponseData, ResponseKind, Role, RoleEdit, User,
};
pub use permissions::{DerivedPermissions, Permissions};
