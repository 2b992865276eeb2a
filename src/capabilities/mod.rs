//! Host capabilities exposed to scripts.
//!
//! A run sees exactly the namespaces registered in its
//! [`CapabilitySurface`]: `ctx`, `kv` and, when the host provides saved
//! messages, `internal`. Every namespace is built with only the
//! collaborators it needs.

pub mod context;
pub mod entities;
pub mod host;
pub mod internal;
pub mod kv;

use std::sync::Arc;

use rhai::{Dynamic, Engine, EvalAltResult, Map, Scope};

use crate::discord::{DerivedPermissions, DiscordRest, EntityCache, Interaction};
use crate::kv::{GuildKv, KvLimits, KvStore};
use crate::sandbox::ScriptError;

pub use context::{ContextNamespace, ResponsePayload, ResponseTracker};
pub use entities::DiscordHost;
pub use host::{HostLink, PermissionGate, Requirement};
pub use internal::{InternalNamespace, MemorySavedMessages, SavedMessage, SavedMessageStore};
pub use kv::KvNamespace;

/// Names every script may refer to, bound or not.
pub const NAMESPACES: [&str; 3] = ["ctx", "kv", "internal"];

/// A group of host functions bound to one script variable.
pub trait Namespace: Send + Sync {
    /// Variable name the namespace is bound to (e.g. "kv").
    fn name(&self) -> &'static str;

    /// Registers the namespace's types and functions with a run's engine.
    fn register(&self, engine: &mut Engine);

    /// Value bound to [`name`](Self::name) in the run's scope.
    fn binding(&self) -> Dynamic;
}

/// Collaborators shared by all runs.
#[derive(Clone)]
pub struct HostServices {
    pub cache: Arc<dyn EntityCache>,
    pub rest: Arc<dyn DiscordRest>,
    pub kv: Arc<dyn KvStore>,
    pub saved_messages: Option<Arc<dyn SavedMessageStore>>,
}

/// The namespaces of one run.
#[derive(Default)]
pub struct CapabilitySurface {
    namespaces: Vec<Box<dyn Namespace>>,
}

impl CapabilitySurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the standard surface for one interaction.
    pub fn standard(
        services: &HostServices,
        interaction: Arc<Interaction>,
        permissions: DerivedPermissions,
        kv_limits: KvLimits,
        link: HostLink,
        tracker: Arc<ResponseTracker>,
    ) -> Self {
        let guild_id = interaction.guild_id.clone();
        let gate = PermissionGate::new(
            permissions,
            services.cache.clone(),
            guild_id.clone(),
            interaction.channel_id.clone(),
            link.clone(),
        );
        let host = DiscordHost::new(
            link.clone(),
            gate,
            services.cache.clone(),
            services.rest.clone(),
            guild_id.clone(),
        );

        let mut surface = Self::new()
            .with(ContextNamespace::new(interaction, host, tracker))
            .with(KvNamespace::new(
                GuildKv::new(guild_id.clone(), services.kv.clone(), kv_limits),
                link.clone(),
            ));
        if let Some(store) = &services.saved_messages {
            surface.add(InternalNamespace::new(store.clone(), guild_id, link));
        }
        surface
    }

    pub fn with(mut self, namespace: impl Namespace + 'static) -> Self {
        self.add(namespace);
        self
    }

    /// Adds a namespace, replacing any with the same name.
    pub fn add(&mut self, namespace: impl Namespace + 'static) {
        self.namespaces.retain(|ns| ns.name() != namespace.name());
        self.namespaces.push(Box::new(namespace));
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.namespaces.iter().map(|ns| ns.name()).collect()
    }

    /// Registers every namespace with `engine` and binds it in `scope`.
    pub fn install(&self, engine: &mut Engine, scope: &mut Scope) {
        for namespace in &self.namespaces {
            namespace.register(engine);
            scope.push_dynamic(namespace.name(), namespace.binding());
        }
    }
}

// ── Argument helpers ─────────────────────────────────────

pub(crate) fn to_rhai<T>(result: Result<T, ScriptError>) -> Result<T, Box<EvalAltResult>> {
    result.map_err(ScriptError::into_rhai)
}

pub(crate) fn optional_string(value: &Option<String>) -> Dynamic {
    match value {
        Some(s) => Dynamic::from(s.clone()),
        None => Dynamic::UNIT,
    }
}

/// Reads an optional string entry of a script map. Unit counts as absent.
pub(crate) fn string_field(map: &Map, key: &str) -> Result<Option<String>, ScriptError> {
    match map.get(key) {
        None => Ok(None),
        Some(value) if value.is_unit() => Ok(None),
        Some(value) => value.clone().into_string().map(Some).map_err(|found| {
            ScriptError::InvalidArgument(format!("'{key}' must be a string, got {found}"))
        }),
    }
}

pub(crate) fn reject_unknown_keys(map: &Map, allowed: &[&str]) -> Result<(), ScriptError> {
    match map.keys().find(|key| !allowed.contains(&key.as_str())) {
        Some(key) => Err(ScriptError::InvalidArgument(format!(
            "unknown field '{key}', expected one of: {}",
            allowed.join(", ")
        ))),
        None => Ok(()),
    }
}
