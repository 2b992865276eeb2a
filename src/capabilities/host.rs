use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::debug;

use crate::discord::{DerivedPermissions, EntityCache, Permissions};
use crate::sandbox::{ExecutionAccount, ScriptError};

/// Per-run link between the script thread and async host collaborators.
///
/// Runs execute on a blocking thread; every host call is driven with
/// [`Handle::block_on`] while the account is marked idle, and abandoned as
/// soon as the run is cancelled.
#[derive(Clone)]
pub struct HostLink {
    account: ExecutionAccount,
    handle: Handle,
}

impl HostLink {
    pub fn new(account: ExecutionAccount, handle: Handle) -> Self {
        Self { account, handle }
    }

    pub fn account(&self) -> &ExecutionAccount {
        &self.account
    }

    /// Runs one host call.
    ///
    /// Fails with `Cancelled` before starting if the run is already
    /// cancelled. A cancellation while the call is pending drops the call
    /// and fails the same way.
    pub fn call<T, E>(&self, call: impl Future<Output = Result<T, E>>) -> Result<T, ScriptError>
    where
        E: Into<ScriptError>,
    {
        self.account.ensure_active()?;
        let result = {
            let _idle = self.account.idle();
            self.handle.block_on(async {
                tokio::select! {
                    biased;
                    reason = self.account.cancelled() => Err(reason),
                    result = call => Ok(result),
                }
            })
        };
        let result = result.map_err(ScriptError::Cancelled)?;
        self.account.ensure_active()?;
        result.map_err(Into::into)
    }
}

/// What a mutating call requires of the invoking user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Guild(Permissions),
    /// Checked against the channel overwrites when `channel_id` is the
    /// interaction channel, against guild permissions otherwise.
    Channel {
        channel_id: String,
        permission: Permissions,
    },
    ManageRole(String),
}

impl Requirement {
    pub fn channel(channel_id: impl Into<String>, permission: Permissions) -> Self {
        Self::Channel {
            channel_id: channel_id.into(),
            permission,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Guild(permission) | Self::Channel { permission, .. } => permission.to_string(),
            Self::ManageRole(role_id) => format!("MANAGE_ROLES for role {role_id}"),
        }
    }
}

/// Permission checks against the dispatch snapshot and live state.
#[derive(Clone)]
pub struct PermissionGate {
    snapshot: DerivedPermissions,
    cache: Arc<dyn EntityCache>,
    guild_id: String,
    channel_id: String,
    link: HostLink,
}

impl PermissionGate {
    pub fn new(
        snapshot: DerivedPermissions,
        cache: Arc<dyn EntityCache>,
        guild_id: impl Into<String>,
        channel_id: impl Into<String>,
        link: HostLink,
    ) -> Self {
        Self {
            snapshot,
            cache,
            guild_id: guild_id.into(),
            channel_id: channel_id.into(),
            link,
        }
    }

    pub fn snapshot(&self) -> &DerivedPermissions {
        &self.snapshot
    }

    fn grants(&self, permissions: &DerivedPermissions, requirement: &Requirement) -> bool {
        match requirement {
            Requirement::Guild(permission) => permissions.has_guild_permission(*permission),
            Requirement::Channel {
                channel_id,
                permission,
            } if *channel_id == self.channel_id => permissions.has_channel_permission(*permission),
            Requirement::Channel { permission, .. } => {
                permissions.has_guild_permission(*permission)
            }
            Requirement::ManageRole(role_id) => permissions.can_manage_role(role_id),
        }
    }

    /// Passes only if both the snapshot and, when derivable, the current
    /// permissions grant `requirement`.
    pub fn check(&self, requirement: Requirement) -> Result<(), ScriptError> {
        if !self.grants(&self.snapshot, &requirement) {
            debug!(user = %self.snapshot.user_id, "Denied by snapshot: {}", requirement.describe());
            return Err(ScriptError::permission(requirement.describe()));
        }

        let live = self.link.call(self.cache.derived_permissions(
            &self.guild_id,
            &self.channel_id,
            &self.snapshot.user_id,
        ))?;
        if let Some(live) = live {
            if !self.grants(&live, &requirement) {
                debug!(user = %self.snapshot.user_id, "Denied by live state: {}", requirement.describe());
                return Err(ScriptError::permission(requirement.describe()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discord::{CacheSnapshot, InMemoryCache};
    use crate::sandbox::{CancelReason, ExecutionBudget};
    use std::time::Duration;

    fn perms(guild: Permissions, channel: Permissions) -> DerivedPermissions {
        DerivedPermissions {
            user_id: "5".to_string(),
            guild_permissions: guild,
            channel_permissions: channel,
            ..DerivedPermissions::default()
        }
    }

    fn gate(
        rt: &tokio::runtime::Runtime,
        snapshot: DerivedPermissions,
        cache: Arc<InMemoryCache>,
    ) -> PermissionGate {
        let link = HostLink::new(ExecutionAccount::new(ExecutionBudget::default()), rt.handle().clone());
        PermissionGate::new(snapshot, cache, "1", "2", link)
    }

    #[test]
    fn test_link_marks_idle_during_call() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let account = ExecutionAccount::new(ExecutionBudget::default());
        let link = HostLink::new(account.clone(), rt.handle().clone());
        account.begin();

        let value = link
            .call(async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, ScriptError>(7)
            })
            .unwrap();

        assert_eq!(value, 7);
        assert!(account.idle_duration() >= Duration::from_millis(100));
        assert!(account.execution_duration() < Duration::from_millis(50));
    }

    #[test]
    fn test_link_refuses_after_cancel() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let account = ExecutionAccount::new(ExecutionBudget::default());
        let link = HostLink::new(account.clone(), rt.handle().clone());
        account.cancel(CancelReason::StepLimit);

        let ran = std::sync::atomic::AtomicBool::new(false);
        let result = link.call(async {
            ran.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok::<_, ScriptError>(())
        });

        assert!(matches!(result, Err(ScriptError::Cancelled(CancelReason::StepLimit))));
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn test_link_abandons_pending_call_on_cancel() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let account = ExecutionAccount::new(ExecutionBudget::default());
        let link = HostLink::new(account.clone(), rt.handle().clone());

        let remote = account.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            remote.cancel(CancelReason::TotalDurationLimit);
        });

        let started = std::time::Instant::now();
        let result = link.call(async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, ScriptError>(())
        });

        assert!(matches!(
            result,
            Err(ScriptError::Cancelled(CancelReason::TotalDurationLimit))
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(account.idle_duration() >= Duration::from_millis(40));
    }

    #[test]
    fn test_gate_uses_channel_scope_for_interaction_channel() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let cache = Arc::new(InMemoryCache::new(CacheSnapshot::default()));
        let gate = gate(&rt, perms(Permissions::empty(), Permissions::MANAGE_MESSAGES), cache);

        gate.check(Requirement::channel("2", Permissions::MANAGE_MESSAGES))
            .unwrap();
        let err = gate
            .check(Requirement::channel("3", Permissions::MANAGE_MESSAGES))
            .unwrap_err();
        assert!(matches!(err, ScriptError::PermissionDenied { .. }));
    }

    #[test]
    fn test_gate_rechecks_live_permissions() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let cache = Arc::new(InMemoryCache::new(CacheSnapshot::default()));
        let gate = gate(&rt, perms(Permissions::KICK_MEMBERS, Permissions::empty()), cache.clone());

        gate.check(Requirement::Guild(Permissions::KICK_MEMBERS)).unwrap();

        // Permission revoked after dispatch
        cache.set_permissions(perms(Permissions::empty(), Permissions::empty()));
        let err = gate
            .check(Requirement::Guild(Permissions::KICK_MEMBERS))
            .unwrap_err();
        assert_eq!(err.to_string(), "missing permission: KICK_MEMBERS");
    }

    #[test]
    fn test_gate_denies_unmanageable_role() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let cache = Arc::new(InMemoryCache::new(CacheSnapshot::default()));
        let mut snapshot = perms(Permissions::MANAGE_ROLES, Permissions::empty());
        snapshot.lower_role_ids = vec!["10".to_string()];
        let gate = gate(&rt, snapshot, cache);

        gate.check(Requirement::ManageRole("10".to_string())).unwrap();
        assert!(gate.check(Requirement::ManageRole("11".to_string())).is_err());
    }
}
