use std::fmt;

use serde::{Deserialize, Serialize};

/// A Discord permission bit set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permissions(pub u64);

impl Permissions {
    pub const KICK_MEMBERS: Self = Self(1 << 1);
    pub const BAN_MEMBERS: Self = Self(1 << 2);
    pub const ADMINISTRATOR: Self = Self(1 << 3);
    pub const MANAGE_CHANNELS: Self = Self(1 << 4);
    pub const ADD_REACTIONS: Self = Self(1 << 6);
    pub const MANAGE_MESSAGES: Self = Self(1 << 13);
    pub const MANAGE_ROLES: Self = Self(1 << 28);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Name of a single known permission bit, for error messages.
    pub fn name(self) -> &'static str {
        match self {
            Self::KICK_MEMBERS => "KICK_MEMBERS",
            Self::BAN_MEMBERS => "BAN_MEMBERS",
            Self::ADMINISTRATOR => "ADMINISTRATOR",
            Self::MANAGE_CHANNELS => "MANAGE_CHANNELS",
            Self::ADD_REACTIONS => "ADD_REACTIONS",
            Self::MANAGE_MESSAGES => "MANAGE_MESSAGES",
            Self::MANAGE_ROLES => "MANAGE_ROLES",
            _ => "UNKNOWN",
        }
    }
}

impl std::ops::BitOr for Permissions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Permissions of the invoking user, computed by the host before the run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DerivedPermissions {
    pub user_id: String,
    #[serde(default)]
    pub guild_is_owner: bool,
    #[serde(default)]
    pub guild_permissions: Permissions,
    #[serde(default)]
    pub channel_permissions: Permissions,
    /// Roles positioned below the user's highest role.
    #[serde(default)]
    pub lower_role_ids: Vec<String>,
}

impl DerivedPermissions {
    fn is_privileged(&self) -> bool {
        self.guild_is_owner || self.guild_permissions.contains(Permissions::ADMINISTRATOR)
    }

    pub fn has_guild_permission(&self, permission: Permissions) -> bool {
        self.is_privileged() || self.guild_permissions.contains(permission)
    }

    pub fn has_channel_permission(&self, permission: Permissions) -> bool {
        self.is_privileged() || self.channel_permissions.contains(permission)
    }

    /// Requires MANAGE_ROLES and the role sitting below the user's highest role.
    pub fn can_manage_role(&self, role_id: &str) -> bool {
        self.is_privileged()
            || (self.guild_permissions.contains(Permissions::MANAGE_ROLES)
                && self.lower_role_ids.iter().any(|id| id == role_id))
    }
}
