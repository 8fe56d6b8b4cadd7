//! Permission model
//!
//! A caller's permission is a flat set of capability bits. Role levels are
//! named constants formed by OR-ing flags cumulatively; there is no role
//! hierarchy beyond bit containment: a level `L` is satisfied by a
//! permission `P` iff `P & L == L`.

use serde::{Deserialize, Serialize};
use std::ops::{BitAnd, BitOr};

/// A set of capability flags held by a caller.
///
/// Serialized as its raw integer value, both in ACL snapshots and in
/// credential claims.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(pub u32);

impl Permission {
    pub const SEE_USERS: Permission = Permission(0x1);
    pub const USER_SELF: Permission = Permission(0x1 << 1);
    pub const USERS_ALL: Permission = Permission(0x1 << 2);
    pub const SERVICE_LOGS_SELF: Permission = Permission(0x1 << 3);
    pub const SERVICE_LOGS_ALL: Permission = Permission(0x1 << 4);
    pub const PLATFORM_LOGS: Permission = Permission(0x1 << 5);
    pub const SEE_SCRIPTS_ALL: Permission = Permission(0x1 << 6);
    pub const SEE_USER_SAFE_SERVICES: Permission = Permission(0x1 << 7);
    pub const DEPLOY_SCRIPT: Permission = Permission(0x1 << 8);
    pub const MANAGE_SCRIPTS_SELF: Permission = Permission(0x1 << 9);
    pub const MANAGE_SCRIPTS_ALL: Permission = Permission(0x1 << 10);
    pub const SEE_SERVICES_ALL: Permission = Permission(0x1 << 11);
    pub const CREATE_SERVICE: Permission = Permission(0x1 << 12);
    pub const MANAGE_SERVICES_SELF: Permission = Permission(0x1 << 13);
    pub const MANAGE_SERVICES_ALL: Permission = Permission(0x1 << 14);
    pub const MANAGE_CLOUD: Permission = Permission(0x1 << 15);
    pub const SEE_CLUSTER_INFO: Permission = Permission(0x1 << 16);
    pub const SEE_PLATFORM_DOCS: Permission = Permission(0x1 << 17);
    pub const MANAGE_PLATFORM_DOCS: Permission = Permission(0x1 << 18);
    pub const MOVE_SERVICE: Permission = Permission(0x1 << 19);

    /// Self-registered but not yet approved. Holds no capabilities.
    pub const UNVERIFIED: Permission = Permission(0);

    /// Authenticated but not accepted as a platform user.
    pub const GUEST: Permission =
        Permission(Self::SEE_SCRIPTS_ALL.0 | Self::SEE_USER_SAFE_SERVICES.0);

    /// Regular platform user.
    pub const USR: Permission = Permission(
        Self::GUEST.0
            | Self::USER_SELF.0
            | Self::SERVICE_LOGS_SELF.0
            | Self::DEPLOY_SCRIPT.0
            | Self::MANAGE_SCRIPTS_SELF.0
            | Self::SEE_PLATFORM_DOCS.0,
    );

    /// Platform developer.
    pub const DEV: Permission = Permission(
        Self::USR.0
            | Self::MANAGE_SCRIPTS_ALL.0
            | Self::MANAGE_PLATFORM_DOCS.0
            | Self::MANAGE_SERVICES_SELF.0
            | Self::CREATE_SERVICE.0
            | Self::SEE_SERVICES_ALL.0
            | Self::SEE_USERS.0,
    );

    /// Platform administrator. Every bit is set, so ADM satisfies any level.
    pub const ADM: Permission = Permission(u32::MAX);

    /// True when this permission carries every bit of `level`.
    pub fn contains(self, level: Permission) -> bool {
        self.0 & level.0 == level.0
    }
}

impl BitOr for Permission {
    type Output = Permission;

    fn bitor(self, rhs: Permission) -> Permission {
        Permission(self.0 | rhs.0)
    }
}

impl BitAnd for Permission {
    type Output = Permission;

    fn bitand(self, rhs: Permission) -> Permission {
        Permission(self.0 & rhs.0)
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Name of the highest role level fully contained in `p`, checked from most
/// to least privileged. A permission matching none of the levels is "nobody".
pub fn role_name(p: Permission) -> &'static str {
    if p.contains(Permission::ADM) {
        "adm"
    } else if p.contains(Permission::DEV) {
        "dev"
    } else if p.contains(Permission::USR) {
        "usr"
    } else {
        "nobody"
    }
}
