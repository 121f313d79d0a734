//! The security entities: permissions, views, bindings, roles, users and
//! pending registrations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{Audited, Entity};
use crate::id::{PermissionId, PermissionViewId, RegisterUserId, RoleId, UserId, ViewMenuId};

// ─────────────────────────────────────────────────────────────────────────────
// Permission graph
// ─────────────────────────────────────────────────────────────────────────────

/// A named action (`can_list`, `menu_access`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission {
    pub id: PermissionId,
    pub name: String,
}

/// A named unit of UI/API surface, or a menu entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewMenu {
    pub id: ViewMenuId,
    pub name: String,
}

/// The right to perform one permission on one view.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionView {
    pub id: PermissionViewId,
    pub permission: Permission,
    pub view_menu: ViewMenu,
}

impl PermissionView {
    pub fn matches(&self, permission: &str, view: &str) -> bool {
        self.permission.name == permission && self.view_menu.name == view
    }
}

impl core::fmt::Display for PermissionView {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} on {}", self.permission.name, self.view_menu.name)
    }
}

/// A named bag of permission-view grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    pub permissions: Vec<PermissionView>,
}

impl Role {
    /// True iff this role holds the `(permission, view)` binding.
    pub fn grants(&self, permission: &str, view: &str) -> bool {
        self.permissions.iter().any(|pv| pv.matches(permission, view))
    }

    pub fn holds(&self, pv: PermissionViewId) -> bool {
        self.permissions.iter().any(|p| p.id == pv)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Users
// ─────────────────────────────────────────────────────────────────────────────

/// A user account with its roles resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    /// One-way hash; `None` for accounts backed by an external provider.
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub active: bool,
    pub last_login: Option<DateTime<Utc>>,
    pub login_count: u32,
    pub fail_login_count: u32,
    pub roles: Vec<Role>,
    #[serde(flatten)]
    pub audit: Audited,
}

impl User {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    pub fn role_names(&self) -> Vec<&str> {
        self.roles.iter().map(|r| r.name.as_str()).collect()
    }

    pub fn has_role(&self, name: &str) -> bool {
        self.roles.iter().any(|r| r.name == name)
    }

    /// Successful login: bump the login counter and clear failures.
    pub fn record_login_success(&mut self, now: DateTime<Utc>) {
        self.last_login = Some(now);
        self.login_count = self.login_count.saturating_add(1);
        self.fail_login_count = 0;
        self.audit.touch(now);
    }

    pub fn record_login_failure(&mut self, now: DateTime<Utc>) {
        self.fail_login_count = self.fail_login_count.saturating_add(1);
        self.audit.touch(now);
    }
}

/// Input for creating a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub roles: Vec<RoleId>,
    pub password_hash: Option<String>,
}

/// How to look a user up: by username or by email.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserLookup<'a> {
    Username(&'a str),
    Email(&'a str),
}

// ─────────────────────────────────────────────────────────────────────────────
// Registration
// ─────────────────────────────────────────────────────────────────────────────

/// A pending self-registration, alive until activated or rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterUser {
    pub id: RegisterUserId,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    #[serde(skip_serializing)]
    pub registration_hash: String,
    pub registration_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRegisterUser {
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub password_hash: Option<String>,
    pub registration_hash: String,
}

macro_rules! impl_entity {
    ($t:ty, $id:ty) => {
        impl Entity for $t {
            type Id = $id;

            fn id(&self) -> Self::Id {
                self.id
            }
        }
    };
}

impl_entity!(Permission, PermissionId);
impl_entity!(ViewMenu, ViewMenuId);
impl_entity!(PermissionView, PermissionViewId);
impl_entity!(Role, RoleId);
impl_entity!(User, UserId);
impl_entity!(RegisterUser, RegisterUserId);
