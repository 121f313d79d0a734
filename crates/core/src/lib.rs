//! `gatehouse-core` - security domain building blocks.
//!
//! This crate contains the **pure** authorization data model (no storage, no transport).

pub mod entity;
pub mod error;
pub mod id;
pub mod model;

pub use entity::{Audited, Entity};
pub use error::{
    ACCESS_DENIED_MESSAGE, AUTH_FAILED_MESSAGE, REGISTRATION_NOT_FOUND_MESSAGE, SecurityError,
    SecurityResult,
};
pub use id::{PermissionId, PermissionViewId, RegisterUserId, RoleId, UserId, ViewMenuId};
pub use model::{
    NewRegisterUser, NewUser, Permission, PermissionView, RegisterUser, Role, User, UserLookup,
    ViewMenu,
};
