//! `gatehouse-auth` - pure authentication/authorization building blocks.
//!
//! This crate is intentionally decoupled from HTTP and storage: permission
//! naming, view declarations, the access decision, password hashing, field
//! encryption, OAuth token liveness and configuration all live here.

pub mod authorize;
pub mod config;
pub mod crypto;
pub mod password;
pub mod permissions;
pub mod principal;
pub mod roles;
pub mod token;
pub mod view;

pub use authorize::{AccessExplanation, AuthzError, authorize, explain_access, has_access, is_public};
pub use config::{
    AuthType, EmailWhitelist, LdapConfig, OAuthProviderConfig, OpenIdProviderConfig, RemoteAppConfig,
    SecurityConfig,
};
pub use crypto::{CryptoError, FieldCipher, FieldKind, FieldValue, SecretSource, SharedSecret};
pub use password::{Hasher, PasswordError};
pub use permissions::{MENU_ACCESS, PERMISSION_PREFIX, PermissionName};
pub use principal::Principal;
pub use roles::{DEFAULT_ADMIN_ROLE, DEFAULT_PUBLIC_ROLE, RoleName};
pub use token::{OAuthToken, TokenState};
pub use view::{Menu, MenuItem, ViewDescription, ViewDescriptor, ViewMethod, ViewRoute};
