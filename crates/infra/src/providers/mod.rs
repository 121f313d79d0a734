//! Authentication providers.
//!
//! Every provider resolves [`Credentials`] to an active [`User`] or to `None`.
//! `None` is the only failure callers see for bad credentials; the reason is
//! logged with the identifier, never the credential.
//!
//! | Provider | Input | Lookup |
//! |----------|-------|--------|
//! | [`DbProvider`] | username-or-email + password | username, then email |
//! | [`LdapProvider`] | username + password | LDAP bind, then username |
//! | [`OpenIdProvider`] | email from a verified OpenID assertion | email |
//! | [`OAuthProvider`] | user info from the provider API | username, then email |
//! | [`RemoteUserProvider`] | trusted proxy header | username |
//!
//! Successful logins go through [`record_login`]; failed password checks on a
//! known user go through [`record_failed_login`].

pub mod db;
pub mod ldap;
pub mod oauth;
pub mod openid;
pub mod remote_user;

use chrono::Utc;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use gatehouse_auth::AuthType;
use gatehouse_core::{NewUser, SecurityError, SecurityResult, User, UserLookup};

use crate::store::SecurityStore;

pub use db::DbProvider;
pub use ldap::{Ldap3Connector, LdapConnector, LdapEntry, LdapProvider, LdapSession};
pub use oauth::{OAuthProvider, OAuthRemote, ReqwestOAuthRemote, TokenResponse, extract_user_info};
pub use openid::{OpenIdFlow, OpenIdProvider, OpenIdRemote, ReqwestOpenIdRemote};
pub use remote_user::RemoteUserProvider;

/// What a login attempt carries.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// Database or LDAP login form.
    Password {
        username: String,
        password: SecretString,
    },
    /// Email from an OpenID assertion that [`OpenIdFlow::callback`] verified.
    OpenId { email: String },
    /// Username set by the reverse proxy.
    RemoteUser { username: String },
    /// User info extracted from an OAuth provider's API.
    OAuth {
        provider: String,
        info: OAuthUserInfo,
    },
}

impl Credentials {
    /// The identifier safe to log.
    pub fn identifier(&self) -> &str {
        match self {
            Self::Password { username, .. } => username,
            Self::OpenId { email } => email,
            Self::RemoteUser { username } => username,
            Self::OAuth { info, .. } => &info.username,
        }
    }
}

/// User attributes returned by an OAuth user-info extractor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthUserInfo {
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

/// Resolves credentials to a user.
///
/// `Ok(None)` means the credentials were rejected; `Err` is reserved for
/// provider and storage failures.
pub trait AuthProvider: Send + Sync {
    fn auth_type(&self) -> AuthType;

    fn authenticate(
        &self,
        store: &dyn SecurityStore,
        credentials: &Credentials,
    ) -> SecurityResult<Option<User>>;
}

/// Role given to users created on first external login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoRegister {
    pub role: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Provider failures
// ─────────────────────────────────────────────────────────────────────────────

/// Failure talking to an external identity system.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Connect or timeout failure; worth one retry.
    #[error("transient provider failure: {0}")]
    Transient(String),

    #[error("provider failure: {0}")]
    Fatal(String),
}

impl From<ProviderError> for SecurityError {
    fn from(value: ProviderError) -> Self {
        SecurityError::provider(value.to_string())
    }
}

/// Run `op`, retrying once when it fails transiently.
pub fn retry_once<T, F>(operation: &str, mut op: F) -> Result<T, ProviderError>
where
    F: FnMut() -> Result<T, ProviderError>,
{
    match op() {
        Err(ProviderError::Transient(reason)) => {
            warn!(operation, %reason, "transient provider failure, retrying once");
            op()
        }
        other => other,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Post-auth bookkeeping
// ─────────────────────────────────────────────────────────────────────────────

/// `last_login = now`, `login_count += 1`, `fail_login_count = 0`, persisted.
pub fn record_login(store: &dyn SecurityStore, mut user: User) -> SecurityResult<User> {
    user.record_login_success(Utc::now());
    store.update_user(&user)?;
    Ok(user)
}

/// `fail_login_count += 1`, persisted.
pub fn record_failed_login(store: &dyn SecurityStore, mut user: User) -> SecurityResult<()> {
    user.record_login_failure(Utc::now());
    store.update_user(&user)?;
    Ok(())
}

pub(crate) fn log_failed(identifier: &str, reason: &str) {
    info!(username = %identifier, reason, "login failed");
}

/// Look up by username, then by email.
pub(crate) fn find_by_username_or_email(
    store: &dyn SecurityStore,
    identifier: &str,
) -> SecurityResult<Option<User>> {
    if let Some(user) = store.find_user(UserLookup::Username(identifier))? {
        return Ok(Some(user));
    }
    Ok(store.find_user(UserLookup::Email(identifier))?)
}

/// Create a user for a first external login with the auto-register role.
pub(crate) fn auto_register(
    store: &dyn SecurityStore,
    register: &AutoRegister,
    username: &str,
    first_name: &str,
    last_name: &str,
    email: &str,
) -> SecurityResult<User> {
    let role = store.find_role(&register.role)?.ok_or_else(|| {
        SecurityError::config(format!(
            "auto-registration role '{}' does not exist",
            register.role
        ))
    })?;
    let user = store.add_user(NewUser {
        username: username.to_string(),
        first_name: first_name.to_string(),
        last_name: last_name.to_string(),
        email: email.to_string(),
        roles: vec![role.id],
        password_hash: None,
    })?;
    info!(username = %user.username, role = %role.name, "auto-registered user");
    Ok(user)
}

#[cfg(test)]
pub(crate) mod test_support {
    use gatehouse_core::{NewUser, RoleId, User};

    use crate::store::{InMemorySecurityStore, SecurityStore};

    pub fn store_with_role(role: &str) -> (InMemorySecurityStore, RoleId) {
        let store = InMemorySecurityStore::new();
        let id = store.add_role(role).unwrap().id;
        (store, id)
    }

    pub fn add_user(
        store: &dyn SecurityStore,
        username: &str,
        password_hash: Option<String>,
        roles: Vec<RoleId>,
    ) -> User {
        store
            .add_user(NewUser {
                username: username.into(),
                first_name: username.into(),
                last_name: "Test".into(),
                email: format!("{username}@example.com"),
                roles,
                password_hash,
            })
            .unwrap()
    }
}
