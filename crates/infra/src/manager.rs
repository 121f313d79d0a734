//! The security manager: one object constructed at startup that holds the
//! configuration, the store and every security service, and is threaded
//! into request handlers and CLI commands.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tracing::{info, instrument, warn};

use gatehouse_auth::{
    AuthType, FieldCipher, FieldKind, FieldValue, Hasher, Menu, Principal, SecurityConfig,
    SharedSecret, ViewDescriptor,
};
use gatehouse_core::{
    NewUser, RegisterUser, RegisterUserId, Role, RoleId, SecurityError, SecurityResult, User,
    UserId, UserLookup,
};

use crate::converge::{ConvergeMapping, ConvergeReport, apply_mapping};
use crate::evaluator::Evaluator;
use crate::mailer::{LogMailer, Mailer};
use crate::providers::{
    AuthProvider, AutoRegister, Credentials, DbProvider, Ldap3Connector, LdapConnector,
    LdapProvider, OAuthProvider, OAuthRemote, OpenIdFlow, OpenIdProvider, OpenIdRemote,
    RemoteUserProvider, ReqwestOAuthRemote, ReqwestOpenIdRemote, oauth::OAuthFlow,
};
use crate::registration::{RegistrationRequest, RegistrationService};
use crate::registry::{PermissionRegistry, RegistryReport, security_cleanup};
use crate::rotation::{RotationReport, SecretRotator};
use crate::security_views::{security_menu, security_views};
use crate::session::Session;
use crate::store::{EncryptedColumnStore, SecurityStore, in_transaction};

const PROVIDER_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds a [`SecurityManager`]; external collaborators default to the real
/// clients and can be swapped for fakes.
pub struct SecurityManagerBuilder {
    config: SecurityConfig,
    store: Arc<dyn SecurityStore>,
    hasher: Hasher,
    mailer: Option<Arc<dyn Mailer>>,
    ldap: Option<Box<dyn LdapConnector>>,
    oauth_remote: Option<Arc<dyn OAuthRemote>>,
    openid_remote: Option<Arc<dyn OpenIdRemote>>,
}

impl SecurityManagerBuilder {
    pub fn hasher(mut self, hasher: Hasher) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    pub fn ldap_connector(mut self, connector: Box<dyn LdapConnector>) -> Self {
        self.ldap = Some(connector);
        self
    }

    pub fn oauth_remote(mut self, remote: Arc<dyn OAuthRemote>) -> Self {
        self.oauth_remote = Some(remote);
        self
    }

    pub fn openid_remote(mut self, remote: Arc<dyn OpenIdRemote>) -> Self {
        self.openid_remote = Some(remote);
        self
    }

    pub fn build(self) -> SecurityResult<SecurityManager> {
        let config = self.config;
        config.validate()?;

        let auto_register = config.user_registration.then(|| AutoRegister {
            role: config.registration_role().to_string(),
        });
        let provider: Box<dyn AuthProvider> = match config.auth_type {
            AuthType::Db => Box::new(DbProvider::new(self.hasher.clone())),
            AuthType::Ldap => Box::new(LdapProvider::new(
                config.ldap.clone(),
                self.ldap.unwrap_or_else(|| Box::new(Ldap3Connector)),
                auto_register.clone(),
            )),
            AuthType::OpenId => Box::new(OpenIdProvider),
            AuthType::RemoteUser => Box::new(RemoteUserProvider::new(auto_register.clone())),
            AuthType::OAuth => Box::new(OAuthProvider::new(
                config.oauth_providers.clone(),
                auto_register.clone(),
            )),
        };

        let oauth = if config.oauth_providers.is_empty() {
            None
        } else {
            let remote = match self.oauth_remote {
                Some(remote) => remote,
                None => Arc::new(ReqwestOAuthRemote::new(PROVIDER_HTTP_TIMEOUT)?),
            };
            Some(OAuthFlow::new(
                remote,
                config.oauth_providers.clone(),
                config.app_base_url.clone(),
            ))
        };

        let openid = if config.openid_providers.is_empty() {
            None
        } else {
            let remote = match self.openid_remote {
                Some(remote) => remote,
                None => Arc::new(ReqwestOpenIdRemote::new(PROVIDER_HTTP_TIMEOUT)?),
            };
            Some(OpenIdFlow::new(
                remote,
                config.openid_providers.clone(),
                config.app_base_url.clone(),
            ))
        };

        let secret = Arc::new(SharedSecret::new(config.secret_key.expose_secret().to_string()));
        let registration = RegistrationService::new(
            self.hasher.clone(),
            self.mailer.unwrap_or_else(|| Arc::new(LogMailer)),
            config.registration_role(),
            config.app_base_url.clone(),
            config.mail_default_sender.clone(),
        );

        Ok(SecurityManager {
            evaluator: Evaluator::new(self.store.clone(), config.role_public.clone()),
            registry: PermissionRegistry::new(config.role_admin.clone()),
            openid,
            cipher: FieldCipher::new(secret.clone()),
            secret,
            hasher: self.hasher,
            store: self.store,
            provider,
            registration,
            oauth,
            config,
        })
    }
}

/// Root security object.
pub struct SecurityManager {
    config: SecurityConfig,
    store: Arc<dyn SecurityStore>,
    hasher: Hasher,
    secret: Arc<SharedSecret>,
    cipher: FieldCipher,
    evaluator: Evaluator,
    registry: PermissionRegistry,
    provider: Box<dyn AuthProvider>,
    registration: RegistrationService,
    oauth: Option<OAuthFlow>,
    openid: Option<OpenIdFlow>,
}

impl SecurityManager {
    pub fn builder(config: SecurityConfig, store: Arc<dyn SecurityStore>) -> SecurityManagerBuilder {
        SecurityManagerBuilder {
            config,
            store,
            hasher: Hasher::default(),
            mailer: None,
            ldap: None,
            oauth_remote: None,
            openid_remote: None,
        }
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn SecurityStore {
        self.store.as_ref()
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    pub fn registry(&self) -> &PermissionRegistry {
        &self.registry
    }

    pub fn oauth(&self) -> Option<&OAuthFlow> {
        self.oauth.as_ref()
    }

    pub fn openid(&self) -> Option<&OpenIdFlow> {
        self.openid.as_ref()
    }

    pub fn cipher(&self) -> &FieldCipher {
        &self.cipher
    }

    // ── bootstrap ────────────────────────────────────────────────────────────

    /// Ensure the admin and public roles exist.
    #[instrument(skip(self))]
    pub fn create_db(&self) -> SecurityResult<()> {
        let admin = self.store.add_role(&self.config.role_admin)?;
        let public = self.store.add_role(&self.config.role_public)?;
        info!(admin = %admin.name, public = %public.name, "security roles ready");
        if self.store.count_users()? == 0 {
            warn!("No user yet created, use the create-admin command to do it");
        }
        Ok(())
    }

    /// The security views for the configured login method.
    pub fn security_views(&self) -> (Vec<ViewDescriptor>, Menu) {
        (
            security_views(self.config.auth_type, self.config.user_registration),
            security_menu(self.config.auth_type, self.config.user_registration),
        )
    }

    /// Register the security views plus the host's `views` and `menu`.
    pub fn register_views(&self, views: &[ViewDescriptor], menu: &Menu) -> SecurityResult<RegistryReport> {
        let (mut all, mut full_menu) = self.security_views();
        all.extend(views.iter().cloned());
        full_menu.items.extend(menu.items.iter().cloned());
        self.registry.register_views(self.store.as_ref(), &all, &full_menu)
    }

    /// Drop every view that neither the security views nor `views`/`menu` declare.
    pub fn security_cleanup(&self, views: &[ViewDescriptor], menu: &Menu) -> SecurityResult<usize> {
        let (security, security_menu) = self.security_views();
        let declared: Vec<&str> = security
            .iter()
            .chain(views.iter())
            .map(|v| v.name.as_str())
            .collect();
        let mut full_menu = security_menu;
        full_menu.items.extend(menu.items.iter().cloned());
        security_cleanup(self.store.as_ref(), &declared, &full_menu)
    }

    // ── users & roles ────────────────────────────────────────────────────────

    fn roles_named(&self, store: &dyn SecurityStore, names: &[&str]) -> SecurityResult<Vec<RoleId>> {
        names
            .iter()
            .map(|name| {
                store
                    .find_role(name)?
                    .map(|r| r.id)
                    .ok_or_else(|| SecurityError::not_found(format!("role '{name}'")))
            })
            .collect()
    }

    fn hash(&self, password: &SecretString) -> SecurityResult<String> {
        if password.expose_secret().is_empty() {
            return Err(SecurityError::validation("password must not be empty"));
        }
        Ok(self.hasher.hash(password)?)
    }

    /// Create a user holding `roles`. No password leaves the account usable
    /// only through external providers.
    #[instrument(skip(self, password), fields(username = %username), err)]
    pub fn add_user(
        &self,
        username: &str,
        first_name: &str,
        last_name: &str,
        email: &str,
        roles: &[&str],
        password: Option<&SecretString>,
    ) -> SecurityResult<User> {
        if username.trim().is_empty() || email.trim().is_empty() {
            return Err(SecurityError::validation("username and email are required"));
        }
        let password_hash = password.map(|p| self.hash(p)).transpose()?;
        let user = in_transaction(self.store.as_ref(), |tx| {
            let roles = self.roles_named(tx, roles)?;
            Ok(tx.add_user(NewUser {
                username: username.to_string(),
                first_name: first_name.to_string(),
                last_name: last_name.to_string(),
                email: email.to_string(),
                roles,
                password_hash,
            })?)
        })?;
        info!(username = %user.username, roles = ?user.role_names(), "user added");
        Ok(user)
    }

    /// Bootstrap the roles and add a user holding the admin role.
    pub fn create_admin(
        &self,
        username: &str,
        first_name: &str,
        last_name: &str,
        email: &str,
        password: &SecretString,
    ) -> SecurityResult<User> {
        self.create_db()?;
        let admin = self.config.role_admin.clone();
        self.add_user(username, first_name, last_name, email, &[&admin], Some(password))
    }

    fn user(&self, id: UserId) -> SecurityResult<User> {
        self.store
            .get_user_by_id(id)?
            .ok_or_else(|| SecurityError::not_found(format!("user {id}")))
    }

    #[instrument(skip(self, password), err)]
    pub fn reset_password(&self, user_id: UserId, password: &SecretString) -> SecurityResult<()> {
        let hash = self.hash(password)?;
        let mut user = self.user(user_id)?;
        user.password_hash = Some(hash);
        self.store.update_user(&user)?;
        info!(username = %user.username, "password reset");
        Ok(())
    }

    /// Self-service password change for the signed-in principal.
    pub fn reset_my_password(&self, principal: &Principal, password: &SecretString) -> SecurityResult<()> {
        let id = principal.user_id().ok_or(SecurityError::AccessDenied)?;
        self.reset_password(id, password)
    }

    #[instrument(skip(self), err)]
    pub fn update_user_roles(&self, user_id: UserId, roles: &[&str]) -> SecurityResult<User> {
        in_transaction(self.store.as_ref(), |tx| {
            let ids = self.roles_named(tx, roles)?;
            let mut user = tx
                .get_user_by_id(user_id)?
                .ok_or_else(|| SecurityError::not_found(format!("user {user_id}")))?;
            user.roles = ids
                .into_iter()
                .map(|id| {
                    tx.get_role_by_id(id)?
                        .ok_or_else(|| SecurityError::not_found(format!("role {id}")))
                })
                .collect::<SecurityResult<Vec<Role>>>()?;
            tx.update_user(&user)?;
            Ok(user)
        })
    }

    /// Logical deletion: an inactive user can no longer sign in.
    pub fn set_user_active(&self, user_id: UserId, active: bool) -> SecurityResult<User> {
        let mut user = self.user(user_id)?;
        user.active = active;
        self.store.update_user(&user)?;
        info!(username = %user.username, active, "user activation changed");
        Ok(user)
    }

    /// Change a user's name and email.
    #[instrument(skip(self), err)]
    pub fn edit_user(
        &self,
        user_id: UserId,
        first_name: &str,
        last_name: &str,
        email: &str,
    ) -> SecurityResult<User> {
        if email.trim().is_empty() {
            return Err(SecurityError::validation("email is required"));
        }
        in_transaction(self.store.as_ref(), |tx| {
            if let Some(other) = tx.find_user(UserLookup::Email(email))? {
                if other.id != user_id {
                    return Err(SecurityError::conflict(format!("email '{email}' is taken")));
                }
            }
            let mut user = tx
                .get_user_by_id(user_id)?
                .ok_or_else(|| SecurityError::not_found(format!("user {user_id}")))?;
            user.first_name = first_name.to_string();
            user.last_name = last_name.to_string();
            user.email = email.to_string();
            tx.update_user(&user)?;
            Ok(user)
        })
    }

    pub fn get_user(&self, user_id: UserId) -> SecurityResult<User> {
        self.user(user_id)
    }

    pub fn find_user(&self, username: &str) -> SecurityResult<Option<User>> {
        Ok(self.store.find_user(UserLookup::Username(username))?)
    }

    /// Roles for `ids`; ids with no role are skipped.
    pub fn find_roles_by_ids(&self, ids: &[RoleId]) -> SecurityResult<Vec<Role>> {
        let mut roles = Vec::with_capacity(ids.len());
        for id in ids {
            match self.store.get_role_by_id(*id)? {
                Some(role) => roles.push(role),
                None => warn!(role_id = id.get(), "role not found"),
            }
        }
        Ok(roles)
    }

    pub fn add_role(&self, name: &str) -> SecurityResult<Role> {
        if name.trim().is_empty() {
            return Err(SecurityError::validation("role name must not be empty"));
        }
        Ok(self.store.add_role(name)?)
    }

    pub fn delete_role(&self, id: RoleId) -> SecurityResult<()> {
        if let Some(role) = self.store.get_role_by_id(id)? {
            if role.name == self.config.role_admin || role.name == self.config.role_public {
                return Err(SecurityError::integrity(format!(
                    "role '{}' is required by the security model",
                    role.name
                )));
            }
        }
        Ok(self.store.delete_role(id)?)
    }

    // ── authentication ───────────────────────────────────────────────────────

    /// Resolve credentials with the configured provider. `None` is a failed login.
    pub fn authenticate(&self, credentials: &Credentials) -> SecurityResult<Option<User>> {
        let user = self.provider.authenticate(self.store.as_ref(), credentials)?;
        if user.is_none() {
            info!(
                username = %credentials.identifier(),
                auth_type = self.provider.auth_type().as_str(),
                "authentication failed"
            );
        }
        Ok(user)
    }

    /// Authenticate and bind the user to the session.
    pub fn login(&self, session: &mut Session, credentials: &Credentials) -> SecurityResult<User> {
        let user = self
            .authenticate(credentials)?
            .ok_or(SecurityError::AuthFailed)?;
        session.set_user(user.id)?;
        Ok(user)
    }

    pub fn logout(&self, session: &mut Session) {
        session.logout();
    }

    // ── registration ─────────────────────────────────────────────────────────

    fn registration_enabled(&self) -> SecurityResult<()> {
        if self.config.user_registration {
            Ok(())
        } else {
            Err(SecurityError::AccessDenied)
        }
    }

    pub fn register_user(&self, req: RegistrationRequest) -> SecurityResult<RegisterUser> {
        self.registration_enabled()?;
        self.registration.register(self.store.as_ref(), req)
    }

    pub fn activate_user(&self, registration_hash: &str) -> SecurityResult<User> {
        self.registration_enabled()?;
        self.registration.activate(self.store.as_ref(), registration_hash)
    }

    pub fn list_registrations(&self) -> SecurityResult<Vec<RegisterUser>> {
        self.registration.list(self.store.as_ref())
    }

    pub fn delete_registration(&self, id: RegisterUserId) -> SecurityResult<()> {
        self.registration.delete(self.store.as_ref(), id)
    }

    // ── migrations & secrets ─────────────────────────────────────────────────

    /// Apply a converge mapping, keeping the given views' names even when
    /// nothing references them.
    pub fn converge(
        &self,
        mapping: &ConvergeMapping,
        declared_views: Option<&BTreeSet<String>>,
    ) -> SecurityResult<ConvergeReport> {
        apply_mapping(self.store.as_ref(), mapping, declared_views)
    }

    /// Re-encrypt every encrypted column from `PREVIOUS_SECRET_KEY` to `SECRET_KEY`.
    pub fn rotate_secrets(&self, columns: &dyn EncryptedColumnStore) -> SecurityResult<RotationReport> {
        let previous = self
            .config
            .previous_secret_key
            .as_ref()
            .ok_or_else(|| SecurityError::config("PREVIOUS_SECRET_KEY is not set"))?;
        SecretRotator::new(previous, &self.config.secret_key)?.rotate(columns)
    }

    /// Swap the process secret used by [`Self::cipher`].
    pub fn set_secret_key(&self, secret: &SecretString) {
        self.secret.set(secret.expose_secret().to_string());
    }

    pub fn encrypt_field(&self, value: &FieldValue, kind: FieldKind) -> SecurityResult<Vec<u8>> {
        Ok(self.cipher.encrypt(value, kind)?)
    }

    pub fn decrypt_field(&self, ciphertext: &[u8], kind: FieldKind) -> SecurityResult<FieldValue> {
        Ok(self.cipher.decrypt(ciphertext, kind)?)
    }
}

impl core::fmt::Debug for SecurityManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SecurityManager")
            .field("auth_type", &self.config.auth_type)
            .field("evaluator", &self.evaluator)
            .finish_non_exhaustive()
    }
}
