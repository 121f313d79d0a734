//! Self-registration: pending users and activation links.
//!
//! A registration is held as a [`RegisterUser`] until its activation link is
//! followed. Creating one sends the link by mail inside the same unit of
//! work, so a delivery failure leaves nothing behind and the user can retry
//! with the same username and email.

use std::sync::Arc;

use secrecy::SecretString;
use tracing::{info, instrument};

use gatehouse_auth::Hasher;
use gatehouse_core::{
    NewRegisterUser, NewUser, REGISTRATION_NOT_FOUND_MESSAGE, RegisterUser, RegisterUserId,
    SecurityError, SecurityResult, User, UserLookup,
};

use crate::mailer::{MailMessage, Mailer};
use crate::providers::retry_once;
use crate::session::random_hex;
use crate::store::{SecurityStore, in_transaction};

/// What the registration form submits.
#[derive(Debug, Clone)]
pub struct RegistrationRequest {
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub password: Option<SecretString>,
}

#[derive(Clone)]
pub struct RegistrationService {
    hasher: Hasher,
    mailer: Arc<dyn Mailer>,
    role: String,
    base_url: String,
    sender: String,
}

impl RegistrationService {
    pub fn new(
        hasher: Hasher,
        mailer: Arc<dyn Mailer>,
        role: impl Into<String>,
        base_url: impl Into<String>,
        sender: impl Into<String>,
    ) -> Self {
        Self {
            hasher,
            mailer,
            role: role.into(),
            base_url: base_url.into(),
            sender: sender.into(),
        }
    }

    pub fn activation_url(&self, registration_hash: &str) -> String {
        format!(
            "{}/register/activation/{registration_hash}",
            self.base_url.trim_end_matches('/')
        )
    }

    fn ensure_unique(store: &dyn SecurityStore, req: &RegistrationRequest) -> SecurityResult<()> {
        if store.find_user(UserLookup::Username(&req.username))?.is_some() {
            return Err(SecurityError::conflict(format!(
                "username '{}' already exists",
                req.username
            )));
        }
        if store.find_user(UserLookup::Email(&req.email))?.is_some() {
            return Err(SecurityError::conflict(format!(
                "email '{}' already exists",
                req.email
            )));
        }
        for pending in store.list_register_users()? {
            if pending.username == req.username {
                return Err(SecurityError::conflict(format!(
                    "username '{}' already pending registration",
                    req.username
                )));
            }
            if pending.email == req.email {
                return Err(SecurityError::conflict(format!(
                    "email '{}' already pending registration",
                    req.email
                )));
            }
        }
        Ok(())
    }

    /// Persist a pending registration and mail its activation link.
    #[instrument(skip(self, store, req), fields(username = %req.username), err)]
    pub fn register(
        &self,
        store: &dyn SecurityStore,
        req: RegistrationRequest,
    ) -> SecurityResult<RegisterUser> {
        if req.username.trim().is_empty() || req.email.trim().is_empty() {
            return Err(SecurityError::validation("username and email are required"));
        }
        let password_hash = req
            .password
            .as_ref()
            .map(|p| self.hasher.hash(p))
            .transpose()?;

        let pending = in_transaction(store, |tx| {
            Self::ensure_unique(tx, &req)?;
            let pending = tx.add_register_user(NewRegisterUser {
                username: req.username.clone(),
                email: req.email.clone(),
                first_name: req.first_name.clone(),
                last_name: req.last_name.clone(),
                password_hash,
                registration_hash: random_hex(32),
            })?;
            let message = MailMessage {
                from: self.sender.clone(),
                to: pending.email.clone(),
                subject: "Account activation".into(),
                body: format!(
                    "Hello {} {},\n\nclick the link below to activate your account:\n{}\n",
                    pending.first_name,
                    pending.last_name,
                    self.activation_url(&pending.registration_hash)
                ),
            };
            retry_once("activation_mail", || self.mailer.send(&message))?;
            Ok(pending)
        })?;
        info!(username = %pending.username, "registration pending activation");
        Ok(pending)
    }

    /// Turn the pending registration behind `registration_hash` into a user.
    #[instrument(skip(self, store, registration_hash), err(level = "info"))]
    pub fn activate(&self, store: &dyn SecurityStore, registration_hash: &str) -> SecurityResult<User> {
        let user = in_transaction(store, |tx| {
            let pending = tx
                .find_register_user(registration_hash)?
                .ok_or_else(|| SecurityError::not_found(REGISTRATION_NOT_FOUND_MESSAGE))?;
            let role = tx.find_role(&self.role)?.ok_or_else(|| {
                SecurityError::config(format!("registration role '{}' does not exist", self.role))
            })?;
            if !tx.delete_register_user(pending.id)? {
                return Err(SecurityError::not_found(REGISTRATION_NOT_FOUND_MESSAGE));
            }
            Ok(tx.add_user(NewUser {
                username: pending.username,
                first_name: pending.first_name,
                last_name: pending.last_name,
                email: pending.email,
                roles: vec![role.id],
                password_hash: pending.password_hash,
            })?)
        })?;
        info!(username = %user.username, role = %self.role, "registration activated");
        Ok(user)
    }

    /// Pending registrations, oldest first.
    pub fn list(&self, store: &dyn SecurityStore) -> SecurityResult<Vec<RegisterUser>> {
        let mut pending = store.list_register_users()?;
        pending.sort_by_key(|r| (r.registration_date, r.id));
        Ok(pending)
    }

    pub fn delete(&self, store: &dyn SecurityStore, id: RegisterUserId) -> SecurityResult<()> {
        if store.delete_register_user(id)? {
            info!(id = id.get(), "pending registration deleted");
            Ok(())
        } else {
            Err(SecurityError::not_found(format!("registration {}", id.get())))
        }
    }
}

impl core::fmt::Debug for RegistrationService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RegistrationService")
            .field("role", &self.role)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}
