use tracing::instrument;

use gatehouse_auth::{AuthType, Hasher};
use gatehouse_core::{SecurityResult, User};

use super::{
    AuthProvider, Credentials, find_by_username_or_email, log_failed, record_failed_login,
    record_login,
};
use crate::store::SecurityStore;

/// Username-or-email plus password checked against the stored hash.
#[derive(Debug, Clone, Default)]
pub struct DbProvider {
    hasher: Hasher,
}

impl DbProvider {
    pub fn new(hasher: Hasher) -> Self {
        Self { hasher }
    }
}

impl AuthProvider for DbProvider {
    fn auth_type(&self) -> AuthType {
        AuthType::Db
    }

    #[instrument(skip_all, fields(username = %credentials.identifier()))]
    fn authenticate(
        &self,
        store: &dyn SecurityStore,
        credentials: &Credentials,
    ) -> SecurityResult<Option<User>> {
        let Credentials::Password { username, password } = credentials else {
            return Ok(None);
        };
        if username.is_empty() {
            return Ok(None);
        }

        let Some(user) = find_by_username_or_email(store, username)? else {
            log_failed(username, "unknown user");
            return Ok(None);
        };
        if !user.active {
            log_failed(username, "inactive user");
            return Ok(None);
        }

        let matches = match user.password_hash.as_deref() {
            Some(hash) => self.hasher.verify(password, hash)?,
            None => false,
        };
        if !matches {
            log_failed(username, "password mismatch");
            record_failed_login(store, user)?;
            return Ok(None);
        }
        record_login(store, user).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::test_support::{add_user, store_with_role};
    use secrecy::SecretString;

    fn hasher() -> Hasher {
        Hasher::with_params(1024, 1, 1).unwrap()
    }

    fn password(username: &str, pw: &str) -> Credentials {
        Credentials::Password {
            username: username.into(),
            password: SecretString::from(pw.to_string()),
        }
    }

    #[test]
    fn counts_failures_and_resets_on_success() {
        let (store, role) = store_with_role("Public");
        let hash = hasher().hash(&SecretString::from("pw".to_string())).unwrap();
        let alice = add_user(&store, "alice", Some(hash), vec![role]);
        let provider = DbProvider::new(hasher());

        assert!(provider.authenticate(&store, &password("alice", "wrong")).unwrap().is_none());
        assert!(provider.authenticate(&store, &password("alice", "wrong")).unwrap().is_none());
        assert_eq!(store.get_user_by_id(alice.id).unwrap().unwrap().fail_login_count, 2);

        let user = provider
            .authenticate(&store, &password("alice@example.com", "pw"))
            .unwrap()
            .unwrap();
        assert_eq!(user.login_count, 1);
        assert_eq!(user.fail_login_count, 0);
    }

    #[test]
    fn rejects_inactive_unknown_and_empty() {
        let (store, role) = store_with_role("Public");
        let hash = hasher().hash(&SecretString::from("pw".to_string())).unwrap();
        let mut bob = add_user(&store, "bob", Some(hash), vec![role]);
        bob.active = false;
        store.update_user(&bob).unwrap();
        let provider = DbProvider::new(hasher());

        assert!(provider.authenticate(&store, &password("bob", "pw")).unwrap().is_none());
        assert!(provider.authenticate(&store, &password("nobody", "pw")).unwrap().is_none());
        assert!(provider.authenticate(&store, &password("", "pw")).unwrap().is_none());
        // Inactive accounts do not accumulate failures.
        assert_eq!(store.get_user_by_id(bob.id).unwrap().unwrap().fail_login_count, 0);
    }
}
