use tracing::instrument;

use gatehouse_auth::AuthType;
use gatehouse_core::{SecurityResult, User, UserLookup};

use super::{AuthProvider, AutoRegister, Credentials, auto_register, log_failed, record_login};
use crate::store::SecurityStore;

/// Trusts the username a reverse proxy put in a request header.
#[derive(Debug, Clone, Default)]
pub struct RemoteUserProvider {
    register: Option<AutoRegister>,
}

impl RemoteUserProvider {
    pub fn new(register: Option<AutoRegister>) -> Self {
        Self { register }
    }
}

impl AuthProvider for RemoteUserProvider {
    fn auth_type(&self) -> AuthType {
        AuthType::RemoteUser
    }

    #[instrument(skip_all, fields(username = %credentials.identifier()))]
    fn authenticate(
        &self,
        store: &dyn SecurityStore,
        credentials: &Credentials,
    ) -> SecurityResult<Option<User>> {
        let Credentials::RemoteUser { username } = credentials else {
            return Ok(None);
        };
        if username.is_empty() {
            return Ok(None);
        }
        let user = match (store.find_user(UserLookup::Username(username))?, &self.register) {
            (Some(user), _) if user.active => user,
            (Some(_), _) => {
                log_failed(username, "inactive user");
                return Ok(None);
            }
            (None, Some(register)) => auto_register(
                store,
                register,
                username,
                "-",
                "-",
                &format!("{username}-@email.notfound"),
            )?,
            (None, None) => {
                log_failed(username, "unknown user");
                return Ok(None);
            }
        };
        record_login(store, user).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::test_support::{add_user, store_with_role};

    fn remote(username: &str) -> Credentials {
        Credentials::RemoteUser {
            username: username.into(),
        }
    }

    #[test]
    fn trusts_header_for_active_users_only() {
        let (store, role) = store_with_role("Public");
        let mut henry = add_user(&store, "henry", None, vec![role]);
        let provider = RemoteUserProvider::default();

        assert!(provider.authenticate(&store, &remote("henry")).unwrap().is_some());
        assert!(provider.authenticate(&store, &remote("ivan")).unwrap().is_none());

        henry = store.get_user_by_id(henry.id).unwrap().unwrap();
        henry.active = false;
        store.update_user(&henry).unwrap();
        assert!(provider.authenticate(&store, &remote("henry")).unwrap().is_none());
    }

    #[test]
    fn auto_registers_unknown_users() {
        let (store, _) = store_with_role("Public");
        let provider = RemoteUserProvider::new(Some(AutoRegister {
            role: "Public".into(),
        }));
        let user = provider.authenticate(&store, &remote("judy")).unwrap().unwrap();
        assert_eq!(user.email, "judy-@email.notfound");
        assert!(user.has_role("Public"));
    }
}
