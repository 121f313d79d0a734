//! Authorization evaluator over the store.
//!
//! Roles are read from storage on every call; nothing is cached between
//! decisions.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, instrument};

use gatehouse_auth::{AccessExplanation, Principal, authorize, explain_access, has_access, is_public};
use gatehouse_core::{PermissionView, Role, SecurityResult, User};

use crate::store::SecurityStore;

#[derive(Clone)]
pub struct Evaluator {
    store: Arc<dyn SecurityStore>,
    public_role: String,
}

impl Evaluator {
    pub fn new(store: Arc<dyn SecurityStore>, public_role: impl Into<String>) -> Self {
        Self {
            store,
            public_role: public_role.into(),
        }
    }

    fn public(&self) -> SecurityResult<Option<Role>> {
        Ok(self.store.find_role(&self.public_role)?)
    }

    /// Resolve the principal to a stored user. A session pointing at a
    /// deleted user resolves to anonymous.
    pub fn current_user(&self, principal: &Principal) -> SecurityResult<Option<User>> {
        match principal.user_id() {
            Some(id) => Ok(self.store.get_user_by_id(id)?),
            None => Ok(None),
        }
    }

    pub fn has_access(
        &self,
        principal: &Principal,
        permission: &str,
        view: &str,
    ) -> SecurityResult<bool> {
        let user = self.current_user(principal)?;
        let public = self.public()?;
        Ok(has_access(user.as_ref(), public.as_ref(), permission, view))
    }

    pub fn is_public(&self, permission: &str, view: &str) -> SecurityResult<bool> {
        Ok(is_public(self.public()?.as_ref(), permission, view))
    }

    /// `Err(AccessDenied)` unless [`Self::has_access`] holds.
    #[instrument(skip(self), err(level = "debug"))]
    pub fn require_access(
        &self,
        principal: &Principal,
        permission: &str,
        view: &str,
    ) -> SecurityResult<()> {
        let user = self.current_user(principal)?;
        let public = self.public()?;
        authorize(user.as_ref(), public.as_ref(), permission, view)?;
        Ok(())
    }

    pub fn get_public_permissions(&self) -> SecurityResult<Vec<PermissionView>> {
        Ok(self.public()?.map(|r| r.permissions).unwrap_or_default())
    }

    /// Every view on which the principal holds `permission`, public grants included.
    pub fn user_view_names(
        &self,
        principal: &Principal,
        permission: &str,
    ) -> SecurityResult<BTreeSet<String>> {
        let user = self.current_user(principal)?.filter(|u| u.active);
        let public = self.public()?;
        let names: BTreeSet<String> = user
            .iter()
            .flat_map(|u| u.roles.iter())
            .chain(public.iter())
            .flat_map(|r| r.permissions.iter())
            .filter(|pv| pv.permission.name == permission)
            .map(|pv| pv.view_menu.name.clone())
            .collect();
        debug!(count = names.len(), permission, "resolved view names");
        Ok(names)
    }

    pub fn explain_access(
        &self,
        principal: &Principal,
        permission: &str,
        view: &str,
    ) -> SecurityResult<AccessExplanation> {
        let user = self.current_user(principal)?;
        let public = self.public()?;
        Ok(explain_access(user.as_ref(), public.as_ref(), permission, view))
    }
}

impl core::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Evaluator")
            .field("public_role", &self.public_role)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySecurityStore;
    use gatehouse_core::{NewUser, SecurityError};

    fn setup() -> (Arc<InMemorySecurityStore>, Evaluator, Principal) {
        let store = Arc::new(InMemorySecurityStore::new());
        let public = store.add_role("Public").unwrap();
        let sales = store.add_role("Sales").unwrap();
        let home = store.add_permission_view("can_list", "Home").unwrap();
        let orders = store.add_permission_view("can_add", "Orders").unwrap();
        store.link_role_permission(public.id, home.id).unwrap();
        store.link_role_permission(sales.id, orders.id).unwrap();
        let user = store
            .add_user(NewUser {
                username: "bob".into(),
                first_name: "Bob".into(),
                last_name: "B".into(),
                email: "bob@example.com".into(),
                roles: vec![sales.id],
                password_hash: None,
            })
            .unwrap();
        let evaluator = Evaluator::new(store.clone(), "Public");
        (store, evaluator, Principal::User(user.id))
    }

    #[test]
    fn union_of_user_roles_and_public() {
        let (_, evaluator, bob) = setup();
        assert!(evaluator.has_access(&bob, "can_add", "Orders").unwrap());
        assert!(evaluator.has_access(&bob, "can_list", "Home").unwrap());
        assert!(!evaluator.has_access(&bob, "can_delete", "Orders").unwrap());

        let anon = Principal::Anonymous;
        assert!(evaluator.has_access(&anon, "can_list", "Home").unwrap());
        assert!(!evaluator.has_access(&anon, "can_add", "Orders").unwrap());
        assert_eq!(
            evaluator.require_access(&anon, "can_add", "Orders"),
            Err(SecurityError::AccessDenied)
        );
        assert!(evaluator.is_public("can_list", "Home").unwrap());
        assert_eq!(evaluator.get_public_permissions().unwrap().len(), 1);
    }

    #[test]
    fn roles_are_read_at_call_time() {
        let (store, evaluator, bob) = setup();
        let mut user = store.get_user_by_id(bob.user_id().unwrap()).unwrap().unwrap();
        user.roles.clear();
        store.update_user(&user).unwrap();
        assert!(!evaluator.has_access(&bob, "can_add", "Orders").unwrap());
        assert!(evaluator.has_access(&bob, "can_list", "Home").unwrap());
    }

    #[test]
    fn view_names_include_public_views() {
        let (store, evaluator, bob) = setup();
        let extra = store.add_permission_view("can_list", "Orders").unwrap();
        let sales = store.find_role("Sales").unwrap().unwrap();
        store.link_role_permission(sales.id, extra.id).unwrap();

        let names = evaluator.user_view_names(&bob, "can_list").unwrap();
        assert_eq!(names.into_iter().collect::<Vec<_>>(), vec!["Home", "Orders"]);

        let explanation = evaluator.explain_access(&bob, "can_add", "Orders").unwrap();
        assert!(explanation.granted);
        assert_eq!(explanation.granting_roles, vec!["Sales"]);
    }
}
