//! In-memory security store.
//!
//! Intended for tests/dev and for running the service without a database.
//! Integrity rules mirror the relational schema: a permission-view pins its
//! permission and view, a role grant pins its permission-view, and a user pins
//! its roles.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use gatehouse_auth::FieldKind;
use gatehouse_core::{
    Audited, NewRegisterUser, NewUser, Permission, PermissionId, PermissionView,
    PermissionViewId, RegisterUser, RegisterUserId, Role, RoleId, SecurityError, SecurityResult,
    User, UserId, UserLookup, ViewMenu, ViewMenuId,
};

use super::r#trait::{
    ColumnWork, EncryptedColumn, EncryptedColumnStore, SecurityStore, StoreError, StoreResult,
    Work,
};

#[derive(Debug, Clone, PartialEq, Eq)]
struct UserRow {
    username: String,
    email: String,
    first_name: String,
    last_name: String,
    password_hash: Option<String>,
    active: bool,
    last_login: Option<DateTime<Utc>>,
    login_count: u32,
    fail_login_count: u32,
    roles: Vec<RoleId>,
    audit: Audited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RoleRow {
    name: String,
    grants: BTreeSet<PermissionViewId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct EncryptedTable {
    kind: FieldKind,
    rows: BTreeMap<i64, Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Sequences {
    permission: i64,
    view: i64,
    permission_view: i64,
    role: i64,
    user: i64,
    register_user: i64,
}

fn next(seq: &mut i64) -> i64 {
    *seq += 1;
    *seq
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct State {
    seq: Sequences,
    permissions: BTreeMap<PermissionId, String>,
    views: BTreeMap<ViewMenuId, String>,
    permission_views: BTreeMap<PermissionViewId, (PermissionId, ViewMenuId)>,
    roles: BTreeMap<RoleId, RoleRow>,
    users: BTreeMap<UserId, UserRow>,
    register_users: BTreeMap<RegisterUserId, RegisterUser>,
    encrypted: BTreeMap<(String, String), EncryptedTable>,
}

impl State {
    fn permission_id(&self, name: &str) -> Option<PermissionId> {
        self.permissions
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(id, _)| *id)
    }

    fn view_id(&self, name: &str) -> Option<ViewMenuId> {
        self.views
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(id, _)| *id)
    }

    fn pv_id(&self, permission: &str, view: &str) -> Option<PermissionViewId> {
        let p = self.permission_id(permission)?;
        let v = self.view_id(view)?;
        self.permission_views
            .iter()
            .find(|(_, pair)| **pair == (p, v))
            .map(|(id, _)| *id)
    }

    fn permission(&self, id: PermissionId) -> Option<Permission> {
        self.permissions.get(&id).map(|name| Permission {
            id,
            name: name.clone(),
        })
    }

    fn view(&self, id: ViewMenuId) -> Option<ViewMenu> {
        self.views.get(&id).map(|name| ViewMenu {
            id,
            name: name.clone(),
        })
    }

    fn permission_view(&self, id: PermissionViewId) -> Option<PermissionView> {
        let (p, v) = self.permission_views.get(&id)?;
        Some(PermissionView {
            id,
            permission: self.permission(*p)?,
            view_menu: self.view(*v)?,
        })
    }

    fn role(&self, id: RoleId) -> Option<Role> {
        let row = self.roles.get(&id)?;
        Some(Role {
            id,
            name: row.name.clone(),
            permissions: row
                .grants
                .iter()
                .filter_map(|pv| self.permission_view(*pv))
                .collect(),
        })
    }

    fn user(&self, id: UserId) -> Option<User> {
        let row = self.users.get(&id)?;
        Some(User {
            id,
            username: row.username.clone(),
            email: row.email.clone(),
            first_name: row.first_name.clone(),
            last_name: row.last_name.clone(),
            password_hash: row.password_hash.clone(),
            active: row.active,
            last_login: row.last_login,
            login_count: row.login_count,
            fail_login_count: row.fail_login_count,
            roles: row.roles.iter().filter_map(|r| self.role(*r)).collect(),
            audit: row.audit,
        })
    }

    fn check_user_unique(&self, username: &str, email: &str, except: Option<UserId>) -> StoreResult<()> {
        for (id, row) in &self.users {
            if Some(*id) == except {
                continue;
            }
            if row.username == username {
                return Err(StoreError::Conflict(format!(
                    "username '{username}' already exists"
                )));
            }
            if row.email == email {
                return Err(StoreError::Conflict(format!("email '{email}' already exists")));
            }
        }
        Ok(())
    }

    fn check_roles_exist(&self, roles: &[RoleId]) -> StoreResult<()> {
        match roles.iter().find(|r| !self.roles.contains_key(r)) {
            Some(missing) => Err(StoreError::Integrity(format!("role {missing} does not exist"))),
            None => Ok(()),
        }
    }

    fn ensure_permission(&mut self, name: &str) -> PermissionId {
        match self.permission_id(name) {
            Some(id) => id,
            None => {
                let id = PermissionId::new(next(&mut self.seq.permission));
                self.permissions.insert(id, name.to_string());
                id
            }
        }
    }

    fn ensure_view(&mut self, name: &str) -> ViewMenuId {
        match self.view_id(name) {
            Some(id) => id,
            None => {
                let id = ViewMenuId::new(next(&mut self.seq.view));
                self.views.insert(id, name.to_string());
                id
            }
        }
    }
}

/// In-memory [`SecurityStore`] + [`EncryptedColumnStore`].
///
/// A transaction runs against a private copy of the state while holding the
/// write lock, and the copy replaces the live state only on success.
#[derive(Debug, Default)]
pub struct InMemorySecurityStore {
    state: RwLock<State>,
}

impl InMemorySecurityStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&State) -> StoreResult<T>) -> StoreResult<T> {
        let state = self
            .state
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;
        f(&state)
    }

    fn write<T>(&self, f: impl FnOnce(&mut State) -> StoreResult<T>) -> StoreResult<T> {
        let mut state = self
            .state
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;
        f(&mut state)
    }

    fn run_isolated<W>(&self, work: W) -> SecurityResult<()>
    where
        W: FnOnce(&InMemorySecurityStore) -> SecurityResult<()>,
    {
        let mut live = self
            .state
            .write()
            .map_err(|_| SecurityError::storage("lock poisoned"))?;
        let scratch = InMemorySecurityStore {
            state: RwLock::new(live.clone()),
        };
        work(&scratch)?;
        let committed = scratch
            .state
            .into_inner()
            .map_err(|_| SecurityError::storage("lock poisoned"))?;
        *live = committed;
        Ok(())
    }

    /// Declare an encrypted column (the in-memory analogue of a tagged column
    /// comment).
    pub fn register_encrypted_column(&self, column: &EncryptedColumn) -> StoreResult<()> {
        self.write(|s| {
            s.encrypted
                .entry((column.table.clone(), column.column.clone()))
                .or_insert_with(|| EncryptedTable {
                    kind: column.kind,
                    rows: BTreeMap::new(),
                });
            Ok(())
        })
    }

    pub fn ciphertext(&self, column: &EncryptedColumn, id: i64) -> StoreResult<Option<Vec<u8>>> {
        self.read(|s| {
            Ok(s.encrypted
                .get(&(column.table.clone(), column.column.clone()))
                .and_then(|t| t.rows.get(&id).cloned()))
        })
    }

    /// Structural equality of two stores' contents.
    pub fn same_contents(&self, other: &InMemorySecurityStore) -> bool {
        match (self.state.read(), other.state.read()) {
            (Ok(a), Ok(b)) => *a == *b,
            _ => false,
        }
    }

    /// Deep copy of the current contents.
    pub fn snapshot(&self) -> StoreResult<InMemorySecurityStore> {
        self.read(|s| {
            Ok(InMemorySecurityStore {
                state: RwLock::new(s.clone()),
            })
        })
    }
}

impl SecurityStore for InMemorySecurityStore {
    fn find_user(&self, lookup: UserLookup<'_>) -> StoreResult<Option<User>> {
        self.read(|s| {
            let id = s.users.iter().find_map(|(id, row)| {
                let hit = match lookup {
                    UserLookup::Username(u) => row.username == u,
                    UserLookup::Email(e) => row.email == e,
                };
                hit.then_some(*id)
            });
            Ok(id.and_then(|id| s.user(id)))
        })
    }

    fn get_user_by_id(&self, id: UserId) -> StoreResult<Option<User>> {
        self.read(|s| Ok(s.user(id)))
    }

    fn list_users(&self) -> StoreResult<Vec<User>> {
        self.read(|s| Ok(s.users.keys().filter_map(|id| s.user(*id)).collect()))
    }

    fn add_user(&self, user: NewUser) -> StoreResult<User> {
        self.write(|s| {
            s.check_user_unique(&user.username, &user.email, None)?;
            s.check_roles_exist(&user.roles)?;
            let id = UserId::new(next(&mut s.seq.user));
            let mut roles = user.roles;
            roles.dedup();
            s.users.insert(
                id,
                UserRow {
                    username: user.username,
                    email: user.email,
                    first_name: user.first_name,
                    last_name: user.last_name,
                    password_hash: user.password_hash,
                    active: true,
                    last_login: None,
                    login_count: 0,
                    fail_login_count: 0,
                    roles,
                    audit: Audited::new(Utc::now()),
                },
            );
            s.user(id)
                .ok_or_else(|| StoreError::Storage("user vanished after insert".into()))
        })
    }

    fn update_user(&self, user: &User) -> StoreResult<()> {
        self.write(|s| {
            if !s.users.contains_key(&user.id) {
                return Err(StoreError::Integrity(format!("user {} does not exist", user.id)));
            }
            s.check_user_unique(&user.username, &user.email, Some(user.id))?;
            let roles: Vec<RoleId> = user.roles.iter().map(|r| r.id).collect();
            s.check_roles_exist(&roles)?;
            let mut audit = user.audit;
            audit.touch(Utc::now());
            s.users.insert(
                user.id,
                UserRow {
                    username: user.username.clone(),
                    email: user.email.clone(),
                    first_name: user.first_name.clone(),
                    last_name: user.last_name.clone(),
                    password_hash: user.password_hash.clone(),
                    active: user.active,
                    last_login: user.last_login,
                    login_count: user.login_count,
                    fail_login_count: user.fail_login_count,
                    roles,
                    audit,
                },
            );
            Ok(())
        })
    }

    fn count_users(&self) -> StoreResult<u64> {
        self.read(|s| Ok(s.users.len() as u64))
    }

    fn find_role(&self, name: &str) -> StoreResult<Option<Role>> {
        self.read(|s| {
            Ok(s.roles
                .iter()
                .find(|(_, r)| r.name == name)
                .and_then(|(id, _)| s.role(*id)))
        })
    }

    fn get_role_by_id(&self, id: RoleId) -> StoreResult<Option<Role>> {
        self.read(|s| Ok(s.role(id)))
    }

    fn add_role(&self, name: &str) -> StoreResult<Role> {
        self.write(|s| {
            let id = match s.roles.iter().find(|(_, r)| r.name == name) {
                Some((id, _)) => *id,
                None => {
                    let id = RoleId::new(next(&mut s.seq.role));
                    s.roles.insert(
                        id,
                        RoleRow {
                            name: name.to_string(),
                            grants: BTreeSet::new(),
                        },
                    );
                    id
                }
            };
            s.role(id)
                .ok_or_else(|| StoreError::Storage("role vanished after insert".into()))
        })
    }

    fn list_roles(&self) -> StoreResult<Vec<Role>> {
        self.read(|s| Ok(s.roles.keys().filter_map(|id| s.role(*id)).collect()))
    }

    fn delete_role(&self, id: RoleId) -> StoreResult<()> {
        self.write(|s| {
            if let Some((_, holder)) = s.users.iter().find(|(_, u)| u.roles.contains(&id)) {
                return Err(StoreError::Integrity(format!(
                    "role {id} is still assigned to user '{}'",
                    holder.username
                )));
            }
            s.roles.remove(&id);
            Ok(())
        })
    }

    fn find_permission(&self, name: &str) -> StoreResult<Option<Permission>> {
        self.read(|s| Ok(s.permission_id(name).and_then(|id| s.permission(id))))
    }

    fn add_permission(&self, name: &str) -> StoreResult<Permission> {
        self.write(|s| {
            let id = s.ensure_permission(name);
            s.permission(id)
                .ok_or_else(|| StoreError::Storage("permission vanished after insert".into()))
        })
    }

    fn delete_permission(&self, name: &str) -> StoreResult<bool> {
        self.write(|s| {
            let Some(id) = s.permission_id(name) else {
                return Ok(false);
            };
            if s.permission_views.values().any(|(p, _)| *p == id) {
                return Err(StoreError::Integrity(format!(
                    "permission '{name}' is referenced by a permission-view"
                )));
            }
            s.permissions.remove(&id);
            Ok(true)
        })
    }

    fn list_permissions(&self) -> StoreResult<Vec<Permission>> {
        self.read(|s| {
            Ok(s.permissions
                .keys()
                .filter_map(|id| s.permission(*id))
                .collect())
        })
    }

    fn find_view(&self, name: &str) -> StoreResult<Option<ViewMenu>> {
        self.read(|s| Ok(s.view_id(name).and_then(|id| s.view(id))))
    }

    fn add_view(&self, name: &str) -> StoreResult<ViewMenu> {
        self.write(|s| {
            let id = s.ensure_view(name);
            s.view(id)
                .ok_or_else(|| StoreError::Storage("view vanished after insert".into()))
        })
    }

    fn delete_view(&self, name: &str) -> StoreResult<bool> {
        self.write(|s| {
            let Some(id) = s.view_id(name) else {
                return Ok(false);
            };
            if s.permission_views.values().any(|(_, v)| *v == id) {
                return Err(StoreError::Integrity(format!(
                    "view '{name}' is referenced by a permission-view"
                )));
            }
            s.views.remove(&id);
            Ok(true)
        })
    }

    fn list_views(&self) -> StoreResult<Vec<ViewMenu>> {
        self.read(|s| Ok(s.views.keys().filter_map(|id| s.view(*id)).collect()))
    }

    fn find_permission_view(
        &self,
        permission: &str,
        view: &str,
    ) -> StoreResult<Option<PermissionView>> {
        self.read(|s| Ok(s.pv_id(permission, view).and_then(|id| s.permission_view(id))))
    }

    fn list_permission_views(&self, view: &str) -> StoreResult<Vec<PermissionView>> {
        self.read(|s| {
            let Some(v) = s.view_id(view) else {
                return Ok(Vec::new());
            };
            Ok(s.permission_views
                .iter()
                .filter(|(_, (_, pv_view))| *pv_view == v)
                .filter_map(|(id, _)| s.permission_view(*id))
                .collect())
        })
    }

    fn list_all_permission_views(&self) -> StoreResult<Vec<PermissionView>> {
        self.read(|s| {
            Ok(s.permission_views
                .keys()
                .filter_map(|id| s.permission_view(*id))
                .collect())
        })
    }

    fn add_permission_view(&self, permission: &str, view: &str) -> StoreResult<PermissionView> {
        self.write(|s| {
            let id = match s.pv_id(permission, view) {
                Some(id) => id,
                None => {
                    let p = s.ensure_permission(permission);
                    let v = s.ensure_view(view);
                    let id = PermissionViewId::new(next(&mut s.seq.permission_view));
                    s.permission_views.insert(id, (p, v));
                    id
                }
            };
            s.permission_view(id)
                .ok_or_else(|| StoreError::Storage("permission-view vanished after insert".into()))
        })
    }

    fn delete_permission_view(&self, permission: &str, view: &str) -> StoreResult<bool> {
        self.write(|s| {
            let Some(id) = s.pv_id(permission, view) else {
                return Ok(false);
            };
            if let Some(role) = s.roles.values().find(|r| r.grants.contains(&id)) {
                return Err(StoreError::Integrity(format!(
                    "'{permission}' on '{view}' is still held by role '{}'",
                    role.name
                )));
            }
            s.permission_views.remove(&id);
            Ok(true)
        })
    }

    fn link_role_permission(&self, role: RoleId, pv: PermissionViewId) -> StoreResult<()> {
        self.write(|s| {
            if !s.permission_views.contains_key(&pv) {
                return Err(StoreError::Integrity(format!(
                    "permission-view {pv} does not exist"
                )));
            }
            let row = s
                .roles
                .get_mut(&role)
                .ok_or_else(|| StoreError::Integrity(format!("role {role} does not exist")))?;
            row.grants.insert(pv);
            Ok(())
        })
    }

    fn unlink_role_permission(&self, role: RoleId, pv: PermissionViewId) -> StoreResult<()> {
        self.write(|s| {
            if let Some(row) = s.roles.get_mut(&role) {
                row.grants.remove(&pv);
            }
            Ok(())
        })
    }

    fn roles_holding(&self, pv: PermissionViewId) -> StoreResult<Vec<Role>> {
        self.read(|s| {
            Ok(s.roles
                .iter()
                .filter(|(_, r)| r.grants.contains(&pv))
                .filter_map(|(id, _)| s.role(*id))
                .collect())
        })
    }

    fn find_register_user(&self, registration_hash: &str) -> StoreResult<Option<RegisterUser>> {
        self.read(|s| {
            Ok(s.register_users
                .values()
                .find(|r| r.registration_hash == registration_hash)
                .cloned())
        })
    }

    fn get_register_user_by_id(&self, id: RegisterUserId) -> StoreResult<Option<RegisterUser>> {
        self.read(|s| Ok(s.register_users.get(&id).cloned()))
    }

    fn list_register_users(&self) -> StoreResult<Vec<RegisterUser>> {
        self.read(|s| Ok(s.register_users.values().cloned().collect()))
    }

    fn add_register_user(&self, reg: NewRegisterUser) -> StoreResult<RegisterUser> {
        self.write(|s| {
            for existing in s.register_users.values() {
                if existing.username == reg.username {
                    return Err(StoreError::Conflict(format!(
                        "registration for '{}' already pending",
                        reg.username
                    )));
                }
                if existing.registration_hash == reg.registration_hash {
                    return Err(StoreError::Conflict("registration hash collision".into()));
                }
            }
            let id = RegisterUserId::new(next(&mut s.seq.register_user));
            let record = RegisterUser {
                id,
                username: reg.username,
                email: reg.email,
                first_name: reg.first_name,
                last_name: reg.last_name,
                password_hash: reg.password_hash,
                registration_hash: reg.registration_hash,
                registration_date: Utc::now(),
            };
            s.register_users.insert(id, record.clone());
            Ok(record)
        })
    }

    fn delete_register_user(&self, id: RegisterUserId) -> StoreResult<bool> {
        self.write(|s| Ok(s.register_users.remove(&id).is_some()))
    }

    fn transaction(&self, work: &mut Work<'_>) -> SecurityResult<()> {
        self.run_isolated(|scratch| work(scratch))
    }
}

impl EncryptedColumnStore for InMemorySecurityStore {
    fn encrypted_columns(&self) -> StoreResult<Vec<EncryptedColumn>> {
        self.read(|s| {
            Ok(s.encrypted
                .iter()
                .map(|((table, column), t)| EncryptedColumn::new(table, column, t.kind))
                .collect())
        })
    }

    fn load_ciphertexts(&self, column: &EncryptedColumn) -> StoreResult<Vec<(i64, Vec<u8>)>> {
        self.read(|s| {
            let table = s
                .encrypted
                .get(&(column.table.clone(), column.column.clone()))
                .ok_or_else(|| StoreError::Storage(format!("unknown encrypted column {column}")))?;
            Ok(table.rows.iter().map(|(id, ct)| (*id, ct.clone())).collect())
        })
    }

    fn store_ciphertext(
        &self,
        column: &EncryptedColumn,
        id: i64,
        ciphertext: &[u8],
    ) -> StoreResult<()> {
        self.write(|s| {
            let table = s
                .encrypted
                .get_mut(&(column.table.clone(), column.column.clone()))
                .ok_or_else(|| StoreError::Storage(format!("unknown encrypted column {column}")))?;
            table.rows.insert(id, ciphertext.to_vec());
            Ok(())
        })
    }

    fn column_transaction(&self, work: &mut ColumnWork<'_>) -> SecurityResult<()> {
        self.run_isolated(|scratch| work(scratch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::in_transaction;

    fn new_user(username: &str, email: &str, roles: Vec<RoleId>) -> NewUser {
        NewUser {
            username: username.into(),
            first_name: "F".into(),
            last_name: "L".into(),
            email: email.into(),
            roles,
            password_hash: None,
        }
    }

    #[test]
    fn add_permission_view_is_idempotent() {
        let store = InMemorySecurityStore::new();
        let a = store.add_permission_view("can_list", "Orders").unwrap();
        let b = store.add_permission_view("can_list", "Orders").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.list_permissions().unwrap().len(), 1);
        assert_eq!(store.list_views().unwrap().len(), 1);
        assert_eq!(store.list_permission_views("Orders").unwrap().len(), 1);
        assert!(store.list_permission_views("Nope").unwrap().is_empty());
    }

    #[test]
    fn referenced_rows_cannot_be_deleted() {
        let store = InMemorySecurityStore::new();
        let pv = store.add_permission_view("can_add", "Orders").unwrap();
        let role = store.add_role("Sales").unwrap();
        store.link_role_permission(role.id, pv.id).unwrap();

        // Permission pinned by the permission-view.
        let err = store.delete_permission("can_add").unwrap_err();
        assert!(matches!(err, StoreError::Integrity(_)));
        assert!(store.find_permission("can_add").unwrap().is_some());
        assert!(matches!(store.delete_view("Orders"), Err(StoreError::Integrity(_))));

        // Permission-view pinned by the role.
        assert!(matches!(
            store.delete_permission_view("can_add", "Orders"),
            Err(StoreError::Integrity(_))
        ));
        store.unlink_role_permission(role.id, pv.id).unwrap();
        assert!(store.delete_permission_view("can_add", "Orders").unwrap());
        assert!(store.delete_permission("can_add").unwrap());
        assert!(store.delete_view("Orders").unwrap());
        assert!(!store.delete_view("Orders").unwrap());
    }

    #[test]
    fn user_uniqueness_and_role_pinning() {
        let store = InMemorySecurityStore::new();
        let role = store.add_role("Admin").unwrap();
        let alice = store
            .add_user(new_user("alice", "alice@example.com", vec![role.id]))
            .unwrap();
        assert_eq!(alice.roles[0].name, "Admin");
        assert!(alice.active);

        let dup_name = store.add_user(new_user("alice", "other@example.com", vec![]));
        assert!(matches!(dup_name, Err(StoreError::Conflict(_))));
        let dup_mail = store.add_user(new_user("bob", "alice@example.com", vec![]));
        assert!(matches!(dup_mail, Err(StoreError::Conflict(_))));
        let bad_role = store.add_user(new_user("carol", "c@example.com", vec![RoleId::new(99)]));
        assert!(matches!(bad_role, Err(StoreError::Integrity(_))));

        assert!(matches!(store.delete_role(role.id), Err(StoreError::Integrity(_))));
        assert_eq!(
            store.find_user(UserLookup::Email("alice@example.com")).unwrap().unwrap().id,
            alice.id
        );
        assert_eq!(store.count_users().unwrap(), 1);
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let store = InMemorySecurityStore::new();
        store.add_role("Keep").unwrap();

        let result: SecurityResult<()> = in_transaction(&store, |tx| {
            tx.add_role("Temp")?;
            tx.add_permission_view("can_list", "Orders")?;
            Err(SecurityError::provider("mail down"))
        });
        assert!(result.is_err());
        assert!(store.find_role("Temp").unwrap().is_none());
        assert!(store.list_all_permission_views().unwrap().is_empty());
        assert!(store.find_role("Keep").unwrap().is_some());

        let id = in_transaction(&store, |tx| Ok(tx.add_role("Committed")?.id)).unwrap();
        assert_eq!(store.find_role("Committed").unwrap().unwrap().id, id);
    }

    #[test]
    fn nested_scope_rolls_back_alone() {
        let store = InMemorySecurityStore::new();
        in_transaction(&store, |tx| {
            tx.add_role("Outer")?;
            let inner: SecurityResult<()> = in_transaction(tx, |tx2| {
                tx2.add_role("Inner")?;
                Err(SecurityError::conflict("boom"))
            });
            assert!(inner.is_err());
            Ok(())
        })
        .unwrap();
        assert!(store.find_role("Outer").unwrap().is_some());
        assert!(store.find_role("Inner").unwrap().is_none());
    }

    #[test]
    fn registration_rows() {
        let store = InMemorySecurityStore::new();
        let reg = store
            .add_register_user(NewRegisterUser {
                username: "dave".into(),
                email: "dave@example.com".into(),
                first_name: "Dave".into(),
                last_name: "D".into(),
                password_hash: None,
                registration_hash: "abc".into(),
            })
            .unwrap();
        assert_eq!(store.find_register_user("abc").unwrap().unwrap().id, reg.id);
        assert!(store.delete_register_user(reg.id).unwrap());
        assert!(store.find_register_user("abc").unwrap().is_none());
        assert!(!store.delete_register_user(reg.id).unwrap());
    }
}
