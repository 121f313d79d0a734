use thiserror::Error;

use gatehouse_auth::FieldKind;
use gatehouse_core::{
    NewRegisterUser, NewUser, Permission, PermissionView, PermissionViewId, RegisterUser,
    RegisterUserId, Role, RoleId, SecurityError, SecurityResult, User, UserId, UserLookup,
    ViewMenu,
};

/// Storage-level failure.
///
/// Duplicate keys surface as `Conflict`, foreign-key violations as `Integrity`,
/// everything else as `Storage`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("storage error: {0}")]
    Storage(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for SecurityError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict(m) => SecurityError::Conflict(m),
            StoreError::Integrity(m) => SecurityError::Integrity(m),
            StoreError::Storage(m) => SecurityError::Storage(m),
        }
    }
}

/// Unit of work executed by [`SecurityStore::transaction`].
pub type Work<'a> = dyn FnMut(&dyn SecurityStore) -> SecurityResult<()> + 'a;

/// Persistence contract for the security model.
///
/// Synchronous by design: implementations backed by an async driver block on
/// their own runtime handle. Every entity returned is fully resolved (users
/// carry their roles, roles carry their permission-views).
pub trait SecurityStore: Send + Sync {
    // ── users ────────────────────────────────────────────────────────────────
    fn find_user(&self, lookup: UserLookup<'_>) -> StoreResult<Option<User>>;
    fn get_user_by_id(&self, id: UserId) -> StoreResult<Option<User>>;
    fn list_users(&self) -> StoreResult<Vec<User>>;
    fn add_user(&self, user: NewUser) -> StoreResult<User>;
    /// Persists scalar fields and replaces the user's role links with `user.roles`.
    fn update_user(&self, user: &User) -> StoreResult<()>;
    fn count_users(&self) -> StoreResult<u64>;

    // ── roles ────────────────────────────────────────────────────────────────
    fn find_role(&self, name: &str) -> StoreResult<Option<Role>>;
    fn get_role_by_id(&self, id: RoleId) -> StoreResult<Option<Role>>;
    /// Idempotent: returns the existing role when the name is taken.
    fn add_role(&self, name: &str) -> StoreResult<Role>;
    fn list_roles(&self) -> StoreResult<Vec<Role>>;
    /// Removes the role and its grant links. `Integrity` while users hold it.
    fn delete_role(&self, id: RoleId) -> StoreResult<()>;

    // ── permissions & views ──────────────────────────────────────────────────
    fn find_permission(&self, name: &str) -> StoreResult<Option<Permission>>;
    fn add_permission(&self, name: &str) -> StoreResult<Permission>;
    /// `Ok(false)` when absent; `Integrity` while a permission-view references it.
    fn delete_permission(&self, name: &str) -> StoreResult<bool>;
    fn list_permissions(&self) -> StoreResult<Vec<Permission>>;

    fn find_view(&self, name: &str) -> StoreResult<Option<ViewMenu>>;
    fn add_view(&self, name: &str) -> StoreResult<ViewMenu>;
    fn delete_view(&self, name: &str) -> StoreResult<bool>;
    fn list_views(&self) -> StoreResult<Vec<ViewMenu>>;

    // ── permission-views ─────────────────────────────────────────────────────
    fn find_permission_view(&self, permission: &str, view: &str)
    -> StoreResult<Option<PermissionView>>;
    /// Every permission-view pointing at `view`.
    fn list_permission_views(&self, view: &str) -> StoreResult<Vec<PermissionView>>;
    fn list_all_permission_views(&self) -> StoreResult<Vec<PermissionView>>;
    /// Creates the underlying permission and view when missing. Idempotent.
    fn add_permission_view(&self, permission: &str, view: &str) -> StoreResult<PermissionView>;
    /// `Integrity` while a role still holds it.
    fn delete_permission_view(&self, permission: &str, view: &str) -> StoreResult<bool>;

    /// Idempotent.
    fn link_role_permission(&self, role: RoleId, pv: PermissionViewId) -> StoreResult<()>;
    fn unlink_role_permission(&self, role: RoleId, pv: PermissionViewId) -> StoreResult<()>;
    fn roles_holding(&self, pv: PermissionViewId) -> StoreResult<Vec<Role>>;

    // ── registrations ────────────────────────────────────────────────────────
    fn find_register_user(&self, registration_hash: &str) -> StoreResult<Option<RegisterUser>>;
    fn get_register_user_by_id(&self, id: RegisterUserId) -> StoreResult<Option<RegisterUser>>;
    fn list_register_users(&self) -> StoreResult<Vec<RegisterUser>>;
    fn add_register_user(&self, reg: NewRegisterUser) -> StoreResult<RegisterUser>;
    fn delete_register_user(&self, id: RegisterUserId) -> StoreResult<bool>;

    // ── unit of work ─────────────────────────────────────────────────────────
    /// Run `work` so that everything it does commits together or not at all.
    /// Called on a store that is already inside a transaction, opens a nested
    /// scope (savepoint) that rolls back on its own.
    fn transaction(&self, work: &mut Work<'_>) -> SecurityResult<()>;
}

/// Run `f` in a unit of work and hand back its value.
pub fn in_transaction<T, F>(store: &dyn SecurityStore, f: F) -> SecurityResult<T>
where
    F: FnOnce(&dyn SecurityStore) -> SecurityResult<T>,
{
    let mut f = Some(f);
    let mut out = None;
    store.transaction(&mut |tx| {
        let f = f
            .take()
            .ok_or_else(|| SecurityError::storage("unit of work invoked twice"))?;
        out = Some(f(tx)?);
        Ok(())
    })?;
    out.ok_or_else(|| SecurityError::storage("unit of work produced no value"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Encrypted columns
// ─────────────────────────────────────────────────────────────────────────────

/// A column whose values were written by the field cipher.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EncryptedColumn {
    pub table: String,
    pub column: String,
    pub kind: FieldKind,
}

impl EncryptedColumn {
    pub fn new(table: impl Into<String>, column: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            kind,
        }
    }
}

impl core::fmt::Display for EncryptedColumn {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

pub type ColumnWork<'a> = dyn FnMut(&dyn EncryptedColumnStore) -> SecurityResult<()> + 'a;

/// Access to every encrypted column, for key rotation.
pub trait EncryptedColumnStore: Send + Sync {
    fn encrypted_columns(&self) -> StoreResult<Vec<EncryptedColumn>>;
    /// `(row id, ciphertext)` for every non-null value, ordered by id.
    fn load_ciphertexts(&self, column: &EncryptedColumn) -> StoreResult<Vec<(i64, Vec<u8>)>>;
    fn store_ciphertext(&self, column: &EncryptedColumn, id: i64, ciphertext: &[u8])
    -> StoreResult<()>;
    fn column_transaction(&self, work: &mut ColumnWork<'_>) -> SecurityResult<()>;
}
