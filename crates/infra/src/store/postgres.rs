//! Postgres-backed security store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `Conflict` | Duplicate username / email / name / registration hash |
//! | Database (foreign key violation) | `23503` | `Integrity` | Deleting a permission, view, permission-view or role that is still referenced |
//! | Database (check constraint violation) | `23514` | `Integrity` | Invalid data |
//! | Database (other) | Any other | `Storage` | Other database errors |
//! | PoolClosed / Other | N/A | `Storage` | Network errors, connection failures, etc. |
//!
//! ## Blocking
//!
//! [`SecurityStore`] is synchronous. Every call runs its queries on the
//! runtime handle captured at construction. Callers on a multi-thread runtime
//! are moved off the worker with `block_in_place`; on a current-thread runtime
//! the store must be driven from `spawn_blocking`.
//!
//! ## Units of work
//!
//! [`SecurityStore::transaction`] on a pooled store opens a database
//! transaction and hands the work a store bound to it. Calling `transaction`
//! again on that bound store issues a `SAVEPOINT`.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnection, PgPoolOptions, PgRow};
use sqlx::{Connection, PgPool, Postgres, Row, Transaction};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{instrument, warn};

use gatehouse_auth::FieldKind;
use gatehouse_core::{
    Audited, NewRegisterUser, NewUser, Permission, PermissionId, PermissionView,
    PermissionViewId, RegisterUser, RegisterUserId, Role, RoleId, SecurityResult,
    User, UserId, UserLookup, ViewMenu, ViewMenuId,
};

use super::r#trait::{
    ColumnWork, EncryptedColumn, EncryptedColumnStore, SecurityStore, StoreError, StoreResult,
    Work,
};
use super::schema::{ENCRYPTED_COLUMN_TAG, statements};

enum Conn {
    Pool(PgPool),
    Tx {
        tx: Mutex<Option<Transaction<'static, Postgres>>>,
        savepoints: AtomicU32,
    },
}

enum ConnGuard<'a> {
    Pooled(PoolConnection<Postgres>),
    Tx(MutexGuard<'a, Option<Transaction<'static, Postgres>>>),
}

impl ConnGuard<'_> {
    fn conn(&mut self) -> StoreResult<&mut PgConnection> {
        match self {
            Self::Pooled(c) => Ok(&mut **c),
            Self::Tx(guard) => guard
                .as_mut()
                .map(|tx| &mut **tx)
                .ok_or_else(|| StoreError::Storage("transaction already finished".into())),
        }
    }
}

/// Postgres-backed [`SecurityStore`] and [`EncryptedColumnStore`].
///
/// Uses SQLx connection pool which is thread-safe (Arc + Send + Sync).
pub struct PostgresSecurityStore {
    conn: Conn,
    handle: Handle,
}

impl PostgresSecurityStore {
    /// Wrap an existing pool. Must be called from within a tokio runtime.
    pub fn new(pool: PgPool) -> StoreResult<Self> {
        let handle = Handle::try_current().map_err(|_| {
            StoreError::Storage("PostgresSecurityStore requires a tokio runtime".into())
        })?;
        Ok(Self {
            conn: Conn::Pool(pool),
            handle,
        })
    }

    /// Connect, create missing tables and wrap the pool.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        ensure_schema(&pool).await?;
        Self::new(pool)
    }

    fn block<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        match Handle::try_current() {
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| self.handle.block_on(fut))
            }
            _ => self.handle.block_on(fut),
        }
    }

    async fn acquire(&self) -> StoreResult<ConnGuard<'_>> {
        match &self.conn {
            Conn::Pool(pool) => pool
                .acquire()
                .await
                .map(ConnGuard::Pooled)
                .map_err(|e| map_sqlx_error("acquire", e)),
            Conn::Tx { tx, .. } => tx
                .lock()
                .map(ConnGuard::Tx)
                .map_err(|_| StoreError::Storage("lock poisoned".into())),
        }
    }

    fn execute_raw(&self, sql: &str) -> StoreResult<()> {
        self.block(async {
            let mut guard = self.acquire().await?;
            sqlx::query(sql)
                .execute(guard.conn()?)
                .await
                .map_err(|e| map_sqlx_error("execute_raw", e))?;
            Ok(())
        })
    }

    fn finish(&self, commit: bool) -> StoreResult<()> {
        let Conn::Tx { tx, .. } = &self.conn else {
            return Ok(());
        };
        let taken = tx
            .lock()
            .map_err(|_| StoreError::Storage("lock poisoned".into()))?
            .take();
        let Some(tx) = taken else {
            return Ok(());
        };
        self.block(async move {
            if commit {
                tx.commit()
                    .await
                    .map_err(|e| map_sqlx_error("commit_transaction", e))
            } else {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))
            }
        })
    }

    /// Run `work` against a store bound to one transaction (or savepoint).
    fn scoped<W>(&self, work: W) -> SecurityResult<()>
    where
        W: FnOnce(&PostgresSecurityStore) -> SecurityResult<()>,
    {
        match &self.conn {
            Conn::Pool(pool) => {
                let tx = self.block(async {
                    pool.begin()
                        .await
                        .map_err(|e| map_sqlx_error("begin_transaction", e))
                })?;
                let bound = PostgresSecurityStore {
                    conn: Conn::Tx {
                        tx: Mutex::new(Some(tx)),
                        savepoints: AtomicU32::new(0),
                    },
                    handle: self.handle.clone(),
                };
                match work(&bound) {
                    Ok(()) => Ok(bound.finish(true)?),
                    Err(e) => {
                        if let Err(rollback) = bound.finish(false) {
                            warn!(error = %rollback, "rollback failed");
                        }
                        Err(e)
                    }
                }
            }
            Conn::Tx { savepoints, .. } => {
                let n = savepoints.fetch_add(1, Ordering::SeqCst) + 1;
                let name = format!("gatehouse_sp_{n}");
                self.execute_raw(&format!("SAVEPOINT {name}"))?;
                let result = work(self);
                let closing = match &result {
                    Ok(()) => format!("RELEASE SAVEPOINT {name}"),
                    Err(_) => format!("ROLLBACK TO SAVEPOINT {name}"),
                };
                let closed = self.execute_raw(&closing);
                savepoints.fetch_sub(1, Ordering::SeqCst);
                result?;
                Ok(closed?)
            }
        }
    }
}

/// Create every security table that does not exist yet.
pub async fn ensure_schema(pool: &PgPool) -> StoreResult<()> {
    for stmt in statements() {
        sqlx::query(stmt)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
    }
    Ok(())
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                Some("23503") | Some("23514") => StoreError::Integrity(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

// ─────────────────────────────────────────────────────────────────────────────
// Row mapping
// ─────────────────────────────────────────────────────────────────────────────

const USER_COLUMNS: &str = "id, username, email, first_name, last_name, password, active, \
     last_login, login_count, fail_login_count, created_on, changed_on";

const PV_SELECT: &str = r#"
    SELECT pv.id AS pv_id,
           p.id AS permission_id, p.name AS permission_name,
           v.id AS view_menu_id, v.name AS view_menu_name
    FROM ab_permission_view pv
    JOIN ab_permission p ON p.id = pv.permission_id
    JOIN ab_view_menu v ON v.id = pv.view_menu_id
"#;

struct UserRecord {
    id: i64,
    username: String,
    email: String,
    first_name: String,
    last_name: String,
    password: Option<String>,
    active: bool,
    last_login: Option<DateTime<Utc>>,
    login_count: i32,
    fail_login_count: i32,
    created_on: DateTime<Utc>,
    changed_on: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for UserRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(UserRecord {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
            email: row.try_get("email")?,
            first_name: row.try_get("first_name")?,
            last_name: row.try_get("last_name")?,
            password: row.try_get("password")?,
            active: row.try_get("active")?,
            last_login: row.try_get("last_login")?,
            login_count: row.try_get("login_count")?,
            fail_login_count: row.try_get("fail_login_count")?,
            created_on: row.try_get("created_on")?,
            changed_on: row.try_get("changed_on")?,
        })
    }
}

fn pv_from_row(row: &PgRow) -> Result<PermissionView, sqlx::Error> {
    Ok(PermissionView {
        id: PermissionViewId::new(row.try_get("pv_id")?),
        permission: Permission {
            id: PermissionId::new(row.try_get("permission_id")?),
            name: row.try_get("permission_name")?,
        },
        view_menu: ViewMenu {
            id: ViewMenuId::new(row.try_get("view_menu_id")?),
            name: row.try_get("view_menu_name")?,
        },
    })
}

fn register_user_from_row(row: &PgRow) -> Result<RegisterUser, sqlx::Error> {
    Ok(RegisterUser {
        id: RegisterUserId::new(row.try_get("id")?),
        username: row.try_get("username")?,
        email: row.try_get("email")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        password_hash: row.try_get("password")?,
        registration_hash: row.try_get("registration_hash")?,
        registration_date: row.try_get("registration_date")?,
    })
}

fn count_to_u32(n: i32) -> u32 {
    u32::try_from(n).unwrap_or(0)
}

// ─────────────────────────────────────────────────────────────────────────────
// Queries
// ─────────────────────────────────────────────────────────────────────────────

async fn load_roles(c: &mut PgConnection, ids: &[i64]) -> StoreResult<Vec<Role>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let roles = sqlx::query("SELECT id, name FROM ab_role WHERE id = ANY($1) ORDER BY id")
        .bind(ids)
        .fetch_all(&mut *c)
        .await
        .map_err(|e| map_sqlx_error("load_roles", e))?;

    let grants = sqlx::query(
        r#"
        SELECT pvr.role_id, pv.id AS pv_id,
               p.id AS permission_id, p.name AS permission_name,
               v.id AS view_menu_id, v.name AS view_menu_name
        FROM ab_permission_view_role pvr
        JOIN ab_permission_view pv ON pv.id = pvr.permission_view_id
        JOIN ab_permission p ON p.id = pv.permission_id
        JOIN ab_view_menu v ON v.id = pv.view_menu_id
        WHERE pvr.role_id = ANY($1)
        ORDER BY pv.id
        "#,
    )
    .bind(ids)
    .fetch_all(&mut *c)
    .await
    .map_err(|e| map_sqlx_error("load_role_grants", e))?;

    let mut by_role: BTreeMap<i64, Vec<PermissionView>> = BTreeMap::new();
    for row in &grants {
        let role_id: i64 = row
            .try_get("role_id")
            .map_err(|e| map_sqlx_error("decode_grant", e))?;
        let pv = pv_from_row(row).map_err(|e| map_sqlx_error("decode_grant", e))?;
        by_role.entry(role_id).or_default().push(pv);
    }

    roles
        .iter()
        .map(|row| {
            let id: i64 = row.try_get("id")?;
            Ok(Role {
                id: RoleId::new(id),
                name: row.try_get("name")?,
                permissions: by_role.remove(&id).unwrap_or_default(),
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .map_err(|e| map_sqlx_error("decode_role", e))
}

async fn hydrate_users(c: &mut PgConnection, records: Vec<UserRecord>) -> StoreResult<Vec<User>> {
    if records.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
    let links = sqlx::query(
        "SELECT user_id, role_id FROM ab_user_role WHERE user_id = ANY($1) ORDER BY role_id",
    )
    .bind(&ids)
    .fetch_all(&mut *c)
    .await
    .map_err(|e| map_sqlx_error("load_user_roles", e))?;

    let mut role_ids: Vec<i64> = Vec::new();
    let mut user_roles: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
    for row in &links {
        let user_id: i64 = row.try_get("user_id").map_err(|e| map_sqlx_error("decode_link", e))?;
        let role_id: i64 = row.try_get("role_id").map_err(|e| map_sqlx_error("decode_link", e))?;
        user_roles.entry(user_id).or_default().push(role_id);
        if !role_ids.contains(&role_id) {
            role_ids.push(role_id);
        }
    }
    let roles: BTreeMap<i64, Role> = load_roles(&mut *c, &role_ids)
        .await?
        .into_iter()
        .map(|r| (r.id.get(), r))
        .collect();

    Ok(records
        .into_iter()
        .map(|r| User {
            id: UserId::new(r.id),
            roles: user_roles
                .remove(&r.id)
                .unwrap_or_default()
                .iter()
                .filter_map(|rid| roles.get(rid).cloned())
                .collect(),
            username: r.username,
            email: r.email,
            first_name: r.first_name,
            last_name: r.last_name,
            password_hash: r.password,
            active: r.active,
            last_login: r.last_login,
            login_count: count_to_u32(r.login_count),
            fail_login_count: count_to_u32(r.fail_login_count),
            audit: Audited {
                created_on: r.created_on,
                changed_on: r.changed_on,
            },
        })
        .collect())
}

async fn fetch_users(
    c: &mut PgConnection,
    operation: &str,
    sql: &str,
    bind: Option<&str>,
) -> StoreResult<Vec<User>> {
    let mut query = sqlx::query_as::<_, UserRecord>(sql);
    if let Some(value) = bind {
        query = query.bind(value);
    }
    let records = query
        .fetch_all(&mut *c)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;
    hydrate_users(c, records).await
}

async fn user_by_id(c: &mut PgConnection, id: i64) -> StoreResult<Option<User>> {
    let record = sqlx::query_as::<_, UserRecord>(&format!(
        "SELECT {USER_COLUMNS} FROM ab_user WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(&mut *c)
    .await
    .map_err(|e| map_sqlx_error("get_user_by_id", e))?;
    match record {
        Some(r) => Ok(hydrate_users(c, vec![r]).await?.pop()),
        None => Ok(None),
    }
}

async fn role_by_id(c: &mut PgConnection, id: i64) -> StoreResult<Option<Role>> {
    Ok(load_roles(c, &[id]).await?.pop())
}

async fn find_named_id(
    c: &mut PgConnection,
    operation: &str,
    sql: &str,
    name: &str,
) -> StoreResult<Option<i64>> {
    sqlx::query_scalar::<_, i64>(sql)
        .bind(name)
        .fetch_optional(&mut *c)
        .await
        .map_err(|e| map_sqlx_error(operation, e))
}

async fn pv_by_names(
    c: &mut PgConnection,
    permission: &str,
    view: &str,
) -> StoreResult<Option<PermissionView>> {
    let row = sqlx::query(&format!("{PV_SELECT} WHERE p.name = $1 AND v.name = $2"))
        .bind(permission)
        .bind(view)
        .fetch_optional(&mut *c)
        .await
        .map_err(|e| map_sqlx_error("find_permission_view", e))?;
    row.as_ref()
        .map(pv_from_row)
        .transpose()
        .map_err(|e| map_sqlx_error("decode_permission_view", e))
}

async fn ensure_named(
    c: &mut PgConnection,
    table: &str,
    name: &str,
) -> StoreResult<i64> {
    sqlx::query(&format!(
        "INSERT INTO {table} (name) VALUES ($1) ON CONFLICT (name) DO NOTHING"
    ))
    .bind(name)
    .execute(&mut *c)
    .await
    .map_err(|e| map_sqlx_error("ensure_named", e))?;
    sqlx::query_scalar::<_, i64>(&format!("SELECT id FROM {table} WHERE name = $1"))
        .bind(name)
        .fetch_one(&mut *c)
        .await
        .map_err(|e| map_sqlx_error("ensure_named", e))
}

async fn replace_user_roles(c: &mut PgConnection, user: i64, roles: &[i64]) -> StoreResult<()> {
    sqlx::query("DELETE FROM ab_user_role WHERE user_id = $1")
        .bind(user)
        .execute(&mut *c)
        .await
        .map_err(|e| map_sqlx_error("clear_user_roles", e))?;
    for role in roles {
        sqlx::query(
            "INSERT INTO ab_user_role (user_id, role_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(user)
        .bind(role)
        .execute(&mut *c)
        .await
        .map_err(|e| map_sqlx_error("link_user_role", e))?;
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// SecurityStore
// ─────────────────────────────────────────────────────────────────────────────

impl SecurityStore for PostgresSecurityStore {
    #[instrument(skip(self), err)]
    fn find_user(&self, lookup: UserLookup<'_>) -> StoreResult<Option<User>> {
        let (sql, value) = match lookup {
            UserLookup::Username(u) => (
                format!("SELECT {USER_COLUMNS} FROM ab_user WHERE username = $1"),
                u,
            ),
            UserLookup::Email(e) => (
                format!("SELECT {USER_COLUMNS} FROM ab_user WHERE email = $1"),
                e,
            ),
        };
        self.block(async {
            let mut guard = self.acquire().await?;
            Ok(fetch_users(guard.conn()?, "find_user", &sql, Some(value))
                .await?
                .pop())
        })
    }

    fn get_user_by_id(&self, id: UserId) -> StoreResult<Option<User>> {
        self.block(async {
            let mut guard = self.acquire().await?;
            user_by_id(guard.conn()?, id.get()).await
        })
    }

    fn list_users(&self) -> StoreResult<Vec<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM ab_user ORDER BY id");
        self.block(async {
            let mut guard = self.acquire().await?;
            fetch_users(guard.conn()?, "list_users", &sql, None).await
        })
    }

    #[instrument(skip(self, user), fields(username = %user.username), err)]
    fn add_user(&self, user: NewUser) -> StoreResult<User> {
        self.block(async {
            let mut guard = self.acquire().await?;
            let mut tx = guard
                .conn()?
                .begin()
                .await
                .map_err(|e| map_sqlx_error("begin_transaction", e))?;
            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO ab_user (first_name, last_name, username, password, active, email)
                VALUES ($1, $2, $3, $4, TRUE, $5)
                RETURNING id
                "#,
            )
            .bind(&user.first_name)
            .bind(&user.last_name)
            .bind(&user.username)
            .bind(&user.password_hash)
            .bind(&user.email)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_user", e))?;
            let roles: Vec<i64> = user.roles.iter().map(|r| r.get()).collect();
            replace_user_roles(&mut tx, id, &roles).await?;
            let created = user_by_id(&mut tx, id)
                .await?
                .ok_or_else(|| StoreError::Storage("user vanished after insert".into()))?;
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))?;
            Ok(created)
        })
    }

    #[instrument(skip(self, user), fields(user_id = %user.id), err)]
    fn update_user(&self, user: &User) -> StoreResult<()> {
        self.block(async {
            let mut guard = self.acquire().await?;
            let mut tx = guard
                .conn()?
                .begin()
                .await
                .map_err(|e| map_sqlx_error("begin_transaction", e))?;
            let updated = sqlx::query(
                r#"
                UPDATE ab_user
                SET first_name = $2, last_name = $3, username = $4, password = $5,
                    active = $6, email = $7, last_login = $8, login_count = $9,
                    fail_login_count = $10, changed_on = now()
                WHERE id = $1
                "#,
            )
            .bind(user.id.get())
            .bind(&user.first_name)
            .bind(&user.last_name)
            .bind(&user.username)
            .bind(&user.password_hash)
            .bind(user.active)
            .bind(&user.email)
            .bind(user.last_login)
            .bind(i32::try_from(user.login_count).unwrap_or(i32::MAX))
            .bind(i32::try_from(user.fail_login_count).unwrap_or(i32::MAX))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update_user", e))?;
            if updated.rows_affected() == 0 {
                return Err(StoreError::Integrity(format!("user {} does not exist", user.id)));
            }
            let roles: Vec<i64> = user.roles.iter().map(|r| r.id.get()).collect();
            replace_user_roles(&mut tx, user.id.get(), &roles).await?;
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))
        })
    }

    fn count_users(&self) -> StoreResult<u64> {
        self.block(async {
            let mut guard = self.acquire().await?;
            let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ab_user")
                .fetch_one(guard.conn()?)
                .await
                .map_err(|e| map_sqlx_error("count_users", e))?;
            Ok(u64::try_from(n).unwrap_or(0))
        })
    }

    fn find_role(&self, name: &str) -> StoreResult<Option<Role>> {
        self.block(async {
            let mut guard = self.acquire().await?;
            let c = guard.conn()?;
            match find_named_id(c, "find_role", "SELECT id FROM ab_role WHERE name = $1", name)
                .await?
            {
                Some(id) => role_by_id(c, id).await,
                None => Ok(None),
            }
        })
    }

    fn get_role_by_id(&self, id: RoleId) -> StoreResult<Option<Role>> {
        self.block(async {
            let mut guard = self.acquire().await?;
            role_by_id(guard.conn()?, id.get()).await
        })
    }

    fn add_role(&self, name: &str) -> StoreResult<Role> {
        self.block(async {
            let mut guard = self.acquire().await?;
            let c = guard.conn()?;
            let id = ensure_named(c, "ab_role", name).await?;
            role_by_id(c, id)
                .await?
                .ok_or_else(|| StoreError::Storage("role vanished after insert".into()))
        })
    }

    fn list_roles(&self) -> StoreResult<Vec<Role>> {
        self.block(async {
            let mut guard = self.acquire().await?;
            let c = guard.conn()?;
            let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM ab_role ORDER BY id")
                .fetch_all(&mut *c)
                .await
                .map_err(|e| map_sqlx_error("list_roles", e))?;
            load_roles(c, &ids).await
        })
    }

    fn delete_role(&self, id: RoleId) -> StoreResult<()> {
        self.block(async {
            let mut guard = self.acquire().await?;
            let mut tx = guard
                .conn()?
                .begin()
                .await
                .map_err(|e| map_sqlx_error("begin_transaction", e))?;
            sqlx::query("DELETE FROM ab_role WHERE id = $1")
                .bind(id.get())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("delete_role", e))?;
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))
        })
    }

    fn find_permission(&self, name: &str) -> StoreResult<Option<Permission>> {
        self.block(async {
            let mut guard = self.acquire().await?;
            let id = find_named_id(
                guard.conn()?,
                "find_permission",
                "SELECT id FROM ab_permission WHERE name = $1",
                name,
            )
            .await?;
            Ok(id.map(|id| Permission {
                id: PermissionId::new(id),
                name: name.to_string(),
            }))
        })
    }

    fn add_permission(&self, name: &str) -> StoreResult<Permission> {
        self.block(async {
            let mut guard = self.acquire().await?;
            let id = ensure_named(guard.conn()?, "ab_permission", name).await?;
            Ok(Permission {
                id: PermissionId::new(id),
                name: name.to_string(),
            })
        })
    }

    fn delete_permission(&self, name: &str) -> StoreResult<bool> {
        self.block(async {
            let mut guard = self.acquire().await?;
            let mut tx = guard
                .conn()?
                .begin()
                .await
                .map_err(|e| map_sqlx_error("begin_transaction", e))?;
            let done = sqlx::query("DELETE FROM ab_permission WHERE name = $1")
                .bind(name)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("delete_permission", e))?;
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))?;
            Ok(done.rows_affected() > 0)
        })
    }

    fn list_permissions(&self) -> StoreResult<Vec<Permission>> {
        self.block(async {
            let mut guard = self.acquire().await?;
            let rows = sqlx::query("SELECT id, name FROM ab_permission ORDER BY id")
                .fetch_all(guard.conn()?)
                .await
                .map_err(|e| map_sqlx_error("list_permissions", e))?;
            rows.iter()
                .map(|r| {
                    Ok(Permission {
                        id: PermissionId::new(r.try_get("id")?),
                        name: r.try_get("name")?,
                    })
                })
                .collect::<Result<Vec<_>, sqlx::Error>>()
                .map_err(|e| map_sqlx_error("decode_permission", e))
        })
    }

    fn find_view(&self, name: &str) -> StoreResult<Option<ViewMenu>> {
        self.block(async {
            let mut guard = self.acquire().await?;
            let id = find_named_id(
                guard.conn()?,
                "find_view",
                "SELECT id FROM ab_view_menu WHERE name = $1",
                name,
            )
            .await?;
            Ok(id.map(|id| ViewMenu {
                id: ViewMenuId::new(id),
                name: name.to_string(),
            }))
        })
    }

    fn add_view(&self, name: &str) -> StoreResult<ViewMenu> {
        self.block(async {
            let mut guard = self.acquire().await?;
            let id = ensure_named(guard.conn()?, "ab_view_menu", name).await?;
            Ok(ViewMenu {
                id: ViewMenuId::new(id),
                name: name.to_string(),
            })
        })
    }

    fn delete_view(&self, name: &str) -> StoreResult<bool> {
        self.block(async {
            let mut guard = self.acquire().await?;
            let mut tx = guard
                .conn()?
                .begin()
                .await
                .map_err(|e| map_sqlx_error("begin_transaction", e))?;
            let done = sqlx::query("DELETE FROM ab_view_menu WHERE name = $1")
                .bind(name)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("delete_view", e))?;
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))?;
            Ok(done.rows_affected() > 0)
        })
    }

    fn list_views(&self) -> StoreResult<Vec<ViewMenu>> {
        self.block(async {
            let mut guard = self.acquire().await?;
            let rows = sqlx::query("SELECT id, name FROM ab_view_menu ORDER BY id")
                .fetch_all(guard.conn()?)
                .await
                .map_err(|e| map_sqlx_error("list_views", e))?;
            rows.iter()
                .map(|r| {
                    Ok(ViewMenu {
                        id: ViewMenuId::new(r.try_get("id")?),
                        name: r.try_get("name")?,
                    })
                })
                .collect::<Result<Vec<_>, sqlx::Error>>()
                .map_err(|e| map_sqlx_error("decode_view", e))
        })
    }

    fn find_permission_view(
        &self,
        permission: &str,
        view: &str,
    ) -> StoreResult<Option<PermissionView>> {
        self.block(async {
            let mut guard = self.acquire().await?;
            pv_by_names(guard.conn()?, permission, view).await
        })
    }

    fn list_permission_views(&self, view: &str) -> StoreResult<Vec<PermissionView>> {
        let sql = format!("{PV_SELECT} WHERE v.name = $1 ORDER BY pv.id");
        self.block(async {
            let mut guard = self.acquire().await?;
            let rows = sqlx::query(&sql)
                .bind(view)
                .fetch_all(guard.conn()?)
                .await
                .map_err(|e| map_sqlx_error("list_permission_views", e))?;
            rows.iter()
                .map(pv_from_row)
                .collect::<Result<Vec<_>, sqlx::Error>>()
                .map_err(|e| map_sqlx_error("decode_permission_view", e))
        })
    }

    fn list_all_permission_views(&self) -> StoreResult<Vec<PermissionView>> {
        let sql = format!("{PV_SELECT} ORDER BY pv.id");
        self.block(async {
            let mut guard = self.acquire().await?;
            let rows = sqlx::query(&sql)
                .fetch_all(guard.conn()?)
                .await
                .map_err(|e| map_sqlx_error("list_all_permission_views", e))?;
            rows.iter()
                .map(pv_from_row)
                .collect::<Result<Vec<_>, sqlx::Error>>()
                .map_err(|e| map_sqlx_error("decode_permission_view", e))
        })
    }

    #[instrument(skip(self), err)]
    fn add_permission_view(&self, permission: &str, view: &str) -> StoreResult<PermissionView> {
        self.block(async {
            let mut guard = self.acquire().await?;
            let c = guard.conn()?;
            if let Some(existing) = pv_by_names(c, permission, view).await? {
                return Ok(existing);
            }
            let p = ensure_named(c, "ab_permission", permission).await?;
            let v = ensure_named(c, "ab_view_menu", view).await?;
            sqlx::query(
                r#"
                INSERT INTO ab_permission_view (permission_id, view_menu_id)
                VALUES ($1, $2)
                ON CONFLICT (permission_id, view_menu_id) DO NOTHING
                "#,
            )
            .bind(p)
            .bind(v)
            .execute(&mut *c)
            .await
            .map_err(|e| map_sqlx_error("insert_permission_view", e))?;
            pv_by_names(c, permission, view).await?.ok_or_else(|| {
                StoreError::Storage("permission-view vanished after insert".into())
            })
        })
    }

    #[instrument(skip(self), err)]
    fn delete_permission_view(&self, permission: &str, view: &str) -> StoreResult<bool> {
        self.block(async {
            let mut guard = self.acquire().await?;
            let mut tx = guard
                .conn()?
                .begin()
                .await
                .map_err(|e| map_sqlx_error("begin_transaction", e))?;
            let Some(pv) = pv_by_names(&mut tx, permission, view).await? else {
                return Ok(false);
            };
            sqlx::query("DELETE FROM ab_permission_view WHERE id = $1")
                .bind(pv.id.get())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("delete_permission_view", e))?;
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))?;
            Ok(true)
        })
    }

    fn link_role_permission(&self, role: RoleId, pv: PermissionViewId) -> StoreResult<()> {
        self.block(async {
            let mut guard = self.acquire().await?;
            let mut tx = guard
                .conn()?
                .begin()
                .await
                .map_err(|e| map_sqlx_error("begin_transaction", e))?;
            sqlx::query(
                r#"
                INSERT INTO ab_permission_view_role (permission_view_id, role_id)
                VALUES ($1, $2)
                ON CONFLICT (permission_view_id, role_id) DO NOTHING
                "#,
            )
            .bind(pv.get())
            .bind(role.get())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("link_role_permission", e))?;
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))
        })
    }

    fn unlink_role_permission(&self, role: RoleId, pv: PermissionViewId) -> StoreResult<()> {
        self.block(async {
            let mut guard = self.acquire().await?;
            sqlx::query(
                "DELETE FROM ab_permission_view_role WHERE permission_view_id = $1 AND role_id = $2",
            )
            .bind(pv.get())
            .bind(role.get())
            .execute(guard.conn()?)
            .await
            .map_err(|e| map_sqlx_error("unlink_role_permission", e))?;
            Ok(())
        })
    }

    fn roles_holding(&self, pv: PermissionViewId) -> StoreResult<Vec<Role>> {
        self.block(async {
            let mut guard = self.acquire().await?;
            let c = guard.conn()?;
            let ids: Vec<i64> = sqlx::query_scalar(
                "SELECT role_id FROM ab_permission_view_role WHERE permission_view_id = $1 ORDER BY role_id",
            )
            .bind(pv.get())
            .fetch_all(&mut *c)
            .await
            .map_err(|e| map_sqlx_error("roles_holding", e))?;
            load_roles(c, &ids).await
        })
    }

    fn find_register_user(&self, registration_hash: &str) -> StoreResult<Option<RegisterUser>> {
        self.block(async {
            let mut guard = self.acquire().await?;
            let row = sqlx::query("SELECT * FROM ab_register_user WHERE registration_hash = $1")
                .bind(registration_hash)
                .fetch_optional(guard.conn()?)
                .await
                .map_err(|e| map_sqlx_error("find_register_user", e))?;
            row.as_ref()
                .map(register_user_from_row)
                .transpose()
                .map_err(|e| map_sqlx_error("decode_register_user", e))
        })
    }

    fn get_register_user_by_id(&self, id: RegisterUserId) -> StoreResult<Option<RegisterUser>> {
        self.block(async {
            let mut guard = self.acquire().await?;
            let row = sqlx::query("SELECT * FROM ab_register_user WHERE id = $1")
                .bind(id.get())
                .fetch_optional(guard.conn()?)
                .await
                .map_err(|e| map_sqlx_error("get_register_user", e))?;
            row.as_ref()
                .map(register_user_from_row)
                .transpose()
                .map_err(|e| map_sqlx_error("decode_register_user", e))
        })
    }

    fn list_register_users(&self) -> StoreResult<Vec<RegisterUser>> {
        self.block(async {
            let mut guard = self.acquire().await?;
            let rows = sqlx::query("SELECT * FROM ab_register_user ORDER BY id")
                .fetch_all(guard.conn()?)
                .await
                .map_err(|e| map_sqlx_error("list_register_users", e))?;
            rows.iter()
                .map(register_user_from_row)
                .collect::<Result<Vec<_>, sqlx::Error>>()
                .map_err(|e| map_sqlx_error("decode_register_user", e))
        })
    }

    #[instrument(skip(self, reg), fields(username = %reg.username), err)]
    fn add_register_user(&self, reg: NewRegisterUser) -> StoreResult<RegisterUser> {
        self.block(async {
            let mut guard = self.acquire().await?;
            let mut tx = guard
                .conn()?
                .begin()
                .await
                .map_err(|e| map_sqlx_error("begin_transaction", e))?;
            let row = sqlx::query(
                r#"
                INSERT INTO ab_register_user
                    (first_name, last_name, username, password, email, registration_hash)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING *
                "#,
            )
            .bind(&reg.first_name)
            .bind(&reg.last_name)
            .bind(&reg.username)
            .bind(&reg.password_hash)
            .bind(&reg.email)
            .bind(&reg.registration_hash)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_register_user", e))?;
            let record =
                register_user_from_row(&row).map_err(|e| map_sqlx_error("decode_register_user", e))?;
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))?;
            Ok(record)
        })
    }

    fn delete_register_user(&self, id: RegisterUserId) -> StoreResult<bool> {
        self.block(async {
            let mut guard = self.acquire().await?;
            let done = sqlx::query("DELETE FROM ab_register_user WHERE id = $1")
                .bind(id.get())
                .execute(guard.conn()?)
                .await
                .map_err(|e| map_sqlx_error("delete_register_user", e))?;
            Ok(done.rows_affected() > 0)
        })
    }

    fn transaction(&self, work: &mut Work<'_>) -> SecurityResult<()> {
        self.scoped(|bound| work(bound))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// EncryptedColumnStore
// ─────────────────────────────────────────────────────────────────────────────

impl EncryptedColumnStore for PostgresSecurityStore {
    /// Columns whose comment is `gatehouse:encrypted:<kind>` in the current schema.
    fn encrypted_columns(&self) -> StoreResult<Vec<EncryptedColumn>> {
        self.block(async {
            let mut guard = self.acquire().await?;
            let rows = sqlx::query(
                r#"
                SELECT c.relname AS table_name, a.attname AS column_name, d.description
                FROM pg_catalog.pg_description d
                JOIN pg_catalog.pg_class c ON c.oid = d.objoid
                JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
                JOIN pg_catalog.pg_attribute a ON a.attrelid = c.oid AND a.attnum = d.objsubid
                WHERE n.nspname = current_schema()
                  AND d.objsubid > 0
                  AND d.description LIKE $1
                ORDER BY c.relname, a.attname
                "#,
            )
            .bind(format!("{ENCRYPTED_COLUMN_TAG}%"))
            .fetch_all(guard.conn()?)
            .await
            .map_err(|e| map_sqlx_error("encrypted_columns", e))?;

            let mut columns = Vec::with_capacity(rows.len());
            for row in &rows {
                let table: String = row
                    .try_get("table_name")
                    .map_err(|e| map_sqlx_error("decode_column", e))?;
                let column: String = row
                    .try_get("column_name")
                    .map_err(|e| map_sqlx_error("decode_column", e))?;
                let description: String = row
                    .try_get("description")
                    .map_err(|e| map_sqlx_error("decode_column", e))?;
                let tag = description.trim_start_matches(ENCRYPTED_COLUMN_TAG);
                match FieldKind::parse(tag) {
                    Some(kind) => columns.push(EncryptedColumn::new(table, column, kind)),
                    None => warn!(%table, %column, tag, "unknown encrypted column kind; skipping"),
                }
            }
            Ok(columns)
        })
    }

    fn load_ciphertexts(&self, column: &EncryptedColumn) -> StoreResult<Vec<(i64, Vec<u8>)>> {
        let sql = format!(
            "SELECT id, {col} AS value FROM {table} WHERE {col} IS NOT NULL ORDER BY id",
            col = quote_ident(&column.column),
            table = quote_ident(&column.table),
        );
        self.block(async {
            let mut guard = self.acquire().await?;
            let rows = sqlx::query(&sql)
                .fetch_all(guard.conn()?)
                .await
                .map_err(|e| map_sqlx_error("load_ciphertexts", e))?;
            rows.iter()
                .map(|r| Ok((r.try_get::<i64, _>("id")?, r.try_get::<Vec<u8>, _>("value")?)))
                .collect::<Result<Vec<_>, sqlx::Error>>()
                .map_err(|e| map_sqlx_error("decode_ciphertext", e))
        })
    }

    fn store_ciphertext(
        &self,
        column: &EncryptedColumn,
        id: i64,
        ciphertext: &[u8],
    ) -> StoreResult<()> {
        let sql = format!(
            "UPDATE {table} SET {col} = $1 WHERE id = $2",
            col = quote_ident(&column.column),
            table = quote_ident(&column.table),
        );
        self.block(async {
            let mut guard = self.acquire().await?;
            sqlx::query(&sql)
                .bind(ciphertext)
                .bind(id)
                .execute(guard.conn()?)
                .await
                .map_err(|e| map_sqlx_error("store_ciphertext", e))?;
            Ok(())
        })
    }

    fn column_transaction(&self, work: &mut ColumnWork<'_>) -> SecurityResult<()> {
        self.scoped(|bound| work(bound))
    }
}
