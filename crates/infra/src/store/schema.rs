//! Relational layout of the security tables.
//!
//! One table per entity plus two join tables that carry only FK pairs.
//! Deleting a role or a user cascades to its own link rows; every other
//! reference is `NO ACTION`, so deleting a referenced row fails with `23503`.

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS ab_permission (
    id      BIGSERIAL PRIMARY KEY,
    name    VARCHAR(100) NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS ab_view_menu (
    id      BIGSERIAL PRIMARY KEY,
    name    VARCHAR(250) NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS ab_permission_view (
    id              BIGSERIAL PRIMARY KEY,
    permission_id   BIGINT NOT NULL REFERENCES ab_permission (id),
    view_menu_id    BIGINT NOT NULL REFERENCES ab_view_menu (id),
    UNIQUE (permission_id, view_menu_id)
);

CREATE TABLE IF NOT EXISTS ab_role (
    id      BIGSERIAL PRIMARY KEY,
    name    VARCHAR(64) NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS ab_permission_view_role (
    id                  BIGSERIAL PRIMARY KEY,
    permission_view_id  BIGINT NOT NULL REFERENCES ab_permission_view (id),
    role_id             BIGINT NOT NULL REFERENCES ab_role (id) ON DELETE CASCADE,
    UNIQUE (permission_view_id, role_id)
);

CREATE TABLE IF NOT EXISTS ab_user (
    id                  BIGSERIAL PRIMARY KEY,
    first_name          VARCHAR(64) NOT NULL,
    last_name           VARCHAR(64) NOT NULL,
    username            VARCHAR(64) NOT NULL UNIQUE,
    password            VARCHAR(256),
    active              BOOLEAN NOT NULL DEFAULT TRUE,
    email               VARCHAR(120) NOT NULL UNIQUE,
    last_login          TIMESTAMPTZ,
    login_count         INTEGER NOT NULL DEFAULT 0,
    fail_login_count    INTEGER NOT NULL DEFAULT 0,
    created_on          TIMESTAMPTZ NOT NULL DEFAULT now(),
    changed_on          TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS ab_user_role (
    id          BIGSERIAL PRIMARY KEY,
    user_id     BIGINT NOT NULL REFERENCES ab_user (id) ON DELETE CASCADE,
    role_id     BIGINT NOT NULL REFERENCES ab_role (id),
    UNIQUE (user_id, role_id)
);

CREATE TABLE IF NOT EXISTS ab_register_user (
    id                  BIGSERIAL PRIMARY KEY,
    first_name          VARCHAR(64) NOT NULL,
    last_name           VARCHAR(64) NOT NULL,
    username            VARCHAR(64) NOT NULL UNIQUE,
    password            VARCHAR(256),
    email               VARCHAR(64) NOT NULL,
    registration_date   TIMESTAMPTZ NOT NULL DEFAULT now(),
    registration_hash   VARCHAR(256) NOT NULL UNIQUE
);
"#;

/// Column comment prefix marking a column written by the field cipher:
/// `gatehouse:encrypted:<text|json|bytes>`.
pub const ENCRYPTED_COLUMN_TAG: &str = "gatehouse:encrypted:";

/// Statements of [`SCHEMA_SQL`], one per `CREATE`.
pub fn statements() -> impl Iterator<Item = &'static str> {
    SCHEMA_SQL
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_every_table() {
        let creates: Vec<&str> = statements().collect();
        assert_eq!(creates.len(), 8);
        assert!(creates.iter().all(|s| s.starts_with("CREATE TABLE IF NOT EXISTS")));
        assert!(SCHEMA_SQL.contains("ON DELETE CASCADE"));
    }
}
