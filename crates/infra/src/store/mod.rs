//! Persistence for the security model.
//!
//! [`SecurityStore`] is the only way the rest of the crate touches storage.
//! Two adapters ship with it: [`InMemorySecurityStore`] for tests and local
//! runs, and [`PostgresSecurityStore`] for production.

mod r#trait;

pub mod in_memory;
pub mod postgres;
pub mod schema;

pub use in_memory::InMemorySecurityStore;
pub use postgres::{PostgresSecurityStore, ensure_schema};
pub use r#trait::{
    ColumnWork, EncryptedColumn, EncryptedColumnStore, SecurityStore, StoreError, StoreResult,
    Work, in_transaction,
};
