//! Secret rotation: re-encrypt every encrypted column after `SECRET_KEY`
//! changes.
//!
//! For each row: decrypts under the previous key → re-encrypted under the
//! current key; decrypts only under the current key → already migrated,
//! left alone; decrypts under neither → the run aborts naming the row.
//! Each column is rewritten in its own unit of work.

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, instrument};

use gatehouse_auth::{FieldCipher, SharedSecret};
use gatehouse_core::{SecurityError, SecurityResult};

use crate::store::EncryptedColumnStore;

/// Per-column outcome of a rotation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRotation {
    pub table: String,
    pub column: String,
    pub migrated: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationReport {
    pub columns: Vec<ColumnRotation>,
}

impl RotationReport {
    pub fn migrated(&self) -> usize {
        self.columns.iter().map(|c| c.migrated).sum()
    }
}

pub struct SecretRotator {
    previous: FieldCipher,
    current: FieldCipher,
}

fn cipher_for(secret: &SecretString) -> FieldCipher {
    FieldCipher::new(Arc::new(SharedSecret::new(secret.expose_secret().to_string())))
}

impl SecretRotator {
    pub fn new(previous: &SecretString, current: &SecretString) -> SecurityResult<Self> {
        if previous.expose_secret().is_empty() || current.expose_secret().is_empty() {
            return Err(SecurityError::config("both secret keys must be non-empty"));
        }
        if previous.expose_secret() == current.expose_secret() {
            return Err(SecurityError::config(
                "PREVIOUS_SECRET_KEY must differ from SECRET_KEY",
            ));
        }
        Ok(Self {
            previous: cipher_for(previous),
            current: cipher_for(current),
        })
    }

    #[instrument(skip_all, err)]
    pub fn rotate(&self, store: &dyn EncryptedColumnStore) -> SecurityResult<RotationReport> {
        let mut report = RotationReport::default();
        for column in store.encrypted_columns()? {
            let mut outcome = ColumnRotation {
                table: column.table.clone(),
                column: column.column.clone(),
                migrated: 0,
                skipped: 0,
            };
            store.column_transaction(&mut |tx| {
                outcome.migrated = 0;
                outcome.skipped = 0;
                for (id, ciphertext) in tx.load_ciphertexts(&column)? {
                    match self.previous.decrypt(&ciphertext, column.kind) {
                        Ok(plain) => {
                            let fresh = self.current.encrypt(&plain, column.kind)?;
                            tx.store_ciphertext(&column, id, &fresh)?;
                            outcome.migrated += 1;
                        }
                        Err(_) if self.current.decrypt(&ciphertext, column.kind).is_ok() => {
                            debug!(%column, id, "already under current key");
                            outcome.skipped += 1;
                        }
                        Err(_) => {
                            return Err(SecurityError::crypto(format!(
                                "{column} row {id} decrypts under neither the previous nor the current key"
                            )));
                        }
                    }
                }
                Ok(())
            })?;
            info!(
                table = %outcome.table,
                column = %outcome.column,
                migrated = outcome.migrated,
                skipped = outcome.skipped,
                "re-encrypted column"
            );
            report.columns.push(outcome);
        }
        Ok(report)
    }
}

impl core::fmt::Debug for SecretRotator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SecretRotator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{EncryptedColumn, InMemorySecurityStore};
    use gatehouse_auth::{FieldKind, FieldValue};

    fn secret(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    #[test]
    fn aborts_on_rows_neither_key_opens_and_keeps_column_intact() {
        let store = InMemorySecurityStore::new();
        let col = EncryptedColumn::new("dbs", "password", FieldKind::Text);
        store.register_encrypted_column(&col).unwrap();

        let stranger = cipher_for(&secret("k0"));
        let k1 = cipher_for(&secret("k1"));
        let ok = k1.encrypt(&FieldValue::Text("a".into()), FieldKind::Text).unwrap();
        let bad = stranger.encrypt(&FieldValue::Text("b".into()), FieldKind::Text).unwrap();
        store.store_ciphertext(&col, 1, &ok).unwrap();
        store.store_ciphertext(&col, 2, &bad).unwrap();

        let rotator = SecretRotator::new(&secret("k1"), &secret("k2")).unwrap();
        let err = rotator.rotate(&store).unwrap_err();
        assert!(matches!(&err, SecurityError::Crypto(m) if m.contains("dbs.password row 2")));
        assert_eq!(store.ciphertext(&col, 1).unwrap(), Some(ok));
    }

    #[test]
    fn rejects_empty_or_unchanged_keys() {
        assert!(SecretRotator::new(&secret(""), &secret("k2")).is_err());
        assert!(matches!(
            SecretRotator::new(&secret("k1"), &secret("k1")),
            Err(SecurityError::Config(_))
        ));
    }
}
