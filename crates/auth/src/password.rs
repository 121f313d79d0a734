//! One-way password hashing with Argon2id.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{self, PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

use gatehouse_core::SecurityError;

/// Longest accepted password; longer inputs are rejected before hashing.
pub const MAX_PASSWORD_LENGTH: usize = 512;

#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("the password provided was too long")]
    TooLong,

    #[error("stored password hash is malformed")]
    MalformedHash(#[source] password_hash::Error),

    #[error("failed to hash password")]
    Hash(#[source] password_hash::Error),

    #[error("failed to verify password")]
    Verify(#[source] password_hash::Error),

    #[error("invalid argon2 parameters")]
    Params(#[source] argon2::Error),
}

impl From<PasswordError> for SecurityError {
    fn from(value: PasswordError) -> Self {
        match value {
            PasswordError::TooLong => SecurityError::validation(value.to_string()),
            other => SecurityError::crypto(other.to_string()),
        }
    }
}

/// Salted one-way hasher producing PHC strings (`$argon2id$...`).
#[derive(Clone)]
pub struct Hasher {
    argon2: Argon2<'static>,
}

impl Default for Hasher {
    fn default() -> Self {
        Self {
            argon2: Argon2::default(),
        }
    }
}

impl Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hasher with explicit cost parameters (memory in KiB, iterations,
    /// parallelism).
    pub fn with_params(m_cost: u32, t_cost: u32, p_cost: u32) -> Result<Self, PasswordError> {
        let params =
            argon2::Params::new(m_cost, t_cost, p_cost, None).map_err(PasswordError::Params)?;
        Ok(Self {
            argon2: Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params),
        })
    }

    pub fn hash(&self, password: &SecretString) -> Result<String, PasswordError> {
        let plain = password.expose_secret();
        if plain.len() > MAX_PASSWORD_LENGTH {
            return Err(PasswordError::TooLong);
        }
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2
            .hash_password(plain.as_bytes(), &salt)
            .map_err(PasswordError::Hash)?;
        Ok(hash.to_string())
    }

    /// `Ok(false)` on mismatch; `Err` only when the stored hash is unusable.
    pub fn verify(&self, password: &SecretString, hash: &str) -> Result<bool, PasswordError> {
        let plain = password.expose_secret();
        if plain.len() > MAX_PASSWORD_LENGTH {
            return Ok(false);
        }
        let parsed = PasswordHash::new(hash).map_err(PasswordError::MalformedHash)?;
        match self.argon2.verify_password(plain.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(password_hash::Error::Password) => Ok(false),
            Err(e) => Err(PasswordError::Verify(e)),
        }
    }
}

impl core::fmt::Debug for Hasher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Hasher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap() -> Hasher {
        Hasher::with_params(1024, 1, 1).unwrap()
    }

    fn secret(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    #[test]
    fn hash_then_verify() {
        let h = cheap();
        let hash = h.hash(&secret("hunter2")).unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(!hash.contains("hunter2"));
        assert!(h.verify(&secret("hunter2"), &hash).unwrap());
        assert!(!h.verify(&secret("hunter3"), &hash).unwrap());
    }

    #[test]
    fn salts_differ() {
        let h = cheap();
        let a = h.hash(&secret("same")).unwrap();
        let b = h.hash(&secret("same")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_overlong_and_malformed() {
        let h = cheap();
        let long = "x".repeat(MAX_PASSWORD_LENGTH + 1);
        assert!(matches!(h.hash(&secret(&long)), Err(PasswordError::TooLong)));
        assert!(matches!(
            h.verify(&secret("pw"), "not-a-phc-string"),
            Err(PasswordError::MalformedHash(_))
        ));
    }
}
