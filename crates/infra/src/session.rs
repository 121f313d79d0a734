//! Login state kept between requests.
//!
//! The transport owns the cookie; the core only reads and writes named keys
//! on a [`Session`] and persists it through a [`SessionStore`].

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use rand::RngCore;
use rand::rngs::OsRng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use gatehouse_auth::{OAuthToken, Principal};
use gatehouse_core::{SecurityError, SecurityResult, UserId};

pub const USER_ID_KEY: &str = "user_id";
pub const OAUTH_KEY: &str = "oauth";
pub const OAUTH_PROVIDER_KEY: &str = "oauth_provider";
pub const OAUTH_STATE_KEY: &str = "oauth_state";
pub const OPENID_STATE_KEY: &str = "openid_state";

/// Named values attached to one browser session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    values: BTreeMap<String, JsonValue>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn insert<T: Serialize>(&mut self, key: &str, value: &T) -> SecurityResult<()> {
        let value = serde_json::to_value(value)
            .map_err(|e| SecurityError::storage(format!("session value '{key}': {e}")))?;
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn principal(&self) -> Principal {
        Principal::from(self.get::<UserId>(USER_ID_KEY))
    }

    pub fn set_user(&mut self, id: UserId) -> SecurityResult<()> {
        self.insert(USER_ID_KEY, &id)
    }

    pub fn oauth_token(&self) -> Option<OAuthToken> {
        self.get(OAUTH_KEY)
    }

    pub fn set_oauth_token(&mut self, token: &OAuthToken) -> SecurityResult<()> {
        self.insert(OAUTH_KEY, token)?;
        self.insert(OAUTH_PROVIDER_KEY, &token.provider)
    }

    pub fn clear_oauth(&mut self) {
        self.remove(OAUTH_KEY);
        self.remove(OAUTH_PROVIDER_KEY);
        self.remove(OAUTH_STATE_KEY);
    }

    /// Forget the user, any OAuth token and any pending OpenID login.
    pub fn logout(&mut self) {
        self.remove(USER_ID_KEY);
        self.remove(OPENID_STATE_KEY);
        self.clear_oauth();
    }
}

/// `len` bytes from the OS RNG, hex-encoded.
pub fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Random opaque session identifier (hex, 256 bits).
pub fn new_session_id() -> String {
    random_hex(32)
}

/// Server-side session persistence keyed by the cookie value.
pub trait SessionStore: Send + Sync {
    fn load(&self, id: &str) -> SecurityResult<Option<Session>>;
    fn save(&self, id: &str, session: &Session) -> SecurityResult<()>;
    fn delete(&self, id: &str) -> SecurityResult<()>;
}

/// In-memory session store. Intended for tests/dev and single-process runs.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemorySessionStore {
    fn load(&self, id: &str) -> SecurityResult<Option<Session>> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| SecurityError::storage("lock poisoned"))?;
        Ok(sessions.get(id).cloned())
    }

    fn save(&self, id: &str, session: &Session) -> SecurityResult<()> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| SecurityError::storage("lock poisoned"))?;
        sessions.insert(id.to_string(), session.clone());
        Ok(())
    }

    fn delete(&self, id: &str) -> SecurityResult<()> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| SecurityError::storage("lock poisoned"))?;
        sessions.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn principal_follows_user_key() {
        let mut session = Session::new();
        assert_eq!(session.principal(), Principal::Anonymous);
        session.set_user(UserId::new(7)).unwrap();
        assert_eq!(session.principal(), Principal::User(UserId::new(7)));
    }

    #[test]
    fn logout_clears_user_and_oauth() {
        let mut session = Session::new();
        session.set_user(UserId::new(1)).unwrap();
        let token = OAuthToken::new("github", "at", Some("rt".into()), Some(60), Utc::now());
        session.set_oauth_token(&token).unwrap();
        session.insert(OAUTH_STATE_KEY, &"xyz").unwrap();
        session.insert("locale", &"en").unwrap();

        assert_eq!(session.oauth_token(), Some(token));
        assert_eq!(session.get::<String>(OAUTH_PROVIDER_KEY).as_deref(), Some("github"));

        session.logout();
        assert_eq!(session.principal(), Principal::Anonymous);
        assert!(!session.contains(OAUTH_KEY));
        assert!(!session.contains(OAUTH_PROVIDER_KEY));
        assert!(!session.contains(OAUTH_STATE_KEY));
        assert!(session.contains("locale"));
    }

    #[test]
    fn store_roundtrip_and_ids() {
        let store = InMemorySessionStore::new();
        let id = new_session_id();
        assert_eq!(id.len(), 64);
        assert_ne!(id, new_session_id());

        let mut session = Session::new();
        session.set_user(UserId::new(3)).unwrap();
        store.save(&id, &session).unwrap();
        assert_eq!(store.load(&id).unwrap(), Some(session));
        store.delete(&id).unwrap();
        assert_eq!(store.load(&id).unwrap(), None);
    }
}
