//! Per-request session context.
//!
//! The session middleware loads the [`Session`] named by the cookie and puts a
//! [`SessionContext`] into the request extensions; handlers read and update it
//! through this handle and the middleware persists whatever they leave behind.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use gatehouse_auth::Principal;
use gatehouse_infra::Session;

/// Session key holding pending flash messages.
pub const FLASHES_KEY: &str = "_flashes";

/// A one-shot message shown on the next page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flash {
    pub category: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct SessionContext {
    id: String,
    session: Arc<Mutex<Session>>,
}

impl SessionContext {
    pub fn new(id: String, session: Session) -> Self {
        Self {
            id,
            session: Arc::new(Mutex::new(session)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn principal(&self) -> Principal {
        self.lock().principal()
    }

    /// A copy of the current session, for work that spans `.await` points.
    pub fn snapshot(&self) -> Session {
        self.lock().clone()
    }

    /// Replace the session wholesale (pairs with [`Self::snapshot`]).
    pub fn replace(&self, session: Session) {
        *self.lock() = session;
    }

    pub fn update<T>(&self, f: impl FnOnce(&mut Session) -> T) -> T {
        f(&mut self.lock())
    }

    pub fn flash(&self, category: &str, message: impl Into<String>) {
        self.update(|session| {
            let mut flashes: Vec<Flash> = session.get(FLASHES_KEY).unwrap_or_default();
            flashes.push(Flash {
                category: category.to_string(),
                message: message.into(),
            });
            // Serializing plain strings cannot fail.
            let _ = session.insert(FLASHES_KEY, &flashes);
        });
    }

    /// Pending flash messages; reading them clears them.
    pub fn take_flashes(&self) -> Vec<Flash> {
        self.update(|session| {
            let flashes = session.get(FLASHES_KEY).unwrap_or_default();
            session.remove(FLASHES_KEY);
            flashes
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_core::UserId;

    #[test]
    fn flashes_are_read_once() {
        let ctx = SessionContext::new("abc".into(), Session::new());
        ctx.flash("danger", "Access is Denied");
        ctx.flash("info", "hello");

        let flashes = ctx.take_flashes();
        assert_eq!(flashes.len(), 2);
        assert_eq!(flashes[0].message, "Access is Denied");
        assert!(ctx.take_flashes().is_empty());
    }

    #[test]
    fn updates_are_visible_through_clones() {
        let ctx = SessionContext::new("abc".into(), Session::new());
        let other = ctx.clone();
        ctx.update(|s| s.set_user(UserId::new(4))).unwrap();
        assert_eq!(other.principal(), Principal::User(UserId::new(4)));
        assert_eq!(other.snapshot(), ctx.snapshot());
    }
}
