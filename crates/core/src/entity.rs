//! Entity trait and audit columns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Entity marker + minimal interface.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Copy + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> Self::Id;
}

/// Audit columns embedded in entities that track creation/modification time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Audited {
    pub created_on: DateTime<Utc>,
    pub changed_on: DateTime<Utc>,
}

impl Audited {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            created_on: now,
            changed_on: now,
        }
    }

    /// Bump `changed_on`; never moves it backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.changed_on {
            self.changed_on = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn touch_is_monotone() {
        let t0 = Utc::now();
        let mut a = Audited::new(t0);
        a.touch(t0 - Duration::seconds(5));
        assert_eq!(a.changed_on, t0);
        a.touch(t0 + Duration::seconds(5));
        assert_eq!(a.changed_on, t0 + Duration::seconds(5));
        assert_eq!(a.created_on, t0);
    }
}
