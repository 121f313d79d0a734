use serde::{Deserialize, Serialize};

use gatehouse_core::UserId;

/// Who is making a request.
///
/// Anonymous requests are evaluated against the public role only; there is
/// no implicit anonymous path around it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(tag = "kind", content = "user_id", rename_all = "snake_case")]
pub enum Principal {
    #[default]
    Anonymous,
    User(UserId),
}

impl Principal {
    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Self::Anonymous => None,
            Self::User(id) => Some(*id),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::User(_))
    }
}

impl From<Option<UserId>> for Principal {
    fn from(value: Option<UserId>) -> Self {
        value.map_or(Self::Anonymous, Self::User)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_tagged() {
        let json = serde_json::to_value(Principal::User(UserId::new(7))).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "user", "user_id": 7}));
        assert!(!Principal::from(None).is_authenticated());
    }
}
