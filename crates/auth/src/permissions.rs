use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Prefix every view-method permission carries on the wire (`can_list`).
pub const PERMISSION_PREFIX: &str = "can_";

/// Reserved permission name controlling menu visibility.
pub const MENU_ACCESS: &str = "menu_access";

/// Permission name.
///
/// Wire names such as `"can_list"` are kept verbatim; [`PermissionName::for_method`]
/// derives them from the method name so the prefix is never spelled by hand.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionName(Cow<'static, str>);

impl PermissionName {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    /// `list` → `can_list`. Names already carrying the prefix are kept as is.
    pub fn for_method(method: &str) -> Self {
        if method.starts_with(PERMISSION_PREFIX) {
            Self(Cow::Owned(method.to_string()))
        } else {
            Self(Cow::Owned(format!("{PERMISSION_PREFIX}{method}")))
        }
    }

    pub fn menu_access() -> Self {
        Self(Cow::Borrowed(MENU_ACCESS))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The method part of a `can_<method>` name, if it has one.
    pub fn method(&self) -> Option<&str> {
        self.0.strip_prefix(PERMISSION_PREFIX)
    }

    pub fn is_menu_access(&self) -> bool {
        self.as_str() == MENU_ACCESS
    }
}

impl core::fmt::Display for PermissionName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for PermissionName {
    fn from(value: &'static str) -> Self {
        Self(Cow::Borrowed(value))
    }
}

impl From<String> for PermissionName {
    fn from(value: String) -> Self {
        Self(Cow::Owned(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_prefixed_names() {
        assert_eq!(PermissionName::for_method("list").as_str(), "can_list");
        assert_eq!(PermissionName::for_method("can_show").as_str(), "can_show");
        assert_eq!(PermissionName::for_method("delete").method(), Some("delete"));
        assert_eq!(PermissionName::menu_access().method(), None);
        assert!(PermissionName::from("menu_access").is_menu_access());
    }
}
