use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Default name of the role that holds every permission-view.
pub const DEFAULT_ADMIN_ROLE: &str = "Admin";

/// Default name of the role whose grants apply to anonymous users.
pub const DEFAULT_PUBLIC_ROLE: &str = "Public";

/// Role name.
///
/// The admin and public role names are configurable; these constants are only
/// the defaults used when the configuration leaves them unset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleName(Cow<'static, str>);

impl RoleName {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn admin() -> Self {
        Self(Cow::Borrowed(DEFAULT_ADMIN_ROLE))
    }

    pub fn public() -> Self {
        Self(Cow::Borrowed(DEFAULT_PUBLIC_ROLE))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for RoleName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
