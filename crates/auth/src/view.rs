//! Explicit view and menu declarations.
//!
//! A view is described by its stable name, the URLs it serves and the
//! permissions it exposes. Startup walks these descriptions; nothing is
//! discovered by reflection.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::permissions::PermissionName;

/// One URL rule served by a view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewRoute {
    pub path: String,
    pub methods: Vec<String>,
    pub handler: String,
}

/// A handler method of a view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewMethod {
    pub name: String,
    /// Overrides the method name when deriving `can_<name>`.
    pub permission_name: Option<String>,
    /// Unprotected methods expose no permission.
    pub protected: bool,
}

impl ViewMethod {
    pub fn protected(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            permission_name: None,
            protected: true,
        }
    }

    pub fn public(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            permission_name: None,
            protected: false,
        }
    }

    pub fn with_permission_name(mut self, name: impl Into<String>) -> Self {
        self.permission_name = Some(name.into());
        self
    }

    pub fn permission(&self) -> Option<PermissionName> {
        if !self.protected {
            return None;
        }
        let base = self.permission_name.as_deref().unwrap_or(&self.name);
        Some(PermissionName::for_method(base))
    }
}

/// Declaration of a view: stable name, routes, methods and optional explicit
/// `base_permissions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewDescriptor {
    pub name: String,
    pub routes: Vec<ViewRoute>,
    pub methods: Vec<ViewMethod>,
    pub base_permissions: Option<Vec<PermissionName>>,
}

/// What startup sees of a view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViewDescription {
    pub name: String,
    pub urls: Vec<ViewRoute>,
    pub permissions: Vec<PermissionName>,
}

impl ViewDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            routes: Vec::new(),
            methods: Vec::new(),
            base_permissions: None,
        }
    }

    pub fn route(
        mut self,
        path: impl Into<String>,
        methods: &[&str],
        handler: impl Into<String>,
    ) -> Self {
        self.routes.push(ViewRoute {
            path: path.into(),
            methods: methods.iter().map(|m| m.to_string()).collect(),
            handler: handler.into(),
        });
        self
    }

    pub fn method(mut self, method: ViewMethod) -> Self {
        self.methods.push(method);
        self
    }

    /// Protected methods named in `names`, in order.
    pub fn protected_methods(mut self, names: &[&str]) -> Self {
        self.methods
            .extend(names.iter().map(|n| ViewMethod::protected(*n)));
        self
    }

    pub fn with_base_permissions<I, P>(mut self, perms: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PermissionName>,
    {
        self.base_permissions = Some(perms.into_iter().map(Into::into).collect());
        self
    }

    /// Declared `base_permissions`, or `can_<method>` for every protected
    /// method. Order of first appearance, duplicates removed.
    pub fn permissions(&self) -> Vec<PermissionName> {
        let candidates: Vec<PermissionName> = match &self.base_permissions {
            Some(perms) => perms.clone(),
            None => self.methods.iter().filter_map(ViewMethod::permission).collect(),
        };
        let mut seen = BTreeSet::new();
        candidates
            .into_iter()
            .filter(|p| seen.insert(p.as_str().to_string()))
            .collect()
    }

    pub fn describe(&self) -> ViewDescription {
        ViewDescription {
            name: self.name.clone(),
            urls: self.routes.clone(),
            permissions: self.permissions(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Menu
// ─────────────────────────────────────────────────────────────────────────────

pub const MENU_SEPARATOR: &str = "-";

/// Menu entry; categories carry children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuItem {
    pub name: String,
    #[serde(default)]
    pub children: Vec<MenuItem>,
}

impl MenuItem {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
        }
    }

    pub fn separator() -> Self {
        Self::new(MENU_SEPARATOR)
    }

    pub fn is_separator(&self) -> bool {
        self.name == MENU_SEPARATOR
    }

    pub fn child(mut self, item: MenuItem) -> Self {
        self.children.push(item);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Menu {
    pub items: Vec<MenuItem>,
}

impl Menu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, item: MenuItem) {
        self.items.push(item);
    }

    /// Add `child` under `category`, creating the category when absent.
    pub fn add_link(&mut self, category: &str, child: MenuItem) {
        match self.items.iter_mut().find(|i| i.name == category) {
            Some(cat) => cat.children.push(child),
            None => self.items.push(MenuItem::new(category).child(child)),
        }
    }

    /// Every non-separator entry (categories first, then their children).
    pub fn names(&self) -> Vec<&str> {
        fn walk<'a>(items: &'a [MenuItem], out: &mut Vec<&'a str>) {
            for item in items {
                if item.is_separator() {
                    continue;
                }
                out.push(&item.name);
                walk(&item.children, out);
            }
        }
        let mut out = Vec::new();
        walk(&self.items, &mut out);
        out
    }

    pub fn find(&self, name: &str) -> Option<&MenuItem> {
        fn walk<'a>(items: &'a [MenuItem], name: &str) -> Option<&'a MenuItem> {
            items.iter().find_map(|i| {
                if i.name == name && !i.is_separator() {
                    Some(i)
                } else {
                    walk(&i.children, name)
                }
            })
        }
        walk(&self.items, name)
    }
}
