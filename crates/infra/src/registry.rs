//! Permission registry.
//!
//! Makes the stored permission graph match what the declared views and menu
//! require, and keeps the admin role holding every permission-view.
//!
//! ## Algorithm
//!
//! For each view `V` declaring permissions `P`:
//!
//! ```text
//! existing = permission-views on V
//! existing empty      → create (p, V) for p in P, link each to admin
//! p in P, not present → create (p, V), link to admin
//! (q, V) with q ∉ P   → unlink from every role, delete (q, V),
//!                       delete q when no other permission-view uses it
//! (p, V) kept         → link to admin when admin lacks it
//! ```
//!
//! Every menu entry `M` (categories included) gets `(menu_access, M)`.
//!
//! All operations are idempotent and take the store they run against, so they
//! compose inside a caller's unit of work.

use std::collections::{BTreeSet, HashSet};

use tracing::{debug, info, instrument};

use gatehouse_auth::{Menu, PermissionName, ViewDescriptor};
use gatehouse_core::{PermissionView, Role, SecurityError, SecurityResult};

use crate::store::{SecurityStore, in_transaction};

/// Counts of what a registry pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryReport {
    pub created: usize,
    pub retired: usize,
    pub admin_links: usize,
}

impl RegistryReport {
    fn absorb(&mut self, other: RegistryReport) {
        self.created += other.created;
        self.retired += other.retired;
        self.admin_links += other.admin_links;
    }
}

#[derive(Debug, Clone)]
pub struct PermissionRegistry {
    admin_role: String,
}

impl PermissionRegistry {
    pub fn new(admin_role: impl Into<String>) -> Self {
        Self {
            admin_role: admin_role.into(),
        }
    }

    fn admin(&self, store: &dyn SecurityStore) -> SecurityResult<Role> {
        Ok(store.add_role(&self.admin_role)?)
    }

    /// Sync one view's permission-views with `permissions`.
    #[instrument(skip(self, store, permissions), fields(view = %view))]
    pub fn add_permissions_view(
        &self,
        store: &dyn SecurityStore,
        view: &str,
        permissions: &[PermissionName],
    ) -> SecurityResult<RegistryReport> {
        let admin = self.admin(store)?;
        let existing = store.list_permission_views(view)?;
        let mut report = RegistryReport::default();

        let present: HashSet<&str> = existing.iter().map(|pv| pv.permission.name.as_str()).collect();
        for perm in permissions {
            if present.contains(perm.as_str()) {
                continue;
            }
            let pv = store.add_permission_view(perm.as_str(), view)?;
            store.link_role_permission(admin.id, pv.id)?;
            report.created += 1;
            report.admin_links += 1;
        }

        let declared: HashSet<&str> = permissions.iter().map(PermissionName::as_str).collect();
        for pv in &existing {
            if declared.contains(pv.permission.name.as_str()) {
                if !admin.holds(pv.id) {
                    store.link_role_permission(admin.id, pv.id)?;
                    report.admin_links += 1;
                }
            } else {
                // Includes `(menu_access, view)` when a menu entry shares the
                // view's name; the menu pass recreates it for admin only.
                retire(store, pv)?;
                report.retired += 1;
            }
        }

        if report != RegistryReport::default() {
            debug!(
                created = report.created,
                retired = report.retired,
                admin_links = report.admin_links,
                "view permissions synced"
            );
        }
        Ok(report)
    }

    /// Ensure `(menu_access, name)` exists and the admin role holds it.
    pub fn add_permissions_menu(
        &self,
        store: &dyn SecurityStore,
        name: &str,
    ) -> SecurityResult<RegistryReport> {
        let admin = self.admin(store)?;
        let mut report = RegistryReport::default();
        let menu_access = PermissionName::menu_access();
        let pv = match store.find_permission_view(menu_access.as_str(), name)? {
            Some(pv) => pv,
            None => {
                report.created += 1;
                store.add_permission_view(menu_access.as_str(), name)?
            }
        };
        if !admin.holds(pv.id) {
            store.link_role_permission(admin.id, pv.id)?;
            report.admin_links += 1;
        }
        Ok(report)
    }

    /// Register every view and menu entry in one unit of work.
    ///
    /// Fails with `Conflict("duplicate view ...")` before touching storage when
    /// two descriptors share a name.
    #[instrument(skip_all, fields(views = views.len()))]
    pub fn register_views(
        &self,
        store: &dyn SecurityStore,
        views: &[ViewDescriptor],
        menu: &Menu,
    ) -> SecurityResult<RegistryReport> {
        let mut seen = HashSet::new();
        for view in views {
            if !seen.insert(view.name.as_str()) {
                return Err(SecurityError::conflict(format!(
                    "duplicate view '{}'",
                    view.name
                )));
            }
        }

        let report = in_transaction(store, |tx| {
            let mut report = RegistryReport::default();
            for view in views {
                report.absorb(self.add_permissions_view(tx, &view.name, &view.permissions())?);
            }
            for name in menu.names() {
                report.absorb(self.add_permissions_menu(tx, name)?);
            }
            Ok(report)
        })?;

        info!(
            created = report.created,
            retired = report.retired,
            admin_links = report.admin_links,
            "permission registry synced"
        );
        Ok(report)
    }

    /// Ensure each `(permission, view)` pair exists and the admin role holds it.
    pub fn create_custom_permissions(
        &self,
        store: &dyn SecurityStore,
        pairs: &[(&str, &str)],
    ) -> SecurityResult<RegistryReport> {
        in_transaction(store, |tx| {
            let admin = self.admin(tx)?;
            let mut report = RegistryReport::default();
            for (perm, view) in pairs {
                if tx.find_permission_view(perm, view)?.is_none() {
                    report.created += 1;
                }
                let pv = tx.add_permission_view(perm, view)?;
                if !admin.holds(pv.id) {
                    tx.link_role_permission(admin.id, pv.id)?;
                    report.admin_links += 1;
                }
            }
            Ok(report)
        })
    }
}

/// Unlink `pv` from every role, delete it, and drop its permission when
/// nothing else uses it.
fn retire(store: &dyn SecurityStore, pv: &PermissionView) -> SecurityResult<()> {
    for role in store.roles_holding(pv.id)? {
        store.unlink_role_permission(role.id, pv.id)?;
    }
    store.delete_permission_view(&pv.permission.name, &pv.view_menu.name)?;
    delete_permission_if_unused(store, &pv.permission.name)?;
    Ok(())
}

fn delete_permission_if_unused(store: &dyn SecurityStore, permission: &str) -> SecurityResult<bool> {
    let in_use = store
        .list_all_permission_views()?
        .iter()
        .any(|pv| pv.permission.name == permission);
    if in_use {
        return Ok(false);
    }
    Ok(store.delete_permission(permission)?)
}

/// Remove every view that is neither declared nor a menu entry, along with
/// its permission-views, then every permission no permission-view uses.
#[instrument(skip_all)]
pub fn security_cleanup(
    store: &dyn SecurityStore,
    declared_views: &[&str],
    menu: &Menu,
) -> SecurityResult<usize> {
    let mut keep: BTreeSet<&str> = declared_views.iter().copied().collect();
    keep.extend(menu.names());

    let removed = in_transaction(store, |tx| {
        let mut removed = 0;
        for view in tx.list_views()? {
            if keep.contains(view.name.as_str()) {
                continue;
            }
            for pv in tx.list_permission_views(&view.name)? {
                for role in tx.roles_holding(pv.id)? {
                    tx.unlink_role_permission(role.id, pv.id)?;
                }
                tx.delete_permission_view(&pv.permission.name, &view.name)?;
            }
            tx.delete_view(&view.name)?;
            info!(view = %view.name, "removed undeclared view");
            removed += 1;
        }
        let used: HashSet<String> = tx
            .list_all_permission_views()?
            .into_iter()
            .map(|pv| pv.permission.name)
            .collect();
        for perm in tx.list_permissions()? {
            if !used.contains(&perm.name) {
                tx.delete_permission(&perm.name)?;
            }
        }
        Ok(removed)
    })?;
    Ok(removed)
}

/// Replace `role_name`'s grants with every permission-view matching
/// `predicate`, creating the role when missing.
#[instrument(skip(store, predicate))]
pub fn set_role<F>(store: &dyn SecurityStore, role_name: &str, predicate: F) -> SecurityResult<Role>
where
    F: Fn(&PermissionView) -> bool,
{
    in_transaction(store, |tx| {
        let role = tx.add_role(role_name)?;
        let wanted: BTreeSet<_> = tx
            .list_all_permission_views()?
            .iter()
            .filter(|pv| predicate(*pv))
            .map(|pv| pv.id)
            .collect();
        for pv in &role.permissions {
            if !wanted.contains(&pv.id) {
                tx.unlink_role_permission(role.id, pv.id)?;
            }
        }
        for id in &wanted {
            if !role.holds(*id) {
                tx.link_role_permission(role.id, *id)?;
            }
        }
        tx.get_role_by_id(role.id)?
            .ok_or_else(|| SecurityError::not_found(format!("role '{role_name}'")))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySecurityStore;
    use gatehouse_auth::{MenuItem, ViewMethod};

    fn perms(names: &[&'static str]) -> Vec<PermissionName> {
        names.iter().map(|n| PermissionName::new(*n)).collect()
    }

    fn admin_holds_everything(store: &dyn SecurityStore) -> bool {
        let admin = store.find_role("Admin").unwrap().unwrap();
        store
            .list_all_permission_views()
            .unwrap()
            .iter()
            .all(|pv| admin.holds(pv.id))
    }

    #[test]
    fn registers_and_is_idempotent() {
        let store = InMemorySecurityStore::new();
        let registry = PermissionRegistry::new("Admin");
        let orders = perms(&["can_list", "can_show", "can_add"]);

        let first = registry.add_permissions_view(&store, "Orders", &orders).unwrap();
        assert_eq!(first.created, 3);
        assert!(admin_holds_everything(&store));

        let before = store.snapshot().unwrap();
        let second = registry.add_permissions_view(&store, "Orders", &orders).unwrap();
        assert_eq!(second, RegistryReport::default());
        assert!(store.same_contents(&before));
    }

    #[test]
    fn relinks_admin_to_existing_rows() {
        let store = InMemorySecurityStore::new();
        store.add_permission_view("can_list", "Orders").unwrap();
        let registry = PermissionRegistry::new("Admin");

        let report = registry
            .add_permissions_view(&store, "Orders", &perms(&["can_list"]))
            .unwrap();
        assert_eq!(report.created, 0);
        assert_eq!(report.admin_links, 1);
        assert!(admin_holds_everything(&store));
    }

    #[test]
    fn narrowing_keeps_permission_used_elsewhere() {
        let store = InMemorySecurityStore::new();
        let registry = PermissionRegistry::new("Admin");
        registry
            .add_permissions_view(&store, "Orders", &perms(&["can_list", "can_add"]))
            .unwrap();
        registry
            .add_permissions_view(&store, "Invoices", &perms(&["can_add"]))
            .unwrap();

        registry
            .add_permissions_view(&store, "Orders", &perms(&["can_list"]))
            .unwrap();
        assert!(store.find_permission_view("can_add", "Orders").unwrap().is_none());
        assert!(store.find_permission("can_add").unwrap().is_some());

        registry.add_permissions_view(&store, "Invoices", &[]).unwrap();
        assert!(store.find_permission("can_add").unwrap().is_none());
    }

    #[test]
    fn register_views_rejects_duplicates_and_adds_menu_access() {
        let store = InMemorySecurityStore::new();
        let registry = PermissionRegistry::new("Admin");
        let view = ViewDescriptor::new("Orders").method(ViewMethod::protected("list"));

        let err = registry
            .register_views(&store, &[view.clone(), view.clone()], &Menu::new())
            .unwrap_err();
        assert!(matches!(err, SecurityError::Conflict(m) if m.contains("duplicate view")));
        assert!(store.list_views().unwrap().is_empty());

        let mut menu = Menu::new();
        menu.add_link("Sales", MenuItem::new("Orders"));
        menu.add(MenuItem::separator());
        registry.register_views(&store, &[view], &menu).unwrap();

        assert!(store.find_permission_view("can_list", "Orders").unwrap().is_some());
        assert!(store.find_permission_view("menu_access", "Sales").unwrap().is_some());
        assert!(store.find_permission_view("menu_access", "Orders").unwrap().is_some());
        assert!(store.find_view("-").unwrap().is_none());
        assert!(admin_holds_everything(&store));
    }

    #[test]
    fn menu_entry_named_like_a_view_is_reset_to_admin_on_boot() {
        let store = InMemorySecurityStore::new();
        let registry = PermissionRegistry::new("Admin");
        let view = ViewDescriptor::new("Orders").method(ViewMethod::protected("list"));
        let mut menu = Menu::new();
        menu.add(MenuItem::new("Orders"));
        registry.register_views(&store, &[view.clone()], &menu).unwrap();

        let gamma = store.add_role("Gamma").unwrap();
        let pv = store.find_permission_view("menu_access", "Orders").unwrap().unwrap();
        store.link_role_permission(gamma.id, pv.id).unwrap();

        let report = registry.register_views(&store, &[view], &menu).unwrap();
        assert_eq!(report.retired, 1);
        let gamma = store.find_role("Gamma").unwrap().unwrap();
        assert!(!gamma.grants("menu_access", "Orders"));
        assert!(store.find_permission_view("menu_access", "Orders").unwrap().is_some());
        assert!(admin_holds_everything(&store));
    }

    #[test]
    fn cleanup_removes_undeclared_views() {
        let store = InMemorySecurityStore::new();
        let registry = PermissionRegistry::new("Admin");
        registry
            .add_permissions_view(&store, "Orders", &perms(&["can_list"]))
            .unwrap();
        registry
            .add_permissions_view(&store, "Retired", &perms(&["can_export"]))
            .unwrap();

        let removed = security_cleanup(&store, &["Orders"], &Menu::new()).unwrap();
        assert_eq!(removed, 1);
        assert!(store.find_view("Retired").unwrap().is_none());
        assert!(store.find_permission("can_export").unwrap().is_none());
        assert!(store.find_permission_view("can_list", "Orders").unwrap().is_some());
    }

    #[test]
    fn set_role_replaces_grants() {
        let store = InMemorySecurityStore::new();
        let registry = PermissionRegistry::new("Admin");
        registry
            .add_permissions_view(&store, "Orders", &perms(&["can_list", "can_delete"]))
            .unwrap();

        let gamma = set_role(&store, "Gamma", |pv| pv.permission.name == "can_list").unwrap();
        assert_eq!(gamma.permissions.len(), 1);
        assert!(gamma.grants("can_list", "Orders"));

        let gamma = set_role(&store, "Gamma", |pv| pv.permission.name == "can_delete").unwrap();
        assert!(!gamma.grants("can_list", "Orders"));
        assert!(gamma.grants("can_delete", "Orders"));
    }

    #[test]
    fn custom_permissions_are_held_by_admin() {
        let store = InMemorySecurityStore::new();
        let registry = PermissionRegistry::new("Admin");
        let report = registry
            .create_custom_permissions(&store, &[("all_database_access", "all_database_access")])
            .unwrap();
        assert_eq!(report.created, 1);
        assert!(admin_holds_everything(&store));
    }
}
