//! Converge engine.
//!
//! Rewrites the permission graph when views or their method surfaces are
//! renamed, merged or split between releases, carrying every role's grants
//! from the old permission-views to their replacements.
//!
//! ## Algorithm
//!
//! Inside a single unit of work:
//!
//! ```text
//! 1. ensure every (view, perm) in new_pvms exists
//! 2. for (old_view, old_perm) → targets in pvm_map:
//!      old missing              → skip (already migrated)
//!      for role holding old     → link role to each target, unlink old
//!      delete old
//! 3. views of migrated olds with no permission-view left and not declared → delete
//!    permissions of migrated olds with no permission-view left           → delete
//! ```
//!
//! Grants on permission-views outside `pvm_map` are never touched. Re-running
//! a mapping that already succeeded changes nothing.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use gatehouse_core::{PermissionView, SecurityError, SecurityResult};

use crate::store::{SecurityStore, in_transaction};

/// A `(view, permission)` pair named by a mapping.
///
/// Serialized as a two-element array `["View", "can_x"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "(String, String)", into = "(String, String)")]
pub struct Pvm {
    pub view: String,
    pub permission: String,
}

impl Pvm {
    pub fn new(view: impl Into<String>, permission: impl Into<String>) -> Self {
        Self {
            view: view.into(),
            permission: permission.into(),
        }
    }
}

impl From<(String, String)> for Pvm {
    fn from((view, permission): (String, String)) -> Self {
        Self { view, permission }
    }
}

impl From<Pvm> for (String, String) {
    fn from(value: Pvm) -> Self {
        (value.view, value.permission)
    }
}

impl core::fmt::Display for Pvm {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "({}, {})", self.view, self.permission)
    }
}

/// View name → permission names to ensure exist.
pub type NewPvms = BTreeMap<String, Vec<String>>;

/// Old pair → the pairs that replace it.
pub type PvmMap = BTreeMap<Pvm, Vec<Pvm>>;

/// A mapping as stored in a migration file:
///
/// ```json
/// { "new_pvms": { "NewView": ["can_read"] },
///   "pvm_map": [ [["OldView", "can_list"], [["NewView", "can_read"]]] ] }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvergeMapping {
    #[serde(default)]
    pub new_pvms: NewPvms,
    #[serde(default, with = "pvm_map_entries")]
    pub pvm_map: PvmMap,
}

mod pvm_map_entries {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::{Pvm, PvmMap};

    pub fn serialize<S: Serializer>(map: &PvmMap, serializer: S) -> Result<S::Ok, S::Error> {
        let entries: Vec<(&Pvm, &Vec<Pvm>)> = map.iter().collect();
        entries.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<PvmMap, D::Error> {
        let entries: Vec<(Pvm, Vec<Pvm>)> = Vec::deserialize(deserializer)?;
        let mut map = PvmMap::new();
        for (old, targets) in entries {
            map.entry(old).or_default().extend(targets);
        }
        Ok(map)
    }
}

impl ConvergeMapping {
    pub fn parse(json: &str) -> SecurityResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| SecurityError::validation(format!("converge mapping: {e}")))
    }

    pub fn load(path: &Path) -> SecurityResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SecurityError::config(format!("reading mapping {}: {e}", path.display()))
        })?;
        Self::parse(&raw)
    }

    /// The same declaration, replayed backwards (for downgrades).
    pub fn reversed(&self) -> Self {
        Self {
            new_pvms: reversed_new_pvms(&self.pvm_map),
            pvm_map: reversed_pvm_map(&self.pvm_map),
        }
    }
}

/// Counts of what a converge run changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConvergeReport {
    pub migrated: usize,
    pub skipped: usize,
    pub role_links: usize,
    pub views_deleted: usize,
    pub permissions_deleted: usize,
}

impl ConvergeReport {
    pub fn is_noop(&self) -> bool {
        self.migrated == 0
            && self.role_links == 0
            && self.views_deleted == 0
            && self.permissions_deleted == 0
    }
}

fn target(store: &dyn SecurityStore, pvm: &Pvm) -> SecurityResult<PermissionView> {
    if pvm.view.trim().is_empty() || pvm.permission.trim().is_empty() {
        return Err(SecurityError::validation(format!("empty name in target {pvm}")));
    }
    match store.find_permission_view(&pvm.permission, &pvm.view)? {
        Some(pv) => Ok(pv),
        None => Ok(store.add_permission_view(&pvm.permission, &pvm.view)?),
    }
}

/// Apply `new_pvms` and `pvm_map` atomically.
///
/// `declared_views` protects views that are still registered from the
/// garbage collection step even when nothing references them any more.
#[instrument(skip_all, fields(olds = pvm_map.len()), err)]
pub fn migrate_roles(
    store: &dyn SecurityStore,
    new_pvms: &NewPvms,
    pvm_map: &PvmMap,
    declared_views: Option<&BTreeSet<String>>,
) -> SecurityResult<ConvergeReport> {
    let report = in_transaction(store, |tx| {
        let mut report = ConvergeReport::default();

        for (view, permissions) in new_pvms {
            for permission in permissions {
                tx.add_permission_view(permission, view)?;
            }
        }

        let mut touched_views = BTreeSet::new();
        let mut touched_permissions = BTreeSet::new();
        for (old, targets) in pvm_map {
            let Some(old_pv) = tx.find_permission_view(&old.permission, &old.view)? else {
                debug!(pvm = %old, "already migrated");
                report.skipped += 1;
                continue;
            };
            let targets = targets
                .iter()
                .map(|t| target(tx, t))
                .collect::<SecurityResult<Vec<_>>>()?;
            for role in tx.roles_holding(old_pv.id)? {
                for new_pv in &targets {
                    if !role.holds(new_pv.id) {
                        tx.link_role_permission(role.id, new_pv.id)?;
                        report.role_links += 1;
                    }
                }
                tx.unlink_role_permission(role.id, old_pv.id)?;
            }
            tx.delete_permission_view(&old.permission, &old.view)?;
            touched_views.insert(old.view.clone());
            touched_permissions.insert(old.permission.clone());
            report.migrated += 1;
        }

        for view in touched_views {
            let declared = declared_views.is_some_and(|d| d.contains(&view));
            if !declared && tx.list_permission_views(&view)?.is_empty() && tx.delete_view(&view)? {
                report.views_deleted += 1;
            }
        }
        if !touched_permissions.is_empty() {
            let in_use: BTreeSet<String> = tx
                .list_all_permission_views()?
                .into_iter()
                .map(|pv| pv.permission.name)
                .collect();
            for permission in touched_permissions {
                if !in_use.contains(&permission) && tx.delete_permission(&permission)? {
                    report.permissions_deleted += 1;
                }
            }
        }
        Ok(report)
    })?;

    info!(
        migrated = report.migrated,
        skipped = report.skipped,
        role_links = report.role_links,
        views_deleted = report.views_deleted,
        permissions_deleted = report.permissions_deleted,
        "converge applied"
    );
    Ok(report)
}

/// Apply a parsed [`ConvergeMapping`].
pub fn apply_mapping(
    store: &dyn SecurityStore,
    mapping: &ConvergeMapping,
    declared_views: Option<&BTreeSet<String>>,
) -> SecurityResult<ConvergeReport> {
    migrate_roles(store, &mapping.new_pvms, &mapping.pvm_map, declared_views)
}

/// Invert a mapping: every target points back at the olds it replaced.
pub fn reversed_pvm_map(pvm_map: &PvmMap) -> PvmMap {
    let mut reversed = PvmMap::new();
    for (old, targets) in pvm_map {
        for new in targets {
            let olds = reversed.entry(new.clone()).or_insert_with(Vec::new);
            if !olds.contains(old) {
                olds.push(old.clone());
            }
        }
    }
    reversed
}

/// The old pairs of a mapping, grouped by view, as `new_pvms` for a downgrade.
pub fn reversed_new_pvms(pvm_map: &PvmMap) -> NewPvms {
    let mut new_pvms = NewPvms::new();
    for old in pvm_map.keys() {
        let perms = new_pvms.entry(old.view.clone()).or_insert_with(Vec::new);
        if !perms.contains(&old.permission) {
            perms.push(old.permission.clone());
        }
    }
    new_pvms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySecurityStore;

    fn rename_mapping() -> ConvergeMapping {
        ConvergeMapping::parse(
            r#"{
                "new_pvms": {"NewView": ["can_read", "can_write"]},
                "pvm_map": [
                    [["OldView", "can_list"], [["NewView", "can_read"]]],
                    [["OldView", "can_show"], [["NewView", "can_read"]]],
                    [["OldView", "can_add"], [["NewView", "can_write"]]],
                    [["OldView", "can_delete"], [["NewView", "can_write"]]]
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn parses_array_shaped_mapping() {
        let mapping = rename_mapping();
        assert_eq!(mapping.pvm_map.len(), 4);
        assert_eq!(
            mapping.pvm_map[&Pvm::new("OldView", "can_add")],
            vec![Pvm::new("NewView", "can_write")]
        );
        assert!(ConvergeMapping::parse(r#"{"pvm_map": [["OldView"]]}"#).is_err());
    }

    #[test]
    fn reverses_a_merge_into_a_split() {
        let mapping = rename_mapping();
        let reversed = reversed_pvm_map(&mapping.pvm_map);
        assert_eq!(
            reversed[&Pvm::new("NewView", "can_read")],
            vec![Pvm::new("OldView", "can_list"), Pvm::new("OldView", "can_show")]
        );
        let new_pvms = reversed_new_pvms(&mapping.pvm_map);
        assert_eq!(new_pvms["OldView"].len(), 4);
        assert_eq!(mapping.reversed().reversed().pvm_map, mapping.pvm_map);
    }

    #[test]
    fn split_links_every_target_and_keeps_declared_views() {
        let store = InMemorySecurityStore::new();
        let role = store.add_role("Editor").unwrap();
        let old = store.add_permission_view("can_edit", "Chart").unwrap();
        store.link_role_permission(role.id, old.id).unwrap();

        let mut pvm_map = PvmMap::new();
        pvm_map.insert(
            Pvm::new("Chart", "can_edit"),
            vec![Pvm::new("Chart", "can_write"), Pvm::new("Chart", "can_read")],
        );
        let declared: BTreeSet<String> = ["Chart".to_string()].into();
        let report = migrate_roles(&store, &NewPvms::new(), &pvm_map, Some(&declared)).unwrap();
        assert_eq!(report.migrated, 1);
        assert_eq!(report.role_links, 2);
        assert_eq!(report.views_deleted, 0);
        assert_eq!(report.permissions_deleted, 1);

        let editor = store.find_role("Editor").unwrap().unwrap();
        assert!(editor.grants("can_write", "Chart"));
        assert!(editor.grants("can_read", "Chart"));
        assert!(!editor.grants("can_edit", "Chart"));
        assert!(store.find_view("Chart").unwrap().is_some());
    }

    #[test]
    fn failure_rolls_back_everything() {
        let store = InMemorySecurityStore::new();
        let role = store.add_role("R").unwrap();
        let old = store.add_permission_view("can_list", "OldView").unwrap();
        store.link_role_permission(role.id, old.id).unwrap();
        let before = store.snapshot().unwrap();

        let mut pvm_map = PvmMap::new();
        pvm_map.insert(Pvm::new("OldView", "can_list"), vec![Pvm::new("NewView", "")]);
        let mut new_pvms = NewPvms::new();
        new_pvms.insert("NewView".into(), vec!["can_read".into()]);
        let result = migrate_roles(&store, &new_pvms, &pvm_map, None);
        assert!(result.is_err());
        assert!(store.same_contents(&before));
    }
}
