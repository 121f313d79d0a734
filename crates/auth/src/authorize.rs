//! Access decisions over resolved roles.
//!
//! Access is purely additive: the union of the user's roles plus the public
//! role. There are no deny rules.

use serde::Serialize;
use thiserror::Error;

use gatehouse_core::{Role, SecurityError, User};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("access denied: '{permission}' on '{view}'")]
    AccessDenied { permission: String, view: String },
}

impl From<AuthzError> for SecurityError {
    fn from(_: AuthzError) -> Self {
        SecurityError::AccessDenied
    }
}

/// Roles that count for `user`. Inactive users are treated as anonymous.
fn effective_roles(user: Option<&User>) -> &[Role] {
    match user {
        Some(u) if u.active => &u.roles,
        _ => &[],
    }
}

/// True iff some role of `user` grants `(permission, view)`, or the public
/// role does.
///
/// - No IO
/// - No panics
pub fn has_access(user: Option<&User>, public: Option<&Role>, permission: &str, view: &str) -> bool {
    effective_roles(user)
        .iter()
        .any(|r| r.grants(permission, view))
        || is_public(public, permission, view)
}

pub fn is_public(public: Option<&Role>, permission: &str, view: &str) -> bool {
    public.is_some_and(|r| r.grants(permission, view))
}

/// Same decision as [`has_access`], as a `Result` for `?` at the call site.
pub fn authorize(
    user: Option<&User>,
    public: Option<&Role>,
    permission: &str,
    view: &str,
) -> Result<(), AuthzError> {
    if has_access(user, public, permission, view) {
        Ok(())
    } else {
        Err(AuthzError::AccessDenied {
            permission: permission.to_string(),
            view: view.to_string(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Authorization Explanation (Audit Trail)
// ─────────────────────────────────────────────────────────────────────────────

/// Detailed explanation of an access decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessExplanation {
    pub permission: String,
    pub view: String,
    pub granted: bool,
    /// Human-readable reason for the decision.
    pub reason: String,
    /// `None` for anonymous requests.
    pub username: Option<String>,
    pub user_active: bool,
    pub roles: Vec<String>,
    /// Roles (including the public role) that grant the pair.
    pub granting_roles: Vec<String>,
}

/// Explain why an access decision was made (or would be made).
pub fn explain_access(
    user: Option<&User>,
    public: Option<&Role>,
    permission: &str,
    view: &str,
) -> AccessExplanation {
    let mut granting_roles: Vec<String> = effective_roles(user)
        .iter()
        .filter(|r| r.grants(permission, view))
        .map(|r| r.name.clone())
        .collect();

    let public_grants = is_public(public, permission, view);
    if let Some(p) = public.filter(|_| public_grants) {
        if !granting_roles.contains(&p.name) {
            granting_roles.push(p.name.clone());
        }
    }

    let granted = !granting_roles.is_empty();
    let reason = match (user, granted) {
        (Some(u), false) if !u.active => {
            format!("User '{}' is inactive; only public grants apply", u.username)
        }
        (_, true) if granting_roles.len() == 1 && public_grants => {
            format!("'{permission}' on '{view}' is public")
        }
        (_, true) => format!("Granted by role(s): {}", granting_roles.join(", ")),
        (Some(u), false) => format!(
            "No role of '{}' grants '{permission}' on '{view}'",
            u.username
        ),
        (None, false) => format!("Anonymous access to '{permission}' on '{view}' is not public"),
    };

    AccessExplanation {
        permission: permission.to_string(),
        view: view.to_string(),
        granted,
        reason,
        username: user.map(|u| u.username.clone()),
        user_active: user.is_some_and(|u| u.active),
        roles: user
            .map(|u| u.roles.iter().map(|r| r.name.clone()).collect())
            .unwrap_or_default(),
        granting_roles,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gatehouse_core::{
        Audited, Permission, PermissionId, PermissionView, PermissionViewId, RoleId, UserId,
        ViewMenu, ViewMenuId,
    };

    fn pv(id: i64, perm: &str, view: &str) -> PermissionView {
        PermissionView {
            id: PermissionViewId::new(id),
            permission: Permission {
                id: PermissionId::new(id),
                name: perm.into(),
            },
            view_menu: ViewMenu {
                id: ViewMenuId::new(id),
                name: view.into(),
            },
        }
    }

    fn role(id: i64, name: &str, pvs: Vec<PermissionView>) -> Role {
        Role {
            id: RoleId::new(id),
            name: name.into(),
            permissions: pvs,
        }
    }

    fn user(roles: Vec<Role>, active: bool) -> User {
        User {
            id: UserId::new(1),
            username: "bob".into(),
            email: "bob@example.com".into(),
            first_name: "Bob".into(),
            last_name: "B".into(),
            password_hash: None,
            active,
            last_login: None,
            login_count: 0,
            fail_login_count: 0,
            roles,
            audit: Audited::new(Utc::now()),
        }
    }

    #[test]
    fn union_of_roles_and_public() {
        let public = role(2, "Public", vec![pv(1, "can_list", "Home")]);
        let u = user(vec![role(3, "Sales", vec![pv(2, "can_add", "Orders")])], true);

        assert!(has_access(Some(&u), Some(&public), "can_add", "Orders"));
        assert!(has_access(Some(&u), Some(&public), "can_list", "Home"));
        assert!(!has_access(Some(&u), Some(&public), "can_delete", "Orders"));
        assert!(has_access(None, Some(&public), "can_list", "Home"));
        assert!(!has_access(None, Some(&public), "can_add", "Orders"));
        assert!(!has_access(None, None, "can_list", "Home"));
    }

    #[test]
    fn inactive_user_only_gets_public() {
        let u = user(vec![role(3, "Sales", vec![pv(2, "can_add", "Orders")])], false);
        let err = authorize(Some(&u), None, "can_add", "Orders").unwrap_err();
        assert!(matches!(err, AuthzError::AccessDenied { .. }));
        assert_eq!(SecurityError::from(err), SecurityError::AccessDenied);

        let explanation = explain_access(Some(&u), None, "can_add", "Orders");
        assert!(!explanation.granted);
        assert!(explanation.reason.contains("inactive"));
    }

    #[test]
    fn explanation_names_granting_roles() {
        let public = role(2, "Public", vec![pv(1, "can_list", "Orders")]);
        let u = user(
            vec![
                role(3, "Sales", vec![pv(1, "can_list", "Orders")]),
                role(4, "Viewer", vec![]),
            ],
            true,
        );
        let explanation = explain_access(Some(&u), Some(&public), "can_list", "Orders");
        assert!(explanation.granted);
        assert_eq!(explanation.granting_roles, vec!["Sales", "Public"]);
        assert_eq!(explanation.roles, vec!["Sales", "Viewer"]);

        let anon = explain_access(None, Some(&public), "can_list", "Orders");
        assert!(anon.granted);
        assert!(anon.reason.contains("public"));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        const PERMS: [&str; 3] = ["can_list", "can_show", "can_add"];
        const VIEWS: [&str; 3] = ["Orders", "Invoices", "Home"];

        fn grants(bits: u16, offset: i64) -> Vec<PermissionView> {
            let mut out = Vec::new();
            for (i, perm) in PERMS.iter().enumerate() {
                for (j, view) in VIEWS.iter().enumerate() {
                    if bits & (1 << (i * 3 + j)) != 0 {
                        out.push(pv(offset + (i * 3 + j) as i64, perm, view));
                    }
                }
            }
            out
        }

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            /// Property: access is the union of the user's roles and the public role.
            #[test]
            fn access_is_union_of_grants(
                a in 0u16..512,
                b in 0u16..512,
                p in 0u16..512,
                perm in 0usize..3,
                view in 0usize..3,
            ) {
                let u = user(vec![role(1, "A", grants(a, 0)), role(2, "B", grants(b, 100))], true);
                let public = role(3, "Public", grants(p, 200));
                let (perm, view) = (PERMS[perm], VIEWS[view]);

                let expected = u.roles.iter().any(|r| r.grants(perm, view)) || public.grants(perm, view);
                prop_assert_eq!(has_access(Some(&u), Some(&public), perm, view), expected);
                prop_assert_eq!(explain_access(Some(&u), Some(&public), perm, view).granted, expected);
            }
        }
    }
}
