//! Declarations of the security administration views and their menu.
//!
//! These are the views the HTTP layer mounts; registering them gives the
//! admin role the permissions needed to manage users, roles and permissions.

use gatehouse_auth::{AuthType, Menu, MenuItem, ViewDescriptor, ViewMethod};

pub const AUTH_VIEW: &str = "AuthView";
pub const ROLE_VIEW: &str = "RoleModelView";
pub const PERMISSION_VIEW: &str = "PermissionModelView";
pub const VIEW_MENU_VIEW: &str = "ViewMenuModelView";
pub const PERMISSION_VIEW_VIEW: &str = "PermissionViewModelView";
pub const REGISTER_USER_VIEW: &str = "RegisterUserModelView";
pub const RESET_PASSWORD_VIEW: &str = "ResetPasswordView";
pub const RESET_MY_PASSWORD_VIEW: &str = "ResetMyPasswordView";
pub const SECURITY_MENU: &str = "Security";

/// The user administration view name depends on the login method.
pub fn user_view_name(auth_type: AuthType) -> &'static str {
    match auth_type {
        AuthType::Db => "UserDBModelView",
        AuthType::Ldap => "UserLDAPModelView",
        AuthType::OpenId => "UserOIDModelView",
        AuthType::OAuth => "UserOAuthModelView",
        AuthType::RemoteUser => "UserRemoteUserModelView",
    }
}

fn crud(name: &str, base: &str) -> ViewDescriptor {
    ViewDescriptor::new(name)
        .route(format!("{base}/"), &["GET"], "list")
        .route(format!("{base}/{{id}}"), &["GET"], "show")
        .route(format!("{base}/"), &["POST"], "add")
        .route(format!("{base}/{{id}}"), &["PUT"], "edit")
        .route(format!("{base}/{{id}}"), &["DELETE"], "delete")
        .protected_methods(&["list", "show", "add", "edit", "delete"])
}

/// Every security view for the configured login method.
pub fn security_views(auth_type: AuthType, registration: bool) -> Vec<ViewDescriptor> {
    let mut views = vec![
        ViewDescriptor::new(AUTH_VIEW)
            .route("/login/", &["GET", "POST"], "login")
            .route("/logout/", &["GET"], "logout")
            .method(ViewMethod::public("login"))
            .method(ViewMethod::public("logout")),
        crud(user_view_name(auth_type), "/users")
            .route("/userinfo/", &["GET"], "userinfo")
            .route("/users/{id}/active", &["PUT"], "edit")
            .route("/users/{id}/roles", &["PUT"], "edit")
            .method(ViewMethod::protected("userinfo"))
            .protected_methods(&["resetmypassword", "resetpasswords"]),
        crud(ROLE_VIEW, "/roles"),
        ViewDescriptor::new(PERMISSION_VIEW)
            .route("/permissions/", &["GET"], "list")
            .protected_methods(&["list"]),
        ViewDescriptor::new(VIEW_MENU_VIEW)
            .route("/viewmenus/", &["GET"], "list")
            .protected_methods(&["list"]),
        ViewDescriptor::new(PERMISSION_VIEW_VIEW)
            .route("/permissionviews/", &["GET"], "list")
            .route("/permissionviews/explain", &["GET"], "list")
            .protected_methods(&["list"]),
    ];
    if auth_type == AuthType::Db {
        views.push(
            ViewDescriptor::new(RESET_PASSWORD_VIEW)
                .route("/users/{id}/password", &["PUT"], "this_form_post")
                .protected_methods(&["this_form_post"]),
        );
        views.push(
            ViewDescriptor::new(RESET_MY_PASSWORD_VIEW)
                .route("/resetmypassword/", &["PUT"], "this_form_post")
                .protected_methods(&["this_form_post"]),
        );
    }
    if registration {
        views.push(
            ViewDescriptor::new(REGISTER_USER_VIEW)
                .route("/registrations/", &["GET"], "list")
                .route("/registrations/{id}", &["DELETE"], "delete")
                .protected_methods(&["list", "delete"]),
        );
    }
    views
}

/// The "Security" menu category and its links.
pub fn security_menu(auth_type: AuthType, registration: bool) -> Menu {
    let mut menu = Menu::new();
    for link in ["List Users", "List Roles"] {
        menu.add_link(SECURITY_MENU, MenuItem::new(link));
    }
    if auth_type == AuthType::Db || registration {
        menu.add_link(SECURITY_MENU, MenuItem::separator());
    }
    if registration {
        menu.add_link(SECURITY_MENU, MenuItem::new("User's Statistics"));
        menu.add_link(SECURITY_MENU, MenuItem::new("User Registrations"));
    }
    for link in ["Base Permissions", "Views/Menus", "Permission on Views/Menus"] {
        menu.add_link(SECURITY_MENU, MenuItem::new(link));
    }
    menu
}
