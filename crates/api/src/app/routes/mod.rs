use axum::{
    Router,
    routing::{get, post, put},
};

use gatehouse_auth::{AuthType, SecurityConfig};

pub mod auth;
pub mod common;
pub mod permissions;
pub mod registration;
pub mod roles;
pub mod system;
pub mod users;

/// Router for every security endpoint. Password forms exist only for
/// database logins; registration routes only when self-registration is on.
pub fn router(config: &SecurityConfig) -> Router {
    let mut router = Router::new()
        .route("/", get(system::index))
        .route("/health", get(system::health))
        .merge(auth::router(config.auth_type))
        .merge(users::router())
        .merge(roles::router())
        .merge(permissions::router());

    if config.auth_type == AuthType::Db {
        router = router
            .route("/users/:id/password", put(users::reset_password))
            .route("/resetmypassword/", put(users::reset_my_password));
    }
    if config.user_registration {
        router = router
            .route("/register/", post(registration::register))
            .route("/register/activation/:hash", get(registration::activate))
            .merge(registration::admin_router());
    }
    router
}
