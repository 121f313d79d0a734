//! User administration.
//!
//! Deleting a user deactivates it; rows are never removed so audit columns
//! pointing at it stay valid.

use axum::{
    Extension, Json, Router,
    extract::Path,
    http::{HeaderMap, StatusCode},
    routing::{get, put},
};
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::{Value, json};

use gatehouse_core::{SecurityError, User, UserId};
use gatehouse_infra::security_views::{RESET_MY_PASSWORD_VIEW, RESET_PASSWORD_VIEW, user_view_name};

use crate::app::AppState;
use crate::app::errors::ApiResult;
use crate::app::routes::common::guarded;
use crate::context::SessionContext;

#[derive(Debug, Deserialize)]
pub struct AddUserRequest {
    pub username: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub email: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EditUserRequest {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ActiveRequest {
    pub active: bool,
}

#[derive(Debug, Deserialize)]
pub struct RolesRequest {
    pub roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct PasswordRequest {
    pub password: String,
}

pub fn router() -> Router {
    Router::new()
        .route("/users/", get(list).post(add))
        .route("/users/:id", get(show).put(edit).delete(delete))
        .route("/users/:id/active", put(set_active))
        .route("/users/:id/roles", put(set_roles))
        .route("/userinfo/", get(userinfo))
}

fn view(state: &AppState) -> &'static str {
    user_view_name(state.security.config().auth_type)
}

/// GET /users/
pub async fn list(
    Extension(state): Extension<AppState>,
    Extension(session): Extension<SessionContext>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let users = guarded(&state, &session, &headers, "list", view(&state), |security| {
        Ok(security.store().list_users()?)
    })
    .await?;
    Ok(Json(json!({ "users": users })))
}

/// GET /users/:id
pub async fn show(
    Extension(state): Extension<AppState>,
    Extension(session): Extension<SessionContext>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<User>> {
    let user = guarded(&state, &session, &headers, "show", view(&state), move |security| {
        security.get_user(UserId::new(id))
    })
    .await?;
    Ok(Json(user))
}

/// POST /users/
pub async fn add(
    Extension(state): Extension<AppState>,
    Extension(session): Extension<SessionContext>,
    headers: HeaderMap,
    Json(body): Json<AddUserRequest>,
) -> ApiResult<(StatusCode, Json<User>)> {
    let user = guarded(&state, &session, &headers, "add", view(&state), move |security| {
        let roles: Vec<&str> = body.roles.iter().map(String::as_str).collect();
        let password = body.password.map(SecretString::from);
        security.add_user(
            &body.username,
            &body.first_name,
            &body.last_name,
            &body.email,
            &roles,
            password.as_ref(),
        )
    })
    .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

/// PUT /users/:id
pub async fn edit(
    Extension(state): Extension<AppState>,
    Extension(session): Extension<SessionContext>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<EditUserRequest>,
) -> ApiResult<Json<User>> {
    let user = guarded(&state, &session, &headers, "edit", view(&state), move |security| {
        security.edit_user(UserId::new(id), &body.first_name, &body.last_name, &body.email)
    })
    .await?;
    Ok(Json(user))
}

/// DELETE /users/:id - deactivate.
pub async fn delete(
    Extension(state): Extension<AppState>,
    Extension(session): Extension<SessionContext>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    let target = UserId::new(id);
    if session.principal().user_id() == Some(target) {
        return Err(SecurityError::validation("cannot deactivate yourself").into());
    }
    guarded(&state, &session, &headers, "delete", view(&state), move |security| {
        security.set_user_active(target, false)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /users/:id/active
pub async fn set_active(
    Extension(state): Extension<AppState>,
    Extension(session): Extension<SessionContext>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<ActiveRequest>,
) -> ApiResult<Json<User>> {
    let user = guarded(&state, &session, &headers, "edit", view(&state), move |security| {
        security.set_user_active(UserId::new(id), body.active)
    })
    .await?;
    Ok(Json(user))
}

/// PUT /users/:id/roles
pub async fn set_roles(
    Extension(state): Extension<AppState>,
    Extension(session): Extension<SessionContext>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<RolesRequest>,
) -> ApiResult<Json<User>> {
    let user = guarded(&state, &session, &headers, "edit", view(&state), move |security| {
        let roles: Vec<&str> = body.roles.iter().map(String::as_str).collect();
        security.update_user_roles(UserId::new(id), &roles)
    })
    .await?;
    Ok(Json(user))
}

/// GET /userinfo/ - the signed-in user.
pub async fn userinfo(
    Extension(state): Extension<AppState>,
    Extension(session): Extension<SessionContext>,
    headers: HeaderMap,
) -> ApiResult<Json<User>> {
    let principal = session.principal();
    let user = guarded(&state, &session, &headers, "userinfo", view(&state), move |security| {
        security
            .evaluator()
            .current_user(&principal)?
            .ok_or(SecurityError::AccessDenied)
    })
    .await?;
    Ok(Json(user))
}

/// PUT /users/:id/password - an administrator sets someone's password.
pub async fn reset_password(
    Extension(state): Extension<AppState>,
    Extension(session): Extension<SessionContext>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<PasswordRequest>,
) -> ApiResult<StatusCode> {
    guarded(&state, &session, &headers, "this_form_post", RESET_PASSWORD_VIEW, move |security| {
        security.reset_password(UserId::new(id), &SecretString::from(body.password))
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /resetmypassword/ - the signed-in user changes their own password.
pub async fn reset_my_password(
    Extension(state): Extension<AppState>,
    Extension(session): Extension<SessionContext>,
    headers: HeaderMap,
    Json(body): Json<PasswordRequest>,
) -> ApiResult<StatusCode> {
    let principal = session.principal();
    guarded(&state, &session, &headers, "this_form_post", RESET_MY_PASSWORD_VIEW, move |security| {
        security.reset_my_password(&principal, &SecretString::from(body.password))
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}
