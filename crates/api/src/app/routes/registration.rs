use axum::{
    Extension, Json, Router,
    extract::Path,
    http::{HeaderMap, StatusCode},
    routing::{delete, get},
};
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::{Value, json};

use gatehouse_core::RegisterUserId;
use gatehouse_infra::registration::RegistrationRequest;
use gatehouse_infra::security_views::REGISTER_USER_VIEW;

use crate::app::errors::ApiResult;
use crate::app::routes::common::guarded;
use crate::app::{AppState, run_blocking};
use crate::context::SessionContext;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub password: Option<String>,
}

/// Administration of pending registrations.
pub fn admin_router() -> Router {
    Router::new()
        .route("/registrations/", get(list))
        .route("/registrations/:id", delete(remove))
}

/// POST /register/ - anyone may ask for an account.
pub async fn register(
    Extension(state): Extension<AppState>,
    Json(body): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let request = RegistrationRequest {
        username: body.username,
        email: body.email,
        first_name: body.first_name,
        last_name: body.last_name,
        password: body.password.map(SecretString::from),
    };
    let pending = run_blocking(&state, move |security| security.register_user(request)).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Registration sent to your email",
            "username": pending.username,
        })),
    ))
}

/// GET /register/activation/:hash - follow the mailed link.
pub async fn activate(
    Extension(state): Extension<AppState>,
    Path(hash): Path<String>,
) -> ApiResult<Json<Value>> {
    let user = run_blocking(&state, move |security| security.activate_user(&hash)).await?;
    Ok(Json(json!({
        "message": "Your account has been activated",
        "username": user.username,
    })))
}

/// GET /registrations/
pub async fn list(
    Extension(state): Extension<AppState>,
    Extension(session): Extension<SessionContext>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let pending = guarded(&state, &session, &headers, "list", REGISTER_USER_VIEW, |security| {
        security.list_registrations()
    })
    .await?;
    Ok(Json(json!({ "registrations": pending })))
}

/// DELETE /registrations/:id - reject a pending registration.
pub async fn remove(
    Extension(state): Extension<AppState>,
    Extension(session): Extension<SessionContext>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    guarded(&state, &session, &headers, "delete", REGISTER_USER_VIEW, move |security| {
        security.delete_registration(RegisterUserId::new(id))
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}
