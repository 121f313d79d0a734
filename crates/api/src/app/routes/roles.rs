use std::collections::BTreeSet;

use axum::{
    Extension, Json, Router,
    extract::Path,
    http::{HeaderMap, StatusCode},
    routing::get,
};
use serde::Deserialize;
use serde_json::{Value, json};

use gatehouse_core::{Role, RoleId, SecurityError};
use gatehouse_infra::registry::set_role;
use gatehouse_infra::security_views::ROLE_VIEW;

use crate::app::AppState;
use crate::app::errors::ApiResult;
use crate::app::routes::common::guarded;
use crate::context::SessionContext;

#[derive(Debug, Deserialize)]
pub struct AddRoleRequest {
    pub name: String,
}

/// Full replacement of a role's grants, as `[permission, view]` pairs.
#[derive(Debug, Deserialize)]
pub struct EditRoleRequest {
    pub permissions: Vec<(String, String)>,
}

pub fn router() -> Router {
    Router::new()
        .route("/roles/", get(list).post(add))
        .route("/roles/:id", get(show).put(edit).delete(delete))
}

/// GET /roles/
pub async fn list(
    Extension(state): Extension<AppState>,
    Extension(session): Extension<SessionContext>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let roles = guarded(&state, &session, &headers, "list", ROLE_VIEW, |security| {
        Ok(security.store().list_roles()?)
    })
    .await?;
    Ok(Json(json!({ "roles": roles })))
}

/// GET /roles/:id
pub async fn show(
    Extension(state): Extension<AppState>,
    Extension(session): Extension<SessionContext>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<Role>> {
    let role = guarded(&state, &session, &headers, "show", ROLE_VIEW, move |security| {
        security
            .store()
            .get_role_by_id(RoleId::new(id))?
            .ok_or_else(|| SecurityError::not_found(format!("role {id}")))
    })
    .await?;
    Ok(Json(role))
}

/// POST /roles/
pub async fn add(
    Extension(state): Extension<AppState>,
    Extension(session): Extension<SessionContext>,
    headers: HeaderMap,
    Json(body): Json<AddRoleRequest>,
) -> ApiResult<(StatusCode, Json<Role>)> {
    let role = guarded(&state, &session, &headers, "add", ROLE_VIEW, move |security| {
        security.add_role(&body.name)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(role)))
}

/// PUT /roles/:id - replace the role's permissions.
pub async fn edit(
    Extension(state): Extension<AppState>,
    Extension(session): Extension<SessionContext>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<EditRoleRequest>,
) -> ApiResult<Json<Role>> {
    let role = guarded(&state, &session, &headers, "edit", ROLE_VIEW, move |security| {
        let role = security
            .store()
            .get_role_by_id(RoleId::new(id))?
            .ok_or_else(|| SecurityError::not_found(format!("role {id}")))?;
        let wanted: BTreeSet<(String, String)> = body.permissions.into_iter().collect();
        for (permission, view) in &wanted {
            if security.store().find_permission_view(permission, view)?.is_none() {
                return Err(SecurityError::not_found(format!(
                    "permission '{permission}' on '{view}'"
                )));
            }
        }
        set_role(security.store(), &role.name, |pv| {
            wanted.contains(&(pv.permission.name.clone(), pv.view_menu.name.clone()))
        })
    })
    .await?;
    Ok(Json(role))
}

/// DELETE /roles/:id
pub async fn delete(
    Extension(state): Extension<AppState>,
    Extension(session): Extension<SessionContext>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    guarded(&state, &session, &headers, "delete", ROLE_VIEW, move |security| {
        security.delete_role(RoleId::new(id))
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}
