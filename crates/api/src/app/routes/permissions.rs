//! Read-only views over permissions, views and their bindings, plus the
//! access explanation endpoint for "why was this request denied?".

use axum::{
    Extension, Json, Router,
    extract::Query,
    http::HeaderMap,
    routing::get,
};
use serde::Deserialize;
use serde_json::{Value, json};

use gatehouse_auth::{AccessExplanation, Principal};
use gatehouse_core::UserId;
use gatehouse_infra::security_views::{PERMISSION_VIEW, PERMISSION_VIEW_VIEW, VIEW_MENU_VIEW};

use crate::app::AppState;
use crate::app::errors::ApiResult;
use crate::app::routes::common::guarded;
use crate::context::SessionContext;

#[derive(Debug, Deserialize)]
pub struct ExplainQuery {
    pub permission: String,
    pub view: String,
    /// Defaults to the caller.
    pub user_id: Option<i64>,
}

pub fn router() -> Router {
    Router::new()
        .route("/permissions/", get(list_permissions))
        .route("/viewmenus/", get(list_views))
        .route("/permissionviews/", get(list_permission_views))
        .route("/permissionviews/explain", get(explain))
}

/// GET /permissions/
pub async fn list_permissions(
    Extension(state): Extension<AppState>,
    Extension(session): Extension<SessionContext>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let permissions = guarded(&state, &session, &headers, "list", PERMISSION_VIEW, |security| {
        Ok(security.store().list_permissions()?)
    })
    .await?;
    Ok(Json(json!({ "permissions": permissions })))
}

/// GET /viewmenus/
pub async fn list_views(
    Extension(state): Extension<AppState>,
    Extension(session): Extension<SessionContext>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let views = guarded(&state, &session, &headers, "list", VIEW_MENU_VIEW, |security| {
        Ok(security.store().list_views()?)
    })
    .await?;
    Ok(Json(json!({ "view_menus": views })))
}

/// GET /permissionviews/
pub async fn list_permission_views(
    Extension(state): Extension<AppState>,
    Extension(session): Extension<SessionContext>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let pvs = guarded(&state, &session, &headers, "list", PERMISSION_VIEW_VIEW, |security| {
        Ok(security.store().list_all_permission_views()?)
    })
    .await?;
    Ok(Json(json!({ "permission_views": pvs })))
}

/// GET /permissionviews/explain?permission=can_list&view=RoleModelView[&user_id=N]
pub async fn explain(
    Extension(state): Extension<AppState>,
    Extension(session): Extension<SessionContext>,
    headers: HeaderMap,
    Query(query): Query<ExplainQuery>,
) -> ApiResult<Json<AccessExplanation>> {
    let principal = match query.user_id {
        Some(id) => Principal::User(UserId::new(id)),
        None => session.principal(),
    };
    let explanation = guarded(&state, &session, &headers, "list", PERMISSION_VIEW_VIEW, move |security| {
        security
            .evaluator()
            .explain_access(&principal, &query.permission, &query.view)
    })
    .await?;
    Ok(Json(explanation))
}
