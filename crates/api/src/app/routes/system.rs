use axum::{Extension, Json, http::StatusCode};
use serde_json::{Value, json};

use crate::app::AppState;
use crate::app::errors::ApiResult;
use crate::app::run_blocking;
use crate::context::SessionContext;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Landing page: who is signed in, if anyone.
pub async fn index(
    Extension(state): Extension<AppState>,
    Extension(session): Extension<SessionContext>,
) -> ApiResult<Json<Value>> {
    let principal = session.principal();
    let user = run_blocking(&state, move |security| {
        Ok(security
            .evaluator()
            .current_user(&principal)?
            .filter(|u| u.active))
    })
    .await?;
    Ok(Json(json!({
        "authenticated": user.is_some(),
        "username": user.map(|u| u.username),
        "messages": session.take_flashes(),
    })))
}
