//! Access guard applied at the top of every protected handler.
//!
//! Browsers (requests accepting `text/html`) are sent back to the login page
//! with a flashed "Access is Denied"; everything else gets a JSON 401.

use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Redirect, Response};
use chrono::Utc;
use tracing::debug;

use gatehouse_auth::{PermissionName, TokenState};
use gatehouse_core::ACCESS_DENIED_MESSAGE;

use crate::app::errors::{self, ApiError, ApiResult, Denial};
use crate::app::{AppState, run_blocking};
use crate::context::SessionContext;

/// How a handler's denial should be rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Responder {
    Html,
    Json,
}

impl Responder {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let wants_html = headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|accept| accept.contains("text/html"));
        if wants_html { Self::Html } else { Self::Json }
    }
}

/// Keep an OAuth session's token usable; an unrecoverable token logs the
/// session out.
async fn refresh_oauth(state: &AppState, session: &SessionContext) -> ApiResult<()> {
    let Some(flow) = state.security.oauth() else {
        return Ok(());
    };
    let mut snapshot = session.snapshot();
    if snapshot.oauth_token().is_none() {
        return Ok(());
    }
    if flow.ensure_fresh(&mut snapshot, Utc::now()).await? == TokenState::Invalid {
        debug!("oauth session invalidated");
    }
    session.replace(snapshot);
    Ok(())
}

/// Check `can_<method>` on `view` for the session's principal.
pub async fn require_access(
    state: &AppState,
    session: &SessionContext,
    responder: Responder,
    method: &str,
    view: &str,
) -> ApiResult<()> {
    refresh_oauth(state, session).await?;

    let principal = session.principal();
    let permission = PermissionName::for_method(method);
    let view_name = view.to_string();
    let granted = run_blocking(state, move |security| {
        security
            .evaluator()
            .has_access(&principal, permission.as_str(), &view_name)
    })
    .await?;

    if granted {
        Ok(())
    } else {
        debug!(method, view, "access denied");
        Err(ApiError::Denied(Denial(deny(state, session, responder))))
    }
}

pub fn deny(state: &AppState, session: &SessionContext, responder: Responder) -> Response {
    match responder {
        Responder::Html => {
            session.flash("danger", ACCESS_DENIED_MESSAGE);
            Redirect::to(&state.security.config().login_url).into_response()
        }
        Responder::Json => errors::access_denied_json(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn browsers_get_html_denials() {
        let mut headers = HeaderMap::new();
        assert_eq!(Responder::from_headers(&headers), Responder::Json);
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml"),
        );
        assert_eq!(Responder::from_headers(&headers), Responder::Html);
    }
}
