//! Login and logout for every configured method.
//!
//! | Method | Start | Finish |
//! |--------|-------|--------|
//! | DB / LDAP | `GET /login/` | `POST /login/` (form) or `POST /api/v1/security/login` (JSON) |
//! | REMOTE_USER | `GET /login/` with the proxy header set | same request |
//! | OAuth | `GET /login/:provider` | `GET /oauth-authorized/:provider` |
//! | OpenID | `GET /login/:provider` | `GET /openid-authorized/:provider` |

use std::collections::BTreeMap;

use axum::{
    Extension, Form, Json, Router,
    extract::{Path, Query},
    http::HeaderMap,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use gatehouse_auth::AuthType;
use gatehouse_core::{AUTH_FAILED_MESSAGE, SecurityError, User};
use gatehouse_infra::providers::Credentials;

use crate::app::errors::{ApiError, ApiResult};
use crate::app::{AppState, run_blocking};
use crate::context::SessionContext;

// ─────────────────────────────────────────────────────────────────────────────
// Requests
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct OAuthCallback {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

pub fn router(auth_type: AuthType) -> Router {
    let router = Router::new()
        .route("/login/", get(login_page).post(login_form))
        .route("/logout/", get(logout));
    match auth_type {
        AuthType::Db | AuthType::Ldap => {
            router.route("/api/v1/security/login", post(login_json))
        }
        AuthType::OAuth => router
            .route("/login/:provider", get(login_external))
            .route("/oauth-authorized/:provider", get(oauth_authorized)),
        AuthType::OpenId => router
            .route("/login/:provider", get(login_external))
            .route("/openid-authorized/:provider", get(openid_authorized)),
        AuthType::RemoteUser => router,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Authenticate and bind the user to the request's session.
async fn login_with(
    state: &AppState,
    session: &SessionContext,
    credentials: Credentials,
) -> ApiResult<User> {
    let mut snapshot = session.snapshot();
    let (user, snapshot) = run_blocking(state, move |security| {
        let user = security.login(&mut snapshot, &credentials)?;
        Ok((user, snapshot))
    })
    .await?;
    session.replace(snapshot);
    info!(username = %user.username, "user logged in");
    Ok(user)
}

/// Browser flows finish with a redirect: home on success, back to the login
/// page with the generic message otherwise.
fn finish_browser_login(
    state: &AppState,
    session: &SessionContext,
    outcome: ApiResult<User>,
) -> Response {
    match outcome {
        Ok(_) => Redirect::to("/").into_response(),
        Err(ApiError::Security(SecurityError::AuthFailed)) => {
            session.flash("danger", AUTH_FAILED_MESSAGE);
            Redirect::to(&state.security.config().login_url).into_response()
        }
        Err(err) => err.into_response(),
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// GET /login/ - describe the login method; REMOTE_USER logs in right here.
pub async fn login_page(
    Extension(state): Extension<AppState>,
    Extension(session): Extension<SessionContext>,
    headers: HeaderMap,
) -> Response {
    let config = state.security.config();
    if config.auth_type == AuthType::RemoteUser {
        if let Some(username) = header_value(&headers, &config.remote_user_header) {
            // No redirect on failure: the header would be sent again.
            return match login_with(&state, &session, Credentials::RemoteUser { username }).await {
                Ok(_) => Redirect::to("/").into_response(),
                Err(err) => err.into_response(),
            };
        }
    }

    let providers: Vec<&str> = match config.auth_type {
        AuthType::OAuth => config.oauth_providers.iter().map(|p| p.name.as_str()).collect(),
        AuthType::OpenId => config.openid_providers.iter().map(|p| p.name.as_str()).collect(),
        _ => Vec::new(),
    };
    Json(json!({
        "auth_type": config.auth_type.as_str(),
        "providers": providers,
        "messages": session.take_flashes(),
    }))
    .into_response()
}

/// POST /login/ - login form for database and LDAP users.
pub async fn login_form(
    Extension(state): Extension<AppState>,
    Extension(session): Extension<SessionContext>,
    Form(form): Form<LoginForm>,
) -> Response {
    if !matches!(state.security.config().auth_type, AuthType::Db | AuthType::Ldap) {
        return ApiError::BadRequest("password login is not enabled".into()).into_response();
    }
    let credentials = Credentials::Password {
        username: form.username,
        password: SecretString::from(form.password),
    };
    let outcome = login_with(&state, &session, credentials).await;
    finish_browser_login(&state, &session, outcome)
}

/// POST /api/v1/security/login - JSON login for database and LDAP users.
pub async fn login_json(
    Extension(state): Extension<AppState>,
    Extension(session): Extension<SessionContext>,
    Json(body): Json<LoginForm>,
) -> ApiResult<Json<User>> {
    let credentials = Credentials::Password {
        username: body.username,
        password: SecretString::from(body.password),
    };
    Ok(Json(login_with(&state, &session, credentials).await?))
}

/// GET /logout/
pub async fn logout(
    Extension(state): Extension<AppState>,
    Extension(session): Extension<SessionContext>,
) -> Redirect {
    session.update(|s| state.security.logout(s));
    Redirect::to(&state.security.config().login_url)
}

/// GET /login/:provider - send the browser to the OAuth or OpenID provider.
pub async fn login_external(
    Extension(state): Extension<AppState>,
    Extension(session): Extension<SessionContext>,
    Path(provider): Path<String>,
) -> ApiResult<Redirect> {
    let security = &state.security;
    let url = match (security.config().auth_type, security.oauth(), security.openid()) {
        (AuthType::OAuth, Some(flow), _) => session.update(|s| flow.authorize_url(s, &provider))?,
        (AuthType::OpenId, _, Some(flow)) => session.update(|s| flow.redirect_url(s, &provider))?,
        _ => return Err(SecurityError::not_found(format!("login provider '{provider}'")).into()),
    };
    Ok(Redirect::to(&url))
}

/// GET /oauth-authorized/:provider - the OAuth provider's redirect back.
pub async fn oauth_authorized(
    Extension(state): Extension<AppState>,
    Extension(session): Extension<SessionContext>,
    Path(provider): Path<String>,
    Query(callback): Query<OAuthCallback>,
) -> Response {
    let Some(flow) = state.security.oauth() else {
        return ApiError::BadRequest("oauth is not configured".into()).into_response();
    };
    let (Some(code), Some(returned_state)) = (callback.code, callback.state) else {
        warn!(provider = %provider, error = ?callback.error, "oauth callback without code");
        return finish_browser_login(&state, &session, Err(SecurityError::AuthFailed.into()));
    };

    let mut snapshot = session.snapshot();
    let info = flow
        .callback(&mut snapshot, &provider, &code, &returned_state)
        .await;
    session.replace(snapshot);

    let outcome = match info {
        Ok(info) => login_with(&state, &session, Credentials::OAuth { provider, info }).await,
        Err(err) => Err(err.into()),
    };
    finish_browser_login(&state, &session, outcome)
}

/// GET /openid-authorized/:provider - the OpenID provider's assertion.
///
/// The email is only taken from an assertion the provider confirmed.
pub async fn openid_authorized(
    Extension(state): Extension<AppState>,
    Extension(session): Extension<SessionContext>,
    Path(provider): Path<String>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Response {
    let Some(flow) = state.security.openid() else {
        return ApiError::BadRequest("openid is not configured".into()).into_response();
    };

    let mut snapshot = session.snapshot();
    let asserted = flow.callback(&mut snapshot, &provider, &params).await;
    session.replace(snapshot);

    let outcome = match asserted {
        Ok(email) => login_with(&state, &session, Credentials::OpenId { email }).await,
        Err(err) => Err(err.into()),
    };
    finish_browser_login(&state, &session, outcome)
}
