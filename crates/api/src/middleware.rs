use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, HeaderValue, header},
    middleware::Next,
    response::Response,
};
use cookie::{Cookie, SameSite};
use tracing::{debug, warn};

use gatehouse_infra::session::new_session_id;
use gatehouse_infra::{Session, SessionStore};

use crate::context::SessionContext;

pub const SESSION_COOKIE: &str = "gatehouse_session";

#[derive(Clone)]
pub struct SessionState {
    pub sessions: Arc<dyn SessionStore>,
}

/// What the middleware does with the session once the handler is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Persist {
    Skip,
    Save,
    /// First save of a new session: send its cookie.
    Issue,
    /// The principal changed: move the data to a fresh id.
    Rotate,
}

fn persist_plan(is_new: bool, loaded: &Session, current: &Session) -> Persist {
    if is_new {
        return if current.is_empty() {
            Persist::Skip
        } else {
            Persist::Issue
        };
    }
    if current.principal() != loaded.principal() {
        Persist::Rotate
    } else if current == loaded {
        Persist::Skip
    } else {
        Persist::Save
    }
}

/// Load the cookie's session, run the handler, persist what it left behind.
///
/// A fresh cookie is only issued once the session holds something, and a
/// login or logout always moves the session to a new id.
pub async fn session_middleware(
    State(state): State<SessionState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let existing = extract_session_id(req.headers()).and_then(|id| {
        match state.sessions.load(&id) {
            Ok(Some(session)) => Some((id, session)),
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, "session load failed");
                None
            }
        }
    });
    let is_new = existing.is_none();
    let (id, loaded) = existing.unwrap_or_else(|| (new_session_id(), Session::new()));

    let ctx = SessionContext::new(id.clone(), loaded.clone());
    req.extensions_mut().insert(ctx.clone());

    let mut response = next.run(req).await;

    let current = ctx.snapshot();
    let plan = persist_plan(is_new, &loaded, &current);
    let id = match plan {
        Persist::Skip => return response,
        Persist::Save | Persist::Issue => id,
        Persist::Rotate => {
            if let Err(err) = state.sessions.delete(&id) {
                warn!(error = %err, "session delete failed");
            }
            debug!("session id rotated");
            new_session_id()
        }
    };
    if let Err(err) = state.sessions.save(&id, &current) {
        warn!(error = %err, "session save failed");
        return response;
    }
    if plan != Persist::Save {
        if let Ok(value) = HeaderValue::from_str(&session_cookie(id).to_string()) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    response
}

fn session_cookie(id: String) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, id))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .build()
}

fn extract_session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(Cookie::split_parse)
        .filter_map(Result::ok)
        .find(|cookie| cookie.name() == SESSION_COOKIE && !cookie.value().is_empty())
        .map(|cookie| cookie.value().to_string())
}
