//! HTTP application wiring (Axum router + shared state).
//!
//! - `routes/`: handlers, one file per security area
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router};
use tower::ServiceBuilder;

use gatehouse_core::SecurityResult;
use gatehouse_infra::{SecurityManager, SessionStore};

use crate::middleware::{self, SessionState};

pub mod errors;
pub mod routes;

use errors::ApiResult;

/// Shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub security: Arc<SecurityManager>,
}

/// Run a security-manager call off the async executor.
///
/// Store adapters are synchronous and may block on IO.
pub async fn run_blocking<T, F>(state: &AppState, f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&SecurityManager) -> SecurityResult<T> + Send + 'static,
{
    let security = state.security.clone();
    Ok(tokio::task::spawn_blocking(move || f(security.as_ref())).await??)
}

/// Build the full HTTP router (public entrypoint used by `main.rs` and the tests).
pub fn build_app(security: Arc<SecurityManager>, sessions: Arc<dyn SessionStore>) -> Router {
    let state = AppState { security };
    let session_state = SessionState { sessions };

    routes::router(state.security.config())
        .layer(Extension(state))
        .layer(axum::middleware::from_fn_with_state(
            session_state,
            middleware::session_middleware,
        ))
        .layer(ServiceBuilder::new())
}
