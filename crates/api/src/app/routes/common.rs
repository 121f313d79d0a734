use axum::http::HeaderMap;

use gatehouse_core::SecurityResult;
use gatehouse_infra::SecurityManager;

use crate::app::errors::ApiResult;
use crate::app::{AppState, run_blocking};
use crate::authz::{self, Responder};
use crate::context::SessionContext;

/// Guard then run a manager call off the executor.
pub async fn guarded<T, F>(
    state: &AppState,
    session: &SessionContext,
    headers: &HeaderMap,
    method: &str,
    view: &str,
    f: F,
) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&SecurityManager) -> SecurityResult<T> + Send + 'static,
{
    authz::require_access(state, session, Responder::from_headers(headers), method, view).await?;
    run_blocking(state, f).await
}
