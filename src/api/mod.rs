//! HTTP surface. Storage calls are blocking, so every handler hands its
//! store work to tokio's blocking pool.

mod error;
mod handlers;

use std::{sync::Arc, time::Duration};

use axum::{
    extract::State,
    middleware,
    routing::{get, post},
    Extension, Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{json, Value};
use simplebank_core::{Ledger, TxContext};

use crate::{auth::auth_middleware, config::AuthConfig};

pub use error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub ledger: Ledger,
    pub transfer_timeout: Duration,
    pub metrics: Option<PrometheusHandle>,
}

pub fn router(state: AppState, auth: AuthConfig) -> Router {
    let authenticated = Router::new()
        .route("/users/:username", get(handlers::get_user))
        .route("/accounts", post(handlers::create_account).get(handlers::list_accounts))
        .route("/accounts/:id", get(handlers::get_account))
        .route("/transfers", post(handlers::create_transfer).get(handlers::list_transfers))
        .route("/transfers/:id", get(handlers::get_transfer))
        .route("/entries", get(handlers::list_entries))
        .route("/entries/:id", get(handlers::get_entry))
        .route_layer(middleware::from_fn(auth_middleware));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .route("/users", post(handlers::create_user))
        .merge(authenticated)
        .layer(Extension(Arc::new(auth)))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn render_metrics(State(state): State<AppState>) -> String {
    state.metrics.as_ref().map(PrometheusHandle::render).unwrap_or_default()
}

/// Runs blocking store work off the async executor.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(format!("blocking task failed: {e}")))?
}

/// Cancels the context when dropped, so a request abandoned by its client
/// stops the transaction it started.
struct CancelOnDrop(TxContext);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// `(limit, offset)` for a 1-based page of 5 to 10 rows.
fn page_bounds(page_id: i64, page_size: i64) -> Result<(i64, i64), ApiError> {
    if page_id < 1 {
        return Err(ApiError::BadRequest(format!("page_id must be at least 1, got {page_id}")));
    }
    if !(5..=10).contains(&page_size) {
        return Err(ApiError::BadRequest(format!(
            "page_size must be between 5 and 10, got {page_size}"
        )));
    }
    Ok((page_size, (page_id - 1) * page_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_bounds_are_checked() {
        let page = super::page_bounds;
        assert_eq!(page(1, 5).unwrap(), (5, 0));
        assert_eq!(page(3, 10).unwrap(), (10, 20));
        assert!(page(0, 5).is_err());
        assert!(page(1, 4).is_err());
        assert!(page(1, 11).is_err());
    }

    #[test]
    fn cancel_on_drop_cancels_shared_context() {
        let ctx = TxContext::background();
        drop(CancelOnDrop(ctx.clone()));
        assert!(ctx.is_cancelled());
    }
}
