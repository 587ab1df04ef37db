mod handlers;
mod types;

use std::sync::Arc;

use axum::Router;
use axum::extract::{DefaultBodyLimit, State};
use axum::middleware;
use axum::response::Response;
use axum::routing::{get, post};
use canopy_core::TenantId;
use canopy_storage::StoreFactory;

const MAX_REQUEST_BODY_SIZE: usize = 4 * 1024 * 1024; // 4 MB

use crate::metrics::{self, Metrics};
use crate::service::PermissionService;

pub struct AppState<F: StoreFactory> {
    pub service: Arc<PermissionService<F>>,
    pub tenant_id: TenantId,
    pub metrics: Arc<Metrics>,
}

impl<F: StoreFactory> Clone for AppState<F> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            tenant_id: self.tenant_id,
            metrics: self.metrics.clone(),
        }
    }
}

async fn metrics_middleware<F: StoreFactory>(
    State(state): State<AppState<F>>,
    request: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> Response {
    state.metrics.record_request();

    let path = request.uri().path().to_string();
    let start = std::time::Instant::now();

    let response = next.run(request).await;

    if response.status().is_success() {
        state.metrics.record_success();
    } else {
        state.metrics.record_error();
    }

    tracing::debug!(
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "request handled"
    );

    response
}

pub fn create_router<F>(state: AppState<F>) -> Router
where
    F: StoreFactory + 'static,
{
    let metrics_route = Router::new()
        .route("/metrics", get(metrics::metrics_handler))
        .with_state(Arc::clone(&state.metrics));

    Router::new()
        .route("/v1/users", post(handlers::create_user))
        .route("/v1/users/delete", post(handlers::delete_user))
        .route("/v1/creatives", post(handlers::create_creative))
        .route("/v1/creatives/origin", post(handlers::effective_origin))
        .route("/v1/creatives/move", post(handlers::move_creative))
        .route("/v1/creatives/delete", post(handlers::delete_creative))
        .route("/v1/shares", post(handlers::grant))
        .route("/v1/shares/update", post(handlers::update_share))
        .route("/v1/shares/revoke", post(handlers::revoke))
        .route("/v1/permissions/check", post(handlers::check_permission))
        .route("/v1/permissions/filter", post(handlers::filter_permitted))
        .route("/v1/sweep", post(handlers::sweep))
        .route("/healthz", get(handlers::healthz))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_SIZE))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            metrics_middleware,
        ))
        .with_state(state)
        .merge(metrics_route)
}
