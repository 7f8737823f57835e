pub mod auth;
pub mod error;
pub mod execute;
pub mod health;
pub mod limit;
pub mod models;
pub mod sessions;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Build the full API router.
///
/// Routes are split into **public** (no auth required) and **protected**
/// (gated behind the bearer-token middleware). The streaming execution
/// routes are additionally rate limited.
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new().route("/health", get(health::health));

    let execution = Router::new()
        .route("/v1/execute", post(execute::execute))
        .route(
            "/v1/sessions/:id/run-parallel",
            post(execute::run_parallel_steps),
        )
        .route("/v1/supervisor", post(execute::supervisor))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            limit::enforce_rate_limit,
        ));

    let protected = Router::new()
        .route("/v1/models", get(models::list_models))
        .route(
            "/v1/sessions",
            get(sessions::list_sessions).post(sessions::create_session),
        )
        .route(
            "/v1/sessions/:id",
            get(sessions::get_session).delete(sessions::delete_session),
        )
        .merge(execution)
        // Apply API auth middleware to all protected routes.
        .route_layer(middleware::from_fn_with_state(
            state,
            auth::require_api_token,
        ));

    public.merge(protected)
}
