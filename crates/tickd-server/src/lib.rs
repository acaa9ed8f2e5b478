pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use state::AppState;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve()` and available for integration testing.
pub fn build_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(routes::status::get_status))
        // Actions
        .route("/api/actions", get(routes::actions::list_actions))
        .route("/api/actions", post(routes::actions::enqueue))
        .route("/api/actions/{id}", get(routes::actions::get_action))
        .route(
            "/api/actions/{id}/requeue",
            post(routes::actions::requeue_action),
        )
        // Control
        .route("/api/control", get(routes::control::get_control))
        .route("/api/control/pause", post(routes::control::pause))
        .route("/api/control/resume", post(routes::control::resume))
        .route("/api/control/kill", post(routes::control::kill))
        .route("/api/control/mode", put(routes::control::set_mode))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Serve the API on `0.0.0.0:port`.
pub async fn serve(app_state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    serve_on(app_state, listener).await
}

/// Serve on a pre-bound listener, so the caller can read the actual port
/// first when binding to port 0.
pub async fn serve_on(app_state: AppState, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    let actual_port = listener.local_addr()?.port();
    let app = build_router(app_state);

    tracing::info!("tickd API listening on http://localhost:{actual_port}");

    axum::serve(listener, app).await?;
    Ok(())
}
