//! Router setup with all API routes and middleware.
//!
//! Provider webhooks are public and never throttled. Management routes sit
//! behind bearer auth and the rate limiter; the SSE stream is authenticated
//! but exempt from rate limiting.

use std::future::Future;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use callflow_core::config::CallflowConfig;
use callflow_core::error::CallflowError;

use crate::handlers;
use crate::rate_limit::RateLimiter;
use crate::state::AppState;
use crate::webhooks;

/// Create the axum Router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let port = state.config.general.port;
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", port),
        format!("http://localhost:{}", port),
    ]
    .iter()
    .filter_map(|origin| origin.parse().ok())
    .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT]);

    let public_routes = Router::new()
        .route("/health", get(handlers::health))
        .route("/webhooks/voice/{call_id}", post(webhooks::voice))
        .route("/webhooks/status/{call_id}", post(webhooks::status))
        .route(
            "/webhooks/transcription/{call_id}",
            post(webhooks::transcription),
        );

    let limiter = RateLimiter::new(state.config.api.rate_limit_per_sec);

    let rate_limited_routes = Router::new()
        .route("/agents", post(handlers::create_agent))
        .route("/agents/{id}", get(handlers::get_agent))
        .route("/agents/{id}/script", put(handlers::update_agent_script))
        .route("/scripts/validate", post(handlers::validate_script))
        .route("/campaigns", post(handlers::create_campaign))
        .route("/campaigns/{id}", get(handlers::get_campaign))
        .route("/campaigns/{id}/start", post(handlers::start_campaign))
        .route("/campaigns/{id}/pause", post(handlers::pause_campaign))
        .route("/campaigns/{id}/resume", post(handlers::resume_campaign))
        .route("/campaigns/{id}/dispatch", post(handlers::dispatch_campaign))
        .route("/campaigns/{id}/stats", get(handlers::campaign_stats))
        .route("/calls/{id}", get(handlers::get_call))
        .route("/calls/{id}/transcript", get(handlers::call_transcript))
        .layer(axum::middleware::from_fn(
            crate::rate_limit::rate_limit_middleware,
        ))
        .layer(axum::Extension(limiter));

    let stream_routes = Router::new().route("/stream", get(handlers::stream));

    let protected_routes =
        rate_limited_routes
            .merge(stream_routes)
            .route_layer(axum::middleware::from_fn_with_state(
                state.clone(),
                crate::auth::require_auth,
            ));

    public_routes
        .merge(protected_routes)
        .layer(DefaultBodyLimit::max(state.config.api.max_body_bytes))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP server on the configured bind address and port, serving
/// until `shutdown` resolves.
pub async fn start_server<F>(
    config: &CallflowConfig,
    state: AppState,
    shutdown: F,
) -> Result<(), CallflowError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", config.general.bind_address, config.general.port);
    let router = create_router(state);

    tracing::info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| CallflowError::Api(format!("Failed to bind {}: {}", addr, e)))?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| CallflowError::Api(format!("Server error: {}", e)))?;

    Ok(())
}
