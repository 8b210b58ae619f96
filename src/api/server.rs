//! Axum server setup and routing.

use axum::http::HeaderValue;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::api::{docs::ApiDoc, handlers, middleware as api_middleware};
use crate::app_state::AppState;

/// Run the Axum API server until the shutdown token fires.
///
/// # Errors
///
/// Socket binding or serve failures.
pub async fn run_server(
    state: AppState,
    port: u16,
    rate_limit_rpm: u32,
    cors_origins: Vec<String>,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let limiter = api_middleware::rate_limit::create_rate_limiter(rate_limit_rpm);

    let routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/status/indexers", get(handlers::status::list_indexers))
        .route(
            "/pools/:chain_id/:pool_id/tvl",
            get(handlers::pools::get_pool_tvl),
        )
        .route(
            "/wallets/:address/stakes",
            get(handlers::wallets::get_wallet_stakes),
        )
        .route("/rewards/hero/:hero_id", get(handlers::rewards::get_hero_rewards))
        .route("/bridge/events", get(handlers::bridge::list_bridge_events))
        .route("/payments/requests", post(handlers::payments::create_request))
        .route("/payments/requests/:id", get(handlers::payments::get_request))
        .route(
            "/admin/indexers/:name/:action",
            post(handlers::admin::indexer_action),
        );

    let cors = build_cors_layer(cors_origins);

    let middleware_stack = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .layer(middleware::from_fn(api_middleware::logging::log_requests))
        .layer(middleware::from_fn(move |req, next| {
            api_middleware::rate_limit::rate_limit(limiter.clone(), req, next)
        }));

    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(routes)
        .layer(middleware_stack)
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

fn build_cors_layer(origins: Vec<String>) -> CorsLayer {
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        CorsLayer::new().allow_origin(Any)
    } else {
        let mut layer = CorsLayer::new();
        for origin in origins {
            if let Ok(header) = origin.parse::<HeaderValue>() {
                layer = layer.clone().allow_origin(header);
            }
        }
        layer
    }
}
