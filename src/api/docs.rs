//! OpenAPI documentation for the REST API.

use utoipa::OpenApi;

use crate::api::handlers;

/// OpenAPI documentation for the REST API.
#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health::health_check,
        handlers::status::list_indexers,
        handlers::pools::get_pool_tvl,
        handlers::wallets::get_wallet_stakes,
        handlers::rewards::get_hero_rewards,
        handlers::bridge::list_bridge_events,
        handlers::payments::get_request,
        handlers::payments::create_request,
        handlers::admin::indexer_action,
    ),
    components(schemas(
        crate::api::models::HealthResponse,
        crate::api::models::IndexerStatusResponse,
        crate::api::models::TvlResponse,
        crate::api::models::StakeResponse,
        crate::api::models::QuestRewardResponse,
        crate::api::models::BridgeEventResponse,
        crate::api::models::PaymentRequestResponse,
        crate::api::models::CreateRequestBody,
        crate::api::models::CreatedRequestResponse,
        crate::api::models::AdminActionResponse,
        crate::api::models::ErrorResponse,
    )),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Status", description = "Indexer status"),
        (name = "Pools", description = "Pool valuation"),
        (name = "Wallets", description = "Wallet staking positions"),
        (name = "Rewards", description = "Quest reward history"),
        (name = "Bridge", description = "Cross-chain flow"),
        (name = "Payments", description = "Payment requests and matching"),
        (name = "Admin", description = "Indexer lifecycle management"),
    ),
    info(
        title = "Realm Ledger API",
        version = "0.1.0",
        description = "Multi-chain game-economy indexing and reconciliation backend",
    )
)]
pub struct ApiDoc;
