//! REST API routes configuration

use crate::api::handlers::{self, ApiState};
use crate::api::websocket::ws_handler;
use axum::{
    http::{StatusCode, Uri},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};

/// Unknown routes get a JSON 404
async fn fallback_handler(uri: Uri) -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": format!("No route for {}", uri.path()) })),
    )
}

/// Create the API router with all routes
pub fn create_router(state: ApiState) -> Router {
    // Configure CORS for browser access
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Ledger events
        .route("/ws", get(ws_handler))
        // Wallets
        .route(
            "/api/wallets",
            get(handlers::list_wallets).post(handlers::create_wallet),
        )
        .route("/api/wallet/{wallet_id}", get(handlers::get_wallet))
        .route(
            "/api/wallet/{wallet_id}/balance",
            get(handlers::get_wallet_balance),
        )
        // Transactions
        .route("/api/transactions/send", post(handlers::send_transaction))
        .route(
            "/api/transactions/submit",
            post(handlers::submit_transaction),
        )
        .route(
            "/api/transactions/history/{wallet_id}",
            get(handlers::get_history),
        )
        .route("/api/transactions/pending/list", get(handlers::get_pending))
        .route("/api/transactions/{hash}", get(handlers::get_transaction))
        // Chain
        .route("/api/blockchain/blocks", get(handlers::get_blocks))
        .route("/api/blockchain/blocks/{hash}", get(handlers::get_block))
        .route("/api/blockchain/status", get(handlers::get_status))
        .route("/api/blockchain/info", get(handlers::get_chain_info))
        .route("/api/blockchain/validate", get(handlers::validate_chain))
        .route("/api/blockchain/mine-pending", post(handlers::mine_pending))
        // Zakat and treasury
        .route(
            "/api/zakat/process/{wallet_id}",
            post(handlers::process_zakat),
        )
        .route("/api/treasury/issue", post(handlers::issue))
        .fallback(fallback_handler)
        // Add state and middleware
        .with_state(state)
        .layer(cors)
}
