use axum::{
    routing::{get, post},
    Router,
};

use crate::credits::api;

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/credits/balance", get(api::get_balance))
        .route("/api/credits/history", get(api::get_history))
        .route("/api/credits/packages", get(api::list_packages))
        .route("/api/credits/orders", post(api::create_order))
        .route("/api/credits/orders/:id", get(api::get_order))
        .route("/api/credits/orders/:id/cancel", post(api::cancel_order))
        .route(
            "/api/credits/promotions/redeem",
            post(api::redeem_promotion),
        )
        .route("/api/ai-edits/check", post(api::check_edit))
        .route("/api/ai-edits/check-batch", post(api::check_edit_batch))
        .route("/api/ai-edits/commit", post(api::commit_edits))
        .route("/api/webhooks/payments", post(api::payment_webhook))
        .route("/api/admin/authors", post(api::create_author))
        .route(
            "/api/admin/credits/adjustments",
            post(api::adjust_credits),
        )
        .route("/api/admin/promotions", post(api::create_promotion))
        .route(
            "/api/admin/promotions/:code/deactivate",
            post(api::deactivate_promotion),
        )
}
