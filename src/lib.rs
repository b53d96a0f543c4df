pub mod config;
pub mod credits;
pub mod error;
pub mod extractor;
pub mod routes;

use axum::{routing::get, Extension, Router};
use sqlx::PgPool;
use std::sync::Arc;

use config::CreditSettings;
use credits::PaymentGateway;

pub const SERVICE_BANNER: &str = "Credit Ledger API";

async fn root() -> &'static str {
    SERVICE_BANNER
}

/// Full router minus the metrics endpoint, with shared state attached.
pub fn app(pool: PgPool, gateway: Arc<dyn PaymentGateway>, settings: CreditSettings) -> Router {
    Router::new()
        .route("/", get(root))
        .merge(routes::api_routes())
        .layer(Extension(pool))
        .layer(Extension(gateway))
        .layer(Extension(settings))
}
