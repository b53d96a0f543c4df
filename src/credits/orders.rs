use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

use super::authors::require_author;
use super::gateway::{CheckoutRequest, PaymentGateway};
use super::models::{OrderStatus, PaymentOrder};
use super::pricing::{PackageCatalog, PackageRequest, ResolvedBundle};

const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

const ORDER_COLUMNS: &str = "id, author_id, idempotency_key, requested_packages, total_credits, \
    amount_cents, currency, provider_order_id, checkout_token, status, settled_at, created_at, updated_at";

#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrder {
    pub packages: Vec<PackageRequest>,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CreatedOrder {
    pub order_id: Uuid,
    pub provider_order_id: Option<String>,
    pub checkout_token: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub credits: i64,
    pub status: OrderStatus,
}

impl From<&PaymentOrder> for CreatedOrder {
    fn from(order: &PaymentOrder) -> Self {
        Self {
            order_id: order.id,
            provider_order_id: order.provider_order_id.clone(),
            checkout_token: order.checkout_token.clone(),
            amount_cents: order.amount_cents,
            currency: order.currency.clone(),
            credits: order.total_credits,
            status: order.status,
        }
    }
}

pub fn validate_idempotency_key(raw: &str) -> AppResult<&str> {
    let key = raw.trim();
    if key.is_empty() {
        return Err(AppError::validation("idempotency_key is required"));
    }
    if key.len() > MAX_IDEMPOTENCY_KEY_LEN || !key.chars().all(|c| c.is_ascii_graphic()) {
        return Err(AppError::validation(format!(
            "idempotency_key must be at most {MAX_IDEMPOTENCY_KEY_LEN} printable ASCII characters"
        )));
    }
    Ok(key)
}

/// key: payment-orders -> pending checkout intents, idempotent per author key
#[derive(Clone)]
pub struct OrderService {
    pool: PgPool,
    gateway: Arc<dyn PaymentGateway>,
    catalog: PackageCatalog,
}

impl OrderService {
    pub fn new(pool: PgPool, gateway: Arc<dyn PaymentGateway>, catalog: PackageCatalog) -> Self {
        Self {
            pool,
            gateway,
            catalog,
        }
    }

    /// Persists a pending order and obtains a checkout token. Never grants
    /// credits; that only happens when the gateway confirms payment.
    pub async fn create_order(&self, author_id: i32, request: CreateOrder) -> AppResult<CreatedOrder> {
        let key = validate_idempotency_key(&request.idempotency_key)?;
        let bundle = self.catalog.resolve(&request.packages)?;
        require_author(&self.pool, author_id).await?;

        let order = match self.insert_pending(author_id, key, &bundle).await? {
            Some(order) => {
                info!(
                    %author_id,
                    order = %order.id,
                    credits = order.total_credits,
                    amount_cents = order.amount_cents,
                    "payment order created"
                );
                order
            }
            None => {
                let existing = self.find_by_key(author_id, key).await?;
                if existing.total_credits != bundle.total_credits
                    || existing.amount_cents != bundle.amount_cents
                    || existing.currency != bundle.currency
                {
                    return Err(AppError::Conflict(
                        "idempotency_key was already used for a different order".into(),
                    ));
                }
                info!(%author_id, order = %existing.id, "payment order replayed by idempotency key");
                existing
            }
        };

        if order.status != OrderStatus::Pending || order.checkout_token.is_some() {
            return Ok(CreatedOrder::from(&order));
        }

        let order = self.attach_checkout(order).await?;
        Ok(CreatedOrder::from(&order))
    }

    pub async fn order(&self, author_id: i32, order_id: Uuid) -> AppResult<PaymentOrder> {
        sqlx::query_as::<_, PaymentOrder>(&format!(
            "SELECT {ORDER_COLUMNS} FROM payment_orders WHERE id = $1 AND author_id = $2"
        ))
        .bind(order_id)
        .bind(author_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound("order"))
    }

    /// Pending → cancelled. Repeating the cancel is harmless; cancelling a
    /// settled order is a conflict.
    pub async fn cancel(&self, author_id: i32, order_id: Uuid) -> AppResult<PaymentOrder> {
        let cancelled = sqlx::query_as::<_, PaymentOrder>(&format!(
            r#"
            UPDATE payment_orders
            SET status = $3, settled_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND author_id = $2 AND status = $4
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(order_id)
        .bind(author_id)
        .bind(OrderStatus::Cancelled)
        .bind(OrderStatus::Pending)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(order) = cancelled {
            info!(%author_id, order = %order.id, "payment order cancelled");
            return Ok(order);
        }

        let current = self.order(author_id, order_id).await?;
        match current.status {
            OrderStatus::Cancelled => Ok(current),
            status => Err(AppError::Conflict(format!(
                "order is already {}",
                status.as_str()
            ))),
        }
    }

    async fn insert_pending(
        &self,
        author_id: i32,
        key: &str,
        bundle: &ResolvedBundle,
    ) -> AppResult<Option<PaymentOrder>> {
        let order = sqlx::query_as::<_, PaymentOrder>(&format!(
            r#"
            INSERT INTO payment_orders (
                id,
                author_id,
                idempotency_key,
                requested_packages,
                total_credits,
                amount_cents,
                currency
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (author_id, idempotency_key) DO NOTHING
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(author_id)
        .bind(key)
        .bind(Json(&bundle.lines))
        .bind(bundle.total_credits)
        .bind(bundle.amount_cents)
        .bind(&bundle.currency)
        .fetch_optional(&self.pool)
        .await?;
        Ok(order)
    }

    async fn find_by_key(&self, author_id: i32, key: &str) -> AppResult<PaymentOrder> {
        let order = sqlx::query_as::<_, PaymentOrder>(&format!(
            "SELECT {ORDER_COLUMNS} FROM payment_orders WHERE author_id = $1 AND idempotency_key = $2"
        ))
        .bind(author_id)
        .bind(key)
        .fetch_one(&self.pool)
        .await?;
        Ok(order)
    }

    /// Calls the gateway and stores its ids. If a concurrent retry attached
    /// first, its session wins and is returned.
    async fn attach_checkout(&self, order: PaymentOrder) -> AppResult<PaymentOrder> {
        let request = CheckoutRequest {
            reference: order.id,
            amount_cents: order.amount_cents,
            currency: order.currency.clone(),
            description: format!("{} credits", order.total_credits),
        };
        let session = self.gateway.create_checkout(&request).await.map_err(|err| {
            warn!(?err, order = %order.id, "checkout creation failed; order left pending");
            err
        })?;

        let attached = sqlx::query_as::<_, PaymentOrder>(&format!(
            r#"
            UPDATE payment_orders
            SET provider_order_id = $2, checkout_token = $3, updated_at = NOW()
            WHERE id = $1 AND provider_order_id IS NULL
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(order.id)
        .bind(&session.provider_order_id)
        .bind(&session.checkout_token)
        .fetch_optional(&self.pool)
        .await?;

        match attached {
            Some(order) => Ok(order),
            None => self.order(order.author_id, order.id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_keys_are_trimmed_and_bounded() {
        assert_eq!(validate_idempotency_key("  req-123 ").unwrap(), "req-123");
        assert!(validate_idempotency_key("   ").is_err());
        assert!(validate_idempotency_key("has space").is_err());
        assert!(validate_idempotency_key(&"k".repeat(MAX_IDEMPOTENCY_KEY_LEN + 1)).is_err());
        assert!(validate_idempotency_key(&"k".repeat(MAX_IDEMPOTENCY_KEY_LEN)).is_ok());
    }
}
