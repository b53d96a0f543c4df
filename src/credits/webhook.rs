use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

use super::ledger::append_in_tx;
use super::models::{LedgerEventType, NewLedgerEntry, OrderStatus};

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";
pub const TIMESTAMP_HEADER: &str = "x-webhook-timestamp";

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 of `"{timestamp}.{body}"`.
pub fn compute_signature(secret: &str, timestamp: &str, body: &[u8]) -> String {
    hex::encode(signed_mac(secret, timestamp, body).finalize().into_bytes())
}

fn signed_mac(secret: &str, timestamp: &str, body: &[u8]) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can use any key length");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    mac
}

/// Constant-time comparison; accepts an optional `sha256=` prefix.
pub fn signature_is_valid(secret: &str, timestamp: &str, body: &[u8], signature: &str) -> bool {
    let provided = signature.trim();
    let provided = provided.strip_prefix("sha256=").unwrap_or(provided);
    let Ok(provided) = hex::decode(provided) else {
        return false;
    };
    signed_mac(secret, timestamp, body)
        .verify_slice(&provided)
        .is_ok()
}

/// Timestamp is unix seconds within `tolerance` of `now` in either direction.
pub fn timestamp_is_fresh(timestamp: &str, now: DateTime<Utc>, tolerance: Duration) -> bool {
    let Ok(sent) = timestamp.trim().parse::<i64>() else {
        return false;
    };
    let skew = now.timestamp().abs_diff(sent);
    skew <= tolerance.as_secs()
}

/// Authenticity check for one delivery. Pure so it runs without a server.
pub fn authenticate(
    secret: Option<&str>,
    tolerance: Duration,
    body: &[u8],
    signature: Option<&str>,
    timestamp: Option<&str>,
    now: DateTime<Utc>,
) -> AppResult<()> {
    let Some(secret) = secret.filter(|secret| !secret.is_empty()) else {
        warn!("payment webhook rejected: no webhook secret configured");
        return Err(AppError::Unauthorized);
    };
    let (Some(signature), Some(timestamp)) = (signature, timestamp) else {
        warn!("payment webhook rejected: signature headers missing");
        return Err(AppError::Unauthorized);
    };
    if !timestamp_is_fresh(timestamp, now, tolerance) {
        warn!(timestamp, "payment webhook rejected: stale timestamp");
        return Err(AppError::Unauthorized);
    }
    if !signature_is_valid(secret, timestamp, body, signature) {
        warn!("payment webhook rejected: signature mismatch");
        return Err(AppError::Unauthorized);
    }
    Ok(())
}

/// Event kinds the reconciler models. Everything else is acknowledged and dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentEventKind {
    PaymentSucceeded,
    PaymentFailed,
    PaymentCancelled,
    Unsupported(String),
}

impl From<&str> for PaymentEventKind {
    fn from(raw: &str) -> Self {
        match raw {
            "payment.succeeded" => Self::PaymentSucceeded,
            "payment.failed" => Self::PaymentFailed,
            "payment.cancelled" | "payment.canceled" => Self::PaymentCancelled,
            other => Self::Unsupported(other.to_string()),
        }
    }
}

impl PaymentEventKind {
    pub fn target_status(&self) -> Option<OrderStatus> {
        match self {
            Self::PaymentSucceeded => Some(OrderStatus::Completed),
            Self::PaymentFailed => Some(OrderStatus::Failed),
            Self::PaymentCancelled => Some(OrderStatus::Cancelled),
            Self::Unsupported(_) => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawPaymentEvent {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type", default)]
    event_type: Option<String>,
    #[serde(default)]
    data: RawPaymentData,
}

#[derive(Debug, Default, Deserialize)]
struct RawPaymentData {
    #[serde(default)]
    order_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentEvent {
    pub id: Option<String>,
    pub kind: PaymentEventKind,
    pub provider_order_id: Option<String>,
}

pub fn parse_event(body: &[u8]) -> AppResult<PaymentEvent> {
    let raw: RawPaymentEvent = serde_json::from_slice(body)
        .map_err(|err| AppError::validation(format!("webhook body is not a valid event: {err}")))?;
    let event_type = raw
        .event_type
        .filter(|kind| !kind.trim().is_empty())
        .ok_or_else(|| AppError::validation("webhook event has no type"))?;
    Ok(PaymentEvent {
        id: raw.id,
        kind: PaymentEventKind::from(event_type.as_str()),
        provider_order_id: raw
            .data
            .order_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty()),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// This delivery moved the order out of `pending`.
    Settled {
        order_id: Uuid,
        status: OrderStatus,
        credits_granted: i64,
    },
    /// The order was already terminal; nothing changed.
    AlreadySettled { order_id: Uuid, status: OrderStatus },
    Ignored { event_type: String },
}

#[derive(sqlx::FromRow)]
struct SettledOrder {
    id: Uuid,
    author_id: i32,
    total_credits: i64,
}

#[derive(sqlx::FromRow)]
struct OrderState {
    id: Uuid,
    status: OrderStatus,
}

/// key: webhook-reconciler -> exactly-once settlement of payment orders
#[derive(Clone)]
pub struct WebhookReconciler {
    pool: PgPool,
    secret: Option<String>,
    tolerance: Duration,
}

impl WebhookReconciler {
    pub fn new(pool: PgPool, secret: Option<String>, tolerance: Duration) -> Self {
        Self {
            pool,
            secret,
            tolerance,
        }
    }

    pub async fn handle(
        &self,
        body: &[u8],
        signature: Option<&str>,
        timestamp: Option<&str>,
    ) -> AppResult<WebhookOutcome> {
        authenticate(
            self.secret.as_deref(),
            self.tolerance,
            body,
            signature,
            timestamp,
            Utc::now(),
        )?;

        let event = parse_event(body)?;
        let Some(target) = event.kind.target_status() else {
            let event_type = match event.kind {
                PaymentEventKind::Unsupported(kind) => kind,
                _ => String::new(),
            };
            debug!(event = ?event.id, %event_type, "payment webhook ignored");
            return Ok(WebhookOutcome::Ignored { event_type });
        };
        let provider_order_id = event
            .provider_order_id
            .ok_or_else(|| AppError::validation("webhook event has no order id"))?;

        self.apply(&provider_order_id, target).await
    }

    /// Compare-and-swap out of `pending`; a completed order gets its
    /// purchase entry in the same transaction.
    async fn apply(&self, provider_order_id: &str, target: OrderStatus) -> AppResult<WebhookOutcome> {
        let mut tx = self.pool.begin().await?;
        let settled = sqlx::query_as::<_, SettledOrder>(
            r#"
            UPDATE payment_orders
            SET status = $2, settled_at = NOW(), updated_at = NOW()
            WHERE provider_order_id = $1 AND status = $3
            RETURNING id, author_id, total_credits
            "#,
        )
        .bind(provider_order_id)
        .bind(target)
        .bind(OrderStatus::Pending)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(order) = settled else {
            let current = sqlx::query_as::<_, OrderState>(
                "SELECT id, status FROM payment_orders WHERE provider_order_id = $1",
            )
            .bind(provider_order_id)
            .fetch_optional(&mut *tx)
            .await?;
            tx.rollback().await?;
            return match current {
                Some(current) => {
                    info!(
                        order = %current.id,
                        status = current.status.as_str(),
                        requested = target.as_str(),
                        "payment webhook for settled order; no effect"
                    );
                    Ok(WebhookOutcome::AlreadySettled {
                        order_id: current.id,
                        status: current.status,
                    })
                }
                None => {
                    warn!(provider_order_id, "payment webhook for unknown order");
                    Err(AppError::validation("webhook references an unknown order"))
                }
            };
        };

        let credits_granted = if target == OrderStatus::Completed {
            append_in_tx(
                &mut tx,
                NewLedgerEntry::new(order.author_id, order.total_credits, LedgerEventType::Purchase)
                    .with_order(order.id),
            )
            .await?;
            order.total_credits
        } else {
            0
        };
        tx.commit().await?;

        info!(
            order = %order.id,
            author_id = order.author_id,
            status = target.as_str(),
            credits_granted,
            "payment order settled"
        );
        Ok(WebhookOutcome::Settled {
            order_id: order.id,
            status: target,
            credits_granted,
        })
    }
}
