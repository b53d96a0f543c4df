use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{debug, info};

use crate::error::{AppError, AppResult};

use super::ledger::{append_in_tx, balance_of, lock_author};
use super::models::{LedgerEventType, NewLedgerEntry, PromotionCode};

static CODE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Z0-9][A-Z0-9_-]{2,63}$").expect("promotion code pattern compiles")
});

/// Trims and upper-cases a code; `None` when it cannot be a code at all.
pub fn normalize_code(raw: &str) -> Option<String> {
    let code = raw.trim().to_uppercase();
    CODE_PATTERN.is_match(&code).then_some(code)
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RedeemedPromotion {
    pub code: String,
    pub credits_granted: i64,
    pub balance: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewPromotionCode {
    pub code: String,
    pub credits_granted: i64,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_redemptions: Option<i64>,
}

/// key: promotion-redeemer -> one redemption per author per code
#[derive(Clone)]
pub struct PromotionService {
    pool: PgPool,
}

impl PromotionService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Redeems `raw_code` for the author. Every rejection, including an
    /// unknown author, surfaces as [`AppError::InvalidCode`].
    pub async fn redeem(&self, author_id: i32, raw_code: &str) -> AppResult<RedeemedPromotion> {
        let Some(code) = normalize_code(raw_code) else {
            return reject(author_id, raw_code, "malformed");
        };

        // author lock first: the redemption insert below takes a key-share
        // lock on the same row, and the ledger append upgrades it
        let mut tx = self.pool.begin().await?;
        if !lock_author(&mut tx, author_id).await? {
            return reject(author_id, &code, "unknown_author");
        }
        let promo = sqlx::query_as::<_, PromotionCode>(
            r#"
            SELECT code, credits_granted, active, expires_at, max_redemptions, redemption_count, created_at
            FROM promotion_codes
            WHERE code = $1
            "#,
        )
        .bind(&code)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(promo) = promo else {
            return reject(author_id, &code, "not_found");
        };
        if !promo.is_redeemable(Utc::now()) {
            return reject(author_id, &code, "inactive");
        }

        // the primary key on (author_id, code) is the concurrency guard
        let claimed: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO promotion_redemptions (author_id, code)
            VALUES ($1, $2)
            ON CONFLICT (author_id, code) DO NOTHING
            RETURNING code
            "#,
        )
        .bind(author_id)
        .bind(&code)
        .fetch_optional(&mut *tx)
        .await?;
        if claimed.is_none() {
            return reject(author_id, &code, "already_redeemed");
        }

        let counted: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE promotion_codes
            SET redemption_count = redemption_count + 1
            WHERE code = $1
              AND active
              AND (expires_at IS NULL OR expires_at > NOW())
              AND (max_redemptions IS NULL OR redemption_count < max_redemptions)
            RETURNING credits_granted
            "#,
        )
        .bind(&code)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(credits_granted) = counted else {
            return reject(author_id, &code, "exhausted");
        };

        append_in_tx(
            &mut tx,
            NewLedgerEntry::new(author_id, credits_granted, LedgerEventType::PromoRedeem)
                .with_note(code.clone()),
        )
        .await?;
        let balance = balance_of(&mut *tx, author_id).await?;
        tx.commit().await?;

        info!(%author_id, %code, credits_granted, "promotion redeemed");
        Ok(RedeemedPromotion {
            code,
            credits_granted,
            balance,
        })
    }

    pub async fn create_code(&self, request: NewPromotionCode) -> AppResult<PromotionCode> {
        let code = normalize_code(&request.code)
            .ok_or_else(|| AppError::validation("promotion code format is invalid"))?;
        if request.credits_granted <= 0 {
            return Err(AppError::validation("promotion must grant credits"));
        }
        if matches!(request.max_redemptions, Some(cap) if cap <= 0) {
            return Err(AppError::validation("max_redemptions must be positive"));
        }

        let created = sqlx::query_as::<_, PromotionCode>(
            r#"
            INSERT INTO promotion_codes (code, credits_granted, expires_at, max_redemptions)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (code) DO NOTHING
            RETURNING code, credits_granted, active, expires_at, max_redemptions, redemption_count, created_at
            "#,
        )
        .bind(&code)
        .bind(request.credits_granted)
        .bind(request.expires_at)
        .bind(request.max_redemptions)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::Conflict(format!("promotion code `{code}` already exists")))?;

        info!(code = %created.code, credits = created.credits_granted, "promotion code created");
        Ok(created)
    }

    pub async fn deactivate(&self, raw_code: &str) -> AppResult<PromotionCode> {
        let code = normalize_code(raw_code).ok_or(AppError::NotFound("promotion code"))?;
        let updated = sqlx::query_as::<_, PromotionCode>(
            r#"
            UPDATE promotion_codes SET active = FALSE
            WHERE code = $1
            RETURNING code, credits_granted, active, expires_at, max_redemptions, redemption_count, created_at
            "#,
        )
        .bind(&code)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::NotFound("promotion code"))?;

        info!(code = %updated.code, "promotion code deactivated");
        Ok(updated)
    }
}

/// Logs the real reason and hands the caller the generic error. Dropping the
/// open transaction rolls back anything claimed so far.
fn reject<T>(author_id: i32, code: &str, reason: &'static str) -> AppResult<T> {
    debug!(%author_id, code, reason, "promotion redemption rejected");
    Err(AppError::InvalidCode)
}
