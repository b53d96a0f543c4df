use serde::Serialize;
use serde_json::Value;
use sqlx::{PgExecutor, PgPool, Postgres, QueryBuilder};
use tracing::info;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

use super::authors::require_author;
use super::ledger::{append_in_tx, balance_of, lock_author};
use super::models::{AiEditAction, AiEditRecord, LedgerEventType, NewLedgerEntry};
use super::pricing::{ActionPricing, PricingTable};

/// Answer to "may this author run one more edit, and at what cost?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entitlement {
    pub can_edit: bool,
    pub required_credits: i64,
    pub current_balance: i64,
    pub edit_count: i64,
    /// Present while the author is still inside the free tier.
    pub next_threshold: Option<i64>,
    pub is_free: bool,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EditBreakdown {
    pub free_edits: i64,
    pub paid_edits: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchEntitlement {
    pub can_edit: bool,
    pub requested: i64,
    pub total_credits: i64,
    pub current_balance: i64,
    pub edit_count: i64,
    pub next_threshold: Option<i64>,
    pub is_free: bool,
    pub breakdown: EditBreakdown,
    pub message: String,
}

/// Splits `requested` sequential edits into the free and the paid portion.
pub fn split_batch(pricing: ActionPricing, edit_count: i64, requested: i64) -> EditBreakdown {
    let free_left = (pricing.free_threshold - edit_count).max(0);
    let free_edits = requested.min(free_left).max(0);
    EditBreakdown {
        free_edits,
        paid_edits: requested - free_edits,
    }
}

fn next_threshold(pricing: ActionPricing, edit_count: i64) -> Option<i64> {
    (edit_count < pricing.free_threshold).then_some(pricing.free_threshold)
}

pub fn evaluate(pricing: ActionPricing, edit_count: i64, balance: i64) -> Entitlement {
    if edit_count < pricing.free_threshold {
        let remaining = pricing.free_threshold - edit_count;
        return Entitlement {
            can_edit: true,
            required_credits: 0,
            current_balance: balance,
            edit_count,
            next_threshold: next_threshold(pricing, edit_count),
            is_free: true,
            message: format!(
                "{remaining} free edit{} remaining",
                if remaining == 1 { "" } else { "s" }
            ),
        };
    }

    let required = pricing.price_credits;
    let can_edit = balance >= required;
    let message = if can_edit {
        format!("This edit costs {required} credits")
    } else {
        format!("Insufficient credits: {required} required, {balance} available")
    };
    Entitlement {
        can_edit,
        required_credits: required,
        current_balance: balance,
        edit_count,
        next_threshold: None,
        is_free: false,
        message,
    }
}

pub fn evaluate_batch(
    pricing: ActionPricing,
    edit_count: i64,
    requested: i64,
    balance: i64,
) -> BatchEntitlement {
    let breakdown = split_batch(pricing, edit_count, requested);
    let total_credits = breakdown.paid_edits.saturating_mul(pricing.price_credits);
    let can_edit = total_credits == 0 || balance >= total_credits;
    let message = match (total_credits, can_edit) {
        (0, _) => format!("All {requested} edits are within the free tier"),
        (_, true) if breakdown.free_edits > 0 => format!(
            "{} free, {} paid edits for {total_credits} credits",
            breakdown.free_edits, breakdown.paid_edits
        ),
        (_, true) => format!("{requested} edits cost {total_credits} credits"),
        (_, false) => {
            format!("Insufficient credits: {total_credits} required, {balance} available")
        }
    };
    BatchEntitlement {
        can_edit,
        requested,
        total_credits,
        current_balance: balance,
        edit_count,
        next_threshold: next_threshold(pricing, edit_count),
        is_free: total_credits == 0,
        breakdown,
        message,
    }
}

/// A confirmed edit batch: one metadata object per occurrence.
#[derive(Debug, Clone)]
pub struct CommitEdits {
    pub story_id: Uuid,
    pub action: AiEditAction,
    pub items: Vec<Value>,
    /// Total the caller was shown; the commit refuses if it no longer holds.
    pub quoted_credits: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommittedEdits {
    pub action: AiEditAction,
    pub story_id: Uuid,
    pub breakdown: EditBreakdown,
    pub charged_credits: i64,
    pub balance: i64,
    pub records: Vec<AiEditRecord>,
}

/// key: entitlement-engine -> free-tier counting, batch pricing, debit
#[derive(Clone)]
pub struct EntitlementService {
    pool: PgPool,
    pricing: PricingTable,
    max_batch: i64,
}

impl EntitlementService {
    pub fn new(pool: PgPool, pricing: PricingTable, max_batch: i64) -> Self {
        Self {
            pool,
            pricing,
            max_batch,
        }
    }

    pub async fn check(&self, author_id: i32, action: AiEditAction) -> AppResult<Entitlement> {
        require_author(&self.pool, author_id).await?;
        let edit_count = edit_count(&self.pool, author_id, action).await?;
        let balance = balance_of(&self.pool, author_id).await?;
        Ok(evaluate(self.pricing.for_action(action), edit_count, balance))
    }

    pub async fn check_batch(
        &self,
        author_id: i32,
        action: AiEditAction,
        requested: i64,
    ) -> AppResult<BatchEntitlement> {
        self.validate_batch_size(requested)?;
        require_author(&self.pool, author_id).await?;
        let edit_count = edit_count(&self.pool, author_id, action).await?;
        let balance = balance_of(&self.pool, author_id).await?;
        Ok(evaluate_batch(
            self.pricing.for_action(action),
            edit_count,
            requested,
            balance,
        ))
    }

    /// Records the edits and debits their cost as one unit. Count, balance
    /// and debit are all taken under the author row lock, so the batch that
    /// is priced is exactly the batch that is charged.
    pub async fn commit_edits(
        &self,
        author_id: i32,
        request: CommitEdits,
    ) -> AppResult<CommittedEdits> {
        let requested = request.items.len() as i64;
        self.validate_batch_size(requested)?;

        let mut tx = self.pool.begin().await?;
        if !lock_author(&mut tx, author_id).await? {
            return Err(AppError::NotFound("author"));
        }
        let edit_count = edit_count(&mut *tx, author_id, request.action).await?;
        let balance = balance_of(&mut *tx, author_id).await?;
        let quote = evaluate_batch(
            self.pricing.for_action(request.action),
            edit_count,
            requested,
            balance,
        );

        if let Some(quoted) = request.quoted_credits {
            if quoted != quote.total_credits {
                return Err(AppError::Conflict(format!(
                    "quoted {quoted} credits but the batch now costs {}",
                    quote.total_credits
                )));
            }
        }
        if !quote.can_edit {
            return Err(AppError::InsufficientCredits {
                required: quote.total_credits,
                balance,
            });
        }

        let mut builder = QueryBuilder::<Postgres>::new(
            "INSERT INTO ai_edit_records (author_id, story_id, action, metadata) ",
        );
        builder.push_values(request.items.iter(), |mut row, metadata| {
            row.push_bind(author_id)
                .push_bind(request.story_id)
                .push_bind(request.action)
                .push_bind(metadata.clone());
        });
        builder.push(" RETURNING id, author_id, story_id, action, metadata, created_at");
        let records = builder
            .build_query_as::<AiEditRecord>()
            .fetch_all(&mut *tx)
            .await?;

        let mut balance_after = balance;
        if quote.total_credits > 0 {
            let entry = append_in_tx(
                &mut tx,
                NewLedgerEntry::new(author_id, -quote.total_credits, LedgerEventType::AiEditDebit)
                    .with_story(request.story_id)
                    .with_note(format!("{} x{requested}", request.action)),
            )
            .await?;
            balance_after += entry.amount;
        }
        tx.commit().await?;

        info!(
            %author_id,
            story = %request.story_id,
            action = request.action.as_str(),
            free = quote.breakdown.free_edits,
            paid = quote.breakdown.paid_edits,
            charged = quote.total_credits,
            "ai edits committed"
        );

        Ok(CommittedEdits {
            action: request.action,
            story_id: request.story_id,
            breakdown: quote.breakdown,
            charged_credits: quote.total_credits,
            balance: balance_after,
            records,
        })
    }

    fn validate_batch_size(&self, requested: i64) -> AppResult<()> {
        if requested < 1 || requested > self.max_batch {
            return Err(AppError::validation(format!(
                "edit count must be between 1 and {}",
                self.max_batch
            )));
        }
        Ok(())
    }
}

/// Prior edits of this action by the author, across all stories.
async fn edit_count<'e, E>(executor: E, author_id: i32, action: AiEditAction) -> AppResult<i64>
where
    E: PgExecutor<'e>,
{
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM ai_edit_records WHERE author_id = $1 AND action = $2",
    )
    .bind(author_id)
    .bind(action)
    .fetch_one(executor)
    .await?;
    Ok(count)
}
