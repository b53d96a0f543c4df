use sqlx::{PgExecutor, PgPool, Postgres, Transaction};
use tracing::info;

use crate::error::{AppError, AppResult};

use super::authors::require_author;
use super::models::{CreditLedgerEntry, HistoryEntry, LedgerEventType, NewLedgerEntry};

/// key: credit-ledger -> append-only store, derive-on-read balance
#[derive(Clone)]
pub struct LedgerService {
    pool: PgPool,
}

/// Signed entry kinds an administrator may append by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustmentKind {
    AdminAdjustment,
    Refund,
}

impl LedgerService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn append(&self, entry: NewLedgerEntry) -> AppResult<CreditLedgerEntry> {
        let mut tx = self.pool.begin().await?;
        let row = append_in_tx(&mut tx, entry).await?;
        tx.commit().await?;
        Ok(row)
    }

    pub async fn balance(&self, author_id: i32) -> AppResult<i64> {
        require_author(&self.pool, author_id).await?;
        balance_of(&self.pool, author_id).await
    }

    /// Most recent entries first, each with the balance right after it.
    pub async fn history(&self, author_id: i32, limit: i64) -> AppResult<Vec<HistoryEntry>> {
        if limit < 1 {
            return Err(AppError::validation("history limit must be positive"));
        }

        // balance and page must come from the same snapshot
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await?;
        require_author(&mut *tx, author_id).await?;
        let balance = balance_of(&mut *tx, author_id).await?;
        let entries = sqlx::query_as::<_, CreditLedgerEntry>(
            r#"
            SELECT id, author_id, amount, event_type, story_id, purchase_order_id, note, created_at
            FROM credit_ledger_entries
            WHERE author_id = $1
            ORDER BY id DESC
            LIMIT $2
            "#,
        )
        .bind(author_id)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(annotate_history(balance, entries))
    }

    pub async fn adjust(
        &self,
        author_id: i32,
        amount: i64,
        kind: AdjustmentKind,
        reason: &str,
    ) -> AppResult<CreditLedgerEntry> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(AppError::validation("an adjustment reason is required"));
        }
        let event_type = match kind {
            AdjustmentKind::AdminAdjustment => LedgerEventType::AdminAdjustment,
            AdjustmentKind::Refund if amount > 0 => LedgerEventType::Refund,
            AdjustmentKind::Refund => {
                return Err(AppError::validation("refunds must grant a positive amount"))
            }
        };
        self.append(NewLedgerEntry::new(author_id, amount, event_type).with_note(reason))
            .await
    }
}

/// Locks the author row for the rest of the transaction. Every balance
/// mutation goes through this lock, so a balance read after it is stable
/// until commit.
pub(crate) async fn lock_author(
    tx: &mut Transaction<'_, Postgres>,
    author_id: i32,
) -> AppResult<bool> {
    let locked: Option<i32> =
        sqlx::query_scalar("SELECT id FROM authors WHERE id = $1 FOR UPDATE")
            .bind(author_id)
            .fetch_optional(&mut **tx)
            .await?;
    Ok(locked.is_some())
}

/// Inserts one ledger entry inside the caller's transaction. The ledger does
/// not enforce non-negative balances; callers check before debiting.
pub(crate) async fn append_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    entry: NewLedgerEntry,
) -> AppResult<CreditLedgerEntry> {
    if entry.amount == 0 {
        return Err(AppError::validation("ledger amount must be non-zero"));
    }
    if !lock_author(tx, entry.author_id).await? {
        return Err(AppError::validation(format!(
            "unknown author {}",
            entry.author_id
        )));
    }

    let row = sqlx::query_as::<_, CreditLedgerEntry>(
        r#"
        INSERT INTO credit_ledger_entries (
            author_id,
            amount,
            event_type,
            story_id,
            purchase_order_id,
            note
        ) VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id, author_id, amount, event_type, story_id, purchase_order_id, note, created_at
        "#,
    )
    .bind(entry.author_id)
    .bind(entry.amount)
    .bind(entry.event_type)
    .bind(entry.story_id)
    .bind(entry.purchase_order_id)
    .bind(&entry.note)
    .fetch_one(&mut **tx)
    .await?;

    info!(
        author_id = row.author_id,
        entry = row.id,
        amount = row.amount,
        event_type = row.event_type.as_str(),
        "ledger entry appended"
    );
    Ok(row)
}

/// Sum of every entry for the author; 0 when there are none.
pub(crate) async fn balance_of<'e, E>(executor: E, author_id: i32) -> AppResult<i64>
where
    E: PgExecutor<'e>,
{
    let balance: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(amount), 0)::BIGINT FROM credit_ledger_entries WHERE author_id = $1",
    )
    .bind(author_id)
    .fetch_one(executor)
    .await?;
    Ok(balance)
}

pub fn annotate_history(
    current_balance: i64,
    newest_first: Vec<CreditLedgerEntry>,
) -> Vec<HistoryEntry> {
    let amounts: Vec<i64> = newest_first.iter().map(|entry| entry.amount).collect();
    let balances = balances_backward(current_balance, &amounts);
    newest_first
        .into_iter()
        .zip(balances)
        .map(|(entry, balance_after)| HistoryEntry {
            entry,
            balance_after,
        })
        .collect()
}

/// `balance_after[0] = current`, then each older entry subtracts the
/// amount of the entry just newer than it.
pub fn balances_backward(current_balance: i64, newest_first: &[i64]) -> Vec<i64> {
    let mut balances = Vec::with_capacity(newest_first.len());
    let mut balance_after = current_balance;
    for amount in newest_first {
        balances.push(balance_after);
        balance_after -= amount;
    }
    balances
}

/// Running balance walking oldest to newest from zero.
pub fn balances_forward(oldest_first: &[i64]) -> Vec<i64> {
    oldest_first
        .iter()
        .scan(0_i64, |running, amount| {
            *running += amount;
            Some(*running)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sequences() -> Vec<Vec<i64>> {
        vec![
            vec![],
            vec![10],
            vec![50, -3, -3, 10, -6],
            vec![-5, 5, -5, 5],
            vec![100, -100, 1, 2, 3, -7, 40, -15, -15, 300],
            (1..=40).map(|i| if i % 3 == 0 { -i } else { i * 2 }).collect(),
        ]
    }

    #[test]
    fn backward_and_forward_reconstruction_agree() {
        for oldest_first in sequences() {
            let total: i64 = oldest_first.iter().sum();
            let forward = balances_forward(&oldest_first);

            let newest_first: Vec<i64> = oldest_first.iter().rev().copied().collect();
            let mut backward = balances_backward(total, &newest_first);
            backward.reverse();

            assert_eq!(forward, backward, "sequence {oldest_first:?}");
            assert_eq!(forward.last().copied().unwrap_or(0), total);
        }
    }

    #[test]
    fn truncated_window_matches_tail_of_full_history() {
        for oldest_first in sequences() {
            let total: i64 = oldest_first.iter().sum();
            let forward = balances_forward(&oldest_first);
            let window = oldest_first.len().min(4);

            let newest_first: Vec<i64> = oldest_first.iter().rev().take(window).copied().collect();
            let backward = balances_backward(total, &newest_first);
            let expected: Vec<i64> = forward.iter().rev().take(window).copied().collect();
            assert_eq!(backward, expected);
        }
    }

    #[test]
    fn annotate_history_starts_at_current_balance() {
        let now = Utc::now();
        let entry = |id: i64, amount: i64| CreditLedgerEntry {
            id,
            author_id: 1,
            amount,
            event_type: if amount > 0 {
                LedgerEventType::Purchase
            } else {
                LedgerEventType::AiEditDebit
            },
            story_id: None,
            purchase_order_id: None,
            note: None,
            created_at: now,
        };
        // oldest to newest: +50, -3, +10
        let newest_first = vec![entry(3, 10), entry(2, -3), entry(1, 50)];
        let history = annotate_history(57, newest_first);
        let balances: Vec<i64> = history.iter().map(|item| item.balance_after).collect();
        assert_eq!(balances, vec![57, 47, 50]);
        assert_eq!(history[0].entry.id, 3);
    }
}
