use sqlx::{PgExecutor, PgPool};
use tracing::info;

use crate::error::{AppError, AppResult};

use super::ledger::append_in_tx;
use super::models::{Author, LedgerEventType, NewLedgerEntry};

/// key: authors -> identity rows the ledger hangs off
#[derive(Clone)]
pub struct AuthorService {
    pool: PgPool,
    initial_grant: i64,
}

impl AuthorService {
    pub fn new(pool: PgPool, initial_grant: i64) -> Self {
        Self {
            pool,
            initial_grant,
        }
    }

    /// Creates the author and, when configured, the `initial_grant` entry in
    /// the same transaction.
    pub async fn create(&self, email: &str) -> AppResult<Author> {
        let email = email.trim().to_lowercase();
        if email.len() < 3 || !email.contains('@') {
            return Err(AppError::validation("a valid email is required"));
        }

        let mut tx = self.pool.begin().await?;
        let author = sqlx::query_as::<_, Author>(
            r#"
            INSERT INTO authors (email) VALUES ($1)
            ON CONFLICT (email) DO NOTHING
            RETURNING id, email, created_at
            "#,
        )
        .bind(&email)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::Conflict(format!("author `{email}` already exists")))?;

        if self.initial_grant > 0 {
            append_in_tx(
                &mut tx,
                NewLedgerEntry::new(author.id, self.initial_grant, LedgerEventType::InitialGrant)
                    .with_note("welcome credits"),
            )
            .await?;
        }
        tx.commit().await?;

        info!(author_id = author.id, initial_grant = self.initial_grant, "author created");
        Ok(author)
    }
}

pub(crate) async fn author_exists<'e, E>(executor: E, author_id: i32) -> AppResult<bool>
where
    E: PgExecutor<'e>,
{
    let found: Option<i32> = sqlx::query_scalar("SELECT id FROM authors WHERE id = $1")
        .bind(author_id)
        .fetch_optional(executor)
        .await?;
    Ok(found.is_some())
}

pub(crate) async fn require_author<'e, E>(executor: E, author_id: i32) -> AppResult<()>
where
    E: PgExecutor<'e>,
{
    if author_exists(executor, author_id).await? {
        Ok(())
    } else {
        Err(AppError::NotFound("author"))
    }
}
