use credit_ledger::credits::{
    AdjustmentKind, AuthorService, LedgerEventType, LedgerService, NewLedgerEntry,
};
use credit_ledger::error::AppError;
use sqlx::PgPool;

async fn author(pool: &PgPool, email: &str, initial_grant: i64) -> i32 {
    AuthorService::new(pool.clone(), initial_grant)
        .create(email)
        .await
        .unwrap()
        .id
}

// key: ledger-tests -> sum invariant, history reconstruction
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn balance_is_sum_of_entries_and_history_walks_back(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let author_id = author(&pool, "ledger@example.com", 10).await;
    let ledger = LedgerService::new(pool.clone());

    for (amount, event_type) in [
        (50, LedgerEventType::Purchase),
        (-3, LedgerEventType::AiEditDebit),
        (-3, LedgerEventType::AiEditDebit),
        (5, LedgerEventType::PromoRedeem),
    ] {
        ledger
            .append(NewLedgerEntry::new(author_id, amount, event_type))
            .await
            .unwrap();
    }

    let balance = ledger.balance(author_id).await.unwrap();
    assert_eq!(balance, 10 + 50 - 3 - 3 + 5);

    let history = ledger.history(author_id, 100).await.unwrap();
    assert_eq!(history.len(), 5);
    assert_eq!(history[0].balance_after, balance);
    let oldest = history.last().unwrap();
    assert_eq!(oldest.entry.event_type, LedgerEventType::InitialGrant);
    assert_eq!(oldest.balance_after, oldest.entry.amount);
    for pair in history.windows(2) {
        assert_eq!(
            pair[1].balance_after,
            pair[0].balance_after - pair[0].entry.amount
        );
    }

    let page = ledger.history(author_id, 2).await.unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].balance_after, history[0].balance_after);
    assert_eq!(page[1].balance_after, history[1].balance_after);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn author_without_entries_has_zero_balance(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let author_id = author(&pool, "empty@example.com", 0).await;
    let ledger = LedgerService::new(pool.clone());

    assert_eq!(ledger.balance(author_id).await.unwrap(), 0);
    assert!(ledger.history(author_id, 20).await.unwrap().is_empty());
    assert!(matches!(
        ledger.balance(author_id + 1000).await,
        Err(AppError::NotFound("author"))
    ));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn zero_amounts_and_unknown_authors_are_rejected(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let author_id = author(&pool, "zero@example.com", 0).await;
    let ledger = LedgerService::new(pool.clone());

    assert!(matches!(
        ledger
            .append(NewLedgerEntry::new(author_id, 0, LedgerEventType::AdminAdjustment))
            .await,
        Err(AppError::Validation(_))
    ));
    assert!(matches!(
        ledger
            .append(NewLedgerEntry::new(author_id + 1000, 5, LedgerEventType::AdminAdjustment))
            .await,
        Err(AppError::Validation(_))
    ));
    assert!(matches!(
        ledger
            .adjust(author_id, -5, AdjustmentKind::Refund, "chargeback")
            .await,
        Err(AppError::Validation(_))
    ));

    let entry = ledger
        .adjust(author_id, -2, AdjustmentKind::AdminAdjustment, "goodwill correction")
        .await
        .unwrap();
    assert_eq!(entry.event_type, LedgerEventType::AdminAdjustment);
    assert_eq!(ledger.balance(author_id).await.unwrap(), -2);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn ledger_rows_cannot_be_rewritten(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let author_id = author(&pool, "immutable@example.com", 25).await;

    let update = sqlx::query("UPDATE credit_ledger_entries SET amount = 1000 WHERE author_id = $1")
        .bind(author_id)
        .execute(&pool)
        .await;
    assert!(update.is_err());

    let delete = sqlx::query("DELETE FROM credit_ledger_entries WHERE author_id = $1")
        .bind(author_id)
        .execute(&pool)
        .await;
    assert!(delete.is_err());

    let ledger = LedgerService::new(pool.clone());
    assert_eq!(ledger.balance(author_id).await.unwrap(), 25);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn concurrent_appends_all_land(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let author_id = author(&pool, "concurrent@example.com", 0).await;
    let ledger = LedgerService::new(pool.clone());

    let tasks = (0..10).map(|i| {
        let ledger = ledger.clone();
        tokio::spawn(async move {
            ledger
                .append(NewLedgerEntry::new(author_id, i + 1, LedgerEventType::AdminAdjustment))
                .await
        })
    });
    for task in tasks.collect::<Vec<_>>() {
        task.await.unwrap().unwrap();
    }

    assert_eq!(ledger.balance(author_id).await.unwrap(), (1..=10).sum::<i64>());
}
