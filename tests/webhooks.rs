use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use credit_ledger::credits::webhook::compute_signature;
use credit_ledger::credits::{
    AuthorService, CreateOrder, CreatedOrder, LedgerEventType, LedgerService, OrderService,
    OrderStatus, PackageCatalog, PackageRequest, StubPaymentGateway, WebhookOutcome,
    WebhookReconciler,
};
use credit_ledger::error::AppError;
use serde_json::json;
use sqlx::PgPool;

const SECRET: &str = "whsec_integration";

fn reconciler(pool: &PgPool) -> WebhookReconciler {
    WebhookReconciler::new(pool.clone(), Some(SECRET.into()), Duration::from_secs(300))
}

async fn deliver(
    reconciler: &WebhookReconciler,
    event_type: &str,
    provider_order_id: &str,
) -> Result<WebhookOutcome, AppError> {
    let body = serde_json::to_vec(&json!({
        "id": format!("evt_{}", uuid::Uuid::new_v4().simple()),
        "type": event_type,
        "data": { "order_id": provider_order_id },
    }))
    .unwrap();
    let timestamp = Utc::now().timestamp().to_string();
    let signature = compute_signature(SECRET, &timestamp, &body);
    reconciler
        .handle(&body, Some(&signature), Some(&timestamp))
        .await
}

async fn pending_order(pool: &PgPool, email: &str) -> (i32, CreatedOrder) {
    let author_id = AuthorService::new(pool.clone(), 0)
        .create(email)
        .await
        .unwrap()
        .id;
    let order = OrderService::new(
        pool.clone(),
        Arc::new(StubPaymentGateway),
        PackageCatalog::default(),
    )
    .create_order(
        author_id,
        CreateOrder {
            packages: vec![PackageRequest {
                package_id: "starter".into(),
                quantity: 1,
            }],
            idempotency_key: format!("{email}-checkout"),
        },
    )
    .await
    .unwrap();
    (author_id, order)
}

// key: webhook-tests -> exactly-once grant, sticky terminal states
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn duplicate_success_delivery_grants_once(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let (author_id, order) = pending_order(&pool, "paid@example.com").await;
    let provider_order_id = order.provider_order_id.clone().unwrap();
    let reconciler = reconciler(&pool);

    let first = deliver(&reconciler, "payment.succeeded", &provider_order_id)
        .await
        .unwrap();
    assert_eq!(
        first,
        WebhookOutcome::Settled {
            order_id: order.order_id,
            status: OrderStatus::Completed,
            credits_granted: 50,
        }
    );

    let second = deliver(&reconciler, "payment.succeeded", &provider_order_id)
        .await
        .unwrap();
    assert_eq!(
        second,
        WebhookOutcome::AlreadySettled {
            order_id: order.order_id,
            status: OrderStatus::Completed,
        }
    );

    let ledger = LedgerService::new(pool.clone());
    assert_eq!(ledger.balance(author_id).await.unwrap(), 50);
    let history = ledger.history(author_id, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].entry.event_type, LedgerEventType::Purchase);
    assert_eq!(history[0].entry.purchase_order_id, Some(order.order_id));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn concurrent_success_deliveries_grant_once(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let (author_id, order) = pending_order(&pool, "racing@example.com").await;
    let provider_order_id = order.provider_order_id.clone().unwrap();
    let reconciler = reconciler(&pool);

    let (a, b) = tokio::join!(
        deliver(&reconciler, "payment.succeeded", &provider_order_id),
        deliver(&reconciler, "payment.succeeded", &provider_order_id),
    );
    let settled = [a.unwrap(), b.unwrap()]
        .iter()
        .filter(|outcome| matches!(outcome, WebhookOutcome::Settled { .. }))
        .count();
    assert_eq!(settled, 1);

    let ledger = LedgerService::new(pool.clone());
    assert_eq!(ledger.balance(author_id).await.unwrap(), 50);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn failure_after_success_does_not_uncredit(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let (author_id, order) = pending_order(&pool, "sticky@example.com").await;
    let provider_order_id = order.provider_order_id.clone().unwrap();
    let reconciler = reconciler(&pool);

    deliver(&reconciler, "payment.succeeded", &provider_order_id)
        .await
        .unwrap();
    let late = deliver(&reconciler, "payment.failed", &provider_order_id)
        .await
        .unwrap();
    assert!(matches!(
        late,
        WebhookOutcome::AlreadySettled {
            status: OrderStatus::Completed,
            ..
        }
    ));

    let orders = OrderService::new(
        pool.clone(),
        Arc::new(StubPaymentGateway),
        PackageCatalog::default(),
    );
    let stored = orders.order(author_id, order.order_id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::Completed);
    assert_eq!(
        LedgerService::new(pool.clone())
            .balance(author_id)
            .await
            .unwrap(),
        50
    );
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn failed_payment_has_no_ledger_effect(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let (author_id, order) = pending_order(&pool, "declined@example.com").await;
    let provider_order_id = order.provider_order_id.clone().unwrap();
    let reconciler = reconciler(&pool);

    let outcome = deliver(&reconciler, "payment.failed", &provider_order_id)
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        WebhookOutcome::Settled {
            status: OrderStatus::Failed,
            credits_granted: 0,
            ..
        }
    ));

    let late_success = deliver(&reconciler, "payment.succeeded", &provider_order_id)
        .await
        .unwrap();
    assert!(matches!(late_success, WebhookOutcome::AlreadySettled { .. }));
    assert_eq!(
        LedgerService::new(pool.clone())
            .balance(author_id)
            .await
            .unwrap(),
        0
    );
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn unknown_orders_and_event_types(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let reconciler = reconciler(&pool);

    assert!(matches!(
        deliver(&reconciler, "payment.succeeded", "prov_does_not_exist").await,
        Err(AppError::Validation(_))
    ));
    assert_eq!(
        deliver(&reconciler, "customer.updated", "prov_does_not_exist")
            .await
            .unwrap(),
        WebhookOutcome::Ignored {
            event_type: "customer.updated".into()
        }
    );
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn unsigned_delivery_changes_nothing(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let (author_id, order) = pending_order(&pool, "forged@example.com").await;
    let provider_order_id = order.provider_order_id.clone().unwrap();

    let body = serde_json::to_vec(&json!({
        "id": "evt_forged",
        "type": "payment.succeeded",
        "data": { "order_id": provider_order_id },
    }))
    .unwrap();
    let timestamp = Utc::now().timestamp().to_string();
    let forged = compute_signature("not-the-secret", &timestamp, &body);
    let result = reconciler(&pool)
        .handle(&body, Some(&forged), Some(&timestamp))
        .await;
    assert!(matches!(result, Err(AppError::Unauthorized)));

    assert_eq!(
        LedgerService::new(pool.clone())
            .balance(author_id)
            .await
            .unwrap(),
        0
    );
}
