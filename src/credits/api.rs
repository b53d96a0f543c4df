use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Extension, Path, Query},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::CreditSettings;
use crate::error::{AppError, AppResult};
use crate::extractor::AuthAuthor;

use super::webhook::{SIGNATURE_HEADER, TIMESTAMP_HEADER};
use super::{
    AdjustmentKind, AiEditAction, Author, AuthorService, BatchEntitlement, CommitEdits,
    CommittedEdits, CreateOrder, CreatedOrder, CreditLedgerEntry, CreditPackage, Entitlement,
    EntitlementService, HistoryEntry, LedgerService, NewPromotionCode, OrderService,
    PaymentGateway, PaymentOrder, PromotionCode, PromotionService, RedeemedPromotion,
    WebhookOutcome, WebhookReconciler,
};

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub author_id: i32,
    pub balance: i64,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RedeemRequest {
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    pub action: String,
}

#[derive(Debug, Deserialize)]
pub struct CheckBatchRequest {
    pub action: String,
    pub count: i64,
}

#[derive(Debug, Deserialize)]
pub struct CommitRequest {
    pub story_id: Uuid,
    pub action: String,
    pub items: Vec<Value>,
    #[serde(default)]
    pub quoted_credits: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateAuthorRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentKindRequest {
    AdminAdjustment,
    Refund,
}

#[derive(Debug, Deserialize)]
pub struct AdjustmentRequest {
    pub author_id: i32,
    pub amount: i64,
    #[serde(default = "default_adjustment_kind")]
    pub kind: AdjustmentKindRequest,
    pub reason: String,
}

fn default_adjustment_kind() -> AdjustmentKindRequest {
    AdjustmentKindRequest::AdminAdjustment
}

fn parse_action(raw: &str) -> AppResult<AiEditAction> {
    raw.parse::<AiEditAction>()
        .map_err(|err| AppError::validation(err.to_string()))
}

/// key: credits-api -> balance,history,packages
pub async fn get_balance(
    Extension(pool): Extension<PgPool>,
    author: AuthAuthor,
) -> AppResult<Json<BalanceResponse>> {
    let balance = LedgerService::new(pool).balance(author.author_id).await?;
    Ok(Json(BalanceResponse {
        author_id: author.author_id,
        balance,
    }))
}

pub async fn get_history(
    Extension(pool): Extension<PgPool>,
    Extension(settings): Extension<CreditSettings>,
    author: AuthAuthor,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<Vec<HistoryEntry>>> {
    let limit = settings.history_limit(query.limit);
    let history = LedgerService::new(pool)
        .history(author.author_id, limit)
        .await?;
    Ok(Json(history))
}

pub async fn list_packages(
    Extension(settings): Extension<CreditSettings>,
) -> Json<Vec<CreditPackage>> {
    Json(settings.catalog.packages().to_vec())
}

/// key: orders-api -> checkout creation, polling, cancel
pub async fn create_order(
    Extension(pool): Extension<PgPool>,
    Extension(gateway): Extension<Arc<dyn PaymentGateway>>,
    Extension(settings): Extension<CreditSettings>,
    author: AuthAuthor,
    Json(payload): Json<CreateOrder>,
) -> AppResult<(StatusCode, Json<CreatedOrder>)> {
    let order = OrderService::new(pool, gateway, settings.catalog)
        .create_order(author.author_id, payload)
        .await?;
    Ok((StatusCode::CREATED, Json(order)))
}

pub async fn get_order(
    Extension(pool): Extension<PgPool>,
    Extension(gateway): Extension<Arc<dyn PaymentGateway>>,
    Extension(settings): Extension<CreditSettings>,
    author: AuthAuthor,
    Path(order_id): Path<Uuid>,
) -> AppResult<Json<PaymentOrder>> {
    let order = OrderService::new(pool, gateway, settings.catalog)
        .order(author.author_id, order_id)
        .await?;
    Ok(Json(order))
}

pub async fn cancel_order(
    Extension(pool): Extension<PgPool>,
    Extension(gateway): Extension<Arc<dyn PaymentGateway>>,
    Extension(settings): Extension<CreditSettings>,
    author: AuthAuthor,
    Path(order_id): Path<Uuid>,
) -> AppResult<Json<PaymentOrder>> {
    let order = OrderService::new(pool, gateway, settings.catalog)
        .cancel(author.author_id, order_id)
        .await?;
    Ok(Json(order))
}

pub async fn redeem_promotion(
    Extension(pool): Extension<PgPool>,
    author: AuthAuthor,
    Json(payload): Json<RedeemRequest>,
) -> AppResult<Json<RedeemedPromotion>> {
    let redeemed = PromotionService::new(pool)
        .redeem(author.author_id, &payload.code)
        .await?;
    Ok(Json(redeemed))
}

/// key: ai-edits-api -> entitlement checks and confirmed debits
pub async fn check_edit(
    Extension(pool): Extension<PgPool>,
    Extension(settings): Extension<CreditSettings>,
    author: AuthAuthor,
    Json(payload): Json<CheckRequest>,
) -> AppResult<Json<Entitlement>> {
    let action = parse_action(&payload.action)?;
    let entitlement = EntitlementService::new(pool, settings.pricing, settings.max_batch_edits)
        .check(author.author_id, action)
        .await?;
    Ok(Json(entitlement))
}

pub async fn check_edit_batch(
    Extension(pool): Extension<PgPool>,
    Extension(settings): Extension<CreditSettings>,
    author: AuthAuthor,
    Json(payload): Json<CheckBatchRequest>,
) -> AppResult<Json<BatchEntitlement>> {
    let action = parse_action(&payload.action)?;
    let entitlement = EntitlementService::new(pool, settings.pricing, settings.max_batch_edits)
        .check_batch(author.author_id, action, payload.count)
        .await?;
    Ok(Json(entitlement))
}

pub async fn commit_edits(
    Extension(pool): Extension<PgPool>,
    Extension(settings): Extension<CreditSettings>,
    author: AuthAuthor,
    Json(payload): Json<CommitRequest>,
) -> AppResult<Json<CommittedEdits>> {
    let request = CommitEdits {
        story_id: payload.story_id,
        action: parse_action(&payload.action)?,
        items: payload.items,
        quoted_credits: payload.quoted_credits,
    };
    let committed = EntitlementService::new(pool, settings.pricing, settings.max_batch_edits)
        .commit_edits(author.author_id, request)
        .await?;
    Ok(Json(committed))
}

/// Signed gateway callback. The raw body is verified before it is parsed.
pub async fn payment_webhook(
    Extension(pool): Extension<PgPool>,
    Extension(settings): Extension<CreditSettings>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<WebhookOutcome>> {
    let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());
    let outcome = WebhookReconciler::new(pool, settings.webhook_secret, settings.webhook_tolerance)
        .handle(&body, header(SIGNATURE_HEADER), header(TIMESTAMP_HEADER))
        .await?;
    Ok(Json(outcome))
}

/// key: admin-api -> authors, adjustments, promotion lifecycle
pub async fn create_author(
    Extension(pool): Extension<PgPool>,
    Extension(settings): Extension<CreditSettings>,
    caller: AuthAuthor,
    Json(payload): Json<CreateAuthorRequest>,
) -> AppResult<(StatusCode, Json<Author>)> {
    caller.require_admin()?;
    let author = AuthorService::new(pool, settings.initial_grant)
        .create(&payload.email)
        .await?;
    Ok((StatusCode::CREATED, Json(author)))
}

pub async fn adjust_credits(
    Extension(pool): Extension<PgPool>,
    caller: AuthAuthor,
    Json(payload): Json<AdjustmentRequest>,
) -> AppResult<(StatusCode, Json<CreditLedgerEntry>)> {
    caller.require_admin()?;
    let kind = match payload.kind {
        AdjustmentKindRequest::AdminAdjustment => AdjustmentKind::AdminAdjustment,
        AdjustmentKindRequest::Refund => AdjustmentKind::Refund,
    };
    let entry = LedgerService::new(pool)
        .adjust(payload.author_id, payload.amount, kind, &payload.reason)
        .await?;
    tracing::info!(
        admin = caller.author_id,
        author_id = payload.author_id,
        amount = payload.amount,
        "manual credit adjustment"
    );
    Ok((StatusCode::CREATED, Json(entry)))
}

pub async fn create_promotion(
    Extension(pool): Extension<PgPool>,
    caller: AuthAuthor,
    Json(payload): Json<NewPromotionCode>,
) -> AppResult<(StatusCode, Json<PromotionCode>)> {
    caller.require_admin()?;
    let created = PromotionService::new(pool).create_code(payload).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn deactivate_promotion(
    Extension(pool): Extension<PgPool>,
    caller: AuthAuthor,
    Path(code): Path<String>,
) -> AppResult<Json<PromotionCode>> {
    caller.require_admin()?;
    let updated = PromotionService::new(pool).deactivate(&code).await?;
    Ok(Json(updated))
}
