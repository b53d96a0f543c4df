use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use super::pricing::BundleLine;

/// key: credit-ledger-models -> ledger,orders,promotions,ai-edits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "ledger_event_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LedgerEventType {
    Purchase,
    PromoRedeem,
    AiEditDebit,
    InitialGrant,
    AdminAdjustment,
    Refund,
}

impl LedgerEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEventType::Purchase => "purchase",
            LedgerEventType::PromoRedeem => "promo_redeem",
            LedgerEventType::AiEditDebit => "ai_edit_debit",
            LedgerEventType::InitialGrant => "initial_grant",
            LedgerEventType::AdminAdjustment => "admin_adjustment",
            LedgerEventType::Refund => "refund",
        }
    }
}

/// Immutable row of `credit_ledger_entries`. Balance is always derived from these.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CreditLedgerEntry {
    pub id: i64,
    pub author_id: i32,
    pub amount: i64,
    pub event_type: LedgerEventType,
    pub story_id: Option<Uuid>,
    pub purchase_order_id: Option<Uuid>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLedgerEntry {
    pub author_id: i32,
    pub amount: i64,
    pub event_type: LedgerEventType,
    pub story_id: Option<Uuid>,
    pub purchase_order_id: Option<Uuid>,
    pub note: Option<String>,
}

impl NewLedgerEntry {
    pub fn new(author_id: i32, amount: i64, event_type: LedgerEventType) -> Self {
        Self {
            author_id,
            amount,
            event_type,
            story_id: None,
            purchase_order_id: None,
            note: None,
        }
    }

    pub fn with_story(mut self, story_id: Uuid) -> Self {
        self.story_id = Some(story_id);
        self
    }

    pub fn with_order(mut self, order_id: Uuid) -> Self {
        self.purchase_order_id = Some(order_id);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Ledger entry annotated with the balance right after it was applied.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub entry: CreditLedgerEntry,
    pub balance_after: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "ai_edit_action", rename_all = "snake_case")]
#[serde(rename_all = "camelCase")]
pub enum AiEditAction {
    TextEdit,
    ImageEdit,
}

impl AiEditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AiEditAction::TextEdit => "textEdit",
            AiEditAction::ImageEdit => "imageEdit",
        }
    }
}

impl fmt::Display for AiEditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownAction(pub String);

impl fmt::Display for UnknownAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown edit action `{}`", self.0)
    }
}

impl FromStr for AiEditAction {
    type Err = UnknownAction;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "textEdit" | "text_edit" => Ok(AiEditAction::TextEdit),
            "imageEdit" | "image_edit" => Ok(AiEditAction::ImageEdit),
            other => Err(UnknownAction(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AiEditRecord {
    pub id: i64,
    pub author_id: i32,
    pub story_id: Uuid,
    pub action: AiEditAction,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_order_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Completed => "completed",
            OrderStatus::Failed => "failed",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }

    /// Only `pending` moves, and only forward into a terminal state.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        matches!(self, OrderStatus::Pending) && next.is_terminal()
    }
}

/// key: payment-order -> pending until the reconciler settles it
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PaymentOrder {
    pub id: Uuid,
    pub author_id: i32,
    pub idempotency_key: String,
    pub requested_packages: Json<Vec<BundleLine>>,
    pub total_credits: i64,
    pub amount_cents: i64,
    pub currency: String,
    pub provider_order_id: Option<String>,
    #[serde(skip_serializing)]
    pub checkout_token: Option<String>,
    pub status: OrderStatus,
    pub settled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PromotionCode {
    pub code: String,
    pub credits_granted: i64,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_redemptions: Option<i64>,
    pub redemption_count: i64,
    pub created_at: DateTime<Utc>,
}

impl PromotionCode {
    pub fn is_redeemable(&self, now: DateTime<Utc>) -> bool {
        if !self.active {
            return false;
        }
        if let Some(expires_at) = self.expires_at {
            if expires_at <= now {
                return false;
            }
        }
        if let Some(cap) = self.max_redemptions {
            if self.redemption_count >= cap {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Author {
    pub id: i32,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn edit_actions_parse_from_api_and_storage_spellings() {
        assert_eq!("textEdit".parse::<AiEditAction>(), Ok(AiEditAction::TextEdit));
        assert_eq!(
            "image_edit".parse::<AiEditAction>(),
            Ok(AiEditAction::ImageEdit)
        );
        assert_eq!(
            "videoEdit".parse::<AiEditAction>(),
            Err(UnknownAction("videoEdit".into()))
        );
    }

    #[test]
    fn terminal_order_states_are_sticky() {
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Completed));
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Failed));
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Cancelled));
        assert!(!OrderStatus::Pending.can_transition_to(OrderStatus::Pending));
        for terminal in [
            OrderStatus::Completed,
            OrderStatus::Failed,
            OrderStatus::Cancelled,
        ] {
            assert!(terminal.is_terminal());
            for next in [
                OrderStatus::Pending,
                OrderStatus::Completed,
                OrderStatus::Failed,
                OrderStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn promotion_redeemable_respects_expiry_and_cap() {
        let now = Utc::now();
        let mut promo = PromotionCode {
            code: "WELCOME10".into(),
            credits_granted: 10,
            active: true,
            expires_at: Some(now + Duration::days(1)),
            max_redemptions: Some(2),
            redemption_count: 1,
            created_at: now,
        };
        assert!(promo.is_redeemable(now));

        promo.redemption_count = 2;
        assert!(!promo.is_redeemable(now));

        promo.redemption_count = 0;
        promo.expires_at = Some(now - Duration::seconds(1));
        assert!(!promo.is_redeemable(now));

        promo.expires_at = None;
        promo.active = false;
        assert!(!promo.is_redeemable(now));
    }
}
