pub mod api;
pub mod authors;
pub mod entitlement;
pub mod gateway;
pub mod ledger;
pub mod models;
pub mod orders;
pub mod pricing;
pub mod promotions;
pub mod webhook;

pub use authors::AuthorService;
pub use entitlement::{
    evaluate, evaluate_batch, split_batch, BatchEntitlement, CommitEdits, CommittedEdits,
    EditBreakdown, Entitlement, EntitlementService,
};
pub use gateway::{
    CheckoutRequest, CheckoutSession, HttpPaymentGateway, PaymentGateway, StubPaymentGateway,
};
pub use ledger::{AdjustmentKind, LedgerService};
pub use models::{
    AiEditAction, AiEditRecord, Author, CreditLedgerEntry, HistoryEntry, LedgerEventType,
    NewLedgerEntry, OrderStatus, PaymentOrder, PromotionCode,
};
pub use orders::{CreateOrder, CreatedOrder, OrderService};
pub use pricing::{
    ActionPricing, CreditPackage, PackageCatalog, PackageRequest, PricingTable, ResolvedBundle,
};
pub use promotions::{NewPromotionCode, PromotionService, RedeemedPromotion};
pub use webhook::{PaymentEventKind, WebhookOutcome, WebhookReconciler};
