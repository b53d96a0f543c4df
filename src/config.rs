use once_cell::sync::Lazy;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::credits::gateway::{HttpPaymentGateway, PaymentGateway, StubPaymentGateway};
use crate::credits::pricing::{PackageCatalog, PricingTable};
use crate::error::AppResult;

/// Secret used for JWT signing. Must be set via the `JWT_SECRET` env variable.
pub static JWT_SECRET: Lazy<String> =
    Lazy::new(|| std::env::var("JWT_SECRET").expect("JWT_SECRET must be set"));

/// Address the HTTP server should bind to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server should listen on. Defaults to `3000`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(3000)
});

/// When set to a truthy value, allows the application to continue running even if database
/// migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> =
    Lazy::new(|| read_flag_env("ALLOW_MIGRATION_FAILURE"));

/// key: webhook-config -> shared HMAC secret for inbound payment callbacks
pub static PAYMENT_WEBHOOK_SECRET: Lazy<Option<String>> = Lazy::new(|| {
    read_secret_env("PAYMENT_WEBHOOK_SECRET", "PAYMENT_WEBHOOK_SECRET_FILE")
});

/// key: webhook-config -> accepted clock skew for signed timestamps
pub static PAYMENT_WEBHOOK_TOLERANCE_SECS: Lazy<u64> =
    Lazy::new(|| read_number_env("PAYMENT_WEBHOOK_TOLERANCE_SECS", 300, |value| value > 0));

/// Gateway REST base URL. When unset the stub gateway issues local tokens.
pub static PAYMENT_GATEWAY_URL: Lazy<Option<String>> =
    Lazy::new(|| read_optional_env("PAYMENT_GATEWAY_URL"));

pub static PAYMENT_GATEWAY_API_KEY: Lazy<Option<String>> = Lazy::new(|| {
    read_secret_env("PAYMENT_GATEWAY_API_KEY", "PAYMENT_GATEWAY_API_KEY_FILE")
});

pub static PAYMENT_GATEWAY_TIMEOUT_SECS: Lazy<u64> =
    Lazy::new(|| read_number_env("PAYMENT_GATEWAY_TIMEOUT_SECS", 10, |value| value > 0));

/// key: entitlement-config -> free threshold and price per edit action
pub static AI_EDIT_PRICING: Lazy<PricingTable> = Lazy::new(|| {
    let raw = json_from_env("AI_EDIT_PRICING", Value::Null);
    if raw.is_null() {
        return PricingTable::default();
    }
    PricingTable::from_value(&raw)
        .unwrap_or_else(|err| panic!("invalid AI_EDIT_PRICING: {err}"))
});

/// key: orders-config -> purchasable credit packages
pub static CREDIT_PACKAGES: Lazy<PackageCatalog> = Lazy::new(|| {
    let raw = json_from_env("CREDIT_PACKAGES", PackageCatalog::default_value());
    PackageCatalog::from_value(&raw).unwrap_or_else(|err| panic!("invalid CREDIT_PACKAGES: {err}"))
});

/// Credits granted to every newly created author. Defaults to `0`.
pub static INITIAL_CREDIT_GRANT: Lazy<i64> =
    Lazy::new(|| read_number_env("INITIAL_CREDIT_GRANT", 0, |value| value >= 0));

/// Upper bound on items in one batch check or commit.
pub static MAX_BATCH_EDITS: Lazy<i64> =
    Lazy::new(|| read_number_env("MAX_BATCH_EDITS", 200, |value| value > 0));

pub static HISTORY_DEFAULT_LIMIT: Lazy<i64> =
    Lazy::new(|| read_number_env("HISTORY_DEFAULT_LIMIT", 20, |value| value > 0));

pub static HISTORY_MAX_LIMIT: Lazy<i64> =
    Lazy::new(|| read_number_env("HISTORY_MAX_LIMIT", 100, |value| value > 0));

/// Runtime knobs handed to request handlers as an extension.
#[derive(Debug, Clone)]
pub struct CreditSettings {
    pub pricing: PricingTable,
    pub catalog: PackageCatalog,
    pub webhook_secret: Option<String>,
    pub webhook_tolerance: Duration,
    pub initial_grant: i64,
    pub max_batch_edits: i64,
    pub history_default_limit: i64,
    pub history_max_limit: i64,
}

impl Default for CreditSettings {
    fn default() -> Self {
        Self {
            pricing: PricingTable::default(),
            catalog: PackageCatalog::default(),
            webhook_secret: None,
            webhook_tolerance: Duration::from_secs(300),
            initial_grant: 0,
            max_batch_edits: 200,
            history_default_limit: 20,
            history_max_limit: 100,
        }
    }
}

impl CreditSettings {
    pub fn from_env() -> Self {
        Self {
            pricing: *AI_EDIT_PRICING,
            catalog: CREDIT_PACKAGES.clone(),
            webhook_secret: PAYMENT_WEBHOOK_SECRET.clone(),
            webhook_tolerance: Duration::from_secs(*PAYMENT_WEBHOOK_TOLERANCE_SECS),
            initial_grant: *INITIAL_CREDIT_GRANT,
            max_batch_edits: *MAX_BATCH_EDITS,
            history_default_limit: *HISTORY_DEFAULT_LIMIT,
            history_max_limit: (*HISTORY_MAX_LIMIT).max(*HISTORY_DEFAULT_LIMIT),
        }
    }

    /// Clamps a requested page size into `1..=history_max_limit`.
    pub fn history_limit(&self, requested: Option<i64>) -> i64 {
        requested
            .unwrap_or(self.history_default_limit)
            .clamp(1, self.history_max_limit)
    }
}

pub fn payment_gateway_from_env() -> AppResult<Arc<dyn PaymentGateway>> {
    match PAYMENT_GATEWAY_URL.as_deref() {
        Some(url) => {
            let gateway = HttpPaymentGateway::new(
                url,
                PAYMENT_GATEWAY_API_KEY.clone(),
                Duration::from_secs(*PAYMENT_GATEWAY_TIMEOUT_SECS),
            )?;
            tracing::info!(url, "using HTTP payment gateway");
            Ok(Arc::new(gateway))
        }
        None => {
            tracing::warn!("PAYMENT_GATEWAY_URL not set; using stub payment gateway");
            Ok(Arc::new(StubPaymentGateway))
        }
    }
}

fn read_optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_flag_env(key: &str) -> bool {
    read_optional_env(key)
        .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn read_number_env<T>(key: &str, default: T, accept: impl Fn(T) -> bool) -> T
where
    T: std::str::FromStr + Copy,
{
    read_optional_env(key)
        .and_then(|value| value.parse::<T>().ok())
        .filter(|value| accept(*value))
        .unwrap_or(default)
}

fn read_secret_env(value_key: &str, file_key: &str) -> Option<String> {
    if let Some(path) = read_optional_env(file_key) {
        match fs::read_to_string(&path) {
            Ok(contents) => {
                let trimmed = contents.trim().to_string();
                if !trimmed.is_empty() {
                    return Some(trimmed);
                }
            }
            Err(err) => panic!("failed to read {file_key} from {path}: {err}"),
        }
    }

    read_optional_env(value_key)
}

fn json_from_env(var: &str, default_value: Value) -> Value {
    match std::env::var(var) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                default_value
            } else {
                serde_json::from_str(trimmed)
                    .unwrap_or_else(|err| panic!("failed to parse {var} as JSON: {err}"))
            }
        }
        Err(_) => default_value,
    }
}
