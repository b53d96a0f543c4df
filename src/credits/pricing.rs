use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{AppError, AppResult};

use super::models::AiEditAction;

/// Largest quantity of a single package accepted in one order line.
pub const MAX_PACKAGE_QUANTITY: i64 = 100;

/// Upper bound for a configured per-edit price.
pub const MAX_PRICE_CREDITS: i64 = 1_000_000;

/// key: ai-edit-pricing -> free-tier threshold and per-edit price per action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPricing {
    pub free_threshold: i64,
    pub price_credits: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingTable {
    pub text_edit: ActionPricing,
    pub image_edit: ActionPricing,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self {
            text_edit: ActionPricing {
                free_threshold: 5,
                price_credits: 3,
            },
            image_edit: ActionPricing {
                free_threshold: 1,
                price_credits: 5,
            },
        }
    }
}

impl PricingTable {
    pub fn for_action(&self, action: AiEditAction) -> ActionPricing {
        match action {
            AiEditAction::TextEdit => self.text_edit,
            AiEditAction::ImageEdit => self.image_edit,
        }
    }

    /// Accepts `{"textEdit": {...}, "imageEdit": {...}}` (snake_case keys too).
    /// Missing actions keep their default pricing.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let object = value
            .as_object()
            .ok_or_else(|| "pricing table must be a JSON object".to_string())?;
        let mut table = PricingTable::default();
        for (key, raw) in object {
            let action: AiEditAction = key.parse().map_err(|err| format!("{err}"))?;
            let pricing: ActionPricing = serde_json::from_value(raw.clone())
                .map_err(|err| format!("invalid pricing for `{key}`: {err}"))?;
            if pricing.free_threshold < 0 {
                return Err(format!("`{key}` free_threshold must be non-negative"));
            }
            if pricing.price_credits <= 0 || pricing.price_credits > MAX_PRICE_CREDITS {
                return Err(format!(
                    "`{key}` price_credits must be between 1 and {MAX_PRICE_CREDITS}"
                ));
            }
            match action {
                AiEditAction::TextEdit => table.text_edit = pricing,
                AiEditAction::ImageEdit => table.image_edit = pricing,
            }
        }
        Ok(table)
    }
}

/// key: credit-packages -> purchasable credit bundles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditPackage {
    pub id: String,
    pub name: String,
    pub credits: i64,
    pub price_cents: i64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRequest {
    pub package_id: String,
    #[serde(default = "default_quantity")]
    pub quantity: i64,
}

fn default_quantity() -> i64 {
    1
}

/// One resolved order line, persisted with the order so the grant never
/// depends on later catalog edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleLine {
    pub package_id: String,
    pub quantity: i64,
    pub credits: i64,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBundle {
    pub lines: Vec<BundleLine>,
    pub total_credits: i64,
    pub amount_cents: i64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageCatalog {
    packages: Vec<CreditPackage>,
}

impl Default for PackageCatalog {
    fn default() -> Self {
        Self {
            packages: vec![
                CreditPackage {
                    id: "starter".into(),
                    name: "Starter".into(),
                    credits: 50,
                    price_cents: 499,
                    currency: "USD".into(),
                },
                CreditPackage {
                    id: "writer".into(),
                    name: "Writer".into(),
                    credits: 120,
                    price_cents: 999,
                    currency: "USD".into(),
                },
                CreditPackage {
                    id: "studio".into(),
                    name: "Studio".into(),
                    credits: 300,
                    price_cents: 1999,
                    currency: "USD".into(),
                },
            ],
        }
    }
}

impl PackageCatalog {
    pub fn new(packages: Vec<CreditPackage>) -> Result<Self, String> {
        if packages.is_empty() {
            return Err("credit package catalog is empty".into());
        }
        let mut seen = HashSet::new();
        for package in &packages {
            if package.id.trim().is_empty() {
                return Err("credit package id must not be empty".into());
            }
            if !seen.insert(package.id.as_str()) {
                return Err(format!("duplicate credit package `{}`", package.id));
            }
            if package.credits <= 0 {
                return Err(format!("package `{}` must grant credits", package.id));
            }
            if package.price_cents < 0 {
                return Err(format!("package `{}` has a negative price", package.id));
            }
            if package.currency.len() != 3
                || !package.currency.chars().all(|c| c.is_ascii_uppercase())
            {
                return Err(format!(
                    "package `{}` currency `{}` is not an ISO code",
                    package.id, package.currency
                ));
            }
        }
        Ok(Self { packages })
    }

    pub fn from_value(value: &Value) -> Result<Self, String> {
        let packages: Vec<CreditPackage> = serde_json::from_value(value.clone())
            .map_err(|err| format!("invalid credit package catalog: {err}"))?;
        Self::new(packages)
    }

    pub fn default_value() -> Value {
        json!(PackageCatalog::default().packages)
    }

    pub fn packages(&self) -> &[CreditPackage] {
        &self.packages
    }

    pub fn find(&self, id: &str) -> Option<&CreditPackage> {
        self.packages.iter().find(|package| package.id == id)
    }

    /// Resolves requested packages into one priced bundle. Repeated package
    /// ids are merged into a single line.
    pub fn resolve(&self, requested: &[PackageRequest]) -> AppResult<ResolvedBundle> {
        if requested.is_empty() {
            return Err(AppError::validation("at least one credit package is required"));
        }

        let mut lines: Vec<BundleLine> = Vec::new();
        let mut currency: Option<&str> = None;
        for request in requested {
            if request.quantity < 1 || request.quantity > MAX_PACKAGE_QUANTITY {
                return Err(AppError::validation(format!(
                    "quantity for `{}` must be between 1 and {MAX_PACKAGE_QUANTITY}",
                    request.package_id
                )));
            }
            let package = self.find(request.package_id.trim()).ok_or_else(|| {
                AppError::validation(format!("unknown credit package `{}`", request.package_id))
            })?;
            match currency {
                None => currency = Some(package.currency.as_str()),
                Some(existing) if existing != package.currency => {
                    return Err(AppError::validation(
                        "credit packages in one order must share a currency",
                    ))
                }
                Some(_) => {}
            }

            let credits = package
                .credits
                .checked_mul(request.quantity)
                .ok_or_else(|| AppError::validation("credit total overflows"))?;
            let amount_cents = package
                .price_cents
                .checked_mul(request.quantity)
                .ok_or_else(|| AppError::validation("order amount overflows"))?;

            match lines.iter().position(|line| line.package_id == package.id) {
                Some(index) => {
                    let line = &mut lines[index];
                    line.quantity = line
                        .quantity
                        .checked_add(request.quantity)
                        .ok_or_else(|| AppError::validation("quantity overflows"))?;
                    line.credits = line
                        .credits
                        .checked_add(credits)
                        .ok_or_else(|| AppError::validation("credit total overflows"))?;
                    line.amount_cents = line
                        .amount_cents
                        .checked_add(amount_cents)
                        .ok_or_else(|| AppError::validation("order amount overflows"))?;
                }
                None => lines.push(BundleLine {
                    package_id: package.id.clone(),
                    quantity: request.quantity,
                    credits,
                    amount_cents,
                }),
            }
        }

        let total_credits = lines
            .iter()
            .try_fold(0_i64, |acc, line| acc.checked_add(line.credits))
            .ok_or_else(|| AppError::validation("credit total overflows"))?;
        let amount_cents = lines
            .iter()
            .try_fold(0_i64, |acc, line| acc.checked_add(line.amount_cents))
            .ok_or_else(|| AppError::validation("order amount overflows"))?;

        Ok(ResolvedBundle {
            lines,
            total_credits,
            amount_cents,
            currency: currency.unwrap_or_default().to_string(),
        })
    }
}
