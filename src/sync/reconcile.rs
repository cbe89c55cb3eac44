//! Stock/visibility reconciliation rules.
//!
//! Pure decisions over canonical state; the sync engine applies them
//! through the platform adapters. Keeping them side-effect free makes the
//! transition table directly testable.

use crate::models::{Platform, UploadResult, Visibility};
use crate::platforms::PlatformAdapter;
use crate::store::MasterDb;
use anyhow::Result;
use tracing::{info, warn};

/// What Phase 2 should do to one listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Amazon is out of stock and the listing is public
    Hide,
    /// Amazon replenished and the listing is hidden
    Show,
    /// Amazon replenished, listing public, but platform quantity sold
    /// through to 0
    RestoreQuantity,
}

/// Transition table for one listing given the canonical Amazon stock
/// flag.
pub fn visibility_actions(
    amazon_in_stock: bool,
    visibility: Visibility,
    platform_quantity: i64,
) -> Vec<ReconcileAction> {
    match (amazon_in_stock, visibility) {
        (false, Visibility::Public) => vec![ReconcileAction::Hide],
        (true, Visibility::Hidden) => vec![ReconcileAction::Show],
        (true, Visibility::Public) if platform_quantity == 0 => {
            vec![ReconcileAction::RestoreQuantity]
        }
        _ => Vec::new(),
    }
}

/// Per-platform pricing: markup over the Amazon JPY price, with an
/// optional JPY→USD conversion for dollar marketplaces.
#[derive(Debug, Clone, Copy)]
pub struct PricingConfig {
    pub markup_ratio: f64,
    pub usd_rate: Option<f64>,
}

impl PricingConfig {
    pub fn for_platform(platform: Platform) -> Self {
        match platform {
            Platform::Base => Self {
                markup_ratio: env_f64("BASE_MARKUP_RATIO", 1.3),
                usd_rate: None,
            },
            Platform::Ebay => Self {
                markup_ratio: env_f64("EBAY_MARKUP_RATIO", 1.35),
                usd_rate: Some(env_f64("JPY_USD_RATE", 150.0)),
            },
        }
    }

    /// Desired selling price from the canonical Amazon JPY price.
    pub fn desired_price(&self, amazon_price_jpy: i64) -> f64 {
        let marked_up = amazon_price_jpy as f64 * self.markup_ratio;
        match self.usd_rate {
            Some(rate) => (marked_up / rate * 100.0).round() / 100.0,
            None => marked_up.round(),
        }
    }
}

fn env_f64(var: &str, default: f64) -> f64 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Whether the platform-side price differs enough to warrant a write.
pub fn price_needs_update(current: Option<f64>, desired: f64) -> bool {
    match current {
        Some(current) => (current - desired).abs() > 0.005,
        None => true,
    }
}

#[derive(Debug, Clone, Default)]
pub struct ForceHideStats {
    pub total_listings: usize,
    pub updated_to_hidden: usize,
    pub errors: usize,
}

/// Targeted job: force the given ASINs hidden on one platform without
/// consulting live Amazon state (used after bulk cache fills).
pub async fn force_hide_asins(
    db: &MasterDb,
    adapter: &dyn PlatformAdapter,
    asins: &[String],
    account_id: &str,
    dry_run: bool,
) -> Result<ForceHideStats> {
    let mut stats = ForceHideStats::default();
    let platform = adapter.platform();

    for asin in asins {
        let Some(listing) = db.get_listing(asin, platform, account_id).await? else {
            continue;
        };
        stats.total_listings += 1;

        if listing.visibility != Visibility::Public {
            continue;
        }
        if dry_run {
            info!("[dry-run] would hide {asin} on {}", platform.as_str());
            stats.updated_to_hidden += 1;
            continue;
        }

        let result: UploadResult = adapter.update_visibility(&listing, Visibility::Hidden).await;
        if result.is_success() {
            db.update_listing_fields(listing.id, None, None, Some(Visibility::Hidden), None)
                .await?;
            stats.updated_to_hidden += 1;
        } else {
            warn!(
                "force-hide failed for {asin}: {}",
                result.message.as_deref().unwrap_or("unknown")
            );
            stats.errors += 1;
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_stock_public_listing_is_hidden() {
        let actions = visibility_actions(false, Visibility::Public, 1);
        assert_eq!(actions, vec![ReconcileAction::Hide]);
    }

    #[test]
    fn replenished_hidden_listing_is_shown() {
        let actions = visibility_actions(true, Visibility::Hidden, 0);
        assert_eq!(actions, vec![ReconcileAction::Show]);
    }

    #[test]
    fn sold_through_public_listing_restores_quantity() {
        let actions = visibility_actions(true, Visibility::Public, 0);
        assert_eq!(actions, vec![ReconcileAction::RestoreQuantity]);
    }

    #[test]
    fn steady_state_needs_no_action() {
        assert!(visibility_actions(true, Visibility::Public, 3).is_empty());
        assert!(visibility_actions(false, Visibility::Hidden, 0).is_empty());
    }

    #[test]
    fn jpy_price_is_rounded_markup() {
        let pricing = PricingConfig {
            markup_ratio: 1.3,
            usd_rate: None,
        };
        assert_eq!(pricing.desired_price(1000), 1300.0);
        assert_eq!(pricing.desired_price(999), 1299.0);
    }

    #[test]
    fn usd_price_converts_and_rounds_to_cents() {
        let pricing = PricingConfig {
            markup_ratio: 1.5,
            usd_rate: Some(150.0),
        };
        // 1000 * 1.5 / 150 = 10.00
        assert_eq!(pricing.desired_price(1000), 10.0);
        // 999 * 1.5 / 150 = 9.99
        assert_eq!(pricing.desired_price(999), 9.99);
    }

    #[test]
    fn price_update_threshold() {
        assert!(price_needs_update(None, 10.0));
        assert!(price_needs_update(Some(9.99), 10.0));
        assert!(!price_needs_update(Some(10.0), 10.0));
        assert!(!price_needs_update(Some(10.001), 10.0));
    }
}
