use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::PgPool;

use crate::error::{AppError, AppResult};
use crate::repository::table_service::{get_row, list_rows};

/// Default class ratios used when a tour has no explicit child/infant price.
pub const DEFAULT_CHILD_RATIO: f64 = 0.70;
pub const DEFAULT_INFANT_RATIO: f64 = 0.30;

/// A price carried per traveler class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassPrices {
    pub adult: f64,
    pub child: f64,
    pub infant: f64,
}

impl ClassPrices {
    pub fn add(self, other: ClassPrices) -> ClassPrices {
        ClassPrices {
            adult: self.adult + other.adult,
            child: self.child + other.child,
            infant: self.infant + other.infant,
        }
    }

    fn map(self, f: impl Fn(f64) -> f64) -> ClassPrices {
        ClassPrices {
            adult: f(self.adult),
            child: f(self.child),
            infant: f(self.infant),
        }
    }
}

/// Pricing input assembled from a tour, a selling channel and an optional
/// coupon. `not_included_price` is deliberately outside the markup/discount/
/// commission pipeline; it surfaces as a separate balance-due line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PricingConfig {
    pub adult_price: f64,
    pub child_price: f64,
    pub infant_price: f64,
    pub commission_percent: f64,
    pub markup_percent: f64,
    pub coupon_percent: f64,
    pub markup_amount: f64,
    pub is_sale_available: bool,
    pub not_included_price: f64,
    #[serde(default)]
    pub choice_pricing: HashMap<String, ClassPrices>,
}

impl PricingConfig {
    pub fn base_prices(&self) -> ClassPrices {
        ClassPrices {
            adult: self.adult_price,
            child: self.child_price,
            infant: self.infant_price,
        }
    }
}

/// Every stage of the price pipeline, per traveler class. Derived on each
/// input change; never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RealTimePriceCalculation {
    pub base_price: ClassPrices,
    pub markup_price: ClassPrices,
    pub discount_price: ClassPrices,
    pub final_price: ClassPrices,
    pub commission: ClassPrices,
    pub net_price: ClassPrices,
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// The four-step pipeline: markup (amount then percent) → coupon discount →
/// commission → net. Rounding to 2 decimals happens only at the final-price
/// stage. Inputs are not validated; callers pre-validate non-negativity.
pub fn calculate_price(base: ClassPrices, config: &PricingConfig) -> RealTimePriceCalculation {
    let markup_price =
        base.map(|price| price + config.markup_amount + price * config.markup_percent / 100.0);
    let discount_price = markup_price.map(|price| price * (1.0 - config.coupon_percent / 100.0));
    let final_price = discount_price.map(round2);
    let commission = final_price.map(|price| price * config.commission_percent / 100.0);
    let net_price = ClassPrices {
        adult: final_price.adult - commission.adult,
        child: final_price.child - commission.child,
        infant: final_price.infant - commission.infant,
    };

    RealTimePriceCalculation {
        base_price: base,
        markup_price,
        discount_price,
        final_price,
        commission,
        net_price,
    }
}

/// Price for one selectable choice: base plus the choice's per-class delta,
/// re-run through the pipeline. `None` iff the id has no entry in
/// `choice_pricing`, meaning "no choice-level override, product base only".
pub fn calculate_choice_price(
    choice_id: &str,
    config: &PricingConfig,
) -> Option<RealTimePriceCalculation> {
    let delta = config.choice_pricing.get(choice_id)?;
    Some(calculate_price(config.base_prices().add(*delta), config))
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TravelerCounts {
    pub adults: i64,
    pub children: i64,
    pub infants: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SelectedChoice {
    pub option_id: String,
    pub choice_id: String,
}

/// Reservation total. Each class price is the product base plus every
/// selected choice's delta plus any manual override keyed
/// `"{option_id}_{choice_id}_{class}"`. Overrides stack additively on top of
/// choice deltas; they do not replace them.
pub fn calculate_total_price(
    config: &PricingConfig,
    counts: TravelerCounts,
    selections: &[SelectedChoice],
    manual_overrides: &HashMap<String, f64>,
) -> f64 {
    let mut class_prices = config.base_prices();

    for selection in selections {
        if let Some(delta) = config.choice_pricing.get(&selection.choice_id) {
            class_prices = class_prices.add(*delta);
        }
        let key_base = format!("{}_{}", selection.option_id, selection.choice_id);
        class_prices.adult += override_for(manual_overrides, &key_base, "adult");
        class_prices.child += override_for(manual_overrides, &key_base, "child");
        class_prices.infant += override_for(manual_overrides, &key_base, "infant");
    }

    round2(
        counts.adults as f64 * class_prices.adult
            + counts.children as f64 * class_prices.child
            + counts.infants as f64 * class_prices.infant,
    )
}

fn override_for(overrides: &HashMap<String, f64>, key_base: &str, class: &str) -> f64 {
    overrides
        .get(&format!("{key_base}_{class}"))
        .copied()
        .unwrap_or(0.0)
}

/// Resolve per-class base prices for a tour. Explicit child/infant prices
/// win; missing ones derive from the adult price by the per-tour ratio.
pub fn derive_class_prices(
    adult_price: f64,
    child_price: Option<f64>,
    infant_price: Option<f64>,
    child_ratio: Option<f64>,
    infant_ratio: Option<f64>,
) -> ClassPrices {
    ClassPrices {
        adult: adult_price,
        child: child_price
            .unwrap_or_else(|| adult_price * child_ratio.unwrap_or(DEFAULT_CHILD_RATIO)),
        infant: infant_price
            .unwrap_or_else(|| adult_price * infant_ratio.unwrap_or(DEFAULT_INFANT_RATIO)),
    }
}

// ---------------------------------------------------------------------------
// Config assembly from tour / channel / coupon records
// ---------------------------------------------------------------------------

/// Build a PricingConfig for one tour: base prices from the tour record
/// (ratio-derived where class prices are missing), markup and commission
/// from the selling channel, discount from an active coupon, and the
/// per-choice deltas of every choice attached to the tour.
pub async fn load_pricing_config(
    pool: &PgPool,
    org_id: &str,
    tour_id: &str,
    channel_id: Option<&str>,
    coupon_code: Option<&str>,
) -> AppResult<PricingConfig> {
    let tour = get_row(pool, "tours", tour_id, "id").await?;
    if value_str(&tour, "organization_id") != org_id {
        return Err(AppError::NotFound("tours record not found.".to_string()));
    }

    let base = derive_class_prices(
        value_f64(&tour, "adult_price").unwrap_or(0.0),
        value_f64(&tour, "child_price"),
        value_f64(&tour, "infant_price"),
        value_f64(&tour, "child_ratio"),
        value_f64(&tour, "infant_ratio"),
    );

    let mut config = PricingConfig {
        adult_price: base.adult,
        child_price: base.child,
        infant_price: base.infant,
        not_included_price: value_f64(&tour, "not_included_price").unwrap_or(0.0),
        is_sale_available: tour
            .get("is_sale_available")
            .and_then(Value::as_bool)
            .unwrap_or(true),
        ..PricingConfig::default()
    };

    if let Some(channel_id) = channel_id.filter(|value| !value.trim().is_empty()) {
        let channel = get_row(pool, "channels", channel_id, "id").await?;
        if value_str(&channel, "organization_id") != org_id {
            return Err(AppError::NotFound("channels record not found.".to_string()));
        }
        config.commission_percent = value_f64(&channel, "commission_percent").unwrap_or(0.0);
        config.markup_percent = value_f64(&channel, "markup_percent").unwrap_or(0.0);
        config.markup_amount = value_f64(&channel, "markup_amount").unwrap_or(0.0);
    }

    if let Some(code) = coupon_code.filter(|value| !value.trim().is_empty()) {
        let mut filters = Map::new();
        filters.insert(
            "organization_id".to_string(),
            Value::String(org_id.to_string()),
        );
        filters.insert("code".to_string(), Value::String(code.trim().to_string()));
        filters.insert("is_active".to_string(), Value::Bool(true));
        let mut coupons = list_rows(pool, "coupons", Some(&filters), 1, 0, "created_at", false).await?;
        let Some(coupon) = coupons.pop() else {
            return Err(AppError::BadRequest(format!("Unknown coupon code '{code}'.")));
        };
        config.coupon_percent = value_f64(&coupon, "percent").unwrap_or(0.0);
    }

    let mut filters = Map::new();
    filters.insert("tour_id".to_string(), Value::String(tour_id.to_string()));
    let choices = list_rows(pool, "tour_choices", Some(&filters), 500, 0, "created_at", true).await?;
    for choice in &choices {
        let id = value_str(choice, "id");
        if id.is_empty() {
            continue;
        }
        config.choice_pricing.insert(
            id,
            ClassPrices {
                adult: value_f64(choice, "adult_price").unwrap_or(0.0),
                child: value_f64(choice, "child_price").unwrap_or(0.0),
                infant: value_f64(choice, "infant_price").unwrap_or(0.0),
            },
        );
    }

    Ok(config)
}

fn value_str(row: &Value, key: &str) -> String {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_default()
}

/// Numeric columns arrive as JSON numbers or as text depending on the
/// column's Postgres type; accept both.
pub fn value_f64(row: &Value, key: &str) -> Option<f64> {
    match row.as_object()?.get(key)? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{
        calculate_choice_price, calculate_price, calculate_total_price, derive_class_prices,
        round2, ClassPrices, PricingConfig, SelectedChoice, TravelerCounts,
    };

    fn config() -> PricingConfig {
        PricingConfig {
            adult_price: 100.0,
            child_price: 70.0,
            infant_price: 30.0,
            commission_percent: 15.0,
            markup_percent: 10.0,
            coupon_percent: 20.0,
            markup_amount: 5.0,
            is_sale_available: true,
            not_included_price: 0.0,
            choice_pricing: HashMap::new(),
        }
    }

    #[test]
    fn worked_example_matches_each_stage() {
        let calc = calculate_price(config().base_prices(), &config());
        assert_eq!(calc.markup_price.adult, 115.0); // 100 + 5 + 10
        assert_eq!(calc.discount_price.adult, 92.0); // 115 * 0.8
        assert_eq!(calc.final_price.adult, 92.0);
        assert_eq!(calc.commission.adult, 13.80);
        assert_eq!(round2(calc.net_price.adult), 78.20);
    }

    #[test]
    fn identity_pipeline_returns_base() {
        let config = PricingConfig {
            adult_price: 123.45,
            child_price: 67.89,
            infant_price: 10.0,
            ..PricingConfig::default()
        };
        let calc = calculate_price(config.base_prices(), &config);
        assert_eq!(calc.final_price, config.base_prices());
        assert_eq!(calc.net_price, config.base_prices());
    }

    #[test]
    fn net_plus_commission_equals_final() {
        for commission_percent in [0.0, 15.0, 33.3, 100.0] {
            let config = PricingConfig {
                commission_percent,
                ..config()
            };
            let calc = calculate_price(config.base_prices(), &config);
            let rebuilt = calc.net_price.adult + calc.commission.adult;
            assert!(
                (rebuilt - calc.final_price.adult).abs() < 1e-9,
                "commission {commission_percent}: {rebuilt} != {}",
                calc.final_price.adult
            );
        }
    }

    #[test]
    fn choice_price_is_none_only_for_unknown_ids() {
        let mut config = config();
        config.choice_pricing.insert(
            "lunch".to_string(),
            ClassPrices {
                adult: 20.0,
                child: 10.0,
                infant: 0.0,
            },
        );

        assert!(calculate_choice_price("sunset-cruise", &config).is_none());

        let calc = calculate_choice_price("lunch", &config).expect("known choice");
        let expected = calculate_price(
            ClassPrices {
                adult: 120.0,
                child: 80.0,
                infant: 30.0,
            },
            &config,
        );
        assert_eq!(calc, expected);
    }

    #[test]
    fn total_price_sums_classes_and_stacks_overrides() {
        let mut config = PricingConfig {
            adult_price: 100.0,
            child_price: 70.0,
            infant_price: 30.0,
            ..PricingConfig::default()
        };
        config.choice_pricing.insert(
            "boat".to_string(),
            ClassPrices {
                adult: 10.0,
                child: 5.0,
                infant: 0.0,
            },
        );

        let selections = vec![SelectedChoice {
            option_id: "transport".to_string(),
            choice_id: "boat".to_string(),
        }];
        let counts = TravelerCounts {
            adults: 2,
            children: 1,
            infants: 1,
        };

        // No overrides: 2*110 + 1*75 + 1*30 = 325
        assert_eq!(
            calculate_total_price(&config, counts, &selections, &HashMap::new()),
            325.0
        );

        // An adult override stacks on top of the choice delta, it does not
        // replace it: 2*(110+7) + 75 + 30 = 339.
        let mut overrides = HashMap::new();
        overrides.insert("transport_boat_adult".to_string(), 7.0);
        assert_eq!(
            calculate_total_price(&config, counts, &selections, &overrides),
            339.0
        );
    }

    #[test]
    fn null_choice_deltas_count_as_zero() {
        let config = PricingConfig {
            adult_price: 50.0,
            ..PricingConfig::default()
        };
        let selections = vec![SelectedChoice {
            option_id: "opt".to_string(),
            choice_id: "unpriced".to_string(),
        }];
        let counts = TravelerCounts {
            adults: 1,
            children: 0,
            infants: 0,
        };
        assert_eq!(
            calculate_total_price(&config, counts, &selections, &HashMap::new()),
            50.0
        );
    }

    #[test]
    fn class_ratios_derive_missing_prices() {
        let derived = derive_class_prices(100.0, None, None, None, None);
        assert_eq!(derived.child, 70.0);
        assert_eq!(derived.infant, 30.0);

        let explicit = derive_class_prices(100.0, Some(80.0), None, Some(0.5), Some(0.25));
        assert_eq!(explicit.child, 80.0);
        assert_eq!(explicit.infant, 25.0);
    }

    #[test]
    fn rounding_happens_only_at_final_price() {
        let config = PricingConfig {
            adult_price: 33.333,
            markup_percent: 10.0,
            coupon_percent: 5.0,
            ..PricingConfig::default()
        };
        let calc = calculate_price(config.base_prices(), &config);
        // Intermediate stages keep full precision.
        assert!((calc.markup_price.adult - 36.6663).abs() < 1e-9);
        assert!((calc.discount_price.adult - 34.832985).abs() < 1e-9);
        assert_eq!(calc.final_price.adult, 34.83);
    }
}
