use std::collections::{BTreeMap, HashMap};

use axum::{
    extract::State,
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    error::{AppError, AppResult},
    schemas::SelectedChoiceInput,
    services::pricing::{
        calculate_choice_price, calculate_price, calculate_total_price, load_pricing_config,
        round2, SelectedChoice, TravelerCounts,
    },
    state::AppState,
    tenancy::assert_org_member,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new().route("/pricing/quote", axum::routing::post(quote_price))
}

#[derive(Debug, Deserialize)]
struct QuoteInput {
    org_id: String,
    tour_id: String,
    channel_id: Option<String>,
    coupon_code: Option<String>,
    #[serde(default)]
    adults: i64,
    #[serde(default)]
    children: i64,
    #[serde(default)]
    infants: i64,
    #[serde(default)]
    selected_choices: Vec<SelectedChoiceInput>,
    #[serde(default)]
    manual_overrides: BTreeMap<String, f64>,
}

/// Recompute the full price breakdown for a prospective reservation. Pure
/// derivation — nothing is stored.
async fn quote_price(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<QuoteInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_member(&state, &user_id, &input.org_id).await?;
    let pool = db_pool(&state)?;

    if input.adults < 0 || input.children < 0 || input.infants < 0 {
        return Err(AppError::BadRequest(
            "Traveler counts must be non-negative.".to_string(),
        ));
    }

    let config = load_pricing_config(
        pool,
        &input.org_id,
        &input.tour_id,
        input.channel_id.as_deref(),
        input.coupon_code.as_deref(),
    )
    .await?;

    let calculation = calculate_price(config.base_prices(), &config);

    let mut choice_calculations = Map::new();
    for selection in &input.selected_choices {
        if let Some(choice_calc) = calculate_choice_price(&selection.choice_id, &config) {
            choice_calculations.insert(
                selection.choice_id.clone(),
                serde_json::to_value(choice_calc).unwrap_or(Value::Null),
            );
        }
    }

    let selections = input
        .selected_choices
        .iter()
        .map(|choice| SelectedChoice {
            option_id: choice.option_id.clone(),
            choice_id: choice.choice_id.clone(),
        })
        .collect::<Vec<_>>();
    let overrides: HashMap<String, f64> = input.manual_overrides.into_iter().collect();
    let counts = TravelerCounts {
        adults: input.adults,
        children: input.children,
        infants: input.infants,
    };
    let total_price = calculate_total_price(&config, counts, &selections, &overrides);

    let traveler_count = input.adults + input.children + input.infants;
    let balance_due = round2(config.not_included_price * traveler_count as f64);

    Ok(Json(json!({
        "pricing": calculation,
        "choices": Value::Object(choice_calculations),
        "total_price": total_price,
        "not_included_price": config.not_included_price,
        "balance_due": balance_due,
        "is_sale_available": config.is_sale_available,
    })))
}

fn db_pool(state: &AppState) -> AppResult<&sqlx::PgPool> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency(
            "Supabase database is not configured. Set SUPABASE_DB_URL or DATABASE_URL.".to_string(),
        )
    })
}
