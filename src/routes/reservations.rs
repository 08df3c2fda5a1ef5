use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{create_row, delete_row, get_row, list_rows, update_row},
    schemas::{
        clamp_limit, remove_nulls, serialize_to_map, validate_input, CreateReservationInput,
        ReservationPath, ReservationsQuery, UpdateReservationInput,
    },
    services::{
        audit::write_audit_log,
        pricing::{calculate_total_price, load_pricing_config, SelectedChoice, TravelerCounts},
    },
    state::AppState,
    tenancy::{assert_org_member, assert_org_role},
};

const RESERVATION_EDIT_ROLES: &[&str] = &["owner_admin", "operator"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/reservations",
            axum::routing::get(list_reservations).post(create_reservation),
        )
        .route(
            "/reservations/{reservation_id}",
            axum::routing::get(get_reservation)
                .patch(update_reservation)
                .delete(delete_reservation),
        )
}

async fn list_reservations(
    State(state): State<AppState>,
    Query(query): Query<ReservationsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_member(&state, &user_id, &query.org_id).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    filters.insert(
        "organization_id".to_string(),
        Value::String(query.org_id.clone()),
    );
    if let Some(tour_id) = non_empty_opt(query.tour_id.as_deref()) {
        filters.insert("tour_id".to_string(), Value::String(tour_id));
    }
    if let Some(status) = non_empty_opt(query.status.as_deref()) {
        filters.insert("status".to_string(), Value::String(status));
    }
    if let Some(from) = non_empty_opt(query.tour_date__gte.as_deref()) {
        filters.insert("tour_date__gte".to_string(), Value::String(from));
    }
    if let Some(to) = non_empty_opt(query.tour_date__lte.as_deref()) {
        filters.insert("tour_date__lte".to_string(), Value::String(to));
    }

    let rows = list_rows(
        pool,
        "reservations",
        Some(&filters),
        clamp_limit(query.limit),
        0,
        "tour_date",
        false,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

/// Create a reservation. The total price is computed server-side from the
/// tour/channel/coupon configuration plus the selected choices and any
/// per-request manual overrides; the overrides themselves are not stored.
async fn create_reservation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateReservationInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_role(
        &state,
        &user_id,
        &payload.organization_id,
        RESERVATION_EDIT_ROLES,
    )
    .await?;
    validate_input(&payload)?;
    if payload.adults < 0 || payload.children < 0 || payload.infants < 0 {
        return Err(AppError::BadRequest(
            "Traveler counts must be non-negative.".to_string(),
        ));
    }
    let pool = db_pool(&state)?;

    let config = load_pricing_config(
        pool,
        &payload.organization_id,
        &payload.tour_id,
        payload.channel_id.as_deref(),
        payload.coupon_code.as_deref(),
    )
    .await?;

    let selections = payload
        .selected_choices
        .iter()
        .map(|choice| SelectedChoice {
            option_id: choice.option_id.clone(),
            choice_id: choice.choice_id.clone(),
        })
        .collect::<Vec<_>>();
    let overrides: HashMap<String, f64> = payload.manual_overrides.clone().into_iter().collect();
    let total_price = calculate_total_price(
        &config,
        TravelerCounts {
            adults: payload.adults,
            children: payload.children,
            infants: payload.infants,
        },
        &selections,
        &overrides,
    );

    let mut record = remove_nulls(serialize_to_map(&payload));
    record.remove("selected_choices");
    record.remove("manual_overrides");
    record.insert("total_price".to_string(), json!(total_price));
    record.insert(
        "payment_status".to_string(),
        Value::String("unpaid".to_string()),
    );
    record.insert(
        "created_by_user_id".to_string(),
        Value::String(user_id.clone()),
    );

    let created = create_row(pool, "reservations", &record).await?;
    let reservation_id = value_str(&created, "id");

    let mut created_choices = Vec::new();
    for selection in &payload.selected_choices {
        let mut choice_record = Map::new();
        choice_record.insert(
            "organization_id".to_string(),
            Value::String(payload.organization_id.clone()),
        );
        choice_record.insert(
            "reservation_id".to_string(),
            Value::String(reservation_id.clone()),
        );
        choice_record.insert(
            "tour_option_id".to_string(),
            Value::String(selection.option_id.clone()),
        );
        choice_record.insert(
            "tour_choice_id".to_string(),
            Value::String(selection.choice_id.clone()),
        );
        let created_choice = create_row(pool, "reservation_choices", &choice_record).await?;
        created_choices.push(created_choice);
    }

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&payload.organization_id),
        Some(&user_id),
        "create",
        "reservations",
        Some(&reservation_id),
        None,
        Some(json!({
            "reservation": created,
            "choices": created_choices,
        })),
    )
    .await;

    let mut response = created;
    if let Some(obj) = response.as_object_mut() {
        obj.insert("choices".to_string(), Value::Array(created_choices));
    }
    Ok((StatusCode::CREATED, Json(response)))
}

async fn get_reservation(
    State(state): State<AppState>,
    Path(path): Path<ReservationPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let mut record = get_row(pool, "reservations", &path.reservation_id, "id").await?;
    let org_id = value_str(&record, "organization_id");
    assert_org_member(&state, &user_id, &org_id).await?;

    let choices = load_reservation_choices(pool, &path.reservation_id).await?;
    if let Some(obj) = record.as_object_mut() {
        obj.insert("choices".to_string(), Value::Array(choices));
    }
    Ok(Json(record))
}

async fn update_reservation(
    State(state): State<AppState>,
    Path(path): Path<ReservationPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateReservationInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "reservations", &path.reservation_id, "id").await?;
    let org_id = value_str(&record, "organization_id");
    assert_org_role(&state, &user_id, &org_id, RESERVATION_EDIT_ROLES).await?;

    let mut patch = remove_nulls(serialize_to_map(&payload));
    if patch.is_empty() {
        return Ok(Json(record));
    }

    // Reprice when anything feeding the total changed. Stored choices are
    // kept; ad-hoc overrides only exist at creation time.
    let reprice = ["adults", "children", "infants", "channel_id", "coupon_code"]
        .iter()
        .any(|field| patch.contains_key(*field));
    if reprice {
        let merged = |key: &str| -> Value {
            patch
                .get(key)
                .cloned()
                .or_else(|| record.get(key).cloned())
                .unwrap_or(Value::Null)
        };
        let tour_id = value_str(&record, "tour_id");
        let channel_id = as_non_empty_string(&merged("channel_id"));
        let coupon_code = as_non_empty_string(&merged("coupon_code"));
        let config = load_pricing_config(
            pool,
            &org_id,
            &tour_id,
            channel_id.as_deref(),
            coupon_code.as_deref(),
        )
        .await?;

        let choices = load_reservation_choices(pool, &path.reservation_id).await?;
        let selections = choices
            .iter()
            .map(|choice| SelectedChoice {
                option_id: value_str(choice, "tour_option_id"),
                choice_id: value_str(choice, "tour_choice_id"),
            })
            .collect::<Vec<_>>();

        let total_price = calculate_total_price(
            &config,
            TravelerCounts {
                adults: merged("adults").as_i64().unwrap_or(0),
                children: merged("children").as_i64().unwrap_or(0),
                infants: merged("infants").as_i64().unwrap_or(0),
            },
            &selections,
            &HashMap::new(),
        );
        patch.insert("total_price".to_string(), json!(total_price));
    }

    let updated = update_row(pool, "reservations", &path.reservation_id, &patch, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&org_id),
        Some(&user_id),
        "update",
        "reservations",
        Some(&path.reservation_id),
        Some(record),
        Some(updated.clone()),
    )
    .await;
    Ok(Json(updated))
}

async fn delete_reservation(
    State(state): State<AppState>,
    Path(path): Path<ReservationPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "reservations", &path.reservation_id, "id").await?;
    let org_id = value_str(&record, "organization_id");
    assert_org_role(&state, &user_id, &org_id, RESERVATION_EDIT_ROLES).await?;

    sqlx::query("DELETE FROM reservation_choices WHERE reservation_id = $1::uuid")
        .bind(&path.reservation_id)
        .execute(pool)
        .await
        .map_err(|error| {
            tracing::error!(error = %error, "Database query failed");
            AppError::Dependency("Database operation failed.".to_string())
        })?;

    let deleted = delete_row(pool, "reservations", &path.reservation_id, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&org_id),
        Some(&user_id),
        "delete",
        "reservations",
        Some(&path.reservation_id),
        Some(deleted.clone()),
        None,
    )
    .await;
    Ok(Json(deleted))
}

// ========== Helpers ==========

async fn load_reservation_choices(
    pool: &sqlx::PgPool,
    reservation_id: &str,
) -> AppResult<Vec<Value>> {
    let mut filters = Map::new();
    filters.insert(
        "reservation_id".to_string(),
        Value::String(reservation_id.to_string()),
    );
    list_rows(
        pool,
        "reservation_choices",
        Some(&filters),
        200,
        0,
        "created_at",
        true,
    )
    .await
}

fn db_pool(state: &AppState) -> AppResult<&sqlx::PgPool> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency(
            "Supabase database is not configured. Set SUPABASE_DB_URL or DATABASE_URL.".to_string(),
        )
    })
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

fn non_empty_opt(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToOwned::to_owned)
}

fn as_non_empty_string(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToOwned::to_owned)
}
