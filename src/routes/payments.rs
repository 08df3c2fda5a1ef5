use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{create_row, delete_row, get_row, list_rows, update_row},
    schemas::{
        clamp_limit, remove_nulls, serialize_to_map, validate_input, CreatePaymentMethodInput,
        PaymentMethodPath, PaymentMethodsQuery, UpdatePaymentMethodInput,
    },
    services::{
        audit::write_audit_log,
        payments::{create_stripe_checkout_session, to_minor_units, verify_stripe_signature},
    },
    state::AppState,
    tenancy::{assert_org_member, assert_org_role},
};

const PAYMENT_EDIT_ROLES: &[&str] = &["owner_admin", "operator", "accountant"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/payment-methods",
            axum::routing::get(list_payment_methods).post(create_payment_method),
        )
        .route(
            "/payment-methods/{payment_method_id}",
            axum::routing::patch(update_payment_method).delete(delete_payment_method),
        )
        .route("/payments/checkout", axum::routing::post(create_checkout))
        .route("/payments/webhook", axum::routing::post(stripe_webhook))
}

// ========== Payment methods ==========

async fn list_payment_methods(
    State(state): State<AppState>,
    Query(query): Query<PaymentMethodsQuery>,
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
    if let Some(is_active) = query.is_active {
        filters.insert("is_active".to_string(), Value::Bool(is_active));
    }

    let rows = list_rows(
        pool,
        "payment_methods",
        Some(&filters),
        clamp_limit(query.limit),
        0,
        "created_at",
        false,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

async fn create_payment_method(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreatePaymentMethodInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_role(&state, &user_id, &payload.organization_id, PAYMENT_EDIT_ROLES).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let record = remove_nulls(serialize_to_map(&payload));
    let created = create_row(pool, "payment_methods", &record).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_payment_method(
    State(state): State<AppState>,
    Path(path): Path<PaymentMethodPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdatePaymentMethodInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "payment_methods", &path.payment_method_id, "id").await?;
    let org_id = value_str(&record, "organization_id");
    assert_org_role(&state, &user_id, &org_id, PAYMENT_EDIT_ROLES).await?;

    let patch = remove_nulls(serialize_to_map(&payload));
    if patch.is_empty() {
        return Ok(Json(record));
    }
    let updated = update_row(pool, "payment_methods", &path.payment_method_id, &patch, "id").await?;
    Ok(Json(updated))
}

async fn delete_payment_method(
    State(state): State<AppState>,
    Path(path): Path<PaymentMethodPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "payment_methods", &path.payment_method_id, "id").await?;
    let org_id = value_str(&record, "organization_id");
    assert_org_role(&state, &user_id, &org_id, PAYMENT_EDIT_ROLES).await?;
    let deleted = delete_row(pool, "payment_methods", &path.payment_method_id, "id").await?;
    Ok(Json(deleted))
}

// ========== Stripe checkout ==========

#[derive(Debug, Deserialize)]
struct CheckoutInput {
    org_id: String,
    reservation_id: String,
}

/// Create a Stripe Checkout session for a reservation's total. Amount
/// conversion to minor units and the minimum-charge floor live in the
/// payments service, not the pricing core.
async fn create_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<CheckoutInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_role(&state, &user_id, &input.org_id, PAYMENT_EDIT_ROLES).await?;
    let pool = db_pool(&state)?;

    let reservation = get_row(pool, "reservations", &input.reservation_id, "id").await?;
    if value_str(&reservation, "organization_id") != input.org_id {
        return Err(AppError::NotFound(
            "reservations record not found.".to_string(),
        ));
    }
    if value_str(&reservation, "payment_status") == "paid" {
        return Err(AppError::Conflict(
            "Reservation is already paid.".to_string(),
        ));
    }

    let amount = reservation
        .get("total_price")
        .and_then(numeric_value)
        .ok_or_else(|| AppError::BadRequest("Reservation has no total price.".to_string()))?;
    let currency = {
        let stored = value_str(&reservation, "currency");
        if stored.is_empty() {
            "USD".to_string()
        } else {
            stored
        }
    };

    let tour_name = match get_row(pool, "tours", &value_str(&reservation, "tour_id"), "id").await {
        Ok(tour) => value_str(&tour, "name"),
        Err(_) => String::new(),
    };
    let reference_code = input
        .reservation_id
        .get(..8)
        .unwrap_or(&input.reservation_id)
        .to_string();

    let session = create_stripe_checkout_session(
        &state.http_client,
        &state.config,
        amount,
        &currency,
        &reference_code,
        &value_str(&reservation, "guest_name"),
        &tour_name,
    )
    .await
    .map_err(AppError::Dependency)?;

    let session_id = value_str(&session, "id");
    let checkout_url = value_str(&session, "url");

    let mut patch = Map::new();
    patch.insert(
        "stripe_session_id".to_string(),
        Value::String(session_id.clone()),
    );
    patch.insert(
        "payment_status".to_string(),
        Value::String("checkout_pending".to_string()),
    );
    let _ = update_row(pool, "reservations", &input.reservation_id, &patch, "id").await;

    write_audit_log(
        state.db_pool.as_ref(),
        Some(&input.org_id),
        Some(&user_id),
        "checkout",
        "reservations",
        Some(&input.reservation_id),
        None,
        Some(json!({ "session_id": session_id, "amount": amount, "currency": currency })),
    )
    .await;

    Ok(Json(json!({
        "session_id": session_id,
        "checkout_url": checkout_url,
        "amount_minor": to_minor_units(amount, &currency),
        "currency": currency,
    })))
}

/// Stripe webhook: signature-verified, unauthenticated. Marks reservations
/// paid on `checkout.session.completed`.
async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<impl IntoResponse> {
    let secret = state
        .config
        .stripe_webhook_secret
        .as_deref()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            AppError::Dependency("STRIPE_WEBHOOK_SECRET not configured.".to_string())
        })?;

    let signature = headers
        .get("stripe-signature")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let payload = std::str::from_utf8(&body)
        .map_err(|_| AppError::BadRequest("Webhook body is not valid UTF-8.".to_string()))?;

    if !verify_stripe_signature(payload, signature, secret) {
        return Err(AppError::Unauthorized(
            "Invalid webhook signature.".to_string(),
        ));
    }

    let event: Value = serde_json::from_str(payload)
        .map_err(|_| AppError::BadRequest("Webhook body is not valid JSON.".to_string()))?;
    let event_type = value_str(&event, "type");

    if event_type == "checkout.session.completed" {
        let session_id = event
            .pointer("/data/object/id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !session_id.is_empty() {
            let pool = db_pool(&state)?;
            let result = sqlx::query(
                "UPDATE reservations
                 SET payment_status = 'paid', paid_at = now()
                 WHERE stripe_session_id = $1",
            )
            .bind(session_id)
            .execute(pool)
            .await
            .map_err(|error| {
                tracing::error!(error = %error, "Database query failed");
                AppError::Dependency("Database operation failed.".to_string())
            })?;
            tracing::info!(
                session_id,
                updated = result.rows_affected(),
                "Checkout session completed"
            );
        }
    }

    Ok((StatusCode::OK, Json(json!({ "received": true }))))
}

// ========== Helpers ==========

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

fn numeric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}
