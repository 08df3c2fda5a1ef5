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
        clamp_limit, remove_nulls, serialize_to_map, validate_input, ChannelPath, ChannelsQuery,
        CouponPath, CouponsQuery, CreateChannelInput, CreateCouponInput, UpdateChannelInput,
        UpdateCouponInput,
    },
    services::audit::write_audit_log,
    state::AppState,
    tenancy::{assert_org_member, assert_org_role},
};

const CHANNEL_EDIT_ROLES: &[&str] = &["owner_admin", "operator", "accountant"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/channels",
            axum::routing::get(list_channels).post(create_channel),
        )
        .route(
            "/channels/{channel_id}",
            axum::routing::get(get_channel)
                .patch(update_channel)
                .delete(delete_channel),
        )
        .route(
            "/coupons",
            axum::routing::get(list_coupons).post(create_coupon),
        )
        .route(
            "/coupons/{coupon_id}",
            axum::routing::patch(update_coupon).delete(delete_coupon),
        )
}

// ========== Channels ==========

async fn list_channels(
    State(state): State<AppState>,
    Query(query): Query<ChannelsQuery>,
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
        "channels",
        Some(&filters),
        clamp_limit(query.limit),
        0,
        "created_at",
        false,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

async fn create_channel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateChannelInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_role(&state, &user_id, &payload.organization_id, CHANNEL_EDIT_ROLES).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let record = remove_nulls(serialize_to_map(&payload));
    let created = create_row(pool, "channels", &record).await?;
    let channel_id = value_str(&created, "id");
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&payload.organization_id),
        Some(&user_id),
        "create",
        "channels",
        Some(&channel_id),
        None,
        Some(created.clone()),
    )
    .await;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_channel(
    State(state): State<AppState>,
    Path(path): Path<ChannelPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "channels", &path.channel_id, "id").await?;
    assert_org_member(&state, &user_id, &value_str(&record, "organization_id")).await?;
    Ok(Json(record))
}

async fn update_channel(
    State(state): State<AppState>,
    Path(path): Path<ChannelPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateChannelInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "channels", &path.channel_id, "id").await?;
    let org_id = value_str(&record, "organization_id");
    assert_org_role(&state, &user_id, &org_id, CHANNEL_EDIT_ROLES).await?;

    if let Some(percent) = payload.commission_percent {
        ensure_percent("commission_percent", percent)?;
    }
    if let Some(percent) = payload.markup_percent {
        ensure_percent("markup_percent", percent)?;
    }

    let patch = remove_nulls(serialize_to_map(&payload));
    if patch.is_empty() {
        return Ok(Json(record));
    }
    let updated = update_row(pool, "channels", &path.channel_id, &patch, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&org_id),
        Some(&user_id),
        "update",
        "channels",
        Some(&path.channel_id),
        Some(record),
        Some(updated.clone()),
    )
    .await;
    Ok(Json(updated))
}

async fn delete_channel(
    State(state): State<AppState>,
    Path(path): Path<ChannelPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "channels", &path.channel_id, "id").await?;
    let org_id = value_str(&record, "organization_id");
    assert_org_role(&state, &user_id, &org_id, &["owner_admin"]).await?;
    let deleted = delete_row(pool, "channels", &path.channel_id, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&org_id),
        Some(&user_id),
        "delete",
        "channels",
        Some(&path.channel_id),
        Some(deleted.clone()),
        None,
    )
    .await;
    Ok(Json(deleted))
}

// ========== Coupons ==========

async fn list_coupons(
    State(state): State<AppState>,
    Query(query): Query<CouponsQuery>,
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
        "coupons",
        Some(&filters),
        clamp_limit(query.limit),
        0,
        "created_at",
        false,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

async fn create_coupon(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateCouponInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_role(&state, &user_id, &payload.organization_id, CHANNEL_EDIT_ROLES).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let record = remove_nulls(serialize_to_map(&payload));
    let created = create_row(pool, "coupons", &record).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_coupon(
    State(state): State<AppState>,
    Path(path): Path<CouponPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateCouponInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "coupons", &path.coupon_id, "id").await?;
    let org_id = value_str(&record, "organization_id");
    assert_org_role(&state, &user_id, &org_id, CHANNEL_EDIT_ROLES).await?;

    if let Some(percent) = payload.percent {
        ensure_percent("percent", percent)?;
    }

    let patch = remove_nulls(serialize_to_map(&payload));
    if patch.is_empty() {
        return Ok(Json(record));
    }
    let updated = update_row(pool, "coupons", &path.coupon_id, &patch, "id").await?;
    Ok(Json(updated))
}

async fn delete_coupon(
    State(state): State<AppState>,
    Path(path): Path<CouponPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "coupons", &path.coupon_id, "id").await?;
    let org_id = value_str(&record, "organization_id");
    assert_org_role(&state, &user_id, &org_id, CHANNEL_EDIT_ROLES).await?;
    let deleted = delete_row(pool, "coupons", &path.coupon_id, "id").await?;
    Ok(Json(deleted))
}

// ========== Helpers ==========

fn ensure_percent(field: &str, value: f64) -> AppResult<()> {
    if !(0.0..=100.0).contains(&value) {
        return Err(AppError::BadRequest(format!(
            "{field} must be between 0 and 100."
        )));
    }
    Ok(())
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
