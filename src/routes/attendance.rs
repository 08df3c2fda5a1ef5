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
        clamp_limit, remove_nulls, serialize_to_map, validate_input, AttendancePath,
        AttendanceQuery, CreateAttendanceInput, UpdateAttendanceInput,
    },
    state::AppState,
    tenancy::{assert_org_member, assert_org_role},
};

const ATTENDANCE_EDIT_ROLES: &[&str] = &["owner_admin", "operator"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/attendance",
            axum::routing::get(list_attendance).post(create_attendance),
        )
        .route(
            "/attendance/{record_id}",
            axum::routing::patch(update_attendance).delete(delete_attendance),
        )
}

async fn list_attendance(
    State(state): State<AppState>,
    Query(query): Query<AttendanceQuery>,
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
    if let Some(email) = query
        .member_email
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        filters.insert("member_email".to_string(), Value::String(email.to_string()));
    }
    if let Some(from) = query
        .work_date__gte
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        filters.insert("work_date__gte".to_string(), Value::String(from.to_string()));
    }
    if let Some(to) = query
        .work_date__lte
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        filters.insert("work_date__lte".to_string(), Value::String(to.to_string()));
    }

    let rows = list_rows(
        pool,
        "attendance_records",
        Some(&filters),
        clamp_limit(query.limit),
        0,
        "work_date",
        false,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

async fn create_attendance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateAttendanceInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_role(
        &state,
        &user_id,
        &payload.organization_id,
        ATTENDANCE_EDIT_ROLES,
    )
    .await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let record = remove_nulls(serialize_to_map(&payload));
    let created = create_row(pool, "attendance_records", &record).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_attendance(
    State(state): State<AppState>,
    Path(path): Path<AttendancePath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateAttendanceInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "attendance_records", &path.record_id, "id").await?;
    let org_id = value_str(&record, "organization_id");
    assert_org_role(&state, &user_id, &org_id, ATTENDANCE_EDIT_ROLES).await?;

    let patch = remove_nulls(serialize_to_map(&payload));
    if patch.is_empty() {
        return Ok(Json(record));
    }
    let updated = update_row(pool, "attendance_records", &path.record_id, &patch, "id").await?;
    Ok(Json(updated))
}

async fn delete_attendance(
    State(state): State<AppState>,
    Path(path): Path<AttendancePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "attendance_records", &path.record_id, "id").await?;
    let org_id = value_str(&record, "organization_id");
    assert_org_role(&state, &user_id, &org_id, ATTENDANCE_EDIT_ROLES).await?;
    let deleted = delete_row(pool, "attendance_records", &path.record_id, "id").await?;
    Ok(Json(deleted))
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
