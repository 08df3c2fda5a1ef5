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
        clamp_limit, remove_nulls, serialize_to_map, validate_input, CreateExpenseInput,
        ExpensePath, ExpensesQuery, UpdateExpenseInput,
    },
    services::audit::write_audit_log,
    state::AppState,
    tenancy::{assert_org_member, assert_org_role},
};

const EXPENSE_EDIT_ROLES: &[&str] = &["owner_admin", "operator", "accountant"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/expenses",
            axum::routing::get(list_expenses).post(create_expense),
        )
        .route(
            "/expenses/{expense_id}",
            axum::routing::get(get_expense)
                .patch(update_expense)
                .delete(delete_expense),
        )
}

async fn list_expenses(
    State(state): State<AppState>,
    Query(query): Query<ExpensesQuery>,
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
    if let Some(category) = non_empty_opt(query.category.as_deref()) {
        filters.insert("category".to_string(), Value::String(category));
    }
    if let Some(from) = non_empty_opt(query.spent_on__gte.as_deref()) {
        filters.insert("spent_on__gte".to_string(), Value::String(from));
    }
    if let Some(to) = non_empty_opt(query.spent_on__lte.as_deref()) {
        filters.insert("spent_on__lte".to_string(), Value::String(to));
    }

    let rows = list_rows(
        pool,
        "expenses",
        Some(&filters),
        clamp_limit(query.limit),
        0,
        "spent_on",
        false,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

async fn create_expense(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateExpenseInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_role(&state, &user_id, &payload.organization_id, EXPENSE_EDIT_ROLES).await?;
    validate_input(&payload)?;
    if payload.amount < 0.0 {
        return Err(AppError::BadRequest(
            "amount must be non-negative.".to_string(),
        ));
    }
    let pool = db_pool(&state)?;

    let mut record = remove_nulls(serialize_to_map(&payload));
    record.insert(
        "created_by_user_id".to_string(),
        Value::String(user_id.clone()),
    );
    let created = create_row(pool, "expenses", &record).await?;
    let expense_id = value_str(&created, "id");
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&payload.organization_id),
        Some(&user_id),
        "create",
        "expenses",
        Some(&expense_id),
        None,
        Some(created.clone()),
    )
    .await;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_expense(
    State(state): State<AppState>,
    Path(path): Path<ExpensePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "expenses", &path.expense_id, "id").await?;
    assert_org_member(&state, &user_id, &value_str(&record, "organization_id")).await?;
    Ok(Json(record))
}

async fn update_expense(
    State(state): State<AppState>,
    Path(path): Path<ExpensePath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateExpenseInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "expenses", &path.expense_id, "id").await?;
    let org_id = value_str(&record, "organization_id");
    assert_org_role(&state, &user_id, &org_id, EXPENSE_EDIT_ROLES).await?;

    if payload.amount.is_some_and(|amount| amount < 0.0) {
        return Err(AppError::BadRequest(
            "amount must be non-negative.".to_string(),
        ));
    }

    let patch = remove_nulls(serialize_to_map(&payload));
    if patch.is_empty() {
        return Ok(Json(record));
    }
    let updated = update_row(pool, "expenses", &path.expense_id, &patch, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&org_id),
        Some(&user_id),
        "update",
        "expenses",
        Some(&path.expense_id),
        Some(record),
        Some(updated.clone()),
    )
    .await;
    Ok(Json(updated))
}

async fn delete_expense(
    State(state): State<AppState>,
    Path(path): Path<ExpensePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "expenses", &path.expense_id, "id").await?;
    let org_id = value_str(&record, "organization_id");
    assert_org_role(&state, &user_id, &org_id, EXPENSE_EDIT_ROLES).await?;
    let deleted = delete_row(pool, "expenses", &path.expense_id, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&org_id),
        Some(&user_id),
        "delete",
        "expenses",
        Some(&path.expense_id),
        Some(deleted.clone()),
        None,
    )
    .await;
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

fn non_empty_opt(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToOwned::to_owned)
}
