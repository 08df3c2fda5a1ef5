use axum::{
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
    repository::table_service::{create_row, list_rows},
    schemas::{
        clamp_limit, remove_nulls, serialize_to_map, validate_input, CreateOrganizationInput,
        CreateOrganizationMemberInput, OrgPath,
    },
    services::audit::write_audit_log,
    state::AppState,
    tenancy::{assert_org_member, assert_org_role, ensure_org_membership, list_user_organizations},
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/organizations",
            axum::routing::get(list_organizations).post(create_organization),
        )
        .route(
            "/organizations/{org_id}/members",
            axum::routing::get(list_members).post(add_member),
        )
        .route("/team", axum::routing::get(list_team))
}

async fn list_organizations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let organizations = list_user_organizations(&state, &user_id).await?;
    Ok(Json(json!({ "data": organizations })))
}

async fn create_organization(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateOrganizationInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let mut record = remove_nulls(serialize_to_map(&payload));
    record.insert(
        "owner_user_id".to_string(),
        Value::String(user_id.clone()),
    );
    let created = create_row(pool, "organizations", &record).await?;
    let org_id = value_str(&created, "id");

    ensure_org_membership(&state, &org_id, &user_id, "owner_admin", true).await?;
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&org_id),
        Some(&user_id),
        "create",
        "organizations",
        Some(&org_id),
        None,
        Some(created.clone()),
    )
    .await;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_members(
    State(state): State<AppState>,
    Path(path): Path<OrgPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_member(&state, &user_id, &path.org_id).await?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    filters.insert(
        "organization_id".to_string(),
        Value::String(path.org_id.clone()),
    );
    let rows = list_rows(
        pool,
        "organization_members",
        Some(&filters),
        500,
        0,
        "created_at",
        true,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

async fn add_member(
    State(state): State<AppState>,
    Path(path): Path<OrgPath>,
    headers: HeaderMap,
    Json(payload): Json<CreateOrganizationMemberInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_role(&state, &user_id, &path.org_id, &["owner_admin"]).await?;

    ensure_org_membership(
        &state,
        &path.org_id,
        &payload.user_id,
        &payload.role,
        payload.is_primary,
    )
    .await?;
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&path.org_id),
        Some(&user_id),
        "create",
        "organization_members",
        Some(&payload.user_id),
        None,
        Some(json!({ "role": payload.role })),
    )
    .await;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "ok": true, "user_id": payload.user_id, "role": payload.role })),
    ))
}

// ========== Team roster (synced from Sheets) ==========

#[derive(Debug, Deserialize)]
struct TeamQuery {
    org_id: String,
    #[serde(default = "default_team_limit")]
    limit: i64,
}

fn default_team_limit() -> i64 {
    200
}

async fn list_team(
    State(state): State<AppState>,
    Query(query): Query<TeamQuery>,
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
    let rows = list_rows(
        pool,
        "team",
        Some(&filters),
        clamp_limit(query.limit),
        0,
        "email",
        true,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
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
