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
        clamp_limit, remove_nulls, serialize_to_map, validate_input, CreateTourChoiceInput,
        CreateTourInput, CreateTourOptionInput, TourChoicePath, TourOptionPath, TourPath,
        ToursQuery, UpdateTourInput,
    },
    services::audit::write_audit_log,
    state::AppState,
    tenancy::{assert_org_member, assert_org_role},
};

const TOUR_EDIT_ROLES: &[&str] = &["owner_admin", "operator"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/tours", axum::routing::get(list_tours).post(create_tour))
        .route(
            "/tours/{tour_id}",
            axum::routing::get(get_tour)
                .patch(update_tour)
                .delete(delete_tour),
        )
        .route(
            "/tours/{tour_id}/options",
            axum::routing::get(list_tour_options).post(create_tour_option),
        )
        .route(
            "/tour-options/{option_id}",
            axum::routing::delete(delete_tour_option),
        )
        .route(
            "/tours/{tour_id}/choices",
            axum::routing::get(list_tour_choices).post(create_tour_choice),
        )
        .route(
            "/tour-choices/{choice_id}",
            axum::routing::delete(delete_tour_choice),
        )
}

async fn list_tours(
    State(state): State<AppState>,
    Query(query): Query<ToursQuery>,
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
        "tours",
        Some(&filters),
        clamp_limit(query.limit),
        0,
        "created_at",
        false,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

async fn create_tour(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateTourInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_role(&state, &user_id, &payload.organization_id, TOUR_EDIT_ROLES).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let record = remove_nulls(serialize_to_map(&payload));
    let created = create_row(pool, "tours", &record).await?;
    let tour_id = value_str(&created, "id");
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&payload.organization_id),
        Some(&user_id),
        "create",
        "tours",
        Some(&tour_id),
        None,
        Some(created.clone()),
    )
    .await;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_tour(
    State(state): State<AppState>,
    Path(path): Path<TourPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "tours", &path.tour_id, "id").await?;
    let org_id = value_str(&record, "organization_id");
    assert_org_member(&state, &user_id, &org_id).await?;
    Ok(Json(record))
}

async fn update_tour(
    State(state): State<AppState>,
    Path(path): Path<TourPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateTourInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "tours", &path.tour_id, "id").await?;
    let org_id = value_str(&record, "organization_id");
    assert_org_role(&state, &user_id, &org_id, TOUR_EDIT_ROLES).await?;

    let patch = remove_nulls(serialize_to_map(&payload));
    if patch.is_empty() {
        return Ok(Json(record));
    }
    let updated = update_row(pool, "tours", &path.tour_id, &patch, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&org_id),
        Some(&user_id),
        "update",
        "tours",
        Some(&path.tour_id),
        Some(record),
        Some(updated.clone()),
    )
    .await;
    Ok(Json(updated))
}

async fn delete_tour(
    State(state): State<AppState>,
    Path(path): Path<TourPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "tours", &path.tour_id, "id").await?;
    let org_id = value_str(&record, "organization_id");
    assert_org_role(&state, &user_id, &org_id, TOUR_EDIT_ROLES).await?;

    let deleted = delete_row(pool, "tours", &path.tour_id, "id").await?;
    write_audit_log(
        state.db_pool.as_ref(),
        Some(&org_id),
        Some(&user_id),
        "delete",
        "tours",
        Some(&path.tour_id),
        Some(deleted.clone()),
        None,
    )
    .await;
    Ok(Json(deleted))
}

// ========== Options and choices ==========

async fn list_tour_options(
    State(state): State<AppState>,
    Path(path): Path<TourPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let tour = get_row(pool, "tours", &path.tour_id, "id").await?;
    assert_org_member(&state, &user_id, &value_str(&tour, "organization_id")).await?;

    let mut filters = Map::new();
    filters.insert("tour_id".to_string(), Value::String(path.tour_id.clone()));
    let rows = list_rows(pool, "tour_options", Some(&filters), 200, 0, "sort_order", true).await?;
    Ok(Json(json!({ "data": rows })))
}

async fn create_tour_option(
    State(state): State<AppState>,
    Path(path): Path<TourPath>,
    headers: HeaderMap,
    Json(payload): Json<CreateTourOptionInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_role(&state, &user_id, &payload.organization_id, TOUR_EDIT_ROLES).await?;
    validate_input(&payload)?;
    if payload.tour_id != path.tour_id {
        return Err(AppError::BadRequest(
            "tour_id in the payload does not match the path.".to_string(),
        ));
    }
    let pool = db_pool(&state)?;

    let record = remove_nulls(serialize_to_map(&payload));
    let created = create_row(pool, "tour_options", &record).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn delete_tour_option(
    State(state): State<AppState>,
    Path(path): Path<TourOptionPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "tour_options", &path.option_id, "id").await?;
    let org_id = value_str(&record, "organization_id");
    assert_org_role(&state, &user_id, &org_id, TOUR_EDIT_ROLES).await?;
    let deleted = delete_row(pool, "tour_options", &path.option_id, "id").await?;
    Ok(Json(deleted))
}

async fn list_tour_choices(
    State(state): State<AppState>,
    Path(path): Path<TourPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let tour = get_row(pool, "tours", &path.tour_id, "id").await?;
    assert_org_member(&state, &user_id, &value_str(&tour, "organization_id")).await?;

    let mut filters = Map::new();
    filters.insert("tour_id".to_string(), Value::String(path.tour_id.clone()));
    let rows = list_rows(pool, "tour_choices", Some(&filters), 500, 0, "created_at", true).await?;
    Ok(Json(json!({ "data": rows })))
}

async fn create_tour_choice(
    State(state): State<AppState>,
    Path(path): Path<TourPath>,
    headers: HeaderMap,
    Json(payload): Json<CreateTourChoiceInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_role(&state, &user_id, &payload.organization_id, TOUR_EDIT_ROLES).await?;
    validate_input(&payload)?;
    if payload.tour_id != path.tour_id {
        return Err(AppError::BadRequest(
            "tour_id in the payload does not match the path.".to_string(),
        ));
    }
    let pool = db_pool(&state)?;

    // The option must belong to the same tour; a choice under a foreign
    // option would silently misprice reservations.
    let option = get_row(pool, "tour_options", &payload.tour_option_id, "id").await?;
    if value_str(&option, "tour_id") != payload.tour_id {
        return Err(AppError::BadRequest(
            "tour_option_id does not belong to this tour.".to_string(),
        ));
    }

    let record = remove_nulls(serialize_to_map(&payload));
    let created = create_row(pool, "tour_choices", &record).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn delete_tour_choice(
    State(state): State<AppState>,
    Path(path): Path<TourChoicePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "tour_choices", &path.choice_id, "id").await?;
    let org_id = value_str(&record, "organization_id");
    assert_org_role(&state, &user_id, &org_id, TOUR_EDIT_ROLES).await?;
    let deleted = delete_row(pool, "tour_choices", &path.choice_id, "id").await?;
    Ok(Json(deleted))
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
