use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::Response,
    Json,
};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};

use crate::{
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{list_rows, sync_primary_key},
    schemas::{clamp_limit, SyncCheckpointsQuery, SyncJobRequest},
    services::sync::{ensure_sync_table, run_sync_job, try_lock_table, SyncProgressEvent},
    state::AppState,
    tenancy::{assert_org_member, assert_org_role},
};

const SYNC_ROLES: &[&str] = &["owner_admin", "operator"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/sync/stream", axum::routing::post(stream_sync))
        .route("/sync/checkpoints", axum::routing::get(list_checkpoints))
}

/// Kick off a sheet-to-table sync and stream its progress as ndjson. The
/// job runs in a spawned task holding the per-table lock; closing the
/// response does not stop it.
async fn stream_sync(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SyncJobRequest>,
) -> AppResult<Response> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_role(&state, &user_id, &request.organization_id, SYNC_ROLES).await?;

    validate_request(&request)?;
    if state.db_pool.is_none() {
        return Err(AppError::Dependency(
            "Supabase database is not configured. Set SUPABASE_DB_URL or DATABASE_URL.".to_string(),
        ));
    }

    let guard = try_lock_table(&state.sync_locks, &request.target_table).ok_or_else(|| {
        AppError::Conflict(format!(
            "A sync job is already running for table '{}'.",
            request.target_table
        ))
    })?;

    tracing::info!(
        table = %request.target_table,
        sheet = %request.sheet_name,
        user_id = %user_id,
        truncate = request.truncate_table,
        incremental = request.enable_incremental_sync,
        "Sync job started"
    );

    let (tx, rx) = mpsc::channel::<SyncProgressEvent>(64);
    let job_state = state.clone();
    tokio::spawn(async move {
        let _guard = guard;
        run_sync_job(job_state, request, tx).await;
    });

    let body = ReceiverStream::new(rx).map(|event| {
        let line = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok::<_, std::convert::Infallible>(Bytes::from(format!("{line}\n")))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body))
        .map_err(|error| AppError::Internal(format!("Could not build stream response: {error}")))
}

fn validate_request(request: &SyncJobRequest) -> AppResult<()> {
    if request.spreadsheet_id.trim().is_empty() {
        return Err(AppError::BadRequest("spreadsheet_id is required.".to_string()));
    }
    if request.sheet_name.trim().is_empty() {
        return Err(AppError::BadRequest("sheet_name is required.".to_string()));
    }
    ensure_sync_table(&request.target_table)?;
    if request.column_mapping.is_empty() {
        return Err(AppError::BadRequest(
            "column_mapping must have at least one entry.".to_string(),
        ));
    }

    let key_column = sync_primary_key(&request.target_table);
    let maps_key = request
        .column_mapping
        .values()
        .any(|column| column == key_column);
    if !maps_key {
        return Err(AppError::BadRequest(format!(
            "column_mapping must map some sheet column to '{key_column}' so rows can be upserted."
        )));
    }
    Ok(())
}

async fn list_checkpoints(
    State(state): State<AppState>,
    Query(query): Query<SyncCheckpointsQuery>,
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
    if let Some(table) = query
        .target_table
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        filters.insert("target_table".to_string(), Value::String(table.to_string()));
    }

    let rows = list_rows(
        pool,
        "sync_checkpoints",
        Some(&filters),
        clamp_limit(query.limit),
        0,
        "updated_at",
        false,
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

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::validate_request;
    use crate::schemas::SyncJobRequest;

    fn request() -> SyncJobRequest {
        let mut mapping = BTreeMap::new();
        mapping.insert("Email".to_string(), "email".to_string());
        SyncJobRequest {
            organization_id: "550e8400-e29b-41d4-a716-446655440000".to_string(),
            spreadsheet_id: "abc".to_string(),
            sheet_name: "Team".to_string(),
            target_table: "team".to_string(),
            column_mapping: mapping,
            enable_incremental_sync: false,
            truncate_table: false,
        }
    }

    #[test]
    fn accepts_a_well_formed_request() {
        assert!(validate_request(&request()).is_ok());
    }

    #[test]
    fn rejects_missing_fields_and_bad_tables() {
        let mut missing_sheet = request();
        missing_sheet.sheet_name = "  ".to_string();
        assert!(validate_request(&missing_sheet).is_err());

        let mut bad_table = request();
        bad_table.target_table = "audit_logs".to_string();
        assert!(validate_request(&bad_table).is_err());

        let mut empty_mapping = request();
        empty_mapping.column_mapping.clear();
        assert!(validate_request(&empty_mapping).is_err());
    }

    #[test]
    fn requires_the_primary_key_to_be_mapped() {
        let mut no_key = request();
        no_key.column_mapping.clear();
        no_key
            .column_mapping
            .insert("Name".to_string(), "full_name".to_string());
        let error = validate_request(&no_key).unwrap_err();
        assert!(error.detail_message().contains("'email'"));
    }
}
