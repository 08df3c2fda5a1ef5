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
    repository::table_service::{create_row, delete_row, get_row, list_rows},
    schemas::{
        clamp_limit, remove_nulls, serialize_to_map, validate_input, ChatMessagePath,
        ChatMessagesQuery, CreateChatMessageInput,
    },
    state::AppState,
    tenancy::{assert_org_member, assert_org_role},
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/chat/messages",
            axum::routing::get(list_messages).post(create_message),
        )
        .route(
            "/chat/messages/{message_id}",
            axum::routing::delete(delete_message),
        )
}

async fn list_messages(
    State(state): State<AppState>,
    Query(query): Query<ChatMessagesQuery>,
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
    if let Some(channel) = query
        .channel
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        filters.insert("channel".to_string(), Value::String(channel.to_string()));
    }

    let rows = list_rows(
        pool,
        "chat_messages",
        Some(&filters),
        clamp_limit(query.limit),
        0,
        "created_at",
        false,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

async fn create_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateChatMessageInput>,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;
    assert_org_member(&state, &user_id, &payload.organization_id).await?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let mut record = remove_nulls(serialize_to_map(&payload));
    record.insert(
        "sender_user_id".to_string(),
        Value::String(user_id.clone()),
    );
    let created = create_row(pool, "chat_messages", &record).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// Authors delete their own messages; admins can delete anything.
async fn delete_message(
    State(state): State<AppState>,
    Path(path): Path<ChatMessagePath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let record = get_row(pool, "chat_messages", &path.message_id, "id").await?;
    let org_id = value_str(&record, "organization_id");

    if value_str(&record, "sender_user_id") != user_id {
        assert_org_role(&state, &user_id, &org_id, &["owner_admin"]).await?;
    } else {
        assert_org_member(&state, &user_id, &org_id).await?;
    }

    let deleted = delete_row(pool, "chat_messages", &path.message_id, "id").await?;
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
