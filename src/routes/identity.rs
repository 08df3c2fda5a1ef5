use axum::{extract::State, http::HeaderMap, Json};
use serde_json::{json, Value};

use crate::{
    auth::require_user,
    error::AppResult,
    state::AppState,
    tenancy::{ensure_app_user, list_user_organizations},
};

/// Who am I: upserts the app_users row on first login and returns the
/// profile plus org memberships.
pub async fn me(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    let profile = ensure_app_user(&state, &user).await?;
    let organizations = list_user_organizations(&state, &user.id).await?;
    Ok(Json(json!({
        "user": profile,
        "organizations": organizations,
    })))
}
