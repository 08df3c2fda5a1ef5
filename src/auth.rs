use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Authenticated Supabase identity attached to a request.
#[derive(Debug, Clone, Deserialize)]
pub struct SupabaseUser {
    pub id: String,
    pub email: Option<String>,
    pub user_metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SupabaseClaims {
    sub: String,
    email: Option<String>,
    user_metadata: Option<Value>,
}

pub async fn require_user(state: &AppState, headers: &HeaderMap) -> AppResult<SupabaseUser> {
    // Dev-only override so local frontends can impersonate a seeded user.
    if state.config.auth_dev_overrides_enabled() {
        if let Some(user_id) = header_value(headers, "x-user-id") {
            return Ok(SupabaseUser {
                id: user_id,
                email: None,
                user_metadata: None,
            });
        }
    }

    let token = bearer_token(headers).ok_or_else(|| {
        AppError::Unauthorized("Unauthorized: missing bearer token.".to_string())
    })?;

    if let Some(secret) = state.config.supabase_jwt_secret.as_deref() {
        return verify_local_jwt(&token, secret);
    }

    fetch_user_via_http(state, &token).await
}

pub async fn require_user_id(state: &AppState, headers: &HeaderMap) -> AppResult<String> {
    Ok(require_user(state, headers).await?.id)
}

/// Verify the Supabase access token locally with the project JWT secret.
fn verify_local_jwt(token: &str, secret: &str) -> AppResult<SupabaseUser> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_audience(&["authenticated"]);
    validation.leeway = 30;

    let data = decode::<SupabaseClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|error| {
        tracing::debug!(error = %error, "JWT verification failed");
        AppError::Unauthorized("Unauthorized: invalid or expired token.".to_string())
    })?;

    if data.claims.sub.trim().is_empty() {
        return Err(AppError::Unauthorized(
            "Unauthorized: token has no subject.".to_string(),
        ));
    }

    Ok(SupabaseUser {
        id: data.claims.sub,
        email: data.claims.email,
        user_metadata: data.claims.user_metadata,
    })
}

/// Fallback when no JWT secret is configured: ask the Supabase auth endpoint
/// to resolve the token. Slower; `main` warns about this at startup.
async fn fetch_user_via_http(state: &AppState, token: &str) -> AppResult<SupabaseUser> {
    let base_url = state.config.supabase_url.as_deref().ok_or_else(|| {
        AppError::Dependency("Supabase auth is not configured. Set SUPABASE_URL.".to_string())
    })?;
    let service_key = state
        .config
        .supabase_service_role_key
        .as_deref()
        .unwrap_or_default();

    let response = state
        .http_client
        .get(format!("{}/auth/v1/user", base_url.trim_end_matches('/')))
        .bearer_auth(token)
        .header("apikey", service_key)
        .send()
        .await
        .map_err(|error| {
            tracing::error!(error = %error, "Supabase auth request failed");
            AppError::Dependency("Supabase auth request failed.".to_string())
        })?;

    if response.status() == reqwest::StatusCode::UNAUTHORIZED
        || response.status() == reqwest::StatusCode::FORBIDDEN
    {
        return Err(AppError::Unauthorized(
            "Unauthorized: invalid or expired token.".to_string(),
        ));
    }

    let user = response
        .error_for_status()
        .map_err(|error| AppError::Dependency(format!("Supabase auth request failed: {error}")))?
        .json::<SupabaseUser>()
        .await
        .map_err(|error| {
            AppError::Dependency(format!("Supabase auth returned an unexpected body: {error}"))
        })?;

    if user.id.trim().is_empty() {
        return Err(AppError::Unauthorized(
            "Unauthorized: token resolved to no user.".to_string(),
        ));
    }

    Ok(user)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let token = raw.strip_prefix("Bearer ").or_else(|| raw.strip_prefix("bearer "))?;
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_string())
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

#[cfg(test)]
mod tests {
    use super::bearer_token;
    use axum::http::{HeaderMap, HeaderValue};

    #[test]
    fn extracts_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abc.def.ghi"),
        );
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn rejects_missing_or_malformed_header() {
        assert!(bearer_token(&HeaderMap::new()).is_none());

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Basic dXNlcjpwYXNz"),
        );
        assert!(bearer_token(&headers).is_none());

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer "),
        );
        assert!(bearer_token(&headers).is_none());
    }
}
