use serde_json::{Map, Value};
use sqlx::PgPool;

/// Best-effort audit trail. Failures are logged and swallowed; an audit miss
/// must never fail the mutation it describes.
#[allow(clippy::too_many_arguments)]
pub async fn write_audit_log(
    pool: Option<&PgPool>,
    org_id: Option<&str>,
    user_id: Option<&str>,
    action: &str,
    entity_name: &str,
    entity_id: Option<&str>,
    before: Option<Value>,
    after: Option<Value>,
) {
    let Some(pool) = pool else {
        return;
    };

    let mut changes = Map::new();
    if let Some(before) = before {
        changes.insert("before".to_string(), before);
    }
    if let Some(after) = after {
        changes.insert("after".to_string(), after);
    }

    let result = sqlx::query(
        "INSERT INTO audit_logs (organization_id, user_id, action, entity_name, entity_id, changes)
         VALUES ($1::uuid, $2::uuid, $3, $4, $5, $6)",
    )
    .bind(org_id)
    .bind(user_id)
    .bind(action)
    .bind(entity_name)
    .bind(entity_id)
    .bind(Value::Object(changes))
    .execute(pool)
    .await;

    if let Err(error) = result {
        tracing::warn!(error = %error, action, entity_name, "Audit log write failed");
    }
}
