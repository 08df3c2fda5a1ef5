#![allow(dead_code)]

use chrono::{DateTime, FixedOffset, NaiveDate};
use serde_json::{Map, Value};
use sqlx::{postgres::PgRow, Postgres, QueryBuilder, Row};

use crate::error::AppError;

const ALLOWED_TABLES: &[&str] = &[
    "app_users",
    "attendance_records",
    "audit_logs",
    "channels",
    "chat_messages",
    "coupons",
    "document_templates",
    "expenses",
    "organization_members",
    "organizations",
    "payment_methods",
    "reservation_choices",
    "reservations",
    "sync_checkpoints",
    "team",
    "tour_choices",
    "tour_options",
    "tours",
];

/// Primary key column for sync targets. The `team` roster is keyed by email
/// (it mirrors a spreadsheet whose rows have no stable id); everything else
/// uses the `id` uuid.
pub fn sync_primary_key(table: &str) -> &'static str {
    if table == "team" {
        "email"
    } else {
        "id"
    }
}

pub async fn list_rows(
    pool: &sqlx::PgPool,
    table: &str,
    filters: Option<&Map<String, Value>>,
    limit: i64,
    offset: i64,
    order_by: &str,
    ascending: bool,
) -> Result<Vec<Value>, AppError> {
    let table_name = validate_table(table)?;
    let order_name = if order_by.trim().is_empty() {
        "created_at"
    } else {
        validate_identifier(order_by)?
    };

    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query.push(table_name).push(" t WHERE 1=1");

    if let Some(filter_map) = filters {
        for (key, value) in filter_map {
            push_filter_clause(&mut query, key, value)?;
        }
    }

    query.push(" ORDER BY t.").push(order_name);
    query.push(if ascending { " ASC" } else { " DESC" });
    query
        .push(" LIMIT ")
        .push_bind(limit.clamp(1, 1000))
        .push(" OFFSET ")
        .push_bind(offset.max(0));

    let rows = query.build().fetch_all(pool).await.map_err(map_db_error)?;
    Ok(read_rows(rows))
}

pub async fn get_row(
    pool: &sqlx::PgPool,
    table: &str,
    row_id: &str,
    id_field: &str,
) -> Result<Value, AppError> {
    let table_name = validate_table(table)?;
    let id_name = validate_identifier(id_field)?;

    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query.push(table_name).push(" t WHERE ");
    push_scalar_equals(
        &mut query,
        id_name,
        &infer_scalar(id_name, &Value::String(row_id.to_string())),
    );
    query.push(" LIMIT 1");

    let row = query
        .build()
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?;

    row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::NotFound(format!("{table_name} record not found.")))
}

pub async fn create_row(
    pool: &sqlx::PgPool,
    table: &str,
    payload: &Map<String, Value>,
) -> Result<Value, AppError> {
    let table_name = validate_table(table)?;
    if payload.is_empty() {
        return Err(AppError::BadRequest(format!(
            "Could not create {table_name} record."
        )));
    }
    let keys = sorted_validated_keys(payload)?;

    // jsonb_populate_record lets PostgreSQL resolve column types (uuid,
    // enum, numeric) from the table definition instead of us guessing.
    let mut query = QueryBuilder::<Postgres>::new("INSERT INTO ");
    query.push(table_name).push(" (");
    push_column_list(&mut query, &keys);
    query.push(") SELECT ");
    push_record_columns(&mut query, &keys);
    query
        .push(" FROM jsonb_populate_record(NULL::")
        .push(table_name)
        .push(", ");
    query.push_bind(Value::Object(payload.clone()));
    query
        .push(") r RETURNING row_to_json(")
        .push(table_name)
        .push(".*) AS row");

    let row = query
        .build()
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?;

    row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::Internal(format!("Could not create {table_name} record.")))
}

/// Insert-or-update on `conflict_column`. Used by the sync writer so re-runs
/// of a job are idempotent.
pub async fn upsert_row(
    pool: &sqlx::PgPool,
    table: &str,
    conflict_column: &str,
    payload: &Map<String, Value>,
) -> Result<(), AppError> {
    let table_name = validate_table(table)?;
    let conflict_name = validate_identifier(conflict_column)?;
    if payload.is_empty() {
        return Err(AppError::BadRequest(format!(
            "Could not upsert {table_name} record."
        )));
    }
    if !payload.contains_key(conflict_name) {
        return Err(AppError::BadRequest(format!(
            "Upsert payload is missing its key column '{conflict_name}'."
        )));
    }
    let keys = sorted_validated_keys(payload)?;

    let mut query = QueryBuilder::<Postgres>::new("INSERT INTO ");
    query.push(table_name).push(" (");
    push_column_list(&mut query, &keys);
    query.push(") SELECT ");
    push_record_columns(&mut query, &keys);
    query
        .push(" FROM jsonb_populate_record(NULL::")
        .push(table_name)
        .push(", ");
    query.push_bind(Value::Object(payload.clone()));
    query.push(") r ON CONFLICT (").push(conflict_name).push(")");

    let update_keys = keys
        .iter()
        .filter(|key| key.as_str() != conflict_name)
        .collect::<Vec<_>>();
    if update_keys.is_empty() {
        query.push(" DO NOTHING");
    } else {
        query.push(" DO UPDATE SET ");
        let mut separated = query.separated(", ");
        for key in update_keys {
            separated.push(key.as_str());
            separated.push_unseparated(" = EXCLUDED.");
            separated.push_unseparated(key.as_str());
        }
    }

    query.build().execute(pool).await.map_err(map_db_error)?;
    Ok(())
}

pub async fn update_row(
    pool: &sqlx::PgPool,
    table: &str,
    row_id: &str,
    payload: &Map<String, Value>,
    id_field: &str,
) -> Result<Value, AppError> {
    let table_name = validate_table(table)?;
    let id_name = validate_identifier(id_field)?;
    if payload.is_empty() {
        return Err(AppError::BadRequest("No fields to update.".to_string()));
    }
    let keys = sorted_validated_keys(payload)?;

    let mut query = QueryBuilder::<Postgres>::new("UPDATE ");
    query.push(table_name).push(" t SET ");
    {
        let mut separated = query.separated(", ");
        for key in &keys {
            separated.push(key.as_str());
            separated.push_unseparated(" = r.");
            separated.push_unseparated(key.as_str());
        }
    }
    query
        .push(" FROM jsonb_populate_record(NULL::")
        .push(table_name)
        .push(", ");
    query.push_bind(Value::Object(payload.clone()));
    query.push(") r WHERE ");
    push_scalar_equals(
        &mut query,
        id_name,
        &infer_scalar(id_name, &Value::String(row_id.to_string())),
    );
    query.push(" RETURNING row_to_json(t) AS row");

    let row = query
        .build()
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?;

    row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::NotFound(format!("{table_name} record not found.")))
}

pub async fn delete_row(
    pool: &sqlx::PgPool,
    table: &str,
    row_id: &str,
    id_field: &str,
) -> Result<Value, AppError> {
    let existing = get_row(pool, table, row_id, id_field).await?;
    let table_name = validate_table(table)?;
    let id_name = validate_identifier(id_field)?;

    let mut query = QueryBuilder::<Postgres>::new("DELETE FROM ");
    query.push(table_name).push(" t WHERE ");
    push_scalar_equals(
        &mut query,
        id_name,
        &infer_scalar(id_name, &Value::String(row_id.to_string())),
    );
    query.build().execute(pool).await.map_err(map_db_error)?;

    Ok(existing)
}

pub async fn count_rows(
    pool: &sqlx::PgPool,
    table: &str,
    filters: Option<&Map<String, Value>>,
) -> Result<i64, AppError> {
    let table_name = validate_table(table)?;

    let mut query = QueryBuilder::<Postgres>::new("SELECT COUNT(*)::bigint AS total FROM ");
    query.push(table_name).push(" t WHERE 1=1");

    if let Some(filter_map) = filters {
        for (key, value) in filter_map {
            push_filter_clause(&mut query, key, value)?;
        }
    }

    let row = query.build().fetch_one(pool).await.map_err(map_db_error)?;
    Ok(row.try_get::<i64, _>("total").unwrap_or(0))
}

/// Fetch up to `limit` primary-key values from `table`, optionally scoped to
/// one organization. Chunked-deletion primitive.
pub async fn select_key_batch(
    pool: &sqlx::PgPool,
    table: &str,
    key_column: &str,
    org_id: Option<&str>,
    limit: i64,
) -> Result<Vec<String>, AppError> {
    let table_name = validate_table(table)?;
    let key_name = validate_identifier(key_column)?;

    let mut query = QueryBuilder::<Postgres>::new("SELECT t.");
    query
        .push(key_name)
        .push("::text AS key FROM ")
        .push(table_name)
        .push(" t WHERE 1=1");
    if let Some(org) = org_id {
        query.push(" AND ");
        push_scalar_equals(
            &mut query,
            "organization_id",
            &infer_scalar("organization_id", &Value::String(org.to_string())),
        );
    }
    query.push(" LIMIT ").push_bind(limit.max(1));

    let rows = query.build().fetch_all(pool).await.map_err(map_db_error)?;
    Ok(rows
        .into_iter()
        .filter_map(|row| row.try_get::<String, _>("key").ok())
        .collect())
}

/// Delete the rows whose key column matches any of `keys`, returning the
/// number of rows removed.
pub async fn delete_rows_by_keys(
    pool: &sqlx::PgPool,
    table: &str,
    key_column: &str,
    keys: &[String],
) -> Result<u64, AppError> {
    if keys.is_empty() {
        return Ok(0);
    }
    let table_name = validate_table(table)?;
    let key_name = validate_identifier(key_column)?;

    let mut query = QueryBuilder::<Postgres>::new("DELETE FROM ");
    query.push(table_name).push(" WHERE ").push(key_name);
    if is_uuid_identifier(key_name) {
        let uuids = keys
            .iter()
            .filter_map(|key| uuid::Uuid::parse_str(key.trim()).ok())
            .collect::<Vec<_>>();
        query.push(" = ANY(").push_bind(uuids).push(")");
    } else {
        query
            .push("::text = ANY(")
            .push_bind(keys.to_vec())
            .push(")");
    }

    let result = query.build().execute(pool).await.map_err(map_db_error)?;
    Ok(result.rows_affected())
}

fn read_rows(rows: Vec<PgRow>) -> Vec<Value> {
    rows.into_iter()
        .filter_map(|row| row.try_get::<Option<Value>, _>("row").ok().flatten())
        .collect()
}

fn sorted_validated_keys(payload: &Map<String, Value>) -> Result<Vec<String>, AppError> {
    let mut keys = payload.keys().cloned().collect::<Vec<_>>();
    keys.sort_unstable();
    for key in &keys {
        validate_identifier(key)?;
    }
    Ok(keys)
}

fn push_column_list(query: &mut QueryBuilder<Postgres>, keys: &[String]) {
    let mut separated = query.separated(", ");
    for key in keys {
        separated.push(key.as_str());
    }
}

fn push_record_columns(query: &mut QueryBuilder<Postgres>, keys: &[String]) {
    let mut separated = query.separated(", ");
    for key in keys {
        separated.push("r.");
        separated.push_unseparated(key.as_str());
    }
}

pub fn validate_table(table: &str) -> Result<&str, AppError> {
    let normalized = validate_identifier(table)?;
    if ALLOWED_TABLES.contains(&normalized) {
        return Ok(normalized);
    }
    Err(AppError::Forbidden(format!(
        "Table '{normalized}' is not allowed."
    )))
}

fn validate_identifier(identifier: &str) -> Result<&str, AppError> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        return Err(AppError::BadRequest(
            "Identifier cannot be empty.".to_string(),
        ));
    }
    if !trimmed.chars().all(|character| {
        character.is_ascii_lowercase() || character.is_ascii_digit() || character == '_'
    }) {
        return Err(AppError::BadRequest(format!(
            "Invalid identifier '{trimmed}'."
        )));
    }
    if trimmed
        .chars()
        .next()
        .is_some_and(|first| first.is_ascii_digit())
    {
        return Err(AppError::BadRequest(format!(
            "Invalid identifier '{trimmed}'."
        )));
    }
    Ok(trimmed)
}

#[derive(Debug, Clone)]
enum ScalarFilter {
    Text(String),
    Uuid(uuid::Uuid),
    Bool(bool),
    I64(i64),
    F64(f64),
    Date(NaiveDate),
    Timestamp(DateTime<FixedOffset>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterOperator {
    Eq,
    Gte,
    Lte,
    IsNull,
}

fn parse_filter_key(filter_key: &str) -> Result<(&str, FilterOperator), AppError> {
    if let Some((column, suffix)) = filter_key.rsplit_once("__") {
        let operator = match suffix {
            "gte" => Some(FilterOperator::Gte),
            "lte" => Some(FilterOperator::Lte),
            "is_null" => Some(FilterOperator::IsNull),
            "in" => Some(FilterOperator::Eq),
            _ => None,
        };
        if let Some(operator) = operator {
            return Ok((validate_identifier(column)?, operator));
        }
    }
    Ok((validate_identifier(filter_key)?, FilterOperator::Eq))
}

fn push_filter_clause(
    query: &mut QueryBuilder<Postgres>,
    filter_key: &str,
    value: &Value,
) -> Result<(), AppError> {
    let (column, operator) = parse_filter_key(filter_key)?;

    if operator == FilterOperator::IsNull {
        query.push(" AND t.").push(column);
        query.push(if truthy(value) { " IS NULL" } else { " IS NOT NULL" });
        return Ok(());
    }

    match value {
        Value::Null => Ok(()),
        Value::Array(items) => {
            if operator != FilterOperator::Eq {
                return Err(AppError::BadRequest(format!(
                    "Filter '{filter_key}' does not support array values."
                )));
            }
            if items.is_empty() {
                return Ok(());
            }
            query.push(" AND t.").push(column);
            if is_uuid_identifier(column)
                && items.iter().all(|item| {
                    item.as_str()
                        .is_some_and(|text| uuid::Uuid::parse_str(text.trim()).is_ok())
                })
            {
                let uuids = items
                    .iter()
                    .filter_map(Value::as_str)
                    .filter_map(|text| uuid::Uuid::parse_str(text.trim()).ok())
                    .collect::<Vec<_>>();
                query.push(" = ANY(").push_bind(uuids).push(")");
            } else {
                let texts = items.iter().map(render_scalar).collect::<Vec<_>>();
                query.push("::text = ANY(").push_bind(texts).push(")");
            }
            Ok(())
        }
        _ => {
            query.push(" AND ");
            let scalar = infer_scalar(column, value);
            match operator {
                FilterOperator::Eq => push_scalar_equals(query, column, &scalar),
                FilterOperator::Gte => push_scalar_compare(query, column, " >= ", &scalar),
                FilterOperator::Lte => push_scalar_compare(query, column, " <= ", &scalar),
                FilterOperator::IsNull => {}
            }
            Ok(())
        }
    }
}

fn push_scalar_equals(query: &mut QueryBuilder<Postgres>, column: &str, value: &ScalarFilter) {
    push_scalar_compare(query, column, " = ", value);
}

fn push_scalar_compare(
    query: &mut QueryBuilder<Postgres>,
    column: &str,
    sql_operator: &str,
    value: &ScalarFilter,
) {
    query.push("t.").push(column);
    match value {
        ScalarFilter::Text(text) => {
            query.push("::text").push(sql_operator).push_bind(text.clone());
        }
        ScalarFilter::Uuid(id) => {
            query.push(sql_operator).push_bind(*id);
        }
        ScalarFilter::Bool(flag) => {
            query.push(sql_operator).push_bind(*flag);
        }
        ScalarFilter::I64(number) => {
            query.push(sql_operator).push_bind(*number);
        }
        ScalarFilter::F64(number) => {
            query.push(sql_operator).push_bind(*number);
        }
        ScalarFilter::Date(date) => {
            query.push(sql_operator).push_bind(*date);
        }
        ScalarFilter::Timestamp(timestamp) => {
            query.push(sql_operator).push_bind(timestamp.to_owned());
        }
    }
}

fn infer_scalar(filter_key: &str, value: &Value) -> ScalarFilter {
    match value {
        Value::Bool(flag) => ScalarFilter::Bool(*flag),
        Value::Number(number) => {
            if let Some(as_i64) = number.as_i64() {
                return ScalarFilter::I64(as_i64);
            }
            if let Some(as_f64) = number.as_f64() {
                return ScalarFilter::F64(as_f64);
            }
            ScalarFilter::Text(number.to_string())
        }
        Value::String(text) => {
            let trimmed = text.trim();
            if is_uuid_identifier(filter_key) {
                if let Ok(parsed) = uuid::Uuid::parse_str(trimmed) {
                    return ScalarFilter::Uuid(parsed);
                }
            }
            if is_timestamp_identifier(filter_key) {
                if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
                    return ScalarFilter::Timestamp(parsed);
                }
            }
            if is_date_identifier(filter_key) {
                if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
                    return ScalarFilter::Date(parsed);
                }
            }
            ScalarFilter::Text(text.clone())
        }
        _ => ScalarFilter::Text(render_scalar(value)),
    }
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|parsed| parsed != 0.0),
        Value::String(text) => matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "true" | "t" | "1" | "yes" | "y"
        ),
        _ => false,
    }
}

pub fn is_uuid_identifier(identifier: &str) -> bool {
    let normalized = identifier.trim();
    normalized == "id" || normalized.ends_with("_id")
}

fn is_date_identifier(identifier: &str) -> bool {
    let normalized = identifier.trim();
    normalized.ends_with("_date") || normalized.ends_with("_on")
}

fn is_timestamp_identifier(identifier: &str) -> bool {
    identifier.trim().ends_with("_at")
}

fn map_db_error(error: sqlx::Error) -> AppError {
    let message = error.to_string();
    tracing::error!(db_error = %message, "Database query failed");

    if message.contains("23505")
        || message
            .to_ascii_lowercase()
            .contains("duplicate key value violates unique constraint")
    {
        return AppError::Conflict("Duplicate value violates a unique constraint.".to_string());
    }
    AppError::Dependency(message)
}

#[cfg(test)]
mod tests {
    use serde_json::{Map, Value};
    use sqlx::{Postgres, QueryBuilder};

    use super::{sync_primary_key, validate_table};

    #[test]
    fn sync_key_is_email_only_for_team() {
        assert_eq!(sync_primary_key("team"), "email");
        assert_eq!(sync_primary_key("tours"), "id");
        assert_eq!(sync_primary_key("reservations"), "id");
    }

    #[test]
    fn rejects_tables_outside_the_allow_list() {
        assert!(validate_table("tours").is_ok());
        assert!(validate_table("pg_catalog").is_err());
        assert!(validate_table("tours; DROP TABLE tours").is_err());
        assert!(validate_table("Tours").is_err());
    }

    #[test]
    fn upsert_sql_targets_the_conflict_column() {
        let mut payload = Map::new();
        payload.insert(
            "email".to_string(),
            Value::String("guide@example.com".to_string()),
        );
        payload.insert("full_name".to_string(), Value::String("Guide".to_string()));
        payload.insert("role".to_string(), Value::String("guide".to_string()));

        let mut keys = payload.keys().cloned().collect::<Vec<_>>();
        keys.sort_unstable();

        let mut query = QueryBuilder::<Postgres>::new("INSERT INTO team (");
        {
            let mut separated = query.separated(", ");
            for key in &keys {
                separated.push(key.as_str());
            }
        }
        query.push(") SELECT ");
        {
            let mut separated = query.separated(", ");
            for key in &keys {
                separated.push("r.");
                separated.push_unseparated(key.as_str());
            }
        }
        query.push(" FROM jsonb_populate_record(NULL::team, ");
        query.push_bind(Value::Object(payload));
        query.push(") r ON CONFLICT (email) DO UPDATE SET ");
        {
            let mut separated = query.separated(", ");
            for key in keys.iter().filter(|key| key.as_str() != "email") {
                separated.push(key.as_str());
                separated.push_unseparated(" = EXCLUDED.");
                separated.push_unseparated(key.as_str());
            }
        }

        let sql = query.sql();
        assert!(
            sql.contains("jsonb_populate_record(NULL::team"),
            "Expected jsonb_populate_record in SQL but got: {sql}"
        );
        assert!(
            sql.contains("ON CONFLICT (email) DO UPDATE SET full_name = EXCLUDED.full_name"),
            "Expected conflict clause in SQL but got: {sql}"
        );
    }

    #[test]
    fn filter_key_suffixes_parse() {
        let (column, operator) = super::parse_filter_key("tour_date__gte").unwrap();
        assert_eq!(column, "tour_date");
        assert_eq!(operator, super::FilterOperator::Gte);

        let (column, operator) = super::parse_filter_key("status").unwrap();
        assert_eq!(column, "status");
        assert_eq!(operator, super::FilterOperator::Eq);

        assert!(super::parse_filter_key("bad column").is_err());
    }
}
