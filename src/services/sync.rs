use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{PgPool, Row};
use tokio::sync::mpsc;

use crate::error::{AppError, AppResult};
use crate::repository::table_service::{
    count_rows, delete_rows_by_keys, select_key_batch, sync_primary_key, upsert_row,
};
use crate::schemas::SyncJobRequest;
use crate::services::sheets::fetch_sheet_rows;
use crate::state::AppState;

/// Tables a sync job may write into. A subset of the repository allow-list:
/// tenancy and audit tables are never sync targets.
const SYNC_TABLES: &[&str] = &[
    "attendance_records",
    "channels",
    "coupons",
    "expenses",
    "payment_methods",
    "reservations",
    "team",
    "tours",
];

const MIN_CHUNK_SIZE: i64 = 100;
const MAX_ERASE_ATTEMPTS: u32 = 100;
const ERASE_PROGRESS_ROWS: u64 = 1000;
const WRITE_PROGRESS_ROWS: u64 = 10;

pub fn ensure_sync_table(table: &str) -> AppResult<()> {
    if SYNC_TABLES.contains(&table) {
        return Ok(());
    }
    Err(AppError::BadRequest(format!(
        "Table '{table}' is not a sync target."
    )))
}

// ---------------------------------------------------------------------------
// Progress events
// ---------------------------------------------------------------------------

/// One line of the ndjson progress stream. Closed variant set so consumers
/// can match exhaustively; unknown kinds on the wire are still ignorable
/// because every variant is tagged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncProgressEvent {
    Info {
        message: String,
    },
    Warn {
        message: String,
    },
    Error {
        message: String,
    },
    Progress {
        processed: u64,
        total: u64,
    },
    Result {
        success: bool,
        processed: u64,
        errors: u64,
        skipped: u64,
        deleted: u64,
        message: String,
    },
}

pub type EventSink = mpsc::Sender<SyncProgressEvent>;

/// Send failures mean the client went away; the job keeps running and the
/// remaining events go nowhere.
async fn emit(events: &EventSink, event: SyncProgressEvent) {
    let _ = events.send(event).await;
}

// ---------------------------------------------------------------------------
// Per-table job lock
// ---------------------------------------------------------------------------

/// Held for the lifetime of a sync job; at most one mutation job per
/// destination table. Dropping the guard releases the table.
pub struct TableLockGuard {
    locks: Arc<Mutex<HashSet<String>>>,
    table: String,
}

pub fn try_lock_table(
    locks: &Arc<Mutex<HashSet<String>>>,
    table: &str,
) -> Option<TableLockGuard> {
    let mut held = match locks.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if !held.insert(table.to_string()) {
        return None;
    }
    Some(TableLockGuard {
        locks: Arc::clone(locks),
        table: table.to_string(),
    })
}

impl Drop for TableLockGuard {
    fn drop(&mut self) {
        let mut held = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        held.remove(&self.table);
    }
}

// ---------------------------------------------------------------------------
// Row transformation
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RowTransform {
    pub row: Map<String, Value>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Number,
    Bool,
    Date,
    Timestamp,
    Text,
}

fn column_kind(column: &str) -> ColumnKind {
    const NUMERIC_NAMES: &[&str] = &["adults", "children", "infants", "capacity", "sort_order"];
    const NUMERIC_SUFFIXES: &[&str] = &["_price", "_amount", "_percent", "_ratio", "_count"];

    if NUMERIC_NAMES.contains(&column) || NUMERIC_SUFFIXES.iter().any(|s| column.ends_with(s)) {
        return ColumnKind::Number;
    }
    if column.starts_with("is_") || column.starts_with("has_") {
        return ColumnKind::Bool;
    }
    if column.ends_with("_date") || column.ends_with("_on") {
        return ColumnKind::Date;
    }
    if column.ends_with("_at") {
        return ColumnKind::Timestamp;
    }
    ColumnKind::Text
}

/// Map one source row through the caller's column mapping. Unmapped source
/// columns are dropped; a value that fails coercion becomes null plus a
/// warning rather than failing the row.
pub fn transform_row(
    source: &Map<String, Value>,
    mapping: &BTreeMap<String, String>,
    row_number: i64,
) -> RowTransform {
    let mut out = RowTransform::default();

    for (sheet_column, db_column) in mapping {
        let Some(raw) = source.get(sheet_column) else {
            continue;
        };
        match coerce_value(db_column, raw) {
            Ok(value) => {
                out.row.insert(db_column.clone(), value);
            }
            Err(()) => {
                out.warnings.push(format!(
                    "Row {row_number}: could not read '{}' as {} for column '{db_column}'; wrote null.",
                    render_raw(raw),
                    kind_label(column_kind(db_column)),
                ));
                out.row.insert(db_column.clone(), Value::Null);
            }
        }
    }

    out
}

fn kind_label(kind: ColumnKind) -> &'static str {
    match kind {
        ColumnKind::Number => "a number",
        ColumnKind::Bool => "a boolean",
        ColumnKind::Date => "a date",
        ColumnKind::Timestamp => "a timestamp",
        ColumnKind::Text => "text",
    }
}

fn render_raw(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn coerce_value(column: &str, raw: &Value) -> Result<Value, ()> {
    if raw.is_null() {
        return Ok(Value::Null);
    }
    if let Value::String(text) = raw {
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
    }

    match column_kind(column) {
        ColumnKind::Number => coerce_number(raw),
        ColumnKind::Bool => coerce_bool(raw),
        ColumnKind::Date => coerce_date(raw),
        ColumnKind::Timestamp => coerce_timestamp(raw),
        ColumnKind::Text => Ok(match raw {
            Value::String(text) => Value::String(text.trim().to_string()),
            other => other.clone(),
        }),
    }
}

fn coerce_number(raw: &Value) -> Result<Value, ()> {
    match raw {
        Value::Number(_) => Ok(raw.clone()),
        Value::String(text) => {
            let cleaned = text.trim().replace(',', "");
            let parsed = cleaned.parse::<f64>().map_err(|_| ())?;
            serde_json::Number::from_f64(parsed)
                .map(Value::Number)
                .ok_or(())
        }
        _ => Err(()),
    }
}

fn coerce_bool(raw: &Value) -> Result<Value, ()> {
    match raw {
        Value::Bool(_) => Ok(raw.clone()),
        Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "1" | "yes" | "y" => Ok(Value::Bool(true)),
            "false" | "f" | "0" | "no" | "n" => Ok(Value::Bool(false)),
            _ => Err(()),
        },
        Value::Number(number) => Ok(Value::Bool(number.as_f64().is_some_and(|n| n != 0.0))),
        _ => Err(()),
    }
}

fn coerce_date(raw: &Value) -> Result<Value, ()> {
    let Value::String(text) = raw else {
        return Err(());
    };
    let trimmed = text.trim();
    for format in ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Ok(Value::String(date.format("%Y-%m-%d").to_string()));
        }
    }
    Err(())
}

fn coerce_timestamp(raw: &Value) -> Result<Value, ()> {
    let Value::String(text) = raw else {
        return Err(());
    };
    let trimmed = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(Value::String(parsed.to_rfc3339()));
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S") {
        return Ok(Value::String(parsed.and_utc().to_rfc3339()));
    }
    Err(())
}

// ---------------------------------------------------------------------------
// Chunked table eraser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct EraseOutcome {
    pub success: bool,
    pub deleted_count: u64,
    pub error: Option<String>,
}

pub fn is_timeout_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("timeout")
        || lower.contains("57014")
        || lower.contains("canceling statement")
        || lower.contains("statement limit")
}

fn shrink_chunk_size(current: i64) -> i64 {
    (current / 2).max(MIN_CHUNK_SIZE)
}

/// Key-batch source and sink for the eraser loop, separated so the loop's
/// batching and backoff behavior is testable without a database.
trait EraseBackend {
    async fn fetch_keys(&mut self, limit: i64) -> Result<Vec<String>, AppError>;
    async fn delete_keys(&mut self, keys: &[String]) -> Result<u64, AppError>;
}

struct PgEraseBackend<'a> {
    pool: &'a PgPool,
    table: &'a str,
    key_column: &'static str,
    org_id: &'a str,
}

impl EraseBackend for PgEraseBackend<'_> {
    async fn fetch_keys(&mut self, limit: i64) -> Result<Vec<String>, AppError> {
        select_key_batch(self.pool, self.table, self.key_column, Some(self.org_id), limit).await
    }

    async fn delete_keys(&mut self, keys: &[String]) -> Result<u64, AppError> {
        delete_rows_by_keys(self.pool, self.table, self.key_column, keys).await
    }
}

/// Delete an org's rows from `table` in bounded batches. On an error that
/// looks like a statement timeout the batch size is halved (floor 100) and
/// the remaining work retried; rows already deleted are never re-attempted.
/// No transaction spans the batches: a failure mid-run leaves the table
/// partially cleared with `deleted_count` reflecting the work done.
pub async fn delete_in_chunks(
    pool: &PgPool,
    table: &str,
    org_id: &str,
    chunk_size: i64,
    events: &EventSink,
) -> EraseOutcome {
    let mut filters = Map::new();
    filters.insert(
        "organization_id".to_string(),
        Value::String(org_id.to_string()),
    );
    let total = count_rows(pool, table, Some(&filters)).await.unwrap_or(0);

    let mut backend = PgEraseBackend {
        pool,
        table,
        key_column: sync_primary_key(table),
        org_id,
    };
    erase_with_backend(&mut backend, table, chunk_size, total.max(0) as u64, events).await
}

async fn erase_with_backend<B: EraseBackend>(
    backend: &mut B,
    table: &str,
    initial_chunk_size: i64,
    total: u64,
    events: &EventSink,
) -> EraseOutcome {
    let mut chunk_size = initial_chunk_size.max(1);
    let mut deleted = 0u64;
    let mut last_reported = 0u64;

    for _ in 0..MAX_ERASE_ATTEMPTS {
        let keys = match backend.fetch_keys(chunk_size).await {
            Ok(keys) => keys,
            Err(error) => {
                return EraseOutcome {
                    success: false,
                    deleted_count: deleted,
                    error: Some(error.detail_message()),
                }
            }
        };
        if keys.is_empty() {
            return EraseOutcome {
                success: true,
                deleted_count: deleted,
                error: None,
            };
        }
        let fetched = keys.len() as i64;

        match backend.delete_keys(&keys).await {
            Ok(count) => {
                deleted += count;
                if deleted - last_reported >= ERASE_PROGRESS_ROWS {
                    emit(
                        events,
                        SyncProgressEvent::Progress {
                            processed: deleted,
                            total,
                        },
                    )
                    .await;
                    last_reported = deleted;
                }
                if fetched < chunk_size {
                    return EraseOutcome {
                        success: true,
                        deleted_count: deleted,
                        error: None,
                    };
                }
            }
            Err(error) => {
                let message = error.detail_message();
                if is_timeout_error(&message) {
                    let next = shrink_chunk_size(chunk_size);
                    emit(
                        events,
                        SyncProgressEvent::Warn {
                            message: format!(
                                "Delete on '{table}' timed out at chunk size {chunk_size}; retrying with {next}."
                            ),
                        },
                    )
                    .await;
                    chunk_size = next;
                    continue;
                }
                return EraseOutcome {
                    success: false,
                    deleted_count: deleted,
                    error: Some(message),
                };
            }
        }
    }

    EraseOutcome {
        success: false,
        deleted_count: deleted,
        error: Some(format!(
            "Chunked delete on '{table}' gave up after {MAX_ERASE_ATTEMPTS} attempts."
        )),
    }
}

// ---------------------------------------------------------------------------
// Sync checkpoints
// ---------------------------------------------------------------------------

async fn read_checkpoint(
    pool: &PgPool,
    request: &SyncJobRequest,
) -> Result<Option<i64>, AppError> {
    let row = sqlx::query(
        "SELECT last_row_index
         FROM sync_checkpoints
         WHERE organization_id = $1::uuid
           AND spreadsheet_id = $2 AND sheet_name = $3 AND target_table = $4
         LIMIT 1",
    )
    .bind(&request.organization_id)
    .bind(&request.spreadsheet_id)
    .bind(&request.sheet_name)
    .bind(&request.target_table)
    .fetch_optional(pool)
    .await
    .map_err(|error| AppError::Dependency(format!("Checkpoint lookup failed: {error}")))?;

    Ok(row.and_then(|value| value.try_get::<i64, _>("last_row_index").ok()))
}

async fn write_checkpoint(
    pool: &PgPool,
    request: &SyncJobRequest,
    last_row_index: i64,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO sync_checkpoints
           (organization_id, spreadsheet_id, sheet_name, target_table, last_row_index, updated_at)
         VALUES ($1::uuid, $2, $3, $4, $5, now())
         ON CONFLICT (organization_id, spreadsheet_id, sheet_name, target_table)
         DO UPDATE SET last_row_index = EXCLUDED.last_row_index, updated_at = now()",
    )
    .bind(&request.organization_id)
    .bind(&request.spreadsheet_id)
    .bind(&request.sheet_name)
    .bind(&request.target_table)
    .bind(last_row_index)
    .execute(pool)
    .await
    .map_err(|error| AppError::Dependency(format!("Checkpoint write failed: {error}")))?;
    Ok(())
}

async fn clear_checkpoint(pool: &PgPool, request: &SyncJobRequest) {
    let result = sqlx::query(
        "DELETE FROM sync_checkpoints
         WHERE organization_id = $1::uuid
           AND spreadsheet_id = $2 AND sheet_name = $3 AND target_table = $4",
    )
    .bind(&request.organization_id)
    .bind(&request.spreadsheet_id)
    .bind(&request.sheet_name)
    .bind(&request.target_table)
    .execute(pool)
    .await;
    if let Err(error) = result {
        tracing::warn!(error = %error, "Could not clear sync checkpoint");
    }
}

// ---------------------------------------------------------------------------
// Row writer
// ---------------------------------------------------------------------------

/// Upsert-and-checkpoint sink for the write loop; separated from the loop so
/// partial-failure accounting is testable without a database.
trait RowWriter {
    async fn upsert(&mut self, row: &Map<String, Value>) -> Result<(), AppError>;
    async fn checkpoint(&mut self, row_number: i64);
}

struct PgRowWriter<'a> {
    pool: &'a PgPool,
    request: &'a SyncJobRequest,
    key_column: &'static str,
    checkpoint_warned: bool,
}

impl RowWriter for PgRowWriter<'_> {
    async fn upsert(&mut self, row: &Map<String, Value>) -> Result<(), AppError> {
        upsert_row(self.pool, &self.request.target_table, self.key_column, row).await
    }

    async fn checkpoint(&mut self, row_number: i64) {
        if let Err(error) = write_checkpoint(self.pool, self.request, row_number).await {
            if !self.checkpoint_warned {
                tracing::warn!(error = %error.detail_message(), "Checkpoint writes are failing");
                self.checkpoint_warned = true;
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ApplyStats {
    processed: u64,
    errors: u64,
    skipped: u64,
}

async fn apply_rows<W: RowWriter>(
    writer: &mut W,
    rows: &[Map<String, Value>],
    request: &SyncJobRequest,
    resume_after: Option<i64>,
    events: &EventSink,
) -> ApplyStats {
    let total = rows.len() as u64;
    let mut stats = ApplyStats::default();

    for (index, source) in rows.iter().enumerate() {
        // 1-based position within the sheet's data rows (header excluded).
        let row_number = index as i64 + 1;
        if resume_after.is_some_and(|cursor| row_number <= cursor) {
            stats.skipped += 1;
            continue;
        }

        let transformed = transform_row(source, &request.column_mapping, row_number);
        for warning in transformed.warnings {
            emit(events, SyncProgressEvent::Warn { message: warning }).await;
        }
        if transformed.row.is_empty() {
            stats.skipped += 1;
            continue;
        }

        let mut row = transformed.row;
        row.entry("organization_id".to_string())
            .or_insert_with(|| Value::String(request.organization_id.clone()));

        match writer.upsert(&row).await {
            Ok(()) => {
                stats.processed += 1;
                if request.enable_incremental_sync {
                    writer.checkpoint(row_number).await;
                }
            }
            Err(error) => {
                stats.errors += 1;
                emit(
                    events,
                    SyncProgressEvent::Warn {
                        message: format!(
                            "Row {row_number} failed to write: {}",
                            error.detail_message()
                        ),
                    },
                )
                .await;
            }
        }

        let seen = stats.processed + stats.errors;
        if seen > 0 && seen % WRITE_PROGRESS_ROWS == 0 {
            emit(
                events,
                SyncProgressEvent::Progress {
                    processed: stats.processed,
                    total,
                },
            )
            .await;
        }
    }

    stats
}

// ---------------------------------------------------------------------------
// Job orchestration
// ---------------------------------------------------------------------------

/// Run one sync job to completion, emitting progress over `events`. Fatal
/// failures (sheet unreachable, truncation failed) emit a single `error`
/// event and end the stream without a `result`; per-row failures are counted
/// and the job continues.
pub async fn run_sync_job(state: AppState, request: SyncJobRequest, events: EventSink) {
    let Some(pool) = state.db_pool.as_ref() else {
        emit(
            &events,
            SyncProgressEvent::Error {
                message: "Database is not configured.".to_string(),
            },
        )
        .await;
        return;
    };

    emit(
        &events,
        SyncProgressEvent::Info {
            message: format!(
                "Syncing sheet '{}' into '{}'.",
                request.sheet_name, request.target_table
            ),
        },
    )
    .await;

    let rows = match fetch_sheet_rows(
        &state.http_client,
        &state.config,
        &request.spreadsheet_id,
        &request.sheet_name,
    )
    .await
    {
        Ok(rows) => rows,
        Err(error) => {
            emit(
                &events,
                SyncProgressEvent::Error {
                    message: error.detail_message(),
                },
            )
            .await;
            return;
        }
    };
    emit(
        &events,
        SyncProgressEvent::Info {
            message: format!("Fetched {} source rows.", rows.len()),
        },
    )
    .await;

    let mut deleted = 0u64;
    if request.truncate_table {
        emit(
            &events,
            SyncProgressEvent::Info {
                message: format!(
                    "Clearing '{}' in chunks of {}.",
                    request.target_table, state.config.sync_chunk_size
                ),
            },
        )
        .await;
        let outcome = delete_in_chunks(
            pool,
            &request.target_table,
            &request.organization_id,
            state.config.sync_chunk_size,
            &events,
        )
        .await;
        deleted = outcome.deleted_count;
        if !outcome.success {
            emit(
                &events,
                SyncProgressEvent::Error {
                    message: format!(
                        "Truncation failed after deleting {} rows: {}",
                        outcome.deleted_count,
                        outcome.error.unwrap_or_else(|| "unknown error".to_string())
                    ),
                },
            )
            .await;
            return;
        }
        emit(
            &events,
            SyncProgressEvent::Info {
                message: format!("Deleted {} rows.", outcome.deleted_count),
            },
        )
        .await;
        // A fresh table invalidates any previous cursor.
        clear_checkpoint(pool, &request).await;
    }

    let resume_after = if request.enable_incremental_sync && !request.truncate_table {
        match read_checkpoint(pool, &request).await {
            Ok(Some(cursor)) if cursor > 0 => {
                emit(
                    &events,
                    SyncProgressEvent::Info {
                        message: format!("Resuming after source row {cursor}."),
                    },
                )
                .await;
                Some(cursor)
            }
            Ok(_) => None,
            Err(error) => {
                emit(
                    &events,
                    SyncProgressEvent::Warn {
                        message: format!(
                            "{} Starting from the first row.",
                            error.detail_message()
                        ),
                    },
                )
                .await;
                None
            }
        }
    } else {
        None
    };

    let mut writer = PgRowWriter {
        pool,
        request: &request,
        key_column: sync_primary_key(&request.target_table),
        checkpoint_warned: false,
    };
    let stats = apply_rows(&mut writer, &rows, &request, resume_after, &events).await;

    emit(
        &events,
        SyncProgressEvent::Progress {
            processed: stats.processed,
            total: rows.len() as u64,
        },
    )
    .await;
    emit(
        &events,
        SyncProgressEvent::Result {
            success: true,
            processed: stats.processed,
            errors: stats.errors,
            skipped: stats.skipped,
            deleted,
            message: format!(
                "Sync finished: {} applied, {} failed, {} skipped, {} deleted.",
                stats.processed, stats.errors, stats.skipped, deleted
            ),
        },
    )
    .await;
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::{json, Map, Value};
    use tokio::sync::mpsc;

    use super::{
        apply_rows, erase_with_backend, is_timeout_error, shrink_chunk_size, transform_row,
        try_lock_table, ApplyStats, EraseBackend, RowWriter, SyncProgressEvent,
    };
    use crate::error::AppError;
    use crate::schemas::SyncJobRequest;

    fn request() -> SyncJobRequest {
        let mut mapping = BTreeMap::new();
        mapping.insert("Email".to_string(), "email".to_string());
        mapping.insert("Name".to_string(), "full_name".to_string());
        SyncJobRequest {
            organization_id: "550e8400-e29b-41d4-a716-446655440000".to_string(),
            spreadsheet_id: "sheet-1".to_string(),
            sheet_name: "Team".to_string(),
            target_table: "team".to_string(),
            column_mapping: mapping,
            enable_incremental_sync: false,
            truncate_table: false,
        }
    }

    fn drain(receiver: &mut mpsc::Receiver<SyncProgressEvent>) -> Vec<SyncProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    // -- events ------------------------------------------------------------

    #[test]
    fn events_serialize_with_a_type_tag() {
        let progress = serde_json::to_value(SyncProgressEvent::Progress {
            processed: 3,
            total: 10,
        })
        .unwrap();
        assert_eq!(
            progress,
            json!({"type": "progress", "processed": 3, "total": 10})
        );

        let result = serde_json::to_value(SyncProgressEvent::Result {
            success: true,
            processed: 9,
            errors: 1,
            skipped: 0,
            deleted: 0,
            message: "done".to_string(),
        })
        .unwrap();
        assert_eq!(result["type"], "result");
        assert_eq!(result["processed"], 9);
        assert_eq!(result["errors"], 1);
    }

    // -- transformation ----------------------------------------------------

    #[test]
    fn maps_and_coerces_columns() {
        let mut mapping = BTreeMap::new();
        mapping.insert("Price".to_string(), "adult_price".to_string());
        mapping.insert("Date".to_string(), "tour_date".to_string());
        mapping.insert("Name".to_string(), "full_name".to_string());

        let mut source = Map::new();
        source.insert("Price".to_string(), Value::String("1,250.50".to_string()));
        source.insert("Date".to_string(), Value::String("03/15/2026".to_string()));
        source.insert("Name".to_string(), Value::String("  Beach Tour ".to_string()));
        source.insert("Ignored".to_string(), Value::String("dropped".to_string()));

        let transformed = transform_row(&source, &mapping, 1);
        assert!(transformed.warnings.is_empty());
        assert_eq!(transformed.row["adult_price"], json!(1250.5));
        assert_eq!(transformed.row["tour_date"], json!("2026-03-15"));
        assert_eq!(transformed.row["full_name"], json!("Beach Tour"));
        assert!(!transformed.row.contains_key("Ignored"));
    }

    #[test]
    fn invalid_values_become_null_with_a_warning() {
        let mut mapping = BTreeMap::new();
        mapping.insert("Price".to_string(), "adult_price".to_string());

        let mut source = Map::new();
        source.insert("Price".to_string(), Value::String("abc".to_string()));

        let transformed = transform_row(&source, &mapping, 7);
        assert_eq!(transformed.row["adult_price"], Value::Null);
        assert_eq!(transformed.warnings.len(), 1);
        assert!(transformed.warnings[0].contains("Row 7"));
    }

    #[test]
    fn empty_cells_become_null_silently() {
        let mut mapping = BTreeMap::new();
        mapping.insert("Price".to_string(), "adult_price".to_string());
        mapping.insert("Missing".to_string(), "notes".to_string());

        let mut source = Map::new();
        source.insert("Price".to_string(), Value::String("  ".to_string()));

        let transformed = transform_row(&source, &mapping, 1);
        assert!(transformed.warnings.is_empty());
        assert_eq!(transformed.row["adult_price"], Value::Null);
        // Columns absent from the source row are not written at all.
        assert!(!transformed.row.contains_key("notes"));
    }

    // -- eraser ------------------------------------------------------------

    struct FakeEraser {
        remaining: usize,
        fetch_limits: Vec<i64>,
        delete_rounds: u32,
        timeouts_left: u32,
    }

    impl FakeEraser {
        fn new(rows: usize, timeouts: u32) -> Self {
            Self {
                remaining: rows,
                fetch_limits: Vec::new(),
                delete_rounds: 0,
                timeouts_left: timeouts,
            }
        }
    }

    impl EraseBackend for FakeEraser {
        async fn fetch_keys(&mut self, limit: i64) -> Result<Vec<String>, AppError> {
            self.fetch_limits.push(limit);
            let count = self.remaining.min(limit as usize);
            Ok((0..count).map(|i| format!("key-{i}")).collect())
        }

        async fn delete_keys(&mut self, keys: &[String]) -> Result<u64, AppError> {
            if self.timeouts_left > 0 {
                self.timeouts_left -= 1;
                return Err(AppError::Dependency(
                    "ERROR: canceling statement due to statement timeout".to_string(),
                ));
            }
            self.delete_rounds += 1;
            self.remaining -= keys.len();
            Ok(keys.len() as u64)
        }
    }

    #[tokio::test]
    async fn erases_1200_rows_in_three_round_trips() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut backend = FakeEraser::new(1200, 0);
        let outcome = erase_with_backend(&mut backend, "team", 500, 1200, &tx).await;

        assert!(outcome.success);
        assert_eq!(outcome.deleted_count, 1200);
        assert_eq!(backend.delete_rounds, 3);
        assert_eq!(backend.fetch_limits, vec![500, 500, 500]);
        // 1000-row progress threshold crossed exactly once.
        let events = drain(&mut rx);
        let progress = events
            .iter()
            .filter(|event| matches!(event, SyncProgressEvent::Progress { .. }))
            .count();
        assert_eq!(progress, 1);
    }

    #[tokio::test]
    async fn deletes_fewer_rows_than_one_chunk() {
        let (tx, _rx) = mpsc::channel(64);
        let mut backend = FakeEraser::new(42, 0);
        let outcome = erase_with_backend(&mut backend, "team", 500, 42, &tx).await;
        assert!(outcome.success);
        assert_eq!(outcome.deleted_count, 42);
        assert_eq!(backend.delete_rounds, 1);
    }

    #[tokio::test]
    async fn timeout_halves_the_chunk_size() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut backend = FakeEraser::new(600, 1);
        let outcome = erase_with_backend(&mut backend, "team", 500, 600, &tx).await;

        assert!(outcome.success);
        assert_eq!(outcome.deleted_count, 600);
        // First fetch at 500 times out on delete; retries run at 250.
        assert_eq!(backend.fetch_limits[0], 500);
        assert_eq!(backend.fetch_limits[1], 250);
        let events = drain(&mut rx);
        assert!(events.iter().any(|event| matches!(
            event,
            SyncProgressEvent::Warn { message } if message.contains("retrying with 250")
        )));
    }

    #[tokio::test]
    async fn repeated_timeouts_floor_at_the_minimum_chunk() {
        let (tx, _rx) = mpsc::channel(256);
        let mut backend = FakeEraser::new(150, 4);
        let outcome = erase_with_backend(&mut backend, "team", 500, 150, &tx).await;

        assert!(outcome.success);
        assert_eq!(outcome.deleted_count, 150);
        // 500 → 250 → 125 → 100 → stays 100.
        assert_eq!(backend.fetch_limits[..5], [500, 250, 125, 100, 100]);
    }

    #[tokio::test]
    async fn non_recoverable_errors_stop_the_eraser() {
        struct BrokenEraser;
        impl EraseBackend for BrokenEraser {
            async fn fetch_keys(&mut self, _limit: i64) -> Result<Vec<String>, AppError> {
                Ok(vec!["a".to_string()])
            }
            async fn delete_keys(&mut self, _keys: &[String]) -> Result<u64, AppError> {
                Err(AppError::Dependency("permission denied".to_string()))
            }
        }

        let (tx, _rx) = mpsc::channel(64);
        let outcome = erase_with_backend(&mut BrokenEraser, "team", 500, 1, &tx).await;
        assert!(!outcome.success);
        assert_eq!(outcome.deleted_count, 0);
        assert_eq!(outcome.error.as_deref(), Some("permission denied"));
    }

    #[test]
    fn shrink_halves_with_a_floor() {
        assert_eq!(shrink_chunk_size(500), 250);
        assert_eq!(shrink_chunk_size(250), 125);
        assert_eq!(shrink_chunk_size(125), 100);
        assert_eq!(shrink_chunk_size(100), 100);
    }

    #[test]
    fn timeout_detection_matches_postgres_messages() {
        assert!(is_timeout_error("canceling statement due to statement timeout"));
        assert!(is_timeout_error("SQLSTATE 57014"));
        assert!(is_timeout_error("Connection Timeout"));
        assert!(!is_timeout_error("permission denied for table team"));
    }

    // -- writer ------------------------------------------------------------

    struct FakeWriter {
        calls: u64,
        fail_on_call: Option<u64>,
        checkpoints: Vec<i64>,
    }

    impl RowWriter for FakeWriter {
        async fn upsert(&mut self, _row: &Map<String, Value>) -> Result<(), AppError> {
            self.calls += 1;
            if self.fail_on_call == Some(self.calls) {
                return Err(AppError::Dependency("insert failed".to_string()));
            }
            Ok(())
        }

        async fn checkpoint(&mut self, row_number: i64) {
            self.checkpoints.push(row_number);
        }
    }

    fn team_rows(count: usize) -> Vec<Map<String, Value>> {
        (0..count)
            .map(|i| {
                let mut row = Map::new();
                row.insert(
                    "Email".to_string(),
                    Value::String(format!("guide{i}@example.com")),
                );
                row.insert("Name".to_string(), Value::String(format!("Guide {i}")));
                row
            })
            .collect()
    }

    #[tokio::test]
    async fn one_failing_row_does_not_abort_the_batch() {
        let (tx, mut rx) = mpsc::channel(256);
        let mut writer = FakeWriter {
            calls: 0,
            fail_on_call: Some(5),
            checkpoints: Vec::new(),
        };
        let stats = apply_rows(&mut writer, &team_rows(10), &request(), None, &tx).await;

        assert_eq!(
            stats,
            ApplyStats {
                processed: 9,
                errors: 1,
                skipped: 0
            }
        );
        let events = drain(&mut rx);
        assert!(events.iter().any(|event| matches!(
            event,
            SyncProgressEvent::Warn { message } if message.contains("Row 5 failed")
        )));
    }

    #[tokio::test]
    async fn resume_cursor_skips_applied_rows() {
        let (tx, _rx) = mpsc::channel(256);
        let mut writer = FakeWriter {
            calls: 0,
            fail_on_call: None,
            checkpoints: Vec::new(),
        };
        let stats = apply_rows(&mut writer, &team_rows(10), &request(), Some(4), &tx).await;
        assert_eq!(
            stats,
            ApplyStats {
                processed: 6,
                errors: 0,
                skipped: 4
            }
        );
    }

    #[tokio::test]
    async fn incremental_mode_checkpoints_each_written_row() {
        let (tx, _rx) = mpsc::channel(256);
        let mut writer = FakeWriter {
            calls: 0,
            fail_on_call: Some(2),
            checkpoints: Vec::new(),
        };
        let mut incremental = request();
        incremental.enable_incremental_sync = true;
        apply_rows(&mut writer, &team_rows(3), &incremental, None, &tx).await;
        // Row 2 failed, so only rows 1 and 3 advanced the cursor.
        assert_eq!(writer.checkpoints, vec![1, 3]);
    }

    #[tokio::test]
    async fn rows_inherit_the_org_id() {
        struct CapturingWriter {
            rows: Vec<Map<String, Value>>,
        }
        impl RowWriter for CapturingWriter {
            async fn upsert(&mut self, row: &Map<String, Value>) -> Result<(), AppError> {
                self.rows.push(row.clone());
                Ok(())
            }
            async fn checkpoint(&mut self, _row_number: i64) {}
        }

        let (tx, _rx) = mpsc::channel(64);
        let mut writer = CapturingWriter { rows: Vec::new() };
        apply_rows(&mut writer, &team_rows(1), &request(), None, &tx).await;
        assert_eq!(
            writer.rows[0]["organization_id"],
            Value::String("550e8400-e29b-41d4-a716-446655440000".to_string())
        );
    }

    // -- table lock --------------------------------------------------------

    #[test]
    fn second_lock_on_the_same_table_is_refused() {
        let locks = std::sync::Arc::new(std::sync::Mutex::new(std::collections::HashSet::new()));
        let guard = try_lock_table(&locks, "team");
        assert!(guard.is_some());
        assert!(try_lock_table(&locks, "team").is_none());
        assert!(try_lock_table(&locks, "tours").is_some());

        drop(guard);
        assert!(try_lock_table(&locks, "team").is_some());
    }
}
