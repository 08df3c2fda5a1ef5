use reqwest::Client;
use serde_json::{Map, Value};

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};

const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets";

/// Fetch a sheet and return its data rows keyed by the header row. Cells
/// come back from the values API as strings; coercion happens later in the
/// sync transformer. Short rows are padded with nulls.
pub async fn fetch_sheet_rows(
    client: &Client,
    config: &AppConfig,
    spreadsheet_id: &str,
    sheet_name: &str,
) -> AppResult<Vec<Map<String, Value>>> {
    let api_key = config.google_sheets_api_key.as_deref().ok_or_else(|| {
        AppError::Dependency(
            "Google Sheets is not configured. Set GOOGLE_SHEETS_API_KEY.".to_string(),
        )
    })?;

    let url = format!("{SHEETS_API_BASE}/{spreadsheet_id}/values/{sheet_name}");
    let response = client
        .get(&url)
        .query(&[("key", api_key), ("valueRenderOption", "UNFORMATTED_VALUE")])
        .header("Accept", "application/json")
        .send()
        .await
        .map_err(|error| {
            tracing::error!(error = %error, spreadsheet_id, "Sheets request failed");
            AppError::Dependency("Google Sheets request failed.".to_string())
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(AppError::Dependency(format!(
            "Google Sheets returned {status} for sheet '{sheet_name}'."
        )));
    }

    let payload = response.json::<Value>().await.map_err(|error| {
        AppError::Dependency(format!("Google Sheets returned an unexpected body: {error}"))
    })?;

    let Some(values) = payload.get("values").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };

    let mut rows = values.iter();
    let Some(header_row) = rows.next() else {
        return Ok(Vec::new());
    };
    let headers = header_row
        .as_array()
        .map(|cells| {
            cells
                .iter()
                .map(|cell| cell_text(cell).unwrap_or_default())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    if headers.iter().all(String::is_empty) {
        return Ok(Vec::new());
    }

    let mut records = Vec::new();
    for row in rows {
        let cells = row.as_array().cloned().unwrap_or_default();
        let mut record = Map::new();
        for (index, header) in headers.iter().enumerate() {
            if header.is_empty() {
                continue;
            }
            let cell = cells.get(index).cloned().unwrap_or(Value::Null);
            record.insert(header.clone(), cell);
        }
        records.push(record);
    }

    Ok(records)
}

fn cell_text(cell: &Value) -> Option<String> {
    match cell {
        Value::String(text) => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}
