use std::collections::BTreeMap;

use serde::Deserialize;
use validator::Validate;

use crate::error::AppError;

pub fn validate_input<T: Validate>(input: &T) -> Result<(), AppError> {
    input
        .validate()
        .map_err(|errors| AppError::UnprocessableEntity(format!("Validation failed: {errors}")))
}

fn default_currency_usd() -> String {
    "USD".to_string()
}
fn default_timezone_seoul() -> String {
    "Asia/Seoul".to_string()
}
fn default_operator_role() -> String {
    "operator".to_string()
}
fn default_false() -> bool {
    false
}
fn default_true() -> bool {
    true
}
fn default_zero() -> f64 {
    0.0
}
fn default_adults() -> i64 {
    1
}
fn default_none_i64() -> i64 {
    0
}
fn default_reservation_status_pending() -> String {
    "pending".to_string()
}
fn default_chat_channel_general() -> String {
    "general".to_string()
}
fn default_attendance_present() -> String {
    "present".to_string()
}
fn default_payment_kind_card() -> String {
    "card".to_string()
}
fn default_limit_100() -> i64 {
    100
}
fn default_limit_200() -> i64 {
    200
}
fn default_limit_50() -> i64 {
    50
}

pub fn clamp_limit(limit: i64) -> i64 {
    limit.clamp(1, 500)
}

pub fn serialize_to_map<T>(value: &T) -> serde_json::Map<String, serde_json::Value>
where
    T: serde::Serialize,
{
    let json = serde_json::to_value(value)
        .unwrap_or_else(|_| serde_json::Value::Object(serde_json::Map::new()));
    json.as_object().cloned().unwrap_or_default()
}

pub fn remove_nulls(
    mut map: serde_json::Map<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    map.retain(|_, value| !value.is_null());
    map
}

// ---------------------------------------------------------------------------
// Organizations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateOrganizationInput {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub legal_name: Option<String>,
    #[serde(default = "default_currency_usd")]
    pub default_currency: String,
    #[serde(default = "default_timezone_seoul")]
    pub timezone: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct CreateOrganizationMemberInput {
    pub user_id: String,
    #[serde(default = "default_operator_role")]
    pub role: String,
    #[serde(default = "default_false")]
    pub is_primary: bool,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct OrgPath {
    pub org_id: String,
}

// ---------------------------------------------------------------------------
// Tours, options, choices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateTourInput {
    pub organization_id: String,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub code: Option<String>,
    pub description: Option<String>,
    #[validate(range(min = 0.0))]
    pub adult_price: f64,
    pub child_price: Option<f64>,
    pub infant_price: Option<f64>,
    #[serde(default = "default_zero")]
    pub not_included_price: f64,
    pub child_ratio: Option<f64>,
    pub infant_ratio: Option<f64>,
    #[serde(default = "default_true")]
    pub is_sale_available: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateTourInput {
    pub name: Option<String>,
    pub code: Option<String>,
    pub description: Option<String>,
    pub adult_price: Option<f64>,
    pub child_price: Option<f64>,
    pub infant_price: Option<f64>,
    pub not_included_price: Option<f64>,
    pub child_ratio: Option<f64>,
    pub infant_ratio: Option<f64>,
    pub is_sale_available: Option<bool>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ToursQuery {
    pub org_id: String,
    pub is_active: Option<bool>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct TourPath {
    pub tour_id: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateTourOptionInput {
    pub organization_id: String,
    pub tour_id: String,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[serde(default = "default_none_i64")]
    pub sort_order: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateTourChoiceInput {
    pub organization_id: String,
    pub tour_id: String,
    pub tour_option_id: String,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub adult_price: Option<f64>,
    pub child_price: Option<f64>,
    pub infant_price: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct TourOptionPath {
    pub option_id: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct TourChoicePath {
    pub choice_id: String,
}

// ---------------------------------------------------------------------------
// Channels and coupons
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateChannelInput {
    pub organization_id: String,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(range(min = 0.0, max = 100.0))]
    #[serde(default = "default_zero")]
    pub commission_percent: f64,
    #[validate(range(min = 0.0, max = 100.0))]
    #[serde(default = "default_zero")]
    pub markup_percent: f64,
    #[serde(default = "default_zero")]
    pub markup_amount: f64,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateChannelInput {
    pub name: Option<String>,
    pub commission_percent: Option<f64>,
    pub markup_percent: Option<f64>,
    pub markup_amount: Option<f64>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ChannelsQuery {
    pub org_id: String,
    pub is_active: Option<bool>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ChannelPath {
    pub channel_id: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateCouponInput {
    pub organization_id: String,
    #[validate(length(min = 1, max = 64))]
    pub code: String,
    #[validate(range(min = 0.0, max = 100.0))]
    pub percent: f64,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateCouponInput {
    pub percent: Option<f64>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct CouponsQuery {
    pub org_id: String,
    pub is_active: Option<bool>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct CouponPath {
    pub coupon_id: String,
}

// ---------------------------------------------------------------------------
// Reservations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateReservationInput {
    pub organization_id: String,
    pub tour_id: String,
    pub channel_id: Option<String>,
    pub coupon_code: Option<String>,
    #[validate(length(min = 1, max = 255))]
    pub guest_name: String,
    pub guest_email: Option<String>,
    pub tour_date: String,
    #[serde(default = "default_adults")]
    pub adults: i64,
    #[serde(default = "default_none_i64")]
    pub children: i64,
    #[serde(default = "default_none_i64")]
    pub infants: i64,
    #[serde(default = "default_reservation_status_pending")]
    pub status: String,
    #[serde(default = "default_currency_usd")]
    pub currency: String,
    #[serde(default)]
    pub selected_choices: Vec<SelectedChoiceInput>,
    #[serde(default)]
    pub manual_overrides: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct SelectedChoiceInput {
    pub option_id: String,
    pub choice_id: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateReservationInput {
    pub channel_id: Option<String>,
    pub coupon_code: Option<String>,
    pub guest_name: Option<String>,
    pub guest_email: Option<String>,
    pub tour_date: Option<String>,
    pub adults: Option<i64>,
    pub children: Option<i64>,
    pub infants: Option<i64>,
    pub status: Option<String>,
    pub payment_status: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ReservationsQuery {
    pub org_id: String,
    pub tour_id: Option<String>,
    pub status: Option<String>,
    pub tour_date__gte: Option<String>,
    pub tour_date__lte: Option<String>,
    #[serde(default = "default_limit_200")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ReservationPath {
    pub reservation_id: String,
}

// ---------------------------------------------------------------------------
// Expenses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateExpenseInput {
    pub organization_id: String,
    #[validate(length(min = 1, max = 128))]
    pub category: String,
    pub description: Option<String>,
    pub amount: f64,
    #[serde(default = "default_currency_usd")]
    pub currency: String,
    pub spent_on: String,
    pub payment_method_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateExpenseInput {
    pub category: Option<String>,
    pub description: Option<String>,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub spent_on: Option<String>,
    pub payment_method_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ExpensesQuery {
    pub org_id: String,
    pub category: Option<String>,
    pub spent_on__gte: Option<String>,
    pub spent_on__lte: Option<String>,
    #[serde(default = "default_limit_200")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ExpensePath {
    pub expense_id: String,
}

// ---------------------------------------------------------------------------
// Payment methods
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreatePaymentMethodInput {
    pub organization_id: String,
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    #[serde(default = "default_payment_kind_card")]
    pub kind: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdatePaymentMethodInput {
    pub name: Option<String>,
    pub kind: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct PaymentMethodsQuery {
    pub org_id: String,
    pub is_active: Option<bool>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct PaymentMethodPath {
    pub payment_method_id: String,
}

// ---------------------------------------------------------------------------
// Team chat
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateChatMessageInput {
    pub organization_id: String,
    #[serde(default = "default_chat_channel_general")]
    pub channel: String,
    #[validate(length(min = 1, max = 4000))]
    pub body: String,
    pub reply_to_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ChatMessagesQuery {
    pub org_id: String,
    pub channel: Option<String>,
    #[serde(default = "default_limit_50")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ChatMessagePath {
    pub message_id: String,
}

// ---------------------------------------------------------------------------
// Document templates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateDocumentTemplateInput {
    pub organization_id: String,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub kind: String,
    pub body: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateDocumentTemplateInput {
    pub name: Option<String>,
    pub kind: Option<String>,
    pub body: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct DocumentTemplatesQuery {
    pub org_id: String,
    pub kind: Option<String>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct DocumentTemplatePath {
    pub template_id: String,
}

// ---------------------------------------------------------------------------
// Attendance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateAttendanceInput {
    pub organization_id: String,
    #[validate(email)]
    pub member_email: String,
    pub work_date: String,
    #[serde(default = "default_attendance_present")]
    pub status: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateAttendanceInput {
    pub status: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct AttendanceQuery {
    pub org_id: String,
    pub member_email: Option<String>,
    pub work_date__gte: Option<String>,
    pub work_date__lte: Option<String>,
    #[serde(default = "default_limit_200")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct AttendancePath {
    pub record_id: String,
}

// ---------------------------------------------------------------------------
// Sheet sync
// ---------------------------------------------------------------------------

/// One streamed sync job. Exists only for the duration of the response; the
/// only persistent trace is the per-(sheet, table) checkpoint cursor.
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct SyncJobRequest {
    pub organization_id: String,
    pub spreadsheet_id: String,
    pub sheet_name: String,
    pub target_table: String,
    pub column_mapping: BTreeMap<String, String>,
    #[serde(default = "default_false")]
    pub enable_incremental_sync: bool,
    #[serde(default = "default_false")]
    pub truncate_table: bool,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct SyncCheckpointsQuery {
    pub org_id: String,
    pub target_table: Option<String>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{remove_nulls, serialize_to_map, SyncJobRequest, UpdateTourInput};

    #[test]
    fn patch_payloads_drop_null_fields() {
        let patch = UpdateTourInput {
            name: Some("Harbor Cruise".to_string()),
            code: None,
            description: None,
            adult_price: Some(120.0),
            child_price: None,
            infant_price: None,
            not_included_price: None,
            child_ratio: None,
            infant_ratio: None,
            is_sale_available: None,
            is_active: None,
        };
        let map = remove_nulls(serialize_to_map(&patch));
        assert_eq!(map.len(), 2);
        assert_eq!(map["name"], json!("Harbor Cruise"));
        assert_eq!(map["adult_price"], json!(120.0));
    }

    #[test]
    fn sync_request_defaults_flags_off() {
        let request: SyncJobRequest = serde_json::from_value(json!({
            "organization_id": "550e8400-e29b-41d4-a716-446655440000",
            "spreadsheet_id": "abc",
            "sheet_name": "Team",
            "target_table": "team",
            "column_mapping": {"Email": "email"}
        }))
        .unwrap();
        assert!(!request.enable_incremental_sync);
        assert!(!request.truncate_table);
    }
}
