use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::{json, Value};
use sha2::Sha256;

use crate::config::AppConfig;

type HmacSha256 = Hmac<Sha256>;

/// Stripe rejects card charges below this, so the floor is enforced here at
/// the payment boundary rather than inside the pricing pipeline.
pub const MIN_USD_CHARGE: f64 = 0.50;

/// Currencies Stripe treats as zero-decimal: amounts are sent in whole
/// units, not cents.
const ZERO_DECIMAL_CURRENCIES: &[&str] = &["krw", "jpy"];

/// Convert a display amount into the smallest chargeable unit for the given
/// currency: cents for USD, whole units for KRW.
pub fn to_minor_units(amount: f64, currency: &str) -> i64 {
    if ZERO_DECIMAL_CURRENCIES.contains(&currency.to_ascii_lowercase().as_str()) {
        amount.round() as i64
    } else {
        (amount * 100.0).round() as i64
    }
}

/// Apply the minimum-charge floor. Only USD has one; zero-decimal currencies
/// pass through unchanged.
pub fn enforce_minimum_charge(amount: f64, currency: &str) -> f64 {
    if currency.eq_ignore_ascii_case("usd") && amount < MIN_USD_CHARGE {
        return MIN_USD_CHARGE;
    }
    amount
}

/// Create a Stripe Checkout Session for a reservation balance.
pub async fn create_stripe_checkout_session(
    http_client: &Client,
    config: &AppConfig,
    amount: f64,
    currency: &str,
    reference_code: &str,
    guest_name: &str,
    tour_name: &str,
) -> Result<Value, String> {
    let secret_key = config
        .stripe_secret_key
        .as_deref()
        .filter(|key| !key.is_empty())
        .ok_or_else(|| "STRIPE_SECRET_KEY not configured".to_string())?;

    let charge_amount = enforce_minimum_charge(amount, currency);
    let stripe_amount = to_minor_units(charge_amount, currency);
    let currency_lower = currency.to_lowercase();

    let success_url = format!(
        "{}/pay/{}?status=success",
        config.app_public_url, reference_code
    );
    let cancel_url = format!(
        "{}/pay/{}?status=cancelled",
        config.app_public_url, reference_code
    );

    let description = if guest_name.is_empty() {
        format!("Reservation {reference_code} — {tour_name}")
    } else {
        format!("Reservation {reference_code} — {guest_name} — {tour_name}")
    };

    let response = http_client
        .post("https://api.stripe.com/v1/checkout/sessions")
        .basic_auth(secret_key, None::<&str>)
        .form(&[
            ("mode", "payment"),
            ("payment_method_types[]", "card"),
            ("line_items[0][price_data][currency]", &currency_lower),
            (
                "line_items[0][price_data][unit_amount]",
                &stripe_amount.to_string(),
            ),
            (
                "line_items[0][price_data][product_data][name]",
                &description,
            ),
            ("line_items[0][quantity]", "1"),
            ("success_url", &success_url),
            ("cancel_url", &cancel_url),
            ("metadata[reference_code]", reference_code),
        ])
        .send()
        .await
        .map_err(|error| {
            tracing::error!(error = %error, "Stripe API request failed");
            "Stripe API request failed.".to_string()
        })?;

    let status = response.status();
    let body: Value = response
        .json()
        .await
        .unwrap_or(json!({"error": "failed to parse response"}));

    if status.is_success() {
        Ok(body)
    } else {
        let message = body
            .get("error")
            .and_then(|error| error.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("Unknown Stripe error");
        Err(format!("Stripe API error ({status}): {message}"))
    }
}

/// Verify a Stripe webhook signature (`Stripe-Signature: t=<ts>,v1=<hex>`).
/// HMAC-SHA256 over `"{ts}.{body}"`, constant-time comparison, and a
/// 5-minute staleness window against replays.
pub fn verify_stripe_signature(
    payload: &str,
    signature_header: &str,
    webhook_secret: &str,
) -> bool {
    const TOLERANCE_SECS: i64 = 300;

    let mut timestamp: Option<&str> = None;
    let mut signature: Option<&str> = None;
    for part in signature_header.split(',') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix("t=") {
            timestamp = Some(value);
        } else if let Some(value) = part.strip_prefix("v1=") {
            signature = Some(value);
        }
    }

    let (Some(ts_str), Some(expected_hex)) = (timestamp, signature) else {
        return false;
    };
    let Ok(ts) = ts_str.parse::<i64>() else {
        return false;
    };

    let now = chrono::Utc::now().timestamp();
    if (now - ts).abs() > TOLERANCE_SECS {
        tracing::warn!(delta = (now - ts).abs(), "Stripe webhook signature too old");
        return false;
    }

    let signed_payload = format!("{ts_str}.{payload}");
    let Ok(mut mac) = HmacSha256::new_from_slice(webhook_secret.as_bytes()) else {
        return false;
    };
    mac.update(signed_payload.as_bytes());

    let Ok(expected_bytes) = hex_decode(expected_hex) else {
        return false;
    };
    mac.verify_slice(&expected_bytes).is_ok()
}

fn hex_decode(hex: &str) -> Result<Vec<u8>, ()> {
    if hex.len() % 2 != 0 {
        return Err(());
    }
    (0..hex.len())
        .step_by(2)
        .map(|index| u8::from_str_radix(&hex[index..index + 2], 16).map_err(|_| ()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{enforce_minimum_charge, to_minor_units, verify_stripe_signature, MIN_USD_CHARGE};

    #[test]
    fn usd_converts_to_cents() {
        assert_eq!(to_minor_units(92.0, "USD"), 9200);
        assert_eq!(to_minor_units(123.45, "usd"), 12345);
        assert_eq!(to_minor_units(0.50, "USD"), 50);
    }

    #[test]
    fn krw_charges_whole_units() {
        assert_eq!(to_minor_units(125000.0, "KRW"), 125000);
        assert_eq!(to_minor_units(1234.4, "krw"), 1234);
    }

    #[test]
    fn minimum_floor_applies_to_usd_only() {
        assert_eq!(enforce_minimum_charge(0.10, "USD"), MIN_USD_CHARGE);
        assert_eq!(enforce_minimum_charge(0.50, "USD"), 0.50);
        assert_eq!(enforce_minimum_charge(92.0, "USD"), 92.0);
        assert_eq!(enforce_minimum_charge(100.0, "KRW"), 100.0);
    }

    #[test]
    fn rejects_malformed_signature_headers() {
        assert!(!verify_stripe_signature("{}", "", "whsec_test"));
        assert!(!verify_stripe_signature("{}", "t=abc,v1=00", "whsec_test"));
        assert!(!verify_stripe_signature("{}", "v1=00", "whsec_test"));
        // Stale timestamp fails before any HMAC work.
        assert!(!verify_stripe_signature("{}", "t=1000000,v1=00", "whsec_test"));
    }
}
