//! Validation, normalization and signing of outgoing push requests.

use crate::payments::error::{PaymentError, PaymentResult, ValidationReason};
use crate::payments::types::{PaymentRequest, RequestSignature};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, FixedOffset, Offset, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use std::str::FromStr;

/// Digits that follow the country prefix in a canonical subscriber number.
const SUBSCRIBER_DIGITS: usize = 9;

/// Gateway AccountReference limit.
const MAX_REFERENCE_LEN: usize = 12;

/// Daraja timestamps are East Africa Time (UTC+3).
pub fn gateway_offset() -> FixedOffset {
    FixedOffset::east_opt(3 * 3600).unwrap_or_else(|| Utc.fix())
}

/// `YYYYMMDDHHmmss` in gateway local time.
pub fn gateway_timestamp(now: DateTime<Utc>) -> String {
    now.with_timezone(&gateway_offset())
        .format("%Y%m%d%H%M%S")
        .to_string()
}

/// Produces the per-request password: `base64(shortcode + passkey + timestamp)`.
#[derive(Clone)]
pub struct PasswordSigner {
    short_code: String,
    passkey: String,
}

impl PasswordSigner {
    pub fn new(short_code: impl Into<String>, passkey: impl Into<String>) -> Self {
        Self {
            short_code: short_code.into(),
            passkey: passkey.into(),
        }
    }

    pub fn short_code(&self) -> &str {
        &self.short_code
    }

    pub fn sign_at(&self, now: DateTime<Utc>) -> RequestSignature {
        let timestamp = gateway_timestamp(now);
        let password = BASE64.encode(format!("{}{}{}", self.short_code, self.passkey, timestamp));
        RequestSignature {
            timestamp,
            password,
        }
    }

    pub fn sign_now(&self) -> RequestSignature {
        self.sign_at(Utc::now())
    }
}

/// Limits and identity the builder validates against.
#[derive(Debug, Clone)]
pub struct BuilderLimits {
    pub country_prefix: String,
    pub min_amount: i64,
    pub max_amount: i64,
    pub default_description: String,
}

impl Default for BuilderLimits {
    fn default() -> Self {
        Self {
            country_prefix: "254".to_string(),
            min_amount: 1,
            max_amount: 150_000,
            default_description: "Payment for goods/services".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct StkPushBuilder {
    signer: PasswordSigner,
    limits: BuilderLimits,
}

impl StkPushBuilder {
    pub fn new(signer: PasswordSigner, limits: BuilderLimits) -> Self {
        Self { signer, limits }
    }

    pub fn limits(&self) -> &BuilderLimits {
        &self.limits
    }

    /// Validates the raw inputs and produces a freshly signed request.
    pub fn build(
        &self,
        subscriber_address: &str,
        amount_raw: &str,
        reference: Option<&str>,
    ) -> PaymentResult<PaymentRequest> {
        let subscriber_address =
            normalize_subscriber_address(subscriber_address, &self.limits.country_prefix)?;
        let amount_minor_units =
            parse_amount(amount_raw, self.limits.min_amount, self.limits.max_amount)?;
        let account_reference = match reference.map(str::trim).filter(|r| !r.is_empty()) {
            Some(reference) => validate_reference(reference)?,
            None => subscriber_address.clone(),
        };

        Ok(PaymentRequest {
            subscriber_address,
            amount_minor_units,
            account_reference,
            description: self.limits.default_description.clone(),
            signature: self.signer.sign_now(),
        })
    }
}

/// Brings a subscriber number into the 12-digit `<prefix>7XXXXXXXX` form.
pub fn normalize_subscriber_address(raw: &str, country_prefix: &str) -> PaymentResult<String> {
    let raw = raw.trim();
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());

    let candidate = if raw.len() == SUBSCRIBER_DIGITS + 1 && raw.starts_with('0') && all_digits(raw)
    {
        format!("{}{}", country_prefix, &raw[1..])
    } else if raw.len() == SUBSCRIBER_DIGITS && raw.starts_with('7') && all_digits(raw) {
        format!("{}{}", country_prefix, raw)
    } else if let Some(rest) = raw.strip_prefix('+').filter(|r| r.starts_with(country_prefix)) {
        rest.to_string()
    } else {
        raw.to_string()
    };

    if candidate.len() != country_prefix.len() + SUBSCRIBER_DIGITS
        || !all_digits(&candidate)
        || !candidate.starts_with(country_prefix)
    {
        return Err(PaymentError::validation(
            ValidationReason::InvalidPhoneNumber,
            "phoneNumber",
            format!(
                "Invalid phone number format. Use format: {}7XXXXXXXX",
                country_prefix
            ),
        ));
    }

    Ok(candidate)
}

/// Parses a numeric amount, checks it against `[min, max]` and rounds to whole units.
pub fn parse_amount(raw: &str, min: i64, max: i64) -> PaymentResult<i64> {
    let trimmed = raw.trim();
    let value = Decimal::from_str(trimmed).map_err(|_| {
        PaymentError::validation(
            ValidationReason::InvalidAmount,
            "amount",
            "Amount must be a valid number",
        )
    })?;

    if value < Decimal::from(min) || value > Decimal::from(max) {
        return Err(PaymentError::validation(
            ValidationReason::AmountOutOfRange,
            "amount",
            format!("Amount must be between {} and {}", min, max),
        ));
    }

    value
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| {
            PaymentError::validation(
                ValidationReason::InvalidAmount,
                "amount",
                "Amount must be a valid number",
            )
        })
}

fn validate_reference(reference: &str) -> PaymentResult<String> {
    if reference.chars().count() > MAX_REFERENCE_LEN {
        return Err(PaymentError::validation(
            ValidationReason::InvalidReference,
            "reference",
            format!(
                "Account reference must be at most {} characters",
                MAX_REFERENCE_LEN
            ),
        ));
    }
    Ok(reference.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn builder() -> StkPushBuilder {
        StkPushBuilder::new(
            PasswordSigner::new("174379", "passkey"),
            BuilderLimits::default(),
        )
    }

    fn reason(err: PaymentError) -> ValidationReason {
        match err {
            PaymentError::ValidationError { reason, .. } => reason,
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn accepted_shapes_normalize_to_same_canonical_form() {
        for input in ["0712345678", "712345678", "+254712345678", "254712345678", " 0712345678 "]
        {
            assert_eq!(
                normalize_subscriber_address(input, "254").unwrap(),
                "254712345678",
                "input {:?}",
                input
            );
        }
        assert_eq!(
            normalize_subscriber_address("0112345678", "254").unwrap(),
            "254112345678"
        );
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        for input in [
            "",
            "07123",
            "07123456789",
            "0712-45678",
            "812345678",
            "+255712345678",
            "25471234567a",
            "2547123456789",
            "phone",
        ] {
            let err = normalize_subscriber_address(input, "254").unwrap_err();
            assert_eq!(reason(err), ValidationReason::InvalidPhoneNumber, "input {:?}", input);
        }
    }

    #[test]
    fn amount_validation_and_rounding() {
        assert_eq!(parse_amount("70000", 1, 150_000).unwrap(), 70000);
        assert_eq!(parse_amount("10.5", 1, 150_000).unwrap(), 11);
        assert_eq!(parse_amount("10.49", 1, 150_000).unwrap(), 10);
        assert_eq!(parse_amount("1", 1, 150_000).unwrap(), 1);
        assert_eq!(parse_amount("150000", 1, 150_000).unwrap(), 150000);

        assert_eq!(
            reason(parse_amount("abc", 1, 150_000).unwrap_err()),
            ValidationReason::InvalidAmount
        );
        assert_eq!(
            reason(parse_amount("", 1, 150_000).unwrap_err()),
            ValidationReason::InvalidAmount
        );
        assert_eq!(
            reason(parse_amount("0.5", 1, 150_000).unwrap_err()),
            ValidationReason::AmountOutOfRange
        );
        assert_eq!(
            reason(parse_amount("150001", 1, 150_000).unwrap_err()),
            ValidationReason::AmountOutOfRange
        );
        assert_eq!(
            reason(parse_amount("-5", 1, 150_000).unwrap_err()),
            ValidationReason::AmountOutOfRange
        );
    }

    #[test]
    fn build_uses_reference_or_falls_back_to_subscriber() {
        let request = builder().build("0712345678", "70000", Some("BuyGoods")).unwrap();
        assert_eq!(request.subscriber_address, "254712345678");
        assert_eq!(request.amount_minor_units, 70000);
        assert_eq!(request.account_reference, "BuyGoods");

        let request = builder().build("0712345678", "100", None).unwrap();
        assert_eq!(request.account_reference, "254712345678");

        let err = builder()
            .build("0712345678", "100", Some("a-very-long-reference"))
            .unwrap_err();
        assert_eq!(reason(err), ValidationReason::InvalidReference);
    }

    #[test]
    fn password_encodes_shortcode_passkey_and_timestamp() {
        let signer = PasswordSigner::new("174379", "passkey");
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 9, 30, 15).unwrap();
        let signature = signer.sign_at(now);

        // 09:30:15 UTC is 12:30:15 in Nairobi
        assert_eq!(signature.timestamp, "20260101123015");
        let decoded = BASE64.decode(&signature.password).unwrap();
        assert_eq!(
            String::from_utf8(decoded).unwrap(),
            "174379passkey20260101123015"
        );
    }

    #[test]
    fn signature_changes_with_timestamp() {
        let signer = PasswordSigner::new("174379", "passkey");
        let first = signer.sign_at(Utc.with_ymd_and_hms(2026, 1, 1, 9, 30, 15).unwrap());
        let second = signer.sign_at(Utc.with_ymd_and_hms(2026, 1, 1, 9, 30, 16).unwrap());
        assert_ne!(first.password, second.password);
    }
}
