use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::StkPushGateway;
use crate::payments::request_builder::{BuilderLimits, PasswordSigner, StkPushBuilder};
use crate::payments::token_cache::{CredentialCache, CredentialSource, IssuedCredential};
use crate::payments::types::{
    PaymentRequest, PushAcknowledgement, ResultCode, StatusQueryResult, SUCCESS_CODE,
};
use crate::payments::utils::{join_url, GatewayAuth, GatewayCall, PaymentHttpClient};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

const AUTH_PATH: &str = "/oauth/v1/generate?grant_type=client_credentials";
const STK_PUSH_PATH: &str = "/mpesa/stkpush/v1/processrequest";
const STK_QUERY_PATH: &str = "/mpesa/stkpushquery/v1/query";

#[derive(Debug, Clone)]
pub struct MpesaConfig {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub passkey: String,
    pub short_code: String,
    pub callback_url: String,
    pub base_url: String,
    pub transaction_type: String,
    pub country_prefix: String,
    pub min_amount: i64,
    pub max_amount: i64,
    pub default_description: String,
    pub auth_timeout_secs: u64,
    pub push_timeout_secs: u64,
    pub query_timeout_secs: u64,
    pub token_refresh_margin_secs: i64,
}

impl Default for MpesaConfig {
    fn default() -> Self {
        Self {
            consumer_key: String::new(),
            consumer_secret: String::new(),
            passkey: String::new(),
            short_code: String::new(),
            callback_url: String::new(),
            base_url: "https://sandbox.safaricom.co.ke".to_string(),
            transaction_type: "CustomerPayBillOnline".to_string(),
            country_prefix: "254".to_string(),
            min_amount: 1,
            max_amount: 150_000,
            default_description: "Payment for goods/services".to_string(),
            auth_timeout_secs: 10,
            push_timeout_secs: 30,
            query_timeout_secs: 10,
            token_refresh_margin_secs: 60,
        }
    }
}

impl MpesaConfig {
    pub fn from_env() -> PaymentResult<Self> {
        let defaults = Self::default();
        let config = Self {
            consumer_key: required_env("MPESA_CONSUMER_KEY")?,
            consumer_secret: required_env("MPESA_CONSUMER_SECRET")?,
            passkey: required_env("MPESA_PASSKEY")?,
            short_code: required_env("MPESA_SHORT_CODE")?,
            callback_url: required_env("MPESA_CALLBACK_URL")?,
            base_url: std::env::var("MPESA_BASE_URL").unwrap_or(defaults.base_url),
            transaction_type: std::env::var("MPESA_TRANSACTION_TYPE")
                .unwrap_or(defaults.transaction_type),
            country_prefix: std::env::var("MPESA_COUNTRY_PREFIX")
                .unwrap_or(defaults.country_prefix),
            min_amount: env_or("MPESA_MIN_AMOUNT", defaults.min_amount),
            max_amount: env_or("MPESA_MAX_AMOUNT", defaults.max_amount),
            default_description: std::env::var("MPESA_TRANSACTION_DESC")
                .unwrap_or(defaults.default_description),
            auth_timeout_secs: env_or("MPESA_AUTH_TIMEOUT_SECS", defaults.auth_timeout_secs),
            push_timeout_secs: env_or("MPESA_PUSH_TIMEOUT_SECS", defaults.push_timeout_secs),
            query_timeout_secs: env_or("MPESA_QUERY_TIMEOUT_SECS", defaults.query_timeout_secs),
            token_refresh_margin_secs: env_or(
                "MPESA_TOKEN_REFRESH_MARGIN_SECS",
                defaults.token_refresh_margin_secs,
            ),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PaymentResult<()> {
        let required = [
            ("MPESA_CONSUMER_KEY", &self.consumer_key),
            ("MPESA_CONSUMER_SECRET", &self.consumer_secret),
            ("MPESA_PASSKEY", &self.passkey),
            ("MPESA_SHORT_CODE", &self.short_code),
            ("MPESA_CALLBACK_URL", &self.callback_url),
            ("MPESA_BASE_URL", &self.base_url),
        ];
        if let Some((name, _)) = required.iter().find(|(_, v)| v.trim().is_empty()) {
            return Err(PaymentError::ConfigurationError {
                message: format!("{} must not be empty", name),
            });
        }
        if self.country_prefix.is_empty() || !self.country_prefix.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(PaymentError::ConfigurationError {
                message: "MPESA_COUNTRY_PREFIX must be numeric".to_string(),
            });
        }
        if self.min_amount < 1 || self.min_amount > self.max_amount {
            return Err(PaymentError::ConfigurationError {
                message: format!(
                    "invalid amount bounds: min {} max {}",
                    self.min_amount, self.max_amount
                ),
            });
        }
        if self.auth_timeout_secs == 0 || self.push_timeout_secs == 0 || self.query_timeout_secs == 0
        {
            return Err(PaymentError::ConfigurationError {
                message: "gateway timeouts must be greater than zero".to_string(),
            });
        }
        if self.token_refresh_margin_secs < 0 {
            return Err(PaymentError::ConfigurationError {
                message: "MPESA_TOKEN_REFRESH_MARGIN_SECS must not be negative".to_string(),
            });
        }
        self.refresh_margin()?;
        Ok(())
    }

    fn refresh_margin(&self) -> PaymentResult<chrono::Duration> {
        chrono::Duration::try_seconds(self.token_refresh_margin_secs).ok_or_else(|| {
            PaymentError::ConfigurationError {
                message: "MPESA_TOKEN_REFRESH_MARGIN_SECS is out of range".to_string(),
            }
        })
    }

    pub fn signer(&self) -> PasswordSigner {
        PasswordSigner::new(self.short_code.clone(), self.passkey.clone())
    }

    pub fn builder_limits(&self) -> BuilderLimits {
        BuilderLimits {
            country_prefix: self.country_prefix.clone(),
            min_amount: self.min_amount,
            max_amount: self.max_amount,
            default_description: self.default_description.clone(),
        }
    }

    pub fn request_builder(&self) -> StkPushBuilder {
        StkPushBuilder::new(self.signer(), self.builder_limits())
    }
}

fn required_env(name: &str) -> PaymentResult<String> {
    std::env::var(name).map_err(|_| PaymentError::ConfigurationError {
        message: format!("{} environment variable is required", name),
    })
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AuthResponse {
    #[serde(default)]
    access_token: String,
    #[serde(deserialize_with = "seconds_from_string_or_number")]
    expires_in: i64,
}

impl AuthResponse {
    fn into_issued(self) -> PaymentResult<IssuedCredential> {
        let expires_in = chrono::Duration::try_seconds(self.expires_in).ok_or_else(|| {
            PaymentError::AuthenticationFailure {
                message: format!(
                    "auth endpoint returned an out-of-range expiry: {}",
                    self.expires_in
                ),
            }
        })?;
        Ok(IssuedCredential {
            access_token: self.access_token,
            expires_in,
        })
    }
}

fn seconds_from_string_or_number<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Int(secs) => Ok(secs),
        Raw::Text(secs) => secs.trim().parse::<i64>().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Serialize)]
struct StkPushRequestBody<'a> {
    #[serde(rename = "BusinessShortCode")]
    business_short_code: &'a str,
    #[serde(rename = "Password")]
    password: &'a str,
    #[serde(rename = "Timestamp")]
    timestamp: &'a str,
    #[serde(rename = "TransactionType")]
    transaction_type: &'a str,
    #[serde(rename = "Amount")]
    amount: i64,
    #[serde(rename = "PartyA")]
    party_a: &'a str,
    #[serde(rename = "PartyB")]
    party_b: &'a str,
    #[serde(rename = "PhoneNumber")]
    phone_number: &'a str,
    #[serde(rename = "CallBackURL")]
    callback_url: &'a str,
    #[serde(rename = "AccountReference")]
    account_reference: &'a str,
    #[serde(rename = "TransactionDesc")]
    transaction_desc: &'a str,
}

#[derive(Debug, Deserialize)]
struct StkPushResponseBody {
    #[serde(rename = "MerchantRequestID", default)]
    merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID", default)]
    checkout_request_id: String,
    #[serde(rename = "ResponseCode", default)]
    response_code: String,
    #[serde(rename = "ResponseDescription", default)]
    response_description: String,
    #[serde(rename = "CustomerMessage", default)]
    customer_message: Option<String>,
}

#[derive(Debug, Serialize)]
struct StkQueryRequestBody<'a> {
    #[serde(rename = "BusinessShortCode")]
    business_short_code: &'a str,
    #[serde(rename = "Password")]
    password: &'a str,
    #[serde(rename = "Timestamp")]
    timestamp: &'a str,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct StkQueryResponseBody {
    #[serde(rename = "ResponseCode", default)]
    response_code: Option<String>,
    #[serde(rename = "ResponseDescription", default)]
    response_description: Option<String>,
    #[serde(rename = "ResultCode", default)]
    result_code: Option<ResultCode>,
    #[serde(rename = "ResultDesc", default)]
    result_desc: Option<String>,
}

// ---------------------------------------------------------------------------
// Clients
// ---------------------------------------------------------------------------

/// Fetches bearer credentials from the Daraja OAuth endpoint.
pub struct MpesaAuthClient {
    http: PaymentHttpClient,
    url: String,
    consumer_key: String,
    consumer_secret: String,
    timeout: Duration,
}

impl MpesaAuthClient {
    pub fn new(config: &MpesaConfig, http: PaymentHttpClient) -> Self {
        Self {
            http,
            url: join_url(&config.base_url, AUTH_PATH),
            consumer_key: config.consumer_key.clone(),
            consumer_secret: config.consumer_secret.clone(),
            timeout: Duration::from_secs(config.auth_timeout_secs),
        }
    }
}

#[async_trait]
impl CredentialSource for MpesaAuthClient {
    async fn fetch_credential(&self) -> PaymentResult<IssuedCredential> {
        let response: AuthResponse = self
            .http
            .request_json(
                reqwest::Method::GET,
                &self.url,
                GatewayCall {
                    operation: "oauth_token",
                    timeout: self.timeout,
                },
                GatewayAuth::Basic {
                    username: &self.consumer_key,
                    password: &self.consumer_secret,
                },
                None,
            )
            .await?;

        response.into_issued()
    }
}

pub struct MpesaGateway {
    config: MpesaConfig,
    http: PaymentHttpClient,
    credentials: Arc<CredentialCache>,
    signer: PasswordSigner,
}

impl MpesaGateway {
    pub fn new(config: MpesaConfig) -> PaymentResult<Self> {
        config.validate()?;
        let http = PaymentHttpClient::new()?;
        let auth = Arc::new(MpesaAuthClient::new(&config, http.clone()));
        let credentials = Arc::new(CredentialCache::new(auth, config.refresh_margin()?));
        Ok(Self {
            signer: config.signer(),
            config,
            http,
            credentials,
        })
    }

    pub fn from_env() -> PaymentResult<Self> {
        Self::new(MpesaConfig::from_env()?)
    }

    pub fn credentials(&self) -> Arc<CredentialCache> {
        Arc::clone(&self.credentials)
    }

    fn endpoint(&self, path: &str) -> String {
        join_url(&self.config.base_url, path)
    }
}

#[async_trait]
impl StkPushGateway for MpesaGateway {
    #[instrument(skip(self, request), fields(amount = request.amount_minor_units))]
    async fn initiate_push(&self, request: &PaymentRequest) -> PaymentResult<PushAcknowledgement> {
        let token = self.credentials.get_token().await?;

        let body = StkPushRequestBody {
            business_short_code: self.signer.short_code(),
            password: &request.signature.password,
            timestamp: &request.signature.timestamp,
            transaction_type: &self.config.transaction_type,
            amount: request.amount_minor_units,
            party_a: &request.subscriber_address,
            party_b: self.signer.short_code(),
            phone_number: &request.subscriber_address,
            callback_url: &self.config.callback_url,
            account_reference: &request.account_reference,
            transaction_desc: &request.description,
        };
        let payload = serde_json::to_value(&body).map_err(|e| PaymentError::ConfigurationError {
            message: format!("failed to encode push request: {}", e),
        })?;

        let raw: StkPushResponseBody = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint(STK_PUSH_PATH),
                GatewayCall {
                    operation: "stk_push",
                    timeout: Duration::from_secs(self.config.push_timeout_secs),
                },
                GatewayAuth::Bearer(&token),
                Some(&payload),
            )
            .await?;

        let accepted = raw.response_code.trim() == SUCCESS_CODE;
        if accepted {
            info!(
                checkout_request_id = %raw.checkout_request_id,
                merchant_request_id = %raw.merchant_request_id,
                "stk push accepted by gateway"
            );
        } else {
            warn!(
                response_code = %raw.response_code,
                description = %raw.response_description,
                "stk push not accepted by gateway"
            );
        }

        let description = if raw.response_description.is_empty() {
            raw.customer_message.unwrap_or_default()
        } else {
            raw.response_description
        };

        Ok(PushAcknowledgement {
            accepted,
            response_code: raw.response_code,
            checkout_request_id: raw.checkout_request_id,
            merchant_request_id: raw.merchant_request_id,
            description,
        })
    }

    #[instrument(skip(self))]
    async fn query_status(&self, checkout_request_id: &str) -> PaymentResult<StatusQueryResult> {
        let token = self.credentials.get_token().await?;
        let signature = self.signer.sign_now();

        let body = StkQueryRequestBody {
            business_short_code: self.signer.short_code(),
            password: &signature.password,
            timestamp: &signature.timestamp,
            checkout_request_id,
        };
        let payload = serde_json::to_value(&body).map_err(|e| PaymentError::ConfigurationError {
            message: format!("failed to encode status query: {}", e),
        })?;

        let raw: StkQueryResponseBody = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint(STK_QUERY_PATH),
                GatewayCall {
                    operation: "stk_query",
                    timeout: Duration::from_secs(self.config.query_timeout_secs),
                },
                GatewayAuth::Bearer(&token),
                Some(&payload),
            )
            .await?;

        match raw.result_code {
            Some(result_code) => Ok(StatusQueryResult {
                result_code,
                result_description: raw.result_desc.unwrap_or_default(),
            }),
            None => Err(PaymentError::GatewayRejected {
                code: raw.response_code,
                description: raw
                    .response_description
                    .unwrap_or_else(|| "status query returned no result".to_string()),
            }),
        }
    }
}
