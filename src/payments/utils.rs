use crate::payments::error::{PaymentError, PaymentResult};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::{debug, warn};

/// Credentials attached to a single gateway call.
#[derive(Debug, Clone, Copy)]
pub enum GatewayAuth<'a> {
    Basic {
        username: &'a str,
        password: &'a str,
    },
    Bearer(&'a str),
}

/// One outbound call: what it is called in logs and errors, and how long it may take.
#[derive(Debug, Clone, Copy)]
pub struct GatewayCall<'a> {
    pub operation: &'a str,
    pub timeout: Duration,
}

/// Error envelope Daraja returns alongside non-2xx statuses.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GatewayErrorBody {
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

/// Thin JSON client. Makes exactly one attempt per call; the reconciliation
/// paths decide what happens after a failure.
#[derive(Clone)]
pub struct PaymentHttpClient {
    client: Client,
}

impl PaymentHttpClient {
    pub fn new() -> PaymentResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| PaymentError::ConfigurationError {
                message: format!("failed to initialize HTTP client: {}", e),
            })?;

        Ok(Self { client })
    }

    pub async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        call: GatewayCall<'_>,
        auth: GatewayAuth<'_>,
        body: Option<&JsonValue>,
    ) -> PaymentResult<T> {
        let mut request = self.client.request(method, url).timeout(call.timeout);

        request = match auth {
            GatewayAuth::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            GatewayAuth::Bearer(token) => request.bearer_auth(token),
        };
        if let Some(payload) = body {
            request = request.json(payload);
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(call, e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| transport_error(call, e))?;

        if status.is_success() {
            debug!(operation = call.operation, status = %status, "gateway call succeeded");
            return serde_json::from_str::<T>(&text).map_err(|e| {
                PaymentError::GatewayUnavailable {
                    message: format!("{}: undecodable gateway response: {}", call.operation, e),
                }
            });
        }

        warn!(
            operation = call.operation,
            status = %status,
            "gateway returned non-success status"
        );

        match serde_json::from_str::<GatewayErrorBody>(&text) {
            Ok(GatewayErrorBody {
                request_id,
                error_code: Some(code),
                error_message,
            }) => {
                debug!(
                    operation = call.operation,
                    request_id = request_id.as_deref().unwrap_or(""),
                    error_code = %code,
                    "gateway error envelope"
                );
                Err(PaymentError::GatewayRejected {
                    description: error_message.unwrap_or_else(|| format!("HTTP {}", status)),
                    code: Some(code),
                })
            }
            _ => Err(PaymentError::GatewayUnavailable {
                message: format!("{}: HTTP {}", call.operation, status),
            }),
        }
    }
}

fn transport_error(call: GatewayCall<'_>, err: reqwest::Error) -> PaymentError {
    if err.is_timeout() {
        PaymentError::GatewayTimeout {
            operation: call.operation.to_string(),
            timeout_secs: call.timeout.as_secs(),
        }
    } else {
        PaymentError::GatewayUnavailable {
            message: format!("{}: {}", call.operation, err),
        }
    }
}

/// Joins a base URL and an absolute path without doubling the slash.
pub fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
