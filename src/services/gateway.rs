use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::services::signature::{SignatureError, SignatureGenerator};

/// Gateway return code signalling success.
const RETURN_CODE_OK: &str = "0000";

/// Redirect targets the gateway sends the payer back to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectUrls {
    pub confirm_url: String,
    pub cancel_url: String,
}

/// One purchasable package within a payment request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    pub id: String,
    pub amount: Decimal,
    pub name: String,
}

/// Outbound request-payment call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub amount: Decimal,
    pub currency: String,
    pub order_id: String,
    pub packages: Vec<Package>,
    pub redirect_urls: RedirectUrls,
}

/// Successful request-payment response. The gateway allocates the
/// transaction id; nothing is persisted locally by this call.
#[derive(Debug, Clone)]
pub struct PaymentRequested {
    pub transaction_id: String,
    pub payment_url: String,
}

/// Successful confirm-payment response with gateway-side details.
#[derive(Debug, Clone)]
pub struct PaymentConfirmation {
    pub transaction_id: String,
    pub details: serde_json::Value,
}

/// Tagged failure surface of the gateway boundary. Nothing else escapes
/// the client: callers use `is_retryable` to distinguish "infra failure,
/// retry" from "business failure, do not retry".
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway configuration error: {0}")]
    Configuration(String),

    #[error("gateway request failed: {0}")]
    Network(String),

    #[error("gateway call timed out")]
    Timeout,

    #[error("gateway returned HTTP {status}")]
    Http { status: u16 },

    /// Gateway-reported business error (declined, expired link, bad
    /// request). Terminal for this attempt.
    #[error("gateway declined ({code}): {message}")]
    Business { code: String, message: String },

    #[error("unexpected gateway response: {0}")]
    InvalidResponse(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout => true,
            Self::Http { status } => *status >= 500 || *status == 429,
            Self::Configuration(_) | Self::Business { .. } | Self::InvalidResponse(_) => false,
        }
    }
}

impl From<SignatureError> for GatewayError {
    fn from(err: SignatureError) -> Self {
        GatewayError::Configuration(err.to_string())
    }
}

/// Seam the reconciler depends on; production uses [`LinePayClient`],
/// tests substitute a scripted mock.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// NOT idempotent: each call may allocate a new gateway transaction.
    /// Callers must only resubmit when the prior attempt definitively
    /// failed before a transaction id was returned.
    async fn request_payment(
        &self,
        request: &PaymentRequest,
    ) -> Result<PaymentRequested, GatewayError>;

    async fn confirm_payment(
        &self,
        transaction_id: &str,
        amount: Decimal,
        currency: &str,
    ) -> Result<PaymentConfirmation, GatewayError>;
}

/// Raw wire envelope: `{returnCode, returnMessage, info}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GatewayEnvelope {
    return_code: String,
    #[serde(default)]
    return_message: String,
    #[serde(default)]
    info: serde_json::Value,
}

#[derive(Clone)]
pub struct LinePayConfig {
    pub channel_id: String,
    pub channel_secret: String,
    pub api_base: String,
    pub timeout: Duration,
}

impl LinePayConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            channel_id: config.gateway_channel_id.clone(),
            channel_secret: config.gateway_channel_secret.clone(),
            api_base: config.gateway_api_base.clone(),
            timeout: Duration::from_secs(config.gateway_timeout_secs),
        }
    }
}

/// HTTP client for the LINE Pay v3 API. Attaches the per-request nonce
/// and HMAC signature headers and converts the loose wire shapes to the
/// strict result types immediately upon receipt.
pub struct LinePayClient {
    http: reqwest::Client,
    channel_id: String,
    api_base: String,
    signer: SignatureGenerator,
}

impl LinePayClient {
    pub fn new(config: LinePayConfig) -> Result<Self, GatewayError> {
        let signer = SignatureGenerator::new(config.channel_secret)?;
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Configuration(e.to_string()))?;

        Ok(Self {
            http,
            channel_id: config.channel_id,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            signer,
        })
    }

    async fn post_signed(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError> {
        let body_text =
            serde_json::to_string(body).map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        let nonce = self.signer.generate_nonce();
        let signature = self.signer.sign(&nonce, &body_text);
        let url = format!("{}{}", self.api_base, path);

        debug!(%url, "calling payment gateway");

        let response = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .header("X-LINE-ChannelId", &self.channel_id)
            .header("X-LINE-Authorization-Nonce", &nonce)
            .header("X-LINE-Authorization", &signature)
            .body(body_text)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout
                } else {
                    GatewayError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        if status.is_server_error() || status.as_u16() == 429 {
            warn!(status = status.as_u16(), "gateway infrastructure failure");
            return Err(GatewayError::Http {
                status: status.as_u16(),
            });
        }

        let envelope: GatewayEnvelope = serde_json::from_str(&text).map_err(|e| {
            if status.is_success() {
                GatewayError::InvalidResponse(e.to_string())
            } else {
                GatewayError::Http {
                    status: status.as_u16(),
                }
            }
        })?;

        if envelope.return_code != RETURN_CODE_OK {
            return Err(GatewayError::Business {
                code: envelope.return_code,
                message: envelope.return_message,
            });
        }

        Ok(envelope.info)
    }
}

/// The gateway serializes transaction ids inconsistently (JSON number in
/// some responses, string in others); normalize to a string.
fn transaction_id_from(info: &serde_json::Value) -> Option<String> {
    match info.get("transactionId") {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl PaymentGateway for LinePayClient {
    async fn request_payment(
        &self,
        request: &PaymentRequest,
    ) -> Result<PaymentRequested, GatewayError> {
        let body = serde_json::to_value(request)
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        let info = self.post_signed("/v3/payments/request", &body).await?;

        let transaction_id = transaction_id_from(&info).ok_or_else(|| {
            GatewayError::InvalidResponse("request response missing transactionId".into())
        })?;
        let payment_url = info
            .get("paymentUrl")
            .and_then(|u| u.get("web"))
            .and_then(|u| u.as_str())
            .ok_or_else(|| {
                GatewayError::InvalidResponse("request response missing paymentUrl.web".into())
            })?
            .to_string();

        Ok(PaymentRequested {
            transaction_id,
            payment_url,
        })
    }

    async fn confirm_payment(
        &self,
        transaction_id: &str,
        amount: Decimal,
        currency: &str,
    ) -> Result<PaymentConfirmation, GatewayError> {
        let body = serde_json::json!({
            "amount": amount,
            "currency": currency,
        });
        let path = format!("/v3/payments/{}/confirm", transaction_id);
        let info = self.post_signed(&path, &body).await?;

        Ok(PaymentConfirmation {
            transaction_id: transaction_id_from(&info)
                .unwrap_or_else(|| transaction_id.to_string()),
            details: info,
        })
    }
}
