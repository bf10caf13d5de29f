use crate::config::{parse_or, ConfigError};
use crate::logging::mask_phone_number;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentGateway;
use crate::payments::token_cache::{AccessToken, AccessTokenCache};
use crate::payments::types::{
    CorrelationIds, PaymentOutcome, ProviderName, SubmitRequest, SubmitResponse,
};
use crate::payments::utils::{truncate_reference, HttpReply, PaymentHttpClient, RequestAuth};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Query error code Daraja returns while the subscriber has not answered yet.
pub const STILL_PROCESSING_CODE: &str = "500.001.1001";

const ACCOUNT_REFERENCE_MAX_CHARS: usize = 12;
const DESCRIPTION_MAX_CHARS: usize = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpesaEnvironment {
    Sandbox,
    Production,
    /// No network calls; the sandbox test double stands in for the provider
    Simulation,
}

impl MpesaEnvironment {
    pub fn base_url(&self) -> &'static str {
        match self {
            MpesaEnvironment::Production => "https://api.safaricom.co.ke",
            MpesaEnvironment::Sandbox | MpesaEnvironment::Simulation => {
                "https://sandbox.safaricom.co.ke"
            }
        }
    }
}

impl FromStr for MpesaEnvironment {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "sandbox" => Ok(MpesaEnvironment::Sandbox),
            "production" | "live" => Ok(MpesaEnvironment::Production),
            "simulation" | "simulate" => Ok(MpesaEnvironment::Simulation),
            _ => Err(ConfigError::InvalidValue("MPESA_ENVIRONMENT".to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MpesaConfig {
    pub environment: MpesaEnvironment,
    pub base_url: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub passkey: String,
    pub short_code: String,
    pub callback_url: String,
    pub request_timeout_secs: u64,
    /// Refresh the OAuth token this long before it expires
    pub token_refresh_margin_secs: u64,
}

impl Default for MpesaConfig {
    fn default() -> Self {
        Self {
            environment: MpesaEnvironment::Simulation,
            base_url: MpesaEnvironment::Simulation.base_url().to_string(),
            consumer_key: String::new(),
            consumer_secret: String::new(),
            passkey: String::new(),
            short_code: "174379".to_string(),
            callback_url: String::new(),
            request_timeout_secs: 30,
            token_refresh_margin_secs: 300,
        }
    }
}

impl MpesaConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let environment = match std::env::var("MPESA_ENVIRONMENT") {
            Ok(raw) => raw.parse::<MpesaEnvironment>()?,
            Err(_) => defaults.environment,
        };

        Ok(Self {
            environment,
            base_url: std::env::var("MPESA_BASE_URL")
                .unwrap_or_else(|_| environment.base_url().to_string()),
            consumer_key: std::env::var("MPESA_CONSUMER_KEY").unwrap_or_default(),
            consumer_secret: std::env::var("MPESA_CONSUMER_SECRET").unwrap_or_default(),
            passkey: std::env::var("MPESA_PASSKEY").unwrap_or_default(),
            short_code: std::env::var("MPESA_SHORT_CODE").unwrap_or(defaults.short_code),
            callback_url: std::env::var("MPESA_CALLBACK_URL").unwrap_or_default(),
            request_timeout_secs: parse_or(
                "MPESA_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout_secs,
            )?,
            token_refresh_margin_secs: parse_or(
                "MPESA_TOKEN_REFRESH_MARGIN_SECS",
                defaults.token_refresh_margin_secs,
            )?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.environment == MpesaEnvironment::Simulation {
            return Ok(());
        }

        for (key, value) in [
            ("MPESA_CONSUMER_KEY", &self.consumer_key),
            ("MPESA_CONSUMER_SECRET", &self.consumer_secret),
            ("MPESA_PASSKEY", &self.passkey),
            ("MPESA_SHORT_CODE", &self.short_code),
            ("MPESA_CALLBACK_URL", &self.callback_url),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingVariable(key.to_string()));
            }
        }

        if !self.callback_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue(
                "MPESA_CALLBACK_URL must be an https URL".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    access_token: String,
    /// Seconds, sent as a string
    expires_in: String,
}

#[derive(Debug, Serialize)]
struct StkPushRequest {
    #[serde(rename = "BusinessShortCode")]
    business_short_code: String,
    #[serde(rename = "Password")]
    password: String,
    #[serde(rename = "Timestamp")]
    timestamp: String,
    #[serde(rename = "TransactionType")]
    transaction_type: &'static str,
    #[serde(rename = "Amount")]
    amount: i64,
    #[serde(rename = "PartyA")]
    party_a: String,
    #[serde(rename = "PartyB")]
    party_b: String,
    #[serde(rename = "PhoneNumber")]
    phone_number: String,
    #[serde(rename = "CallBackURL")]
    callback_url: String,
    #[serde(rename = "AccountReference")]
    account_reference: String,
    #[serde(rename = "TransactionDesc")]
    transaction_desc: String,
}

#[derive(Debug, Deserialize)]
struct StkPushResponse {
    #[serde(rename = "MerchantRequestID")]
    merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
    #[serde(rename = "ResponseCode")]
    response_code: String,
    #[serde(rename = "ResponseDescription", default)]
    response_description: String,
    #[serde(rename = "CustomerMessage", default)]
    customer_message: Option<String>,
}

#[derive(Debug, Serialize)]
struct StkQueryRequest {
    #[serde(rename = "BusinessShortCode")]
    business_short_code: String,
    #[serde(rename = "Password")]
    password: String,
    #[serde(rename = "Timestamp")]
    timestamp: String,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
}

#[derive(Debug, Deserialize)]
struct StkQueryResponse {
    #[serde(rename = "ResultCode")]
    result_code: JsonValue,
    #[serde(rename = "ResultDesc", default)]
    result_desc: String,
}

/// Error envelope Daraja uses for non-2xx replies.
#[derive(Debug, Default, Deserialize)]
struct DarajaError {
    #[serde(rename = "errorCode", default)]
    error_code: Option<String>,
    #[serde(rename = "errorMessage", default)]
    error_message: Option<String>,
}

/// Safaricom Daraja STK-push gateway.
pub struct MpesaGateway {
    config: MpesaConfig,
    http: PaymentHttpClient,
    tokens: Arc<AccessTokenCache>,
}

impl MpesaGateway {
    pub fn new(config: MpesaConfig, tokens: Arc<AccessTokenCache>) -> PaymentResult<Self> {
        let http = PaymentHttpClient::new(Duration::from_secs(config.request_timeout_secs))?;
        Ok(Self {
            config,
            http,
            tokens,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn password(&self, timestamp: &str) -> String {
        stk_password(&self.config.short_code, &self.config.passkey, timestamp)
    }

    async fn access_token(&self) -> PaymentResult<String> {
        self.tokens.get_or_refresh(|| self.fetch_token()).await
    }

    async fn fetch_token(&self) -> PaymentResult<AccessToken> {
        let reply = self
            .http
            .request_json(
                reqwest::Method::GET,
                &self.endpoint("/oauth/v1/generate?grant_type=client_credentials"),
                RequestAuth::Basic {
                    username: &self.config.consumer_key,
                    password: &self.config.consumer_secret,
                },
                None,
            )
            .await?;

        if !reply.is_success() {
            return Err(PaymentError::Authentication {
                message: format!("token request failed with HTTP {}", reply.status),
            });
        }

        let auth: AuthResponse =
            serde_json::from_value(reply.body).map_err(|e| PaymentError::Provider {
                provider: ProviderName::Mpesa.to_string(),
                message: format!("malformed token response: {}", e),
                provider_code: None,
                retryable: true,
            })?;
        let ttl_secs = auth.expires_in.trim().parse::<i64>().unwrap_or(3599);

        Ok(AccessToken {
            value: auth.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(ttl_secs),
        })
    }

    /// POST with a bearer token; a 401 drops the cached token so the next call refreshes it.
    async fn post_authorized(&self, path: &str, body: &JsonValue) -> PaymentResult<HttpReply> {
        let token = self.access_token().await?;
        let result = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint(path),
                RequestAuth::Bearer(&token),
                Some(body),
            )
            .await;

        if let Err(PaymentError::Authentication { .. }) = &result {
            warn!("provider rejected access token; invalidating cache");
            self.tokens.invalidate().await;
        }
        result
    }
}

#[async_trait]
impl PaymentGateway for MpesaGateway {
    async fn submit(&self, request: SubmitRequest) -> PaymentResult<SubmitResponse> {
        let timestamp = daraja_timestamp(Utc::now());
        let payload = StkPushRequest {
            business_short_code: self.config.short_code.clone(),
            password: self.password(&timestamp),
            timestamp,
            transaction_type: "CustomerPayBillOnline",
            amount: request.amount,
            party_a: request.phone_number.clone(),
            party_b: self.config.short_code.clone(),
            phone_number: request.phone_number.clone(),
            callback_url: request
                .callback_url
                .clone()
                .unwrap_or_else(|| self.config.callback_url.clone()),
            account_reference: truncate_reference(
                &request.account_reference,
                ACCOUNT_REFERENCE_MAX_CHARS,
            ),
            transaction_desc: truncate_reference(&request.description, DESCRIPTION_MAX_CHARS),
        };
        let body = serde_json::to_value(&payload).map_err(|e| PaymentError::Validation {
            message: format!("failed to encode STK push request: {}", e),
            field: None,
        })?;

        debug!(
            phone = %mask_phone_number(&request.phone_number),
            amount = request.amount,
            "sending STK push"
        );
        let reply = self
            .post_authorized("/mpesa/stkpush/v1/processrequest", &body)
            .await?;

        if reply.is_success() {
            let parsed: StkPushResponse =
                serde_json::from_value(reply.body).map_err(|e| PaymentError::Provider {
                    provider: ProviderName::Mpesa.to_string(),
                    message: format!("malformed STK push response: {}", e),
                    provider_code: None,
                    retryable: true,
                })?;

            if parsed.response_code.trim() != "0" {
                return Ok(SubmitResponse::Rejected {
                    code: Some(parsed.response_code),
                    message: parsed.response_description,
                });
            }

            info!(
                merchant_request_id = %parsed.merchant_request_id,
                checkout_request_id = %parsed.checkout_request_id,
                "STK push accepted"
            );
            return Ok(SubmitResponse::Accepted {
                correlation_ids: CorrelationIds {
                    merchant_request_id: parsed.merchant_request_id,
                    checkout_request_id: parsed.checkout_request_id,
                },
                customer_message: parsed.customer_message,
            });
        }

        let error = daraja_error(&reply);
        if (400..500).contains(&reply.status) {
            Ok(SubmitResponse::Rejected {
                code: error.error_code,
                message: error
                    .error_message
                    .unwrap_or_else(|| format!("HTTP {}", reply.status)),
            })
        } else {
            Err(PaymentError::Provider {
                provider: ProviderName::Mpesa.to_string(),
                message: error
                    .error_message
                    .unwrap_or_else(|| format!("HTTP {}", reply.status)),
                provider_code: error.error_code,
                retryable: true,
            })
        }
    }

    async fn query(&self, correlation_ids: &CorrelationIds) -> PaymentResult<PaymentOutcome> {
        let timestamp = daraja_timestamp(Utc::now());
        let payload = StkQueryRequest {
            business_short_code: self.config.short_code.clone(),
            password: self.password(&timestamp),
            timestamp,
            checkout_request_id: correlation_ids.checkout_request_id.clone(),
        };
        let body = serde_json::to_value(&payload).map_err(|e| PaymentError::Validation {
            message: format!("failed to encode STK query request: {}", e),
            field: None,
        })?;

        let reply = self
            .post_authorized("/mpesa/stkpushquery/v1/query", &body)
            .await?;

        if !reply.is_success() {
            let error = daraja_error(&reply);
            if error.error_code.as_deref() == Some(STILL_PROCESSING_CODE) {
                return Ok(PaymentOutcome::StillProcessing);
            }
            return Err(PaymentError::Provider {
                provider: ProviderName::Mpesa.to_string(),
                message: error
                    .error_message
                    .unwrap_or_else(|| format!("HTTP {}", reply.status)),
                provider_code: error.error_code,
                retryable: true,
            });
        }

        let parsed: StkQueryResponse =
            serde_json::from_value(reply.body).map_err(|e| PaymentError::Provider {
                provider: ProviderName::Mpesa.to_string(),
                message: format!("malformed STK query response: {}", e),
                provider_code: None,
                retryable: true,
            })?;
        let result_code = parse_result_code(&parsed.result_code).ok_or_else(|| {
            PaymentError::Provider {
                provider: ProviderName::Mpesa.to_string(),
                message: format!("unreadable ResultCode {}", parsed.result_code),
                provider_code: None,
                retryable: true,
            }
        })?;

        // The query reply carries no receipt; the checkout id stands in for it.
        Ok(PaymentOutcome::from_result(
            result_code,
            &parsed.result_desc,
            None,
            None,
            None,
            &correlation_ids.checkout_request_id,
        ))
    }

    fn name(&self) -> ProviderName {
        ProviderName::Mpesa
    }
}

fn daraja_error(reply: &HttpReply) -> DarajaError {
    serde_json::from_value(reply.body.clone()).unwrap_or_default()
}

/// `YYYYMMDDHHMMSS`, the timestamp format Daraja signs passwords with.
pub fn daraja_timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H%M%S").to_string()
}

/// base64(shortcode + passkey + timestamp)
pub fn stk_password(short_code: &str, passkey: &str, timestamp: &str) -> String {
    BASE64.encode(format!("{}{}{}", short_code, passkey, timestamp))
}

fn parse_result_code(value: &JsonValue) -> Option<i32> {
    match value {
        JsonValue::Number(n) => n.as_i64().and_then(|v| i32::try_from(v).ok()),
        JsonValue::String(s) => s.trim().parse::<i32>().ok(),
        _ => None,
    }
}
