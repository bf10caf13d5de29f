use crate::payments::error::{PaymentError, PaymentResult};
use regex::Regex;
use reqwest::{Client, Method};
use serde_json::Value as JsonValue;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::warn;

static SUBSCRIBER_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^254(7|1)\d{8}$").expect("subscriber number regex is valid"));

/// Normalize a Kenyan subscriber number to the `2547XXXXXXXX` / `2541XXXXXXXX` form.
pub fn normalize_phone_number(raw: &str) -> PaymentResult<String> {
    let digits: String = raw
        .trim()
        .trim_start_matches('+')
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
        .collect();

    let candidate = if digits.starts_with("254") && digits.len() == 12 {
        digits
    } else if digits.starts_with('0') && digits.len() == 10 {
        format!("254{}", &digits[1..])
    } else if (digits.starts_with('7') || digits.starts_with('1')) && digits.len() == 9 {
        format!("254{}", digits)
    } else {
        digits
    };

    if SUBSCRIBER_NUMBER.is_match(&candidate) {
        Ok(candidate)
    } else {
        Err(PaymentError::Validation {
            message: format!("'{}' is not a valid subscriber number", raw.trim()),
            field: Some("phone_number".to_string()),
        })
    }
}

/// Keep at most `max_chars` characters, dropping anything that is not
/// alphanumeric, a space or a dash.
pub fn truncate_reference(value: &str, max_chars: usize) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == ' ' || *c == '-')
        .take(max_chars)
        .collect::<String>()
        .trim()
        .to_string()
}

pub enum RequestAuth<'a> {
    None,
    Bearer(&'a str),
    Basic { username: &'a str, password: &'a str },
}

/// Raw provider reply; interpretation of non-2xx bodies is left to the caller
/// because some providers report business states with error statuses.
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub body: JsonValue,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Clone)]
pub struct PaymentHttpClient {
    client: Client,
    timeout: Duration,
}

impl PaymentHttpClient {
    pub fn new(timeout: Duration) -> PaymentResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PaymentError::Network {
                message: format!("failed to initialize HTTP client: {}", e),
            })?;

        Ok(Self { client, timeout })
    }

    pub async fn request_json(
        &self,
        method: Method,
        url: &str,
        auth: RequestAuth<'_>,
        body: Option<&JsonValue>,
    ) -> PaymentResult<HttpReply> {
        let mut request = self.client.request(method, url).timeout(self.timeout);

        request = match auth {
            RequestAuth::None => request,
            RequestAuth::Bearer(token) => request.bearer_auth(token),
            RequestAuth::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
        };
        if let Some(payload) = body {
            request = request.json(payload);
        }

        let response = request.send().await.map_err(|e| self.map_send_error(e))?;
        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let text = response.text().await.map_err(|e| self.map_send_error(e))?;

        if status.as_u16() == 429 {
            return Err(PaymentError::RateLimit {
                message: "provider rate limit exceeded".to_string(),
                retry_after_seconds: retry_after,
            });
        }

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(PaymentError::Authentication {
                message: format!("HTTP {}: {}", status, text),
            });
        }

        let body = serde_json::from_str::<JsonValue>(&text).unwrap_or_else(|_| {
            if !status.is_success() {
                warn!(status = %status, "provider returned a non-JSON error body");
            }
            JsonValue::String(text)
        });

        Ok(HttpReply {
            status: status.as_u16(),
            body,
        })
    }

    fn map_send_error(&self, err: reqwest::Error) -> PaymentError {
        if err.is_timeout() {
            PaymentError::Timeout {
                timeout_secs: self.timeout.as_secs(),
            }
        } else {
            PaymentError::Network {
                message: format!("provider request failed: {}", err),
            }
        }
    }
}
