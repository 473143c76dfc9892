use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::error::{CommunicationError, PillowError, Result};

pub const API_BASE: &str = "http://beacon5c.mirahome.net";
pub const LOGIN_ENDPOINT: &str = "/beacon5/client/fastlogin";
pub const GET_DAY_ENDPOINT: &str = "/beacon5/client/beacon/getday";
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The backend's success code, sent either as `"1000"` or `1000`.
pub const SUCCESS_CODE: &str = "1000";

/// JSON-over-POST transport used by the token manager and the report client.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post_json(&self, endpoint: &str, headers: &[(&str, &str)], body: &Value)
        -> Result<Value>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PillowError::communication(base_url, e.into()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn transport_error(&self, endpoint: &str, e: reqwest::Error) -> PillowError {
        if e.is_timeout() {
            PillowError::communication(endpoint, CommunicationError::Timeout(self.timeout))
        } else {
            PillowError::communication(endpoint, e.into())
        }
    }

    async fn check_response(&self, response: reqwest::Response, endpoint: &str) -> Result<String> {
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = if body.is_empty() {
                "Empty response".to_string()
            } else {
                body.chars().take(500).collect::<String>()
            };
            return Err(PillowError::communication(
                endpoint,
                CommunicationError::Status {
                    status: status.as_u16(),
                    message,
                },
            ));
        }

        response
            .text()
            .await
            .map_err(|e| self.transport_error(endpoint, e))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post_json(
        &self,
        endpoint: &str,
        headers: &[(&str, &str)],
        body: &Value,
    ) -> Result<Value> {
        let url = format!("{}{}", self.base_url, endpoint);
        debug!("POST {}", url);

        let mut request = self.client.post(&url).json(body);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.transport_error(endpoint, e))?;

        let text = self.check_response(response, endpoint).await?;
        serde_json::from_str(&text).map_err(|e| {
            PillowError::malformed(
                endpoint,
                format!("{} (body excerpt: {})", e, text.chars().take(200).collect::<String>()),
            )
        })
    }
}

/// Extract the `code` field of a response envelope as text.
pub fn response_code(endpoint: &str, body: &Value) -> Result<String> {
    match body.get("code") {
        Some(Value::String(code)) => Ok(code.trim().to_string()),
        Some(Value::Number(code)) => Ok(code
            .as_i64()
            .map(|c| c.to_string())
            .unwrap_or_else(|| code.to_string())),
        Some(other) => Err(PillowError::malformed(
            endpoint,
            format!("unexpected `code` value {}", other),
        )),
        None => Err(PillowError::malformed(endpoint, "missing `code` field")),
    }
}

/// Extract the `data` field of a response envelope.
pub fn response_data<'a>(endpoint: &str, body: &'a Value) -> Result<&'a Value> {
    match body.get("data") {
        Some(Value::Null) | None => Err(PillowError::malformed(endpoint, "missing `data` field")),
        Some(data) => Ok(data),
    }
}
