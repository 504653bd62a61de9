use super::{error::ProviderError, ModelClient};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{header::RETRY_AFTER, Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Provider messages that indicate the input is larger than the model accepts
static CONTEXT_LIMIT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(context[_ ]length|maximum context|too many tokens|prompt is too long|token limit)")
        .expect("Invalid context limit regex")
});

/// Settings for [`HttpModelClient`]
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Full URL requests are POSTed to
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub request_timeout: Duration,
    /// Extra headers sent with every request
    pub headers: HashMap<String, String>,
}

/// JSON-over-HTTP model client (OpenAI-style chat completion endpoints).
///
/// The request body is passed through untouched except for `"model"`, which
/// is set to the endpoint name so one request can be replayed against each
/// fallback model.
pub struct HttpModelClient {
    config: HttpClientConfig,
    client: Client,
}

impl HttpModelClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    type Request = Value;
    type Response = Value;

    async fn invoke(&self, endpoint: &str, request: &Value) -> Result<Value, ProviderError> {
        let mut body = request.clone();
        match body.as_object_mut() {
            Some(obj) => {
                obj.insert("model".to_string(), Value::String(endpoint.to_string()));
            }
            None => {
                return Err(ProviderError::InvalidRequest(
                    "request body must be a JSON object".to_string(),
                ))
            }
        }

        let mut req_builder = self
            .client
            .post(&self.config.base_url)
            .header("Content-Type", "application/json");

        if let Some(ref key) = self.config.api_key {
            req_builder = req_builder.bearer_auth(key.expose_secret());
        }

        for (key, value) in &self.config.headers {
            req_builder = req_builder.header(key, value);
        }

        let response = req_builder.json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(map_status(status, error_text, retry_after));
        }

        let response_text = response.text().await?;
        tracing::debug!("{} response body: {}", endpoint, response_text);

        serde_json::from_str(&response_text).map_err(|e| {
            tracing::error!("Failed to parse {} response: {}", endpoint, e);
            ProviderError::SchemaValidation(e.to_string())
        })
    }
}

/// Map a non-success HTTP status (and body) to a provider error
pub fn map_status(status: StatusCode, body: String, retry_after: Option<Duration>) -> ProviderError {
    match status.as_u16() {
        401 => ProviderError::Authentication(body),
        403 => ProviderError::PermissionDenied(body),
        402 => ProviderError::QuotaExceeded(body),
        429 if body.contains("insufficient_quota") => ProviderError::QuotaExceeded(body),
        429 => ProviderError::RateLimited { message: body, retry_after },
        400 | 422 if CONTEXT_LIMIT_PATTERN.is_match(&body) => {
            ProviderError::ContextLengthExceeded(body)
        }
        400 | 422 => ProviderError::InvalidRequest(body),
        413 => ProviderError::ContextLengthExceeded(body),
        408 | 504 => ProviderError::Timeout(body),
        503 | 529 => ProviderError::ServiceUnavailable(body),
        code => ProviderError::Upstream { status: code, message: body },
    }
}
