#![allow(dead_code)]

use async_trait::async_trait;
use llm_resilience::providers::error::ProviderError;
use llm_resilience::providers::ModelClient;
use llm_resilience::resilience::{
    BreakerConfig, BreakerSettings, CircuitBreaker, ErrorLogger, FallbackOrchestrator, RetryPolicy,
};
use llm_resilience::store::{BreakerStore, ErrorLogSink};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How a mock endpoint answers
#[derive(Clone)]
pub enum Behavior {
    Succeed,
    RateLimited,
    Fatal,
    Skippable,
    Unavailable,
    /// Never answers
    Hang,
}

/// Model client with scripted per-endpoint behavior and call counters
#[derive(Default)]
pub struct MockClient {
    behaviors: Mutex<HashMap<String, Behavior>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, endpoint: &str, behavior: Behavior) -> Self {
        self.set(endpoint, behavior);
        self
    }

    pub fn set(&self, endpoint: &str, behavior: Behavior) {
        self.behaviors.lock().unwrap().insert(endpoint.to_string(), behavior);
    }

    pub fn calls(&self, endpoint: &str) -> u32 {
        self.calls.lock().unwrap().get(endpoint).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl ModelClient for MockClient {
    type Request = Value;
    type Response = Value;

    async fn invoke(&self, endpoint: &str, _request: &Value) -> Result<Value, ProviderError> {
        *self.calls.lock().unwrap().entry(endpoint.to_string()).or_insert(0) += 1;
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(endpoint)
            .cloned()
            .unwrap_or(Behavior::Succeed);

        match behavior {
            Behavior::Succeed => Ok(json!({ "model": endpoint, "content": "ok" })),
            Behavior::RateLimited => Err(ProviderError::RateLimited {
                message: "rate limit exceeded".into(),
                retry_after: Some(Duration::from_secs(1)),
            }),
            Behavior::Fatal => Err(ProviderError::Authentication("invalid api key".into())),
            Behavior::Skippable => Err(ProviderError::ContextLengthExceeded("prompt is too long".into())),
            Behavior::Unavailable => Err(ProviderError::ServiceUnavailable("overloaded".into())),
            Behavior::Hang => std::future::pending().await,
        }
    }
}

pub fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
        exponential_base: 2.0,
        jitter: true,
    }
}

pub fn breaker_config(threshold: u32, timeout: Duration) -> BreakerConfig {
    BreakerConfig {
        defaults: BreakerSettings {
            failure_threshold: threshold,
            timeout,
        },
        cache_ttl: Duration::ZERO,
        ..Default::default()
    }
}

pub fn orchestrator(
    client: Arc<MockClient>,
    breakers: Arc<dyn BreakerStore>,
    errors: Arc<dyn ErrorLogSink>,
    config: BreakerConfig,
    max_attempts: u32,
) -> FallbackOrchestrator<MockClient> {
    let breaker = Arc::new(CircuitBreaker::new(breakers, config));
    let logger = ErrorLogger::spawn(errors, 256);
    FallbackOrchestrator::new(client, breaker, logger)
        .with_retry_policy(fast_policy(max_attempts))
        .with_seed(7)
}

pub fn endpoints(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}
