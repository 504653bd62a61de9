//! Fallback orchestration across an ordered list of endpoints.
//!
//! For each candidate: ask the breaker, run the model call under the retry
//! policy (retrying only recoverable errors), then either return the
//! response, abort on a fatal error, or record the failure and move on.

use crate::providers::ModelClient;
use crate::resilience::breaker::CircuitBreaker;
use crate::resilience::classifier::{ClassifiedError, Classifier, ErrorSeverity};
use crate::resilience::logger::ErrorLogger;
use crate::resilience::retry::{CancelReason, Retrier, RetryError, RetryPolicy};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why one endpoint did not produce a response
#[derive(Debug, Clone)]
pub enum FailureReason {
    /// Rejected by the breaker; the model client was never called
    CircuitOpen { retry_after: Duration },
    /// The model client failed with this (final) error
    Failed { error: ClassifiedError, attempts: u32 },
}

/// Outcome recorded for one attempted endpoint
#[derive(Debug, Clone)]
pub struct EndpointFailure {
    pub endpoint: String,
    pub reason: FailureReason,
}

impl EndpointFailure {
    pub fn severity(&self) -> Option<ErrorSeverity> {
        match &self.reason {
            FailureReason::Failed { error, .. } => Some(error.severity()),
            FailureReason::CircuitOpen { .. } => None,
        }
    }

    pub fn kind(&self) -> &str {
        match &self.reason {
            FailureReason::Failed { error, .. } => error.kind(),
            FailureReason::CircuitOpen { .. } => "circuit_open",
        }
    }

    /// Model client calls made against this endpoint
    pub fn attempts(&self) -> u32 {
        match &self.reason {
            FailureReason::Failed { attempts, .. } => *attempts,
            FailureReason::CircuitOpen { .. } => 0,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match &self.reason {
            FailureReason::CircuitOpen { retry_after } => Some(*retry_after),
            FailureReason::Failed { .. } => None,
        }
    }
}

impl fmt::Display for EndpointFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            FailureReason::CircuitOpen { retry_after } => write!(
                f,
                "{}: circuit open (retry in {}ms)",
                self.endpoint,
                retry_after.as_millis()
            ),
            FailureReason::Failed { error, attempts } => write!(
                f,
                "{}: {} {} after {} attempt(s): {}",
                self.endpoint,
                error.severity(),
                error.kind(),
                attempts,
                error.message()
            ),
        }
    }
}

/// Every endpoint failed; one entry per attempted endpoint, in order.
#[derive(Debug, Clone)]
pub struct TerminalError {
    pub failures: Vec<EndpointFailure>,
}

impl fmt::Display for TerminalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "all {} endpoint(s) failed", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; {}", failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for TerminalError {}

/// Failure of [`FallbackOrchestrator::invoke`].
#[derive(Debug, Error)]
pub enum InvokeError {
    /// A fatal error stopped the run; later endpoints were not tried
    #[error("fatal error from '{}': {}", error.endpoint(), error.message())]
    Fatal {
        error: ClassifiedError,
        attempts: u32,
        /// Endpoints that failed before the fatal one
        earlier: Vec<EndpointFailure>,
    },

    #[error(transparent)]
    Terminal(TerminalError),

    /// Deadline or cancellation; nothing was recorded against the endpoint
    /// in flight (a half-open trial it held is handed back)
    #[error("invocation {reason}{}", endpoint.as_deref().map(|e| format!(" while calling '{}'", e)).unwrap_or_default())]
    Cancelled {
        reason: CancelReason,
        endpoint: Option<String>,
        earlier: Vec<EndpointFailure>,
    },
}

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Budget for the whole invocation, across all endpoints
    pub deadline: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl InvokeOptions {
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Walks endpoints in order until one succeeds.
pub struct FallbackOrchestrator<C: ModelClient> {
    client: Arc<C>,
    classifier: Arc<Classifier>,
    breaker: Arc<CircuitBreaker>,
    logger: ErrorLogger,
    policy: RetryPolicy,
    seed: Option<u64>,
}

impl<C: ModelClient> FallbackOrchestrator<C> {
    pub fn new(client: Arc<C>, breaker: Arc<CircuitBreaker>, logger: ErrorLogger) -> Self {
        Self {
            client,
            classifier: Arc::new(Classifier::new()),
            breaker,
            logger,
            policy: RetryPolicy::default(),
            seed: None,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<Classifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Fix the jitter seed for every retry run
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn logger(&self) -> &ErrorLogger {
        &self.logger
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Call `endpoints` in order with `request`, returning the first success.
    pub async fn invoke(
        &self,
        endpoints: &[String],
        request: &C::Request,
        options: InvokeOptions,
    ) -> Result<C::Response, InvokeError> {
        let deadline_at = options.deadline.and_then(|d| Instant::now().checked_add(d));
        let cancel = options.cancel.unwrap_or_default();
        let mut failures: Vec<EndpointFailure> = Vec::new();

        for endpoint in endpoints {
            let stop = if cancel.is_cancelled() {
                Some(CancelReason::Cancelled)
            } else if deadline_at.is_some_and(|at| Instant::now() >= at) {
                Some(CancelReason::Deadline)
            } else {
                None
            };
            if let Some(reason) = stop {
                warn!(endpoint = %endpoint, %reason, "Invocation stopped before trying endpoint");
                return Err(InvokeError::Cancelled {
                    reason,
                    endpoint: None,
                    earlier: failures,
                });
            }

            let permit = match self.breaker.admit(endpoint).await {
                Ok(permit) => permit,
                Err(open) => {
                    info!(
                        endpoint = %endpoint,
                        retry_after_ms = open.retry_after.as_millis() as u64,
                        "⏭️  Circuit open, skipping endpoint"
                    );
                    failures.push(EndpointFailure {
                        endpoint: endpoint.clone(),
                        reason: FailureReason::CircuitOpen {
                            retry_after: open.retry_after,
                        },
                    });
                    continue;
                }
            };
            debug!(
                endpoint = %endpoint,
                trial = permit.is_trial(),
                unverified = permit.is_unverified(),
                "Endpoint admitted"
            );

            let mut retrier = Retrier::new(self.policy.clone())
                .cancel_token(cancel.clone())
                .on_failure(|_, err: &ClassifiedError, will_retry| self.logger.log(err, will_retry))
                .on_retry(|attempt, err: &ClassifiedError, delay| {
                    debug!(
                        endpoint = err.endpoint(),
                        attempt,
                        kind = err.kind(),
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after backoff"
                    );
                });
            if let Some(seed) = self.seed {
                retrier = retrier.seed(seed);
            }
            if let Some(at) = deadline_at {
                retrier = retrier.deadline(at.saturating_duration_since(Instant::now()));
            }

            let client = self.client.as_ref();
            let classifier = self.classifier.as_ref();
            let endpoint_name = endpoint.as_str();

            let outcome = retrier
                .run(
                    |err: &ClassifiedError| err.severity() == ErrorSeverity::Recoverable,
                    || async move {
                        client
                            .invoke(endpoint_name, request)
                            .await
                            .map_err(|err| classifier.classify(err, endpoint_name))
                    },
                )
                .await;

            match outcome {
                Ok(response) => {
                    self.breaker.record_success(endpoint).await;
                    info!(
                        endpoint = %endpoint,
                        skipped = failures.len(),
                        "✅ Endpoint succeeded"
                    );
                    return Ok(response);
                }
                Err(RetryError::Cancelled { reason, attempts, .. }) => {
                    warn!(endpoint = %endpoint, %reason, attempts, "Invocation stopped mid-call");
                    self.breaker.release_trial(&permit).await;
                    return Err(InvokeError::Cancelled {
                        reason,
                        endpoint: Some(endpoint.clone()),
                        earlier: failures,
                    });
                }
                Err(RetryError::NonRetryable { error, attempts })
                | Err(RetryError::Exhausted { last_error: error, attempts }) => {
                    if error.severity() == ErrorSeverity::Fatal {
                        error!(
                            endpoint = %endpoint,
                            kind = error.kind(),
                            "❌ Fatal error, aborting fallback chain: {}",
                            error.message()
                        );
                        self.breaker.release_trial(&permit).await;
                        return Err(InvokeError::Fatal {
                            error,
                            attempts,
                            earlier: failures,
                        });
                    }

                    self.breaker.record_failure(endpoint, &error).await;
                    warn!(
                        endpoint = %endpoint,
                        severity = %error.severity(),
                        kind = error.kind(),
                        attempts,
                        "🔀 Endpoint failed, trying next"
                    );
                    failures.push(EndpointFailure {
                        endpoint: endpoint.clone(),
                        reason: FailureReason::Failed { error, attempts },
                    });
                }
            }
        }

        Err(InvokeError::Terminal(TerminalError { failures }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::error::ProviderError;
    use crate::resilience::breaker::{BreakerConfig, BreakerSettings, CircuitState};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    type Responder = Box<dyn Fn(u32) -> Result<String, ProviderError> + Send + Sync>;

    /// Model client driven by per-endpoint closures of the call number
    #[derive(Default)]
    struct ScriptedClient {
        scripts: HashMap<String, Responder>,
        calls: Mutex<HashMap<String, u32>>,
    }

    impl ScriptedClient {
        fn on(mut self, endpoint: &str, responder: impl Fn(u32) -> Result<String, ProviderError> + Send + Sync + 'static) -> Self {
            self.scripts.insert(endpoint.to_string(), Box::new(responder));
            self
        }

        fn calls(&self, endpoint: &str) -> u32 {
            self.calls.lock().unwrap().get(endpoint).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedClient {
        type Request = String;
        type Response = String;

        async fn invoke(&self, endpoint: &str, _request: &String) -> Result<String, ProviderError> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                let count = calls.entry(endpoint.to_string()).or_insert(0);
                *count += 1;
                *count
            };
            match self.scripts.get(endpoint) {
                Some(responder) => responder(n),
                None => Err(ProviderError::InvalidRequest(format!("no script for {}", endpoint))),
            }
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            exponential_base: 2.0,
            jitter: false,
        }
    }

    fn rate_limited() -> ProviderError {
        ProviderError::RateLimited {
            message: "429".into(),
            retry_after: None,
        }
    }

    struct Harness {
        client: Arc<ScriptedClient>,
        store: Arc<MemoryStore>,
        orchestrator: FallbackOrchestrator<ScriptedClient>,
    }

    fn harness(client: ScriptedClient, threshold: u32) -> Harness {
        let client = Arc::new(client);
        let store = Arc::new(MemoryStore::new());
        let breaker = Arc::new(CircuitBreaker::new(
            store.clone(),
            BreakerConfig {
                defaults: BreakerSettings {
                    failure_threshold: threshold,
                    timeout: Duration::from_secs(60),
                },
                cache_ttl: Duration::ZERO,
                ..Default::default()
            },
        ));
        let logger = ErrorLogger::spawn(store.clone(), 64);
        let orchestrator = FallbackOrchestrator::new(client.clone(), breaker, logger)
            .with_retry_policy(policy(3))
            .with_seed(1);
        Harness {
            client,
            store,
            orchestrator,
        }
    }

    fn names(endpoints: &[&str]) -> Vec<String> {
        endpoints.iter().map(|e| e.to_string()).collect()
    }

    #[tokio::test]
    async fn test_primary_success_skips_fallbacks() {
        let h = harness(
            ScriptedClient::default()
                .on("a", |_| Ok("from a".into()))
                .on("b", |_| Ok("from b".into())),
            5,
        );

        let response = h
            .orchestrator
            .invoke(&names(&["a", "b"]), &"hi".to_string(), InvokeOptions::default())
            .await
            .unwrap();

        assert_eq!(response, "from a");
        assert_eq!(h.client.calls("b"), 0);
    }

    #[tokio::test]
    async fn test_recoverable_retried_then_succeeds() {
        let h = harness(
            ScriptedClient::default().on("a", |n| if n < 3 { Err(rate_limited()) } else { Ok("ok".into()) }),
            5,
        );

        let response = h
            .orchestrator
            .invoke(&names(&["a"]), &String::new(), InvokeOptions::default())
            .await
            .unwrap();

        assert_eq!(response, "ok");
        assert_eq!(h.client.calls("a"), 3);
        let record = h.orchestrator.breaker().snapshot("a").await.unwrap();
        assert_eq!(record.consecutive_failures, 0);

        h.orchestrator.logger().flush().await;
        let logged: Vec<bool> = h.store.error_entries().iter().map(|e| e.will_retry).collect();
        assert_eq!(logged, vec![true, true]);
    }

    #[tokio::test]
    async fn test_fatal_stops_chain() {
        let h = harness(
            ScriptedClient::default()
                .on("a", |_| Err(ProviderError::Authentication("bad key".into())))
                .on("b", |_| Ok("b".into()))
                .on("c", |_| Ok("c".into())),
            5,
        );

        let err = h
            .orchestrator
            .invoke(&names(&["a", "b", "c"]), &String::new(), InvokeOptions::default())
            .await
            .unwrap_err();

        match err {
            InvokeError::Fatal { error, attempts, earlier } => {
                assert_eq!(error.endpoint(), "a");
                assert_eq!(error.kind(), "authentication");
                assert_eq!(attempts, 1);
                assert!(earlier.is_empty());
            }
            other => panic!("expected fatal, got {:?}", other),
        }
        assert_eq!(h.client.calls("a"), 1);
        assert_eq!(h.client.calls("b"), 0);
        assert_eq!(h.client.calls("c"), 0);
    }

    #[tokio::test]
    async fn test_skippable_advances_without_retry() {
        let h = harness(
            ScriptedClient::default()
                .on("a", |_| Err(ProviderError::ContextLengthExceeded("too long".into())))
                .on("b", |_| Ok("b".into())),
            5,
        );

        let response = h
            .orchestrator
            .invoke(&names(&["a", "b"]), &String::new(), InvokeOptions::default())
            .await
            .unwrap();

        assert_eq!(response, "b");
        assert_eq!(h.client.calls("a"), 1);
        assert_eq!(h.client.calls("b"), 1);
        assert_eq!(h.orchestrator.breaker().snapshot("a").await.unwrap().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_degraded_advances_without_retry() {
        let h = harness(
            ScriptedClient::default()
                .on("a", |_| Err(ProviderError::ServiceUnavailable("maintenance".into())))
                .on("b", |_| Ok("b".into())),
            5,
        );

        h.orchestrator
            .invoke(&names(&["a", "b"]), &String::new(), InvokeOptions::default())
            .await
            .unwrap();
        assert_eq!(h.client.calls("a"), 1);
    }

    #[tokio::test]
    async fn test_terminal_error_lists_every_endpoint() {
        let h = harness(
            ScriptedClient::default()
                .on("a", |_| Err(rate_limited()))
                .on("b", |_| Err(ProviderError::InvalidRequest("bad".into()))),
            1,
        );
        // Open "c" up front so it is rejected without a call
        h.orchestrator
            .breaker()
            .record_failure("c", &Classifier::new().classify(rate_limited(), "c"))
            .await;

        let err = h
            .orchestrator
            .invoke(&names(&["a", "b", "c"]), &String::new(), InvokeOptions::default())
            .await
            .unwrap_err();

        let InvokeError::Terminal(terminal) = err else {
            panic!("expected terminal error");
        };
        let summary: Vec<(&str, &str, u32)> = terminal
            .failures
            .iter()
            .map(|f| (f.endpoint.as_str(), f.kind(), f.attempts()))
            .collect();
        assert_eq!(
            summary,
            vec![("a", "rate_limited", 3), ("b", "invalid_request", 1), ("c", "circuit_open", 0)]
        );
        assert_eq!(h.client.calls("c"), 0);
        assert!(terminal.failures[2].retry_after().is_some());
        assert!(terminal.to_string().starts_with("all 3 endpoint(s) failed"));
    }

    #[tokio::test]
    async fn test_empty_endpoint_list() {
        let h = harness(ScriptedClient::default(), 5);
        let err = h
            .orchestrator
            .invoke(&[], &String::new(), InvokeOptions::default())
            .await
            .unwrap_err();
        match err {
            InvokeError::Terminal(terminal) => assert!(terminal.failures.is_empty()),
            other => panic!("expected terminal error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_start_touches_nothing() {
        let h = harness(ScriptedClient::default().on("a", |_| Ok("a".into())), 5);
        let token = CancellationToken::new();
        token.cancel();

        let err = h
            .orchestrator
            .invoke(&names(&["a"]), &String::new(), InvokeOptions::default().with_cancel(token))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            InvokeError::Cancelled { reason: CancelReason::Cancelled, endpoint: None, .. }
        ));
        assert_eq!(h.client.calls("a"), 0);
    }

    #[tokio::test]
    async fn test_backoff_past_deadline_ends_endpoint_budget() {
        let client = ScriptedClient::default().on("a", |_| Err(rate_limited()));
        let h = harness(client, 1);
        let orchestrator = h.orchestrator.with_retry_policy(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: false,
        });

        let err = orchestrator
            .invoke(
                &names(&["a"]),
                &String::new(),
                InvokeOptions::default().with_deadline(Duration::from_secs(10)),
            )
            .await
            .unwrap_err();

        match err {
            InvokeError::Terminal(terminal) => {
                assert_eq!(terminal.failures.len(), 1);
                assert_eq!(terminal.failures[0].attempts(), 1);
            }
            other => panic!("expected terminal error, got {:?}", other),
        }
        assert_eq!(h.client.calls("a"), 1);
        let record = orchestrator.breaker().snapshot("a").await.unwrap();
        assert_eq!(record.state, CircuitState::Open);

        orchestrator.logger().flush().await;
        let log = h.store.error_entries();
        assert_eq!(log.len(), 1);
        assert!(!log[0].will_retry);
    }
}
