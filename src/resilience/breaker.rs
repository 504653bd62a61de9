//! Persistent per-endpoint circuit breaker.
//!
//! Each endpoint (model name) has one [`BreakerRecord`] in a
//! [`BreakerStore`]. The state machine itself is the pure function
//! [`apply_event`]; stores run it inside their atomic read-modify-write so
//! every process sharing a store sees a linearizable history per endpoint.
//!
//! - **Closed**: everything admitted, failures counted.
//! - **Open**: everything rejected until `timeout` has passed since `opened_at`.
//! - **HalfOpen**: one trial call in flight; everyone else rejected.
//!
//! The Open -> HalfOpen move happens lazily on the first admit after the
//! timeout; there is no background timer.

use crate::resilience::classifier::ClassifiedError;
use crate::store::{BreakerStore, StoreError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Log target for breaker persistence failures
pub const PERSISTENCE_TARGET: &str = "llm_resilience::persistence";

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(1);

/// Circuit breaker state.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CircuitState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closed" => Ok(Self::Closed),
            "open" => Ok(Self::Open),
            "half_open" => Ok(Self::HalfOpen),
            other => Err(format!("unknown circuit state: {}", other)),
        }
    }
}

/// Thresholds for one endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BreakerSettings {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call
    pub timeout: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Persisted breaker state for one endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerRecord {
    pub endpoint: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub timeout_ms: u64,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// When the current half-open trial was admitted
    pub trial_started_at: Option<DateTime<Utc>>,
}

impl BreakerRecord {
    /// Implicit record for an endpoint with no stored state
    pub fn closed(endpoint: &str, settings: &BreakerSettings) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            state: CircuitState::Closed,
            consecutive_failures: 0,
            failure_threshold: settings.failure_threshold,
            timeout_ms: settings.timeout.as_millis() as u64,
            opened_at: None,
            last_failure_at: None,
            last_success_at: None,
            trial_started_at: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Time left before `since + timeout`, or `None` once it has passed
    fn remaining_from(&self, since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<Duration> {
        let since = since?;
        let elapsed = (now - since).to_std().unwrap_or(Duration::ZERO);
        self.timeout().checked_sub(elapsed).filter(|d| !d.is_zero())
    }

    /// How long until an admit could succeed, judged from this record alone
    pub fn retry_after(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self.state {
            CircuitState::Closed => None,
            CircuitState::Open => self.remaining_from(self.opened_at, now),
            CircuitState::HalfOpen => {
                self.remaining_from(self.trial_started_at.or(self.opened_at), now)
            }
        }
    }
}

/// Something that happened to an endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerEvent {
    Admit,
    Success,
    Failure,
    Reset,
    /// A half-open trial ended without a verdict on endpoint health.
    /// Only the lease admitted at `trial_started_at` is released.
    Release { trial_started_at: DateTime<Utc> },
}

/// Result of applying an event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Admitted { trial: bool },
    Rejected { retry_after: Duration },
    Recorded,
}

/// Output of one atomic read-modify-write
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub previous: CircuitState,
    pub record: BreakerRecord,
    pub decision: Decision,
    /// False when the stored row does not need to be written
    pub changed: bool,
}

/// The breaker state machine.
///
/// Takes the current stored row (or `None` for an untouched endpoint) and
/// returns the row to store plus the decision for the caller.
pub fn apply_event(
    current: Option<BreakerRecord>,
    endpoint: &str,
    event: BreakerEvent,
    settings: &BreakerSettings,
    now: DateTime<Utc>,
) -> Transition {
    let existed = current.is_some();
    let mut record = current.unwrap_or_else(|| BreakerRecord::closed(endpoint, settings));
    let previous = record.state;
    let before = record.clone();

    record.failure_threshold = settings.failure_threshold;
    record.timeout_ms = settings.timeout.as_millis() as u64;

    let decision = match event {
        BreakerEvent::Admit => match record.state {
            CircuitState::Closed => Decision::Admitted { trial: false },
            CircuitState::Open | CircuitState::HalfOpen => match record.retry_after(now) {
                Some(retry_after) => Decision::Rejected { retry_after },
                None => {
                    // Timeout over, or the previous trial's lease expired
                    record.state = CircuitState::HalfOpen;
                    record.trial_started_at = Some(now);
                    Decision::Admitted { trial: true }
                }
            },
        },
        BreakerEvent::Success => {
            record.state = CircuitState::Closed;
            record.consecutive_failures = 0;
            record.last_success_at = Some(now);
            record.opened_at = None;
            record.trial_started_at = None;
            Decision::Recorded
        }
        BreakerEvent::Failure => {
            record.consecutive_failures = record.consecutive_failures.saturating_add(1);
            record.last_failure_at = Some(now);
            match record.state {
                CircuitState::Closed => {
                    if record.consecutive_failures >= record.failure_threshold {
                        record.state = CircuitState::Open;
                        record.opened_at = Some(now);
                    }
                }
                CircuitState::HalfOpen => {
                    record.state = CircuitState::Open;
                    record.opened_at = Some(now);
                    record.trial_started_at = None;
                }
                // Straggler from before the circuit opened; keep the window
                CircuitState::Open => {}
            }
            Decision::Recorded
        }
        BreakerEvent::Reset => {
            record.state = CircuitState::Closed;
            record.consecutive_failures = 0;
            record.opened_at = None;
            record.trial_started_at = None;
            Decision::Recorded
        }
        BreakerEvent::Release { trial_started_at } => {
            // Back to open with the original window; the next admit gets a trial
            // as soon as that window is over
            if record.state == CircuitState::HalfOpen && record.trial_started_at == Some(trial_started_at) {
                record.state = CircuitState::Open;
                record.trial_started_at = None;
            }
            Decision::Recorded
        }
    };

    let changed = match event {
        // A plain closed admit or a stale release never needs a write
        BreakerEvent::Admit | BreakerEvent::Release { .. } => record != before,
        _ => !existed || record != before,
    };

    Transition {
        previous,
        record,
        decision,
        changed,
    }
}

/// Admission refused because the endpoint's circuit is open.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("circuit open for '{endpoint}', retry in {}ms", retry_after.as_millis())]
pub struct CircuitOpen {
    pub endpoint: String,
    pub retry_after: Duration,
}

/// Permission to call an endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permit {
    endpoint: String,
    /// Lease start when this call is the half-open trial
    trial_started_at: Option<DateTime<Utc>>,
    unverified: bool,
}

impl Permit {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// This call is the single half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial_started_at.is_some()
    }

    /// Admitted without consulting the store (store unreachable)
    pub fn is_unverified(&self) -> bool {
        self.unverified
    }
}

/// Circuit breaker configuration.
#[derive(Clone, Debug)]
pub struct BreakerConfig {
    pub defaults: BreakerSettings,
    /// Per-endpoint threshold overrides
    pub endpoints: HashMap<String, BreakerSettings>,
    /// Bound on each store round-trip
    pub store_timeout: Duration,
    /// How long a cached record may be used for admit decisions
    pub cache_ttl: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            defaults: BreakerSettings::default(),
            endpoints: HashMap::new(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedRecord {
    record: BreakerRecord,
    fetched: Instant,
}

/// Per-endpoint circuit breaker backed by a [`BreakerStore`].
///
/// Store failures never block traffic: admits fall back to "closed" and
/// record calls are dropped, both logged under [`PERSISTENCE_TARGET`].
pub struct CircuitBreaker {
    store: Arc<dyn BreakerStore>,
    config: BreakerConfig,
    cache: DashMap<String, CachedRecord>,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn BreakerStore>, config: BreakerConfig) -> Self {
        Self {
            store,
            config,
            cache: DashMap::new(),
        }
    }

    pub fn settings_for(&self, endpoint: &str) -> BreakerSettings {
        self.config
            .endpoints
            .get(endpoint)
            .copied()
            .unwrap_or(self.config.defaults)
    }

    fn cache_ttl(&self, endpoint: &str) -> Duration {
        self.config.cache_ttl.min(self.settings_for(endpoint).timeout)
    }

    fn cached(&self, endpoint: &str) -> Option<BreakerRecord> {
        let ttl = self.cache_ttl(endpoint);
        let entry = self.cache.get(endpoint)?;
        if entry.fetched.elapsed() < ttl {
            Some(entry.record.clone())
        } else {
            None
        }
    }

    fn remember(&self, record: &BreakerRecord) {
        if self.cache_ttl(&record.endpoint).is_zero() {
            return;
        }
        self.cache.insert(
            record.endpoint.clone(),
            CachedRecord {
                record: record.clone(),
                fetched: Instant::now(),
            },
        );
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.config.store_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.config.store_timeout)),
        }
    }

    async fn transition(&self, endpoint: &str, event: BreakerEvent) -> Result<Transition, StoreError> {
        let settings = self.settings_for(endpoint);
        let transition = self
            .bounded(self.store.apply(endpoint, event, &settings, Utc::now()))
            .await?;

        self.remember(&transition.record);
        if transition.previous != transition.record.state {
            info!(
                endpoint,
                from = %transition.previous,
                to = %transition.record.state,
                failures = transition.record.consecutive_failures,
                "Circuit breaker transition"
            );
        }
        Ok(transition)
    }

    /// Ask to call `endpoint`.
    pub async fn admit(&self, endpoint: &str) -> Result<Permit, CircuitOpen> {
        // Only decisions that need no write are answered from the cache
        if let Some(record) = self.cached(endpoint) {
            match record.state {
                CircuitState::Closed => {
                    return Ok(Permit {
                        endpoint: endpoint.to_string(),
                        trial_started_at: None,
                        unverified: false,
                    })
                }
                CircuitState::Open | CircuitState::HalfOpen => {
                    if let Some(retry_after) = record.retry_after(Utc::now()) {
                        debug!(endpoint, "Circuit open (cached)");
                        return Err(CircuitOpen {
                            endpoint: endpoint.to_string(),
                            retry_after,
                        });
                    }
                }
            }
        }

        match self.transition(endpoint, BreakerEvent::Admit).await {
            Ok(transition) => match transition.decision {
                Decision::Rejected { retry_after } => Err(CircuitOpen {
                    endpoint: endpoint.to_string(),
                    retry_after,
                }),
                Decision::Admitted { trial } => {
                    if trial {
                        info!(endpoint, "Admitting half-open trial call");
                    }
                    Ok(Permit {
                        endpoint: endpoint.to_string(),
                        trial_started_at: if trial { transition.record.trial_started_at } else { None },
                        unverified: false,
                    })
                }
                Decision::Recorded => Ok(Permit {
                    endpoint: endpoint.to_string(),
                    trial_started_at: None,
                    unverified: false,
                }),
            },
            Err(e) => {
                warn!(
                    target: PERSISTENCE_TARGET,
                    endpoint,
                    error = %e,
                    "Breaker store unavailable on admit, treating circuit as closed"
                );
                Ok(Permit {
                    endpoint: endpoint.to_string(),
                    trial_started_at: None,
                    unverified: true,
                })
            }
        }
    }

    pub async fn record_success(&self, endpoint: &str) {
        if let Err(e) = self.transition(endpoint, BreakerEvent::Success).await {
            warn!(
                target: PERSISTENCE_TARGET,
                endpoint,
                error = %e,
                "Failed to persist breaker success"
            );
        }
    }

    pub async fn record_failure(&self, endpoint: &str, error: &ClassifiedError) {
        match self.transition(endpoint, BreakerEvent::Failure).await {
            Ok(transition) => debug!(
                endpoint,
                kind = error.kind(),
                severity = %error.severity(),
                failures = transition.record.consecutive_failures,
                threshold = transition.record.failure_threshold,
                "Circuit breaker failure recorded"
            ),
            Err(e) => warn!(
                target: PERSISTENCE_TARGET,
                endpoint,
                kind = error.kind(),
                error = %e,
                "Failed to persist breaker failure"
            ),
        }
    }

    /// Hand back a half-open trial that ended without a success or a
    /// counted failure, so the next caller can take the trial without
    /// waiting out the lease.
    pub async fn release_trial(&self, permit: &Permit) {
        let Some(trial_started_at) = permit.trial_started_at else {
            return;
        };
        let endpoint = permit.endpoint();
        match self.transition(endpoint, BreakerEvent::Release { trial_started_at }).await {
            Ok(_) => debug!(endpoint, "Half-open trial released"),
            Err(e) => warn!(
                target: PERSISTENCE_TARGET,
                endpoint,
                error = %e,
                "Failed to release half-open trial"
            ),
        }
    }

    /// Force the endpoint back to closed
    pub async fn reset(&self, endpoint: &str) -> Result<BreakerRecord, StoreError> {
        info!(endpoint, "Manually resetting circuit");
        self.cache.remove(endpoint);
        Ok(self.transition(endpoint, BreakerEvent::Reset).await?.record)
    }

    /// Current stored record (implicit closed record if never touched)
    pub async fn snapshot(&self, endpoint: &str) -> Result<BreakerRecord, StoreError> {
        let record = self.bounded(self.store.load(endpoint)).await?;
        Ok(record.unwrap_or_else(|| BreakerRecord::closed(endpoint, &self.settings_for(endpoint))))
    }

    pub async fn list(&self) -> Result<Vec<BreakerRecord>, StoreError> {
        self.bounded(self.store.list()).await
    }
}
