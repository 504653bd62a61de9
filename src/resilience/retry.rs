//! Bounded retry with exponential backoff and jitter.
//!
//! Both the blocking ([`Retrier::run_blocking`]) and the async
//! ([`Retrier::run`]) entry points draw their delays from the same
//! [`DelaySchedule`], so for a given policy and seed they sleep for exactly
//! the same sequence of durations.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Lower bound of the jitter multiplier
pub const JITTER_MIN: f64 = 0.5;
/// Upper bound of the jitter multiplier
pub const JITTER_MAX: f64 = 1.5;

/// Retry policy
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (>= 1)
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Growth factor per failed attempt (> 1.0)
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts < 1 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if !(self.exponential_base > 1.0) {
            return Err(format!(
                "exponential_base must be greater than 1.0 (got {})",
                self.exponential_base
            ));
        }
        if self.base_delay > self.max_delay {
            return Err("base_delay must not exceed max_delay".to_string());
        }
        Ok(())
    }
}

/// Backoff before retry `n` (0-indexed, counted from the first failure).
///
/// `min(max_delay, base_delay * exponential_base^n)`, multiplied by
/// `jitter_factor` when the policy has jitter enabled.
pub fn backoff_delay(policy: &RetryPolicy, n: u32, jitter_factor: f64) -> Duration {
    let exp = i32::try_from(n).unwrap_or(i32::MAX);
    let raw = policy.base_delay.as_secs_f64() * policy.exponential_base.powi(exp);
    let capped = if raw.is_finite() {
        raw.min(policy.max_delay.as_secs_f64())
    } else {
        policy.max_delay.as_secs_f64()
    };

    let secs = if policy.jitter { capped * jitter_factor } else { capped };
    // Saturate instead of panicking when max_delay is near Duration::MAX
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

/// Sequence of backoff delays for one run.
///
/// Jitter factors come from a `StdRng`; seeding it makes the whole sequence
/// reproducible.
pub struct DelaySchedule {
    policy: RetryPolicy,
    rng: StdRng,
}

impl DelaySchedule {
    pub fn new(policy: RetryPolicy, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { policy, rng }
    }

    pub fn next_delay(&mut self, n: u32) -> Duration {
        let factor = if self.policy.jitter {
            self.rng.gen_range(JITTER_MIN..=JITTER_MAX)
        } else {
            1.0
        };
        backoff_delay(&self.policy, n, factor)
    }
}

/// Why a run stopped before an attempt could finish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Overall deadline reached
    Deadline,
    /// Cancellation token triggered
    Cancelled,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Deadline => write!(f, "deadline"),
            CancelReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Failure of a retried operation
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The predicate rejected the error; no further attempts were made
    #[error("non-retryable failure on attempt {attempts}: {error}")]
    NonRetryable { error: E, attempts: u32 },

    /// Every allowed attempt failed, or the next backoff would not fit
    /// before the deadline
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    Exhausted { last_error: E, attempts: u32 },

    /// Stopped by deadline or cancellation
    #[error("{reason} after {attempts} attempts")]
    Cancelled {
        reason: CancelReason,
        last_error: Option<E>,
        attempts: u32,
    },
}

impl<E> RetryError<E> {
    /// Number of attempts that were started
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::NonRetryable { attempts, .. }
            | RetryError::Exhausted { attempts, .. }
            | RetryError::Cancelled { attempts, .. } => *attempts,
        }
    }

    /// The last error returned by the operation, if any
    pub fn into_last_error(self) -> Option<E> {
        match self {
            RetryError::NonRetryable { error, .. } => Some(error),
            RetryError::Exhausted { last_error, .. } => Some(last_error),
            RetryError::Cancelled { last_error, .. } => last_error,
        }
    }
}

type RetryCallback<'a, E> = Box<dyn Fn(u32, &E, Duration) + Send + Sync + 'a>;
type FailureCallback<'a, E> = Box<dyn Fn(u32, &E, bool) + Send + Sync + 'a>;

/// Runs an operation under a [`RetryPolicy`].
pub struct Retrier<'a, E> {
    policy: RetryPolicy,
    seed: Option<u64>,
    deadline: Option<Duration>,
    cancel: Option<CancellationToken>,
    on_retry: Option<RetryCallback<'a, E>>,
    on_failure: Option<FailureCallback<'a, E>>,
}

impl<'a, E> Retrier<'a, E> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            seed: None,
            deadline: None,
            cancel: None,
            on_retry: None,
            on_failure: None,
        }
    }

    /// Fix the jitter seed
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Upper bound on the whole run, measured from its start
    pub fn deadline(mut self, budget: Duration) -> Self {
        self.deadline = Some(budget);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Called before each backoff with `(failed_attempt, error, delay)`.
    /// Observes only; cannot change what happens next.
    pub fn on_retry<F>(mut self, callback: F) -> Self
    where
        F: Fn(u32, &E, Duration) + Send + Sync + 'a,
    {
        self.on_retry = Some(Box::new(callback));
        self
    }

    /// Called after every failed attempt with `(attempt, error, will_retry)`,
    /// once the retrier has decided whether another attempt follows.
    pub fn on_failure<F>(mut self, callback: F) -> Self
    where
        F: Fn(u32, &E, bool) + Send + Sync + 'a,
    {
        self.on_failure = Some(Box::new(callback));
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }

    fn notify(&self, attempt: u32, err: &E, delay: Duration) {
        match self.on_retry {
            Some(ref callback) => callback(attempt, err, delay),
            None => debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after backoff"),
        }
    }

    fn report(&self, attempt: u32, err: &E, will_retry: bool) {
        if let Some(ref callback) = self.on_failure {
            callback(attempt, err, will_retry);
        }
    }

    /// Decide what follows failed attempt number `attempts`: the backoff
    /// before the next attempt, or the error that ends the run.
    ///
    /// `fits` says whether a backoff of the given length ends before the
    /// deadline. One that does not is the end of the retry budget, not a
    /// cancellation: the deadline itself has not been reached yet.
    fn after_failure(
        &self,
        schedule: &mut DelaySchedule,
        err: E,
        attempts: u32,
        retryable: bool,
        fits: impl Fn(Duration) -> bool,
    ) -> Result<(E, Duration), RetryError<E>> {
        if !retryable {
            self.report(attempts, &err, false);
            return Err(RetryError::NonRetryable { error: err, attempts });
        }
        if attempts >= self.policy.max_attempts {
            self.report(attempts, &err, false);
            return Err(RetryError::Exhausted { last_error: err, attempts });
        }

        let delay = schedule.next_delay(attempts - 1);
        if !fits(delay) {
            debug!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "backoff would overrun the deadline, giving up"
            );
            self.report(attempts, &err, false);
            return Err(RetryError::Exhausted { last_error: err, attempts });
        }

        self.report(attempts, &err, true);
        self.notify(attempts, &err, delay);
        Ok((err, delay))
    }

    /// Blocking variant: sleeps the calling thread between attempts.
    ///
    /// An in-flight attempt cannot be interrupted; the deadline and the
    /// cancellation token are checked before every attempt and bound every
    /// backoff.
    pub fn run_blocking<T, F, P>(&self, is_retryable: P, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Result<T, E>,
        P: Fn(&E) -> bool,
    {
        let started = std::time::Instant::now();
        let deadline = self.deadline.and_then(|budget| started.checked_add(budget));
        let mut schedule = DelaySchedule::new(self.policy.clone(), self.seed);
        let mut last_error: Option<E> = None;
        let mut attempts = 0;

        loop {
            if self.is_cancelled() {
                return Err(RetryError::Cancelled { reason: CancelReason::Cancelled, last_error, attempts });
            }
            if deadline.is_some_and(|d| std::time::Instant::now() >= d) {
                return Err(RetryError::Cancelled { reason: CancelReason::Deadline, last_error, attempts });
            }

            attempts += 1;
            let err = match op() {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let retryable = is_retryable(&err);
            let (err, delay) = self.after_failure(&mut schedule, err, attempts, retryable, |delay| {
                deadline.map_or(true, |d| {
                    std::time::Instant::now().checked_add(delay).is_some_and(|at| at < d)
                })
            })?;
            last_error = Some(err);
            std::thread::sleep(delay);
        }
    }

    /// Async variant: suspends the task between attempts.
    ///
    /// Both the attempt itself and the backoff are raced against the
    /// deadline and the cancellation token, so either aborts the run
    /// promptly (dropping the in-flight attempt future).
    pub async fn run<T, F, Fut, P>(&self, is_retryable: P, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let started = tokio::time::Instant::now();
        let deadline = self.deadline.and_then(|budget| started.checked_add(budget));
        let cancel = self.cancel.clone().unwrap_or_default();
        let mut schedule = DelaySchedule::new(self.policy.clone(), self.seed);
        let mut last_error: Option<E> = None;
        let mut attempts = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled { reason: CancelReason::Cancelled, last_error, attempts });
            }
            if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                return Err(RetryError::Cancelled { reason: CancelReason::Deadline, last_error, attempts });
            }

            attempts += 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(CancelReason::Cancelled),
                _ = sleep_until_opt(deadline) => Err(CancelReason::Deadline),
                result = op() => Ok(result),
            };

            let err = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => err,
                Err(reason) => return Err(RetryError::Cancelled { reason, last_error, attempts }),
            };

            let retryable = is_retryable(&err);
            let (err, delay) = self.after_failure(&mut schedule, err, attempts, retryable, |delay| {
                deadline.map_or(true, |d| {
                    tokio::time::Instant::now().checked_add(delay).is_some_and(|at| at < d)
                })
            })?;
            last_error = Some(err);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled { reason: CancelReason::Cancelled, last_error, attempts });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
