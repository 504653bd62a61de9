pub mod breaker;
pub mod classifier;
pub mod logger;
pub mod orchestrator;
pub mod retry;

pub use breaker::{BreakerConfig, BreakerRecord, BreakerSettings, CircuitBreaker, CircuitOpen, CircuitState, Permit};
pub use classifier::{ClassifiedError, Classifier, ErrorSeverity};
pub use logger::{ErrorLogEntry, ErrorLogger};
pub use orchestrator::{EndpointFailure, FailureReason, FallbackOrchestrator, InvokeError, InvokeOptions, TerminalError};
pub use retry::{backoff_delay, CancelReason, DelaySchedule, Retrier, RetryError, RetryPolicy};
