//! Error classification.
//!
//! Maps a provider error to an [`ErrorSeverity`] through a lookup table keyed
//! on the normalized kind code ([`ProviderError::kind`]). The table is built
//! once and never mutated, so a [`Classifier`] can be shared freely.

use crate::providers::error::ProviderError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// How an error should be handled, ordered by handling cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    /// Stop everything: no retry, no fallback
    Fatal,
    /// Retry the same endpoint with backoff
    Recoverable,
    /// Move to the next endpoint without retrying
    Skippable,
    /// Endpoint impaired; move to the next endpoint
    Degraded,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Fatal => "fatal",
            ErrorSeverity::Recoverable => "recoverable",
            ErrorSeverity::Skippable => "skippable",
            ErrorSeverity::Degraded => "degraded",
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorSeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fatal" => Ok(ErrorSeverity::Fatal),
            "recoverable" => Ok(ErrorSeverity::Recoverable),
            "skippable" => Ok(ErrorSeverity::Skippable),
            "degraded" => Ok(ErrorSeverity::Degraded),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

/// A provider error tagged with its severity and the endpoint it came from.
///
/// Carries everything the caller needs to decide what to do without
/// re-inspecting the original error.
#[derive(Debug, Clone, Error)]
#[error("[{severity}] {endpoint}: {kind}: {message}")]
pub struct ClassifiedError {
    severity: ErrorSeverity,
    kind: String,
    endpoint: String,
    message: String,
    #[source]
    cause: Arc<ProviderError>,
    context: BTreeMap<String, String>,
}

impl ClassifiedError {
    pub fn severity(&self) -> ErrorSeverity {
        self.severity
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> &ProviderError {
        &self.cause
    }

    pub fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }
}

/// Default classification table
const DEFAULT_TABLE: &[(&str, ErrorSeverity)] = &[
    ("authentication", ErrorSeverity::Fatal),
    ("permission_denied", ErrorSeverity::Fatal),
    ("quota_exceeded", ErrorSeverity::Fatal),
    ("rate_limited", ErrorSeverity::Recoverable),
    ("timeout", ErrorSeverity::Recoverable),
    ("connection", ErrorSeverity::Recoverable),
    ("invalid_request", ErrorSeverity::Skippable),
    ("context_length_exceeded", ErrorSeverity::Skippable),
    ("schema_validation", ErrorSeverity::Skippable),
    ("service_unavailable", ErrorSeverity::Degraded),
    ("upstream", ErrorSeverity::Degraded),
];

/// Kind-code to severity lookup table.
#[derive(Debug, Clone)]
pub struct Classifier {
    table: HashMap<String, ErrorSeverity>,
    fallback: ErrorSeverity,
}

impl Classifier {
    /// Classifier with the built-in table; unknown kinds are recoverable.
    pub fn new() -> Self {
        Self {
            table: DEFAULT_TABLE
                .iter()
                .map(|(kind, severity)| (kind.to_string(), *severity))
                .collect(),
            fallback: ErrorSeverity::Recoverable,
        }
    }

    /// Built-in table with per-kind overrides applied on top
    pub fn with_overrides<I>(overrides: I) -> Self
    where
        I: IntoIterator<Item = (String, ErrorSeverity)>,
    {
        let mut classifier = Self::new();
        classifier.table.extend(overrides);
        classifier
    }

    /// Severity for a kind code
    pub fn severity_for_kind(&self, kind: &str) -> ErrorSeverity {
        self.table.get(kind).copied().unwrap_or(self.fallback)
    }

    pub fn severity(&self, err: &ProviderError) -> ErrorSeverity {
        self.severity_for_kind(err.kind())
    }

    /// Classify an error raised by `endpoint`.
    pub fn classify(&self, err: ProviderError, endpoint: &str) -> ClassifiedError {
        let kind = err.kind().to_string();
        let severity = self.severity_for_kind(&kind);

        let mut context = BTreeMap::new();
        if let Some(retry_after) = err.retry_after() {
            context.insert("retry_after_ms".to_string(), retry_after.as_millis().to_string());
        }
        if let ProviderError::Upstream { status, .. } = &err {
            context.insert("status".to_string(), status.to_string());
        }
        if !self.table.contains_key(&kind) {
            context.insert("unclassified".to_string(), "true".to_string());
        }

        ClassifiedError {
            severity,
            kind,
            endpoint: endpoint.to_string(),
            message: err.to_string(),
            cause: Arc::new(err),
            context,
        }
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    #[test]
    fn test_default_table() {
        let classifier = Classifier::new();

        assert_eq!(
            classifier.severity(&ProviderError::Authentication("bad key".into())),
            ErrorSeverity::Fatal
        );
        assert_eq!(
            classifier.severity(&ProviderError::QuotaExceeded("budget".into())),
            ErrorSeverity::Fatal
        );
        assert_eq!(
            classifier.severity(&ProviderError::RateLimited { message: "429".into(), retry_after: None }),
            ErrorSeverity::Recoverable
        );
        assert_eq!(
            classifier.severity(&ProviderError::Connection("reset".into())),
            ErrorSeverity::Recoverable
        );
        assert_eq!(
            classifier.severity(&ProviderError::ContextLengthExceeded("too long".into())),
            ErrorSeverity::Skippable
        );
        assert_eq!(
            classifier.severity(&ProviderError::SchemaValidation("missing field".into())),
            ErrorSeverity::Skippable
        );
        assert_eq!(
            classifier.severity(&ProviderError::ServiceUnavailable("down".into())),
            ErrorSeverity::Degraded
        );
        assert_eq!(
            classifier.severity(&ProviderError::Upstream { status: 500, message: "oops".into() }),
            ErrorSeverity::Degraded
        );
    }

    #[test]
    fn test_unknown_kind_is_recoverable() {
        let classifier = Classifier::new();
        let err = ProviderError::Other { kind: "gremlins".into(), message: "?".into() };

        let classified = classifier.classify(err, "model-a");
        assert_eq!(classified.severity(), ErrorSeverity::Recoverable);
        assert_eq!(classified.kind(), "gremlins");
        assert_eq!(classified.context().get("unclassified").map(String::as_str), Some("true"));
    }

    #[test]
    fn test_classified_error_carries_context() {
        let classifier = Classifier::new();
        let err = ProviderError::RateLimited {
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(3)),
        };

        let classified = classifier.classify(err, "model-a");
        assert_eq!(classified.endpoint(), "model-a");
        assert_eq!(classified.kind(), "rate_limited");
        assert_eq!(classified.context().get("retry_after_ms").map(String::as_str), Some("3000"));
        assert!(matches!(classified.cause(), ProviderError::RateLimited { .. }));
        assert!(classified.to_string().contains("recoverable"));
    }

    #[test]
    fn test_overrides() {
        let classifier =
            Classifier::with_overrides([("upstream".to_string(), ErrorSeverity::Recoverable)]);
        assert_eq!(classifier.severity_for_kind("upstream"), ErrorSeverity::Recoverable);
        assert_eq!(classifier.severity_for_kind("authentication"), ErrorSeverity::Fatal);
    }

    #[test]
    fn test_severity_round_trips_through_str() {
        for severity in [
            ErrorSeverity::Fatal,
            ErrorSeverity::Recoverable,
            ErrorSeverity::Skippable,
            ErrorSeverity::Degraded,
        ] {
            assert_eq!(severity.as_str().parse::<ErrorSeverity>(), Ok(severity));
        }
        assert!("catastrophic".parse::<ErrorSeverity>().is_err());
    }

    proptest! {
        #[test]
        fn prop_classification_is_deterministic(kind in "[a-z_]{1,24}") {
            let classifier = Classifier::new();
            let first = classifier.severity_for_kind(&kind);
            let second = classifier.severity_for_kind(&kind);
            prop_assert_eq!(first, second);

            let known = DEFAULT_TABLE.iter().find(|(k, _)| *k == kind.as_str());
            match known {
                Some((_, severity)) => prop_assert_eq!(first, *severity),
                None => prop_assert_eq!(first, ErrorSeverity::Recoverable),
            }
        }
    }
}
