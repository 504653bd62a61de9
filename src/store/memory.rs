use super::{BreakerStore, ErrorLogSink, StoreError};
use crate::resilience::breaker::{apply_event, BreakerEvent, BreakerRecord, BreakerSettings, Transition};
use crate::resilience::logger::ErrorLogEntry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

/// In-process store.
///
/// One mutex per table makes every breaker read-modify-write atomic within
/// the process. Nothing is persisted.
#[derive(Default)]
pub struct MemoryStore {
    breakers: Mutex<HashMap<String, BreakerRecord>>,
    errors: Mutex<Vec<ErrorLogEntry>>,
    breaker_ops: AtomicUsize,
}

/// Recover a poisoned lock; a half-applied breaker update is still a valid record
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Memory store mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `apply` calls served
    pub fn breaker_ops(&self) -> usize {
        self.breaker_ops.load(Ordering::SeqCst)
    }

    /// Every error log entry, oldest first
    pub fn error_entries(&self) -> Vec<ErrorLogEntry> {
        lock(&self.errors).clone()
    }
}

#[async_trait]
impl BreakerStore for MemoryStore {
    async fn load(&self, endpoint: &str) -> Result<Option<BreakerRecord>, StoreError> {
        Ok(lock(&self.breakers).get(endpoint).cloned())
    }

    async fn apply(
        &self,
        endpoint: &str,
        event: BreakerEvent,
        settings: &BreakerSettings,
        now: DateTime<Utc>,
    ) -> Result<Transition, StoreError> {
        self.breaker_ops.fetch_add(1, Ordering::SeqCst);
        let mut breakers = lock(&self.breakers);
        let current = breakers.get(endpoint).cloned();
        let transition = apply_event(current, endpoint, event, settings, now);
        if transition.changed {
            breakers.insert(endpoint.to_string(), transition.record.clone());
        }
        Ok(transition)
    }

    async fn list(&self) -> Result<Vec<BreakerRecord>, StoreError> {
        let mut records: Vec<_> = lock(&self.breakers).values().cloned().collect();
        records.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        Ok(records)
    }
}

#[async_trait]
impl ErrorLogSink for MemoryStore {
    async fn append(&self, entries: &[ErrorLogEntry]) -> Result<(), StoreError> {
        lock(&self.errors).extend_from_slice(entries);
        Ok(())
    }

    async fn recent(&self, endpoint: Option<&str>, limit: usize) -> Result<Vec<ErrorLogEntry>, StoreError> {
        Ok(lock(&self.errors)
            .iter()
            .rev()
            .filter(|e| endpoint.map_or(true, |ep| e.endpoint == ep))
            .take(limit)
            .cloned()
            .collect())
    }
}
