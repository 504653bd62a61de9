//! Persistent state for the resilience layer.
//!
//! Two concerns, two traits: [`BreakerStore`] owns the per-endpoint breaker
//! rows and must make each read-modify-write atomic; [`ErrorLogSink`] is an
//! append-only error log.

pub mod memory;
pub mod sqlite;

use crate::cli::{StoreConfig, StoreKind};
use crate::resilience::breaker::{BreakerEvent, BreakerRecord, BreakerSettings, Transition};
use crate::resilience::logger::ErrorLogEntry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Storage errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Breaker state persistence.
#[async_trait]
pub trait BreakerStore: Send + Sync {
    /// Stored row for `endpoint`, if any
    async fn load(&self, endpoint: &str) -> Result<Option<BreakerRecord>, StoreError>;

    /// Atomically read the row for `endpoint`, run
    /// [`apply_event`](crate::resilience::breaker::apply_event) on it, and
    /// write the result back. Concurrent calls for the same endpoint, from
    /// any process sharing the store, must serialize.
    async fn apply(
        &self,
        endpoint: &str,
        event: BreakerEvent,
        settings: &BreakerSettings,
        now: DateTime<Utc>,
    ) -> Result<Transition, StoreError>;

    /// All stored rows, ordered by endpoint
    async fn list(&self) -> Result<Vec<BreakerRecord>, StoreError>;
}

/// Append-only error log.
#[async_trait]
pub trait ErrorLogSink: Send + Sync {
    async fn append(&self, entries: &[ErrorLogEntry]) -> Result<(), StoreError>;

    /// Newest entries first, optionally for one endpoint
    async fn recent(&self, endpoint: Option<&str>, limit: usize) -> Result<Vec<ErrorLogEntry>, StoreError>;
}

/// One backing store seen through both traits
#[derive(Clone)]
pub struct StoreHandles {
    pub breakers: Arc<dyn BreakerStore>,
    pub errors: Arc<dyn ErrorLogSink>,
}

impl StoreHandles {
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: BreakerStore + ErrorLogSink + 'static,
    {
        Self {
            breakers: store.clone(),
            errors: store,
        }
    }
}

/// Open the store described by the configuration
pub async fn open(config: &StoreConfig) -> Result<StoreHandles, StoreError> {
    match config.kind {
        StoreKind::Memory => {
            tracing::warn!("Using in-memory store; breaker state will not survive restarts");
            Ok(StoreHandles::from_store(Arc::new(MemoryStore::new())))
        }
        StoreKind::Sqlite => {
            let path = config.resolved_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(format!("{}: {}", parent.display(), e)))?;
            }
            let store = SqliteStore::open(&path).await?;
            tracing::info!("💾 Breaker state stored in {}", path.display());
            Ok(StoreHandles::from_store(Arc::new(store)))
        }
    }
}
