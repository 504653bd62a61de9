//! Error log writer.
//!
//! Callers hand entries to a bounded channel and move on; a background task
//! batches them into the [`ErrorLogSink`]. A full channel or a failing sink
//! drops entries (with a warning) rather than slowing the caller down.

use crate::resilience::breaker::PERSISTENCE_TARGET;
use crate::resilience::classifier::{ClassifiedError, ErrorSeverity};
use crate::store::ErrorLogSink;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Largest batch written in one sink call
const MAX_BATCH: usize = 64;

/// One classified failure, as stored in the error log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub id: Uuid,
    pub endpoint: String,
    pub error_kind: String,
    pub severity: ErrorSeverity,
    pub message: String,
    pub will_retry: bool,
    pub timestamp: DateTime<Utc>,
}

impl ErrorLogEntry {
    pub fn new(
        endpoint: &str,
        error_kind: &str,
        severity: ErrorSeverity,
        message: &str,
        will_retry: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint: endpoint.to_string(),
            error_kind: error_kind.to_string(),
            severity,
            message: message.to_string(),
            will_retry,
            timestamp: Utc::now(),
        }
    }

    pub fn from_classified(error: &ClassifiedError, will_retry: bool) -> Self {
        Self::new(
            error.endpoint(),
            error.kind(),
            error.severity(),
            error.message(),
            will_retry,
        )
    }
}

enum Command {
    Entry(ErrorLogEntry),
    Flush(oneshot::Sender<()>),
}

/// Fire-and-forget handle to the error log writer. Cheap to clone.
#[derive(Clone)]
pub struct ErrorLogger {
    tx: mpsc::Sender<Command>,
}

impl ErrorLogger {
    /// Start the writer task. Must be called inside a tokio runtime.
    pub fn spawn(sink: Arc<dyn ErrorLogSink>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(run_writer(sink, rx));
        Self { tx }
    }

    /// Record a classified failure.
    pub fn log(&self, error: &ClassifiedError, will_retry: bool) {
        self.log_entry(ErrorLogEntry::from_classified(error, will_retry));
    }

    pub fn log_entry(&self, entry: ErrorLogEntry) {
        match self.tx.try_send(Command::Entry(entry)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(Command::Entry(entry))) => {
                warn!(
                    target: PERSISTENCE_TARGET,
                    endpoint = %entry.endpoint,
                    kind = %entry.error_kind,
                    "Error log channel full, dropping entry"
                );
            }
            Err(_) => {
                warn!(target: PERSISTENCE_TARGET, "Error log writer stopped, dropping entry");
            }
        }
    }

    /// Wait until everything logged before this call has reached the sink
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn run_writer(sink: Arc<dyn ErrorLogSink>, mut rx: mpsc::Receiver<Command>) {
    let mut batch = Vec::with_capacity(MAX_BATCH);
    let mut waiters = Vec::new();

    while let Some(command) = rx.recv().await {
        push(command, &mut batch, &mut waiters);
        while batch.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(command) => push(command, &mut batch, &mut waiters),
                Err(_) => break,
            }
        }

        if !batch.is_empty() {
            if let Err(e) = sink.append(&batch).await {
                warn!(
                    target: PERSISTENCE_TARGET,
                    error = %e,
                    dropped = batch.len(),
                    "Failed to write error log entries"
                );
            } else {
                debug!(count = batch.len(), "Error log entries written");
            }
            batch.clear();
        }

        for waiter in waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

fn push(command: Command, batch: &mut Vec<ErrorLogEntry>, waiters: &mut Vec<oneshot::Sender<()>>) {
    match command {
        Command::Entry(entry) => batch.push(entry),
        Command::Flush(done) => waiters.push(done),
    }
}
