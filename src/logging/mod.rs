//! Logging
//!
//! Domain-facing log entries carry the originating object id and a stable
//! message code, and land in a capped in-memory store that is safe to
//! write from both the event loop and kernel I/O threads. Internal
//! diagnostics go through `tracing`.

pub mod entry;
pub mod store;

pub use entry::{LogEntry, LogLevel};
pub use store::LogStore;

use crate::constants::{MEMORY_LOGGER_SIZE_DEFAULT, MEMORY_LOGGER_SIZE_MAX};
use parking_lot::Mutex;
use std::sync::Arc;

/// Shared handle to the in-memory log store
///
/// Cheap to clone; log calls are safe from any thread.
#[derive(Clone)]
pub struct Logger {
    store: Arc<Mutex<LogStore>>,
}

impl Logger {
    pub fn new(capacity: usize) -> Self {
        Self {
            store: Arc::new(Mutex::new(LogStore::new(
                capacity.min(MEMORY_LOGGER_SIZE_MAX),
            ))),
        }
    }

    /// Append an entry and mirror it to `tracing`
    pub fn log(&self, entry: LogEntry) {
        match entry.level {
            LogLevel::Debug => tracing::debug!(object = %entry.object, code = entry.code, "{}", entry.message),
            LogLevel::Info => tracing::info!(object = %entry.object, code = entry.code, "{}", entry.message),
            LogLevel::Warning => tracing::warn!(object = %entry.object, code = entry.code, "{}", entry.message),
            LogLevel::Error | LogLevel::Critical => {
                tracing::error!(object = %entry.object, code = entry.code, "{}", entry.message)
            }
        }
        self.store.lock().add(entry);
    }

    /// Snapshot of the most recent entries, oldest first
    pub fn recent(&self, max: usize) -> Vec<LogEntry> {
        self.store.lock().recent(max)
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(MEMORY_LOGGER_SIZE_DEFAULT)
    }
}

/// Initialize internal tracing output
///
/// Respects `RAILHUB_LOG` if set, otherwise uses `info` (or `debug` with
/// `verbose`).
pub fn init_tracing(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let level = std::env::var("RAILHUB_LOG")
        .unwrap_or_else(|_| if verbose { "debug" } else { "info" }.to_string());

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(tracing_subscriber::EnvFilter::new(level))
        .try_init();
}
