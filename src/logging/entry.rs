//! Log entry types
//!
//! Every entry names the object it concerns (interface id, kernel log id)
//! and carries a stable message code so clients can match entries without
//! parsing the human-readable text.

use serde::{Deserialize, Serialize};

/// Severity of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

/// Stable message codes
///
/// The letter encodes the severity class, the number the message. Codes
/// never change meaning once assigned; the formatted text may.
pub mod codes {
    pub const TX: &str = "D2001";
    pub const RX: &str = "D2002";
    pub const INPUT_VALUE: &str = "D2007";
    pub const STARTED: &str = "I2001";
    pub const STOPPED: &str = "I2002";
    pub const SIMULATOR_CONNECTED: &str = "I2003";
    pub const MALFORMED_DATA_DROPPED: &str = "W2001";
    pub const LISTEN_ONLY_SEND_REFUSED: &str = "W2002";
    pub const BROADCAST_FLAGS_MISMATCH: &str = "W2003";
    pub const HEARTBEAT_TIMEOUT: &str = "W2004";
    pub const WRITE_BUFFER_FULL: &str = "E2001";
    pub const TRANSPORT: &str = "E2002";
    pub const MAKE_ADDRESS_FAILED: &str = "E2003";
    pub const CONNECT_FAILED: &str = "E2005";
    pub const PROTOCOL_FATAL: &str = "E2010";
    pub const START_FAILED: &str = "C1001";
}

/// A single log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// HH:MM:SS.mmm
    pub timestamp: String,
    /// Id of the object the entry concerns
    pub object: String,
    /// Stable message code, see [`codes`]
    pub code: &'static str,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    #[inline]
    fn now() -> String {
        chrono::Local::now().format("%H:%M:%S%.3f").to_string()
    }

    pub fn new(
        object: impl Into<String>,
        code: &'static str,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Self::now(),
            object: object.into(),
            code,
            level,
            message: message.into(),
        }
    }

    /// Debug entry for a transmitted frame
    pub fn tx(object: impl Into<String>, dump: impl Into<String>) -> Self {
        Self::new(object, codes::TX, LogLevel::Debug, dump)
    }

    /// Debug entry for a received frame
    pub fn rx(object: impl Into<String>, dump: impl Into<String>) -> Self {
        Self::new(object, codes::RX, LogLevel::Debug, dump)
    }

    pub fn info(object: impl Into<String>, code: &'static str, message: impl Into<String>) -> Self {
        Self::new(object, code, LogLevel::Info, message)
    }

    pub fn warning(
        object: impl Into<String>,
        code: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self::new(object, code, LogLevel::Warning, message)
    }

    pub fn error(
        object: impl Into<String>,
        code: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self::new(object, code, LogLevel::Error, message)
    }

    /// Warning for skipped bytes on a self-synchronising protocol
    pub fn malformed(object: impl Into<String>, dropped: usize) -> Self {
        Self::warning(
            object,
            codes::MALFORMED_DATA_DROPPED,
            format!("malformed data, dropped {} bytes", dropped),
        )
    }
}
