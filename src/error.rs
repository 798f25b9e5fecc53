//! Centralized error types
//!
//! All hub errors are represented by the `HubError` enum.
//! Use `Result<T>` as shorthand for `std::result::Result<T, HubError>`.

use std::fmt;
use std::path::PathBuf;

/// All hub errors
#[derive(Debug)]
pub enum HubError {
    // === Transport ===
    /// Failed to open serial port
    SerialOpen {
        port: String,
        source: std::io::Error,
    },
    /// Failed to connect a TCP socket
    TcpConnect {
        host: String,
        port: u16,
        source: std::io::Error,
    },
    /// Failed to bind/connect a UDP socket
    UdpSocket {
        host: String,
        port: u16,
        source: std::io::Error,
    },
    /// Hostname could not be resolved to an address
    MakeAddress { host: String },

    // === Config ===
    /// Failed to read config file
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to parse config file
    ConfigParse { path: PathBuf, reason: String },
    /// Invalid config value
    ConfigValidation { field: &'static str, reason: String },

    // === Interface lifecycle ===
    /// Interface is already online
    AlreadyOnline { id: String },
    /// Operation requires the interface to be online
    NotOnline { id: String },
    /// Kernel start failed
    KernelStart { id: String, reason: String },

    // === Domain ===
    /// Address outside the controller's address space
    AddressOutOfRange { address: u32, min: u32, max: u32 },
    /// (protocol, address) already bound to another decoder
    AddressInUse { address: u32 },
    /// An LNCV programming session is already active
    ProgrammingSessionBusy,

    // === Runtime ===
    /// Tokio runtime creation failed
    Runtime { source: std::io::Error },
}

impl std::error::Error for HubError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SerialOpen { source, .. }
            | Self::TcpConnect { source, .. }
            | Self::UdpSocket { source, .. }
            | Self::ConfigRead { source, .. }
            | Self::Runtime { source } => Some(source),
            _ => None,
        }
    }
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SerialOpen { port, .. } => write!(f, "Cannot open serial port: {}", port),
            Self::TcpConnect { host, port, .. } => {
                write!(f, "Cannot connect to {}:{}", host, port)
            }
            Self::UdpSocket { host, port, .. } => {
                write!(f, "Cannot create UDP socket for {}:{}", host, port)
            }
            Self::MakeAddress { host } => write!(f, "Cannot resolve address: {}", host),
            Self::ConfigRead { path, .. } => {
                write!(f, "Cannot read config: {}", path.display())
            }
            Self::ConfigParse { path, reason } => {
                write!(f, "Cannot parse config {}: {}", path.display(), reason)
            }
            Self::ConfigValidation { field, reason } => {
                write!(f, "Invalid {}: {}", field, reason)
            }
            Self::AlreadyOnline { id } => write!(f, "Interface {} is already online", id),
            Self::NotOnline { id } => write!(f, "Interface {} is not online", id),
            Self::KernelStart { id, reason } => {
                write!(f, "Interface {} failed to start: {}", id, reason)
            }
            Self::AddressOutOfRange { address, min, max } => {
                write!(f, "Address {} outside range {}..={}", address, min, max)
            }
            Self::AddressInUse { address } => write!(f, "Address {} already in use", address),
            Self::ProgrammingSessionBusy => write!(f, "Programming session already active"),
            Self::Runtime { .. } => write!(f, "Failed to create runtime"),
        }
    }
}

/// Alias for Result with HubError
pub type Result<T> = std::result::Result<T, HubError>;
