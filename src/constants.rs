//! Application-wide constants
//!
//! Centralized constants to avoid duplication and ensure consistency.

// =============================================================================
// Buffers
// =============================================================================

/// Channel capacity for async message passing
pub const CHANNEL_CAPACITY: usize = 256;

/// Read buffer size for byte links
pub const LINK_BUFFER_SIZE: usize = 4096;

/// Maximum accumulated bytes in a frame extractor before a forced flush
pub const FRAMER_MAX_BUFFER: usize = 16384;

// =============================================================================
// Timing
// =============================================================================

/// Default startup delay between transport open and kernel `started` (ms)
pub const STARTUP_DELAY_DEFAULT_MS: u64 = 500;

/// DCC-EX boots slowly; its command station needs more settle time (ms)
pub const STARTUP_DELAY_DCCEX_MS: u64 = 2500;

/// Consecutive zero-byte serial reads before assuming port disconnected
pub const SERIAL_DISCONNECT_THRESHOLD: u32 = 10;

// =============================================================================
// Logging
// =============================================================================

/// Default capacity of the in-memory log store
pub const MEMORY_LOGGER_SIZE_DEFAULT: usize = 1000;

/// Upper bound for the in-memory log store capacity
pub const MEMORY_LOGGER_SIZE_MAX: usize = 1_000_000;

// =============================================================================
// Network defaults
// =============================================================================

/// Z21 command station UDP port
pub const Z21_PORT_DEFAULT: u16 = 21105;

/// ECoS command station TCP port
pub const ECOS_PORT_DEFAULT: u16 = 15471;

/// Märklin CS2/CS3 CAN-over-TCP port
pub const MARKLIN_CAN_TCP_PORT_DEFAULT: u16 = 15731;

/// WiThrottle server TCP port
pub const WITHROTTLE_PORT_DEFAULT: u16 = 12090;

/// Traintastic DIY TCP port
pub const DIY_PORT_DEFAULT: u16 = 5741;

/// External layout simulator TCP port
pub const SIMULATOR_PORT_DEFAULT: u16 = 5742;
