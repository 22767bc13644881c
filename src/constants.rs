//! Protocol and timing constants for termgate.

use std::time::Duration;

// =============================================================================
// Reconnection Constants
// =============================================================================

/// Maximum automatic reconnection attempts before the session goes terminal.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Backoff delay before the first reconnection attempt.
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Upper bound on any computed backoff delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_millis(30_000);

// =============================================================================
// Endpoint Constants
// =============================================================================

/// WebSocket path for terminal sessions, relative to the console origin.
pub const TERMINAL_WS_PATH: &str = "/ws/terminal";

// =============================================================================
// Default Values
// =============================================================================

/// Default terminal columns when the surface reports no size.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal rows.
pub const DEFAULT_ROWS: u16 = 24;
