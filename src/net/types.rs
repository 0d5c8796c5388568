//! Network constants for the Tradenet peer session layer.
//!
//! # Design Goals
//!
//! 1. **Bounded memory usage**: every frame and collection has an explicit size limit.
//!    A peer cannot exhaust memory by sending large or many envelopes.
//!
//! 2. **Tolerant, then strict**: protocol faults are counted per connection and only
//!    escalate to a disconnect once a per-kind tolerance is reached.
//!
//! 3. **Bounded teardown**: every wait during shutdown has a timeout, so a stuck peer
//!    or listener can never pin a session open.
//!
//! # Memory Budget
//!
//! | Component           | Max Size | Calculation                            |
//! |---------------------|----------|----------------------------------------|
//! | Ordinary envelope   | 200 KB   | PERMITTED_MESSAGE_SIZE                 |
//! | Extended envelope   | 10 MB    | MAX_PERMITTED_MESSAGE_SIZE             |
//! | Inbound window      | ~16 KB   | (MSG_THROTTLE_PER_10_SEC + 1) × Instant |
//! | Dispatch queue      | bounded  | DISPATCH_QUEUE_SIZE jobs per session   |

use std::time::Duration;

// =============================================================================
// PROTOCOL IDENTIFICATION
// =============================================================================

/// Magic bytes opening every frame.
/// A mismatch means the stream is desynchronised and cannot be recovered.
pub const PROTOCOL_MAGIC: [u8; 4] = *b"TRDN";

/// P2P message version carried in every envelope.
/// Peers on a different version belong to another network (WRONG_NETWORK_ID).
pub const P2P_MESSAGE_VERSION: u32 = 1;

/// Default TCP port for the demo node.
pub const DEFAULT_PORT: u16 = 9999;

/// Frame header: magic(4) + length(4) + checksum(4).
pub const FRAME_HEADER_SIZE: usize = 12;

// =============================================================================
// MESSAGE SIZE LIMITS
// =============================================================================

/// Ceiling for ordinary envelopes (200 KB).
pub const PERMITTED_MESSAGE_SIZE: usize = 200 * 1024;

/// Ceiling for envelopes that permit extended size (10 MB).
/// Only bulk data responses are allowed to go this high.
/// The frame reader never allocates above this.
pub const MAX_PERMITTED_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

// =============================================================================
// TIMEOUTS
// =============================================================================

/// Socket read timeout (240 s).
/// A peer that stays silent this long is dead, not malicious.
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(240);

/// Bound on one envelope write, including the wait for the writer (90 s).
/// A peer that stops reading is closed with SEND_MSG_TIMEOUT.
pub const SEND_MSG_TIMEOUT: Duration = Duration::from_secs(90);

/// Bound on every teardown wait (100 ms).
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(100);

/// Delay between sending the close message and tearing the socket down (200 ms).
/// Gives the close frame time to leave the send buffer.
pub const CLOSE_FLUSH_DELAY: Duration = Duration::from_millis(200);

// =============================================================================
// THROTTLING
// =============================================================================

/// Minimum interval between two outbound sends (20 ms).
pub const SEND_MSG_THROTTLE_TRIGGER: Duration = Duration::from_millis(20);

/// Sleep applied when two sends come closer than the trigger (50 ms).
pub const SEND_MSG_THROTTLE_SLEEP: Duration = Duration::from_millis(50);

/// Inbound ceiling for the last second.
pub const MSG_THROTTLE_PER_SEC: usize = 200;

/// Inbound ceiling for the last ten seconds.
pub const MSG_THROTTLE_PER_10_SEC: usize = 1000;

/// Minimum spacing between two inbound envelopes (10 ms).
pub const INBOUND_SPACING_TRIGGER: Duration = Duration::from_millis(10);

/// Sleep applied to the read loop when the spacing is violated (20 ms).
pub const INBOUND_SPACING_SLEEP: Duration = Duration::from_millis(20);

// =============================================================================
// DIAGNOSTICS
// =============================================================================

/// At most one detailed violation log per interval per process (30 s).
pub const LOG_THROTTLE_INTERVAL: Duration = Duration::from_secs(30);

// =============================================================================
// DISPATCH
// =============================================================================

/// Pending listener jobs per session before the read loop applies backpressure.
pub const DISPATCH_QUEUE_SIZE: usize = 1000;
