// Policy and sizing constants for the track registry

/// Consecutive non-associated pushes a track survives before termination.
/// The push that would exceed this count terminates the track.
pub const MAX_EXTRAPOLATION: u32 = 3;

/// Number of seed points required to open a new track.
pub const SEED_POINT_COUNT: usize = 4;

/// Default pool capacity (concurrent tracks).
pub const DEFAULT_TRACK_CAPACITY: usize = 2000;

/// Default window capacity (retained points per track).
pub const DEFAULT_POINT_CAPACITY: usize = 2000;

/// Default command queue bound, counted in command records.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Dispatcher idle wait when a sweep processed nothing (ms). Bounded so the
/// visualizer hook still runs on an idle store.
pub const IDLE_WAIT_MS: u64 = 10;

/// Grace period for draining operator commands on shutdown (s).
pub const SHUTDOWN_GRACE_SECS: u64 = 2;

// --- Wire layout (fixed little-endian for this build) ---

/// Packed header length in bytes: u32 id, u32 extrapolation_count,
/// u32 point_count, i32 state.
pub const HEADER_WIRE_LEN: usize = 16;

/// Packed point length in bytes: six f64 motion fields, u8 associated,
/// 7 zero padding bytes, i64 timestamp (inlined trailing field).
pub const POINT_WIRE_LEN: usize = 64;
