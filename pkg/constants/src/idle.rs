//! Idle / unidle timing constants.

/// How often the idle sweep runs.
pub const IDLE_TICK_SECS: u64 = 60;

/// A host with no activity for this long becomes eligible for idling.
pub const IDLE_TIMEOUT_SECS: u64 = 60 * 60;

/// Interval between readiness polls while unidling.
pub const UNIDLE_POLL_MILLIS: u64 = 200;

/// Extra wait after the first ready replica is observed, so endpoints propagate.
pub const UNIDLE_SETTLE_MILLIS: u64 = 500;

/// Default handler deadline for the whole unidle wait.
pub const DEFAULT_UNIDLE_TIMEOUT_SECS: u64 = 60;

/// Upper bound on a single deployment scale call made by the sweep.
pub const SCALE_TIMEOUT_SECS: u64 = 10;
