//! Small helpers shared across the runtime layer

use std::time::{Duration, Instant};

/// Current time as seen by the state machine.
///
/// Read through tokio's clock so that paused test time drives retries.
pub(crate) fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Idle wake-up used when `from + tick` is not representable.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Worker wake-up time for an optional deadline, never later than `tick`
/// from `from`.
pub(crate) fn wake_at(deadline: Option<Instant>, from: Instant, tick: Duration) -> Instant {
    let idle = from
        .checked_add(tick)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from);
    match deadline {
        Some(d) if d < idle => d,
        _ => idle,
    }
}
