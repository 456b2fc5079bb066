use std::time::Duration;

/// Delay before retry number `attempt` (0-based): `base × multiplier^attempt`,
/// capped. Pure so schedules are testable without timers.
pub(crate) fn backoff_delay(
    base: Duration,
    multiplier: f64,
    cap: Duration,
    attempt: u32,
) -> Duration {
    let factor = multiplier.max(1.0).powi(attempt as i32);
    let millis = (base.as_millis() as f64 * factor) as u64;
    Duration::from_millis(millis).min(cap)
}
