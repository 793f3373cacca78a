use chrono::TimeDelta;

/// Share of the remaining lock granted to processing before the lease expires.
pub const RENEWAL_WINDOW_FACTOR: f64 = 0.9;

const NANOS_PER_TICK: i64 = 100;
const TICKS_PER_MICRO: i64 = 10;

/// Computes the renewal deadline for a lock with `remaining` time left.
///
/// The deadline is `remaining * 0.9` measured in 100ns ticks, rounded to the
/// nearest tick with ties away from zero. A negative result means the lock had
/// already lapsed.
#[must_use]
pub fn renewal_deadline(remaining: TimeDelta) -> TimeDelta {
    // f64::round rounds half away from zero.
    let scaled = (to_ticks(remaining) as f64 * RENEWAL_WINDOW_FACTOR).round();
    from_ticks(scaled as i64)
}

fn to_ticks(delta: TimeDelta) -> i64 {
    // Floor, so any lapsed lock is at least one whole tick in the past.
    if let Some(nanos) = delta.num_nanoseconds() {
        return nanos.div_euclid(NANOS_PER_TICK);
    }

    match delta.num_microseconds() {
        Some(micros) => micros.saturating_mul(TICKS_PER_MICRO),
        None if delta < TimeDelta::zero() => i64::MIN,
        None => i64::MAX,
    }
}

fn from_ticks(ticks: i64) -> TimeDelta {
    TimeDelta::microseconds(ticks / TICKS_PER_MICRO)
        + TimeDelta::nanoseconds((ticks % TICKS_PER_MICRO) * NANOS_PER_TICK)
}
