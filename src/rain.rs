//! Rain accumulation.
//!
//! The reading source reports rain as millimetres fallen during the
//! collection interval. Each cycle's averaged reading is added to a running
//! calendar-day total, which resets at local midnight. The stored sample
//! carries the day total in `rain` and the cycle increment in `rain_rate`.

use chrono::{DateTime, FixedOffset, TimeZone, Utc};

use crate::models::RainState;

// ---

/// Epoch seconds of local midnight starting the local day containing `now`.
pub fn local_midnight(now: DateTime<Utc>, offset: FixedOffset) -> i64 {
    // ---
    let local_date = now.with_timezone(&offset).date_naive();
    local_date
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| offset.from_local_datetime(&midnight).single())
        .map(|dt| dt.timestamp())
        .unwrap_or_else(|| now.timestamp())
}

/// A fresh state for the local day containing `now`.
pub fn initial_state(now: DateTime<Utc>, offset: FixedOffset) -> RainState {
    RainState {
        accumulated_rain: 0.0,
        last_reset_time: local_midnight(now, offset),
        last_rain_count: 0.0,
    }
}

/// Add one cycle's rain to `state`, resetting first if local midnight has
/// passed since the last reset. Negative increments count as zero.
pub fn accumulate(
    state: &RainState,
    increment_mm: f64,
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> RainState {
    // ---
    let increment = if increment_mm.is_finite() { increment_mm.max(0.0) } else { 0.0 };
    let today = local_midnight(now, offset);

    let carried = if state.last_reset_time < today {
        tracing::info!(
            "Resetting daily rain total ({:.2} mm) at local midnight",
            state.accumulated_rain
        );
        0.0
    } else {
        state.accumulated_rain
    };

    RainState {
        accumulated_rain: carried + increment,
        last_reset_time: today.max(state.last_reset_time),
        last_rain_count: increment,
    }
}
