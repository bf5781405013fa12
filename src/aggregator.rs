//! Reading Aggregator: merges the readings of one collection cycle.
//!
//! Every field is averaged arithmetically except `wind_direction`, which is a
//! bearing and uses the circular mean so that 350° and 10° average to 0°.

use crate::models::FieldMap;

/// Field averaged on the circle rather than the line.
pub const WIND_DIRECTION: &str = "wind_direction";

const CARDINALS: [&str; 8] = ["N", "NE", "E", "SE", "S", "SW", "W", "NW"];

// ---

/// Average `readings` into one field map.
///
/// Returns an empty map when there are no readings; callers must treat that as
/// "no measurement this cycle". A field missing from some readings is averaged
/// over the readings that carry it.
pub fn average_readings(readings: &[FieldMap]) -> FieldMap {
    // ---
    let mut averaged = FieldMap::new();
    if readings.is_empty() {
        return averaged;
    }

    let mut sums: FieldMap = FieldMap::new();
    let mut counts: std::collections::BTreeMap<&str, usize> = Default::default();
    let mut bearings = Vec::new();

    for reading in readings {
        for (field, value) in reading {
            if field == WIND_DIRECTION {
                bearings.push(*value);
                continue;
            }
            *sums.entry(field.clone()).or_insert(0.0) += value;
            *counts.entry(field.as_str()).or_insert(0) += 1;
        }
    }

    for (field, sum) in sums {
        let n = counts.get(field.as_str()).copied().unwrap_or(1);
        averaged.insert(field, sum / n as f64);
    }

    if let Some(direction) = circular_mean_degrees(&bearings) {
        averaged.insert(WIND_DIRECTION.to_string(), direction);
    }

    averaged
}

/// Circular mean of bearings in degrees, normalised to `[0, 360)`.
///
/// `None` for an empty slice.
pub fn circular_mean_degrees(bearings: &[f64]) -> Option<f64> {
    // ---
    if bearings.is_empty() {
        return None;
    }

    let (sin_sum, cos_sum) = bearings.iter().fold((0.0_f64, 0.0_f64), |(s, c), deg| {
        let rad = deg.to_radians();
        (s + rad.sin(), c + rad.cos())
    });

    Some(normalize_degrees(sin_sum.atan2(cos_sum).to_degrees()))
}

/// Map any angle onto `[0, 360)`.
pub fn normalize_degrees(deg: f64) -> f64 {
    let wrapped = deg.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negative inputs
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// 8-point compass name for a bearing.
pub fn degrees_to_cardinal(deg: f64) -> &'static str {
    // ---
    let sector = ((normalize_degrees(deg) + 22.5) / 45.0).floor() as usize % CARDINALS.len();
    CARDINALS[sector]
}
