//! Shared numeric helpers and the file-level tolerance constants.

use itertools::Itertools;

/// Relative convergence tolerance for per-step iteration.
pub const TOLERANCE: f64 = 0.001;

/// Looser tolerance used for power-limit comparisons and current dead-band.
pub const LOW_TOLERANCE: f64 = 0.01;

/// Battery temperatures at or above this are rejected by every integrator [K].
pub const T_MAX_K: f64 = 400.0;

/// Maximum constraint-checking passes inside the charge controller.
pub const MAX_CONSTRAINT_PASSES: usize = 10;

/// Maximum thermal<->capacity coupling iterations inside the battery driver.
pub const MAX_COUPLING_ITERATIONS: usize = 5;

pub const HOURS_PER_DAY: usize = 24;
pub const HOURS_PER_YEAR: usize = 8760;
pub const HOURS_PER_LEAP_YEAR: usize = 8784;

/// Cumulative hours at the start of each month of a non-leap year.
const MONTH_START_HOURS: [usize; 13] = [
    0, 744, 1416, 2160, 2880, 3624, 4344, 5088, 5832, 6552, 7296, 8016, 8760,
];

/// Month (1-12) containing the given hour of the year.
pub fn month_of_hour(hour_of_year: usize) -> usize {
    let hour = hour_of_year % HOURS_PER_YEAR;
    MONTH_START_HOURS
        .iter()
        .position(|&start| hour < start)
        .unwrap_or(12)
}

/// Linear interpolation through two points; collapses to `y0` on a degenerate
/// bracket.
pub fn interpolate(x0: f64, y0: f64, x1: f64, y1: f64, x: f64) -> f64 {
    if (x1 - x0).abs() < f64::EPSILON {
        return y0;
    }
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}

/// Piecewise-linear lookup on `(x, y)` rows sorted by ascending `x`.
/// Extrapolates from the end segments.
pub fn linterp_rows(rows: &[[f64; 2]], x: f64) -> f64 {
    if rows.is_empty() {
        return 0.0;
    }
    if rows.len() == 1 {
        return rows[0][1];
    }
    if x <= rows[0][0] {
        let (a, b) = (rows[0], rows[1]);
        return interpolate(a[0], a[1], b[0], b[1], x);
    }
    for (a, b) in rows.iter().tuple_windows() {
        if x <= b[0] {
            return interpolate(a[0], a[1], b[0], b[1], x);
        }
    }
    let (a, b) = (rows[rows.len() - 2], rows[rows.len() - 1]);
    interpolate(a[0], a[1], b[0], b[1], x)
}

/// Discard Feb 29 data: series sampled over 8784-hour years are cut down to
/// 8760-hour years by dropping the trailing day of each year chunk. Series
/// already on 8760-hour years pass through untouched.
pub fn strip_leap_days(series: &[f64], steps_per_hour: usize) -> Vec<f64> {
    let leap_year_len = HOURS_PER_LEAP_YEAR * steps_per_hour;
    let year_len = HOURS_PER_YEAR * steps_per_hour;
    if steps_per_hour == 0 || series.len() % leap_year_len != 0 || series.is_empty() {
        return series.to_vec();
    }
    series
        .chunks(leap_year_len)
        .flat_map(|year| &year[..year_len])
        .copied()
        .collect()
}

/// Accumulates non-fatal runtime diagnostics for the driver to drain.
#[derive(Debug, Default, Clone)]
pub struct MessageLog {
    messages: Vec<String>,
}

impl MessageLog {
    pub fn add(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    pub fn drain(&mut self) -> Vec<String> {
        std::mem::take(&mut self.messages)
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
