//! Capacity fade from cycling and from calendar age.
//!
//! Cycling damage comes from a streaming single-pass rainflow counter driven
//! by depth-of-discharge readings: each closed hysteresis loop looks up its
//! capacity cost by bilinear interpolation of the (DOD, cycles, capacity)
//! matrix. Calendar fade is either absent, a square-root-in-time model with
//! Arrhenius-style temperature and SOC sensitivity, or a day-age table. The
//! composite takes the minimum of the two and never lets relative capacity
//! increase between replacements.

use std::collections::BTreeSet;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::params::{CalendarFade, LifetimeParams, TimeParams};
use crate::utils::{interpolate, linterp_rows, HOURS_PER_DAY};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleLifetimeState {
    /// Relative capacity from cycling damage [% of nominal].
    pub relative_q: f64,
    /// Most recent rainflow ranges.
    pub x_range: f64,
    pub y_range: f64,
    /// Range of the last counted cycle.
    pub range: f64,
    /// Running mean of all counted cycle ranges.
    pub average_range: f64,
    pub n_cycles: usize,
    /// Rainflow peak stack, bounded by the reversals awaiting closure.
    pub peaks: Vec<f64>,
    /// Index of the newest peak under consideration.
    pub peak_cursor: usize,
}

/// Streaming rainflow cycle counter with matrix-driven damage.
#[derive(Debug, Clone)]
pub struct CycleLifetime {
    state: CycleLifetimeState,
}

impl CycleLifetime {
    pub fn new(params: &LifetimeParams) -> Self {
        Self {
            state: CycleLifetimeState {
                relative_q: bilinear(params, 0.0, 0.0),
                x_range: 0.0,
                y_range: 0.0,
                range: 0.0,
                average_range: 0.0,
                n_cycles: 0,
                peaks: Vec::new(),
                peak_cursor: 0,
            },
        }
    }

    pub fn state(&self) -> &CycleLifetimeState {
        &self.state
    }

    pub fn set_state(&mut self, state: CycleLifetimeState) {
        self.state = state;
    }

    pub fn relative_q(&self) -> f64 {
        self.state.relative_q
    }

    /// Feed the next DOD reading [%] into the counter.
    pub fn run(&mut self, dod: f64, params: &LifetimeParams) {
        self.state.peaks.push(dod);
        let mut need_data = false;

        loop {
            if self.state.peak_cursor < 2 {
                need_data = true;
                break;
            }
            let j = self.state.peak_cursor;
            self.state.y_range = (self.state.peaks[j - 1] - self.state.peaks[j - 2]).abs();
            self.state.x_range = (self.state.peaks[j] - self.state.peaks[j - 1]).abs();

            if self.state.x_range < self.state.y_range {
                need_data = true;
                break;
            }
            self.count_cycle(params);
        }

        if need_data {
            self.state.peak_cursor += 1;
        }
    }

    /// Count range Y, discard its peak and valley, keep the newest reading.
    fn count_cycle(&mut self, params: &LifetimeParams) {
        let state = &mut self.state;
        state.range = state.y_range;
        state.average_range = (state.average_range * state.n_cycles as f64 + state.range)
            / (state.n_cycles as f64 + 1.0);
        state.n_cycles += 1;

        let n = state.n_cycles as f64;
        let average = state.average_range;
        let dq = bilinear(params, average, n) - bilinear(params, average, n + 1.0);
        if dq > 0.0 {
            state.relative_q -= dq;
        }
        if state.relative_q < 0.0 {
            state.relative_q = 0.0;
        }

        let newest = state.peaks[state.peak_cursor];
        state.peaks.truncate(state.peaks.len() - 3);
        state.peaks.push(newest);
        state.peak_cursor -= 2;
    }

    /// Capacity cost of one more cycle at the running average range [%].
    pub fn estimate_cycle_damage(&self, params: &LifetimeParams) -> f64 {
        let dod = if self.state.average_range > 0.0 {
            self.state.average_range
        } else {
            50.0
        };
        let n = self.state.n_cycles as f64;
        bilinear(params, dod, n + 1.0) - bilinear(params, dod, n + 2.0)
    }

    pub fn replace(&mut self, replacement_percent: f64, params: &LifetimeParams) {
        let fresh = bilinear(params, 0.0, 0.0);
        let state = &mut self.state;
        state.relative_q = (state.relative_q + replacement_percent).min(fresh);

        // partially-replaced banks keep their cycle history
        if replacement_percent >= 100.0 {
            state.n_cycles = 0;
        }

        state.peak_cursor = 0;
        state.x_range = 0.0;
        state.y_range = 0.0;
        state.range = 0.0;
        state.peaks.clear();
    }
}

/// Capacity percent at (DOD, cycle count): interpolate capacity vs cycles
/// along the two DOD levels bracketing the request, then across DOD.
fn bilinear(params: &LifetimeParams, dod: f64, cycle_number: f64) -> f64 {
    let matrix = &params.cycle_matrix;
    let unique_dods: BTreeSet<OrderedFloat<f64>> =
        matrix.iter().map(|row| OrderedFloat(row[0])).collect();

    if unique_dods.len() <= 1 {
        let rows: Vec<[f64; 2]> = matrix.iter().map(|row| [row[1], row[2]]).collect();
        return linterp_rows(&rows, cycle_number);
    }

    let mut d_lo = 0.0;
    let mut d_hi = 100.0;
    for row in matrix {
        let d = row[0];
        if d < dod && d > d_lo {
            d_lo = d;
        } else if d >= dod && d < d_hi {
            d_hi = d;
        }
    }

    let rows_at = |level: f64| -> Vec<[f64; 2]> {
        matrix
            .iter()
            .filter(|row| row[0] == level)
            .map(|row| [row[1], row[2]])
            .collect()
    };

    let low_rows = rows_at(d_lo);
    let mut high_rows = rows_at(d_hi);

    // above the deepest characterized DOD: clamp to the deepest present
    if high_rows.is_empty() {
        let d_max = matrix
            .iter()
            .map(|row| OrderedFloat(row[0]))
            .max()
            .map(|d| d.into_inner())
            .unwrap_or(d_hi);
        high_rows = rows_at(d_max);
    }

    let c_lo = if low_rows.is_empty() {
        // shallower than any characterized DOD: no damage at 0% DOD
        100.0
    } else {
        linterp_rows(&low_rows, cycle_number).max(0.0)
    };
    let c_hi = linterp_rows(&high_rows, cycle_number).min(100.0);

    interpolate(d_lo, c_lo, d_hi, c_hi, dod)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarLifetimeState {
    /// Relative capacity from calendar fade [% of nominal].
    pub q: f64,
    pub day_age_of_battery: usize,
    /// Model-mode fractional fade, previous and current.
    pub dq_old: f64,
    pub dq_new: f64,
    /// Last lifetime index processed; a step only runs past it.
    pub last_idx: usize,
}

/// Calendar fade, advanced once per strictly-increasing lifetime index.
#[derive(Debug, Clone)]
pub struct CalendarLifetime {
    state: CalendarLifetimeState,
    dt_day: f64,
    steps_per_day: usize,
}

impl CalendarLifetime {
    pub fn new(params: &LifetimeParams, time: &TimeParams) -> Self {
        let q = match &params.calendar {
            CalendarFade::Model { q0, .. } => q0 * 100.0,
            _ => 100.0,
        };
        Self {
            state: CalendarLifetimeState {
                q,
                day_age_of_battery: 0,
                dq_old: 0.0,
                dq_new: 0.0,
                last_idx: 0,
            },
            dt_day: time.dt_hour / HOURS_PER_DAY as f64,
            steps_per_day: HOURS_PER_DAY * time.steps_per_hour,
        }
    }

    pub fn state(&self) -> &CalendarLifetimeState {
        &self.state
    }

    pub fn set_state(&mut self, state: CalendarLifetimeState) {
        self.state = state;
    }

    pub fn relative_q(&self) -> f64 {
        self.state.q
    }

    pub fn run(
        &mut self,
        lifetime_index: usize,
        t_battery_k: f64,
        soc_percent: f64,
        params: &LifetimeParams,
    ) {
        if matches!(params.calendar, CalendarFade::None) {
            return;
        }
        if lifetime_index <= self.state.last_idx {
            return;
        }

        // day-age advancement is gated separately from the dq update
        if lifetime_index % self.steps_per_day == 0 {
            self.state.day_age_of_battery += 1;
        }

        match &params.calendar {
            CalendarFade::Model { q0, a, b, c } => {
                self.run_model(t_battery_k, soc_percent * 0.01, *q0, *a, *b, *c)
            }
            CalendarFade::Table { rows } => self.run_table(rows),
            CalendarFade::None => {}
        }

        self.state.last_idx = lifetime_index;
    }

    fn run_model(&mut self, t_battery_k: f64, soc_fraction: f64, q0: f64, a: f64, b: f64, c: f64) {
        let k_cal = a
            * (b * (1.0 / t_battery_k - 1.0 / 296.0)).exp()
            * (c * (soc_fraction / t_battery_k - 1.0 / 296.0)).exp();

        let state = &mut self.state;
        state.dq_new = if state.dq_old == 0.0 {
            k_cal * self.dt_day.sqrt()
        } else {
            (0.5 * k_cal.powi(2) / state.dq_old) * self.dt_day + state.dq_old
        };
        state.dq_old = state.dq_new;
        state.q = (q0 - state.dq_new) * 100.0;
    }

    fn run_table(&mut self, rows: &[[f64; 2]]) {
        let age = self.state.day_age_of_battery as f64;
        let n = rows.len() - 1;

        let mut day_lo = 0.0;
        let mut day_hi = rows[n][0];
        let mut capacity_lo = 100.0;
        let mut capacity_hi = 0.0;
        for row in rows {
            if row[0] <= age {
                day_lo = row[0];
                capacity_lo = row[1];
            }
            if row[0] > age {
                day_hi = row[0];
                capacity_hi = row[1];
                break;
            }
        }
        // past the end of the table: extrapolate from the last segment
        if day_lo == day_hi {
            day_lo = rows[n - 1][0];
            capacity_lo = rows[n - 1][1];
            day_hi = rows[n][0];
            capacity_hi = rows[n][1];
        }

        self.state.q = interpolate(day_lo, capacity_lo, day_hi, capacity_hi, age);
    }

    pub fn replace(&mut self, replacement_percent: f64, params: &LifetimeParams) {
        let state = &mut self.state;
        state.q += replacement_percent;
        if let CalendarFade::Model { q0, .. } = &params.calendar {
            state.q = state.q.min(q0 * 100.0);
        }
        state.dq_new = 0.0;
        state.dq_old = 0.0;
        if replacement_percent >= 100.0 {
            state.day_age_of_battery = 0;
            state.last_idx = 0;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifetimeState {
    pub cycle: CycleLifetimeState,
    pub calendar: CalendarLifetimeState,
    /// Combined relative capacity [% of nominal].
    pub relative_q: f64,
}

/// Cycle and calendar fade combined: the battery is only as good as its worse
/// degradation channel.
#[derive(Debug, Clone)]
pub struct Lifetime {
    cycle: CycleLifetime,
    calendar: CalendarLifetime,
    relative_q: f64,
}

impl Lifetime {
    pub fn new(params: &LifetimeParams, time: &TimeParams) -> Self {
        Self {
            cycle: CycleLifetime::new(params),
            calendar: CalendarLifetime::new(params, time),
            relative_q: 100.0,
        }
    }

    pub fn run(
        &mut self,
        lifetime_index: usize,
        dod: f64,
        charge_changed: bool,
        t_battery_k: f64,
        params: &LifetimeParams,
    ) {
        let q_last = self.relative_q;

        if self.relative_q > 0.0 {
            if charge_changed {
                self.cycle.run(dod, params);
            }
            self.calendar
                .run(lifetime_index, t_battery_k, 100.0 - dod, params);
            self.relative_q = self.cycle.relative_q().min(self.calendar.relative_q());
        }
        if self.relative_q < 0.0 {
            self.relative_q = 0.0;
        }
        // capacity cannot recover between replacements
        if self.relative_q > q_last {
            self.relative_q = q_last;
        }
    }

    pub fn replace(&mut self, replacement_percent: f64, params: &LifetimeParams) {
        self.cycle.replace(replacement_percent, params);
        self.calendar.replace(replacement_percent, params);
        self.relative_q = self.cycle.relative_q().min(self.calendar.relative_q());
    }

    pub fn relative_q(&self) -> f64 {
        self.relative_q
    }

    pub fn relative_q_cycle(&self) -> f64 {
        self.cycle.relative_q()
    }

    pub fn relative_q_calendar(&self) -> f64 {
        self.calendar.relative_q()
    }

    pub fn cycles_elapsed(&self) -> usize {
        self.cycle.state().n_cycles
    }

    pub fn average_cycle_range(&self) -> f64 {
        self.cycle.state().average_range
    }

    pub fn estimate_cycle_damage(&self, params: &LifetimeParams) -> f64 {
        self.cycle.estimate_cycle_damage(params)
    }

    pub fn state(&self) -> LifetimeState {
        LifetimeState {
            cycle: self.cycle.state().clone(),
            calendar: self.calendar.state().clone(),
            relative_q: self.relative_q,
        }
    }

    pub fn set_state(&mut self, state: LifetimeState) {
        self.cycle.set_state(state.cycle);
        self.calendar.set_state(state.calendar);
        self.relative_q = state.relative_q;
    }
}
