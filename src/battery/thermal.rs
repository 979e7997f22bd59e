//! Lumped-mass thermal model.
//!
//! Heat balance per step:
//!
//! dT/dt = (h * A * (T_room - T) + I^2 * R) / (m * Cp)
//!
//! The step is integrated by three schemes in order — trapezoidal, RK4,
//! implicit Euler — and the first result strictly inside (0, T_MAX) is
//! accepted. If none qualifies the temperature is left unchanged and a
//! diagnostic is recorded. The usable-capacity derate is interpolated from the
//! capacity-vs-temperature table; a value outside [0, 100] is ignored and
//! treated as 100%.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::params::ThermalParams;
use crate::utils::{linterp_rows, MessageLog, T_MAX_K};

const SECONDS_PER_HOUR: f64 = 3600.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermalState {
    pub t_battery_k: f64,
    /// Usable capacity at the present temperature [% of rated].
    pub capacity_percent: f64,
}

#[derive(Debug, Clone)]
pub struct ThermalModel {
    /// Exposed surface area, 2(LW + LH + WH), computed once [m2].
    surface_area_m2: f64,
    state: ThermalState,
}

impl ThermalModel {
    pub fn new(params: &ThermalParams) -> Self {
        let surface_area_m2 = 2.0
            * (params.length_m * params.width_m
                + params.length_m * params.height_m
                + params.width_m * params.height_m);
        Self {
            surface_area_m2,
            state: ThermalState {
                t_battery_k: params.room_temp_k(0),
                capacity_percent: 100.0,
            },
        }
    }

    pub fn state(&self) -> &ThermalState {
        &self.state
    }

    pub fn set_state(&mut self, state: ThermalState) {
        self.state = state;
    }

    pub fn t_battery_k(&self) -> f64 {
        self.state.t_battery_k
    }

    /// Advance the battery temperature one step for the given current [A].
    pub fn update(
        &mut self,
        current: f64,
        year_one_index: usize,
        params: &ThermalParams,
        dt_hour: f64,
        log: &mut MessageLog,
    ) {
        let dt = dt_hour * SECONDS_PER_HOUR;
        let room = params.room_temp_k(year_one_index);

        let schemes: [fn(&Self, f64, f64, f64, &ThermalParams) -> f64; 3] =
            [Self::trapezoidal, Self::rk4, Self::implicit_euler];
        let accepted = schemes
            .iter()
            .map(|scheme| scheme(self, current, dt, room, params))
            .find(|&t| t > 0.0 && t < T_MAX_K);

        match accepted {
            Some(t) => self.state.t_battery_k = t,
            None => {
                warn!(current, "no thermal integrator produced a temperature in (0, T_max)");
                log.add(
                    "computed battery temperature below zero or greater than max allowed, \
                     consider reducing C-rate",
                );
            }
        }
    }

    fn derivative(&self, t_battery: f64, current: f64, room: f64, params: &ThermalParams) -> f64 {
        (params.h_w_per_m2_k * (room - t_battery) * self.surface_area_m2
            + current.powi(2) * params.resistance_ohm)
            / (params.mass_kg * params.cp_j_per_kg_k)
    }

    fn trapezoidal(&self, current: f64, dt: f64, room: f64, params: &ThermalParams) -> f64 {
        let b = 1.0 / (params.mass_kg * params.cp_j_per_kg_k); // [K/J]
        let c = params.h_w_per_m2_k * self.surface_area_m2; // [W/K]
        let d = current.powi(2) * params.resistance_ohm; // [W]
        let t_prime = self.derivative(self.state.t_battery_k, current, room, params);

        (self.state.t_battery_k + 0.5 * dt * (t_prime + b * (c * room + d)))
            / (1.0 + 0.5 * dt * b * c)
    }

    fn rk4(&self, current: f64, dt: f64, room: f64, params: &ThermalParams) -> f64 {
        let t = self.state.t_battery_k;
        let k1 = dt * self.derivative(t, current, room, params);
        let k2 = dt * self.derivative(t + k1 / 2.0, current, room, params);
        let k3 = dt * self.derivative(t + k2 / 2.0, current, room, params);
        let k4 = dt * self.derivative(t + k3, current, room, params);
        t + (k1 + k4) / 6.0 + (k2 + k3) / 3.0
    }

    fn implicit_euler(&self, current: f64, dt: f64, room: f64, params: &ThermalParams) -> f64 {
        let b = 1.0 / (params.mass_kg * params.cp_j_per_kg_k);
        let c = params.h_w_per_m2_k * self.surface_area_m2;
        let d = current.powi(2) * params.resistance_ohm;

        (self.state.t_battery_k + dt * b * (c * room + d)) / (1.0 + dt * b * c)
    }

    /// Usable-capacity percent at the present temperature.
    pub fn capacity_percent(&mut self, params: &ThermalParams, log: &mut MessageLog) -> f64 {
        let mut percent = linterp_rows(&params.cap_vs_temp, self.state.t_battery_k);
        if !(0.0..=100.0).contains(&percent) {
            warn!(
                t_battery_k = self.state.t_battery_k,
                percent, "capacity-vs-temperature lookup out of range, assuming 100%"
            );
            log.add("unable to determine capacity adjustment for temperature, ignoring");
            percent = 100.0;
        }
        self.state.capacity_percent = percent;
        percent
    }

    /// A fresh pack equilibrates to the room temperature of the moment.
    pub fn replace(&mut self, year_one_index: usize, params: &ThermalParams) {
        self.state.t_battery_k = params.room_temp_k(year_one_index);
        self.state.capacity_percent = 100.0;
    }
}
