//! Scenario configuration for the simulation binary.
//!
//! Loads a TOML scenario file layered with `BATT_`-prefixed environment
//! overrides, applies surface-level range checks, and converts the result into
//! the validated parameter bundles the core consumes. Temperatures enter in
//! degrees Celsius and are converted to kelvin here, at the boundary.

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use validator::Validate;

use crate::params::{
    BatteryParams, CapacityParams, ControllerParams, LifetimeParams, LossParams,
    ReplacementPolicy, ThermalParams, TimeParams, VoltageParams,
};
use crate::power_flow::SharedInverterParams;
use crate::utils::strip_leap_days;

const CELSIUS_TO_KELVIN: f64 = 273.15;

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TimeConfig {
    #[validate(range(min = 0.001, max = 1.0))]
    pub dt_hour: f64,

    #[validate(range(min = 1, max = 50))]
    pub years: usize,
}

/// Thermal section with ambient temperatures in everyday units.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ThermalConfig {
    #[validate(range(min = 0.001))]
    pub mass_kg: f64,

    #[validate(range(min = 0.001))]
    pub length_m: f64,

    #[validate(range(min = 0.001))]
    pub width_m: f64,

    #[validate(range(min = 0.001))]
    pub height_m: f64,

    #[validate(range(min = 0.0))]
    pub resistance_ohm: f64,

    #[validate(range(min = 0.001))]
    pub cp_j_per_kg_k: f64,

    #[validate(range(min = 0.0))]
    pub h_w_per_m2_k: f64,

    /// Rows of (temperature C, usable capacity %).
    pub cap_vs_temp_c: Vec<[f64; 2]>,

    /// Ambient temperature series (C); a single value holds all year. Leap
    /// years in the series are truncated to 8760-hour years.
    pub ambient_temp_c: Vec<f64>,
}

impl ThermalConfig {
    fn into_params(self, steps_per_hour: usize) -> ThermalParams {
        ThermalParams {
            mass_kg: self.mass_kg,
            length_m: self.length_m,
            width_m: self.width_m,
            height_m: self.height_m,
            resistance_ohm: self.resistance_ohm,
            cp_j_per_kg_k: self.cp_j_per_kg_k,
            h_w_per_m2_k: self.h_w_per_m2_k,
            cap_vs_temp: self
                .cap_vs_temp_c
                .into_iter()
                .map(|row| [row[0] + CELSIUS_TO_KELVIN, row[1]])
                .collect(),
            t_room_k: strip_leap_days(&self.ambient_temp_c, steps_per_hour)
                .into_iter()
                .map(|t| t + CELSIUS_TO_KELVIN)
                .collect(),
        }
    }
}

/// Deterministic shapes for the demo dispatch in the binary.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ProfileConfig {
    #[validate(range(min = 0.0))]
    pub pv_peak_kw: f64,

    #[validate(range(min = 0.0))]
    pub load_base_kw: f64,

    #[validate(range(min = 0.0))]
    pub load_evening_kw: f64,

    /// Ambient temperature seen by the shared inverter (C).
    pub ambient_temp_c: f64,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            pv_peak_kw: 6.0,
            load_base_kw: 0.8,
            load_evening_kw: 2.5,
            ambient_temp_c: 20.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ScenarioConfig {
    #[validate(nested)]
    pub time: TimeConfig,

    pub capacity: CapacityParams,

    pub voltage: VoltageParams,

    #[validate(nested)]
    pub thermal: ThermalConfig,

    pub lifetime: LifetimeParams,

    pub losses: LossParams,

    #[serde(default)]
    pub replacement: ReplacementPolicy,

    pub controller: ControllerParams,

    #[serde(default)]
    pub inverter: Option<SharedInverterParams>,

    #[serde(default)]
    #[validate(nested)]
    pub profile: ProfileConfig,
}

impl ScenarioConfig {
    /// Load from a TOML file with `BATT_` environment overrides layered on
    /// top (nested keys split on `__`, e.g. `BATT_TIME__DT_HOUR=0.5`).
    pub fn load(path: &Path) -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("BATT_").split("__"));
        Self::from_figment(figment)
            .with_context(|| format!("failed to load scenario from {}", path.display()))
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().context("malformed scenario")?;
        config.validate().context("scenario out of range")?;
        Ok(config)
    }

    /// Convert into the validated core parameter bundles.
    pub fn into_parts(self) -> Result<ScenarioParts> {
        let time = TimeParams::new(self.time.dt_hour, self.time.years)?;
        let steps_per_hour = time.steps_per_hour;

        let battery = BatteryParams {
            capacity: self.capacity,
            voltage: self.voltage,
            thermal: self.thermal.into_params(steps_per_hour),
            lifetime: self.lifetime,
            losses: self.losses,
            replacement: self.replacement,
            time,
        };
        battery.validate()?;
        self.controller.validate()?;

        Ok(ScenarioParts {
            battery,
            controller: self.controller,
            inverter: self.inverter,
            profile: self.profile,
        })
    }
}

#[derive(Debug)]
pub struct ScenarioParts {
    pub battery: BatteryParams,
    pub controller: ControllerParams,
    pub inverter: Option<SharedInverterParams>,
    pub profile: ProfileConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"
        [time]
        dt_hour = 1.0
        years = 1

        [capacity]
        chemistry = "lithium_ion"
        qmax_nominal = 1000.0
        soc_init = 50.0
        soc_min = 5.0
        soc_max = 95.0

        [voltage]
        num_cells_series = 139
        num_strings = 9
        v_nom_default = 3.6
        resistance = 0.2

        [voltage.variant.model]
        v_full = 4.1
        v_exp = 4.05
        v_nom = 3.4
        q_full = 2.25
        q_exp = 0.04
        q_nom = 2.0
        c_rate = 0.2

        [thermal]
        mass_kg = 507.0
        length_m = 0.58
        width_m = 0.58
        height_m = 0.58
        resistance_ohm = 0.2
        cp_j_per_kg_k = 1004.0
        h_w_per_m2_k = 500.0
        cap_vs_temp_c = [[-10.0, 60.0], [0.0, 80.0], [25.0, 100.0], [45.0, 100.0]]
        ambient_temp_c = [20.0]

        [lifetime]
        cycle_matrix = [
            [20.0, 0.0, 100.0],
            [20.0, 5000.0, 80.0],
            [20.0, 10000.0, 60.0],
            [80.0, 0.0, 100.0],
            [80.0, 1000.0, 80.0],
            [80.0, 2000.0, 60.0],
        ]

        [lifetime.calendar.model]
        q0 = 1.02
        a = 0.00266
        b = -7280.0
        c = 930.0

        [losses.monthly]
        charging_kw = [0.1]
        discharging_kw = [0.1]
        idle_kw = [0.0]

        [controller]
        connection = "ac_coupled"
        limits = "restrict_power"
        current_charge_max_a = 100.0
        current_discharge_max_a = 100.0
        power_charge_max_kwdc = 12.0
        power_discharge_max_kwdc = 12.0
        power_charge_max_kwac = 12.0
        power_discharge_max_kwac = 12.0
        minimum_modetime_min = 10.0
        ac_dc_efficiency_pct = 96.0
        dc_ac_efficiency_pct = 96.0
        dc_dc_bms_efficiency_pct = 98.0
        inverter_efficiency_cutoff_pct = 5.0
    "#;

    fn parse(toml: &str) -> Result<ScenarioConfig> {
        ScenarioConfig::from_figment(Figment::new().merge(Toml::string(toml)))
    }

    #[test]
    fn scenario_round_trips_into_core_params() {
        let parts = parse(SCENARIO).unwrap().into_parts().unwrap();

        assert_eq!(parts.battery.time.steps_per_hour, 1);
        // Celsius converted at the boundary
        assert!((parts.battery.thermal.t_room_k[0] - 293.15).abs() < 1e-9);
        assert!((parts.battery.thermal.cap_vs_temp[0][0] - 263.15).abs() < 1e-9);
        assert!(matches!(
            parts.battery.replacement,
            ReplacementPolicy::None
        ));
    }

    #[test]
    fn out_of_range_values_are_rejected_by_the_surface_checks() {
        let broken = SCENARIO.replace("mass_kg = 507.0", "mass_kg = -1.0");
        assert!(parse(&broken).is_err());
    }

    #[test]
    fn invalid_shapes_name_the_offending_field() {
        let broken = SCENARIO.replace("qmax_nominal = 1000.0", "qmax_nominal = -1.0");
        let err = parse(&broken).unwrap().into_parts().unwrap_err();
        assert!(err.to_string().contains("qmax_nominal"));
    }
}
