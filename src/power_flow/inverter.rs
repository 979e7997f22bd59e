//! Shared inverter for the DC-coupled topology.
//!
//! A single inverter processes the combined PV and battery DC power. It is
//! characterized by a part-load efficiency curve over the fraction of AC
//! nameplate, with a linear high-temperature derate. The last computed
//! operating point stays readable so the controller can test the efficiency
//! cutoff.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::StorageError;
use crate::utils::linterp_rows;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SharedInverterParams {
    /// Combined AC nameplate of all units [kW].
    #[validate(range(min = 0.001))]
    pub ac_nameplate_kw: f64,

    /// Nominal DC input voltage [V].
    #[validate(range(min = 0.001))]
    pub dc_nominal_voltage_v: f64,

    /// Rows of (DC power as a fraction of nameplate, efficiency %).
    pub partload_curve: Vec<[f64; 2]>,

    /// Efficiency lost per kelvin above the derate threshold [%/K].
    #[validate(range(min = 0.0))]
    pub temp_derate_pct_per_k: f64,

    /// Ambient temperature where the derate starts [K].
    pub temp_derate_start_k: f64,
}

impl SharedInverterParams {
    fn check(&self) -> Result<(), StorageError> {
        self.validate().map_err(|e| {
            StorageError::invalid("shared_inverter", e.to_string())
        })?;
        if self.partload_curve.len() < 2 {
            return Err(StorageError::invalid(
                "shared_inverter.partload_curve",
                format!("needs >= 2 rows, got {}", self.partload_curve.len()),
            ));
        }
        if self
            .partload_curve
            .iter()
            .any(|row| !(0.0..=100.0).contains(&row[1]))
        {
            return Err(StorageError::invalid(
                "shared_inverter.partload_curve",
                "efficiencies must be in [0, 100] %",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SharedInverter {
    params: SharedInverterParams,
    /// Efficiency at the last computed operating point [%].
    pub efficiency_ac_pct: f64,
    /// AC power at the last computed operating point [kW].
    pub power_ac_kw: f64,
}

impl SharedInverter {
    pub fn new(params: SharedInverterParams) -> Result<Self, StorageError> {
        params.check()?;
        let max_efficiency = linterp_rows(&params.partload_curve, 1.0).clamp(0.0, 100.0);
        Ok(Self {
            params,
            efficiency_ac_pct: max_efficiency,
            power_ac_kw: 0.0,
        })
    }

    /// Evaluate the operating point for a DC power [kW] at the given ambient
    /// temperature. The sign convention of the result follows the input.
    pub fn calculate_ac_power(&mut self, power_dc_kw: f64, ambient_temp_k: f64) {
        let fraction = (power_dc_kw.abs() / self.params.ac_nameplate_kw).clamp(0.0, 1.5);
        let mut efficiency = linterp_rows(&self.params.partload_curve, fraction).clamp(0.0, 100.0);

        if ambient_temp_k > self.params.temp_derate_start_k {
            let derate =
                self.params.temp_derate_pct_per_k * (ambient_temp_k - self.params.temp_derate_start_k);
            efficiency = (efficiency - derate).max(0.0);
        }

        self.efficiency_ac_pct = efficiency;
        self.power_ac_kw = power_dc_kw * efficiency * 0.01;
    }

    /// Efficiency at nameplate power without disturbing the operating point.
    pub fn max_power_efficiency_pct(&self) -> f64 {
        linterp_rows(&self.params.partload_curve, 1.0).clamp(0.0, 100.0)
    }

    pub fn nameplate_ac_kw(&self) -> f64 {
        self.params.ac_nameplate_kw
    }

    pub fn nominal_dc_voltage_v(&self) -> f64 {
        self.params.dc_nominal_voltage_v
    }
}
