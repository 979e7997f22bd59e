//! Terminal-voltage models.
//!
//! All variants track one cell's closed-circuit voltage and scale to the pack
//! through the series count. Per-cell quantities divide the pack current and
//! charge by the number of parallel strings. During discharge the cell voltage
//! is never allowed to rise within a step; a computed increase retains the
//! previous value.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::battery::capacity::CapacityState;
use crate::error::StorageError;
use crate::params::{Chemistry, VoltageParams, VoltageVariant};
use crate::utils::{interpolate, TOLERANCE};

/// Shepard-Tremblay dynamic model (Tremblay 2009), fit at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicVoltage {
    cell_voltage: f64,
    v_full: f64,
    v_nom: f64,
    resistance: f64,
    /// Exponential-zone amplitude [V].
    a: f64,
    /// Exponential-zone inverse time constant [1/Ah].
    b0: f64,
    /// Polarization voltage [V].
    k_pol: f64,
    /// Open-circuit constant [V].
    e0: f64,
}

impl DynamicVoltage {
    fn new(params: &VoltageParams) -> Result<Self, StorageError> {
        let VoltageVariant::Model {
            v_full,
            v_exp,
            v_nom,
            q_full,
            q_exp,
            q_nom,
            c_rate,
        } = params.variant
        else {
            return Err(StorageError::invalid(
                "voltage.variant",
                "dynamic voltage model requires the model parameter set",
            ));
        };

        let i_ref = q_full * c_rate;
        let a = v_full - v_exp;
        let b0 = 3.0 / q_exp;
        let k_pol = ((v_full - v_nom + a * ((-b0 * q_nom).exp() - 1.0)) * (q_full - q_nom)) / q_nom;
        let e0 = v_full + k_pol + params.resistance * i_ref - a;

        Ok(Self {
            // starts fully charged, not at nominal
            cell_voltage: v_full,
            v_full,
            v_nom,
            resistance: params.resistance,
            a,
            b0,
            k_pol,
            e0,
        })
    }

    fn cell_model(&self, q: f64, current: f64, q0: f64) -> f64 {
        let it = q - q0;
        let e = self.e0 - self.k_pol * (q / (q - it)) + self.a * (-self.b0 * it).exp();
        let v = e - self.resistance * current;

        // discharged below what the model can represent (< 1% SOC)
        if v < 0.0 || !v.is_finite() {
            0.5 * self.v_nom
        } else if v > self.v_full * 1.25 {
            self.v_full
        } else {
            v
        }
    }

    fn update(&mut self, capacity: &CapacityState, num_strings: f64) {
        let cell = self.cell_model(
            capacity.qmax / num_strings,
            capacity.current / num_strings,
            capacity.q0 / num_strings,
        );
        if capacity.current <= 0.0 || cell <= self.cell_voltage {
            self.cell_voltage = cell;
        }
    }
}

/// Nernst stack model for the vanadium redox flow chemistry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VanadiumVoltage {
    cell_voltage: f64,
    v_nom_default: f64,
    resistance: f64,
}

impl VanadiumVoltage {
    /// Molar gas constant [J/mol/K].
    const R_MOLAR: f64 = 8.314;
    /// Faraday constant [As/mol].
    const FARADAY: f64 = 26.801 * 3600.0;
    /// Model correction factor.
    const C0: f64 = 1.38;

    fn new(params: &VoltageParams) -> Self {
        Self {
            cell_voltage: params.v_nom_default,
            v_nom_default: params.v_nom_default,
            resistance: params.resistance,
        }
    }

    fn cell_model(&self, qmax: f64, q0: f64, current: f64, t_battery_k: f64) -> f64 {
        let soc = (q0 / qmax).min(1.0 - TOLERANCE);
        let log_term = (soc.powi(2) / (1.0 - soc).powi(2)).ln();
        if !log_term.is_finite() {
            return 0.0;
        }
        let stack = self.v_nom_default
            + (Self::R_MOLAR * t_battery_k / Self::FARADAY) * log_term * Self::C0;
        stack - current * self.resistance
    }

    fn update(&mut self, capacity: &CapacityState, t_battery_k: f64, num_strings: f64) {
        let cell = self.cell_model(
            capacity.qmax / num_strings,
            capacity.q0 / num_strings,
            capacity.current / num_strings,
            t_battery_k,
        );
        if capacity.current <= 0.0 || cell <= self.cell_voltage {
            self.cell_voltage = cell;
        }
    }
}

/// DOD-to-voltage lookup table, sorted by DOD at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableVoltage {
    cell_voltage: f64,
    resistance: f64,
    rows: Vec<[f64; 2]>,
}

impl TableVoltage {
    fn new(params: &VoltageParams) -> Result<Self, StorageError> {
        let VoltageVariant::Table { rows } = &params.variant else {
            return Err(StorageError::invalid(
                "voltage.variant",
                "table voltage model requires a DOD-voltage table",
            ));
        };
        let mut rows = rows.clone();
        rows.sort_by_key(|row| OrderedFloat(row[0]));
        Ok(Self {
            cell_voltage: params.v_nom_default,
            resistance: params.resistance,
            rows,
        })
    }

    fn update(&mut self, capacity: &CapacityState, num_strings: f64) {
        let dod = capacity.dod;
        let i_string = capacity.current / num_strings;

        let cell = if let Some(row) = self.rows.iter().find(|row| row[0] == dod) {
            row[1]
        } else {
            let (lo, hi) = self.bracket(dod);
            interpolate(lo[0], lo[1], hi[0], hi[1], dod) - i_string * self.resistance
        };

        if i_string <= 0.0 || cell <= self.cell_voltage {
            self.cell_voltage = cell;
        }
    }

    fn bracket(&self, dod: f64) -> ([f64; 2], [f64; 2]) {
        let n = self.rows.len();
        let mut lo = self.rows[0];
        let mut hi = self.rows[n - 1];
        for &row in &self.rows {
            if row[0] <= dod {
                lo = row;
            }
            if row[0] >= dod {
                hi = row;
                break;
            }
        }
        (lo, hi)
    }
}

/// Chemistry- and variant-dispatched voltage model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum VoltageModel {
    Dynamic(DynamicVoltage),
    Vanadium(VanadiumVoltage),
    Table(TableVoltage),
}

impl VoltageModel {
    pub fn new(chemistry: Chemistry, params: &VoltageParams) -> Result<Self, StorageError> {
        match (&params.variant, chemistry) {
            (VoltageVariant::Table { .. }, _) => Ok(Self::Table(TableVoltage::new(params)?)),
            (VoltageVariant::Model { .. }, Chemistry::VanadiumRedox) => {
                Ok(Self::Vanadium(VanadiumVoltage::new(params)))
            }
            (VoltageVariant::Model { .. }, _) => Ok(Self::Dynamic(DynamicVoltage::new(params)?)),
        }
    }

    pub fn update(&mut self, capacity: &CapacityState, t_battery_k: f64, params: &VoltageParams) {
        let num_strings = params.num_strings as f64;
        match self {
            Self::Dynamic(model) => model.update(capacity, num_strings),
            Self::Vanadium(model) => model.update(capacity, t_battery_k, num_strings),
            Self::Table(model) => model.update(capacity, num_strings),
        }
    }

    pub fn cell_voltage(&self) -> f64 {
        match self {
            Self::Dynamic(model) => model.cell_voltage,
            Self::Vanadium(model) => model.cell_voltage,
            Self::Table(model) => model.cell_voltage,
        }
    }

    pub fn set_pack_voltage(&mut self, pack_voltage: f64, params: &VoltageParams) {
        let cell = pack_voltage / params.num_cells_series as f64;
        match self {
            Self::Dynamic(model) => model.cell_voltage = cell,
            Self::Vanadium(model) => model.cell_voltage = cell,
            Self::Table(model) => model.cell_voltage = cell,
        }
    }

    pub fn pack_voltage(&self, params: &VoltageParams) -> f64 {
        params.num_cells_series as f64 * self.cell_voltage()
    }

    pub fn pack_voltage_nominal(&self, params: &VoltageParams) -> f64 {
        params.num_cells_series as f64 * params.v_nom_default
    }

    pub fn pack_resistance(&self, params: &VoltageParams) -> f64 {
        params.resistance * params.num_cells_series as f64 / params.num_strings as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battery::capacity::CapacityModel;
    use crate::params::CapacityParams;
    use approx::assert_abs_diff_eq;

    const TOL: f64 = 0.01;

    fn cap_params(qmax: f64, soc_init: f64, soc_min: f64, soc_max: f64) -> CapacityParams {
        CapacityParams {
            chemistry: Chemistry::LithiumIon,
            qmax_nominal: qmax,
            soc_init,
            soc_min,
            soc_max,
            lead_acid: None,
        }
    }

    fn dynamic_params() -> VoltageParams {
        VoltageParams {
            num_cells_series: 139,
            num_strings: 9,
            v_nom_default: 3.6,
            resistance: 0.2,
            variant: VoltageVariant::Model {
                v_full: 4.1,
                v_exp: 4.05,
                v_nom: 3.4,
                q_full: 2.25,
                q_exp: 0.04,
                q_nom: 2.0,
                c_rate: 0.2,
            },
        }
    }

    fn vanadium_params() -> VoltageParams {
        VoltageParams {
            num_cells_series: 139,
            num_strings: 9,
            v_nom_default: 3.6,
            resistance: 0.2,
            variant: VoltageVariant::Model {
                v_full: 4.1,
                v_exp: 4.05,
                v_nom: 3.4,
                q_full: 2.25,
                q_exp: 0.04,
                q_nom: 2.0,
                c_rate: 0.2,
            },
        }
    }

    fn table_params() -> VoltageParams {
        VoltageParams {
            num_cells_series: 139,
            num_strings: 9,
            v_nom_default: 3.6,
            resistance: 0.2,
            variant: VoltageVariant::Table {
                rows: vec![[75.0, 1.5], [25.0, 3.5]],
            },
        }
    }

    #[test]
    fn dynamic_model_starts_full() {
        let params = dynamic_params();
        let model = VoltageModel::new(Chemistry::LithiumIon, &params).unwrap();
        assert_eq!(model.cell_voltage(), 4.1);
    }

    #[test]
    fn dynamic_model_tracks_discharge_and_charge() {
        let vparams = dynamic_params();
        let cparams = cap_params(10.0, 50.0, 5.0, 95.0);
        let mut cap = CapacityModel::new(&cparams).unwrap();
        let mut model = VoltageModel::new(Chemistry::LithiumIon, &vparams).unwrap();

        let mut i = 2.0;
        cap.update_for_current(&mut i, &cparams, 1.0); // q0 = 3
        model.update(cap.state(), 293.15, &vparams);
        assert_abs_diff_eq!(model.cell_voltage(), 3.9, epsilon = TOL);

        let mut i = -2.0;
        cap.update_for_current(&mut i, &cparams, 1.0); // q0 = 5
        model.update(cap.state(), 293.15, &vparams);
        assert_abs_diff_eq!(model.cell_voltage(), 4.1, epsilon = TOL);

        let mut i = 5.0;
        cap.update_for_current(&mut i, &cparams, 1.0); // clamped to 4.5 A, q0 = 0.5
        model.update(cap.state(), 293.15, &vparams);
        assert_abs_diff_eq!(model.cell_voltage(), 2.49, epsilon = TOL);
    }

    #[test]
    fn dynamic_model_matches_nimh_discharge_curve() {
        // Figure 3 of Tremblay 2009, 6.5 Ah NiMH cell at 1C
        let vparams = VoltageParams {
            num_cells_series: 1,
            num_strings: 1,
            v_nom_default: 1.2,
            resistance: 0.0046,
            variant: VoltageVariant::Model {
                v_full: 1.4,
                v_exp: 1.25,
                v_nom: 1.2,
                q_full: 6.5,
                q_exp: 1.3,
                q_nom: 5.2,
                c_rate: 0.2,
            },
        };
        let cparams = cap_params(6.5, 100.0, 0.0, 100.0);
        let mut cap = CapacityModel::new(&cparams).unwrap();
        let mut model = VoltageModel::new(Chemistry::LithiumIon, &vparams).unwrap();

        let steps: [(f64, f64); 3] = [(1.0 / 6.0, 1.25), (1.0 / 3.0, 1.22), (1.0 / 3.0, 1.17)];
        for (dt_hour, expected) in steps {
            let mut i = 6.5;
            cap.update_for_current(&mut i, &cparams, dt_hour);
            model.update(cap.state(), 293.15, &vparams);
            assert_abs_diff_eq!(model.pack_voltage(&vparams), expected, epsilon = 0.05);
        }
    }

    #[test]
    fn discharge_never_raises_cell_voltage() {
        let vparams = dynamic_params();
        let mut model = VoltageModel::new(Chemistry::LithiumIon, &vparams).unwrap();

        let mut low = CapacityState {
            q0: 3.0,
            qmax: 10.0,
            qmax_thermal: 10.0,
            current: 2.0,
            current_loss: 0.0,
            soc: 30.0,
            dod: 70.0,
            dod_prev: 50.0,
            charge_mode: crate::battery::capacity::ChargeMode::Discharge,
            prev_charge_mode: crate::battery::capacity::ChargeMode::Discharge,
            charge_mode_changed: false,
            kibam: Default::default(),
        };
        model.update(&low, 293.15, &vparams);
        let after_deep = model.cell_voltage();

        // same discharge current but a fuller battery: the higher model value
        // must be rejected while discharging
        low.q0 = 9.0;
        low.soc = 90.0;
        low.dod = 10.0;
        model.update(&low, 293.15, &vparams);
        assert_eq!(model.cell_voltage(), after_deep);
    }

    #[test]
    fn vanadium_tracks_state_of_charge() {
        let vparams = vanadium_params();
        let cparams = cap_params(10.0, 50.0, 5.0, 95.0);
        let mut cap = CapacityModel::new(&cparams).unwrap();
        let mut model = VoltageModel::new(Chemistry::VanadiumRedox, &vparams).unwrap();
        assert_eq!(model.cell_voltage(), 3.6);

        let mut i = 2.0;
        cap.update_for_current(&mut i, &cparams, 1.0); // q0 = 3, SOC 0.3
        model.update(cap.state(), 293.15, &vparams);
        assert_abs_diff_eq!(model.cell_voltage(), 3.4965, epsilon = TOL);

        let mut i = -2.0;
        cap.update_for_current(&mut i, &cparams, 1.0); // q0 = 5, SOC 0.5: log term vanishes
        model.update(cap.state(), 293.15, &vparams);
        assert_abs_diff_eq!(model.cell_voltage(), 3.6444, epsilon = TOL);

        let mut i = 5.0;
        cap.update_for_current(&mut i, &cparams, 1.0); // clamped to 4.5 A, SOC 0.05
        model.update(cap.state(), 293.15, &vparams);
        assert_abs_diff_eq!(model.cell_voltage(), 3.2947, epsilon = TOL);
    }

    #[test]
    fn table_model_interpolates_between_rows() {
        let vparams = table_params();
        let cparams = cap_params(10.0, 50.0, 5.0, 95.0);
        let mut cap = CapacityModel::new(&cparams).unwrap();
        let mut model = VoltageModel::new(Chemistry::LithiumIon, &vparams).unwrap();
        assert_eq!(model.cell_voltage(), 3.6);

        let mut i = 2.0;
        cap.update_for_current(&mut i, &cparams, 1.0); // DOD 70
        model.update(cap.state(), 293.15, &vparams);
        assert_abs_diff_eq!(model.cell_voltage(), 1.6556, epsilon = TOL);
    }

    #[test]
    fn table_model_returns_exact_rows_without_ir_drop() {
        let vparams = VoltageParams {
            num_cells_series: 1,
            num_strings: 1,
            v_nom_default: 2.0,
            resistance: 0.5,
            variant: VoltageVariant::Table {
                rows: vec![[0.0, 2.2], [50.0, 2.0], [100.0, 1.6]],
            },
        };
        let mut model = VoltageModel::new(Chemistry::LeadAcid, &vparams).unwrap();
        let state = CapacityState {
            q0: 5.0,
            qmax: 10.0,
            qmax_thermal: 10.0,
            current: 1.0,
            current_loss: 0.0,
            soc: 50.0,
            dod: 50.0,
            dod_prev: 0.0,
            charge_mode: crate::battery::capacity::ChargeMode::Discharge,
            prev_charge_mode: crate::battery::capacity::ChargeMode::Discharge,
            charge_mode_changed: false,
            kibam: Default::default(),
        };
        model.update(&state, 293.15, &vparams);
        assert_abs_diff_eq!(model.cell_voltage(), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn pack_quantities_scale_with_topology() {
        let vparams = dynamic_params();
        let model = VoltageModel::new(Chemistry::LithiumIon, &vparams).unwrap();
        assert_abs_diff_eq!(model.pack_voltage_nominal(&vparams), 139.0 * 3.6, epsilon = 1e-9);
        assert_abs_diff_eq!(model.pack_resistance(&vparams), 0.2 * 139.0 / 9.0, epsilon = 1e-9);
    }
}
