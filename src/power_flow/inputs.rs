use serde::{Deserialize, Serialize};

/// Which sources the dispatch allows to charge the battery this step, and
/// whether discharge is allowed at all.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChargePermissions {
    pub pv_charge: bool,
    pub clip_charge: bool,
    pub grid_charge: bool,
    pub fuel_cell_charge: bool,
    pub discharge: bool,
}

impl Default for ChargePermissions {
    fn default() -> Self {
        Self {
            pv_charge: true,
            clip_charge: true,
            grid_charge: false,
            fuel_cell_charge: true,
            discharge: true,
        }
    }
}

/// Per-step boundary conditions handed over by the dispatch layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInputs {
    /// PV production (kW, positive = generating).
    pub pv_kw: f64,

    /// Site load (kW, always positive).
    pub load_kw: f64,

    /// Fuel cell output (kW).
    pub fuel_cell_kw: f64,

    /// PV power clipped by the inverter (kW), available for clip charging.
    pub pv_clipped_kw: f64,

    /// DC bus voltage reported by the PV system (V); zero or negative falls
    /// back to the shared inverter's nominal DC voltage.
    pub voltage_system_v: f64,

    /// Ambient dry-bulb temperature (K), used for the shared inverter derate.
    pub ambient_temp_k: f64,

    pub permissions: ChargePermissions,
}

impl StepInputs {
    pub fn new(pv_kw: f64, load_kw: f64, ambient_temp_k: f64) -> Self {
        Self {
            pv_kw,
            load_kw,
            fuel_cell_kw: 0.0,
            pv_clipped_kw: 0.0,
            voltage_system_v: 0.0,
            ambient_temp_k,
            permissions: ChargePermissions::default(),
        }
    }

    pub fn with_permissions(mut self, permissions: ChargePermissions) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_fuel_cell(mut self, fuel_cell_kw: f64) -> Self {
        self.fuel_cell_kw = fuel_cell_kw;
        self
    }
}
