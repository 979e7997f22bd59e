use serde::{Deserialize, Serialize};

/// Full decomposition of the step's energy flows.
///
/// Sign conventions: grid positive = export, battery positive = discharge,
/// PV positive = generating. Edge flows (`*_to_*`) are magnitudes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerFlowState {
    pub power_pv_kw: f64,
    pub power_pv_through_shared_inverter_kw: f64,
    pub power_pv_clipped_kw: f64,
    pub power_load_kw: f64,
    pub power_fuel_cell_kw: f64,

    /// Battery power at the DC terminals.
    pub power_battery_dc_kw: f64,
    /// Battery power referred to the AC side.
    pub power_battery_ac_kw: f64,
    /// The dispatch target before constraint resolution.
    pub power_battery_target_kw: f64,

    pub power_grid_kw: f64,
    pub power_generated_by_system_kw: f64,

    pub power_pv_to_load_kw: f64,
    pub power_pv_to_battery_kw: f64,
    pub power_pv_to_grid_kw: f64,
    pub power_clipped_to_battery_kw: f64,
    pub power_grid_to_battery_kw: f64,
    pub power_grid_to_load_kw: f64,
    pub power_battery_to_load_kw: f64,
    pub power_battery_to_grid_kw: f64,
    pub power_fuel_cell_to_battery_kw: f64,
    pub power_fuel_cell_to_load_kw: f64,
    pub power_fuel_cell_to_grid_kw: f64,

    /// Standby draw of the PV inverter (negative, AC topology only).
    pub power_pv_inverter_draw_kw: f64,
    /// Parasitic storage-system loss this step.
    pub power_system_loss_kw: f64,
    /// Total power-electronics conversion loss this step.
    pub power_conversion_loss_kw: f64,

    pub voltage_system_v: f64,

    pub can_pv_charge: bool,
    pub can_clip_charge: bool,
    pub can_grid_charge: bool,
    pub can_fuel_cell_charge: bool,
    pub can_discharge: bool,
}

impl PowerFlowState {
    /// Generation balance at the AC boundary, up to the loss decomposition.
    pub fn verify_generation_balance(&self, tolerance_kw: f64) -> bool {
        let expected = self.power_pv_kw + self.power_fuel_cell_kw + self.power_battery_ac_kw
            + self.power_pv_inverter_draw_kw
            - self.power_system_loss_kw;
        (self.power_generated_by_system_kw - expected).abs() <= tolerance_kw
    }

    /// Everything serving the load must add up to the load.
    pub fn verify_load_balance(&self, tolerance_kw: f64) -> bool {
        let served = self.power_pv_to_load_kw
            + self.power_grid_to_load_kw
            + self.power_battery_to_load_kw
            + self.power_fuel_cell_to_load_kw;
        (served - self.power_load_kw).abs() <= tolerance_kw
    }
}
