//! Dispatch metrics.
//!
//! Accumulates the energy bookkeeping of resolved steps: how much went into
//! and out of the battery, where charging energy came from, what the grid saw,
//! and the resulting conversion and round-trip efficiencies. Annual figures
//! reset at year boundaries; accumulated figures never do.

use serde::{Deserialize, Serialize};

use crate::power_flow::PowerFlowState;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchMetrics {
    dt_hour: f64,

    // whole-simulation accumulators [kWh]
    e_charge_accumulated: f64,
    e_charge_from_pv: f64,
    e_charge_from_grid: f64,
    e_discharge_accumulated: f64,
    e_loss_system: f64,

    // derived figures [%]
    average_efficiency: f64,
    average_roundtrip_efficiency: f64,
    pv_charge_percent: f64,

    // annual accumulators [kWh]
    e_charge_annual: f64,
    e_charge_from_pv_annual: f64,
    e_charge_from_grid_annual: f64,
    e_discharge_annual: f64,
    e_grid_import_annual: f64,
    e_grid_export_annual: f64,
    e_loss_system_annual: f64,
    e_loss_annual: f64,
}

impl DispatchMetrics {
    pub fn new(dt_hour: f64) -> Self {
        Self {
            dt_hour,
            average_efficiency: 100.0,
            average_roundtrip_efficiency: 100.0,
            ..Default::default()
        }
    }

    /// Fold one resolved step's AC power flow into the accumulators.
    pub fn accumulate_step(&mut self, flow: &PowerFlowState) {
        self.accumulate_grid(flow.power_grid_kw);
        self.accumulate_battery_charge_components(
            flow.power_battery_ac_kw,
            flow.power_pv_to_battery_kw,
            flow.power_grid_to_battery_kw,
        );
        self.accumulate_energy_charge(flow.power_battery_ac_kw);
        self.accumulate_energy_discharge(flow.power_battery_ac_kw);
        self.accumulate_system_loss(flow.power_system_loss_kw);
        self.compute_annual_loss();
    }

    /// Reset the per-year figures at a year boundary.
    pub fn new_year(&mut self) {
        self.e_charge_from_pv_annual = 0.0;
        self.e_charge_from_grid_annual = 0.0;
        self.e_charge_annual = 0.0;
        self.e_discharge_annual = 0.0;
        self.e_grid_import_annual = 0.0;
        self.e_grid_export_annual = 0.0;
        self.e_loss_system_annual = 0.0;
    }

    fn accumulate_grid(&mut self, power_grid_kw: f64) {
        // grid positive = export
        if power_grid_kw > 0.0 {
            self.e_grid_export_annual += power_grid_kw * self.dt_hour;
        } else {
            self.e_grid_import_annual += -power_grid_kw * self.dt_hour;
        }
    }

    fn accumulate_energy_charge(&mut self, power_battery_ac_kw: f64) {
        if power_battery_ac_kw < 0.0 {
            self.e_charge_accumulated += -power_battery_ac_kw * self.dt_hour;
            self.e_charge_annual += -power_battery_ac_kw * self.dt_hour;
        }
    }

    fn accumulate_energy_discharge(&mut self, power_battery_ac_kw: f64) {
        if power_battery_ac_kw > 0.0 {
            self.e_discharge_accumulated += power_battery_ac_kw * self.dt_hour;
            self.e_discharge_annual += power_battery_ac_kw * self.dt_hour;
        }
    }

    fn accumulate_system_loss(&mut self, power_system_loss_kw: f64) {
        self.e_loss_system += power_system_loss_kw * self.dt_hour;
        self.e_loss_system_annual += power_system_loss_kw * self.dt_hour;
    }

    fn accumulate_battery_charge_components(
        &mut self,
        power_battery_ac_kw: f64,
        pv_to_battery_kw: f64,
        grid_to_battery_kw: f64,
    ) {
        if power_battery_ac_kw < 0.0 {
            self.e_charge_from_pv += pv_to_battery_kw * self.dt_hour;
            self.e_charge_from_pv_annual += pv_to_battery_kw * self.dt_hour;
            self.e_charge_from_grid += grid_to_battery_kw * self.dt_hour;
            self.e_charge_from_grid_annual += grid_to_battery_kw * self.dt_hour;
        }
        if self.e_charge_accumulated == 0.0 {
            self.average_efficiency = 0.0;
            self.average_roundtrip_efficiency = 0.0;
            self.pv_charge_percent = 0.0;
        } else {
            self.average_efficiency =
                100.0 * (self.e_discharge_accumulated / self.e_charge_accumulated);
            self.average_roundtrip_efficiency = 100.0
                * (self.e_discharge_accumulated / (self.e_charge_accumulated + self.e_loss_system));
            self.pv_charge_percent = 100.0 * (self.e_charge_from_pv / self.e_charge_accumulated);
        }
    }

    fn compute_annual_loss(&mut self) {
        let conversion = (self.e_charge_annual - self.e_discharge_annual).max(0.0);
        self.e_loss_annual = conversion + self.e_loss_system_annual;
    }

    pub fn average_conversion_efficiency(&self) -> f64 {
        self.average_efficiency
    }

    pub fn average_roundtrip_efficiency(&self) -> f64 {
        self.average_roundtrip_efficiency
    }

    pub fn pv_charge_percent(&self) -> f64 {
        self.pv_charge_percent
    }

    pub fn energy_charge_annual_kwh(&self) -> f64 {
        self.e_charge_annual
    }

    pub fn energy_discharge_annual_kwh(&self) -> f64 {
        self.e_discharge_annual
    }

    pub fn energy_pv_charge_annual_kwh(&self) -> f64 {
        self.e_charge_from_pv_annual
    }

    pub fn energy_grid_charge_annual_kwh(&self) -> f64 {
        self.e_charge_from_grid_annual
    }

    pub fn energy_grid_import_annual_kwh(&self) -> f64 {
        self.e_grid_import_annual
    }

    pub fn energy_grid_export_annual_kwh(&self) -> f64 {
        self.e_grid_export_annual
    }

    pub fn energy_loss_annual_kwh(&self) -> f64 {
        self.e_loss_annual
    }

    pub fn energy_system_loss_annual_kwh(&self) -> f64 {
        self.e_loss_system_annual
    }

    pub fn energy_charge_total_kwh(&self) -> f64 {
        self.e_charge_accumulated
    }

    pub fn energy_discharge_total_kwh(&self) -> f64 {
        self.e_discharge_accumulated
    }
}
