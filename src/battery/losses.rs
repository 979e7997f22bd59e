//! Per-step parasitic losses [kW].

use crate::battery::capacity::ChargeMode;
use crate::params::{LossParams, TimeParams};
use crate::utils::month_of_hour;

/// Loss drawn by the storage system at the given year-one step.
pub fn loss_kw(
    params: &LossParams,
    time: &TimeParams,
    year_one_index: usize,
    charge_mode: ChargeMode,
) -> f64 {
    match params {
        LossParams::Monthly {
            charging_kw,
            discharging_kw,
            idle_kw,
        } => {
            let hour_of_year = (year_one_index as f64 * time.dt_hour).floor() as usize;
            let month_index = month_of_hour(hour_of_year) - 1;
            let values = match charge_mode {
                ChargeMode::Charge => charging_kw,
                ChargeMode::Discharge => discharging_kw,
                ChargeMode::NoCharge => idle_kw,
            };
            // a single entry is broadcast across all months
            if values.len() == 1 {
                values[0]
            } else {
                values.get(month_index).copied().unwrap_or(0.0)
            }
        }
        LossParams::Timeseries { series_kw } => {
            series_kw.get(year_one_index).copied().unwrap_or(0.0)
        }
    }
}
