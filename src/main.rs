//! Scenario runner: simulates one or more years of self-consumption dispatch
//! against a configured battery and prints the resulting metrics.
//!
//! The dispatch here is deliberately simple (PV surplus charges, load deficit
//! discharges); real deployments drive the controller from their own strategy
//! layer and only use this binary to sanity-check a parameter set.

use std::f64::consts::PI;
use std::path::PathBuf;

use anyhow::Result;
use tracing::{info, warn};

use battery_storage_sim::config::{ProfileConfig, ScenarioConfig};
use battery_storage_sim::telemetry::init_tracing;
use battery_storage_sim::{
    Battery, ChargeController, SharedInverter, StepClock, StepInputs,
};
use battery_storage_sim::utils::month_of_hour;

fn main() -> Result<()> {
    init_tracing();

    let path = std::env::var_os("BATT_SCENARIO")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("scenario.toml"));
    let parts = ScenarioConfig::load(&path)?.into_parts()?;

    let years = parts.battery.time.years;
    let steps_per_hour = parts.battery.time.steps_per_hour;
    let dt_hour = parts.battery.time.dt_hour;

    let battery = Battery::new(parts.battery)?;
    let inverter = parts.inverter.map(SharedInverter::new).transpose()?;
    let mut controller = ChargeController::new(battery, parts.controller, inverter)?;

    info!(scenario = %path.display(), years, steps_per_hour, "starting battery storage simulation");

    let ambient_temp_k = parts.profile.ambient_temp_c + 273.15;
    let mut clock = StepClock::new(steps_per_hour);
    let mut month_energy_kwh = 0.0;
    let mut current_month = 1;

    let total_steps = years * 8760 * steps_per_hour;
    for _ in 0..total_steps {
        let hour_of_day = (clock.hour_of_year() % 24) as f64 + clock.step_of_hour() as f64 * dt_hour;
        let pv_kw = pv_profile_kw(&parts.profile, clock.hour_of_year(), hour_of_day);
        let load_kw = load_profile_kw(&parts.profile, hour_of_day);

        // self-consumption: discharge into the deficit, charge from surplus
        let target_kw = load_kw - pv_kw;

        let inputs = StepInputs::new(pv_kw, load_kw, ambient_temp_k);
        let realized = controller.run_dispatch(&clock, target_kw, &inputs);
        month_energy_kwh += realized.abs() * dt_hour;

        for message in controller.battery_mut().drain_messages() {
            warn!(step = clock.lifetime_index(), "{message}");
        }

        let month = month_of_hour(clock.hour_of_year());
        if month != current_month {
            info!(
                month = current_month,
                year = clock.year(),
                battery_throughput_kwh = format_args!("{month_energy_kwh:.1}"),
                soc = format_args!("{:.1}", controller.battery().soc()),
                capacity_percent = format_args!("{:.2}", controller.battery().capacity_percent()),
                "month complete"
            );
            current_month = month;
            month_energy_kwh = 0.0;
        }
        if clock.hour_of_year() == 0 && clock.step_of_hour() == 0 && clock.year() > 0 {
            controller.metrics_mut().new_year();
        }

        clock.advance_one_step();
    }

    let metrics = controller.metrics();
    let battery = controller.battery();
    info!(
        charge_kwh = format_args!("{:.1}", metrics.energy_charge_total_kwh()),
        discharge_kwh = format_args!("{:.1}", metrics.energy_discharge_total_kwh()),
        roundtrip_efficiency = format_args!("{:.2}", metrics.average_roundtrip_efficiency()),
        pv_charge_percent = format_args!("{:.1}", metrics.pv_charge_percent()),
        cycles = battery.cycles_elapsed(),
        capacity_percent = format_args!("{:.2}", battery.capacity_percent()),
        replacements = battery.replacements(),
        "simulation complete"
    );

    Ok(())
}

/// Clear-sky-ish bell over daylight hours, scaled through the seasons.
fn pv_profile_kw(profile: &ProfileConfig, hour_of_year: usize, hour_of_day: f64) -> f64 {
    let day_of_year = (hour_of_year / 24) as f64;
    let seasonal = 0.6 + 0.4 * (2.0 * PI * (day_of_year - 172.0) / 365.0).cos();
    let daylight = (PI * (hour_of_day - 6.0) / 12.0).sin();
    if (6.0..18.0).contains(&hour_of_day) {
        profile.pv_peak_kw * seasonal * daylight.max(0.0)
    } else {
        0.0
    }
}

/// Flat base load with a morning bump and an evening peak.
fn load_profile_kw(profile: &ProfileConfig, hour_of_day: f64) -> f64 {
    let base = profile.load_base_kw;
    if (6.0..9.0).contains(&hour_of_day) {
        base + 0.4 * (profile.load_evening_kw - base)
    } else if (17.0..22.0).contains(&hour_of_day) {
        profile.load_evening_kw
    } else {
        base
    }
}
